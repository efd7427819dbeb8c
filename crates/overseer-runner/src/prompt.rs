//! Prompt assembly: role system section, retrieved knowledge, briefing, scopes

use overseer_core::{FileScope, Task};
use overseer_knowledge::{KnowledgeQuery, SearchOptions};
use overseer_store::Role;

/// The scope a task actually runs under: its own lists when present,
/// otherwise the role defaults.
pub fn effective_scope(task: &Task, role: Option<&Role>) -> FileScope {
    if !task.scope.is_empty() {
        return task.scope.clone();
    }
    role.map(|r| r.scope.clone()).unwrap_or_default()
}

/// Build the full prompt handed to the agent.
///
/// Section order: role system prompt, retrieved project knowledge, the
/// briefing body, then the file-scope contract.
pub async fn assemble_prompt(
    task: &Task,
    role: Option<&Role>,
    knowledge: &KnowledgeQuery,
    snippet_limit: usize,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(role) = role {
        sections.push(format!("## Role: {}\n\n{}", role.name, role.system_prompt));
    }

    let snippets = knowledge
        .semantic_search(
            &task.briefing,
            &SearchOptions::default().with_limit(snippet_limit),
        )
        .await;
    if !snippets.is_empty() {
        let body = snippets
            .iter()
            .map(|s| format!("### {}\n{}", s.title, s.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        sections.push(format!("## Project Knowledge\n\n{}", body));
    }

    sections.push(task.briefing.clone());

    let scope = effective_scope(task, role);
    if !scope.is_empty() {
        let mut lines = vec!["## File Scope".to_string()];
        if !scope.allow.is_empty() {
            lines.push("You may modify files matching:".to_string());
            for glob in &scope.allow {
                lines.push(format!("- {}", glob));
            }
        }
        if !scope.deny.is_empty() {
            lines.push("You must not touch files matching:".to_string());
            for glob in &scope.deny {
                lines.push(format!("- {}", glob));
            }
        }
        sections.push(lines.join("\n"));
    }

    sections.join("\n\n")
}
