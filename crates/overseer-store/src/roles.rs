//! Role registry: named personas attachable to tasks and DAG nodes.
//!
//! Built-in roles carry the system prompt and default file scopes; the
//! optional `settings.json` overlays display names and model mapping.

use crate::state::JsonState;
use overseer_core::FileScope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

pub const DEFAULT_ROLE: &str = "implementer";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Clone, Debug, Serialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    #[serde(skip)]
    pub system_prompt: String,
    pub default_model: Option<String>,
    pub scope: FileScope,
    /// Role policy may pin all of its tasks to one device.
    pub device_id: Option<String>,
}

/// Shape of `settings.json`: display/model overlays keyed by role ID.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Settings {
    #[serde(default)]
    roles: HashMap<String, RoleOverlay>,
    #[serde(default)]
    default_model: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RoleOverlay {
    name: Option<String>,
    model: Option<String>,
    device_id: Option<String>,
}

pub struct RoleRegistry {
    roles: Vec<Role>,
    default_model: String,
}

fn scope(allow: &[&str], deny: &[&str]) -> FileScope {
    FileScope {
        allow: allow.iter().map(|s| s.to_string()).collect(),
        deny: deny.iter().map(|s| s.to_string()).collect(),
    }
}

fn builtin_roles() -> Vec<Role> {
    vec![
        Role {
            id: "implementer".into(),
            name: "Implementer".into(),
            description: "Writes and modifies source code to satisfy a briefing".into(),
            capabilities: vec!["edit".into(), "test".into(), "refactor".into()],
            system_prompt: "You are an implementation agent. Make the smallest change that \
                            satisfies the briefing, keep the build green, and report what \
                            you changed and why."
                .into(),
            default_model: None,
            scope: scope(&["src/**", "tests/**", "**/*.md"], &["**/.env*", "**/secrets/**"]),
            device_id: None,
        },
        Role {
            id: "reviewer".into(),
            name: "Reviewer".into(),
            description: "Reads diffs and flags defects without modifying code".into(),
            capabilities: vec!["review".into(), "annotate".into()],
            system_prompt: "You are a code reviewer. Read the changes, verify them against \
                            the briefing, and list concrete defects with file and line. Do \
                            not modify files."
                .into(),
            default_model: None,
            scope: scope(&["**/*"], &["**/*"]),
            device_id: None,
        },
        Role {
            id: "researcher".into(),
            name: "Researcher".into(),
            description: "Gathers evidence from the codebase and documents findings".into(),
            capabilities: vec!["search".into(), "summarize".into()],
            system_prompt: "You are a research agent. Gather the facts the briefing asks \
                            for, cite the files they come from, and write a structured \
                            summary. Do not modify source files."
                .into(),
            default_model: None,
            scope: scope(&["docs/**", "notes/**"], &["src/**"]),
            device_id: None,
        },
        Role {
            id: "planner".into(),
            name: "Planner".into(),
            description: "Decomposes briefs into task graphs for other roles".into(),
            capabilities: vec!["plan".into(), "decompose".into()],
            system_prompt: "You are a planning agent. Break the brief into small, \
                            independently verifiable tasks with explicit dependencies."
                .into(),
            default_model: None,
            scope: scope(&[], &["**/*"]),
            device_id: None,
        },
    ]
}

impl RoleRegistry {
    /// Built-ins only, no overlay.
    pub fn builtin() -> Self {
        Self {
            roles: builtin_roles(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Built-ins with the `settings.json` overlay applied.
    pub fn load(settings_path: impl Into<PathBuf>) -> Self {
        let settings: Settings = JsonState::new(settings_path).load_or_default();
        let mut roles = builtin_roles();
        for role in roles.iter_mut() {
            if let Some(overlay) = settings.roles.get(&role.id) {
                if let Some(name) = &overlay.name {
                    role.name = name.clone();
                }
                if let Some(model) = &overlay.model {
                    role.default_model = Some(model.clone());
                }
                if let Some(device) = &overlay.device_id {
                    role.device_id = Some(device.clone());
                }
            }
        }
        let default_model = settings
            .default_model
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        info!(roles = roles.len(), model = %default_model, "role registry loaded");
        Self {
            roles,
            default_model,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn all(&self) -> &[Role] {
        &self.roles
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Model for a task: explicit hint, then role default, then global default.
    pub fn resolve_model(&self, role: Option<&str>, hint: Option<&str>) -> String {
        if let Some(hint) = hint {
            return hint.to_string();
        }
        role.and_then(|id| self.get(id))
            .and_then(|r| r.default_model.clone())
            .unwrap_or_else(|| self.default_model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_roles_present() {
        let reg = RoleRegistry::builtin();
        for id in ["implementer", "reviewer", "researcher", "planner"] {
            assert!(reg.exists(id), "missing builtin role {}", id);
        }
        assert!(!reg.exists("unknown"));
    }

    #[test]
    fn implementer_scope_denies_secrets() {
        let reg = RoleRegistry::builtin();
        let role = reg.get("implementer").unwrap();
        let d = overseer_core::scope_check("config/secrets/key.pem", &role.scope.allow, &role.scope.deny);
        assert!(!d.allowed);
    }

    #[test]
    fn overlay_applies_name_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "roles": {"implementer": {"name": "Builder", "model": "claude-opus-4-20250514"}},
                "default_model": "claude-haiku-4-20250514"
            }"#,
        )
        .unwrap();

        let reg = RoleRegistry::load(&path);
        let role = reg.get("implementer").unwrap();
        assert_eq!(role.name, "Builder");
        assert_eq!(role.default_model.as_deref(), Some("claude-opus-4-20250514"));
        assert_eq!(reg.default_model(), "claude-haiku-4-20250514");
    }

    #[test]
    fn model_resolution_order() {
        let reg = RoleRegistry::builtin();
        assert_eq!(reg.resolve_model(None, Some("explicit")), "explicit");
        assert_eq!(reg.resolve_model(Some("implementer"), None), DEFAULT_MODEL);
        assert_eq!(reg.resolve_model(None, None), DEFAULT_MODEL);
    }

    #[test]
    fn missing_settings_falls_back_to_builtin() {
        let reg = RoleRegistry::load("/nonexistent/settings.json");
        assert!(reg.exists("reviewer"));
        assert_eq!(reg.default_model(), DEFAULT_MODEL);
    }
}
