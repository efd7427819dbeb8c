//! The retrieve-evolve-merge loop.
//!
//! One step: check sufficiency, generate subqueries (concern-driven after the
//! first pass), retrieve evidence, evolve the memory, merge related memory
//! points, advance the step counter. Model output that fails to parse is a
//! warning and a no-op for that stage — the loop never dies on bad JSON.

use crate::graph::Hypergraph;
use crate::session::{Session, SessionState, SubqueryRecord, DEFAULT_MAX_STEPS};
use crate::SessionStore;
use overseer_core::{Broadcaster, Error, Event, Result};
use overseer_knowledge::{KnowledgeQuery, SearchOptions, Snippet};
use overseer_llm::{json, CompletionRequest, LlmProvider};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SUFFICIENCY_SYSTEM: &str = "You judge whether a working memory already answers a target \
    query. Respond with ONLY JSON: {\"sufficient\": true|false, \"reason\": \"...\"}";

const CONCERNS_SYSTEM: &str = "You review a working memory against a target query and raise \
    concerns about what is missing or underspecified. Respond with ONLY JSON: \
    {\"concerns\": [{\"type\": \"local\"|\"global\", \"concern\": \"...\", \
    \"target_hyperedge_id\": \"optional memory point id\"}]}";

const SUBQUERIES_SYSTEM: &str = "You turn concerns about a working memory into concrete search \
    subqueries. Respond with ONLY JSON: {\"subqueries\": [{\"query\": \"...\", \
    \"strategy\": \"local\"|\"global\", \"target_hyperedge_id\": \"optional\"}]}";

const EVOLVE_SYSTEM: &str = "You evolve a hypergraph working memory from new evidence. You may \
    update descriptions of existing memory points and insert new ones over two or more named \
    entities. Respond with ONLY JSON: {\"updates\": [{\"hyperedge_id\": \"...\", \
    \"new_description\": \"...\"}], \"insertions\": [{\"description\": \"...\", \
    \"entity_names\": [\"...\", \"...\"]}]}";

const MERGE_SYSTEM: &str = "You consolidate a hypergraph working memory by merging pairs of \
    memory points that describe the same relation cluster. Respond with ONLY JSON: \
    {\"merges\": [{\"hyperedge_id_1\": \"...\", \"hyperedge_id_2\": \"...\", \
    \"merged_description\": \"...\"}]}. Merge conservatively; an empty list is fine.";

const SYNTHESIS_SYSTEM: &str = "You answer a target query from an accumulated working memory \
    and its source passages. Write a direct, well-structured prose answer.";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub model: String,
    pub max_steps: u32,
    pub result_cap: usize,
    pub similarity_floor: f32,
    pub max_source_chunks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            result_cap: 5,
            similarity_floor: 0.4,
            max_source_chunks: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    Continued { step: u32 },
    Done { response: String },
}

#[derive(Clone, Debug)]
struct Subquery {
    query: String,
    strategy: String,
    target_hyperedge_id: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub state: SessionState,
    pub step: u32,
    pub vertices: usize,
    pub hyperedges: usize,
    pub tokens_used: u64,
}

pub struct MemoryEngine {
    provider: Arc<dyn LlmProvider>,
    knowledge: KnowledgeQuery,
    sessions: Arc<SessionStore>,
    broadcaster: Arc<Broadcaster>,
    config: EngineConfig,
}

impl MemoryEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        knowledge: KnowledgeQuery,
        sessions: Arc<SessionStore>,
        broadcaster: Arc<Broadcaster>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            knowledge,
            sessions,
            broadcaster,
            config,
        }
    }

    pub async fn create_session(&self, query: &str, project: &str) -> Session {
        let session = self
            .sessions
            .create(Session::new(query, project, self.config.max_steps))
            .await;
        info!(session = %session.id, "hgmem session created");
        self.broadcaster.broadcast(Event::HgmemSessionCreated {
            session_id: session.id.clone(),
            query: query.to_string(),
        });
        session
    }

    pub async fn memory(&self, session_id: &str) -> Result<Hypergraph> {
        Ok(self.sessions.get(session_id).await?.1)
    }

    pub async fn stats(&self, session_id: &str) -> Result<SessionStats> {
        let (session, graph) = self.sessions.get(session_id).await?;
        Ok(SessionStats {
            session_id: session.id,
            state: session.state,
            step: session.step,
            vertices: graph.vertices.len(),
            hyperedges: graph.hyperedges.len(),
            tokens_used: session.tokens_used,
        })
    }

    /// Drive the session until synthesis.
    pub async fn run(&self, session_id: &str) -> Result<Session> {
        let max = self.config.max_steps + 2;
        for _ in 0..max {
            match self.step(session_id).await? {
                StepOutcome::Done { .. } => break,
                StepOutcome::Continued { .. } => {}
            }
        }
        Ok(self.sessions.get(session_id).await?.0)
    }

    /// One retrieve-evolve-merge pass; resolves to `Done` once the memory
    /// suffices or the step budget is spent.
    pub async fn step(&self, session_id: &str) -> Result<StepOutcome> {
        let (session, graph) = self.sessions.get(session_id).await?;
        if session.state != SessionState::Active {
            return Err(Error::conflict(format!(
                "session {} is not active",
                session_id
            )));
        }

        self.broadcaster.broadcast(Event::HgmemStepStart {
            session_id: session_id.to_string(),
            step: session.step,
        });
        let mut tokens = 0u64;

        // Sufficiency: never on the opening step, pointless on empty memory.
        if session.step > 0 && !graph.hyperedges.is_empty() {
            let user = format!(
                "Target query:\n{}\n\nCurrent memory:\n{}",
                session.query,
                graph.render_transcript()
            );
            if let Some(v) = self.ask_json(SUFFICIENCY_SYSTEM, user, &mut tokens).await {
                if v["sufficient"].as_bool() == Some(true) {
                    debug!(session = %session_id, "memory judged sufficient");
                    return self.synthesize(session_id, tokens).await;
                }
            }
        }

        if session.step >= session.max_steps {
            debug!(session = %session_id, "step budget exhausted");
            return self.synthesize(session_id, tokens).await;
        }

        let subqueries = self
            .generate_subqueries(&session, &graph, &mut tokens)
            .await;

        // Retrieve evidence for every subquery.
        let options = SearchOptions {
            limit: self.config.result_cap,
            threshold: self.config.similarity_floor,
            category: None,
        };
        let mut snippets: Vec<Snippet> = Vec::new();
        for subquery in &subqueries {
            for snippet in self.knowledge.semantic_search(&subquery.query, &options).await {
                if !snippets.iter().any(|s| s.content == snippet.content) {
                    snippets.push(snippet);
                }
            }
        }

        self.evolve(session_id, &session, &snippets, &mut tokens).await?;
        self.merge(session_id, &mut tokens).await?;

        let records: Vec<SubqueryRecord> = subqueries
            .iter()
            .map(|q| SubqueryRecord {
                step: session.step,
                query: q.query.clone(),
                strategy: q.strategy.clone(),
                target_hyperedge_id: q.target_hyperedge_id.clone(),
            })
            .collect();
        let next_step = self
            .sessions
            .update(session_id, |s, _| {
                s.step += 1;
                s.tokens_used += tokens;
                s.subquery_history.extend(records);
                s.step
            })
            .await?;

        self.broadcaster.broadcast(Event::HgmemStepEnd {
            session_id: session_id.to_string(),
            step: next_step,
        });
        Ok(StepOutcome::Continued { step: next_step })
    }

    /// Step 0 probes globally with the target itself; later steps raise
    /// concerns first and derive subqueries from them.
    async fn generate_subqueries(
        &self,
        session: &Session,
        graph: &Hypergraph,
        tokens: &mut u64,
    ) -> Vec<Subquery> {
        let global = vec![Subquery {
            query: session.query.clone(),
            strategy: "global".to_string(),
            target_hyperedge_id: None,
        }];
        if session.step == 0 {
            return global;
        }

        let transcript = graph.render_transcript();
        let concerns_user = format!(
            "Target query:\n{}\n\nCurrent memory:\n{}",
            session.query, transcript
        );
        let Some(concerns) = self.ask_json(CONCERNS_SYSTEM, concerns_user, tokens).await else {
            return global;
        };

        let subqueries_user = format!(
            "Target query:\n{}\n\nCurrent memory:\n{}\n\nConcerns:\n{}",
            session.query,
            transcript,
            serde_json::to_string_pretty(&concerns["concerns"]).unwrap_or_default()
        );
        let Some(parsed) = self.ask_json(SUBQUERIES_SYSTEM, subqueries_user, tokens).await else {
            return global;
        };

        let list: Vec<Subquery> = parsed["subqueries"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let query = item["query"].as_str()?.to_string();
                        Some(Subquery {
                            query,
                            strategy: item["strategy"].as_str().unwrap_or("global").to_string(),
                            target_hyperedge_id: item["target_hyperedge_id"]
                                .as_str()
                                .map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if list.is_empty() {
            global
        } else {
            list
        }
    }

    /// Apply model-directed updates and insertions from the evidence.
    async fn evolve(
        &self,
        session_id: &str,
        session: &Session,
        snippets: &[Snippet],
        tokens: &mut u64,
    ) -> Result<()> {
        if snippets.is_empty() {
            debug!(session = %session_id, "no evidence retrieved, evolve skipped");
            return Ok(());
        }
        let (_, graph) = self.sessions.get(session_id).await?;
        let evidence = snippets
            .iter()
            .map(|s| format!("- [{}] {}", s.title, s.content))
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "Target query:\n{}\n\nCurrent memory:\n{}\n\nNew evidence:\n{}",
            session.query,
            graph.render_transcript(),
            evidence
        );
        let Some(plan) = self.ask_json(EVOLVE_SYSTEM, user, tokens).await else {
            return Ok(());
        };

        let step = session.step;
        let chunks: Vec<String> = snippets.iter().map(|s| s.content.clone()).collect();
        self.sessions
            .update(session_id, |_, graph| {
                for update in plan["updates"].as_array().into_iter().flatten() {
                    let (Some(id), Some(desc)) = (
                        update["hyperedge_id"].as_str(),
                        update["new_description"].as_str(),
                    ) else {
                        continue;
                    };
                    if let Err(e) = graph.update_description(id, desc, step) {
                        warn!(session = %session_id, error = %e, "evolve update skipped");
                    }
                }
                for insertion in plan["insertions"].as_array().into_iter().flatten() {
                    let Some(desc) = insertion["description"].as_str() else {
                        continue;
                    };
                    let entities: Vec<String> = insertion["entity_names"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                    match graph.insert_hyperedge(desc, &entities, step) {
                        Ok(_) => {
                            // Attach the passages that mention each entity.
                            for name in &entities {
                                let Some(vertex_id) =
                                    graph.vertex_by_name(name).map(|v| v.id.clone())
                                else {
                                    continue;
                                };
                                let folded = name.to_lowercase();
                                for chunk in &chunks {
                                    if chunk.to_lowercase().contains(&folded) {
                                        graph.add_source(&vertex_id, chunk);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(session = %session_id, error = %e, "evolve insertion skipped")
                        }
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Ask for merges once at least two memory points exist; a hyperedge
    /// alone has nothing to merge with.
    async fn merge(&self, session_id: &str, tokens: &mut u64) -> Result<()> {
        let (session, graph) = self.sessions.get(session_id).await?;
        if graph.hyperedges.len() < 2 {
            return Ok(());
        }
        let user = format!("Current memory:\n{}", graph.render_transcript());
        let Some(plan) = self.ask_json(MERGE_SYSTEM, user, tokens).await else {
            return Ok(());
        };

        let step = session.step;
        self.sessions
            .update(session_id, |_, graph| {
                for merge in plan["merges"].as_array().into_iter().flatten() {
                    let (Some(first), Some(second), Some(desc)) = (
                        merge["hyperedge_id_1"].as_str(),
                        merge["hyperedge_id_2"].as_str(),
                        merge["merged_description"].as_str(),
                    ) else {
                        continue;
                    };
                    if let Err(e) = graph.merge(first, second, desc, step) {
                        warn!(session = %session_id, error = %e, "merge skipped");
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Render the memory and issue the final answer call.
    async fn synthesize(&self, session_id: &str, mut tokens: u64) -> Result<StepOutcome> {
        let (session, graph) = self.sessions.get(session_id).await?;
        let transcript = graph.render_transcript();
        let chunks = graph.source_chunks(self.config.max_source_chunks);
        let mut user = format!(
            "Target query:\n{}\n\nWorking memory:\n{}",
            session.query, transcript
        );
        if !chunks.is_empty() {
            user.push_str(&format!("\n\nSource passages:\n{}", chunks.join("\n---\n")));
        }

        let completion = self
            .provider
            .complete(
                CompletionRequest::one_shot(&self.config.model, SYNTHESIS_SYSTEM, user)
                    .with_max_tokens(4096),
            )
            .await;

        match completion {
            Ok(c) => {
                tokens += c.usage.total();
                let response = c.text.trim().to_string();
                self.sessions
                    .update(session_id, |s, _| {
                        s.state = SessionState::Completed;
                        s.response = Some(response.clone());
                        s.tokens_used += tokens;
                    })
                    .await?;
                info!(session = %session_id, "hgmem session completed");
                self.broadcaster.broadcast(Event::HgmemSessionCompleted {
                    session_id: session_id.to_string(),
                });
                Ok(StepOutcome::Done { response })
            }
            Err(e) => {
                let reason = format!("synthesis failed: {}", e);
                self.sessions
                    .update(session_id, |s, _| {
                        s.state = SessionState::Failed;
                        s.response = Some(reason.clone());
                        s.tokens_used += tokens;
                    })
                    .await?;
                Err(Error::external(reason))
            }
        }
    }

    /// One constrained-JSON model call. Failures degrade to `None` — the
    /// caller treats the stage as a no-op.
    async fn ask_json(&self, system: &str, user: String, tokens: &mut u64) -> Option<Value> {
        let completion = self
            .provider
            .complete(
                CompletionRequest::one_shot(&self.config.model, system, user).with_max_tokens(2048),
            )
            .await;
        let completion = match completion {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "hgmem llm call failed, stage skipped");
                return None;
            }
        };
        *tokens += completion.usage.total();

        let raw = json::extract(&completion.text)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(_) if completion.finish_reason.is_truncated() => {
                serde_json::from_str(&json::repair_truncated(&raw)).ok()
            }
            Err(e) => {
                warn!(error = %e, "hgmem json parse failed, stage skipped");
                None
            }
        }
    }
}
