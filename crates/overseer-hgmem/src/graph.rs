//! The hypergraph working memory: entity vertices joined by memory points.
//!
//! Vertex names are unique under case-folded comparison. A hyperedge connects
//! two or more vertices; merging two hyperedges removes both and installs one
//! whose vertex set is their union.

use overseer_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vertex {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Source passages this entity was seen in.
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HyperedgeOrigin {
    Insertion,
    Merge,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperedge {
    pub id: String,
    pub description: String,
    pub vertex_ids: BTreeSet<String>,
    /// Count of connected vertices; recomputed on merge.
    pub order: usize,
    pub origin: HyperedgeOrigin,
    pub created_step: u32,
    pub updated_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_from: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Hypergraph {
    pub vertices: Vec<Vertex>,
    pub hyperedges: Vec<Hyperedge>,
}

fn case_fold(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Hypergraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex(&self, id: &str) -> Option<&Vertex> {
        self.vertices.iter().find(|v| v.id == id)
    }

    pub fn vertex_by_name(&self, name: &str) -> Option<&Vertex> {
        let folded = case_fold(name);
        self.vertices.iter().find(|v| case_fold(&v.name) == folded)
    }

    pub fn hyperedge(&self, id: &str) -> Option<&Hyperedge> {
        self.hyperedges.iter().find(|h| h.id == id)
    }

    /// Find an existing vertex by case-folded name or create a new one.
    pub fn resolve_or_create_vertex(&mut self, name: &str, description: &str) -> String {
        if let Some(existing) = self.vertex_by_name(name) {
            return existing.id.clone();
        }
        let vertex = Vertex {
            id: overseer_core::new_id(),
            name: name.trim().to_string(),
            description: description.to_string(),
            sources: Vec::new(),
        };
        let id = vertex.id.clone();
        self.vertices.push(vertex);
        id
    }

    pub fn add_source(&mut self, vertex_id: &str, chunk: &str) {
        if let Some(vertex) = self.vertices.iter_mut().find(|v| v.id == vertex_id) {
            if !vertex.sources.iter().any(|s| s == chunk) {
                vertex.sources.push(chunk.to_string());
            }
        }
    }

    /// Install a new memory point over the named entities (created as needed).
    /// A hyperedge needs at least two distinct vertices.
    pub fn insert_hyperedge(
        &mut self,
        description: &str,
        entity_names: &[String],
        step: u32,
    ) -> Result<String> {
        let vertex_ids: BTreeSet<String> = entity_names
            .iter()
            .filter(|n| !n.trim().is_empty())
            .map(|name| self.resolve_or_create_vertex(name, ""))
            .collect();
        if vertex_ids.len() < 2 {
            return Err(Error::validation(
                "hyperedge needs at least two distinct entities",
            ));
        }
        let order = vertex_ids.len();
        let edge = Hyperedge {
            id: overseer_core::new_id(),
            description: description.to_string(),
            vertex_ids,
            order,
            origin: HyperedgeOrigin::Insertion,
            created_step: step,
            updated_step: step,
            merged_from: None,
        };
        let id = edge.id.clone();
        self.hyperedges.push(edge);
        Ok(id)
    }

    /// Update a memory point's description; the vertex set is untouched.
    pub fn update_description(
        &mut self,
        hyperedge_id: &str,
        new_description: &str,
        step: u32,
    ) -> Result<()> {
        let edge = self
            .hyperedges
            .iter_mut()
            .find(|h| h.id == hyperedge_id)
            .ok_or_else(|| Error::not_found("hyperedge", hyperedge_id))?;
        edge.description = new_description.to_string();
        edge.updated_step = step;
        Ok(())
    }

    /// Merge two memory points: both inputs are removed and replaced by one
    /// hyperedge whose vertex set is their union.
    pub fn merge(
        &mut self,
        first_id: &str,
        second_id: &str,
        merged_description: &str,
        step: u32,
    ) -> Result<String> {
        if first_id == second_id {
            return Err(Error::validation("cannot merge a hyperedge with itself"));
        }
        let first = self
            .hyperedge(first_id)
            .cloned()
            .ok_or_else(|| Error::not_found("hyperedge", first_id))?;
        let second = self
            .hyperedge(second_id)
            .cloned()
            .ok_or_else(|| Error::not_found("hyperedge", second_id))?;

        self.hyperedges.retain(|h| h.id != first_id && h.id != second_id);

        let vertex_ids: BTreeSet<String> = first
            .vertex_ids
            .union(&second.vertex_ids)
            .cloned()
            .collect();
        let order = vertex_ids.len();
        let created_step = first.created_step.min(second.created_step);
        let merged = Hyperedge {
            id: overseer_core::new_id(),
            description: merged_description.to_string(),
            vertex_ids,
            order,
            origin: HyperedgeOrigin::Merge,
            created_step,
            updated_step: step,
            merged_from: Some(vec![first.id, second.id]),
        };
        let id = merged.id.clone();
        self.hyperedges.push(merged);
        Ok(id)
    }

    /// Prose rendering of the memory, one block per memory point.
    pub fn render_transcript(&self) -> String {
        if self.hyperedges.is_empty() {
            return "(memory is empty)".to_string();
        }
        self.hyperedges
            .iter()
            .map(|edge| {
                let names: Vec<&str> = edge
                    .vertex_ids
                    .iter()
                    .filter_map(|id| self.vertex(id).map(|v| v.name.as_str()))
                    .collect();
                let mut block = format!(
                    "Memory point [{}] (order {}, step {}): entities {}\n{}",
                    edge.id,
                    edge.order,
                    edge.created_step,
                    names.join(", "),
                    edge.description
                );
                if let Some(parents) = &edge.merged_from {
                    block.push_str(&format!("\n(merged from {})", parents.join(", ")));
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Up to `cap` distinct source passages across all vertices.
    pub fn source_chunks(&self, cap: usize) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut chunks = Vec::new();
        for vertex in &self.vertices {
            for chunk in &vertex.sources {
                if chunks.len() >= cap {
                    return chunks;
                }
                if seen.insert(chunk.clone()) {
                    chunks.push(chunk.clone());
                }
            }
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn vertex_names_dedup_case_folded() {
        let mut g = Hypergraph::new();
        let a = g.resolve_or_create_vertex("Alice", "");
        let same = g.resolve_or_create_vertex("  alice ", "");
        let other = g.resolve_or_create_vertex("Bob", "");
        assert_eq!(a, same);
        assert_ne!(a, other);
        assert_eq!(g.vertices.len(), 2);
    }

    #[test]
    fn insertion_requires_two_distinct_entities() {
        let mut g = Hypergraph::new();
        assert!(g.insert_hyperedge("solo", &names(&["Alice"]), 0).is_err());
        assert!(g
            .insert_hyperedge("dup", &names(&["Alice", "ALICE"]), 0)
            .is_err());
        assert!(g
            .insert_hyperedge("pair", &names(&["Alice", "Bob"]), 0)
            .is_ok());
    }

    #[test]
    fn update_changes_description_only() {
        let mut g = Hypergraph::new();
        let id = g
            .insert_hyperedge("works with", &names(&["Alice", "Bob"]), 0)
            .unwrap();
        let before: BTreeSet<String> = g.hyperedge(&id).unwrap().vertex_ids.clone();
        g.update_description(&id, "collaborates with", 2).unwrap();
        let edge = g.hyperedge(&id).unwrap();
        assert_eq!(edge.description, "collaborates with");
        assert_eq!(edge.vertex_ids, before);
        assert_eq!(edge.updated_step, 2);
        assert_eq!(edge.created_step, 0);
    }

    #[test]
    fn merge_unions_vertices_and_removes_inputs() {
        let mut g = Hypergraph::new();
        let h1 = g
            .insert_hyperedge("works with", &names(&["Alice", "Bob"]), 0)
            .unwrap();
        let h2 = g
            .insert_hyperedge("reports to", &names(&["Bob", "Carol"]), 1)
            .unwrap();

        let h3 = g
            .merge(&h1, &h2, "Alice-Bob-Carol reporting chain", 2)
            .unwrap();

        assert!(g.hyperedge(&h1).is_none());
        assert!(g.hyperedge(&h2).is_none());
        let merged = g.hyperedge(&h3).unwrap();
        assert_eq!(merged.order, 3);
        assert_eq!(merged.origin, HyperedgeOrigin::Merge);
        assert_eq!(merged.merged_from, Some(vec![h1, h2]));

        let member_names: BTreeSet<&str> = merged
            .vertex_ids
            .iter()
            .map(|id| g.vertex(id).unwrap().name.as_str())
            .collect();
        assert_eq!(member_names, BTreeSet::from(["Alice", "Bob", "Carol"]));
        assert_eq!(g.hyperedges.len(), 1);
    }

    #[test]
    fn merge_missing_input_fails_cleanly() {
        let mut g = Hypergraph::new();
        let h1 = g
            .insert_hyperedge("works with", &names(&["Alice", "Bob"]), 0)
            .unwrap();
        assert!(g.merge(&h1, "ghost", "x", 1).is_err());
        // The surviving input was not consumed.
        assert!(g.hyperedge(&h1).is_some());
    }

    #[test]
    fn transcript_lists_entities_and_ancestry() {
        let mut g = Hypergraph::new();
        let h1 = g
            .insert_hyperedge("works with", &names(&["Alice", "Bob"]), 0)
            .unwrap();
        let h2 = g
            .insert_hyperedge("reports to", &names(&["Bob", "Carol"]), 0)
            .unwrap();
        g.merge(&h1, &h2, "chain", 1).unwrap();

        let transcript = g.render_transcript();
        assert!(transcript.contains("Alice, Bob, Carol"));
        assert!(transcript.contains("chain"));
        assert!(transcript.contains("merged from"));
        assert!(transcript.contains("order 3"));
    }

    #[test]
    fn source_chunks_deduped_and_capped() {
        let mut g = Hypergraph::new();
        let a = g.resolve_or_create_vertex("Alice", "");
        let b = g.resolve_or_create_vertex("Bob", "");
        g.add_source(&a, "chunk one");
        g.add_source(&a, "chunk one");
        g.add_source(&b, "chunk one");
        g.add_source(&b, "chunk two");
        g.add_source(&b, "chunk three");
        assert_eq!(g.source_chunks(10).len(), 3);
        assert_eq!(g.source_chunks(2).len(), 2);
    }

    #[test]
    fn serde_roundtrip() {
        let mut g = Hypergraph::new();
        g.insert_hyperedge("works with", &names(&["Alice", "Bob"]), 0)
            .unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: Hypergraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.vertices.len(), 2);
        assert_eq!(back.hyperedges.len(), 1);
    }
}
