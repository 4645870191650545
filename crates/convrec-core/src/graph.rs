//! Static knowledge graphs.
//!
//! Two graphs are fixed for the lifetime of a run:
//!
//! - [`EntityGraph`]: typed relational edges between entities (items are
//!   entities too). Propagated with a relational GCN.
//! - [`WordGraph`]: untyped co-occurrence edges between words. Propagated
//!   with a plain GCN.
//!
//! Only the embeddings attached to the nodes are learned. The edge lists
//! here, and the per-edge normalization constants derived from them, never
//! change once loaded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A typed entity edge `(head, tail, relation)`. Messages flow head -> tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationEdge {
    pub head: u32,
    pub tail: u32,
    pub relation: u32,
}

/// Entity relation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityGraph {
    pub n_entity: usize,
    pub n_relation: usize,
    pub edges: Vec<RelationEdge>,
}

impl EntityGraph {
    /// Build and validate an entity graph.
    pub fn new(n_entity: usize, n_relation: usize, edges: Vec<RelationEdge>) -> Result<Self> {
        let graph = Self {
            n_entity,
            n_relation,
            edges,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Check that every edge stays inside the node and relation ranges.
    pub fn validate(&self) -> Result<()> {
        for (i, e) in self.edges.iter().enumerate() {
            if e.head as usize >= self.n_entity || e.tail as usize >= self.n_entity {
                return Err(Error::InvalidGraph(format!(
                    "entity edge {i} ({} -> {}) outside {} entities",
                    e.head, e.tail, self.n_entity
                )));
            }
            if e.relation as usize >= self.n_relation {
                return Err(Error::InvalidGraph(format!(
                    "entity edge {i} has relation {} but only {} relations",
                    e.relation, self.n_relation
                )));
            }
        }
        Ok(())
    }

    /// Source ids of every edge.
    pub fn heads(&self) -> Vec<u32> {
        self.edges.iter().map(|e| e.head).collect()
    }

    /// Target ids of every edge.
    pub fn tails(&self) -> Vec<u32> {
        self.edges.iter().map(|e| e.tail).collect()
    }

    /// Relation type of every edge.
    pub fn relations(&self) -> Vec<u32> {
        self.edges.iter().map(|e| e.relation).collect()
    }

    /// Per-edge mean-aggregation weights: `1 / |N_r(tail)|`.
    ///
    /// Each relation is averaged separately at its target node.
    pub fn mean_norms(&self) -> Vec<f32> {
        let mut counts: HashMap<(u32, u32), u32> = HashMap::new();
        for e in &self.edges {
            *counts.entry((e.tail, e.relation)).or_insert(0) += 1;
        }
        self.edges
            .iter()
            .map(|e| 1.0 / counts[&(e.tail, e.relation)] as f32)
            .collect()
    }
}

/// Word co-occurrence graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordGraph {
    pub n_word: usize,
    /// Directed `(source, target)` pairs.
    pub edges: Vec<(u32, u32)>,
}

/// Edge list with self-loops and symmetric degree normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEdges {
    pub sources: Vec<u32>,
    pub targets: Vec<u32>,
    pub weights: Vec<f32>,
}

impl WordGraph {
    /// Build and validate a word graph.
    pub fn new(n_word: usize, edges: Vec<(u32, u32)>) -> Result<Self> {
        let graph = Self { n_word, edges };
        graph.validate()?;
        Ok(graph)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, &(s, t)) in self.edges.iter().enumerate() {
            if s as usize >= self.n_word || t as usize >= self.n_word {
                return Err(Error::InvalidGraph(format!(
                    "word edge {i} ({s} -> {t}) outside {} words",
                    self.n_word
                )));
            }
        }
        Ok(())
    }

    /// `D^{-1/2} (A + I) D^{-1/2}` as an edge list.
    ///
    /// Self-loops are added for every node (existing self-loops are
    /// replaced); degrees are counted at the target node.
    pub fn gcn_normalized(&self) -> NormalizedEdges {
        let n = self.n_word;
        let mut sources = Vec::with_capacity(self.edges.len() + n);
        let mut targets = Vec::with_capacity(self.edges.len() + n);
        for &(s, t) in &self.edges {
            if s != t {
                sources.push(s);
                targets.push(t);
            }
        }
        for i in 0..n as u32 {
            sources.push(i);
            targets.push(i);
        }

        let mut degree = vec![0f32; n];
        for &t in &targets {
            degree[t as usize] += 1.0;
        }
        let inv_sqrt: Vec<f32> = degree
            .iter()
            .map(|&d| if d > 0.0 { d.powf(-0.5) } else { 0.0 })
            .collect();

        let weights = sources
            .iter()
            .zip(&targets)
            .map(|(&s, &t)| inv_sqrt[s as usize] * inv_sqrt[t as usize])
            .collect();

        NormalizedEdges {
            sources,
            targets,
            weights,
        }
    }
}

/// Side information shipped with a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideData {
    pub entity_kg: EntityGraph,
    pub word_kg: WordGraph,
    /// Entity ids that are recommendable items.
    pub item_entity_ids: Vec<u32>,
}

impl SideData {
    pub fn validate(&self) -> Result<()> {
        self.entity_kg.validate()?;
        self.word_kg.validate()?;
        if let Some(&bad) = self
            .item_entity_ids
            .iter()
            .find(|&&id| id as usize >= self.entity_kg.n_entity)
        {
            return Err(Error::InvalidGraph(format!(
                "item {bad} is not an entity node"
            )));
        }
        Ok(())
    }
}
