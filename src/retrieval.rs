//! Context retrieval and re-ranking.
//!
//! Blends vector similarity with structural signals: thread affinity, stage
//! match, role preference, and recency. Every provider failure degrades to a
//! weaker but valid result; the engine never raises to its caller.

use std::sync::Arc;

use crate::config::RetrievalWeights;
use crate::embeddings::Embedder;
use crate::model::{ChatMessage, Role, Source, Stage};
use crate::store::{Candidate, ConversationStore};

const TOP_K_MIN: usize = 1;
const TOP_K_MAX: usize = 100;

/// How many trailing chat-history turns are folded into the composed query.
const HISTORY_TURNS_IN_QUERY: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub top_k: usize,
    pub thread_id: Option<&'a str>,
    pub stage: Option<Stage>,
    pub prefer_agent: bool,
    pub chat_history: Option<&'a [ChatMessage]>,
}

/// A lead→agent exemplar exchange from the corpus.
#[derive(Debug, Clone)]
pub struct DialoguePair {
    pub lead: Candidate,
    pub agent: Candidate,
}

pub struct RetrievalEngine {
    store: Arc<ConversationStore>,
    embedder: Arc<dyn Embedder>,
    weights: RetrievalWeights,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        embedder: Arc<dyn Embedder>,
        weights: RetrievalWeights,
    ) -> Self {
        Self {
            store,
            embedder,
            weights,
        }
    }

    /// Ranked prior messages for grounding the current turn.
    pub async fn retrieve(&self, request: &RetrievalRequest<'_>) -> Vec<Candidate> {
        if request.query.trim().is_empty() {
            return Vec::new();
        }
        let top_k = request.top_k.clamp(TOP_K_MIN, TOP_K_MAX);

        if !self.embedder.is_available() {
            return self.fallback(request, top_k);
        }

        let composed = compose_query(request);
        let query_vector = match self.embedder.embed(&composed).await {
            Ok(vector) if !vector.is_empty() => vector,
            Ok(_) => {
                tracing::warn!("Embedding provider returned an empty vector, using recency fallback");
                return self.fallback(request, top_k);
            }
            Err(e) => {
                tracing::warn!("Embedding failed, using recency fallback: {:#}", e);
                return self.fallback(request, top_k);
            }
        };

        let candidates = self.gather_candidates(&query_vector, request.thread_id);
        if candidates.is_empty() {
            return self.fallback(request, top_k);
        }

        let mut ranked = self.rerank(candidates, request);
        ranked.truncate(top_k);
        ranked
    }

    /// Two nearest-neighbour searches, thread-scoped (when a thread is
    /// given) and global, concatenated and then deduplicated by message id
    /// keeping the first occurrence.
    fn gather_candidates(&self, query_vector: &[f32], thread_id: Option<&str>) -> Vec<Candidate> {
        let mut combined: Vec<Candidate> = Vec::new();

        if let Some(tid) = thread_id.filter(|t| !t.trim().is_empty()) {
            match self
                .store
                .vector_search(query_vector, Some(tid), self.weights.candidate_k)
            {
                Ok(mut hits) => combined.append(&mut hits),
                Err(e) => tracing::warn!("Thread-scoped vector search failed: {:#}", e),
            }
        }

        match self
            .store
            .vector_search(query_vector, None, self.weights.candidate_k)
        {
            Ok(mut hits) => combined.append(&mut hits),
            Err(e) => tracing::warn!("Global vector search failed: {:#}", e),
        }

        let mut seen = std::collections::HashSet::new();
        combined.retain(|c| seen.insert(c.message_id));
        combined
    }

    /// Composite re-rank: vector similarity plus structural boosts. The sort
    /// is stable, so equal composites keep their original relative order and
    /// re-running with identical inputs yields an identical ordering.
    fn rerank(&self, candidates: Vec<Candidate>, request: &RetrievalRequest<'_>) -> Vec<Candidate> {
        let w = &self.weights;
        let max_turn = candidates
            .iter()
            .map(|c| c.turn_index)
            .max()
            .unwrap_or(0)
            .max(1) as f64;
        let legacy_stage = request.stage.map(Stage::legacy_tag);

        let mut scored: Vec<(f64, Candidate)> = candidates
            .into_iter()
            .map(|c| {
                let mut composite = c.similarity;
                if request
                    .thread_id
                    .is_some_and(|tid| tid == c.thread_id)
                {
                    composite += w.boost_thread;
                }
                if legacy_stage.is_some_and(|tag| tag == c.stage) {
                    composite += w.boost_stage;
                }
                if request.prefer_agent && c.role == Role::Agent {
                    composite += w.boost_agent_role;
                }
                let recency = (c.turn_index as f64 / max_turn).clamp(0.0, 1.0);
                composite += w.boost_recency * recency;
                (composite, c)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, c)| c).collect()
    }

    /// Strict-priority recency fallback: most-recent within the thread when
    /// one is given, else most-recent globally. Never raises; empty output
    /// is valid.
    fn fallback(&self, request: &RetrievalRequest<'_>, top_k: usize) -> Vec<Candidate> {
        if let Some(tid) = request.thread_id.filter(|t| !t.trim().is_empty()) {
            match self.store.recent_in_thread(tid, top_k, request.prefer_agent) {
                Ok(hits) if !hits.is_empty() => return hits,
                Ok(_) => {}
                Err(e) => tracing::warn!("Thread recency fallback failed: {:#}", e),
            }
        }

        match self.store.recent_global(top_k, request.prefer_agent) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("Global recency fallback failed: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Lead→agent dialogue pairs: broad candidates with the role filter
    /// relaxed, reduced to agent messages, each joined to the nearest
    /// preceding lead message in its thread. Pairs from the imported CSV
    /// corpus are preferred before truncation.
    pub async fn retrieve_pairs(
        &self,
        query: &str,
        top_k: usize,
        stage: Option<Stage>,
    ) -> Vec<DialoguePair> {
        let top_k = top_k.clamp(TOP_K_MIN, TOP_K_MAX);
        let broad = RetrievalRequest {
            query,
            top_k: (top_k * 4).clamp(TOP_K_MIN, TOP_K_MAX),
            thread_id: None,
            stage,
            prefer_agent: false,
            chat_history: None,
        };

        let mut pairs: Vec<DialoguePair> = Vec::new();
        for candidate in self.retrieve(&broad).await {
            if candidate.role != Role::Agent {
                continue;
            }
            let lead = match self
                .store
                .preceding_lead_message(&candidate.thread_id, candidate.turn_index)
            {
                Ok(Some(lead)) => lead,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Pair lookup failed: {:#}", e);
                    continue;
                }
            };
            pairs.push(DialoguePair {
                lead,
                agent: candidate,
            });
        }

        let (preferred, rest): (Vec<_>, Vec<_>) = pairs
            .into_iter()
            .partition(|p| p.agent.source == Source::Csv);
        let mut ordered = preferred;
        ordered.extend(rest);
        ordered.truncate(top_k);
        ordered
    }
}

/// One composed string used for embedding: stage tag, up to the last three
/// role-labeled history turns, then the raw query.
fn compose_query(request: &RetrievalRequest<'_>) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(stage) = request.stage {
        parts.push(format!("[stage:{stage}]"));
    }

    if let Some(history) = request.chat_history {
        let start = history.len().saturating_sub(HISTORY_TURNS_IN_QUERY);
        for message in &history[start..] {
            if !message.content.trim().is_empty() {
                parts.push(format!("{}: {}", message.role, message.content));
            }
        }
    }

    parts.push(request.query.trim().to_string());
    parts.join("\n")
}
