//! Tone guidance derived from agent exemplars.
//!
//! The notes describe phrasing characteristics only (length, acknowledgment
//! habits, punctuation, call-to-action shape). Exemplar text is never quoted
//! into the output, so corpus content cannot leak into prompts.

use std::sync::Arc;

use regex_lite::Regex;

use crate::model::{Role, Stage};
use crate::retrieval::{RetrievalEngine, RetrievalRequest};

const EXEMPLAR_COUNT: usize = 5;

/// Signals that an exemplar already ends with a concrete next step.
const CTA_SIGNALS: [&str; 6] = [
    "when would you",
    "let me",
    "i'll",
    "i will",
    "can you",
    "would you like",
];

pub struct StyleProfiler {
    engine: Arc<RetrievalEngine>,
}

impl StyleProfiler {
    pub fn new(engine: Arc<RetrievalEngine>) -> Self {
        Self { engine }
    }

    /// Tone-only guidance block for the current query and stage, or an empty
    /// string when no agent exemplars are available.
    pub async fn build_style_notes(&self, query: &str, stage: Option<Stage>) -> String {
        let request = RetrievalRequest {
            query,
            top_k: EXEMPLAR_COUNT,
            thread_id: None,
            stage,
            prefer_agent: true,
            chat_history: None,
        };
        let exemplars: Vec<String> = self
            .engine
            .retrieve(&request)
            .await
            .into_iter()
            .filter(|c| c.role == Role::Agent)
            .map(|c| c.best_text().trim().to_string())
            .filter(|t| !t.is_empty())
            .take(EXEMPLAR_COUNT)
            .collect();

        let notes = synthesize_notes(&exemplars);
        if notes.is_empty() {
            return String::new();
        }

        let mut block = String::from("STYLE NOTES (tone only):");
        for note in notes {
            block.push_str("\n- ");
            block.push_str(&note);
        }
        block
    }
}

/// Derive tone notes from exemplar messages without copying their content.
fn synthesize_notes(exemplars: &[String]) -> Vec<String> {
    if exemplars.is_empty() {
        return Vec::new();
    }

    let mut notes = Vec::new();

    let total_len: usize = exemplars.iter().map(|m| m.len()).sum();
    let avg_len = total_len as f64 / exemplars.len() as f64;
    if avg_len < 180.0 {
        notes.push("Keep it brief (1-2 short sentences).".to_string());
    } else {
        notes.push("Prefer concise phrasing; avoid long paragraphs.".to_string());
    }

    let joined = exemplars.join("\n");
    let lower = joined.to_lowercase();

    if let Ok(ack) = Regex::new(r"\b(sounds good|got it|you're welcome)\b") {
        if ack.is_match(&lower) {
            notes.push(
                "Avoid starting messages with acknowledgments; lead with the next step."
                    .to_string(),
            );
        }
    }

    if joined.contains('!') {
        notes.push("Use exclamation marks sparingly.".to_string());
    } else {
        notes.push("Avoid exclamation marks unless mirroring the lead's excitement.".to_string());
    }

    if CTA_SIGNALS.iter().any(|sig| lower.contains(sig)) {
        notes.push("End with one clear next step (CTA), not multiple.".to_string());
    } else {
        notes.push("Include one concrete next step (CTA).".to_string());
    }

    notes.push("Avoid robotic fillers (e.g., 'let me know if you need anything').".to_string());

    notes
}
