//! Stage classification for the lead lifecycle.
//!
//! Total function: the assisted path asks the reply generator to pick a
//! stage; any failure falls back to the current stage, never to an arbitrary
//! default. The keyword path is the deterministic fallback when no generator
//! is available.

use std::sync::Arc;

use crate::llm::{extract_json_object, ReplyGenerator};
use crate::model::{ChatMessage, Stage, HISTORY_CLASSIFY_WINDOW};

pub struct StageClassifier {
    generator: Arc<dyn ReplyGenerator>,
}

impl StageClassifier {
    pub fn new(generator: Arc<dyn ReplyGenerator>) -> Self {
        Self { generator }
    }

    /// Classify the stage for the current turn. Never fails.
    pub async fn classify(
        &self,
        current: Stage,
        chat_history: &[ChatMessage],
        utterance: &str,
    ) -> Stage {
        if !self.generator.is_available() {
            return keyword_stage(utterance, current);
        }

        let prompt = build_classify_prompt(current, chat_history, utterance);
        match self.generator.generate(vec![ChatMessage::user(prompt)]).await {
            Ok(raw) => match parse_stage_response(&raw) {
                Some(stage) => {
                    tracing::debug!("Stage classified: {} (was {})", stage, current);
                    stage
                }
                None => {
                    tracing::warn!("Stage classification returned no usable stage, keeping {}", current);
                    current
                }
            },
            Err(e) => {
                tracing::warn!("Stage classification failed, keeping {}: {:#}", current, e);
                current
            }
        }
    }
}

fn build_classify_prompt(current: Stage, chat_history: &[ChatMessage], utterance: &str) -> String {
    let recent = chat_history
        .iter()
        .rev()
        .take(HISTORY_CLASSIFY_WINDOW)
        .rev()
        .map(|m| {
            let speaker = if m.is_assistant() { "Agent" } else { "Lead" };
            let content: String = m.content.chars().take(100).collect();
            format!("{speaker}: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n");
    let recent = if recent.is_empty() {
        "(no history)".to_string()
    } else {
        recent
    };

    format!(
        "Based on the conversation context, determine the current stage.\n\n\
         Current stage: {current}\n\n\
         Recent conversation:\n{recent}\n\n\
         Current message: {utterance}\n\n\
         Available stages:\n\
         - qualifying: Gathering basic info (budget, bedrooms, move date, areas)\n\
         - working: Sending options, discussing properties\n\
         - touring: Scheduling or completing property tours\n\
         - applied: Application in progress\n\
         - approved: Application approved\n\
         - closed: Lease signed or lead went elsewhere\n\
         - post_close_nurture: Post-move follow-up\n\n\
         Return JSON: {{\"stage\": \"stage_name\", \"reason\": \"brief explanation\"}}"
    )
}

fn parse_stage_response(raw: &str) -> Option<Stage> {
    let candidate = extract_json_object(raw)?;
    let value: serde_json::Value = serde_json::from_str(candidate).ok()?;
    let name = value.get("stage")?.as_str()?;
    Stage::parse(name)
}

/// Deterministic keyword classification over the lower-cased utterance.
/// Fixed priority order, first match wins; no match retains the current
/// stage.
pub fn keyword_stage(text: &str, current: Stage) -> Stage {
    let lower = text.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));

    if has(&["approved", "approval"]) {
        return Stage::Approved;
    }
    if has(&["applied", "application", "apply"]) {
        return Stage::Applied;
    }
    if has(&["tour", "showing", "schedule"]) {
        return Stage::Touring;
    }
    if has(&["close", "closed", "lease signed", "moved in", "renew"]) {
        return Stage::Closed;
    }
    if has(&["options", "listings", "properties", "send"]) {
        return Stage::Working;
    }
    if has(&["budget", "move", "bed", "bath", "qualify"]) {
        return Stage::Qualifying;
    }

    current
}
