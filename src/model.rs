use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle stage a lead's conversation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Qualifying,
    Working,
    Touring,
    Applied,
    Approved,
    Closed,
    PostCloseNurture,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Qualifying,
        Stage::Working,
        Stage::Touring,
        Stage::Applied,
        Stage::Approved,
        Stage::Closed,
        Stage::PostCloseNurture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Qualifying => "qualifying",
            Stage::Working => "working",
            Stage::Touring => "touring",
            Stage::Applied => "applied",
            Stage::Approved => "approved",
            Stage::Closed => "closed",
            Stage::PostCloseNurture => "post_close_nurture",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "qualifying" => Some(Stage::Qualifying),
            "working" => Some(Stage::Working),
            "touring" => Some(Stage::Touring),
            "applied" => Some(Stage::Applied),
            "approved" => Some(Stage::Approved),
            "closed" => Some(Stage::Closed),
            "post_close_nurture" => Some(Stage::PostCloseNurture),
            _ => None,
        }
    }

    /// Tag used by the imported transcript corpus. Messages ingested from CSV
    /// carry these instead of the live stage names, so the retrieval stage
    /// boost compares against this mapping.
    pub fn legacy_tag(self) -> &'static str {
        match self {
            Stage::Qualifying => "first_contact",
            Stage::Working => "sending_list",
            Stage::Touring => "touring",
            Stage::Applied => "applying",
            Stage::Approved => "approval",
            Stage::Closed => "post_close",
            Stage::PostCloseNurture => "post_close",
        }
    }

    /// True for stages at or past approval, where a lead has committed.
    pub fn is_post_move(self) -> bool {
        matches!(
            self,
            Stage::Approved | Stage::Closed | Stage::PostCloseNurture
        )
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Qualifying
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Lead,
    Agent,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Lead => "lead",
            Role::Agent => "agent",
            Role::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lead" => Some(Role::Lead),
            "agent" => Some(Role::Agent),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// Transport role for chat history ("user"/"assistant"/"system").
    pub fn chat_role(self) -> &'static str {
        match self {
            Role::Lead => "user",
            Role::Agent => "assistant",
            Role::System => "system",
        }
    }
}

/// Provenance of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Csv,
    Generated,
    SystemAgent,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Csv => "csv",
            Source::Generated => "generated",
            Source::SystemAgent => "system_agent",
        }
    }

    pub fn parse(raw: &str) -> Source {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" => Source::Csv,
            "system_agent" => Source::SystemAgent,
            _ => Source::Generated,
        }
    }
}

/// One entry of transport chat history ({role, content} pairs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role.eq_ignore_ascii_case("assistant")
    }
}

/// Action the model (or a safety rule) suggests for the current turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action: String,
    #[serde(default = "default_action_reason")]
    pub reason: String,
}

fn default_action_reason() -> String {
    "model_suggested".to_string()
}

impl SuggestedAction {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

pub type LeadProfile = Map<String, Value>;

/// A message row in the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub thread_id: String,
    pub turn_index: i64,
    pub role: Role,
    pub text: String,
    pub clean_text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub stage: String,
    pub entities: Value,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_version: Option<String>,
    pub source: Source,
    pub pii_hashes: Value,
}

impl StoredMessage {
    /// Redacted text when present, raw text otherwise.
    pub fn best_text(&self) -> &str {
        if self.clean_text.trim().is_empty() {
            &self.text
        } else {
            &self.clean_text
        }
    }
}

/// Fields supplied by callers when appending a message to a thread.
/// `turn_index` and `id` are assigned by the store.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub thread_id: String,
    pub role: Role,
    pub text: String,
    pub clean_text: String,
    pub stage: String,
    pub source: Source,
    pub entities: Value,
    pub pii_hashes: Value,
}

impl MessageDraft {
    pub fn new(
        thread_id: impl Into<String>,
        role: Role,
        text: impl Into<String>,
        stage: Stage,
        source: Source,
    ) -> Self {
        let text = text.into();
        Self {
            thread_id: thread_id.into(),
            role,
            clean_text: text.clone(),
            text,
            stage: stage.as_str().to_string(),
            source,
            entities: Value::Object(Map::new()),
            pii_hashes: Value::Object(Map::new()),
        }
    }
}

/// Denormalized per-thread aggregate, upserted as messages accrue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub stage: String,
    pub message_count: i64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
    pub summary: String,
}

/// A flagged turn awaiting human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub thread_id: String,
    pub escalation_type: String,
    pub reason: String,
    pub lead_message_snippet: String,
    pub ai_response_snippet: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// Windows applied to chat history at the three points it is consumed.
pub const HISTORY_TRANSPORT_WINDOW: usize = 20;
pub const HISTORY_GENERATION_WINDOW: usize = 12;
pub const HISTORY_CLASSIFY_WINDOW: usize = 6;

/// Ephemeral per-turn working state. Owned by one turn's execution and
/// discarded after the response is returned; only the persisted subset
/// survives in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub lead_profile: LeadProfile,
    #[serde(default)]
    pub user_utterance: String,
    #[serde(default)]
    pub retrieved_context: String,
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub suggested_action: Option<SuggestedAction>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    /// Trim history to the transport window, keeping the most recent turns.
    pub fn truncate_history(&mut self) {
        if self.chat_history.len() > HISTORY_TRANSPORT_WINDOW {
            let drop = self.chat_history.len() - HISTORY_TRANSPORT_WINDOW;
            self.chat_history.drain(..drop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("not_a_stage"), None);
    }

    #[test]
    fn legacy_tags_cover_all_stages() {
        for stage in Stage::ALL {
            assert!(!stage.legacy_tag().is_empty());
        }
        assert_eq!(Stage::Qualifying.legacy_tag(), "first_contact");
        assert_eq!(Stage::Approved.legacy_tag(), "approval");
        assert_eq!(Stage::PostCloseNurture.legacy_tag(), "post_close");
    }

    #[test]
    fn history_truncation_keeps_most_recent() {
        let mut state = ConversationState::new("t1");
        for i in 0..30 {
            state.chat_history.push(ChatMessage::user(format!("m{i}")));
        }
        state.truncate_history();
        assert_eq!(state.chat_history.len(), HISTORY_TRANSPORT_WINDOW);
        assert_eq!(state.chat_history.last().unwrap().content, "m29");
    }
}
