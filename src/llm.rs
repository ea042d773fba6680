use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AgentConfig;
use crate::model::{ChatMessage, SuggestedAction};

/// Reply generation seam. The orchestrator only sees this trait; tests
/// substitute deterministic stubs, production uses [`LlmClient`].
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// True when the provider is configured and worth calling.
    fn is_available(&self) -> bool;

    /// One chat completion. Errors are absorbed by callers as
    /// provider-unavailable and routed to fallbacks.
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// OpenAI-compatible chat completion client (works against OpenAI, Ollama,
/// LM Studio, vLLM and similar endpoints).
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs))
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            api_url: config.llm_api_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone().unwrap_or_default(),
            model: config.llm_model.clone(),
            client,
        })
    }

    async fn request_completion(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            temperature: Some(0.7),
            max_tokens: Some(2000),
        };

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

#[async_trait]
impl ReplyGenerator for LlmClient {
    fn is_available(&self) -> bool {
        !self.api_key.is_empty() || !self.api_url.contains("api.openai.com")
    }

    /// Timeout is enforced by the HTTP client; one retry, then the error
    /// propagates to the caller's fallback path.
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<String> {
        match self.request_completion(&messages).await {
            Ok(text) => Ok(text),
            Err(first) => {
                tracing::warn!("LLM call failed, retrying once: {:#}", first);
                self.request_completion(&messages).await
            }
        }
    }
}

/// The structured turn reply the generator is asked to produce.
#[derive(Debug, Deserialize)]
struct RawTurnReply {
    #[serde(default)]
    outgoing_message: String,
    #[serde(default)]
    next_action_suggested: serde_json::Value,
}

/// Parse the generator's output into a message plus optional suggested
/// action. If the output is not parseable JSON the raw text is used verbatim
/// and no action is inferred.
pub fn parse_turn_reply(raw: &str) -> (String, Option<SuggestedAction>) {
    let text = raw.trim();
    if text.is_empty() {
        return (String::new(), None);
    }

    let Some(candidate) = extract_json_object(text) else {
        return (raw.to_string(), None);
    };

    let Ok(parsed) = serde_json::from_str::<RawTurnReply>(candidate) else {
        return (raw.to_string(), None);
    };

    let action = match &parsed.next_action_suggested {
        serde_json::Value::Object(obj) => {
            let name = obj
                .get("action")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            if name.is_empty() {
                None
            } else {
                let reason = obj
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("model_suggested")
                    .trim()
                    .to_string();
                Some(SuggestedAction::new(name, reason))
            }
        }
        serde_json::Value::String(name) if !name.trim().is_empty() => Some(SuggestedAction::new(
            name.trim().to_lowercase(),
            "model_suggested",
        )),
        _ => None,
    };

    let message = parsed.outgoing_message.trim().to_string();
    if message.is_empty() {
        (raw.to_string(), action)
    } else {
        (message, action)
    }
}

/// Extract a JSON object from model output that may carry surrounding prose
/// or a fenced code block.
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted generator for tests: pops canned responses in order, errors
    /// when the script runs out.
    pub struct StubGenerator {
        pub available: bool,
        responses: Mutex<Vec<String>>,
    }

    impl StubGenerator {
        pub fn new<I, S>(responses: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let mut scripted: Vec<String> = responses.into_iter().map(Into::into).collect();
            scripted.reverse();
            Self {
                available: true,
                responses: Mutex::new(scripted),
            }
        }

        pub fn unavailable() -> Self {
            Self {
                available: false,
                responses: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReplyGenerator for StubGenerator {
        fn is_available(&self) -> bool {
            self.available
        }

        async fn generate(&self, _messages: Vec<ChatMessage>) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("stub generator exhausted"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_reply_with_action() {
        let raw = r#"{"outgoing_message": "I'll check availability.",
                      "next_action_suggested": {"action": "Escalate_Scheduling", "reason": "tour"}}"#;
        let (message, action) = parse_turn_reply(raw);
        assert_eq!(message, "I'll check availability.");
        let action = action.unwrap();
        assert_eq!(action.action, "escalate_scheduling");
        assert_eq!(action.reason, "tour");
    }

    #[test]
    fn string_action_gets_default_reason() {
        let raw = r#"{"outgoing_message": "Done", "next_action_suggested": "request_application"}"#;
        let (_, action) = parse_turn_reply(raw);
        let action = action.unwrap();
        assert_eq!(action.action, "request_application");
        assert_eq!(action.reason, "model_suggested");
    }

    #[test]
    fn malformed_output_falls_back_to_raw_text() {
        let raw = "Sure, I'll send some options over shortly.";
        let (message, action) = parse_turn_reply(raw);
        assert_eq!(message, raw);
        assert!(action.is_none());
    }

    #[test]
    fn extracts_json_from_fenced_block() {
        let raw = "Here you go:\n```json\n{\"outgoing_message\": \"hi\"}\n```";
        let (message, action) = parse_turn_reply(raw);
        assert_eq!(message, "hi");
        assert!(action.is_none());
    }

    #[test]
    fn empty_action_object_yields_no_action() {
        let raw = r#"{"outgoing_message": "hi", "next_action_suggested": {"action": ""}}"#;
        let (_, action) = parse_turn_reply(raw);
        assert!(action.is_none());
    }
}
