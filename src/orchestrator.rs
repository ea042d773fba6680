//! The per-turn pipeline: classify stage, retrieve context, generate a
//! reply, arbitrate the action, persist, respond.
//!
//! Every external dependency failure is absorbed into a degraded but valid
//! continuation. A turn always produces a response; persistence problems are
//! logged and swallowed.

use std::sync::Arc;

use crate::embeddings::{spawn_embedding_writeback, Embedder};
use crate::escalation::{arbitrate, default_reply_for_action, Arbitration};
use crate::followup::FollowUpPromiseDetector;
use crate::llm::{parse_turn_reply, ReplyGenerator};
use crate::model::{
    ChatMessage, ConversationState, MessageDraft, Role, Source, Stage, SuggestedAction,
    HISTORY_GENERATION_WINDOW,
};
use crate::prompts::{build_complete_prompt, extract_lead_context};
use crate::retrieval::{RetrievalEngine, RetrievalRequest};
use crate::stage::StageClassifier;
use crate::store::ConversationStore;
use crate::style::StyleProfiler;

const RETRIEVE_TOP_K: usize = 5;

/// The externally visible result of one turn.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnOutcome {
    pub message: String,
    pub state: ConversationState,
    pub stage_change: Option<Stage>,
    pub escalation: bool,
    pub escalation_type: Option<String>,
    pub escalation_reason: Option<String>,
    pub should_send_message: bool,
}

pub struct TurnOrchestrator {
    store: Arc<ConversationStore>,
    generator: Arc<dyn ReplyGenerator>,
    embedder: Arc<dyn Embedder>,
    classifier: StageClassifier,
    retrieval: Arc<RetrievalEngine>,
    style: StyleProfiler,
    followup: FollowUpPromiseDetector,
    context_max_chars: usize,
    embedding_version: String,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        generator: Arc<dyn ReplyGenerator>,
        embedder: Arc<dyn Embedder>,
        retrieval: Arc<RetrievalEngine>,
        context_max_chars: usize,
        embedding_version: String,
    ) -> Self {
        Self {
            classifier: StageClassifier::new(generator.clone()),
            style: StyleProfiler::new(retrieval.clone()),
            followup: FollowUpPromiseDetector::new(),
            store,
            generator,
            embedder,
            retrieval,
            context_max_chars,
            embedding_version,
        }
    }

    /// Run one full turn. `persist` controls whether the lead utterance and
    /// any sent reply are written to the store; escalations are logged either
    /// way.
    pub async fn run_turn(
        &self,
        mut state: ConversationState,
        utterance: &str,
        persist: bool,
    ) -> TurnOutcome {
        state.user_utterance = utterance.to_string();

        // ClassifyStage
        let stage = self
            .classifier
            .classify(state.stage, &state.chat_history, utterance)
            .await;
        state.stage = stage;

        // Retrieve
        let context = self.retrieve_context(&state, utterance).await;
        state.retrieved_context = context.clone();

        // GenerateReply
        let (reply, suggested) = self.generate_reply(&state, utterance, &context).await;
        state.reply = reply;
        state.suggested_action = suggested;

        // Arbitrate
        let arbitration = arbitrate(
            state.suggested_action.as_ref(),
            utterance,
            &state.chat_history,
            stage,
        );
        self.apply_send_decision(&mut state, &arbitration);

        if arbitration.should_send && !state.reply.is_empty() {
            let signal = self.followup.detect(&state.reply);
            if signal.is_followup {
                tracing::debug!(
                    "Reply promises a follow-up (confidence {:.2}): {:?}",
                    signal.confidence,
                    signal.phrase
                );
            }
        }

        // Persist
        if arbitration.is_escalation {
            self.log_escalation(&state, utterance, &arbitration);
        }
        if persist {
            self.persist_turn(&state, utterance, &arbitration);
        }

        // Respond
        let message = state.reply.clone();
        state.suggested_action = arbitration.final_action.clone();
        if !utterance.is_empty() {
            state.chat_history.push(ChatMessage::user(utterance));
        }
        if !message.is_empty() {
            state.chat_history.push(ChatMessage::assistant(message.clone()));
        }
        state.truncate_history();

        tracing::info!(
            "Turn complete: thread={} stage={} reply_len={} action={:?} send={}",
            state.thread_id,
            stage,
            message.len(),
            arbitration.final_action.as_ref().map(|a| a.action.as_str()),
            arbitration.should_send,
        );

        TurnOutcome {
            message,
            stage_change: arbitration.stage_change,
            escalation: arbitration.is_escalation,
            escalation_type: arbitration.escalation_type.clone(),
            escalation_reason: arbitration.escalation_reason.clone(),
            should_send_message: arbitration.should_send,
            state,
        }
    }

    /// Retrieved context for generation, capped in length. Empty is valid.
    async fn retrieve_context(&self, state: &ConversationState, utterance: &str) -> String {
        let request = RetrievalRequest {
            query: utterance,
            top_k: RETRIEVE_TOP_K,
            thread_id: Some(&state.thread_id),
            stage: Some(state.stage),
            prefer_agent: true,
            chat_history: Some(&state.chat_history),
        };
        let candidates = self.retrieval.retrieve(&request).await;
        if candidates.is_empty() {
            return String::new();
        }

        let joined = candidates
            .iter()
            .map(|c| c.best_text())
            .collect::<Vec<_>>()
            .join("\n");
        let capped: String = joined.chars().take(self.context_max_chars).collect();
        let capped = capped.trim_end().to_string();
        tracing::info!(
            "Retrieved {} docs, context length: {}",
            candidates.len(),
            capped.len()
        );
        capped
    }

    async fn generate_reply(
        &self,
        state: &ConversationState,
        utterance: &str,
        context: &str,
    ) -> (String, Option<SuggestedAction>) {
        if !self.generator.is_available() {
            return (fallback_reply(utterance), None);
        }

        let lead_summary = extract_lead_context(context, &state.chat_history);
        let mut system_prompt = build_complete_prompt(state.stage, &lead_summary, context);
        let style_notes = self.style.build_style_notes(utterance, Some(state.stage)).await;
        if !style_notes.is_empty() {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&style_notes);
        }

        let mut messages = vec![ChatMessage::system(system_prompt)];
        let start = state
            .chat_history
            .len()
            .saturating_sub(HISTORY_GENERATION_WINDOW);
        for message in &state.chat_history[start..] {
            if matches!(message.role.as_str(), "user" | "assistant" | "system") {
                messages.push(message.clone());
            }
        }
        messages.push(ChatMessage::user(utterance));

        match self.generator.generate(messages).await {
            Ok(raw) => parse_turn_reply(&raw),
            Err(e) => {
                tracing::error!("Reply generation failed: {:#}", e);
                (fallback_reply(utterance), None)
            }
        }
    }

    /// Substitute a minimal reply when a message is due but none was
    /// generated, and blank the reply on a no-send decision.
    fn apply_send_decision(&self, state: &mut ConversationState, arbitration: &Arbitration) {
        let action = arbitration.final_action.as_ref().map(|a| a.action.as_str());
        if arbitration.should_send && state.reply.trim().is_empty() {
            state.reply = default_reply_for_action(action, state.stage);
        }
        if !arbitration.should_send {
            state.reply.clear();
        }
    }

    fn log_escalation(&self, state: &ConversationState, utterance: &str, arbitration: &Arbitration) {
        if state.thread_id.is_empty() {
            return;
        }
        let Some(escalation_type) = arbitration.escalation_type.as_deref() else {
            return;
        };
        let ai_response = if arbitration.should_send {
            state.reply.as_str()
        } else {
            ""
        };
        if let Err(e) = self.store.insert_escalation(
            &state.thread_id,
            escalation_type,
            arbitration.escalation_reason.as_deref().unwrap_or_default(),
            utterance,
            ai_response,
            state.stage.as_str(),
        ) {
            tracing::error!("Failed to log escalation: {:#}", e);
        }
    }

    /// Insert the lead utterance and, when sent, the agent reply. Failures
    /// never reach the caller.
    fn persist_turn(&self, state: &ConversationState, utterance: &str, arbitration: &Arbitration) {
        if state.thread_id.is_empty() {
            return;
        }

        if !utterance.trim().is_empty() {
            let draft = MessageDraft::new(
                &state.thread_id,
                Role::Lead,
                utterance,
                state.stage,
                Source::Generated,
            );
            self.insert_with_writeback(&draft);
        }

        if arbitration.should_send && !state.reply.is_empty() {
            let draft = MessageDraft::new(
                &state.thread_id,
                Role::Agent,
                state.reply.clone(),
                state.stage,
                Source::Generated,
            );
            self.insert_with_writeback(&draft);
        }
    }

    fn insert_with_writeback(&self, draft: &MessageDraft) {
        match self.store.insert_message(draft) {
            Ok((message_id, _)) => {
                spawn_embedding_writeback(
                    self.store.clone(),
                    self.embedder.clone(),
                    message_id,
                    draft.text.clone(),
                    self.embedding_version.clone(),
                );
            }
            Err(e) => {
                tracing::error!(
                    "Failed to persist {} message for thread {}: {:#}",
                    draft.role.as_str(),
                    draft.thread_id,
                    e
                );
            }
        }
    }
}

/// Keyword fallback when generation is unavailable or failed.
fn fallback_reply(utterance: &str) -> String {
    let lower = utterance.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));

    if has(&["approved", "approval"]) {
        "Congratulations! I'll follow up on next steps shortly."
    } else if has(&["applied", "application"]) {
        "Great! Text me once you submit and I'll keep things moving."
    } else if has(&["tour", "schedule", "visit"]) {
        "I'll check availability and follow up with times."
    } else {
        "I'll look into that and follow up shortly."
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalWeights;
    use crate::embeddings::testing::StubEmbedder;
    use crate::llm::testing::StubGenerator;

    fn orchestrator_with(
        store: Arc<ConversationStore>,
        generator: StubGenerator,
    ) -> TurnOrchestrator {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder { available: false });
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            embedder.clone(),
            RetrievalWeights::default(),
        ));
        TurnOrchestrator::new(
            store,
            Arc::new(generator),
            embedder,
            retrieval,
            1600,
            "v1".to_string(),
        )
    }

    fn scripted(responses: &[&str]) -> StubGenerator {
        StubGenerator::new(responses.iter().copied())
    }

    #[tokio::test]
    async fn clean_turn_sends_and_updates_history() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        // First scripted response answers stage classification, the second
        // answers reply generation.
        let generator = scripted(&[
            r#"{"stage": "qualifying", "reason": "gathering basics"}"#,
            r#"{"outgoing_message": "Got it. What's your move date?", "next_action_suggested": null}"#,
        ]);
        let orchestrator = orchestrator_with(store, generator);

        let state = ConversationState::new("t1");
        let outcome = orchestrator
            .run_turn(
                state,
                "Looking for a 2 bed in Houston, budget $1500, moving in March",
                false,
            )
            .await;

        assert!(outcome.should_send_message);
        assert!(!outcome.escalation);
        assert!(outcome.stage_change.is_none());
        assert_eq!(outcome.message, "Got it. What's your move date?");
        assert_eq!(outcome.state.stage, Stage::Qualifying);
        assert_eq!(outcome.state.chat_history.len(), 2);
        assert!(outcome.state.chat_history[0].content.contains("2 bed"));
        assert!(outcome.state.chat_history[1].is_assistant());
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_fallback_reply() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        // Only the classification response is scripted; the generation call
        // exhausts the stub and errors.
        let generator = scripted(&[r#"{"stage": "touring"}"#]);
        let orchestrator = orchestrator_with(store, generator);

        let outcome = orchestrator
            .run_turn(ConversationState::new("t1"), "can we tour saturday?", false)
            .await;

        assert!(outcome.should_send_message);
        assert_eq!(outcome.message, "I'll check availability and follow up with times.");
        assert_eq!(outcome.state.stage, Stage::Touring);
    }

    #[tokio::test]
    async fn unavailable_generator_still_produces_a_turn() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let orchestrator = orchestrator_with(store, StubGenerator::unavailable());

        let outcome = orchestrator
            .run_turn(ConversationState::new("t1"), "what's my application status?", false)
            .await;

        assert!(outcome.should_send_message);
        assert!(!outcome.message.is_empty());
        // Keyword classification still ran.
        assert_eq!(outcome.state.stage, Stage::Applied);
    }

    #[tokio::test]
    async fn no_send_action_blanks_message_and_logs_escalation() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let generator = scripted(&[
            r#"{"stage": "working"}"#,
            r#"{"outgoing_message": "The admin fee is usually around $150.",
                "next_action_suggested": {"action": "escalate_fees", "reason": "fee question"}}"#,
        ]);
        let orchestrator = orchestrator_with(store.clone(), generator);

        let outcome = orchestrator
            .run_turn(ConversationState::new("t1"), "what are the fees at the pearl?", false)
            .await;

        assert!(!outcome.should_send_message);
        assert!(outcome.escalation);
        assert_eq!(outcome.escalation_type.as_deref(), Some("escalate_fees"));
        assert_eq!(outcome.message, "");
        assert!(outcome.state.reply.is_empty());
        // No assistant turn appended.
        assert_eq!(outcome.state.chat_history.len(), 1);

        let queue = store.unresolved_escalations(10).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].escalation_type, "escalate_fees");
        assert_eq!(queue[0].ai_response_snippet, "");
    }

    #[tokio::test]
    async fn cold_lead_rule_fires_without_model_action() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let generator = scripted(&[
            r#"{"stage": "working"}"#,
            r#"{"outgoing_message": "", "next_action_suggested": null}"#,
        ]);
        let orchestrator = orchestrator_with(store, generator);

        let mut state = ConversationState::new("t1");
        for i in 0..3 {
            state.chat_history.push(ChatMessage::assistant(format!("checking in {i}")));
        }
        let outcome = orchestrator.run_turn(state, "", false).await;

        assert!(outcome.escalation);
        assert_eq!(outcome.escalation_type.as_deref(), Some("escalate_followup"));
        assert!(outcome.should_send_message);
        // Sending with an empty generated reply substitutes the minimal
        // action fallback.
        assert!(!outcome.message.is_empty());
    }

    #[tokio::test]
    async fn request_application_changes_stage() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let generator = scripted(&[
            r#"{"stage": "touring"}"#,
            r#"{"outgoing_message": "Ready to apply? I'll send the link.",
                "next_action_suggested": {"action": "request_application", "reason": "lead is ready"}}"#,
        ]);
        let orchestrator = orchestrator_with(store, generator);

        let outcome = orchestrator
            .run_turn(ConversationState::new("t1"), "loved the second unit, let's do it", false)
            .await;

        assert_eq!(outcome.stage_change, Some(Stage::Applied));
        assert!(!outcome.escalation);
        assert!(outcome.should_send_message);
    }

    #[tokio::test]
    async fn persisting_turn_writes_lead_and_agent_messages() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let generator = scripted(&[
            r#"{"stage": "qualifying"}"#,
            r#"{"outgoing_message": "Happy to help! What's your budget?", "next_action_suggested": null}"#,
        ]);
        let orchestrator = orchestrator_with(store.clone(), generator);

        orchestrator
            .run_turn(ConversationState::new("t9"), "hi, apartment hunting", true)
            .await;

        let history = store.thread_history("t9", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].0, Role::Lead);
        assert_eq!(history[1].0, Role::Agent);

        let thread = store.get_thread("t9").unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
    }

    #[tokio::test]
    async fn history_is_bounded_by_the_transport_window() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let generator = scripted(&[
            r#"{"stage": "working"}"#,
            r#"{"outgoing_message": "Noted.", "next_action_suggested": null}"#,
        ]);
        let orchestrator = orchestrator_with(store, generator);

        let mut state = ConversationState::new("t1");
        for i in 0..30 {
            state.chat_history.push(ChatMessage::user(format!("m{i}")));
        }
        let outcome = orchestrator.run_turn(state, "another message", false).await;
        assert_eq!(
            outcome.state.chat_history.len(),
            crate::model::HISTORY_TRANSPORT_WINDOW
        );
    }

    #[test]
    fn fallback_reply_matches_keywords() {
        assert!(fallback_reply("I got approved!").contains("Congratulations"));
        assert!(fallback_reply("submitted the application").contains("submit"));
        assert!(fallback_reply("can I visit tomorrow").contains("availability"));
        assert!(fallback_reply("hm").contains("follow up"));
    }
}
