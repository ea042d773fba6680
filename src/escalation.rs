//! Escalation and send-decision arbiter.
//!
//! Reconciles the model-suggested action with a small set of deterministic
//! safety rules, classifies the final action, and decides whether the
//! generated reply may actually be released to the lead.

use crate::model::{ChatMessage, Stage, SuggestedAction};

/// Actions that flag a turn for human review.
pub const ESCALATION_ACTIONS: [&str; 10] = [
    "escalate_fees",
    "escalate_links",
    "escalate_pricing",
    "escalate_complaint",
    "escalate_scheduling",
    "escalate_more_options",
    "escalate_approved",
    "escalate_followup",
    "escalate_uncertainty",
    "escalate_general",
];

/// Actions whose policy forbids releasing the generated reply.
const NO_SEND_ACTIONS: [&str; 3] = ["escalate_links", "escalate_fees", "escalate_pricing"];

/// Outcome of arbitrating one turn.
#[derive(Debug, Clone, Default)]
pub struct Arbitration {
    pub final_action: Option<SuggestedAction>,
    pub is_escalation: bool,
    pub escalation_type: Option<String>,
    pub escalation_reason: Option<String>,
    pub stage_change: Option<Stage>,
    pub should_send: bool,
}

/// Reconcile the model-suggested action with the safety rules and derive the
/// turn's flags. The model's action is authoritative when present; the rules
/// only fill the gap.
pub fn arbitrate(
    model_suggested: Option<&SuggestedAction>,
    utterance: &str,
    chat_history: &[ChatMessage],
    stage: Stage,
) -> Arbitration {
    let final_action = match model_suggested {
        Some(action) if !action.action.trim().is_empty() => Some(action.clone()),
        _ => detect_escalation_from_rules(utterance, chat_history),
    };

    let action_name = final_action.as_ref().map(|a| a.action.as_str());
    let is_escalation = is_escalation_action(action_name);
    let stage_change = should_change_stage(final_action.as_ref());
    let should_send = determine_should_send(action_name, stage);

    Arbitration {
        escalation_type: if is_escalation {
            action_name.map(str::to_string)
        } else {
            None
        },
        escalation_reason: if is_escalation {
            final_action.as_ref().map(|a| a.reason.clone())
        } else {
            None
        },
        final_action,
        is_escalation,
        stage_change,
        should_send,
    }
}

/// Minimal rule-based escalation detection, applied only when the model
/// suggested nothing. Catches the cases that must never be missed; all other
/// action categories (fees, pricing, scheduling, more-options, approval,
/// complaints) are left to the reply generator and not second-guessed here.
pub fn detect_escalation_from_rules(
    user_text: &str,
    chat_history: &[ChatMessage],
) -> Option<SuggestedAction> {
    let text = user_text.trim();

    // Links and screenshots are a compliance requirement and take precedence
    // over everything, including a polite acknowledgment prefix.
    if contains_link_or_screenshot(text) {
        return Some(SuggestedAction::new(
            "escalate_links",
            "contains_link_or_screenshot",
        ));
    }

    // A bare acknowledgment never escalates.
    if is_simple_acknowledgment(text) {
        return None;
    }

    // Cold lead: no incoming text after three or more unanswered assistant
    // messages.
    if text.is_empty() && assistant_streak(chat_history) >= 3 {
        return Some(SuggestedAction::new(
            "escalate_followup",
            "cold_lead_followup",
        ));
    }

    None
}

/// Detect URLs, social-media references, and screenshot/attachment mentions.
pub fn contains_link_or_screenshot(text: &str) -> bool {
    let t = text.to_lowercase();

    if ["http://", "https://", "www."].iter().any(|k| t.contains(k)) {
        return true;
    }

    let social = [
        "instagram", "facebook", "tiktok", "twitter", "x.com", "youtube", "youtu.be",
    ];
    if social.iter().any(|k| t.contains(k)) {
        return true;
    }

    let attachment = [
        "screenshot",
        "screen shot",
        "see pic",
        "see image",
        "check pic",
        "attached",
    ];
    attachment.iter().any(|k| t.contains(k))
}

/// True for short acknowledgment tokens and phrases, allowing a single
/// trailing "!". Empty text is NOT an acknowledgment; it may be a cold lead.
pub fn is_simple_acknowledgment(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    if t.is_empty() {
        return false;
    }
    if t.len() < 2 {
        return t == "k";
    }

    const SIMPLE_ACKS: [&str; 11] = [
        "ok", "k", "okay", "thanks", "thx", "cool", "sure", "yes", "no", "yep", "nope",
    ];
    if SIMPLE_ACKS.contains(&t.as_str()) {
        return true;
    }
    if let Some(stripped) = t.strip_suffix('!') {
        if SIMPLE_ACKS.contains(&stripped) {
            return true;
        }
    }

    const SHORT_PHRASES: [&str; 5] = [
        "got it",
        "sounds good",
        "thank you",
        "no worries",
        "all good",
    ];
    SHORT_PHRASES
        .iter()
        .any(|phrase| t.starts_with(phrase) && t.len() <= phrase.len() + 5)
}

/// Count the trailing run of consecutive assistant turns, stopping at the
/// first non-assistant or empty-content entry.
pub fn assistant_streak(chat_history: &[ChatMessage]) -> usize {
    chat_history
        .iter()
        .rev()
        .take_while(|m| m.is_assistant() && !m.content.trim().is_empty())
        .count()
}

pub fn is_escalation_action(action: Option<&str>) -> bool {
    match action {
        Some(a) => ESCALATION_ACTIONS.contains(&a),
        None => false,
    }
}

/// Only `request_application` moves the stage (to applied); every other
/// action, escalating or not, leaves it unchanged.
pub fn should_change_stage(action: Option<&SuggestedAction>) -> Option<Stage> {
    match action {
        Some(a) if a.action == "request_application" => Some(Stage::Applied),
        _ => None,
    }
}

/// Whether the outgoing message may be released.
///
/// Links, fees, and pricing never send: accuracy and compliance require a
/// human. Complaints suppress the reply only once the lead has moved
/// (approved / closed / post-close). Everything else, including unknown
/// actions and no action, sends.
pub fn determine_should_send(action: Option<&str>, stage: Stage) -> bool {
    let a = action.unwrap_or("").trim().to_lowercase();

    if NO_SEND_ACTIONS.contains(&a.as_str()) {
        return false;
    }

    if a == "escalate_complaint" {
        return !stage.is_post_move();
    }

    true
}

/// Last-resort reply when a message is due but generation produced none.
pub fn default_reply_for_action(action: Option<&str>, stage: Stage) -> String {
    let a = action.unwrap_or("").trim().to_lowercase();

    if !determine_should_send(Some(&a), stage) {
        return String::new();
    }

    match a.as_str() {
        "escalate_scheduling" => "I'll check availability and follow up with times.",
        "escalate_more_options" => "I'll take another look and send a few fresh options.",
        "escalate_approved" => "Congratulations! I'll follow up on next steps.",
        "escalate_followup" => "Just checking in, let me know if you want to move forward.",
        "escalate_uncertainty" => {
            "Totally understandable. I'll take another pass and send a few fresh options."
        }
        _ => "I'll look into that and follow up shortly.",
    }
    .to_string()
}
