//! System prompt assembly and lead-context extraction.
//!
//! Prompts here are deliberately minimal and functional. Retrieved context is
//! attached for tone and style reference only, never as facts to repeat.

use regex_lite::Regex;

use crate::model::{ChatMessage, Stage};

const MONTHS: [&str; 23] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december", "jan", "feb", "mar", "apr", "jun", "jul", "aug", "sep",
    "oct", "nov", "dec",
];

const AREA_KEYWORDS: [(&str, &str); 9] = [
    ("heights", "Heights"),
    ("downtown", "Downtown"),
    ("midtown", "Midtown"),
    ("uptown", "Uptown"),
    ("galleria", "Galleria"),
    ("katy", "Katy"),
    ("spring", "Spring"),
    ("pearland", "Pearland"),
    ("sugar land", "Sugar Land"),
];

/// The complete system prompt for one generation call.
pub fn build_complete_prompt(stage: Stage, lead_context: &str, retrieved_context: &str) -> String {
    let mut prompt = format!(
        "You are a leasing agent's assistant handling apartment leads over text.\n\
         Reply in the agent's voice: short, warm, specific.\n\
         Current stage: {stage}.\n{}\n\
         Respond with JSON only:\n\
         {{\"outgoing_message\": \"reply text\", \
         \"next_action_suggested\": {{\"action\": \"action_name\", \"reason\": \"...\"}}}}\n\
         Leave next_action_suggested empty unless an action is clearly needed.",
        stage_guidance(stage)
    );

    if !lead_context.is_empty() {
        prompt.push_str("\n\n## LEAD CONTEXT\n");
        prompt.push_str(lead_context);
    }

    if !retrieved_context.is_empty() {
        prompt.push_str(
            "\n\n## RETRIEVED CONTEXT (similar past conversations, tone/style reference only)\n",
        );
        prompt.push_str(retrieved_context);
    }

    prompt
}

fn stage_guidance(stage: Stage) -> &'static str {
    match stage {
        Stage::Qualifying => {
            "Goal: learn budget, bedrooms, move date, and preferred areas. Ask for one missing item at a time."
        }
        Stage::Working => {
            "Goal: discuss options already sent and narrow the list. Offer to line up a tour when interest is clear."
        }
        Stage::Touring => "Goal: confirm tour logistics and gather reactions afterwards.",
        Stage::Applied => "Goal: support the application in progress and keep momentum.",
        Stage::Approved => "Goal: congratulate and walk through next steps before move-in.",
        Stage::Closed => "Goal: wrap up warmly and stay available.",
        Stage::PostCloseNurture => {
            "Goal: light periodic check-ins; surface renewal or referral opportunities gently."
        }
    }
}

/// Summarize what is already known about the lead from retrieved context and
/// recent history, so generation neither re-asks known facts nor forgets to
/// ask for missing ones. Empty when nothing can be derived.
pub fn extract_lead_context(context: &str, chat_history: &[ChatMessage]) -> String {
    let start = chat_history.len().saturating_sub(10);
    let mut combined = context.to_string();
    for message in &chat_history[start..] {
        combined.push(' ');
        combined.push_str(&message.content);
    }
    let lower = combined.to_lowercase();

    let mut known: Vec<(&str, String)> = Vec::new();
    let mut missing: Vec<&str> = Vec::new();

    let budget = Regex::new(r"\$\s*(\d{3,4})")
        .ok()
        .and_then(|re| re.captures(&combined).map(|c| c[1].to_string()));
    if let Some(amount) = budget {
        known.push(("budget", format!("${amount}")));
    } else if ["budget", "afford", "price range"].iter().any(|k| lower.contains(k)) {
        known.push(("budget", "mentioned".to_string()));
    } else {
        missing.push("budget");
    }

    if let Some(month) = MONTHS.iter().find(|m| lower.contains(*m)) {
        let mut titled = month.to_string();
        if let Some(first) = titled.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        known.push(("move_timing", titled));
    } else if ["move", "moving", "asap", "soon"].iter().any(|k| lower.contains(k)) {
        known.push(("move_timing", "mentioned".to_string()));
    } else {
        missing.push("move_timing");
    }

    if ["studio", "efficiency"].iter().any(|k| lower.contains(k)) {
        known.push(("bedrooms", "studio".to_string()));
    } else if ["1 bed", "1bed", "1br", "one bed"].iter().any(|k| lower.contains(k)) {
        known.push(("bedrooms", "1br".to_string()));
    } else if ["2 bed", "2bed", "2br", "two bed"].iter().any(|k| lower.contains(k)) {
        known.push(("bedrooms", "2br".to_string()));
    } else if ["3 bed", "3bed", "3br", "three bed"].iter().any(|k| lower.contains(k)) {
        known.push(("bedrooms", "3br".to_string()));
    } else if lower.contains("bedroom") || lower.contains("bed") {
        known.push(("bedrooms", "mentioned".to_string()));
    } else {
        missing.push("bedrooms");
    }

    let areas: Vec<&str> = AREA_KEYWORDS
        .iter()
        .filter(|(keyword, _)| lower.contains(keyword))
        .map(|(_, name)| *name)
        .take(3)
        .collect();
    if !areas.is_empty() {
        known.push(("areas", areas.join(", ")));
    }

    if known.is_empty() && missing.is_empty() {
        return String::new();
    }

    let mut summary = String::from("LEAD CONTEXT SUMMARY:\n");
    if !known.is_empty() {
        let items: Vec<String> = known.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        summary.push_str(&format!("Known: {}\n", items.join(", ")));
    }
    if !missing.is_empty() {
        summary.push_str(&format!("Still need: {}\n", missing[..missing.len().min(2)].join(", ")));
    }
    summary.push_str("Don't re-ask known info. Ask for ONE missing item naturally.");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_month_and_bedrooms_are_extracted() {
        let summary = extract_lead_context(
            "",
            &[ChatMessage::user(
                "Looking for a 2 bed in Katy, budget $1500, moving in March",
            )],
        );
        assert!(summary.contains("budget: $1500"));
        assert!(summary.contains("move_timing: March"));
        assert!(summary.contains("bedrooms: 2br"));
        assert!(summary.contains("areas: Katy"));
        assert!(!summary.contains("Still need"));
    }

    #[test]
    fn missing_items_are_listed_at_most_two() {
        let summary = extract_lead_context("", &[ChatMessage::user("hi there")]);
        assert!(summary.contains("Still need: budget, move_timing"));
    }

    #[test]
    fn vague_mentions_count_as_known() {
        let summary =
            extract_lead_context("", &[ChatMessage::user("my budget is flexible, moving soon")]);
        assert!(summary.contains("budget: mentioned"));
        assert!(summary.contains("move_timing: mentioned"));
    }

    #[test]
    fn prompt_includes_context_sections_only_when_present() {
        let bare = build_complete_prompt(Stage::Qualifying, "", "");
        assert!(!bare.contains("LEAD CONTEXT"));
        assert!(!bare.contains("RETRIEVED CONTEXT"));
        assert!(bare.contains("qualifying"));

        let full = build_complete_prompt(Stage::Working, "Known: budget: $1500", "agent: sure");
        assert!(full.contains("## LEAD CONTEXT"));
        assert!(full.contains("## RETRIEVED CONTEXT"));
    }
}
