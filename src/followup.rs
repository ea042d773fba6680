//! Detection of follow-up commitments in outgoing agent messages.
//!
//! Weighted pattern matching over normalized text. Used by the nurture
//! workflow to schedule reminders when the agent promises to get back to a
//! lead.

use regex_lite::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpSignal {
    pub is_followup: bool,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// The matched phrase, when a pattern fired.
    pub phrase: Option<String>,
}

impl FollowUpSignal {
    fn none() -> Self {
        Self {
            is_followup: false,
            confidence: 0.0,
            phrase: None,
        }
    }
}

/// Weighted follow-up phrases, strongest commitments first.
const FOLLOWUP_PATTERNS: [(&str, f64); 17] = [
    (r"\b(i|we)'?ll get back to you\b", 0.95),
    (r"\b(i|we) will get back to you\b", 0.95),
    (r"\b(i|we)'?ll confirm.*get back\b", 0.95),
    (r"\b(i|we)'?ll check.*get back\b", 0.95),
    (r"\b(get|getting) back to you\b", 0.9),
    (r"\b(i|we)'?ll follow[- ]?up\b", 0.9),
    (r"\b(i|we) will follow[- ]?up\b", 0.9),
    (r"\bfollow[- ]?up (shortly|soon|tomorrow|later|with details)\b", 0.9),
    (r"\bwill get back\b", 0.9),
    (r"\b(i|we)'?ll update you\b", 0.85),
    (r"\b(i|we)'?ll let you know\b", 0.85),
    (r"\bcircle back\b", 0.85),
    (r"\bwill follow[- ]?up\b", 0.85),
    (r"\b(i|we)'?ll confirm\b", 0.8),
    (r"\btouch base\b", 0.75),
    (r"\breach out\b", 0.75),
    (r"\bcheck in\b", 0.75),
];

pub struct FollowUpPromiseDetector {
    patterns: Vec<(Regex, f64)>,
}

impl Default for FollowUpPromiseDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FollowUpPromiseDetector {
    pub fn new() -> Self {
        let patterns = FOLLOWUP_PATTERNS
            .iter()
            .filter_map(|(pattern, weight)| Regex::new(pattern).ok().map(|r| (r, *weight)))
            .collect();
        Self { patterns }
    }

    /// Highest-weight pattern match wins; no match means no commitment.
    pub fn detect(&self, text: &str) -> FollowUpSignal {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return FollowUpSignal::none();
        }

        let mut best: Option<(String, f64)> = None;
        for (regex, weight) in &self.patterns {
            if let Some(m) = regex.find(&normalized) {
                if best.as_ref().map_or(true, |(_, w)| weight > w) {
                    best = Some((m.as_str().to_string(), *weight));
                }
            }
        }

        match best {
            Some((phrase, confidence)) => {
                tracing::debug!("Follow-up promise matched: {:?} ({})", phrase, confidence);
                FollowUpSignal {
                    is_followup: true,
                    confidence,
                    phrase: Some(phrase),
                }
            }
            None => FollowUpSignal::none(),
        }
    }
}

/// Lowercase, straighten smart quotes, collapse whitespace.
fn normalize_text(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let straightened: String = lowered
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201c}' | '\u{201d}' => '"',
            c => c,
        })
        .collect();
    straightened.split_whitespace().collect::<Vec<_>>().join(" ")
}
