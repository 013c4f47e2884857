//! Handover detection
//!
//! Pattern and history analysis deciding when a conversation should move to
//! a human agent. Pure and deterministic on a fixed input; all thresholds
//! are configurable.
//!
//! Priority order, first match wins:
//! 1. explicit agent requests, manager/legal/emergency language (immediate)
//! 2. account/billing/technical issue patterns (assisted, promoted to
//!    immediate when identity is already collected)
//! 3. frustration (same promotion rule)
//! 4. repetitive questions (Jaccard similarity against the newest message)
//! 5. prolonged back-and-forth with short AI replies
//! 6. consecutive low-confidence AI responses

use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Detector thresholds.
#[derive(Debug, Clone)]
pub struct HandoverConfig {
    /// Prior customer messages similar to the newest one that trigger the
    /// repetitive rule
    pub max_similar_questions: usize,
    /// Jaccard similarity threshold for "similar"
    pub similarity_threshold: f64,
    /// Customer messages inspected by the repetitive rule
    pub repetition_window: usize,
    /// Exchanges that count as a prolonged conversation
    pub max_back_and_forth: usize,
    /// AI replies below this length count as short
    pub short_reply_chars: usize,
    /// Short AI replies needed alongside the exchange count
    pub min_short_replies: usize,
    /// AI confidence below this value counts as low
    pub low_confidence: f64,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            max_similar_questions: 3,
            similarity_threshold: 0.7,
            repetition_window: 5,
            max_back_and_forth: 6,
            short_reply_chars: 120,
            min_short_replies: 3,
            low_confidence: 0.35,
        }
    }
}

/// One prior message as seen by the detector.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// customer | ai | agent | system
    pub sender: String,
    pub content: String,
    /// `metadata.confidence` of AI messages, scaled to [0, 1]
    pub confidence: Option<f64>,
}

/// A positive detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverVerdict {
    pub immediate: bool,
    pub reason: String,
    pub confidence: f64,
    /// Customer-facing explanation
    pub message: String,
}

static IMMEDIATE: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\b(speak|talk|chat)\s+(to|with)\s+(a\s+|an\s+)?(human|agent|person|representative|someone|real\s+person)",
        r"(?i)\b(human|real|live)\s+(agent|person|being|support)\b",
        r"(?i)\bconnect\s+me\b",
        r"(?i)\b(manager|supervisor)\b",
        r"(?i)\b(legal|lawyer|attorney|sue|lawsuit)\b",
        r"(?i)\b(emergency|urgent(ly)?\s+(help|assistance))\b",
    ])
    .expect("immediate patterns")
});

static ACCOUNT_ISSUES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\b(billing|bill|invoice|charge[ds]?|overcharged)\b",
        r"(?i)\brefunds?\b",
        r"(?i)\bpayments?\s+(fail|failed|issue|problem|declined)",
        r"(?i)\bpayment\b.*\b(fail|failed|declined|error)",
        r"(?i)\baccount\s+(locked|blocked|suspended|hacked)",
        r"(?i)\bsubscriptions?\b.*\b(cancel|issue|problem|charge)",
        r"(?i)\bcancel\b.*\bsubscription\b",
    ])
    .expect("account patterns")
});

static TECHNICAL_ISSUES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\b(technical|tech)\s+(issue|problem|support)\b",
        r"(?i)\b(login|log\s*in|sign\s*in)\b.*\b(fail|failed|can.?t|unable|broken|not\s+work)",
        r"(?i)\bcan.?t\s+(login|log\s*in|sign\s*in|access)\b",
        r"(?i)\bpassword\s+(reset|issue|problem|forgot)",
        r"(?i)\bforgot\s+(my\s+)?password\b",
        r"(?i)\b(bug|crash|error\s+message|not\s+working|broken)\b",
    ])
    .expect("technical patterns")
});

static FRUSTRATION: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bthis\s+is\s+(ridiculous|useless|unacceptable|terrible|awful)\b",
        r"(?i)\b(so\s+)?(frustrated|frustrating|annoyed|annoying|fed\s+up)\b",
        r"(?i)\byou('re|\s+are)\s+(not\s+helping|useless|no\s+help)\b",
        r"(?i)\bnot\s+helpful\s+at\s+all\b",
        r"(?i)\bwaste\s+of\s+(my\s+)?time\b",
        r"(?i)\bworst\s+(support|service|experience)\b",
        r"(?i)\bi\s+(already|just)\s+(told|said|explained)\b",
    ])
    .expect("frustration patterns")
});

/// Whether any identity entity has been collected.
fn has_identity(entities: &serde_json::Map<String, serde_json::Value>) -> bool {
    ["email", "name", "phone"]
        .iter()
        .any(|k| entities.get(*k).map(|v| !v.is_null()).unwrap_or(false))
}

/// Word-set Jaccard similarity of two texts.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(String::from)
            .collect()
    };

    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }

    let intersection = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    intersection / union
}

/// Run the detector. Returns `None` when the conversation should stay with
/// the AI.
pub fn detect_handover(
    message: &str,
    history: &[HistoryEntry],
    entities: &serde_json::Map<String, serde_json::Value>,
    config: &HandoverConfig,
) -> Option<HandoverVerdict> {
    let identity = has_identity(entities);

    // 1. Explicit requests always go straight to a human.
    if IMMEDIATE.is_match(message) {
        return Some(HandoverVerdict {
            immediate: true,
            reason: "explicit_request".to_string(),
            confidence: 1.0,
            message: "Connecting you with a human agent.".to_string(),
        });
    }

    // 2. Account and technical issues: assisted, unless identity is known.
    if ACCOUNT_ISSUES.is_match(message) {
        return Some(assisted_verdict("account_issue", 0.85, identity));
    }
    if TECHNICAL_ISSUES.is_match(message) {
        return Some(assisted_verdict("technical_issue", 0.85, identity));
    }

    // 3. Frustration.
    if FRUSTRATION.is_match(message) {
        return Some(assisted_verdict("frustration", 0.9, identity));
    }

    // 4. Repetitive questions.
    let recent_customer: Vec<&HistoryEntry> = history
        .iter()
        .rev()
        .filter(|m| m.sender == "customer")
        .take(config.repetition_window)
        .collect();
    let similar = recent_customer
        .iter()
        .filter(|m| jaccard_similarity(message, &m.content) >= config.similarity_threshold)
        .count();
    if similar >= config.max_similar_questions {
        return Some(HandoverVerdict {
            immediate: false,
            reason: "repetitive_questions".to_string(),
            confidence: 0.8,
            message: "It looks like I keep giving you the same answer. Let me bring in a human agent.".to_string(),
        });
    }

    // 5. Prolonged back-and-forth with short AI replies.
    let tail: Vec<&HistoryEntry> = history
        .iter()
        .rev()
        .take(config.max_back_and_forth * 2)
        .collect();
    let customer_count = tail.iter().filter(|m| m.sender == "customer").count();
    let ai_replies: Vec<&&HistoryEntry> = tail.iter().filter(|m| m.sender == "ai").collect();
    let exchanges = customer_count.min(ai_replies.len());
    let short_replies = ai_replies
        .iter()
        .filter(|m| m.content.len() < config.short_reply_chars)
        .count();
    if exchanges >= config.max_back_and_forth && short_replies >= config.min_short_replies {
        return Some(HandoverVerdict {
            immediate: false,
            reason: "prolonged_conversation".to_string(),
            confidence: 0.75,
            message: "This is taking longer than it should. Let me get a human agent to help.".to_string(),
        });
    }

    // 6. Two consecutive low-confidence AI answers.
    let last_two_ai: Vec<&HistoryEntry> = history
        .iter()
        .rev()
        .filter(|m| m.sender == "ai")
        .take(2)
        .collect();
    if last_two_ai.len() == 2
        && last_two_ai
            .iter()
            .all(|m| m.confidence.map(|c| c < config.low_confidence).unwrap_or(false))
    {
        return Some(HandoverVerdict {
            immediate: false,
            reason: "low_confidence".to_string(),
            confidence: 0.7,
            message: "I'm not confident in my answers here. Let me find a human agent for you.".to_string(),
        });
    }

    None
}

fn assisted_verdict(reason: &str, confidence: f64, identity_known: bool) -> HandoverVerdict {
    HandoverVerdict {
        immediate: identity_known,
        reason: reason.to_string(),
        confidence,
        message: if identity_known {
            "Connecting you with a human agent.".to_string()
        } else {
            "I can bring in a human agent. Could you share your name and email first?".to_string()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entities(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    fn customer(content: &str) -> HistoryEntry {
        HistoryEntry {
            sender: "customer".to_string(),
            content: content.to_string(),
            confidence: None,
        }
    }

    fn ai(content: &str, confidence: Option<f64>) -> HistoryEntry {
        HistoryEntry {
            sender: "ai".to_string(),
            content: content.to_string(),
            confidence,
        }
    }

    #[test]
    fn explicit_request_is_immediate_with_full_confidence() {
        let verdict = detect_handover(
            "I want to speak to a human agent",
            &[],
            &Default::default(),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert!(verdict.immediate);
        assert_eq!(verdict.reason, "explicit_request");
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn manager_and_legal_are_immediate() {
        for msg in ["Let me talk to your manager", "I will sue you", "this is an emergency"] {
            let verdict =
                detect_handover(msg, &[], &Default::default(), &HandoverConfig::default()).unwrap();
            assert!(verdict.immediate, "{msg}");
        }
    }

    #[test]
    fn payment_issue_without_identity_is_assisted() {
        let verdict = detect_handover(
            "My payment failed",
            &[],
            &Default::default(),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert!(!verdict.immediate);
        assert_eq!(verdict.reason, "account_issue");
        assert_eq!(verdict.confidence, 0.85);
    }

    #[test]
    fn payment_issue_with_identity_is_promoted() {
        let verdict = detect_handover(
            "My payment failed",
            &[],
            &entities(&[("email", "jane@x.co")]),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert!(verdict.immediate);
        assert_eq!(verdict.reason, "account_issue");
    }

    #[test]
    fn frustration_detected() {
        let verdict = detect_handover(
            "this is ridiculous, you're not helping",
            &[],
            &Default::default(),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert_eq!(verdict.reason, "frustration");
        assert_eq!(verdict.confidence, 0.9);
    }

    #[test]
    fn repetitive_questions_trigger() {
        let history = vec![
            customer("how do I change my shipping address"),
            ai("You can change it in settings, under shipping preferences today", None),
            customer("how do I change my shipping address?"),
            ai("Settings, then shipping preferences is where you change it", None),
            customer("how do I change my shipping address"),
            ai("As before, settings and then shipping preferences", None),
        ];
        let verdict = detect_handover(
            "how do I change my shipping address",
            &history,
            &Default::default(),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert_eq!(verdict.reason, "repetitive_questions");
        assert_eq!(verdict.confidence, 0.8);
    }

    #[test]
    fn two_similar_questions_do_not_trigger() {
        let history = vec![
            customer("how do I change my shipping address"),
            ai("You can change it in settings, under shipping preferences today", None),
            customer("how do I change my shipping address?"),
            ai("Settings, then shipping preferences is where you change it", None),
        ];
        assert!(detect_handover(
            "how do I change my shipping address",
            &history,
            &Default::default(),
            &HandoverConfig::default(),
        )
        .is_none());
    }

    #[test]
    fn prolonged_short_exchanges_trigger() {
        let mut history = Vec::new();
        for i in 0..6 {
            history.push(customer(&format!("question number {i} about my order")));
            history.push(ai("Please check the dashboard.", None));
        }
        let verdict = detect_handover(
            "okay but where exactly",
            &history,
            &Default::default(),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert_eq!(verdict.reason, "prolonged_conversation");
    }

    #[test]
    fn two_low_confidence_answers_trigger() {
        let history = vec![
            customer("what does error 42 mean"),
            ai("I'm not sure, possibly a sync problem.", Some(0.2)),
            customer("and what about error 43"),
            ai("That could be related to caching.", Some(0.3)),
        ];
        let verdict = detect_handover(
            "neither of those worked",
            &history,
            &Default::default(),
            &HandoverConfig::default(),
        )
        .unwrap();
        assert_eq!(verdict.reason, "low_confidence");
    }

    #[test]
    fn one_low_confidence_answer_does_not_trigger() {
        let history = vec![
            customer("what does error 42 mean"),
            ai("Error 42 is a sync conflict; retry the upload.", Some(0.9)),
            customer("and error 43"),
            ai("That could be caching.", Some(0.2)),
        ];
        assert!(detect_handover(
            "thanks, checking",
            &history,
            &Default::default(),
            &HandoverConfig::default(),
        )
        .is_none());
    }

    #[test]
    fn ordinary_questions_pass_through() {
        assert!(detect_handover(
            "What is your refund window?",
            &[],
            &Default::default(),
            &HandoverConfig::default(),
        )
        .is_some_and(|v| v.reason == "account_issue"));

        assert!(detect_handover(
            "What colors does the chair come in?",
            &[],
            &Default::default(),
            &HandoverConfig::default(),
        )
        .is_none());
    }

    #[test]
    fn detector_is_deterministic() {
        let history = vec![customer("hello there"), ai("Hello!", Some(0.9))];
        let a = detect_handover("my account is locked", &history, &Default::default(), &HandoverConfig::default());
        let b = detect_handover("my account is locked", &history, &Default::default(), &HandoverConfig::default());
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn jaccard_behaves() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
        let sim = jaccard_similarity("how do I reset my password", "how do I reset the password");
        assert!(sim >= 0.7, "{sim}");
    }
}
