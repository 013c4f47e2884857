//! Identity extraction
//!
//! Regex extraction of email/phone/name plus an LLM pass for anything the
//! patterns miss. Extracted keys are merged into the session context; the
//! AI must never re-ask for a known entity.

use chatforge_common::errors::Result;
use chatforge_common::LlmClient;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex"));

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("phone regex"));

// Case-sensitive on purpose: the capture must start with a capital so
// "I am so frustrated" never extracts "so" as a name.
static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:[Mm]y name is|I am|I'm|[Tt]his is)\s+([A-Z][A-Za-z'-]+(?:\s+[A-Z][A-Za-z'-]+){0,2})",
    )
    .expect("name regex")
});

/// Extraction prompt; the model must answer with a bare JSON object.
const EXTRACTION_PROMPT: &str = r#"Extract customer identity and request details from this message. Output a JSON object only, no explanation.

Recognized keys: name, email, phone, order_id, company, topic.
Include a key only when the message states its value explicitly. Do not guess. If nothing is present, output {}.

Message:
"#;

/// Deterministic regex pass. Keys: `email`, `phone`, `name`.
pub fn extract_identity_regex(message: &str) -> Map<String, Value> {
    let mut out = Map::new();

    if let Some(m) = EMAIL.find(message) {
        out.insert("email".to_string(), Value::String(m.as_str().to_string()));
    }

    if let Some(caps) = NAME.captures(message) {
        if let Some(name) = caps.get(1) {
            out.insert(
                "name".to_string(),
                Value::String(name.as_str().trim().to_string()),
            );
        }
    }

    if let Some(m) = PHONE.find(message) {
        // Avoid mistaking an order number in an email local part for a phone.
        let candidate = m.as_str();
        let digits = candidate.chars().filter(|c| c.is_ascii_digit()).count();
        if digits >= 8 && !message[..m.start()].ends_with('#') {
            out.insert(
                "phone".to_string(),
                Value::String(candidate.trim().to_string()),
            );
        }
    }

    out
}

/// LLM-backed extractor with the regex pass layered on top (regex wins on
/// conflicts, being deterministic).
pub struct EntityExtractor {
    llm: Arc<dyn LlmClient>,
}

impl EntityExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Extract entities from a message. LLM failures degrade to the regex
    /// result rather than failing the turn.
    pub async fn extract(&self, message: &str) -> Result<Map<String, Value>> {
        let mut merged = match self.extract_llm(message).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "LLM extraction failed, falling back to regex only");
                Map::new()
            }
        };

        for (k, v) in extract_identity_regex(message) {
            merged.insert(k, v);
        }

        debug!(keys = ?merged.keys().collect::<Vec<_>>(), "Entities extracted");
        Ok(merged)
    }

    async fn extract_llm(&self, message: &str) -> Result<Map<String, Value>> {
        let prompt = format!("{EXTRACTION_PROMPT}{message}\n\nJSON:");
        let generation = self.llm.generate(&prompt).await?;
        Ok(parse_json_object(&generation.text))
    }
}

/// Pull the first JSON object out of a model response, tolerating prose or
/// code fences around it. Non-string/non-scalar values and nulls are
/// dropped.
fn parse_json_object(text: &str) -> Map<String, Value> {
    let start = match text.find('{') {
        Some(i) => i,
        None => return Map::new(),
    };
    let end = match text.rfind('}') {
        Some(i) if i >= start => i,
        _ => return Map::new(),
    };

    let parsed: Value = match serde_json::from_str(&text[start..=end]) {
        Ok(v) => v,
        Err(_) => return Map::new(),
    };

    parsed
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
                .filter(|(_, v)| v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(true))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// The identity triple currently known for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerIdentity {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Read the identity entities out of a collected-entities map.
pub fn get_customer_identity(entities: &Map<String, Value>) -> CustomerIdentity {
    let get = |k: &str| {
        entities
            .get(k)
            .and_then(|v| v.as_str())
            .map(String::from)
    };
    CustomerIdentity {
        email: get("email"),
        name: get("name"),
        phone: get("phone"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatforge_common::llm::MockLlm;

    #[test]
    fn extracts_email() {
        let out = extract_identity_regex("email foo@bar.com");
        assert_eq!(out.get("email").unwrap(), "foo@bar.com");
    }

    #[test]
    fn extracts_name_forms() {
        for (msg, expected) in [
            ("I'm Jane Doe, jane@x.co", "Jane Doe"),
            ("my name is Robert", "Robert"),
            ("This is Ana Maria Silva speaking", "Ana Maria Silva"),
        ] {
            let out = extract_identity_regex(msg);
            assert_eq!(out.get("name").unwrap(), expected, "{msg}");
        }
    }

    #[test]
    fn extracts_phone() {
        let out = extract_identity_regex("call me at +1 (555) 123-4567 please");
        assert!(out.get("phone").unwrap().as_str().unwrap().contains("555"));
    }

    #[test]
    fn plain_text_extracts_nothing() {
        assert!(extract_identity_regex("what is your refund policy").is_empty());
    }

    #[tokio::test]
    async fn llm_and_regex_results_merge() {
        let llm = Arc::new(MockLlm::new(
            r#"Here you go: {"order_id": "ORD-1234", "name": "wrong guess"}"#,
        ));
        let extractor = EntityExtractor::new(llm);

        let out = extractor
            .extract("I'm Jane Doe, my order is broken, jane@x.co")
            .await
            .unwrap();

        assert_eq!(out.get("order_id").unwrap(), "ORD-1234");
        // Regex wins over the model for identity keys.
        assert_eq!(out.get("name").unwrap(), "Jane Doe");
        assert_eq!(out.get("email").unwrap(), "jane@x.co");
    }

    #[tokio::test]
    async fn bad_llm_output_degrades_to_regex() {
        let llm = Arc::new(MockLlm::new("I could not find anything, sorry!"));
        let extractor = EntityExtractor::new(llm);

        let out = extractor.extract("email foo@bar.com").await.unwrap();
        assert_eq!(out.get("email").unwrap(), "foo@bar.com");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn parse_json_object_drops_nulls_and_empties() {
        let out = parse_json_object(r#"{"a": "x", "b": null, "c": "", "d": 3}"#);
        assert_eq!(out.get("a").unwrap(), "x");
        assert!(out.get("b").is_none());
        assert!(out.get("c").is_none());
        assert_eq!(out.get("d").unwrap(), 3);
    }

    #[test]
    fn identity_roundtrip() {
        let mut entities = Map::new();
        for (k, v) in extract_identity_regex("email foo@bar.com") {
            entities.insert(k, v);
        }
        let identity = get_customer_identity(&entities);
        assert_eq!(identity.email.as_deref(), Some("foo@bar.com"));
        assert!(identity.name.is_none());
    }
}
