//! Prompt composition
//!
//! Builds the support prompt from known customer data, retrieved context,
//! conversation history and the current question. Section order is fixed;
//! the rules block is part of the contract with the model: never invent
//! identifiers, never re-ask for data already known, try to help before
//! escalating.

use crate::service::HistoryMessage;
use serde_json::Value;

/// Separator between knowledge-base chunks.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Keys excluded from the known-data section (internal flags).
const INTERNAL_KEYS: [&str; 2] = ["pendingHandover", "handoverReason"];

/// Compose the full support prompt.
pub fn compose_support_prompt(
    known_entities: &serde_json::Map<String, Value>,
    context_chunks: &[String],
    history: &[HistoryMessage],
    question: &str,
) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str("You are a helpful customer support assistant.\n\n");

    let known = known_data_section(known_entities);
    if !known.is_empty() {
        prompt.push_str("## Known customer data\n");
        prompt.push_str(&known);
        prompt.push_str("\n\n");
    }

    if !context_chunks.is_empty() {
        prompt.push_str("## Knowledge base context\n");
        prompt.push_str(&context_chunks.join(CONTEXT_SEPARATOR));
        prompt.push_str("\n\n");
    }

    if !history.is_empty() {
        prompt.push_str("## Conversation so far\n");
        for message in history {
            let label = match message.sender.as_str() {
                "customer" => "Customer",
                _ => "Agent",
            };
            prompt.push_str(label);
            prompt.push_str(": ");
            prompt.push_str(&message.content);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    prompt.push_str("## Current question\n");
    prompt.push_str(question);
    prompt.push_str("\n\n");

    prompt.push_str(
        "## Rules\n\
         - Answer only from the knowledge base context above; if it does not contain the answer, say so.\n\
         - Never invent order numbers, ticket ids, account ids or any other identifiers.\n\
         - Never ask the customer for information already listed under known customer data.\n\
         - Try to resolve the issue yourself before suggesting a human agent.\n\
         - Keep answers short and concrete.\n",
    );

    prompt
}

/// Enumerate the known entities as `- key: value` lines.
fn known_data_section(entities: &serde_json::Map<String, Value>) -> String {
    let mut lines: Vec<String> = entities
        .iter()
        .filter(|(k, _)| !INTERNAL_KEYS.contains(&k.as_str()))
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("- {k}: {rendered}")
        })
        .collect();
    lines.sort();
    lines.join("\n")
}
