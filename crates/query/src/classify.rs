//! Query routing
//!
//! A pure regex classifier: bare greetings get a canned reply without
//! retrieval, everything else takes the vector path.

use once_cell::sync::Lazy;
use regex::Regex;

/// Where a query is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Greeting,
    Vector,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Greeting => "greeting",
            Route::Vector => "vector",
        }
    }
}

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(hi|hii+|hello|hey|heya|hiya|howdy|yo|good\s+(morning|afternoon|evening|day)|greetings)[\s!.,?]*$",
    )
    .expect("greeting regex")
});

/// Classify a query. Deterministic, no I/O.
pub fn classify(query: &str) -> Route {
    if GREETING.is_match(query.trim()) {
        Route::Greeting
    } else {
        Route::Vector
    }
}

/// The canned greeting reply. Begins with "Hello" so widget smoke tests can
/// assert on it.
pub const GREETING_REPLY: &str =
    "Hello! How can I help you today? Ask me anything about our products and services.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_greetings_are_greetings() {
        for q in ["hi", "Hello", "HEY", "hello!!", "good morning", "Howdy.", "yo"] {
            assert_eq!(classify(q), Route::Greeting, "{q}");
        }
    }

    #[test]
    fn questions_take_the_vector_path() {
        for q in [
            "hi, what is your refund policy?",
            "What is your refund window?",
            "hello I need help with my payment",
            "my login is broken",
        ] {
            assert_eq!(classify(q), Route::Vector, "{q}");
        }
    }

    #[test]
    fn greeting_reply_starts_with_hello() {
        assert!(GREETING_REPLY.starts_with("Hello"));
    }
}
