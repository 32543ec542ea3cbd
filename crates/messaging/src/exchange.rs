//! Exchange kinds and routing-key matching.

use serde::{Deserialize, Serialize};

/// How an exchange picks the queues a message is copied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Binding patterns are matched word by word (`*` one word, `#` zero or more).
    Topic,
    /// Every bound queue gets every message.
    Fanout,
    /// Binding key must equal the routing key.
    Direct,
}

impl ExchangeKind {
    pub fn routes(&self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
        }
    }
}

/// Matches a routing key against an AMQP topic binding pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            // `#` swallows zero words, or one word and stays in place.
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && match_words(rest, key_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_single_word_wildcard() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.cancelled"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(!topic_matches("order.*", "order"));
    }

    #[test]
    fn test_multi_word_wildcard() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("#.failed", "payment.failed"));
        assert!(topic_matches("*.#.failed", "payment.card.failed"));
        assert!(!topic_matches("#.failed", "payment.completed"));
    }

    #[test]
    fn test_exchange_kinds() {
        assert!(ExchangeKind::Fanout.routes("", "whatever"));
        assert!(ExchangeKind::Direct.routes("inventory.reserve", "inventory.reserve"));
        assert!(!ExchangeKind::Direct.routes("inventory.*", "inventory.reserve"));
        assert!(ExchangeKind::Topic.routes("inventory.*", "inventory.reserve"));
    }
}
