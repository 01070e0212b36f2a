//! Subscription intent, kept independent of what the broker currently knows.
//!
//! The registry lives inside the connection manager's state lock. Callers mutate
//! it through `subscribe`/`unsubscribe`, the reconnect path only ever reads a
//! [`SubscriptionRegistry::snapshot`] so it never iterates a set that another
//! caller is changing.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    topics: BTreeSet<String>,
}

impl SubscriptionRegistry {
    /// Returns false when the filter was already registered.
    pub fn add(&mut self, topic: &str) -> bool {
        self.topics.insert(topic.to_string())
    }

    /// Returns false when the filter was not registered.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.topics.clone()
    }
}

/// Checks a publish topic: non-empty, no wildcards, no NUL.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

/// Checks a subscription filter.
///
/// `+` has to fill a whole level, `#` has to fill the last level.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(idx, level)| match *level {
        "#" => idx == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}
