use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Counter(usize),
    Value(Value),
}

/// Graph-scoped auxiliary state, keyed by the owning protocol's attachment name.
#[derive(Debug, Clone, Default)]
pub struct Attachments {
    entries: HashMap<String, Attachment>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Attachment> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, attachment: Attachment) -> Option<Attachment> {
        self.entries.insert(key.into(), attachment)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn counter(&self, key: &str) -> Option<usize> {
        match self.entries.get(key) {
            Some(Attachment::Counter(x)) => Some(*x),
            _ => None,
        }
    }

    /// Returns 0 the first time a key is seen, then 1, 2, ...
    pub fn next_index(&mut self, key: &str) -> usize {
        let next = match self.entries.get(key) {
            Some(Attachment::Counter(x)) => x + 1,
            _ => 0,
        };
        self.entries.insert(key.to_string(), Attachment::Counter(next));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_index_starts_at_zero_per_key() {
        let mut attachments = Attachments::new();
        assert_eq!(attachments.next_index("a"), 0);
        assert_eq!(attachments.next_index("a"), 1);
        assert_eq!(attachments.next_index("b"), 0);
        assert_eq!(attachments.counter("a"), Some(1));
        assert!(!attachments.contains("c"));
    }
}
