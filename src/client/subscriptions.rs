//! Ordered set of topic filters the caller asked for
//!
//! The registry is the source of truth for subscriptions; brokers are told
//! about it again after every (re)connection.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    filters: Vec<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter, returning false if it was already registered
    pub fn add(&mut self, filter: &str) -> bool {
        if self.contains(filter) {
            return false;
        }
        self.filters.push(filter.to_string());
        true
    }

    /// Remove a filter, returning false if it was not registered
    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f != filter);
        self.filters.len() != before
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.iter().any(|f| f == filter)
    }

    /// Filters in registration order
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
