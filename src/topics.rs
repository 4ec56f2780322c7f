//! Topic name, topic filter and client id validation
//!
//! Publish topics are concrete names; subscriptions take filters that may
//! use the `+` (single level) and `#` (multi level, last position only)
//! wildcards.

use thiserror::Error;

/// Validation errors for topics and client ids
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Publish topic cannot contain wildcard '{0}'")]
    WildcardInTopic(char),
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Invalid wildcard placement in filter '{0}'")]
    InvalidWildcard(String),
    #[error("Client ID cannot be empty")]
    EmptyClientId,
    #[error("Client ID contains invalid character: '{0}'")]
    InvalidClientIdChar(char),
}

/// Check a concrete topic name used for publishing
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    if let Some(ch) = topic.chars().find(|c| *c == '+' || *c == '#') {
        return Err(TopicError::WildcardInTopic(ch));
    }
    Ok(())
}

/// Check a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NulCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i == levels.len() - 1;
        match *level {
            "#" if is_last => {}
            "+" => {}
            other if other.contains('#') || other.contains('+') => {
                return Err(TopicError::InvalidWildcard(filter.to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// rest (including the parent level itself)
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Client ids are restricted to `[a-zA-Z0-9._-]+`
pub fn validate_client_id(client_id: &str) -> Result<(), TopicError> {
    if client_id.is_empty() {
        return Err(TopicError::EmptyClientId);
    }

    for ch in client_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(TopicError::InvalidClientIdChar(ch));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_publish_topic_examples() {
        assert!(validate_publish_topic("ha/cluster/test").is_ok());
        assert!(validate_publish_topic("x/y").is_ok());
        assert!(validate_publish_topic("/leading/slash").is_ok());

        assert_eq!(validate_publish_topic(""), Err(TopicError::Empty));
        assert_eq!(
            validate_publish_topic("ha/+/test"),
            Err(TopicError::WildcardInTopic('+'))
        );
        assert_eq!(
            validate_publish_topic("ha/#"),
            Err(TopicError::WildcardInTopic('#'))
        );
    }

    #[test]
    fn test_topic_filter_examples() {
        assert!(validate_topic_filter("ha/cluster/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+/status/+").is_ok());
        assert!(validate_topic_filter("sensors/temp").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("ha/#/test").is_err());
        assert!(validate_topic_filter("ha/cl#").is_err());
        assert!(validate_topic_filter("ha/cl+uster").is_err());
    }

    #[test]
    fn test_topic_matches_filter() {
        assert!(topic_matches_filter("ha/cluster/#", "ha/cluster/test"));
        assert!(topic_matches_filter("ha/cluster/#", "ha/cluster/a/b"));
        assert!(topic_matches_filter("ha/cluster/#", "ha/cluster"));
        assert!(topic_matches_filter("#", "anything/at/all"));
        assert!(topic_matches_filter("+/status", "node1/status"));
        assert!(topic_matches_filter("x/y", "x/y"));

        assert!(!topic_matches_filter("x/y", "x/y/z"));
        assert!(!topic_matches_filter("+/status", "node1/load"));
        assert!(!topic_matches_filter("ha/+", "ha/a/b"));
        assert!(!topic_matches_filter("ha/cluster/#", "other/cluster/test"));
    }

    #[test]
    fn test_client_id_examples() {
        assert!(validate_client_id("ha-publisher").is_ok());
        assert!(validate_client_id("node_1.test").is_ok());

        assert_eq!(validate_client_id(""), Err(TopicError::EmptyClientId));
        assert_eq!(
            validate_client_id("bad id"),
            Err(TopicError::InvalidClientIdChar(' '))
        );
        assert_eq!(
            validate_client_id("bad/id"),
            Err(TopicError::InvalidClientIdChar('/'))
        );
    }

    proptest! {
        #[test]
        fn every_valid_publish_topic_is_a_valid_filter(topic in "[a-z0-9/]{1,40}") {
            prop_assert!(validate_publish_topic(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
        }

        #[test]
        fn topic_matches_itself_and_hash(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(topic_matches_filter(&topic, &topic));
            prop_assert!(topic_matches_filter("#", &topic));
        }

        #[test]
        fn valid_client_ids_pass(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_client_id(&id).is_ok());
        }
    }
}
