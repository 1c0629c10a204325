//! Topic naming.
//!
//! Every message type gets its own topic, optionally prefixed with an
//! environment tag so several deployments can share one broker.

use uuid::Uuid;

/// Kafka's topic-name ceiling.
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 249;

/// Map a message type identifier to its topic.
///
/// `environment_typeIdentifier` when an environment is set, otherwise the bare
/// identifier, truncated to `max_length` characters.
pub fn topic_name(type_identifier: &str, environment: Option<&str>, max_length: usize) -> String {
    let full = match environment {
        Some(env) if !env.is_empty() => format!("{}_{}", env, type_identifier),
        _ => type_identifier.to_string(),
    };
    truncate(full, max_length)
}

/// Shortest `max_topic_length` that still fits a whole reply topic id.
pub const MIN_TOPIC_LENGTH: usize = 32;

/// Build a private reply topic for one dispatcher instance.
///
/// `{env}__replies.{uuid}.{service}` when it fits. Otherwise the service tag
/// is dropped and the prefix shortened so the 32-character uuid always stays
/// whole, which keeps two instances from sharing a reply topic.
pub fn reply_topic_name(service: Option<&str>, environment: Option<&str>, max_length: usize) -> String {
    let service = service.filter(|s| !s.is_empty()).unwrap_or("bus");
    let id = Uuid::new_v4().simple().to_string();
    let prefix = topic_name("_replies.", environment, usize::MAX);
    let head = truncate(prefix, max_length.saturating_sub(id.len()));

    let name = format!("{}{}", head, id);
    let tagged = format!("{}.{}", name, service);
    if tagged.chars().count() <= max_length {
        tagged
    } else {
        truncate(name, max_length)
    }
}

fn truncate(mut name: String, max_length: usize) -> String {
    if let Some((idx, _)) = name.char_indices().nth(max_length) {
        name.truncate(idx);
    }
    name
}
