use gridwatch_common::domain::{DomainError, DomainResult};

/// Topic suffixes the device publishes telemetry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicLeaf {
    Data,
    GetReply,
    SetReply,
}

impl TopicLeaf {
    fn from_segment(segment: &str) -> DomainResult<Self> {
        match segment {
            "data" => Ok(TopicLeaf::Data),
            "get_reply" => Ok(TopicLeaf::GetReply),
            "set_reply" => Ok(TopicLeaf::SetReply),
            other => Err(DomainError::UnknownTopicLeaf(other.to_string())),
        }
    }
}

/// Parsed inbound topic `{base}/{serial}/{leaf}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTopic {
    pub serial: String,
    pub leaf: TopicLeaf,
}

/// Parse an inbound device topic against the configured base.
///
/// The base may itself contain slashes, so the topic is matched by prefix
/// rather than split blindly.
pub fn parse_topic(topic: &str, base: &str) -> DomainResult<ParsedTopic> {
    let remainder = topic
        .strip_prefix(base)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| {
            DomainError::InvalidTopic(format!(
                "topic '{}' does not start with base '{}'",
                topic, base
            ))
        })?;

    let parts: Vec<&str> = remainder.split('/').collect();
    if parts.len() != 2 {
        return Err(DomainError::InvalidTopic(format!(
            "topic '{}': expected '{{base}}/{{serial}}/{{leaf}}'",
            topic
        )));
    }

    let serial = parts[0].trim();
    if serial.is_empty() {
        return Err(DomainError::InvalidTopic(
            "device serial cannot be empty in topic".to_string(),
        ));
    }

    Ok(ParsedTopic {
        serial: serial.to_string(),
        leaf: TopicLeaf::from_segment(parts[1])?,
    })
}
