use serde::{Deserialize, Serialize};

/// The unit of work flowing through the queue.
///
/// Serialized with camelCase field names - the same JSON shape the producer
/// enqueues and the downstream processing endpoint expects, so the envelope
/// crosses both boundaries without re-mapping. The envelope is immutable once
/// enqueued; the worker only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Conversation/session the task belongs to
    pub session_id: String,

    /// Originating user
    pub user_id: String,

    /// Message this task processes
    pub message_id: String,

    /// Payload content to be processed downstream
    pub message: String,

    /// Producer-side creation time (ISO-8601). Kept as a string and passed
    /// through unmodified - never parsed or re-serialized by the relay.
    pub timestamp: String,
}

impl TaskEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        message_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            message_id: message_id.into(),
            message: message.into(),
            timestamp: timestamp.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_camel_case() {
        let envelope = TaskEnvelope::new("s1", "u1", "m1", "hello", "2025-01-01T00:00:00Z");

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["timestamp"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn test_timestamp_passes_through_unmodified() {
        // Non-canonical but valid ISO-8601 input must survive a round trip
        let envelope = TaskEnvelope::new("s1", "u1", "m1", "hi", "2025-01-01T00:00:00.000+02:00");

        let json = serde_json::to_string(&envelope).unwrap();
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timestamp, "2025-01-01T00:00:00.000+02:00");
    }
}
