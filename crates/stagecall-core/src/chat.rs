use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Reaction,
    System,
}

/// A chat line as relayed by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "roomId", default)]
    pub room_id: String,
    #[serde(rename = "userId", alias = "senderId")]
    pub sender_id: String,
    #[serde(rename = "userName", alias = "senderName", default)]
    pub sender_name: String,
    #[serde(rename = "content", alias = "text")]
    pub text: String,
    #[serde(rename = "timestamp", default, deserialize_with = "timestamp::deserialize")]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub kind: MessageKind,
}

/// Server timestamps arrive either as epoch milliseconds or RFC 3339 text.
mod timestamp {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(ms),
            Raw::Text(text) => chrono::DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.timestamp_millis().max(0) as u64)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// In-memory chat buffer for the current room.
///
/// Arrival order is preserved as delivered. Live messages that arrive before
/// the one-time history replay are held back and appended after it.
#[derive(Debug, Default)]
pub struct ChatLog {
    room_id: Option<String>,
    messages: Vec<ChatMessage>,
    history_loaded: bool,
    deferred: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh buffer for `room_id`, waiting on its history replay.
    pub fn open(&mut self, room_id: &str) {
        self.room_id = Some(room_id.to_string());
        self.messages.clear();
        self.deferred.clear();
        self.history_loaded = false;
    }

    pub fn is_awaiting_history(&self) -> bool {
        self.room_id.is_some() && !self.history_loaded
    }

    /// Apply the history replay. Returns every message that became visible,
    /// history first, then any live messages that were held back.
    pub fn apply_history(&mut self, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if self.room_id.is_none() {
            tracing::debug!("chat history ignored: not in a room");
            return Vec::new();
        }
        if self.history_loaded {
            tracing::warn!("duplicate chat history replay ignored");
            return Vec::new();
        }
        self.history_loaded = true;
        let mut visible = history;
        visible.append(&mut self.deferred);
        self.messages.extend(visible.iter().cloned());
        visible
    }

    /// Stop waiting for a history replay that never came.
    pub fn finish_history_wait(&mut self) -> Vec<ChatMessage> {
        if !self.is_awaiting_history() {
            return Vec::new();
        }
        self.history_loaded = true;
        let released = std::mem::take(&mut self.deferred);
        self.messages.extend(released.iter().cloned());
        released
    }

    /// Append a live message. Returns it if it is visible now.
    pub fn push_live(&mut self, msg: ChatMessage) -> Option<ChatMessage> {
        let Some(room_id) = self.room_id.as_deref() else {
            tracing::debug!("chat message {} dropped: not in a room", msg.id);
            return None;
        };
        if !msg.room_id.is_empty() && msg.room_id != room_id {
            tracing::debug!("chat message for room {} dropped", msg.room_id);
            return None;
        }
        if !self.history_loaded {
            self.deferred.push(msg);
            return None;
        }
        self.messages.push(msg.clone());
        Some(msg)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.room_id = None;
        self.messages.clear();
        self.deferred.clear();
        self.history_loaded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            room_id: "R1".to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Alice".to_string(),
            text: text.to_string(),
            timestamp_ms: 0,
            kind: MessageKind::Text,
        }
    }

    fn ids(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn history_then_live_keeps_live_last() {
        let mut log = ChatLog::new();
        log.open("R1");
        log.apply_history(vec![msg("h1", "a"), msg("h2", "b"), msg("h3", "c")]);
        assert!(log.push_live(msg("l1", "d")).is_some());
        assert_eq!(ids(log.messages()), ["h1", "h2", "h3", "l1"]);
    }

    #[test]
    fn live_before_history_is_held_back() {
        let mut log = ChatLog::new();
        log.open("R1");
        assert!(log.push_live(msg("l1", "early")).is_none());
        let visible = log.apply_history(vec![msg("h1", "old")]);
        assert_eq!(ids(&visible), ["h1", "l1"]);
        assert_eq!(ids(log.messages()), ["h1", "l1"]);
    }

    #[test]
    fn history_wait_timeout_releases_held_messages() {
        let mut log = ChatLog::new();
        log.open("R1");
        log.push_live(msg("l1", "x"));
        assert_eq!(ids(&log.finish_history_wait()), ["l1"]);
        assert!(log.apply_history(vec![msg("h1", "late")]).is_empty());
        assert_eq!(ids(log.messages()), ["l1"]);
    }

    #[test]
    fn messages_for_other_rooms_are_dropped() {
        let mut log = ChatLog::new();
        log.open("R1");
        log.apply_history(Vec::new());
        let mut other = msg("x", "elsewhere");
        other.room_id = "R2".to_string();
        assert!(log.push_live(other).is_none());
        assert!(log.messages().is_empty());
    }

    #[test]
    fn parses_server_message_with_iso_timestamp() {
        let json = r#"{"id":"m1","roomId":"R1","userId":"u1","userName":"Alice","content":"hi","timestamp":"2024-05-01T12:00:00.000Z"}"#;
        let parsed: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.text, "hi");
        assert_eq!(parsed.timestamp_ms, 1_714_564_800_000);
        assert_eq!(parsed.kind, MessageKind::Text);
    }

    #[test]
    fn parses_numeric_timestamp_and_reaction_kind() {
        let json = r#"{"userId":"u2","content":"🔥","timestamp":1700000000000,"kind":"reaction"}"#;
        let parsed: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.timestamp_ms, 1_700_000_000_000);
        assert_eq!(parsed.kind, MessageKind::Reaction);
        assert!(parsed.sender_name.is_empty());
    }
}
