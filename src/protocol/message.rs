//! Message codec: the plain frame body is a flat key/value encoding,
//! interpreted as a multimap `{bytes -> list<bytes>}`.
//!
//! Wire layout of one key/value pair (repeated until the body is
//! exhausted): `u8 key_len || key_len bytes of key || u32 BE value_len ||
//! value_len bytes of value`. This layout has no surviving reference
//! implementation to match against; see DESIGN.md for the reasoning.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Data,
    Delete,
    Heartbeat,
}

impl Action {
    pub fn byte(self) -> u8 {
        match self {
            Action::Create => 0x00,
            Action::Data => 0x01,
            Action::Delete => 0x02,
            Action::Heartbeat => 0x03,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Action::Create),
            0x01 => Some(Action::Data),
            0x02 => Some(Action::Delete),
            0x03 => Some(Action::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("truncated key/value entry in message body")]
    Truncated,
    #[error("message is missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("message has no action byte, or an unrecognized one: {0:?}")]
    BadAction(Option<u8>),
}

/// A key/value multimap, preserving insertion order for stable encoding.
#[derive(Debug, Clone, Default)]
pub struct Message {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Message {
    pub fn new(action: Action) -> Self {
        let mut msg = Self::default();
        msg.insert("ac", &[action.byte()]);
        msg
    }

    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push((key.as_ref().to_vec(), value.into()));
        self
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        let key = key.as_ref();
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.as_slice())
    }

    /// All values for `key`, in insertion order.
    pub fn get_all(&self, key: impl AsRef<[u8]>) -> Vec<&[u8]> {
        let key = key.as_ref();
        self.entries
            .iter()
            .filter(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    pub fn action(&self) -> Result<Action, MessageError> {
        let byte = self.get("ac").and_then(|v| v.first().copied());
        byte.and_then(Action::from_byte).ok_or(MessageError::BadAction(byte))
    }

    pub fn require(&self, key: &'static str) -> Result<&[u8], MessageError> {
        self.get(key).ok_or(MessageError::MissingKey(key))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            out.push(key.len() as u8);
            out.extend_from_slice(key);
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, MessageError> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < body.len() {
            let key_len = *body.get(pos).ok_or(MessageError::Truncated)? as usize;
            pos += 1;
            let key = body.get(pos..pos + key_len).ok_or(MessageError::Truncated)?;
            pos += key_len;

            let len_bytes: [u8; 4] = body
                .get(pos..pos + 4)
                .ok_or(MessageError::Truncated)?
                .try_into()
                .map_err(|_| MessageError::Truncated)?;
            pos += 4;
            let value_len = u32::from_be_bytes(len_bytes) as usize;
            let value = body.get(pos..pos + value_len).ok_or(MessageError::Truncated)?;
            pos += value_len;

            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(Self { entries })
    }

    /// Collapses to `{key -> list<value>}`, for callers that want the
    /// multimap view directly.
    pub fn to_multimap(&self) -> HashMap<Vec<u8>, Vec<Vec<u8>>> {
        let mut map: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        for (k, v) in &self.entries {
            map.entry(k.clone()).or_default().push(v.clone());
        }
        map
    }
}

/// Builds a CREATE message: `id`, `h` (host), `p` (u16 BE port), `r` (redirect).
pub fn build_create(id: &str, host: &str, port: u16, redirect: &str) -> Message {
    let mut msg = Message::new(Action::Create);
    msg.insert("id", id.as_bytes())
        .insert("h", host.as_bytes())
        .insert("p", port.to_be_bytes().to_vec())
        .insert("r", redirect.as_bytes());
    msg
}

/// Builds a DATA message: `id`, `dt` (payload), `r`.
pub fn build_data(id: &str, payload: &[u8], redirect: &str) -> Message {
    let mut msg = Message::new(Action::Data);
    msg.insert("id", id.as_bytes())
        .insert("dt", payload)
        .insert("r", redirect.as_bytes());
    msg
}

/// Builds a DELETE message: `id`, `r`.
pub fn build_delete(id: &str, redirect: &str) -> Message {
    let mut msg = Message::new(Action::Delete);
    msg.insert("id", id.as_bytes()).insert("r", redirect.as_bytes());
    msg
}

/// Builds a HEARTBEAT message: `id`, `r`.
pub fn build_heartbeat(id: &str, redirect: &str) -> Message {
    let mut msg = Message::new(Action::Heartbeat);
    msg.insert("id", id.as_bytes()).insert("r", redirect.as_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_message_round_trips_through_the_wire() {
        let msg = build_create("abcd1234", "example.com", 443, "");
        let wire = msg.encode();
        let decoded = Message::decode(&wire).unwrap();

        assert_eq!(decoded.action().unwrap(), Action::Create);
        assert_eq!(decoded.require("id").unwrap(), b"abcd1234");
        assert_eq!(decoded.require("h").unwrap(), b"example.com");
        assert_eq!(decoded.require("p").unwrap(), &443u16.to_be_bytes());
        assert_eq!(decoded.require("r").unwrap(), b"");
    }

    #[test]
    fn data_message_preserves_arbitrary_binary_payload() {
        let payload = &[0u8, 1, 2, 255, 254, 0, 10, 13];
        let msg = build_data("streamid", payload, "http://redir/");
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.action().unwrap(), Action::Data);
        assert_eq!(decoded.require("dt").unwrap(), payload);
    }

    #[test]
    fn unknown_action_byte_is_rejected() {
        let mut msg = Message::default();
        msg.insert("ac", &[0xEE]);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert!(matches!(decoded.action(), Err(MessageError::BadAction(Some(0xEE)))));
    }

    #[test]
    fn missing_action_is_rejected() {
        let msg = Message::default();
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert!(matches!(decoded.action(), Err(MessageError::BadAction(None))));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let msg = build_delete("id", "");
        let mut wire = msg.encode();
        wire.truncate(wire.len() - 2);
        assert!(matches!(Message::decode(&wire), Err(MessageError::Truncated)));
    }

    #[test]
    fn create_ack_status_byte_is_readable() {
        let mut msg = Message::new(Action::Create);
        msg.insert("s", &[0x00]);
        assert_eq!(msg.require("s").unwrap(), &[0x00]);
    }
}
