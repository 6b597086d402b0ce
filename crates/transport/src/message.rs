use std::borrow::Cow;

/// Raw payload of one inbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Immutable wrapper around one inbound frame, exposing the payload
/// uniformly as text or bytes regardless of the native framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Payload,
}

impl Message {
    pub fn text(content: impl Into<String>) -> Self {
        Self { payload: Payload::Text(content.into()) }
    }

    pub fn binary(content: impl Into<Vec<u8>>) -> Self {
        Self { payload: Payload::Binary(content.into()) }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.payload, Payload::Binary(_))
    }

    /// The payload viewed as text. Binary frames are decoded lossily so
    /// that hooks logging or routing on text never have to branch.
    pub fn as_text(&self) -> Cow<'_, str> {
        match &self.payload {
            Payload::Text(text) => Cow::Borrowed(text),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    /// The payload viewed as bytes, text frames included.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        Self { payload }
    }
}

#[cfg(test)]
mod tests {
    use super::Message;

    #[test]
    fn text_frame_exposes_both_views() {
        let message = Message::text("hello");
        assert!(!message.is_binary());
        assert_eq!(message.as_text(), "hello");
        assert_eq!(message.as_bytes(), b"hello");
    }

    #[test]
    fn binary_frame_exposes_both_views() {
        let message = Message::binary(vec![0x68, 0x69]);
        assert!(message.is_binary());
        assert_eq!(message.as_text(), "hi");
        assert_eq!(message.as_bytes(), &[0x68, 0x69]);
    }

    #[test]
    fn non_utf8_binary_decodes_lossily() {
        let message = Message::binary(vec![0xff, 0xfe]);
        assert_eq!(message.as_text(), "\u{fffd}\u{fffd}");
        assert_eq!(message.as_bytes(), &[0xff, 0xfe]);
    }
}
