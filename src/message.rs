//! Module that contains the message envelope exchanged between processors and central managers.

use color_print::cformat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Enum that represents every kind of message sent in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ReadRequest,
    WriteRequest,
    ReadForward,
    PageCopyForward,
    ReadConfirmation,
    InvalidateCopy,
    InvalidateConfirmation,
    WriteForward,
    PageToWrite,
    WriteConfirmation,
    PageNotFound,
    ForwardState,
    Elect,
    AnnouncePrimary,
    StartElection,
    Acknowledge,
    CheckAlive,
}

/// Struct that represents the envelope of every message.
///
/// `sender` is a processor id for requests and peer-to-peer traffic, and a
/// CM id for `ACKNOWLEDGE`, `ANNOUNCE_PRIMARY` and `FORWARD_STATE`. Forwards
/// from the CM to an owner carry the id of the processor that asked.
///
/// `content` is the request id on `READ_REQUEST`/`WRITE_REQUEST`, growing with
/// every request of the sender, the page data on page transfers, and `1` on
/// an `ACKNOWLEDGE` from a CM holding a current replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: usize,
    pub r#type: MessageType,
    pub page_id: usize,
    pub content: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl MessageType {
    /// Function that returns the wire name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadRequest => "READ_REQUEST",
            Self::WriteRequest => "WRITE_REQUEST",
            Self::ReadForward => "READ_FORWARD",
            Self::PageCopyForward => "PAGE_COPY_FORWARD",
            Self::ReadConfirmation => "READ_CONFIRMATION",
            Self::InvalidateCopy => "INVALIDATE_COPY",
            Self::InvalidateConfirmation => "INVALIDATE_CONFIRMATION",
            Self::WriteForward => "WRITE_FORWARD",
            Self::PageToWrite => "PAGE_TO_WRITE",
            Self::WriteConfirmation => "WRITE_CONFIRMATION",
            Self::PageNotFound => "PAGE_NOT_FOUND",
            Self::ForwardState => "FORWARD_STATE",
            Self::Elect => "ELECT",
            Self::AnnouncePrimary => "ANNOUNCE_PRIMARY",
            Self::StartElection => "START_ELECTION",
            Self::Acknowledge => "ACKNOWLEDGE",
            Self::CheckAlive => "CHECK_ALIVE",
        }
    }

    /// Function that tells if the message type is a page request admitted into a CM queue.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::ReadRequest | Self::WriteRequest)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    /// Function that creates a message without content or state.
    pub fn new(sender: usize, r#type: MessageType, page_id: usize) -> Self {
        Self {
            sender,
            r#type,
            page_id,
            content: 0,
            state: None,
        }
    }

    /// Function that creates a control message that is not about a page.
    pub fn control(sender: usize, r#type: MessageType) -> Self {
        Self::new(sender, r#type, 0)
    }

    pub fn with_content(mut self, content: i64) -> Self {
        self.content = content;
        self
    }

    pub fn with_state(mut self, state: String) -> Self {
        self.state = Some(state);
        self
    }

    /// Function that tells if two requests are the same admission `(sender, type, page)`.
    pub fn same_request(&self, other: &Message) -> bool {
        self.sender == other.sender && self.r#type == other.r#type && self.page_id == other.page_id
    }

    /// Function that returns a colored one-line description used in logs.
    pub fn describe(&self) -> String {
        cformat!(
            "<bold>{}</bold> from <bold>{}</bold> for page <bold>{}</bold>",
            self.r#type,
            self.sender,
            self.page_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_the_protocol_vocabulary() {
        let json =
            serde_json::to_string(&Message::new(3, MessageType::InvalidateConfirmation, 1)).unwrap();
        assert!(json.contains("\"INVALIDATE_CONFIRMATION\""));
        assert!(!json.contains("state"));
        assert_eq!(MessageType::PageCopyForward.to_string(), "PAGE_COPY_FORWARD");
    }

    #[test]
    fn state_blob_survives_the_wire() {
        let msg = Message::control(2, MessageType::ForwardState).with_state("{\"x\":1}".into());
        let parsed: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn same_request_ignores_content() {
        let a = Message::new(1, MessageType::WriteRequest, 4).with_content(1);
        let b = Message::new(1, MessageType::WriteRequest, 4).with_content(9);
        let c = Message::new(1, MessageType::ReadRequest, 4);
        assert!(a.same_request(&b));
        assert!(!a.same_request(&c));
        assert!(a.r#type.is_request());
        assert!(!MessageType::Elect.is_request());
    }
}
