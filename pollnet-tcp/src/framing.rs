//! Message framing hooks.
//!
//! A link knows nothing about headers or checksums. It asks its [`Framing`]
//! how many bytes are still missing, whether the header has arrived and is
//! sane, and whether the message is complete.
//!
//! [`RawSegment`] is the default: every successful read is one message.

use pollnet_core::message::Message;

/// Framing rules for one wire protocol.
///
/// All hooks look at the bytes written so far (`msg.as_slice()`).
pub trait Framing: Send + Sync + 'static {
    /// Whether `msg` holds one whole message.
    fn is_message_complete(&self, msg: &Message) -> bool {
        !msg.is_empty()
    }

    /// Whether enough bytes arrived to validate the header.
    fn is_header_complete(&self, msg: &Message) -> bool {
        !msg.is_empty()
    }

    /// Header sanity check, consulted once the header is complete.
    fn is_header_ok(&self, _msg: &Message) -> bool {
        true
    }

    /// Bytes still needed before the message is complete (or, before the
    /// header is complete, before the header is).
    fn missing_length(&self, msg: &Message) -> usize {
        msg.remaining()
    }

    /// Last chance to reject an outbound message before it is finalized and
    /// written. Rejected messages are released.
    fn on_send_check(&self, _msg: &Message) -> bool {
        true
    }
}

/// No framing: whatever one read returns is a message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSegment;

impl Framing for RawSegment {}
