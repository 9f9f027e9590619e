//! Wire event vocabulary.
//!
//! Every frame on the client channel is a JSON object with a `type` field.
//! Signal blobs are opaque: the server validates outer shape only and relays
//! the inner object verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → server events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    Join,
    Next,
    Leave,
    Signal { peer: String, signal: Value },
    Report { peer: String, reason: String },
}

/// Server → client events.
///
/// `Deserialize` is derived as well because these cross the pub/sub bus when
/// the target connection lives on another instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    Waiting,
    Paired { peer: String, initiator: bool },
    Signal { peer: String, signal: Value },
    PartnerDisconnected,
    Left,
    Error { message: String },
    Banned { reason: String },
    ReportSubmitted { success: bool },
}

/// A server event addressed to a single connection, as carried on the
/// `deliver` bus channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub target: String,
    pub event: ServerEvent,
}
