use std::collections::HashSet;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::Packet;

use super::cursor::BackendId;

/// Classification of a backend reply by its head packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    Ok,
    Err,
    Eof,
}

impl ReplyType {
    /// Classify by the first payload byte. Anything that is not an ERR or a
    /// short EOF carries a success head (OK, or the column-count head of a
    /// result set).
    pub fn classify(head: &Packet) -> Self {
        match head.payload.first() {
            Some(&0xFF) => ReplyType::Err,
            Some(&0xFE) if head.payload.len() < 9 => ReplyType::Eof,
            _ => ReplyType::Ok,
        }
    }
}

/// One backend's complete reply to a session command.
#[derive(Debug, Clone)]
pub struct Reply {
    pub packets: Vec<Packet>,
    pub reply_type: ReplyType,
}

impl Reply {
    pub fn new(packets: Vec<Packet>) -> Self {
        let reply_type = packets
            .first()
            .map(ReplyType::classify)
            .unwrap_or(ReplyType::Eof);
        Self {
            packets,
            reply_type,
        }
    }

    pub fn is_err(&self) -> bool {
        self.reply_type == ReplyType::Err
    }
}

/// A journaled session-modifying command.
///
/// Immutable once appended, except for the reply bookkeeping behind its own
/// lock. The list lock is never required to update bookkeeping once a
/// reference to the command is held (lock order: list, then command).
#[derive(Debug)]
pub struct SessionCommand {
    id: u64,
    opcode: u8,
    payload: Bytes,
    pub(super) reply: Mutex<ReplyState>,
}

#[derive(Debug, Default)]
pub(super) struct ReplyState {
    /// Backends whose reply is still outstanding.
    pub pending: HashSet<BackendId>,
    pub n_replied: u32,
    /// Whether the canonical reply has been forwarded to the client.
    pub reply_sent: bool,
    pub reply_type: Option<ReplyType>,
    /// The reply selected for the client under the configured semantics.
    pub canonical: Option<Reply>,
    /// Most recent reply, for `ReplyOn::Last`.
    pub latest: Option<Reply>,
    /// First error seen, for `ReplyOn::AllOk` synthesis.
    pub first_err: Option<Reply>,
}

impl SessionCommand {
    pub(super) fn new(id: u64, payload: Bytes, expected: HashSet<BackendId>) -> Self {
        let opcode = payload.first().copied().unwrap_or(0);
        Self {
            id,
            opcode,
            payload,
            reply: Mutex::new(ReplyState {
                pending: expected,
                ..ReplyState::default()
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn n_replied(&self) -> u32 {
        self.reply.lock().n_replied
    }

    pub fn reply_sent(&self) -> bool {
        self.reply.lock().reply_sent
    }

    pub fn reply_type(&self) -> Option<ReplyType> {
        self.reply.lock().reply_type
    }

    /// The reply selected for forwarding, once determined.
    pub fn canonical_reply(&self) -> Option<Reply> {
        self.reply.lock().canonical.clone()
    }

    /// All expected replies received and the canonical one chosen.
    pub(super) fn is_retired(&self) -> bool {
        let state = self.reply.lock();
        state.reply_sent && state.pending.is_empty()
    }
}
