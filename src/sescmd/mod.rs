//! Session command journal.
//!
//! Session-modifying commands (`SET`, `USE`, prepared-statement registration,
//! ...) must reach every backend of a session, including backends that attach
//! after the command was issued. The list keeps the ordered journal, one
//! cursor per attached backend, and reconciles the fan-out of replies into
//! the single reply the client sees.

mod command;
mod cursor;
mod semantics;

pub use command::{Reply, ReplyType, SessionCommand};
pub use cursor::{Attach, BackendId};
pub use semantics::{CapacityPolicy, MustReply, OnError, Properties, ReplyOn, Semantics};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use command::ReplyState;
use cursor::{CommandRef, CursorState};

/// Session command list errors
#[derive(Debug, thiserror::Error)]
pub enum SescmdError {
    #[error("session command list at capacity ({max_len})")]
    CapacityExceeded { max_len: usize },

    #[error("session poisoned by divergent backend reply")]
    Poisoned,

    #[error("{0} has no cursor on this list")]
    UnknownBackend(BackendId),

    #[error("{0} has no command pending a reply")]
    NoPendingCommand(BackendId),
}

/// Outcome of accounting one backend reply.
#[derive(Debug, Default)]
pub struct Advance {
    /// Canonical reply to forward to the client now, if this reply decided it.
    pub forward: Option<Reply>,
    /// The reply diverged from an already-forwarded canonical reply and the
    /// list is configured to abort: the session must be closed.
    pub poisoned: bool,
    /// The cursor finished replaying and the backend may serve live queries.
    pub became_live: bool,
}

struct Slot {
    generation: u32,
    cmd: Option<Arc<SessionCommand>>,
}

struct ListInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Live commands in append (= id) order.
    order: VecDeque<CommandRef>,
    cursors: HashMap<BackendId, CursorState>,
}

/// The ordered, append-only journal of session-modifying commands.
///
/// All structural state sits behind one mutex; per-command reply bookkeeping
/// has its own lock on the command. Lock order is list first, command second,
/// never the other way. Command ids come from an atomic counter so they never
/// regress even off the lock.
pub struct SessionCommandList {
    semantics: Semantics,
    properties: Properties,
    next_id: AtomicU64,
    poisoned: AtomicBool,
    inner: Mutex<ListInner>,
}

impl SessionCommandList {
    pub fn new(semantics: Semantics, properties: Properties) -> Self {
        Self {
            semantics,
            properties,
            next_id: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            inner: Mutex::new(ListInner {
                slots: Vec::new(),
                free: Vec::new(),
                order: VecDeque::new(),
                cursors: HashMap::new(),
            }),
        }
    }

    /// Number of retained commands.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    pub fn cursor_count(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    /// A divergent reply aborted the session; no further appends are allowed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Append a command at the tail and register every live cursor as an
    /// expected replier.
    pub fn append(&self, payload: Bytes) -> Result<Arc<SessionCommand>, SescmdError> {
        if self.is_poisoned() {
            return Err(SescmdError::Poisoned);
        }

        let mut inner = self.inner.lock();

        let max_len = self.properties.max_len;
        if max_len > 0 && inner.order.len() >= max_len {
            match self.properties.on_capacity {
                CapacityPolicy::DropFirst => {
                    Self::evict_down_to(&mut inner, max_len.saturating_sub(1));
                    if inner.order.len() >= max_len {
                        return Err(SescmdError::CapacityExceeded { max_len });
                    }
                }
                CapacityPolicy::RejectNew => {
                    return Err(SescmdError::CapacityExceeded { max_len });
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;

        let expected: HashSet<BackendId> = inner
            .cursors
            .iter()
            .filter(|(_, cursor)| !cursor.replaying)
            .map(|(&backend, _)| backend)
            .collect();

        let cmd = Arc::new(SessionCommand::new(id, payload, expected));

        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index].cmd = Some(cmd.clone());
                index
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    cmd: Some(cmd.clone()),
                });
                inner.slots.len() - 1
            }
        };
        let cmd_ref = CommandRef {
            index,
            generation: inner.slots[index].generation,
        };
        inner.order.push_back(cmd_ref);

        // Idle live cursors pick the new tail up as their next command.
        for cursor in inner.cursors.values_mut() {
            if !cursor.replaying && cursor.position.is_none() {
                cursor.position = Some(cmd_ref);
            }
        }

        debug!(command_id = id, opcode = cmd.opcode(), "Session command appended");
        Ok(cmd)
    }

    /// Attach a backend: create its cursor at the head of the journal.
    /// Idempotent per backend.
    pub fn attach(&self, backend: BackendId) -> Attach {
        let mut inner = self.inner.lock();

        if inner.cursors.contains_key(&backend) {
            return Attach::AlreadyAttached;
        }

        let position = inner.order.front().copied();
        let replaying = position.is_some();
        inner.cursors.insert(
            backend,
            CursorState {
                position,
                replaying,
                reply_expected: false,
            },
        );

        if replaying {
            debug!(%backend, pending = inner.order.len(), "Backend attached, replay required");
            Attach::Replaying
        } else {
            debug!(%backend, "Backend attached");
            Attach::Live
        }
    }

    /// Detach a backend: drop its cursor and stop expecting its replies.
    /// Commands waiting only on this backend resolve their canonical reply.
    pub fn detach(&self, backend: BackendId) {
        let mut inner = self.inner.lock();

        if inner.cursors.remove(&backend).is_none() {
            return;
        }
        debug!(%backend, "Backend detached");

        let order: Vec<CommandRef> = inner.order.iter().copied().collect();
        for cmd_ref in order {
            let Some(cmd) = inner.slots[cmd_ref.index].cmd.clone() else {
                continue;
            };
            let mut state = cmd.reply.lock();
            if state.pending.remove(&backend) && state.pending.is_empty() && !state.reply_sent {
                // The detached backend was the last outstanding replier.
                self.resolve_canonical(&mut state);
            }
        }

        if self.properties.max_len > 0 {
            let max_len = self.properties.max_len;
            Self::evict_down_to(&mut inner, max_len);
        }
    }

    /// Whether the backend is still catching up through the journal.
    pub fn is_replaying(&self, backend: BackendId) -> bool {
        self.inner
            .lock()
            .cursors
            .get(&backend)
            .map(|cursor| cursor.replaying)
            .unwrap_or(false)
    }

    /// The command the backend's cursor points at, marking it dispatched.
    ///
    /// For a replaying cursor this also registers the backend as an expected
    /// replier of the command (it was not attached when the command was
    /// appended). Returns None when the cursor is at the end of the journal.
    pub fn current_command(
        &self,
        backend: BackendId,
    ) -> Result<Option<Arc<SessionCommand>>, SescmdError> {
        let mut inner = self.inner.lock();

        let Some(cursor) = inner.cursors.get_mut(&backend) else {
            return Err(SescmdError::UnknownBackend(backend));
        };
        let Some(cmd_ref) = cursor.position else {
            return Ok(None);
        };
        let replaying = cursor.replaying;
        let already_dispatched = cursor.reply_expected;
        cursor.reply_expected = true;

        let slot = &inner.slots[cmd_ref.index];
        debug_assert_eq!(slot.generation, cmd_ref.generation);
        let cmd = slot
            .cmd
            .clone()
            .ok_or(SescmdError::NoPendingCommand(backend))?;

        if replaying && !already_dispatched {
            cmd.reply.lock().pending.insert(backend);
        }

        Ok(Some(cmd))
    }

    /// Account a backend's reply to its current command and move the cursor
    /// forward.
    pub fn advance(&self, backend: BackendId, reply: Reply) -> Result<Advance, SescmdError> {
        let (cmd, was_replaying, became_live) = {
            let mut inner = self.inner.lock();

            let Some(cursor) = inner.cursors.get(&backend) else {
                return Err(SescmdError::UnknownBackend(backend));
            };
            let Some(cmd_ref) = cursor.position else {
                return Err(SescmdError::NoPendingCommand(backend));
            };

            let slot = &inner.slots[cmd_ref.index];
            let cmd = slot
                .cmd
                .clone()
                .ok_or(SescmdError::NoPendingCommand(backend))?;

            let next = {
                let mut it = inner.order.iter();
                it.position(|r| *r == cmd_ref)
                    .and_then(|at| inner.order.get(at + 1))
                    .copied()
            };

            let Some(cursor) = inner.cursors.get_mut(&backend) else {
                return Err(SescmdError::UnknownBackend(backend));
            };
            let was_replaying = cursor.replaying;
            cursor.position = next;
            cursor.reply_expected = false;

            let became_live = was_replaying && next.is_none();
            if became_live {
                cursor.replaying = false;
            }

            (cmd, was_replaying, became_live)
        };

        let mut state = cmd.reply.lock();
        state.pending.remove(&backend);
        state.n_replied += 1;

        let mut outcome = Advance {
            became_live,
            ..Advance::default()
        };

        if state.reply_sent {
            // Canonical already chosen: this reply is only counted, and
            // checked for divergence.
            if reply.is_err() && state.reply_type != Some(ReplyType::Err) {
                match self.semantics.on_error {
                    OnError::Drop => {
                        warn!(
                            %backend,
                            command_id = cmd.id(),
                            "Dropping divergent error reply"
                        );
                    }
                    OnError::Abort => {
                        warn!(
                            %backend,
                            command_id = cmd.id(),
                            "Divergent error reply, poisoning session"
                        );
                        self.poisoned.store(true, Ordering::Release);
                        outcome.poisoned = true;
                    }
                }
            }
            return Ok(outcome);
        }

        let complete = match self.semantics.must_reply {
            MustReply::One => true,
            MustReply::All => state.pending.is_empty(),
        };

        match self.semantics.reply_on {
            ReplyOn::First => {
                state.reply_type = Some(reply.reply_type);
                state.reply_sent = true;
                if !was_replaying {
                    outcome.forward = Some(reply.clone());
                }
                state.canonical = Some(reply);
            }
            ReplyOn::Last => {
                state.latest = Some(reply);
                if complete {
                    if self.resolve_canonical(&mut state) && !was_replaying {
                        outcome.forward = state.canonical.clone();
                    }
                }
            }
            ReplyOn::AllOk => {
                if reply.is_err() {
                    if state.first_err.is_none() {
                        state.first_err = Some(reply);
                    }
                } else if state.latest.is_none() {
                    state.latest = Some(reply);
                }
                if complete {
                    if self.resolve_canonical(&mut state) && !was_replaying {
                        outcome.forward = state.canonical.clone();
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Pick the canonical reply from collected state; true if one was chosen.
    fn resolve_canonical(&self, state: &mut ReplyState) -> bool {
        let canonical = match self.semantics.reply_on {
            ReplyOn::First | ReplyOn::Last => state.latest.clone(),
            ReplyOn::AllOk => state.first_err.clone().or_else(|| state.latest.clone()),
        };

        match canonical {
            Some(reply) => {
                state.reply_type = Some(reply.reply_type);
                state.canonical = Some(reply);
                state.reply_sent = true;
                true
            }
            None => false,
        }
    }

    /// Evict retired, unreferenced head commands until at most `target`
    /// remain. A command is never evicted while a cursor references it.
    fn evict_down_to(inner: &mut ListInner, target: usize) {
        while inner.order.len() > target {
            let head = match inner.order.front() {
                Some(&head) => head,
                None => break,
            };

            let referenced = inner
                .cursors
                .values()
                .any(|cursor| cursor.position == Some(head));
            if referenced {
                break;
            }

            let retired = inner.slots[head.index]
                .cmd
                .as_ref()
                .map(|cmd| cmd.is_retired())
                .unwrap_or(true);
            if !retired {
                break;
            }

            inner.order.pop_front();
            let slot = &mut inner.slots[head.index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.cmd = None;
            inner.free.push(head.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;

    const B1: BackendId = BackendId(1);
    const B2: BackendId = BackendId(2);
    const B3: BackendId = BackendId(3);

    fn list(semantics: Semantics) -> SessionCommandList {
        SessionCommandList::new(semantics, Properties::default())
    }

    fn first_drop() -> Semantics {
        Semantics {
            reply_on: ReplyOn::First,
            must_reply: MustReply::All,
            on_error: OnError::Drop,
        }
    }

    fn ok_reply() -> Reply {
        Reply::new(vec![Packet::new(1, &[0x00u8, 0, 0, 2, 0, 0, 0][..])])
    }

    fn err_reply() -> Reply {
        Reply::new(vec![Packet::new(
            1,
            &b"\xff\x28\x04#HY000failure"[..],
        )])
    }

    fn set_payload() -> Bytes {
        Bytes::from_static(b"\x03SET autocommit=0")
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let scl = list(first_drop());
        let a = scl.append(set_payload()).unwrap();
        let b = scl.append(Bytes::from_static(b"\x02orders")).unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(a.opcode(), 0x03);
        assert_eq!(b.opcode(), 0x02);
        assert_eq!(scl.len(), 2);
    }

    #[test]
    fn test_attach_empty_list_is_live() {
        let scl = list(first_drop());
        assert_eq!(scl.attach(B1), Attach::Live);
        assert_eq!(scl.attach(B1), Attach::AlreadyAttached);
        assert!(!scl.is_replaying(B1));
        assert_eq!(scl.cursor_count(), 1);
    }

    #[test]
    fn test_first_semantics_forwards_first_reply_only() {
        let scl = list(first_drop());
        scl.attach(B1);
        scl.attach(B2);

        let cmd = scl.append(set_payload()).unwrap();
        assert!(scl.current_command(B1).unwrap().is_some());
        assert!(scl.current_command(B2).unwrap().is_some());

        let first = scl.advance(B1, ok_reply()).unwrap();
        assert!(first.forward.is_some(), "first reply must be forwarded");
        assert!(cmd.reply_sent());
        assert!(!cmd.is_retired(), "B2's reply still outstanding");

        let second = scl.advance(B2, ok_reply()).unwrap();
        assert!(second.forward.is_none(), "later replies are only counted");
        assert_eq!(cmd.n_replied(), 2);
        assert!(cmd.is_retired());
    }

    #[test]
    fn test_late_attach_replays_journal_in_order() {
        let scl = list(first_drop());
        scl.attach(B1);
        scl.attach(B2);

        // Two session commands, fully answered by both live backends.
        for payload in [set_payload(), Bytes::from_static(b"\x02orders")] {
            scl.append(payload).unwrap();
            for backend in [B1, B2] {
                scl.current_command(backend).unwrap().unwrap();
                scl.advance(backend, ok_reply()).unwrap();
            }
        }

        // An ordinary SELECT is routed, never journaled; B3 must not see it.
        assert_eq!(scl.len(), 2);

        assert_eq!(scl.attach(B3), Attach::Replaying);
        assert!(scl.is_replaying(B3));

        let replayed = scl.current_command(B3).unwrap().unwrap();
        assert_eq!(replayed.id(), 1);
        assert_eq!(&replayed.payload()[..], &b"\x03SET autocommit=0"[..]);

        let outcome = scl.advance(B3, ok_reply()).unwrap();
        assert!(outcome.forward.is_none(), "replay replies are suppressed");
        assert!(!outcome.became_live);

        let replayed = scl.current_command(B3).unwrap().unwrap();
        assert_eq!(replayed.id(), 2);
        let outcome = scl.advance(B3, ok_reply()).unwrap();
        assert!(outcome.became_live);
        assert!(!scl.is_replaying(B3));
        assert!(scl.current_command(B3).unwrap().is_none());
    }

    #[test]
    fn test_divergent_error_abort_poisons_session() {
        let scl = list(Semantics {
            reply_on: ReplyOn::First,
            must_reply: MustReply::All,
            on_error: OnError::Abort,
        });
        scl.attach(B1);
        scl.attach(B2);

        scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.current_command(B2).unwrap();

        let first = scl.advance(B1, ok_reply()).unwrap();
        assert!(first.forward.is_some());
        assert!(!first.poisoned);

        let second = scl.advance(B2, err_reply()).unwrap();
        assert!(second.poisoned);
        assert!(scl.is_poisoned());
        assert!(matches!(
            scl.append(set_payload()),
            Err(SescmdError::Poisoned)
        ));
    }

    #[test]
    fn test_divergent_error_drop_discards() {
        let scl = list(first_drop());
        scl.attach(B1);
        scl.attach(B2);

        scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.current_command(B2).unwrap();

        scl.advance(B1, ok_reply()).unwrap();
        let second = scl.advance(B2, err_reply()).unwrap();
        assert!(!second.poisoned);
        assert!(second.forward.is_none());
        assert!(!scl.is_poisoned());
    }

    #[test]
    fn test_last_semantics_forwards_at_completion() {
        let scl = list(Semantics {
            reply_on: ReplyOn::Last,
            must_reply: MustReply::All,
            on_error: OnError::Drop,
        });
        scl.attach(B1);
        scl.attach(B2);

        scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.current_command(B2).unwrap();

        let first = scl.advance(B1, err_reply()).unwrap();
        assert!(first.forward.is_none(), "held until all replies arrive");

        let second = scl.advance(B2, ok_reply()).unwrap();
        let forwarded = second.forward.expect("last reply forwarded");
        assert_eq!(forwarded.reply_type, ReplyType::Ok);
    }

    #[test]
    fn test_all_ok_synthesizes_first_err() {
        let scl = list(Semantics {
            reply_on: ReplyOn::AllOk,
            must_reply: MustReply::All,
            on_error: OnError::Drop,
        });
        scl.attach(B1);
        scl.attach(B2);

        let cmd = scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.current_command(B2).unwrap();

        scl.advance(B1, err_reply()).unwrap();
        let outcome = scl.advance(B2, ok_reply()).unwrap();
        let forwarded = outcome.forward.expect("completion forwards");
        assert_eq!(forwarded.reply_type, ReplyType::Err);
        assert_eq!(cmd.reply_type(), Some(ReplyType::Err));
    }

    #[test]
    fn test_all_ok_with_unanimous_ok() {
        let scl = list(Semantics {
            reply_on: ReplyOn::AllOk,
            must_reply: MustReply::All,
            on_error: OnError::Drop,
        });
        scl.attach(B1);
        scl.attach(B2);

        scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.current_command(B2).unwrap();

        scl.advance(B1, ok_reply()).unwrap();
        let outcome = scl.advance(B2, ok_reply()).unwrap();
        assert_eq!(
            outcome.forward.expect("completion forwards").reply_type,
            ReplyType::Ok
        );
    }

    #[test]
    fn test_reject_new_at_capacity() {
        let scl = SessionCommandList::new(
            first_drop(),
            Properties {
                max_len: 1,
                on_capacity: CapacityPolicy::RejectNew,
            },
        );
        scl.attach(B1);

        scl.append(set_payload()).unwrap();
        assert!(matches!(
            scl.append(set_payload()),
            Err(SescmdError::CapacityExceeded { max_len: 1 })
        ));
    }

    #[test]
    fn test_drop_first_evicts_retired_head() {
        let scl = SessionCommandList::new(
            first_drop(),
            Properties {
                max_len: 1,
                on_capacity: CapacityPolicy::DropFirst,
            },
        );
        scl.attach(B1);

        let first = scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.advance(B1, ok_reply()).unwrap();
        assert!(first.is_retired());

        let second = scl.append(Bytes::from_static(b"\x02orders")).unwrap();
        assert_eq!(scl.len(), 1);
        assert_eq!(second.id(), 2, "ids never regress across eviction");

        // A backend attaching now replays only the surviving command.
        assert_eq!(scl.attach(B2), Attach::Replaying);
        let replayed = scl.current_command(B2).unwrap().unwrap();
        assert_eq!(replayed.id(), 2);
    }

    #[test]
    fn test_drop_first_refuses_to_evict_referenced_head() {
        let scl = SessionCommandList::new(
            first_drop(),
            Properties {
                max_len: 1,
                on_capacity: CapacityPolicy::DropFirst,
            },
        );
        scl.attach(B1);

        // Head command dispatched but unanswered: cursor still references it.
        scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();

        assert!(matches!(
            scl.append(set_payload()),
            Err(SescmdError::CapacityExceeded { max_len: 1 })
        ));
    }

    #[test]
    fn test_detach_resolves_waiting_command() {
        let scl = list(Semantics {
            reply_on: ReplyOn::Last,
            must_reply: MustReply::All,
            on_error: OnError::Drop,
        });
        scl.attach(B1);
        scl.attach(B2);

        let cmd = scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.current_command(B2).unwrap();

        let outcome = scl.advance(B1, ok_reply()).unwrap();
        assert!(outcome.forward.is_none());

        // B2 dies before replying; its cursor goes away and the command
        // settles on the replies it has.
        scl.detach(B2);
        assert_eq!(scl.cursor_count(), 1);
        let canonical = cmd.canonical_reply().expect("resolved on detach");
        assert_eq!(canonical.reply_type, ReplyType::Ok);
        assert!(cmd.is_retired());
    }

    #[test]
    fn test_replay_reply_counts_toward_command() {
        let scl = list(first_drop());
        scl.attach(B1);

        let cmd = scl.append(set_payload()).unwrap();
        scl.current_command(B1).unwrap();
        scl.advance(B1, ok_reply()).unwrap();
        assert_eq!(cmd.n_replied(), 1);

        scl.attach(B2);
        scl.current_command(B2).unwrap();
        scl.advance(B2, ok_reply()).unwrap();
        assert_eq!(cmd.n_replied(), 2);
    }
}
