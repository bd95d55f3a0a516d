/// Identifies one backend connection attached to a session command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u64);

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Reference to a command slot in the list arena.
///
/// The generation is bumped when a slot is evicted, so a stale reference can
/// never resolve to a command that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct CommandRef {
    pub index: usize,
    pub generation: u32,
}

/// Per-backend position in the session command list.
///
/// Owned by the list and mutated only under the list lock.
#[derive(Debug)]
pub(super) struct CursorState {
    /// The command this cursor must process next; None means end of list.
    pub position: Option<CommandRef>,
    /// True while the backend is catching up through the journal; a
    /// replaying backend must not serve live queries and its replies are
    /// never forwarded to the client.
    pub replaying: bool,
    /// True between dispatching the current command and receiving its reply.
    pub reply_expected: bool,
}

/// Result of attaching a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// The list was empty; the backend serves live traffic immediately.
    Live,
    /// The backend must replay the journal before serving live traffic.
    Replaying,
    /// The backend already had a cursor; nothing changed.
    AlreadyAttached,
}
