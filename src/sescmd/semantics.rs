use serde::Deserialize;

/// Which backend reply is relayed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOn {
    /// Forward the first reply received; later replies are counted and
    /// discarded.
    First,
    /// Hold replies and forward the last one.
    Last,
    /// Forward OK iff every reply was OK, else the first ERR.
    AllOk,
}

/// How many replies a command needs before it is considered answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MustReply {
    One,
    All,
}

/// What to do when a backend reports an error that disagrees with the
/// canonical reply already forwarded to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Log the divergent error and discard it.
    Drop,
    /// Poison the session; the protocol handler closes the connection.
    Abort,
}

/// What to do when an append would overflow `max_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Evict the oldest fully-replied command nobody references.
    DropFirst,
    /// Refuse the new command.
    RejectNew,
}

/// Reply reconciliation semantics for a session command list.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Semantics {
    #[serde(default = "default_reply_on")]
    pub reply_on: ReplyOn,
    #[serde(default = "default_must_reply")]
    pub must_reply: MustReply,
    #[serde(default = "default_on_error")]
    pub on_error: OnError,
}

fn default_reply_on() -> ReplyOn {
    ReplyOn::First
}

fn default_must_reply() -> MustReply {
    MustReply::One
}

fn default_on_error() -> OnError {
    OnError::Drop
}

impl Default for Semantics {
    fn default() -> Self {
        Self {
            reply_on: default_reply_on(),
            must_reply: default_must_reply(),
            on_error: default_on_error(),
        }
    }
}

/// Structural properties of a session command list.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Properties {
    /// Maximum number of retained commands; 0 means unlimited.
    #[serde(default)]
    pub max_len: usize,
    #[serde(default = "default_capacity_policy")]
    pub on_capacity: CapacityPolicy,
}

fn default_capacity_policy() -> CapacityPolicy {
    CapacityPolicy::DropFirst
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            max_len: 0,
            on_capacity: default_capacity_policy(),
        }
    }
}
