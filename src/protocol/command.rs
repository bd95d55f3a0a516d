use bytes::Bytes;

use super::packet::Command;

/// Decides whether a COM_QUERY text changes session state on the backend
/// (e.g. `SET`, `USE`). Injected so the session can run without one; without
/// a classifier every COM_QUERY is treated as an ordinary routed query.
pub trait QueryClassifier: Send + Sync {
    fn is_session_modifying(&self, sql: &str) -> bool;
}

/// Default classifier: flags statements whose first keyword is SET or USE.
#[derive(Debug, Default)]
pub struct PrefixClassifier;

impl QueryClassifier for PrefixClassifier {
    fn is_session_modifying(&self, sql: &str) -> bool {
        let sql_upper = sql.trim_start().to_uppercase();
        sql_upper.starts_with("SET ")
            || sql_upper == "SET"
            || sql_upper.starts_with("USE ")
            || sql_upper == "USE"
    }
}

/// How the session dispatches one client packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// COM_QUIT: forward to every backend, then close without a reply.
    Quit,
    /// Journal in the session command list and broadcast to all backends.
    SessionCommand,
    /// Route to a single backend.
    Route,
}

/// Classify a client payload by opcode (and, for COM_QUERY, by the injected
/// classifier).
pub fn classify(payload: &Bytes, classifier: Option<&dyn QueryClassifier>) -> Dispatch {
    let Some(&opcode) = payload.first() else {
        return Dispatch::Route;
    };

    match Command::from(opcode) {
        Command::Quit => Dispatch::Quit,
        Command::InitDb | Command::ChangeUser | Command::SetOption | Command::StmtPrepare => {
            Dispatch::SessionCommand
        }
        Command::Query => {
            let sql = String::from_utf8_lossy(&payload[1..]);
            match classifier {
                Some(c) if c.is_session_modifying(&sql) => Dispatch::SessionCommand,
                _ => Dispatch::Route,
            }
        }
        _ => Dispatch::Route,
    }
}

/// Parsed command from client, for logging and session bookkeeping.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    Unknown(u8),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        let Some(&opcode) = payload.first() else {
            return ClientCommand::Unknown(0);
        };
        let data = payload.slice(1..);

        match Command::from(opcode) {
            Command::Query => ClientCommand::Query(String::from_utf8_lossy(&data).to_string()),
            Command::InitDb => ClientCommand::InitDb(String::from_utf8_lossy(&data).to_string()),
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            _ => ClientCommand::Unknown(opcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn test_quit_is_terminal() {
        assert_eq!(classify(&payload(b"\x01"), None), Dispatch::Quit);
    }

    #[test]
    fn test_session_modifying_opcodes() {
        for opcode in [0x02u8, 0x11, 0x16, 0x1b] {
            assert_eq!(
                classify(&payload(&[opcode, b'x']), None),
                Dispatch::SessionCommand,
                "opcode {opcode:#04x}"
            );
        }
    }

    #[test]
    fn test_query_without_classifier_routes() {
        assert_eq!(
            classify(&payload(b"\x03SET autocommit=0"), None),
            Dispatch::Route
        );
    }

    #[test]
    fn test_query_with_classifier() {
        let classifier = PrefixClassifier;
        assert_eq!(
            classify(&payload(b"\x03SET autocommit=0"), Some(&classifier)),
            Dispatch::SessionCommand
        );
        assert_eq!(
            classify(&payload(b"\x03use orders"), Some(&classifier)),
            Dispatch::SessionCommand
        );
        assert_eq!(
            classify(&payload(b"\x03SELECT 1"), Some(&classifier)),
            Dispatch::Route
        );
        // SETTINGS is not SET.
        assert_eq!(
            classify(&payload(b"\x03SETTINGS"), Some(&classifier)),
            Dispatch::Route
        );
    }

    #[test]
    fn test_row_fetch_opcodes_route() {
        for opcode in [0x03u8, 0x17, 0x19, 0x0e, 0x04] {
            assert_eq!(classify(&payload(&[opcode]), None), Dispatch::Route);
        }
    }
}
