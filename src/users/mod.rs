use std::collections::HashMap;

use tracing::warn;

use crate::config::UserEntry;
use crate::protocol::hex_to_digest;

/// Credential stored in the service catalog for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// Account has no password; an empty client token authenticates.
    PasswordLess,
    /// `SHA1(SHA1(password))`, decoded from the catalog's 40-char hex form.
    DoubleSha1([u8; 20]),
}

/// Lookup of stored credentials by username.
///
/// The catalog is read-only for the lifetime of a connection; a missing user
/// is an authentication failure, never an error.
pub trait UserRepository: Send + Sync {
    fn lookup_password_sha1(&self, username: &str) -> Option<Credential>;
}

/// Catalog loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticUserRepository {
    users: HashMap<String, Credential>,
}

impl StaticUserRepository {
    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let mut users = HashMap::with_capacity(entries.len());

        for entry in entries {
            let credential = if entry.password_sha1.is_empty() {
                Credential::PasswordLess
            } else {
                match hex_to_digest(&entry.password_sha1) {
                    Some(digest) => Credential::DoubleSha1(digest),
                    None => {
                        warn!(
                            username = %entry.username,
                            "Skipping catalog entry with malformed password digest"
                        );
                        continue;
                    }
                }
            };
            users.insert(entry.username.clone(), credential);
        }

        Self { users }
    }
}

impl UserRepository for StaticUserRepository {
    fn lookup_password_sha1(&self, username: &str) -> Option<Credential> {
        self.users.get(username).copied()
    }
}
