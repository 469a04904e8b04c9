//! Master key used to decrypt stored passwords.
//!
//! The key is an explicit value owned by whoever constructs the supervisor.
//! It is loaded from `CONDUIT_MASTER_KEY` (persistent) or generated at
//! startup (ephemeral, only useful for passwords encrypted in this run).

use super::{decode_key, generate_key, CryptoResult, KEY_LENGTH};

/// Environment variable holding the base64-encoded master key.
pub const MASTER_KEY_ENV: &str = "CONDUIT_MASTER_KEY";

#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
    persistent: bool,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

impl MasterKey {
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self {
            key,
            persistent: true,
        }
    }

    /// Load from `CONDUIT_MASTER_KEY`, falling back to an ephemeral key.
    ///
    /// An invalid env value is an error rather than a silent fallback, since
    /// every stored password would fail to decrypt afterwards.
    pub fn from_env() -> CryptoResult<Self> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(encoded) => Ok(Self {
                key: decode_key(&encoded)?,
                persistent: true,
            }),
            Err(_) => {
                tracing::warn!("{MASTER_KEY_ENV} not set, using an ephemeral master key");
                Ok(Self {
                    key: generate_key()?,
                    persistent: false,
                })
            }
        }
    }

    pub fn key(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}
