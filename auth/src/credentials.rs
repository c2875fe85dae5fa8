//! OAuth credential record and its on-disk store.
//!
//! The record is a single JSON file (`~/.qwen/oauth_creds.json` by default)
//! with exactly the fields `access_token`, `refresh_token`, `token_type`,
//! `resource_url`, and `expiry_date` (epoch milliseconds). A missing or
//! unparseable file reads as "no cached credentials".

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_utils::{AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write_with_options};

/// Tokens are refreshed this long before their stated expiry.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(30);

const CREDENTIALS_DIR: &str = ".qwen";
const CREDENTIALS_FILE: &str = "oauth_creds.json";

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub resource_url: Option<String>,
    /// Expiry instant in epoch milliseconds.
    #[serde(default)]
    pub expiry_date: Option<i64>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("resource_url", &self.resource_url)
            .field("expiry_date", &self.expiry_date)
            .finish()
    }
}

impl Credentials {
    /// True while `now_ms` is before `expiry_date - REFRESH_BUFFER`.
    ///
    /// Credentials without an expiry are never considered valid.
    #[must_use]
    pub fn is_valid(&self, now_ms: i64) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        let buffer_ms = i64::try_from(REFRESH_BUFFER.as_millis()).unwrap_or(i64::MAX);
        self.expiry_date
            .is_some_and(|expiry| now_ms < expiry.saturating_sub(buffer_ms))
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `~/.qwen/oauth_creds.json`.
    #[must_use]
    pub fn default_location() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(CREDENTIALS_DIR).join(CREDENTIALS_FILE)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn load(&self) -> Option<Credentials> {
        strand_utils::recover_bak_file(&self.path);
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.path.display(), "Failed to read credentials: {e}");
                }
                return None;
            }
        };
        match serde_json::from_str::<Credentials>(&content) {
            Ok(credentials) if !credentials.access_token.is_empty() => Some(credentials),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring malformed credentials: {e}");
                None
            }
        }
    }

    pub fn save(&self, credentials: &Credentials) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(credentials).map_err(io::Error::other)?;
        atomic_write_with_options(
            &self.path,
            &json,
            AtomicWriteOptions {
                file_sync: FileSyncPolicy::SyncAll,
                mode: PersistMode::SensitiveOwnerOnly,
                create_parent: true,
            },
        )
    }

    /// Delete the record. A missing file counts as cleared.
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Cleared cached credentials");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
