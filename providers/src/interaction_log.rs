//! Optional on-disk log of OpenAI-compatible request/response pairs.
//!
//! Each interaction becomes one JSON file named
//! `openai-<timestamp>-<id>.json`. Secrets are redacted before anything
//! touches disk. Write failures are logged and otherwise ignored so a broken
//! log directory never fails a generation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use strand_utils::{atomic_write, redact_json};

use crate::GenerationError;

const FILE_PREFIX: &str = "openai-";

#[derive(Debug, Clone)]
pub struct InteractionLogger {
    dir: PathBuf,
}

impl InteractionLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/logs/openai`, or `None` when no home directory is known.
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".strand").join("logs").join("openai"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record one interaction; returns the written path on success.
    pub fn log(
        &self,
        request: &Value,
        response: Result<&Value, &GenerationError>,
    ) -> Option<PathBuf> {
        let now = chrono::Utc::now();
        let mut record = json!({
            "timestamp": now.to_rfc3339(),
            "request": request,
        });
        match response {
            Ok(body) => record["response"] = body.clone(),
            Err(error) => {
                record["error"] = json!({
                    "message": error.to_string(),
                    "stage": error.stage(),
                    "status": error.status(),
                });
            }
        }
        redact_json(&mut record);

        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{FILE_PREFIX}{}-{}.json",
            now.format("%Y%m%dT%H%M%S%.3fZ"),
            &id[..8]
        );
        let path = self.dir.join(name);

        let bytes = match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to serialize interaction log: {e}");
                return None;
            }
        };
        match atomic_write(&path, &bytes) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to write interaction log: {e}");
                None
            }
        }
    }

    /// Logged files, most recent first.
    pub fn log_files(&self, limit: Option<usize>) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(".json"))
            })
            .collect();
        files.sort();
        files.reverse();
        if let Some(limit) = limit {
            files.truncate(limit);
        }
        Ok(files)
    }

    pub fn read_log_file(path: &Path) -> io::Result<Value> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
