//! Best-effort disk checkpointing for queue state.
//!
//! Writes are serialized through a dedicated task so enqueue and dequeue
//! never block on the filesystem; a failed write is logged and the in-memory
//! state stays authoritative.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Error raised while reading or writing a queue file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read queue file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write queue file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode queue file {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk shape of one queue: pending items plus the reconciliation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedQueue<S> {
    #[serde(default = "Vec::new")]
    pub items: Vec<S>,
    #[serde(default = "Vec::new")]
    pub recently_processed: Vec<S>,
}

impl<S> Default for PersistedQueue<S> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            recently_processed: Vec::new(),
        }
    }
}

enum StoreCommand {
    Write(String),
    Flush(oneshot::Sender<()>),
}

/// Owns one queue file and the background writer feeding it.
///
/// Each queue instance owns its path exclusively; two queues sharing a path
/// would overwrite each other's state.
pub struct QueueStore {
    path: PathBuf,
    commands: mpsc::UnboundedSender<StoreCommand>,
}

impl QueueStore {
    /// Creates the store and spawns its writer task on the current runtime.
    pub fn new(path: PathBuf) -> Self {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let writer_path = path.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    StoreCommand::Write(document) => {
                        if let Err(err) = write_document(&writer_path, &document).await {
                            error!(error = %err, "queue persistence write failed");
                        }
                    }
                    StoreCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { path, commands }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state once, at queue construction.
    ///
    /// A missing file is an empty queue; any other failure is logged and
    /// also yields an empty queue, since memory is authoritative.
    pub fn load<S: DeserializeOwned>(&self) -> PersistedQueue<S> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return PersistedQueue::default();
            }
            Err(err) => {
                error!(
                    error = %PersistenceError::Read { path: self.path.clone(), source: err },
                    "queue restore failed"
                );
                return PersistedQueue::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(persisted) => {
                debug!(path = %self.path.display(), "queue restored from disk");
                persisted
            }
            Err(err) => {
                error!(
                    error = %PersistenceError::Decode { path: self.path.clone(), source: err },
                    "queue restore failed"
                );
                PersistedQueue::default()
            }
        }
    }

    /// Queues an asynchronous write of the serialized document.
    pub fn save<S: Serialize>(&self, document: &PersistedQueue<S>) {
        let encoded =
            serde_json::to_string(document).expect("queue document serialization must succeed");
        let _ = self.commands.send(StoreCommand::Write(encoded));
    }

    /// Waits until every previously queued write has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(StoreCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn write_document(path: &Path, document: &str) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PersistenceError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }
    tokio::fs::write(path, document)
        .await
        .map_err(|source| PersistenceError::Write {
            path: path.to_path_buf(),
            source,
        })
}
