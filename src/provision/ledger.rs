//! Append-only deployment ledger.
//!
//! Every completed provisioning action lands here as one record. The
//! component registry is a projection of this log and is rebuilt from it on
//! cold start. Corrections are new `Retracted` records; nothing is rewritten.

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::provision::types::{
    Address, Claim, ClaimTopicEntry, ComponentInstance, RegistryLinks, TransactionRef,
    TrustedIssuerEntry, UserIdentity,
};

/// One completed action, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub operator: Address,
    pub network: String,
    /// `None` when the effect was observed on chain rather than submitted here.
    pub transaction: Option<TransactionRef>,
    pub action: RecordedAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedAction {
    Deployed {
        instance: ComponentInstance,
    },
    IdentityDeployed {
        identity: Address,
        management_key: Address,
    },
    Initialized {
        instance: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        links: Option<RegistryLinks>,
    },
    Bound {
        storage: String,
        registry: String,
    },
    AgentAdded {
        instance: String,
        agent: Address,
    },
    ClaimTopicAdded {
        instance: String,
        topic: ClaimTopicEntry,
    },
    TrustedIssuerAdded {
        instance: String,
        issuer: TrustedIssuerEntry,
    },
    IdentityRegistered {
        registry: String,
        user: UserIdentity,
    },
    ClaimIssued {
        claim: Claim,
    },
    /// Compensating record withdrawing the effect of an earlier one.
    Retracted {
        sequence: u64,
        reason: String,
    },
}

impl RecordedAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deployed { .. } => "deployed",
            Self::IdentityDeployed { .. } => "identity_deployed",
            Self::Initialized { .. } => "initialized",
            Self::Bound { .. } => "bound",
            Self::AgentAdded { .. } => "agent_added",
            Self::ClaimTopicAdded { .. } => "claim_topic_added",
            Self::TrustedIssuerAdded { .. } => "trusted_issuer_added",
            Self::IdentityRegistered { .. } => "identity_registered",
            Self::ClaimIssued { .. } => "claim_issued",
            Self::Retracted { .. } => "retracted",
        }
    }
}

/// Durable append + read-back store. No update or delete exists.
#[async_trait]
pub trait DeploymentLedger: Send + Sync {
    async fn append(&self, record: &DeploymentRecord) -> Result<(), LedgerError>;

    async fn replay_all(&self) -> Result<Vec<DeploymentRecord>, LedgerError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// JSON-lines ledger file.
pub struct JsonlLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_line(path: &Path, line: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;

    // Cross-process guard; the in-process mutex already serializes callers.
    fs4::FileExt::lock_exclusive(&file)?;
    let written = drop_torn_tail(&mut file, path)
        .and_then(|()| file.write_all(line))
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.sync_data());
    let unlocked = fs4::FileExt::unlock(&file);
    written?;
    unlocked?;
    Ok(())
}

/// Cut an unterminated final line left by an interrupted append, then
/// position the cursor at the end of the file. The fragment was never
/// acknowledged to a caller.
fn drop_torn_tail(file: &mut std::fs::File, path: &Path) -> std::io::Result<()> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    if contents.last().is_some_and(|b| *b != b'\n') {
        let keep = contents
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        tracing::warn!(
            "Truncating {} byte(s) of incomplete trailing ledger entry in {}",
            contents.len() - keep,
            path.display()
        );
        file.set_len(keep as u64)?;
        file.sync_data()?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<DeploymentRecord>, LedgerError> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let ends_with_newline = {
        let bytes = std::fs::read(path)?;
        bytes.last().is_none_or(|b| *b == b'\n')
    };

    let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
    let last_index = lines.len().saturating_sub(1);
    let mut records = Vec::with_capacity(lines.len());

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeploymentRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if index == last_index && !ends_with_newline => {
                // Torn final write: the append never returned success.
                tracing::warn!(
                    "Ignoring incomplete trailing ledger entry at line {}: {}",
                    index + 1,
                    e
                );
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    line: index + 1,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(records)
}

#[async_trait]
impl DeploymentLedger for JsonlLedger {
    async fn append(&self, record: &DeploymentRecord) -> Result<(), LedgerError> {
        let line = serde_json::to_vec(record)?;
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| LedgerError::Unavailable(format!("append task failed: {e}")))?
    }

    async fn replay_all(&self) -> Result<Vec<DeploymentRecord>, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_records(&path))
            .await
            .map_err(|e| LedgerError::Unavailable(format!("replay task failed: {e}")))?
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

/// In-process ledger for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<DeploymentRecord>>,
    fail_next: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next append fail without storing anything.
    pub fn fail_next_append(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DeploymentLedger for MemoryLedger {
    async fn append(&self, record: &DeploymentRecord) -> Result<(), LedgerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(
                "injected append failure".to_string(),
            ));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn replay_all(&self) -> Result<Vec<DeploymentRecord>, LedgerError> {
        Ok(self.records.lock().await.clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
