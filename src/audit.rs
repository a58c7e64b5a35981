/// Audit logging for system mutations
///
/// Every provisioning run gets a run id; each step that changes the host
/// appends one JSON line. Audit writes are best-effort and never fail a step.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SetupStarted,
    InstallPackages,
    VerifyRuntime,
    ReconcileFirewall,
    PersistFirewall,
    RaiseLimits,
    InstallUnit,
    SetupFinished,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Provisioning run this event belongs to
    pub run_id: Uuid,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    pub error: Option<String>,
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
    run_id: Uuid,
}

impl AuditLog {
    /// Opens the audit log in the state directory with a fresh run id.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined or created
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::ensure_state_dir()?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");
        Ok(Self::at(log_path))
    }

    /// Audit log at an explicit path
    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Records an event for this run, logging instead of failing.
    pub async fn record(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let event = AuditEvent {
            timestamp: chrono::Utc::now(),
            run_id: self.run_id,
            event_type,
            success,
            details,
            error,
        };
        if let Err(e) = self.append(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }
}

/// Records through an optional audit log
pub async fn record(
    audit: Option<&AuditLog>,
    event_type: EventType,
    success: bool,
    details: serde_json::Value,
    error: Option<String>,
) {
    if let Some(audit) = audit {
        audit.record(event_type, success, details, error).await;
    }
}
