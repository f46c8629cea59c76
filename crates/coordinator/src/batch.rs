use crate::error::{CoordinatorError, Result};
use ingest_discovery::{DiscoveryProgress, DiscoveryState};
use ingest_protocol::{Manifest, ManifestFile, ProcessingConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Uploading,
    Discovery,
    Preprocessing,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Discovery => "discovery",
            Self::Preprocessing => "preprocessing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Completed,
}

/// How the client uploads a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadKind {
    Simple,
    Multipart { upload_id: String, part_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// A file announced by a client, before or after its bytes arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub r2_key: String,
    pub logical_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    #[serde(default = "simple_upload")]
    pub upload: UploadKind,
}

const fn simple_upload() -> UploadKind {
    UploadKind::Simple
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub r2_key: String,
    pub logical_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub upload: UploadKind,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<CompletedPart>,
}

impl From<NewFile> for TrackedFile {
    fn from(file: NewFile) -> Self {
        Self {
            r2_key: file.r2_key,
            logical_path: file.logical_path,
            file_name: file.file_name,
            file_size: file.file_size,
            content_type: file.content_type,
            upload: file.upload,
            status: FileStatus::Pending,
            cid: None,
            parts: Vec::new(),
        }
    }
}

impl TrackedFile {
    pub fn to_manifest_file(&self) -> ManifestFile {
        ManifestFile {
            r2_key: self.r2_key.clone(),
            logical_path: self.logical_path.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            content_type: self.content_type.clone(),
            cid: self.cid.clone(),
        }
    }
}

/// Upload-session metadata supplied when a batch is registered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    /// Entity the published root is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pi: Option<String>,
    #[serde(default)]
    pub processing_config: ProcessingConfig,
}

/// The coordinator's whole view of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub status: BatchStatus,
    pub session: BatchSession,
    pub files: Vec<TrackedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_key: Option<String>,
    #[serde(default)]
    pub total_files: usize,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

/// Compact, serializable answer to "where is this batch".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub files: usize,
    pub files_completed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchRecord {
    pub fn new(batch_id: impl Into<String>, session: BatchSession) -> Self {
        let now = unix_now_ms();
        Self {
            batch_id: batch_id.into(),
            status: BatchStatus::Uploading,
            session,
            files: Vec::new(),
            manifest_key: None,
            total_files: 0,
            total_bytes: 0,
            discovery: None,
            error: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at_unix_ms = unix_now_ms();
    }

    pub fn expect_status(&self, expected: BatchStatus) -> Result<()> {
        if self.status != expected {
            return Err(CoordinatorError::InvalidStatus {
                batch_id: self.batch_id.clone(),
                expected,
                actual: self.status,
            });
        }
        Ok(())
    }

    pub fn file_mut(&mut self, r2_key: &str) -> Option<&mut TrackedFile> {
        self.files.iter_mut().find(|file| file.r2_key == r2_key)
    }

    /// Manifest of every completed file, grouped by directory.
    pub fn manifest(&self) -> Manifest {
        let files = self
            .files
            .iter()
            .filter(|file| file.status == FileStatus::Completed)
            .map(TrackedFile::to_manifest_file)
            .collect();
        Manifest::from_files(
            self.batch_id.clone(),
            files,
            &self.session.processing_config,
        )
    }

    /// Whether scheduled steps still have something to do: either discovery
    /// itself or forwarding its results.
    pub fn discovery_pending(&self) -> bool {
        self.status == BatchStatus::Discovery && self.discovery.is_some()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id.clone(),
            status: self.status,
            files: self.files.len(),
            files_completed: self
                .files
                .iter()
                .filter(|file| file.status == FileStatus::Completed)
                .count(),
            discovery: self.discovery.as_ref().map(DiscoveryState::progress),
            error: self.error.clone(),
        }
    }
}

/// Batch ids double as file names in the state store.
pub fn validate_batch_id(batch_id: &str) -> Result<()> {
    let valid = !batch_id.is_empty()
        && batch_id.len() <= 128
        && !batch_id.starts_with('.')
        && batch_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if !valid {
        return Err(CoordinatorError::InvalidBatchId(batch_id.to_string()));
    }
    Ok(())
}

/// Check a multipart completion against the declared part count: parts
/// numbered `1..=part_count`, each exactly once, each with an etag.
pub fn validate_parts(part_count: u32, parts: &[CompletedPart]) -> Result<()> {
    if parts.is_empty() {
        return Err(CoordinatorError::InvalidParts("no parts supplied".into()));
    }
    if parts.len() != part_count as usize {
        return Err(CoordinatorError::InvalidParts(format!(
            "expected {part_count} parts, got {}",
            parts.len()
        )));
    }

    let mut seen = BTreeSet::new();
    for part in parts {
        if part.part_number == 0 || part.part_number > part_count {
            return Err(CoordinatorError::InvalidParts(format!(
                "part number {} outside 1..={part_count}",
                part.part_number
            )));
        }
        if part.etag.trim().is_empty() {
            return Err(CoordinatorError::InvalidParts(format!(
                "part {} has no etag",
                part.part_number
            )));
        }
        if !seen.insert(part.part_number) {
            return Err(CoordinatorError::InvalidParts(format!(
                "part {} listed twice",
                part.part_number
            )));
        }
    }
    Ok(())
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
