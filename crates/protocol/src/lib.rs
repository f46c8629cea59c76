//! Shapes shared by the discovery engine, the batch coordinator and their
//! external collaborators: the persisted manifest, entity-store requests and
//! responses, the `chunks.json` component and the downstream job message.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod paths;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Entity type used for every published directory.
pub const PI_ENTITY_TYPE: &str = "PI";

/// Component name of the synthesized chunk index.
pub const CHUNKS_COMPONENT: &str = "chunks.json";

/// Blob-store key of the manifest written at finalize time.
pub fn manifest_key(batch_id: &str) -> String {
    format!("staging/{batch_id}/_manifest.json")
}

/// Upload state of a file or chunk.
///
/// `Failed` is terminal: the item was attempted, gave up, and is never retried.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, JsonSchema)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum ContentState {
    #[default]
    NotAttempted,
    Uploaded(String),
    Failed,
}

impl ContentState {
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::NotAttempted)
    }

    pub fn uploaded_id(&self) -> Option<&str> {
        match self {
            Self::Uploaded(id) => Some(id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub ocr: bool,
    #[serde(default)]
    pub describe: bool,
    #[serde(default)]
    pub pinax: bool,
    /// Options consumed only by downstream stages.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ManifestFile {
    /// Blob-store locator of the raw upload.
    pub r2_key: String,
    pub logical_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct DirectoryGroup {
    pub directory_path: String,
    #[serde(default)]
    pub processing_config: ProcessingConfig,
    pub file_count: usize,
    pub total_bytes: u64,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct Manifest {
    #[serde(default = "default_manifest_schema_version")]
    pub schema_version: u32,
    pub batch_id: String,
    #[serde(default)]
    pub directories: Vec<DirectoryGroup>,
    pub total_files: usize,
    pub total_bytes: u64,
}

const fn default_manifest_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

impl Manifest {
    /// Group files by the directory of their logical path.
    ///
    /// Groups are ordered by directory path; files keep their input order.
    pub fn from_files(
        batch_id: impl Into<String>,
        files: Vec<ManifestFile>,
        processing_config: &ProcessingConfig,
    ) -> Self {
        let mut groups: BTreeMap<String, Vec<ManifestFile>> = BTreeMap::new();
        for file in files {
            let dir = paths::file_dir(&file.logical_path);
            groups.entry(dir).or_default().push(file);
        }

        let directories: Vec<DirectoryGroup> = groups
            .into_iter()
            .map(|(directory_path, files)| DirectoryGroup {
                directory_path,
                processing_config: processing_config.clone(),
                file_count: files.len(),
                total_bytes: files.iter().map(|f| f.file_size).sum(),
                files,
            })
            .collect();

        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            batch_id: batch_id.into(),
            total_files: directories.iter().map(|d| d.file_count).sum(),
            total_bytes: directories.iter().map(|d| d.total_bytes).sum(),
            directories,
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &ManifestFile> {
        self.directories.iter().flat_map(|group| group.files.iter())
    }
}

// ---------------------------------------------------------------------------
// Entity store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct EntityVersion {
    pub id: String,
    pub tip: String,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default)]
    pub children_pi: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pi: Option<String>,
    pub tip: String,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct CreateEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default)]
    pub children_pi: Vec<String>,
}

/// Mutation applied by a new entity version.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, JsonSchema)]
pub struct VersionChanges {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components_remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_pi_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_pi_remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct AppendVersion {
    pub id: String,
    pub expect_tip: String,
    #[serde(flatten)]
    pub changes: VersionChanges,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, JsonSchema)]
pub struct RelationChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_children: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct UpdateRelations {
    pub parent_id: String,
    pub expect_tip: String,
    #[serde(flatten)]
    pub changes: RelationChanges,
}

/// New versions written by a relation update: the parent plus every child whose
/// `parent_pi` changed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct RelationsUpdated {
    pub parent: EntityVersion,
    #[serde(default)]
    pub children: Vec<EntityVersion>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ContentUploaded {
    pub cid: String,
    #[serde(default)]
    pub size: u64,
}

// ---------------------------------------------------------------------------
// chunks.json
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ChunkIndexEntry {
    pub id: String,
    pub cid: String,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ChunkedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub total_chars: usize,
    pub chunks: Vec<ChunkIndexEntry>,
}

/// Document stored under the `chunks.json` component of a directory entity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, JsonSchema)]
pub struct ChunkIndex {
    pub files: BTreeMap<String, ChunkedFile>,
}

// ---------------------------------------------------------------------------
// Downstream job
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, JsonSchema)]
pub struct DiscoveryResults {
    pub root_pi: Option<String>,
    pub node_pis: BTreeMap<String, String>,
    pub node_tips: BTreeMap<String, String>,
    pub node_versions: BTreeMap<String, u64>,
}

/// Message handed to the next pipeline stage once discovery completes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct DiscoveryJob {
    pub batch_id: String,
    pub manifest_key: String,
    pub total_files: usize,
    pub total_bytes: u64,
    pub directories: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pi: Option<String>,
    pub discovery: DiscoveryResults,
}

/// Documents exchanged with systems outside this workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Manifest,
    DiscoveryJob,
    ChunkIndex,
}

/// JSON Schema for `document`, for consumers validating what we write.
pub fn document_schema(document: Document) -> schemars::Schema {
    match document {
        Document::Manifest => schemars::schema_for!(Manifest),
        Document::DiscoveryJob => schemars::schema_for!(DiscoveryJob),
        Document::ChunkIndex => schemars::schema_for!(ChunkIndex),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(path: &str, size: u64) -> ManifestFile {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        ManifestFile {
            r2_key: format!("staging/b1{path}"),
            logical_path: path.to_string(),
            file_name: name,
            file_size: size,
            content_type: "text/plain".to_string(),
            cid: None,
        }
    }

    #[test]
    fn content_state_serializes_as_tagged_object() {
        let uploaded = serde_json::to_value(ContentState::Uploaded("bafy1".into())).unwrap();
        assert_eq!(uploaded, serde_json::json!({"state": "uploaded", "id": "bafy1"}));

        let failed = serde_json::to_value(ContentState::Failed).unwrap();
        assert_eq!(failed, serde_json::json!({"state": "failed"}));

        let back: ContentState = serde_json::from_value(uploaded).unwrap();
        assert_eq!(back.uploaded_id(), Some("bafy1"));
        assert!(ContentState::default().is_pending());
    }

    #[test]
    fn manifest_groups_files_by_directory() {
        let manifest = Manifest::from_files(
            "b1",
            vec![
                file("/a/b/one.md", 10),
                file("/root.txt", 5),
                file("/a/b/two.txt", 7),
            ],
            &ProcessingConfig::default(),
        );

        let dirs: Vec<&str> = manifest
            .directories
            .iter()
            .map(|d| d.directory_path.as_str())
            .collect();
        assert_eq!(dirs, vec!["/", "/a/b"]);
        assert_eq!(manifest.total_files, 3);
        assert_eq!(manifest.total_bytes, 22);
        assert_eq!(manifest.directories[1].file_count, 2);
        assert_eq!(manifest.directories[1].total_bytes, 17);
    }

    #[test]
    fn manifest_parses_external_document() {
        let raw = serde_json::json!({
            "batch_id": "b7",
            "directories": [{
                "directory_path": "/docs",
                "processing_config": {"ocr": true, "describe": false, "pinax": true, "model": "x"},
                "file_count": 1,
                "total_bytes": 3,
                "files": [{
                    "r2_key": "staging/b7/docs/a.md",
                    "logical_path": "/docs/a.md",
                    "file_name": "a.md",
                    "file_size": 3,
                    "content_type": "text/markdown"
                }]
            }],
            "total_files": 1,
            "total_bytes": 3
        });
        let manifest: Manifest = serde_json::from_value(raw).unwrap();
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
        let config = &manifest.directories[0].processing_config;
        assert!(config.ocr);
        assert_eq!(config.extra.get("model"), Some(&serde_json::json!("x")));
        assert_eq!(manifest.files().count(), 1);
    }

    #[test]
    fn append_version_flattens_changes() {
        let req = AppendVersion {
            id: "pi_1".into(),
            expect_tip: "t1".into(),
            changes: VersionChanges {
                children_pi_add: vec!["pi_2".into()],
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"id": "pi_1", "expect_tip": "t1", "children_pi_add": ["pi_2"]})
        );
    }

    #[test]
    fn manifest_key_is_batch_scoped() {
        assert_eq!(manifest_key("b1"), "staging/b1/_manifest.json");
    }

    #[test]
    fn schemas_describe_top_level_fields() {
        let manifest = serde_json::to_value(document_schema(Document::Manifest)).unwrap();
        assert!(manifest["properties"]["directories"].is_object());

        let job = serde_json::to_value(document_schema(Document::DiscoveryJob)).unwrap();
        let required: Vec<&str> = job["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"batch_id"));
        assert!(!required.contains(&"parent_pi"));
    }
}
