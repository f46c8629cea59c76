use ingest_protocol::{paths::ROOT_PATH, ContentState, DiscoveryResults, EntityVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Discovery phases, in strict forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Uploading,
    Chunking,
    Publishing,
    Relationships,
    Done,
    Error,
}

impl Phase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Chunking => "CHUNKING",
            Self::Publishing => "PUBLISHING",
            Self::Relationships => "RELATIONSHIPS",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    #[serde(default)]
    pub content: ContentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFile {
    pub filename: String,
    /// Blob-store key of the raw upload
    pub source_key: String,
    #[serde(default)]
    pub content: ContentState,
    #[serde(default)]
    pub total_chars: usize,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub chunks_done: bool,
}

impl TextFile {
    pub fn new(filename: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            source_key: source_key.into(),
            content: ContentState::NotAttempted,
            total_chars: 0,
            chunks: Vec::new(),
            chunks_done: false,
        }
    }

    pub fn has_uploaded_chunks(&self) -> bool {
        self.chunks.iter().any(|chunk| chunk.content.uploaded_id().is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub path: String,
    pub depth: usize,
    pub parent_path: Option<String>,
    pub children_paths: BTreeSet<String>,
    pub text_files: Vec<TextFile>,
    pub published: bool,
    pub relationships_set: bool,
    /// Latest known version of this directory's entity, once published
    pub entity: Option<EntityVersion>,
}

impl DirectoryNode {
    pub fn new(path: impl Into<String>, depth: usize, parent_path: Option<String>) -> Self {
        Self {
            path: path.into(),
            depth,
            parent_path,
            children_paths: BTreeSet::new(),
            text_files: Vec::new(),
            published: false,
            relationships_set: false,
            entity: None,
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity.as_ref().map(|entity| entity.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCounters {
    pub directories_total: usize,
    pub directories_published: usize,
    pub files_total: usize,
    pub files_uploaded: usize,
    pub chunks_total: usize,
    pub chunks_uploaded: usize,
}

/// Point-in-time view of a discovery run, cheap to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub phase: Phase,
    pub current_depth: usize,
    #[serde(flatten)]
    pub counters: DiscoveryCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Whole mutable state of one discovery run, persisted as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub nodes: BTreeMap<String, DirectoryNode>,
    pub phase: Phase,
    pub current_depth: usize,
    #[serde(flatten)]
    pub counters: DiscoveryCounters,
    #[serde(default)]
    pub node_entity_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub node_tips: BTreeMap<String, String>,
    #[serde(default)]
    pub node_versions: BTreeMap<String, u64>,
    /// Entity the root gets attached to once the tree is wired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl DiscoveryState {
    pub fn root(&self) -> Option<&DirectoryNode> {
        self.nodes.get(ROOT_PATH)
    }

    pub fn root_pi(&self) -> Option<&str> {
        self.node_entity_ids.get(ROOT_PATH).map(String::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// A node may be published once every child is.
    pub fn is_eligible(&self, node: &DirectoryNode) -> bool {
        !node.published
            && node
                .children_paths
                .iter()
                .all(|child| self.nodes.get(child).is_some_and(|c| c.published))
    }

    pub fn pending_files(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|node| &node.text_files)
            .filter(|file| file.content.is_pending())
            .count()
    }

    pub fn pending_chunks(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|node| &node.text_files)
            .flat_map(|file| &file.chunks)
            .filter(|chunk| chunk.content.is_pending())
            .count()
    }

    /// Record a published or re-versioned entity on its node and in the lookup maps.
    ///
    /// Older versions than the one already recorded are ignored.
    pub fn record_entity(&mut self, path: &str, version: EntityVersion) {
        let Some(node) = self.nodes.get_mut(path) else {
            return;
        };
        if node
            .entity
            .as_ref()
            .is_some_and(|current| current.id == version.id && current.version >= version.version)
        {
            return;
        }
        self.node_entity_ids
            .insert(path.to_string(), version.id.clone());
        self.node_tips.insert(path.to_string(), version.tip.clone());
        self.node_versions.insert(path.to_string(), version.version);
        node.entity = Some(version);
    }

    /// Path of the node whose entity has `id`.
    pub fn path_for_entity(&self, id: &str) -> Option<String> {
        self.node_entity_ids
            .iter()
            .find(|(_, entity_id)| entity_id.as_str() == id)
            .map(|(path, _)| path.clone())
    }

    /// Count one failed step. Returns `true` once the retry budget is spent and
    /// the run has moved to [`Phase::Error`].
    pub fn record_step_failure(&mut self, message: impl Into<String>, max_attempts: u32) -> bool {
        self.retry_count += 1;
        self.error = Some(message.into());
        if self.retry_count >= max_attempts {
            self.phase = Phase::Error;
            return true;
        }
        false
    }

    pub fn record_step_success(&mut self) {
        if self.phase != Phase::Error {
            self.retry_count = 0;
            self.error = None;
        }
    }

    pub fn progress(&self) -> DiscoveryProgress {
        DiscoveryProgress {
            phase: self.phase,
            current_depth: self.current_depth,
            counters: self.counters,
            error: self.error.clone(),
            retry_count: self.retry_count,
        }
    }

    pub fn results(&self) -> DiscoveryResults {
        DiscoveryResults {
            root_pi: self.root_pi().map(str::to_string),
            node_pis: self.node_entity_ids.clone(),
            node_tips: self.node_tips.clone(),
            node_versions: self.node_versions.clone(),
        }
    }
}
