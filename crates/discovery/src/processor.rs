use crate::config::{DiscoveryConfig, StepLimits};
use crate::error::{DiscoveryError, Result};
use crate::state::{Chunk, DiscoveryState, Phase};
use futures::future::join_all;
use ingest_protocol::{
    ChunkIndex, ChunkIndexEntry, ChunkedFile, ContentState, CreateEntity, DiscoveryResults,
    EntityVersion, RelationChanges, RelationsUpdated, CHUNKS_COMPONENT, PI_ENTITY_TYPE,
};
use ingest_store::{BlobStore, EntityClient, RetryPolicy, StoreError};
use ingest_text_chunker::TextChunker;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a single step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    /// Phase the step ran in
    pub phase: Phase,
    /// Items (files, chunks, directories or parents) handled
    pub processed: usize,
    /// Whether another step is needed
    pub has_more: bool,
}

struct FileJob {
    path: String,
    index: usize,
    filename: String,
    source_key: String,
}

enum FileOutcome {
    Uploaded {
        cid: String,
        total_chars: usize,
        chunks: Vec<Chunk>,
    },
    Failed,
}

struct ChunkJob {
    path: String,
    file_index: usize,
    chunk_index: usize,
    label: String,
    text: String,
}

struct PublishJob {
    path: String,
    components: BTreeMap<String, String>,
    chunk_index: Option<ChunkIndex>,
    children_pi: Vec<String>,
}

struct RelationJob {
    path: String,
    parent_id: String,
    children: Vec<String>,
}

/// Runs discovery one bounded step at a time.
///
/// The processor holds no run state: everything it needs to continue is in the
/// [`DiscoveryState`] it is handed, so a state persisted after any step can be
/// resumed by a fresh processor.
pub struct DiscoveryProcessor {
    entities: EntityClient,
    blobs: Arc<dyn BlobStore>,
    chunker: TextChunker,
}

impl DiscoveryProcessor {
    pub fn new(
        entities: EntityClient,
        blobs: Arc<dyn BlobStore>,
        config: &DiscoveryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entities,
            blobs,
            chunker: TextChunker::new(config.chunking.clone())?,
        })
    }

    /// Execute one phase's batch.
    ///
    /// Step-level failures (entity creation) are returned as errors after the
    /// successful items of the batch have been recorded in `state`.
    pub async fn step(&self, state: &mut DiscoveryState, limits: &StepLimits) -> Result<StepReport> {
        let phase = state.phase;
        let processed = match phase {
            Phase::Uploading => self.upload_files(state, limits.files).await,
            Phase::Chunking => self.upload_chunks(state, limits.chunks).await,
            Phase::Publishing => self.publish(state, limits.directories).await?,
            Phase::Relationships => self.wire_relationships(state, limits.directories).await,
            Phase::Done | Phase::Error => 0,
        };
        Ok(StepReport {
            phase,
            processed,
            has_more: !state.is_finished(),
        })
    }

    /// Drive `state` to a terminal phase, retrying failed steps with backoff.
    pub async fn run_to_completion(
        &self,
        state: &mut DiscoveryState,
        limits: &StepLimits,
        step_retry: &RetryPolicy,
    ) -> Result<DiscoveryResults> {
        while !state.is_finished() {
            match self.step(state, limits).await {
                Ok(_) => state.record_step_success(),
                Err(err) => {
                    let attempt = state.retry_count;
                    if state.record_step_failure(err.to_string(), step_retry.max_attempts) {
                        error!(
                            "discovery failed in {} after {} attempts: {err}",
                            state.phase, state.retry_count
                        );
                        break;
                    }
                    let delay = step_retry.jittered_delay(attempt);
                    warn!(
                        "discovery step failed (attempt {}), retrying in {delay:?}: {err}",
                        state.retry_count
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if state.phase == Phase::Error {
            return Err(DiscoveryError::Failed {
                retries: state.retry_count,
                message: state.error.clone().unwrap_or_default(),
            });
        }
        Ok(state.results())
    }

    // -----------------------------------------------------------------------
    // UPLOADING
    // -----------------------------------------------------------------------

    async fn upload_files(&self, state: &mut DiscoveryState, limit: usize) -> usize {
        let jobs: Vec<FileJob> = state
            .nodes
            .iter()
            .flat_map(|(path, node)| {
                node.text_files
                    .iter()
                    .enumerate()
                    .filter(|(_, file)| file.content.is_pending())
                    .map(move |(index, file)| FileJob {
                        path: path.clone(),
                        index,
                        filename: file.filename.clone(),
                        source_key: file.source_key.clone(),
                    })
            })
            .take(limit)
            .collect();

        let outcomes = join_all(jobs.iter().map(|job| self.upload_file(job))).await;
        let processed = jobs.len();

        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            let Some(file) = state
                .nodes
                .get_mut(&job.path)
                .and_then(|node| node.text_files.get_mut(job.index))
            else {
                continue;
            };
            match outcome {
                FileOutcome::Uploaded {
                    cid,
                    total_chars,
                    chunks,
                } => {
                    file.content = ContentState::Uploaded(cid);
                    file.total_chars = total_chars;
                    file.chunks_done = chunks.is_empty();
                    state.counters.chunks_total += chunks.len();
                    file.chunks = chunks;
                }
                FileOutcome::Failed => {
                    file.content = ContentState::Failed;
                    file.chunks_done = true;
                }
            }
            state.counters.files_uploaded += 1;
        }

        if state.pending_files() == 0 {
            state.phase = if state.counters.chunks_total > 0 {
                Phase::Chunking
            } else {
                Phase::Publishing
            };
            info!(
                "uploaded {}/{} files, {} chunks planned; entering {}",
                state.counters.files_uploaded,
                state.counters.files_total,
                state.counters.chunks_total,
                state.phase
            );
        }
        processed
    }

    async fn upload_file(&self, job: &FileJob) -> FileOutcome {
        let bytes = match self.blobs.get(&job.source_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!("{}/{}: no blob at {}", job.path, job.filename, job.source_key);
                return FileOutcome::Failed;
            }
            Err(err) => {
                warn!("{}/{}: blob read failed: {err}", job.path, job.filename);
                return FileOutcome::Failed;
            }
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        };

        match self
            .entities
            .upload_content(&text, Some(&job.filename))
            .await
        {
            Ok(cid) => {
                let chunks = self
                    .chunker
                    .plan(&text)
                    .into_iter()
                    .map(|chunk| Chunk {
                        id: chunk.id,
                        text: chunk.text,
                        char_start: chunk.char_start,
                        char_end: chunk.char_end,
                        content: ContentState::NotAttempted,
                    })
                    .collect();
                FileOutcome::Uploaded {
                    cid,
                    total_chars: text.chars().count(),
                    chunks,
                }
            }
            Err(err) => {
                warn!("{}/{}: upload failed: {err}", job.path, job.filename);
                FileOutcome::Failed
            }
        }
    }

    // -----------------------------------------------------------------------
    // CHUNKING
    // -----------------------------------------------------------------------

    async fn upload_chunks(&self, state: &mut DiscoveryState, limit: usize) -> usize {
        let mut jobs = Vec::new();
        'collect: for (path, node) in &state.nodes {
            for (file_index, file) in node.text_files.iter().enumerate() {
                if file.chunks_done {
                    continue;
                }
                for (chunk_index, chunk) in file.chunks.iter().enumerate() {
                    if !chunk.content.is_pending() {
                        continue;
                    }
                    if jobs.len() >= limit {
                        break 'collect;
                    }
                    jobs.push(ChunkJob {
                        path: path.clone(),
                        file_index,
                        chunk_index,
                        label: format!("{}.{}", file.filename, chunk.id),
                        text: chunk.text.clone(),
                    });
                }
            }
        }

        let outcomes = join_all(jobs.iter().map(|job| async move {
            match self.entities.upload_content(&job.text, Some(&job.label)).await {
                Ok(cid) => ContentState::Uploaded(cid),
                Err(err) => {
                    warn!("{}/{}: chunk upload failed: {err}", job.path, job.label);
                    ContentState::Failed
                }
            }
        }))
        .await;
        let processed = jobs.len();

        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            if let Some(file) = state
                .nodes
                .get_mut(&job.path)
                .and_then(|node| node.text_files.get_mut(job.file_index))
            {
                if let Some(chunk) = file.chunks.get_mut(job.chunk_index) {
                    chunk.content = outcome;
                    state.counters.chunks_uploaded += 1;
                }
                file.chunks_done = file.chunks.iter().all(|c| !c.content.is_pending());
            }
        }

        if state.pending_chunks() == 0 {
            state.phase = Phase::Publishing;
            info!(
                "uploaded {}/{} chunks; entering {}",
                state.counters.chunks_uploaded, state.counters.chunks_total, state.phase
            );
        }
        processed
    }

    // -----------------------------------------------------------------------
    // PUBLISHING
    // -----------------------------------------------------------------------

    async fn publish(&self, state: &mut DiscoveryState, limit: usize) -> Result<usize> {
        let jobs = loop {
            let jobs = Self::eligible_at_depth(state, limit);
            if !jobs.is_empty() {
                break jobs;
            }
            if state.current_depth == 0 {
                state.phase = Phase::Relationships;
                info!(
                    "published {}/{} directories; entering {}",
                    state.counters.directories_published,
                    state.counters.directories_total,
                    state.phase
                );
                return Ok(0);
            }
            state.current_depth -= 1;
            debug!("publishing moves up to depth {}", state.current_depth);
        };

        let outcomes = join_all(jobs.iter().map(|job| self.publish_directory(job))).await;
        let processed = jobs.len();

        let mut first_error = None;
        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            match outcome {
                Ok(version) => {
                    if let Some(node) = state.nodes.get_mut(&job.path) {
                        node.published = true;
                    }
                    state.record_entity(&job.path, version);
                    state.counters.directories_published += 1;
                }
                Err(source) => {
                    error!("{}: entity creation failed: {source}", job.path);
                    if first_error.is_none() {
                        first_error = Some(DiscoveryError::PublishFailed {
                            path: job.path,
                            source,
                        });
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(processed),
        }
    }

    fn eligible_at_depth(state: &DiscoveryState, limit: usize) -> Vec<PublishJob> {
        state
            .nodes
            .values()
            .filter(|node| node.depth == state.current_depth && state.is_eligible(node))
            .take(limit)
            .map(|node| {
                let mut components = BTreeMap::new();
                let mut index = ChunkIndex::default();
                for file in &node.text_files {
                    let Some(cid) = file.content.uploaded_id() else {
                        continue;
                    };
                    components.insert(file.filename.clone(), cid.to_string());
                    if !file.has_uploaded_chunks() {
                        continue;
                    }
                    let chunks = file
                        .chunks
                        .iter()
                        .filter_map(|chunk| {
                            chunk.content.uploaded_id().map(|chunk_cid| ChunkIndexEntry {
                                id: chunk.id.clone(),
                                cid: chunk_cid.to_string(),
                                char_start: chunk.char_start,
                                char_end: chunk.char_end,
                            })
                        })
                        .collect();
                    index.files.insert(
                        file.filename.clone(),
                        ChunkedFile {
                            cid: Some(cid.to_string()),
                            total_chars: file.total_chars,
                            chunks,
                        },
                    );
                }

                let children_pi = node
                    .children_paths
                    .iter()
                    .filter_map(|child| state.nodes.get(child).and_then(|c| c.entity_id()))
                    .map(str::to_string)
                    .collect();

                PublishJob {
                    path: node.path.clone(),
                    components,
                    chunk_index: (!index.files.is_empty()).then_some(index),
                    children_pi,
                }
            })
            .collect()
    }

    async fn publish_directory(&self, job: &PublishJob) -> std::result::Result<EntityVersion, StoreError> {
        let mut components = job.components.clone();
        if let Some(index) = &job.chunk_index {
            match self.upload_chunk_index(index).await {
                Ok(cid) => {
                    components.insert(CHUNKS_COMPONENT.to_string(), cid);
                }
                Err(err) => warn!("{}: {CHUNKS_COMPONENT} upload failed: {err}", job.path),
            }
        }

        let created = self
            .entities
            .create_entity(CreateEntity {
                entity_type: PI_ENTITY_TYPE.to_string(),
                components,
                children_pi: job.children_pi.clone(),
            })
            .await?;
        debug!("{} published as {} (v{})", job.path, created.id, created.version);
        Ok(created)
    }

    async fn upload_chunk_index(&self, index: &ChunkIndex) -> std::result::Result<String, StoreError> {
        let body = serde_json::to_string(index)?;
        self.entities
            .upload_content(&body, Some(CHUNKS_COMPONENT))
            .await
    }

    // -----------------------------------------------------------------------
    // RELATIONSHIPS
    // -----------------------------------------------------------------------

    async fn wire_relationships(&self, state: &mut DiscoveryState, limit: usize) -> usize {
        let jobs: Vec<RelationJob> = state
            .nodes
            .values()
            .filter(|node| {
                node.published && !node.relationships_set && !node.children_paths.is_empty()
            })
            .filter_map(|node| {
                let parent_id = node.entity_id()?.to_string();
                let children = node
                    .children_paths
                    .iter()
                    .filter_map(|child| state.nodes.get(child).and_then(|c| c.entity_id()))
                    .map(str::to_string)
                    .collect();
                Some(RelationJob {
                    path: node.path.clone(),
                    parent_id,
                    children,
                })
            })
            .take(limit)
            .collect();

        if jobs.is_empty() {
            self.attach_root(state).await;
            state.phase = Phase::Done;
            info!(
                "discovery done: root {}",
                state.root_pi().unwrap_or("<unpublished>")
            );
            return 0;
        }

        let outcomes = join_all(jobs.iter().map(|job| {
            self.entities.update_relations(
                &job.parent_id,
                RelationChanges {
                    add_children: job.children.clone(),
                    remove_children: Vec::new(),
                },
            )
        }))
        .await;
        let processed = jobs.len();

        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            match outcome {
                Ok(updated) => apply_relation_versions(state, updated),
                Err(err) => warn!("{}: linking children failed: {err}", job.path),
            }
            if let Some(node) = state.nodes.get_mut(&job.path) {
                node.relationships_set = true;
            }
        }
        processed
    }

    /// Best-effort link of the root under an external parent.
    async fn attach_root(&self, state: &mut DiscoveryState) {
        let (Some(parent_pi), Some(root_pi)) = (state.parent_pi.clone(), state.root_pi()) else {
            return;
        };
        let changes = RelationChanges {
            add_children: vec![root_pi.to_string()],
            remove_children: Vec::new(),
        };
        match self.entities.update_relations(&parent_pi, changes).await {
            Ok(updated) => {
                // only the root's new version matters here; the parent is not ours
                for child in updated.children {
                    if let Some(path) = state.path_for_entity(&child.id) {
                        state.record_entity(&path, child);
                    }
                }
            }
            Err(err) => warn!("attaching root to {parent_pi} failed: {err}"),
        }
    }
}

fn apply_relation_versions(state: &mut DiscoveryState, updated: RelationsUpdated) {
    for version in std::iter::once(updated.parent).chain(updated.children) {
        if let Some(path) = state.path_for_entity(&version.id) {
            state.record_entity(&path, version);
        }
    }
}
