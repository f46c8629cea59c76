use crate::error::{Result, StoreError};
use crate::traits::{BlobStore, EntityStore};
use async_trait::async_trait;
use ingest_protocol::{
    AppendVersion, CreateEntity, Entity, EntityVersion, RelationsUpdated, UpdateRelations,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// In-process entity store with the same conflict semantics as the remote service.
///
/// Content addresses are `sha256:<hex>` of the text, entity ids are sequential
/// (`pi_000001`, ...), and tips are the hash of each serialized version, so two
/// stores fed the same calls in the same order produce identical ids and tips.
#[derive(Default)]
pub struct MemoryEntityStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    contents: HashMap<String, String>,
    entities: BTreeMap<String, Entity>,
    next_id: u64,
    upload_calls: u64,
    failing_filenames: HashSet<String>,
    failing_creates: u32,
    injected_conflicts: HashMap<String, u32>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Every upload carrying this filename fails.
    pub fn fail_uploads_for(&self, filename: impl Into<String>) {
        self.state().failing_filenames.insert(filename.into());
    }

    /// The next `count` entity creations fail.
    pub fn fail_next_creates(&self, count: u32) {
        self.state().failing_creates = count;
    }

    /// The next `count` mutations of `id` report a tip conflict.
    pub fn inject_conflicts(&self, id: impl Into<String>, count: u32) {
        self.state().injected_conflicts.insert(id.into(), count);
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.state().entities.get(id).cloned()
    }

    pub fn content(&self, cid: &str) -> Option<String> {
        self.state().contents.get(cid).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.state().entities.len()
    }

    pub fn upload_calls(&self) -> u64 {
        self.state().upload_calls
    }
}

pub fn content_address(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

fn compute_tip(entity: &Entity) -> Result<String> {
    let body = serde_json::to_vec(&(
        &entity.id,
        entity.version,
        &entity.entity_type,
        &entity.components,
        &entity.children_pi,
        &entity.parent_pi,
    ))?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    Ok(format!("tip:{:x}", hasher.finalize()))
}

fn bump(entity: &mut Entity) -> Result<EntityVersion> {
    entity.version += 1;
    entity.tip = compute_tip(entity)?;
    Ok(version_of(entity))
}

fn version_of(entity: &Entity) -> EntityVersion {
    EntityVersion {
        id: entity.id.clone(),
        tip: entity.tip.clone(),
        version: entity.version,
    }
}

impl MemoryState {
    fn check_tip(&mut self, id: &str, expect_tip: &str) -> Result<()> {
        if let Some(remaining) = self.injected_conflicts.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected_tip: expect_tip.to_string(),
                });
            }
        }

        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if entity.tip != expect_tip {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected_tip: expect_tip.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn upload_content(&self, text: &str, filename: Option<&str>) -> Result<String> {
        let mut state = self.state();
        state.upload_calls += 1;
        if let Some(name) = filename {
            if state.failing_filenames.contains(name) {
                return Err(StoreError::Transport(format!("upload of {name} refused")));
            }
        }
        let cid = content_address(text);
        state.contents.insert(cid.clone(), text.to_string());
        Ok(cid)
    }

    async fn create_entity(&self, request: CreateEntity) -> Result<EntityVersion> {
        let mut state = self.state();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(StoreError::Transport("entity create refused".to_string()));
        }

        state.next_id += 1;
        let mut entity = Entity {
            id: format!("pi_{:06}", state.next_id),
            entity_type: request.entity_type,
            components: request.components,
            children_pi: request.children_pi,
            parent_pi: None,
            tip: String::new(),
            version: 0,
        };
        let created = bump(&mut entity)?;
        state.entities.insert(entity.id.clone(), entity);
        Ok(created)
    }

    async fn append_version(&self, request: AppendVersion) -> Result<EntityVersion> {
        let mut state = self.state();
        state.check_tip(&request.id, &request.expect_tip)?;

        let entity = state
            .entities
            .get_mut(&request.id)
            .ok_or_else(|| StoreError::NotFound(request.id.clone()))?;
        let changes = request.changes;
        for name in &changes.components_remove {
            entity.components.remove(name);
        }
        entity.components.extend(changes.components);
        entity
            .children_pi
            .retain(|child| !changes.children_pi_remove.contains(child));
        for child in changes.children_pi_add {
            if !entity.children_pi.contains(&child) {
                entity.children_pi.push(child);
            }
        }
        bump(entity)
    }

    async fn get_tip(&self, id: &str) -> Result<String> {
        self.state()
            .entities
            .get(id)
            .map(|entity| entity.tip.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_relations(&self, request: UpdateRelations) -> Result<RelationsUpdated> {
        let mut state = self.state();
        state.check_tip(&request.parent_id, &request.expect_tip)?;

        let changes = request.changes;
        for child in changes.add_children.iter().chain(&changes.remove_children) {
            if !state.entities.contains_key(child) {
                return Err(StoreError::NotFound(child.clone()));
            }
        }

        let mut children = Vec::new();
        for child_id in &changes.add_children {
            if let Some(child) = state.entities.get_mut(child_id) {
                child.parent_pi = Some(request.parent_id.clone());
                children.push(bump(child)?);
            }
        }
        for child_id in &changes.remove_children {
            if let Some(child) = state.entities.get_mut(child_id) {
                if child.parent_pi.as_deref() == Some(request.parent_id.as_str()) {
                    child.parent_pi = None;
                    children.push(bump(child)?);
                }
            }
        }

        let parent = state
            .entities
            .get_mut(&request.parent_id)
            .ok_or_else(|| StoreError::NotFound(request.parent_id.clone()))?;
        parent
            .children_pi
            .retain(|child| !changes.remove_children.contains(child));
        for child in changes.add_children {
            if !parent.children_pi.contains(&child) {
                parent.children_pi.push(child);
            }
        }
        let parent = bump(parent)?;

        Ok(RelationsUpdated { parent, children })
    }
}

/// Blob store backed by a map, for tests and dry runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), bytes.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}
