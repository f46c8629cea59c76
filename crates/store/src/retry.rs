use crate::error::{Result, StoreError};
use crate::traits::EntityStore;
use ingest_protocol::{
    AppendVersion, CreateEntity, EntityVersion, RelationChanges, RelationsUpdated,
    UpdateRelations, VersionChanges,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff schedule: `min(max_delay, base_delay * 2^attempt)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub const fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Equal jitter: half the backoff is fixed, the other half random.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let full = self.delay_for(attempt).as_millis() as u64;
        let half = full / 2;
        if half == 0 {
            return Duration::from_millis(full);
        }
        let mut bytes = [0u8; 8];
        let random = match getrandom::getrandom(&mut bytes) {
            Ok(()) => u64::from_le_bytes(bytes),
            Err(_) => 0,
        };
        Duration::from_millis(full - half + random % (half + 1))
    }
}

/// Entity store access with optimistic-concurrency retry on every mutation.
///
/// Uploads and creations carry no precondition and pass straight through;
/// callers decide what a failure means for the item.
#[derive(Clone)]
pub struct EntityClient {
    store: Arc<dyn EntityStore>,
    policy: RetryPolicy,
}

impl EntityClient {
    pub fn new(store: Arc<dyn EntityStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub async fn upload_content(&self, text: &str, filename: Option<&str>) -> Result<String> {
        self.store.upload_content(text, filename).await
    }

    pub async fn create_entity(&self, request: CreateEntity) -> Result<EntityVersion> {
        self.store.create_entity(request).await
    }

    pub async fn get_tip(&self, id: &str) -> Result<String> {
        self.store.get_tip(id).await
    }

    /// Append a version to `id`, re-reading the tip before every attempt.
    pub async fn append_version(&self, id: &str, changes: VersionChanges) -> Result<EntityVersion> {
        let mut attempt = 0;
        loop {
            let outcome = match self.store.get_tip(id).await {
                Ok(tip) => {
                    self.store
                        .append_version(AppendVersion {
                            id: id.to_string(),
                            expect_tip: tip,
                            changes: changes.clone(),
                        })
                        .await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(version) => return Ok(version),
                Err(err) => {
                    attempt += 1;
                    self.backoff_or_fail(id, "append_version", attempt, err).await?;
                }
            }
        }
    }

    /// Link or unlink children of `parent_id`, re-reading the parent tip before every attempt.
    pub async fn update_relations(
        &self,
        parent_id: &str,
        changes: RelationChanges,
    ) -> Result<RelationsUpdated> {
        let mut attempt = 0;
        loop {
            let outcome = match self.store.get_tip(parent_id).await {
                Ok(tip) => {
                    self.store
                        .update_relations(UpdateRelations {
                            parent_id: parent_id.to_string(),
                            expect_tip: tip,
                            changes: changes.clone(),
                        })
                        .await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(updated) => return Ok(updated),
                Err(err) => {
                    attempt += 1;
                    self.backoff_or_fail(parent_id, "update_relations", attempt, err)
                        .await?;
                }
            }
        }
    }

    async fn backoff_or_fail(
        &self,
        id: &str,
        operation: &str,
        attempt: u32,
        err: StoreError,
    ) -> Result<()> {
        if attempt >= self.policy.max_attempts {
            log::error!("{operation} on {id} gave up after {attempt} attempts: {err}");
            return Err(StoreError::RetriesExhausted {
                id: id.to_string(),
                operation: operation.to_string(),
                attempts: attempt,
                last_error: err.to_string(),
            });
        }

        let delay = self.policy.jittered_delay(attempt - 1);
        if err.is_conflict() {
            log::debug!("{operation} on {id}: tip conflict, retry {attempt} in {delay:?}");
        } else {
            log::warn!("{operation} on {id} failed ({err}), retry {attempt} in {delay:?}");
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
