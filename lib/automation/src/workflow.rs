//! The workflow record and its store.
//!
//! A [`Workflow`] binds one dataset (`InitId`) to a set of trigger
//! configurations under one owner. The store enforces the dataset's
//! one-workflow invariant and the immutability of `id`/`initId`/`ownerId`/
//! `created` once a workflow exists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use flowcore_core::{InitId, OwnerId, WorkflowId};

use crate::error::WorkflowStoreError;

/// One dataset's workflow: its trigger configuration and active flag.
///
/// `triggers` holds open configuration maps rather than materialized
/// [`flowcore_triggers::trigger::Trigger`] values — the store persists
/// configuration, not behavior; the orchestrator is what turns a
/// configuration into a live trigger via the listener registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub init_id: InitId,
    pub owner_id: OwnerId,
    pub created: DateTime<Utc>,
    pub active: bool,
    pub triggers: Vec<Map<String, Value>>,
}

impl Workflow {
    /// A new, as-yet-unsaved workflow: `id` is nil until [`WorkflowStore::put`]
    /// assigns one.
    #[must_use]
    pub fn new(init_id: InitId, owner_id: OwnerId, active: bool, triggers: Vec<Map<String, Value>>) -> Self {
        Self {
            id: WorkflowId::nil(),
            init_id,
            owner_id,
            created: Utc::now(),
            active,
            triggers,
        }
    }
}

/// CRUD access to the deployed workflow set.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Creates (`id` nil) or updates (`id` set) a workflow.
    ///
    /// # Errors
    ///
    /// On create: [`WorkflowStoreError::DatasetAlreadyAutomated`] if another
    /// workflow already automates `init_id`. On update:
    /// [`WorkflowStoreError::NotFound`] if `id` doesn't exist, or
    /// [`WorkflowStoreError::ImmutableFieldChanged`] if `init_id`, `owner_id`,
    /// or `created` differ from the stored record.
    async fn put(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError>;

    /// Fetches a workflow by id.
    ///
    /// # Errors
    ///
    /// [`WorkflowStoreError::NotFound`] if no such workflow exists.
    async fn get(&self, id: WorkflowId) -> Result<Workflow, WorkflowStoreError>;

    /// Fetches the workflow that automates `init_id`, if any.
    ///
    /// # Errors
    ///
    /// [`WorkflowStoreError::NotFoundByInitId`] if no workflow automates it.
    async fn get_by_init_id(&self, init_id: &InitId) -> Result<Workflow, WorkflowStoreError>;

    /// Lists workflows in creation order, optionally filtered to active (or
    /// inactive) ones, paginated by `offset`/`limit`.
    async fn list(&self, offset: usize, limit: usize, only_active: Option<bool>) -> Vec<Workflow>;

    /// Removes a workflow.
    ///
    /// # Errors
    ///
    /// [`WorkflowStoreError::NotFound`] if `id` doesn't exist.
    async fn remove(&self, id: WorkflowId) -> Result<(), WorkflowStoreError>;

    /// Releases any resources (file handles, background flush tasks) held by
    /// the store. A no-op for the in-memory implementation.
    async fn shutdown(&self);
}

#[derive(Default)]
struct Index {
    order: Vec<WorkflowId>,
    by_id: HashMap<WorkflowId, Workflow>,
    by_init_id: HashMap<InitId, WorkflowId>,
}

impl Index {
    fn put(&mut self, mut workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        if workflow.id.is_nil() {
            if self.by_init_id.contains_key(&workflow.init_id) {
                return Err(WorkflowStoreError::DatasetAlreadyAutomated {
                    init_id: workflow.init_id.clone(),
                });
            }
            workflow.id = WorkflowId::new();
            workflow.created = Utc::now();
            self.order.push(workflow.id);
            self.by_init_id.insert(workflow.init_id.clone(), workflow.id);
            self.by_id.insert(workflow.id, workflow.clone());
            Ok(workflow)
        } else {
            let existing = self.by_id.get(&workflow.id).ok_or(WorkflowStoreError::NotFound { id: workflow.id })?;
            if existing.init_id != workflow.init_id {
                return Err(WorkflowStoreError::ImmutableFieldChanged { field: "initId" });
            }
            if existing.owner_id != workflow.owner_id {
                return Err(WorkflowStoreError::ImmutableFieldChanged { field: "ownerId" });
            }
            if existing.created != workflow.created {
                return Err(WorkflowStoreError::ImmutableFieldChanged { field: "created" });
            }
            self.by_id.insert(workflow.id, workflow.clone());
            Ok(workflow)
        }
    }

    fn remove(&mut self, id: WorkflowId) -> Result<(), WorkflowStoreError> {
        let workflow = self.by_id.remove(&id).ok_or(WorkflowStoreError::NotFound { id })?;
        self.by_init_id.remove(&workflow.init_id);
        self.order.retain(|&wid| wid != id);
        Ok(())
    }

    fn list(&self, offset: usize, limit: usize, only_active: Option<bool>) -> Vec<Workflow> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|w| only_active.is_none_or(|active| w.active == active))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// An in-process [`WorkflowStore`] backed by nothing but memory. Used in
/// tests and single-process deployments with no durability requirement.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    index: RwLock<Index>,
}

impl InMemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn put(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        self.index.write().expect("workflow index lock poisoned").put(workflow)
    }

    async fn get(&self, id: WorkflowId) -> Result<Workflow, WorkflowStoreError> {
        self.index
            .read()
            .expect("workflow index lock poisoned")
            .by_id
            .get(&id)
            .cloned()
            .ok_or(WorkflowStoreError::NotFound { id })
    }

    async fn get_by_init_id(&self, init_id: &InitId) -> Result<Workflow, WorkflowStoreError> {
        let index = self.index.read().expect("workflow index lock poisoned");
        let id = index
            .by_init_id
            .get(init_id)
            .copied()
            .ok_or_else(|| WorkflowStoreError::NotFoundByInitId {
                init_id: init_id.clone(),
            })?;
        Ok(index.by_id.get(&id).expect("by_init_id entry without a by_id entry").clone())
    }

    async fn list(&self, offset: usize, limit: usize, only_active: Option<bool>) -> Vec<Workflow> {
        self.index.read().expect("workflow index lock poisoned").list(offset, limit, only_active)
    }

    async fn remove(&self, id: WorkflowId) -> Result<(), WorkflowStoreError> {
        self.index.write().expect("workflow index lock poisoned").remove(id)
    }

    async fn shutdown(&self) {}
}

/// The on-disk shape from the file-backed store: `{ "Workflows": { "set": [...] } }`.
#[derive(Serialize, Deserialize)]
struct FileRecord {
    id: WorkflowId,
    #[serde(rename = "initID")]
    init_id: InitId,
    #[serde(rename = "ownerID")]
    owner_id: OwnerId,
    created: DateTime<Utc>,
    active: bool,
    triggers: Vec<Map<String, Value>>,
}

impl From<&Workflow> for FileRecord {
    fn from(w: &Workflow) -> Self {
        Self {
            id: w.id,
            init_id: w.init_id.clone(),
            owner_id: w.owner_id.clone(),
            created: w.created,
            active: w.active,
            triggers: w.triggers.clone(),
        }
    }
}

impl From<FileRecord> for Workflow {
    fn from(r: FileRecord) -> Self {
        Self {
            id: r.id,
            init_id: r.init_id,
            owner_id: r.owner_id,
            created: r.created,
            active: r.active,
            triggers: r.triggers,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WorkflowsWrapper {
    set: Vec<FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct FileSchema {
    #[serde(rename = "Workflows")]
    workflows: WorkflowsWrapper,
}

/// A [`WorkflowStore`] that persists the full set to a single JSON file on
/// every mutation. Reads are served from the in-memory index; writes are
/// write-to-temp-then-rename so a crash mid-write never corrupts the file.
pub struct FileWorkflowStore {
    path: PathBuf,
    index: RwLock<Index>,
}

impl FileWorkflowStore {
    /// Opens (creating if absent) the store backed by `path`.
    ///
    /// # Errors
    ///
    /// [`WorkflowStoreError::Io`] if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WorkflowStoreError> {
        let path = path.as_ref().to_path_buf();
        let index = Self::load(&path).await?;
        Ok(Self {
            path,
            index: RwLock::new(index),
        })
    }

    async fn load(path: &Path) -> Result<Index, WorkflowStoreError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(Index::default());
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| WorkflowStoreError::Io { message: e.to_string() })?;
            let schema: FileSchema =
                serde_json::from_str(&raw).map_err(|e| WorkflowStoreError::Io { message: e.to_string() })?;
            let mut index = Index::default();
            for record in schema.workflows.set {
                let workflow: Workflow = record.into();
                index.order.push(workflow.id);
                index.by_init_id.insert(workflow.init_id.clone(), workflow.id);
                index.by_id.insert(workflow.id, workflow);
            }
            Ok(index)
        })
        .await
        .expect("blocking workflow-store load task panicked")
    }

    fn snapshot(&self) -> Vec<Workflow> {
        let index = self.index.read().expect("workflow index lock poisoned");
        index.order.iter().filter_map(|id| index.by_id.get(id)).cloned().collect()
    }

    async fn flush(&self) -> Result<(), WorkflowStoreError> {
        let workflows = self.snapshot();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let schema = FileSchema {
                workflows: WorkflowsWrapper {
                    set: workflows.iter().map(FileRecord::from).collect(),
                },
            };
            let json = serde_json::to_string_pretty(&schema).map_err(|e| WorkflowStoreError::Io { message: e.to_string() })?;
            let tmp_path = path.with_extension("tmp");
            std::fs::write(&tmp_path, json).map_err(|e| WorkflowStoreError::Io { message: e.to_string() })?;
            std::fs::rename(&tmp_path, &path).map_err(|e| WorkflowStoreError::Io { message: e.to_string() })?;
            Ok(())
        })
        .await
        .expect("blocking workflow-store flush task panicked")
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn put(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        let saved = self.index.write().expect("workflow index lock poisoned").put(workflow)?;
        self.flush().await?;
        Ok(saved)
    }

    async fn get(&self, id: WorkflowId) -> Result<Workflow, WorkflowStoreError> {
        self.index
            .read()
            .expect("workflow index lock poisoned")
            .by_id
            .get(&id)
            .cloned()
            .ok_or(WorkflowStoreError::NotFound { id })
    }

    async fn get_by_init_id(&self, init_id: &InitId) -> Result<Workflow, WorkflowStoreError> {
        let index = self.index.read().expect("workflow index lock poisoned");
        let id = index
            .by_init_id
            .get(init_id)
            .copied()
            .ok_or_else(|| WorkflowStoreError::NotFoundByInitId {
                init_id: init_id.clone(),
            })?;
        Ok(index.by_id.get(&id).expect("by_init_id entry without a by_id entry").clone())
    }

    async fn list(&self, offset: usize, limit: usize, only_active: Option<bool>) -> Vec<Workflow> {
        self.index.read().expect("workflow index lock poisoned").list(offset, limit, only_active)
    }

    async fn remove(&self, id: WorkflowId) -> Result<(), WorkflowStoreError> {
        self.index.write().expect("workflow index lock poisoned").remove(id)?;
        self.flush().await
    }

    async fn shutdown(&self) {}
}
