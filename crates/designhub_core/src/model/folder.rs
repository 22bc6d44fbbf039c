//! Folder hierarchy per (application, artifact kind).
//!
//! # Responsibility
//! - Hold the folders of one application root for one artifact kind.
//! - Apply create/rename/delete with persistence-state tracking.
//!
//! # Invariants
//! - A folder tree is checked out and published as one unit, keyed by
//!   `ArtifactId::folder_root(app, target_kind)`.
//! - Visible sibling folder names are unique under one parent.
//! - Children listing is deterministic: `sort_order ASC, name ASC`.

use crate::model::id::{AppId, ArtifactId, ArtifactKind};
use crate::model::state::{DeleteOutcome, PersistentState};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub type FolderId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FolderError {
    #[error("folder not found: {0}")]
    NotFound(FolderId),
    #[error("folder `{0}` already exists under this parent")]
    DuplicateName(String),
    #[error("folder {0} still has child folders")]
    HasChildren(FolderId),
    #[error("folder belongs to app {found_app}/{found_kind}, expected {app}/{kind}")]
    WrongRoot {
        app: AppId,
        kind: ArtifactKind,
        found_app: AppId,
        found_kind: ArtifactKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: FolderId,
    pub app_id: AppId,
    pub target_kind: ArtifactKind,
    pub parent: Option<FolderId>,
    pub name: String,
    pub sort_order: i32,
    pub version: u32,
    pub state: PersistentState,
}

impl Folder {
    pub fn root_id(&self) -> ArtifactId {
        ArtifactId::folder_root(self.app_id, self.target_kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderTree {
    app_id: AppId,
    target_kind: ArtifactKind,
    folders: BTreeMap<FolderId, Folder>,
}

impl FolderTree {
    pub fn new(app_id: AppId, target_kind: ArtifactKind) -> Self {
        Self {
            app_id,
            target_kind,
            folders: BTreeMap::new(),
        }
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn target_kind(&self) -> ArtifactKind {
        self.target_kind
    }

    /// Checkout key id of this tree.
    pub fn root_id(&self) -> ArtifactId {
        ArtifactId::folder_root(self.app_id, self.target_kind)
    }

    /// Highest committed folder version, used as the checkout snapshot.
    pub fn version(&self) -> u32 {
        self.folders
            .values()
            .map(|folder| folder.version)
            .max()
            .unwrap_or(0)
    }

    /// Inserts a folder read from storage as-is.
    pub fn insert_loaded(&mut self, folder: Folder) -> Result<(), FolderError> {
        if folder.app_id != self.app_id || folder.target_kind != self.target_kind {
            return Err(FolderError::WrongRoot {
                app: self.app_id,
                kind: self.target_kind,
                found_app: folder.app_id,
                found_kind: folder.target_kind,
            });
        }
        self.folders.insert(folder.id, folder);
        Ok(())
    }

    pub fn get(&self, id: FolderId) -> Option<&Folder> {
        self.folders.get(&id)
    }

    /// Returns whether `id` names a folder that is not pending deletion.
    pub fn contains_visible(&self, id: FolderId) -> bool {
        self.get(id).is_some_and(|folder| !folder.state.is_deleted())
    }

    /// All folders, including deleted ones.
    pub fn all(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values()
    }

    pub fn children(&self, parent: Option<FolderId>) -> Vec<&Folder> {
        let mut children: Vec<&Folder> = self
            .folders
            .values()
            .filter(|folder| folder.parent == parent && !folder.state.is_deleted())
            .collect();
        children.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
        children
    }

    pub fn create(&mut self, parent: Option<FolderId>, name: &str) -> Result<FolderId, FolderError> {
        if let Some(parent) = parent {
            if !self.contains_visible(parent) {
                return Err(FolderError::NotFound(parent));
            }
        }
        self.ensure_unique(parent, name, None)?;
        let sort_order = self
            .children(parent)
            .last()
            .map_or(0, |last| last.sort_order + 1);
        let folder = Folder {
            id: Uuid::new_v4(),
            app_id: self.app_id,
            target_kind: self.target_kind,
            parent,
            name: name.to_string(),
            sort_order,
            version: 0,
            state: PersistentState::Detached,
        };
        let id = folder.id;
        self.folders.insert(id, folder);
        Ok(id)
    }

    pub fn rename(&mut self, id: FolderId, name: &str) -> Result<(), FolderError> {
        let parent = self.visible(id)?.parent;
        self.ensure_unique(parent, name, Some(id))?;
        let folder = self.folders.get_mut(&id).ok_or(FolderError::NotFound(id))?;
        folder.name = name.to_string();
        folder.state = folder.state.on_mutation();
        Ok(())
    }

    /// Deletes a folder that has no visible child folders.
    pub fn delete(&mut self, id: FolderId) -> Result<(), FolderError> {
        self.visible(id)?;
        if !self.children(Some(id)).is_empty() {
            return Err(FolderError::HasChildren(id));
        }
        let folder = self.folders.get_mut(&id).ok_or(FolderError::NotFound(id))?;
        match folder.state.on_delete() {
            DeleteOutcome::Discard => {
                self.folders.remove(&id);
            }
            DeleteOutcome::MarkDeleted => folder.state = PersistentState::Deleted,
        }
        Ok(())
    }

    /// Folders with something to publish, ordered parents first.
    pub fn pending(&self) -> Vec<Folder> {
        let mut pending: Vec<Folder> = self
            .folders
            .values()
            .filter(|folder| folder.state.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|folder| (self.depth(folder), folder.id));
        pending
    }

    pub fn has_pending_changes(&self) -> bool {
        self.folders.values().any(|folder| folder.state.is_pending())
    }

    /// Applies the committed copies produced by a publish.
    pub fn accept_committed(&mut self, committed: &[Folder]) {
        for folder in committed {
            if folder.app_id != self.app_id || folder.target_kind != self.target_kind {
                continue;
            }
            if folder.state.is_deleted() {
                self.folders.remove(&folder.id);
            } else {
                let mut accepted = folder.clone();
                accepted.state = PersistentState::Unchanged;
                self.folders.insert(accepted.id, accepted);
            }
        }
    }

    fn visible(&self, id: FolderId) -> Result<&Folder, FolderError> {
        self.get(id)
            .filter(|folder| !folder.state.is_deleted())
            .ok_or(FolderError::NotFound(id))
    }

    fn ensure_unique(
        &self,
        parent: Option<FolderId>,
        name: &str,
        except: Option<FolderId>,
    ) -> Result<(), FolderError> {
        let taken = self
            .children(parent)
            .iter()
            .any(|folder| folder.name == name && Some(folder.id) != except);
        if taken {
            return Err(FolderError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn depth(&self, folder: &Folder) -> usize {
        let mut depth = 0;
        let mut parent = folder.parent;
        while let Some(id) = parent {
            depth += 1;
            parent = self.folders.get(&id).and_then(|folder| folder.parent);
            if depth > self.folders.len() {
                break;
            }
        }
        depth
    }
}
