//! The unit of work of one publish.

use crate::catalog::{CatalogError, CatalogTree, CheckinSet, PendingChanges};
use crate::model::artifact::Artifact;
use crate::model::folder::Folder;
use crate::model::id::{AppId, ArtifactId, ArtifactKind};
use crate::model::state::PersistentState;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlob {
    pub id: ArtifactId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    pub unit_name: String,
    pub bytes: Vec<u8>,
}

/// Pending folders and artifacts of one developer, plus derived payloads.
///
/// Built fresh for every publish and never persisted.
#[derive(Debug, Clone, Default)]
pub struct PublishPackage {
    pub folders: Vec<Folder>,
    /// Commit order once [`super::order::commit_order`] has run.
    pub artifacts: Vec<Artifact>,
    pub source_blobs: Vec<SourceBlob>,
    pub compiled_units: Vec<CompiledUnit>,
    app_names: BTreeMap<AppId, String>,
}

impl PublishPackage {
    pub fn collect(tree: &CatalogTree, pending: PendingChanges) -> Result<Self, CatalogError> {
        let mut app_names = BTreeMap::new();
        for app in pending
            .artifacts
            .iter()
            .map(|artifact| artifact.id().app_id())
            .chain(pending.folders.iter().map(|folder| folder.app_id))
        {
            let name = tree
                .app_name(app)
                .ok_or_else(|| CatalogError::ApplicationNotFound(app.to_string()))?;
            app_names.insert(app, name.to_string());
        }
        let source_blobs = pending
            .artifacts
            .iter()
            .filter(|artifact| artifact.is_visible())
            .filter_map(|artifact| {
                artifact.source().map(|source| SourceBlob {
                    id: artifact.id(),
                    bytes: source.as_bytes().to_vec(),
                })
            })
            .collect();
        Ok(Self {
            folders: pending.folders,
            artifacts: pending.artifacts,
            source_blobs,
            compiled_units: Vec::new(),
            app_names,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.artifacts.is_empty()
    }

    pub fn added(&self) -> impl Iterator<Item = &Artifact> {
        self.with_state(PersistentState::Detached)
    }

    pub fn modified(&self) -> impl Iterator<Item = &Artifact> {
        self.with_state(PersistentState::Modified)
    }

    pub fn deleted(&self) -> impl Iterator<Item = &Artifact> {
        self.with_state(PersistentState::Deleted)
    }

    fn with_state(&self, state: PersistentState) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.state() == state)
    }

    pub fn app_name(&self, app: AppId) -> &str {
        self.app_names.get(&app).map_or("", String::as_str)
    }

    /// Name a compiled service is stored and evicted under.
    pub fn unit_name(&self, app: AppId, service_name: &str) -> String {
        format!("{}.{}", self.app_name(app), service_name)
    }

    pub fn source_of(&self, id: ArtifactId) -> Option<&[u8]> {
        self.source_blobs
            .iter()
            .find(|blob| blob.id == id)
            .map(|blob| blob.bytes.as_slice())
    }

    pub fn compiled_unit(&self, unit_name: &str) -> Option<&[u8]> {
        self.compiled_units
            .iter()
            .find(|unit| unit.unit_name == unit_name)
            .map(|unit| unit.bytes.as_slice())
    }

    /// Names to evict cluster-wide and whether non-executable models are among them.
    pub fn invalidation(&self) -> (Vec<String>, bool) {
        let names = self
            .artifacts
            .iter()
            .map(|artifact| {
                let app = artifact.id().app_id();
                if artifact.is_executable() {
                    self.unit_name(app, artifact.committed_name())
                } else {
                    format!(
                        "{}.{}.{}",
                        self.app_name(app),
                        artifact.kind().plural(),
                        artifact.committed_name()
                    )
                }
            })
            .collect();
        let also_non_executable = self
            .artifacts
            .iter()
            .any(|artifact| artifact.kind() != ArtifactKind::Service);
        (names, also_non_executable)
    }

    /// State the session tree takes once the metadata commit succeeded.
    pub fn checkin_set(&self) -> CheckinSet {
        let mut set = CheckinSet::default();
        for artifact in &self.artifacts {
            if artifact.state().is_deleted() {
                set.removed.push(artifact.id());
            } else {
                set.committed.push(artifact.committed_copy());
            }
        }
        set.folders = self.folders.iter().map(committed_folder).collect();
        set
    }
}

/// Row written for a published folder. Deleted folders keep their state.
pub(crate) fn committed_folder(folder: &Folder) -> Folder {
    let mut committed = folder.clone();
    if !folder.state.is_deleted() {
        committed.version = folder.version + 1;
        committed.state = PersistentState::Unchanged;
    }
    committed
}
