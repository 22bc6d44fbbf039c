//! In-memory catalog forest of one developer session.
//!
//! # Invariants
//! - Data stores live under `HUB_APP_ID`; every other artifact belongs to a
//!   loaded application.
//! - Each application owns one folder tree per application-scoped kind.
//! - Lookup by name only sees artifacts that are not pending deletion.

use super::CatalogError;
use crate::checkout::{CheckoutInfo, CheckoutKey};
use crate::model::application::{Application, HUB_APP_NAME};
use crate::model::artifact::Artifact;
use crate::model::folder::{Folder, FolderId, FolderTree};
use crate::model::id::{AppId, ArtifactId, ArtifactKind, HUB_APP_ID};
use crate::model::state::PersistentState;
use crate::session::DeveloperId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct ApplicationNode {
    pub app: Application,
    folders: BTreeMap<ArtifactKind, FolderTree>,
}

impl ApplicationNode {
    fn new(app: Application) -> Self {
        let folders = ArtifactKind::APPLICATION_KINDS
            .iter()
            .map(|kind| (*kind, FolderTree::new(app.id, *kind)))
            .collect();
        Self { app, folders }
    }

    pub fn folders(&self, kind: ArtifactKind) -> Option<&FolderTree> {
        self.folders.get(&kind)
    }
}

/// Output of [`CatalogTree::find_pending_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    /// Sorted by id.
    pub artifacts: Vec<Artifact>,
    /// Parents before children within each tree.
    pub folders: Vec<Folder>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.folders.is_empty()
    }
}

/// What a successful publish hands back to the tree.
#[derive(Debug, Clone, Default)]
pub struct CheckinSet {
    /// Committed copies of inserted and updated artifacts.
    pub committed: Vec<Artifact>,
    pub removed: Vec<ArtifactId>,
    /// Published folders; deleted ones keep their `Deleted` state.
    pub folders: Vec<Folder>,
}

#[derive(Debug, Default)]
pub struct CatalogTree {
    loaded: bool,
    applications: BTreeMap<AppId, ApplicationNode>,
    artifacts: BTreeMap<ArtifactId, Artifact>,
    checkouts: HashMap<CheckoutKey, CheckoutInfo>,
}

impl CatalogTree {
    pub(crate) fn empty_loaded() -> Self {
        Self {
            loaded: true,
            ..Self::default()
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn insert_application(&mut self, app: Application) {
        self.applications.insert(app.id, ApplicationNode::new(app));
    }

    pub(crate) fn insert_loaded_folder(&mut self, folder: Folder) -> Result<(), CatalogError> {
        let tree = self
            .folder_tree_mut(folder.app_id, folder.target_kind)
            .ok_or(CatalogError::ApplicationNotFound(folder.app_id.to_string()))?;
        tree.insert_loaded(folder)?;
        Ok(())
    }

    /// Installs a whole folder tree. Returns false if its application is unknown.
    pub(crate) fn replace_folder_tree(&mut self, tree: FolderTree) -> bool {
        match self.applications.get_mut(&tree.app_id()) {
            Some(node) if node.folders.contains_key(&tree.target_kind()) => {
                node.folders.insert(tree.target_kind(), tree);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn folder_tree_mut(&mut self, app: AppId, kind: ArtifactKind) -> Option<&mut FolderTree> {
        self.applications
            .get_mut(&app)
            .and_then(|node| node.folders.get_mut(&kind))
    }

    pub(crate) fn put_artifact(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact.id(), artifact);
    }

    pub(crate) fn remove_artifact(&mut self, id: ArtifactId) -> Option<Artifact> {
        self.artifacts.remove(&id)
    }

    pub(crate) fn set_checkouts(&mut self, checkouts: HashMap<CheckoutKey, CheckoutInfo>) {
        self.checkouts = checkouts;
    }

    pub(crate) fn set_checkout(&mut self, info: CheckoutInfo) {
        self.checkouts.insert(info.key, info);
    }

    pub(crate) fn remove_checkout(&mut self, key: CheckoutKey) {
        self.checkouts.remove(&key);
    }

    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.applications.values().map(|node| &node.app)
    }

    pub fn application(&self, id: AppId) -> Option<&ApplicationNode> {
        self.applications.get(&id)
    }

    pub fn application_by_name(&self, name: &str) -> Option<&ApplicationNode> {
        self.applications.values().find(|node| node.app.name == name)
    }

    /// Name used in table names and full names; data stores resolve to the hub name.
    pub fn app_name(&self, app: AppId) -> Option<&str> {
        if app == HUB_APP_ID {
            return Some(HUB_APP_NAME);
        }
        self.applications.get(&app).map(|node| node.app.name.as_str())
    }

    /// The data-store root: every visible data-store artifact.
    pub fn data_stores(&self) -> Vec<&Artifact> {
        self.artifacts_of(HUB_APP_ID, ArtifactKind::DataStore)
    }

    pub fn data_store_by_name(&self, name: &str) -> Option<&Artifact> {
        self.find_by_name(HUB_APP_ID, ArtifactKind::DataStore, name)
    }

    /// Any artifact by id, including ones pending deletion.
    pub fn artifact(&self, id: ArtifactId) -> Option<&Artifact> {
        self.artifacts.get(&id)
    }

    /// Number of artifacts not pending deletion.
    pub fn artifact_count(&self) -> usize {
        self.artifacts.values().filter(|artifact| artifact.is_visible()).count()
    }

    /// Visible artifacts of one kind in `app`, sorted by name.
    pub fn artifacts_of(&self, app: AppId, kind: ArtifactKind) -> Vec<&Artifact> {
        let mut found: Vec<&Artifact> = self
            .artifacts
            .values()
            .filter(|artifact| {
                artifact.id().app_id() == app && artifact.kind() == kind && artifact.is_visible()
            })
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found
    }

    pub fn artifacts_in_folder(&self, app: AppId, kind: ArtifactKind, folder: Option<FolderId>) -> Vec<&Artifact> {
        self.artifacts_of(app, kind)
            .into_iter()
            .filter(|artifact| artifact.header.folder == folder)
            .collect()
    }

    pub fn find_by_name(&self, app: AppId, kind: ArtifactKind, name: &str) -> Option<&Artifact> {
        self.artifacts.values().find(|artifact| {
            artifact.id().app_id() == app
                && artifact.kind() == kind
                && artifact.is_visible()
                && artifact.name() == name
        })
    }

    /// Resolves `app.Kinds.Name`, e.g. `sales.Entities.Invoice`.
    pub fn find_by_full_name(&self, full_name: &str) -> Option<&Artifact> {
        let mut parts = full_name.splitn(3, '.');
        let (app, plural, name) = (parts.next()?, parts.next()?, parts.next()?);
        let kind = ArtifactKind::from_plural(plural)?;
        let app_id = if app == HUB_APP_NAME {
            HUB_APP_ID
        } else {
            self.application_by_name(app)?.app.id
        };
        self.find_by_name(app_id, kind, name)
    }

    /// Whether another visible artifact of (app, kind) already uses `name`.
    pub fn name_exists(&self, app: AppId, kind: ArtifactKind, name: &str, except: Option<ArtifactId>) -> bool {
        self.find_by_name(app, kind, name)
            .is_some_and(|artifact| Some(artifact.id()) != except)
    }

    pub fn folder_tree(&self, app: AppId, kind: ArtifactKind) -> Option<&FolderTree> {
        self.applications.get(&app).and_then(|node| node.folders(kind))
    }

    pub fn checkout(&self, key: CheckoutKey) -> Option<&CheckoutInfo> {
        self.checkouts.get(&key)
    }

    pub fn is_held_by(&self, key: CheckoutKey, developer: DeveloperId) -> bool {
        self.checkout(key).is_some_and(|info| info.is_held_by(developer))
    }

    /// Pending artifacts and folders whose lock `developer` holds.
    pub fn find_pending_changes(&self, developer: DeveloperId) -> PendingChanges {
        let artifacts = self
            .artifacts
            .values()
            .filter(|artifact| {
                artifact.state().is_pending()
                    && self.is_held_by(CheckoutKey::artifact(artifact.id()), developer)
            })
            .cloned()
            .collect();
        let folders = self
            .applications
            .values()
            .flat_map(|node| node.folders.values())
            .filter(|tree| {
                tree.has_pending_changes()
                    && self.is_held_by(CheckoutKey::folder_tree(tree.app_id(), tree.target_kind()), developer)
            })
            .flat_map(|tree| tree.pending())
            .collect();
        PendingChanges { artifacts, folders }
    }

    /// Drops the locks of `developer` and applies the committed state.
    pub fn checkin_all(&mut self, developer: DeveloperId, set: &CheckinSet) {
        self.checkouts.retain(|_, info| !info.is_held_by(developer));
        for id in &set.removed {
            self.artifacts.remove(id);
        }
        for artifact in &set.committed {
            debug_assert_eq!(artifact.state(), PersistentState::Unchanged);
            self.artifacts.insert(artifact.id(), artifact.clone());
        }
        for node in self.applications.values_mut() {
            for tree in node.folders.values_mut() {
                tree.accept_committed(&set.folders);
            }
        }
    }
}
