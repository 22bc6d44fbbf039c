//! Design catalog of one developer session.
//!
//! # Responsibility
//! - Build the session tree from committed rows, the checkout ledger and the
//!   session's staged edits.
//! - Gate every edit on the session holding the matching checkout, and
//!   flush each edit to the staged-edit store.
//!
//! # Invariants
//! - A load builds a fresh tree off to the side and swaps it in; readers
//!   never see a partial tree.
//! - At most one load runs per catalog; a second concurrent load fails fast.
//! - An edit is staged before the in-memory tree changes, so a staging
//!   failure leaves the tree untouched.
//!
//! # See also
//! - crate::publish for the consumer of [`CatalogTree::find_pending_changes`].

pub mod tree;

use crate::checkout::{AcquireOutcome, CheckoutInfo, CheckoutKey, CheckoutLedger};
use crate::model::application::is_valid_name;
use crate::model::artifact::{Artifact, ArtifactBody};
use crate::model::entity::{EntityError, SqlBinding};
use crate::model::folder::{FolderError, FolderId, FolderTree};
use crate::model::id::{AppId, ArtifactId, ArtifactKind, IdError, Layer, HUB_APP_ID};
use crate::model::state::{DeleteOutcome, PersistentState};
use crate::session::{DeveloperId, DeveloperSession};
use crate::staged::StagedEditStore;
use crate::store::{MetaStore, StoreError};
use crate::wire::{decode_artifact, decode_folder_tree, WireError};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use tree::{ApplicationNode, CatalogTree, CheckinSet, PendingChanges};

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog load already in progress")]
    AlreadyLoading,
    #[error("catalog has not been loaded")]
    NotLoaded,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{key} is checked out by {holder_name}")]
    LockConflict {
        key: CheckoutKey,
        holder: DeveloperId,
        holder_name: String,
    },
    #[error("{0} is not checked out by this session")]
    NotCheckedOut(CheckoutKey),
    #[error("invalid name `{0}`")]
    InvalidName(String),
    #[error("{kind} `{name}` already exists")]
    DuplicateName { kind: ArtifactKind, name: String },
    #[error("artifact {0} is pending deletion")]
    ArtifactDeleted(ArtifactId),
    #[error("edit changed the kind of artifact {0}")]
    KindChanged(ArtifactId),
    #[error("folder {0} still contains artifacts")]
    FolderNotEmpty(FolderId),
    #[error("application not found: {0}")]
    ApplicationNotFound(String),
    #[error(transparent)]
    Folder(#[from] FolderError),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Result of a granted checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutOutcome {
    pub info: CheckoutInfo,
    /// True when the in-memory model was replaced by a newer committed copy
    /// or by a staged edit.
    pub model_changed: bool,
}

fn sql_binding(artifact: &Artifact) -> Option<SqlBinding> {
    artifact.as_entity().and_then(|entity| entity.sql()).cloned()
}

struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DesignCatalog {
    session: DeveloperSession,
    meta: Arc<dyn MetaStore>,
    ledger: CheckoutLedger,
    staged: StagedEditStore,
    loading: AtomicBool,
    tree: RwLock<CatalogTree>,
}

impl DesignCatalog {
    pub fn new(
        session: DeveloperSession,
        meta: Arc<dyn MetaStore>,
        ledger: CheckoutLedger,
        staged: StagedEditStore,
    ) -> Self {
        Self {
            session,
            meta,
            ledger,
            staged,
            loading: AtomicBool::new(false),
            tree: RwLock::new(CatalogTree::default()),
        }
    }

    pub fn session(&self) -> &DeveloperSession {
        &self.session
    }

    fn developer(&self) -> DeveloperId {
        self.session.id
    }

    /// Read access to the current tree.
    pub async fn read(&self) -> RwLockReadGuard<'_, CatalogTree> {
        self.tree.read().await
    }

    /// Exclusive access for the duration of a publish.
    pub(crate) async fn lock_for_publish(&self) -> CatalogResult<RwLockWriteGuard<'_, CatalogTree>> {
        self.loaded_mut().await
    }

    async fn loaded_mut(&self) -> CatalogResult<RwLockWriteGuard<'_, CatalogTree>> {
        let tree = self.tree.write().await;
        if !tree.is_loaded() {
            return Err(CatalogError::NotLoaded);
        }
        Ok(tree)
    }

    /// Rebuilds the session tree from storage.
    ///
    /// # Contract
    /// - Fails with `AlreadyLoading` if a load is in flight on this catalog.
    /// - Staged edits are overlaid only for keys this session still holds.
    pub async fn load(&self) -> CatalogResult<()> {
        if self
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                "event=catalog_load module=catalog status=error developer={} error_code=already_loading",
                self.developer()
            );
            return Err(CatalogError::AlreadyLoading);
        }
        let _flag = LoadingFlag(&self.loading);
        let started = Instant::now();

        match self.build_tree().await {
            Ok((tree, staged)) => {
                let artifacts = tree.artifact_count();
                let applications = tree.applications().count();
                *self.tree.write().await = tree;
                info!(
                    "event=catalog_load module=catalog status=ok developer={} applications={} artifacts={} staged={} duration_ms={}",
                    self.developer(),
                    applications,
                    artifacts,
                    staged,
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "event=catalog_load module=catalog status=error developer={} duration_ms={} error={}",
                    self.developer(),
                    started.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    async fn build_tree(&self) -> CatalogResult<(CatalogTree, usize)> {
        let mut tree = CatalogTree::empty_loaded();
        for app in self.meta.load_applications().await? {
            tree.insert_application(app);
        }
        for folder in self.meta.load_folders().await? {
            tree.insert_loaded_folder(folder)?;
        }
        for artifact in self.meta.load_artifacts().await? {
            let app = artifact.id().app_id();
            if app != HUB_APP_ID && tree.application(app).is_none() {
                warn!(
                    "event=catalog_load module=catalog status=warn artifact={} reason=unknown_application",
                    artifact.id()
                );
                continue;
            }
            tree.put_artifact(artifact);
        }

        let checkouts = self.ledger.load_all().await?;
        let developer = self.developer();
        let held = |key: &CheckoutKey| checkouts.get(key).is_some_and(|info| info.is_held_by(developer));
        let items = self.staged.load_items(developer).await?;
        let mut staged = 0;
        for artifact in items.artifacts {
            let key = CheckoutKey::artifact(artifact.id());
            if held(&key) {
                tree.put_artifact(artifact);
                staged += 1;
            } else {
                warn!("event=catalog_load module=catalog status=warn key={key} reason=staged_without_checkout");
            }
        }
        for folders in items.folder_trees {
            let key = CheckoutKey::folder_tree(folders.app_id(), folders.target_kind());
            if held(&key) && tree.replace_folder_tree(folders) {
                staged += 1;
            } else {
                warn!("event=catalog_load module=catalog status=warn key={key} reason=staged_without_checkout");
            }
        }
        tree.set_checkouts(checkouts);
        Ok((tree, staged))
    }

    /// Locks a catalog node for this session and pulls its freshest model.
    pub async fn checkout(&self, key: CheckoutKey) -> CatalogResult<CheckoutOutcome> {
        let mut tree = self.loaded_mut().await?;
        if key.kind == ArtifactKind::Folder {
            self.checkout_folders(&mut tree, key).await
        } else {
            self.checkout_artifact(&mut tree, key).await
        }
    }

    async fn acquire(&self, tree: &mut CatalogTree, key: CheckoutKey, version: u32) -> CatalogResult<CheckoutInfo> {
        match self.ledger.acquire(key, &self.session, version).await? {
            AcquireOutcome::Granted(info) => Ok(info),
            AcquireOutcome::AlreadyHeld(holder) => {
                tree.set_checkout(holder.clone());
                Err(CatalogError::LockConflict {
                    key,
                    holder: holder.developer,
                    holder_name: holder.developer_name,
                })
            }
        }
    }

    async fn checkout_artifact(&self, tree: &mut CatalogTree, key: CheckoutKey) -> CatalogResult<CheckoutOutcome> {
        let current = tree
            .artifact(key.id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;
        if let Some(info) = tree.checkout(key).filter(|info| info.is_held_by(self.developer())) {
            if current.state() == PersistentState::Detached {
                return Ok(CheckoutOutcome {
                    info: info.clone(),
                    model_changed: false,
                });
            }
        }

        let Some(committed) = self.meta.load_artifact(key.id).await? else {
            if !tree.is_held_by(key, self.developer()) {
                tree.remove_artifact(key.id);
            }
            return Err(CatalogError::NotFound(key.to_string()));
        };
        let info = self.acquire(tree, key, committed.version()).await?;
        let model = match self.staged.load(self.developer(), key).await? {
            Some(blob) => decode_artifact(&blob)?,
            None => committed,
        };
        let model_changed = model != current;
        tree.put_artifact(model);
        tree.set_checkout(info.clone());
        Ok(CheckoutOutcome { info, model_changed })
    }

    async fn checkout_folders(&self, tree: &mut CatalogTree, key: CheckoutKey) -> CatalogResult<CheckoutOutcome> {
        let app = key.id.app_id();
        let kind = u8::try_from(key.id.sequence())
            .ok()
            .and_then(|code| ArtifactKind::from_code(code).ok())
            .filter(|kind| kind.is_application_scoped())
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;
        let current = tree
            .folder_tree(app, kind)
            .cloned()
            .ok_or_else(|| CatalogError::ApplicationNotFound(app.to_string()))?;

        let mut committed = FolderTree::new(app, kind);
        for folder in self.meta.load_folders().await? {
            if folder.app_id == app && folder.target_kind == kind {
                committed.insert_loaded(folder)?;
            }
        }
        let info = self.acquire(tree, key, committed.version()).await?;
        let model = match self.staged.load(self.developer(), key).await? {
            Some(blob) => decode_folder_tree(&blob)?,
            None => committed,
        };
        let model_changed = model != current;
        tree.replace_folder_tree(model);
        tree.set_checkout(info.clone());
        Ok(CheckoutOutcome { info, model_changed })
    }

    pub async fn find_pending_changes(&self) -> CatalogResult<PendingChanges> {
        let tree = self.tree.read().await;
        if !tree.is_loaded() {
            return Err(CatalogError::NotLoaded);
        }
        Ok(tree.find_pending_changes(self.developer()))
    }

    /// Applies a committed publish to this session's tree.
    pub async fn checkin_all(&self, set: &CheckinSet) -> CatalogResult<()> {
        let mut tree = self.loaded_mut().await?;
        tree.checkin_all(self.developer(), set);
        Ok(())
    }

    /// Creates a new artifact held by this session.
    ///
    /// # Contract
    /// - Data stores must be created under `HUB_APP_ID`.
    /// - The artifact is `Detached`, checked out to the creator and staged.
    pub async fn create_artifact(&self, app: AppId, name: &str, body: ArtifactBody) -> CatalogResult<ArtifactId> {
        let mut tree = self.loaded_mut().await?;
        let kind = body.kind();
        let app_known = if kind == ArtifactKind::DataStore {
            app == HUB_APP_ID
        } else {
            tree.application(app).is_some()
        };
        if !app_known {
            return Err(CatalogError::ApplicationNotFound(app.to_string()));
        }
        if !is_valid_name(name) {
            return Err(CatalogError::InvalidName(name.to_string()));
        }
        if tree.name_exists(app, kind, name, None) {
            return Err(CatalogError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }

        let seq = self.meta.next_sequence(app, kind).await?;
        let id = ArtifactId::new(app, kind, seq, Layer::User)?;
        let artifact = Artifact::new(id, name, body);
        let key = CheckoutKey::artifact(id);
        self.staged.save_artifact(self.developer(), &artifact).await?;
        let info = self.ledger.acquire_new(key, &self.session).await?;
        tree.put_artifact(artifact);
        tree.set_checkout(info);
        info!(
            "event=artifact_create module=catalog status=ok developer={} artifact={} name={}",
            self.developer(),
            id,
            name
        );
        Ok(id)
    }

    /// Copy of an artifact this session may edit.
    fn editable(&self, tree: &CatalogTree, id: ArtifactId) -> CatalogResult<Artifact> {
        let artifact = tree
            .artifact(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let key = CheckoutKey::artifact(id);
        if !tree.is_held_by(key, self.developer()) {
            return Err(CatalogError::NotCheckedOut(key));
        }
        if !artifact.is_visible() {
            return Err(CatalogError::ArtifactDeleted(id));
        }
        Ok(artifact.clone())
    }

    async fn stage_and_store(&self, tree: &mut CatalogTree, artifact: Artifact) -> CatalogResult<()> {
        self.staged.save_artifact(self.developer(), &artifact).await?;
        tree.put_artifact(artifact);
        Ok(())
    }

    /// Applies `mutate` to the body of a checked-out artifact.
    ///
    /// A failing mutation leaves both the tree and the staged copy unchanged.
    ///
    /// # Contract
    /// - The SQL binding (store, primary keys, indexes) of an entity can only
    ///   change while the entity is detached; otherwise `BindingLocked`.
    pub async fn edit<F>(&self, id: ArtifactId, mutate: F) -> CatalogResult<()>
    where
        F: FnOnce(&mut ArtifactBody) -> Result<(), EntityError>,
    {
        let mut tree = self.loaded_mut().await?;
        let mut artifact = self.editable(&tree, id)?;
        let binding = sql_binding(&artifact);
        mutate(&mut artifact.body)?;
        if artifact.body.kind() != id.kind() {
            return Err(CatalogError::KindChanged(id));
        }
        if artifact.state() != PersistentState::Detached && sql_binding(&artifact) != binding {
            return Err(EntityError::BindingLocked.into());
        }
        artifact.mark_modified();
        self.stage_and_store(&mut tree, artifact).await
    }

    pub async fn rename(&self, id: ArtifactId, new_name: &str) -> CatalogResult<()> {
        let mut tree = self.loaded_mut().await?;
        let mut artifact = self.editable(&tree, id)?;
        if !is_valid_name(new_name) {
            return Err(CatalogError::InvalidName(new_name.to_string()));
        }
        if tree.name_exists(id.app_id(), id.kind(), new_name, Some(id)) {
            return Err(CatalogError::DuplicateName {
                kind: id.kind(),
                name: new_name.to_string(),
            });
        }
        artifact.rename(new_name);
        self.stage_and_store(&mut tree, artifact).await
    }

    /// Deletes an artifact; a never-published one is discarded outright.
    pub async fn delete(&self, id: ArtifactId) -> CatalogResult<()> {
        let mut tree = self.loaded_mut().await?;
        let mut artifact = self.editable(&tree, id)?;
        match artifact.mark_deleted() {
            DeleteOutcome::Discard => {
                let key = CheckoutKey::artifact(id);
                self.staged.delete(self.developer(), key).await?;
                self.ledger.release(key, self.developer()).await?;
                tree.remove_artifact(id);
                tree.remove_checkout(key);
                info!(
                    "event=artifact_discard module=catalog status=ok developer={} artifact={}",
                    self.developer(),
                    id
                );
                Ok(())
            }
            DeleteOutcome::MarkDeleted => self.stage_and_store(&mut tree, artifact).await,
        }
    }

    /// Moves an artifact into `folder`, or to the root when `None`.
    pub async fn move_to_folder(&self, id: ArtifactId, folder: Option<FolderId>) -> CatalogResult<()> {
        let mut tree = self.loaded_mut().await?;
        let mut artifact = self.editable(&tree, id)?;
        if let Some(folder) = folder {
            let exists = tree
                .folder_tree(id.app_id(), id.kind())
                .is_some_and(|folders| folders.contains_visible(folder));
            if !exists {
                return Err(FolderError::NotFound(folder).into());
            }
        }
        if artifact.header.folder == folder {
            return Ok(());
        }
        artifact.header.folder = folder;
        artifact.mark_modified();
        self.stage_and_store(&mut tree, artifact).await
    }

    fn editable_folders(&self, tree: &CatalogTree, app: AppId, kind: ArtifactKind) -> CatalogResult<FolderTree> {
        let folders = tree
            .folder_tree(app, kind)
            .ok_or_else(|| CatalogError::ApplicationNotFound(app.to_string()))?;
        let key = CheckoutKey::folder_tree(app, kind);
        if !tree.is_held_by(key, self.developer()) {
            return Err(CatalogError::NotCheckedOut(key));
        }
        Ok(folders.clone())
    }

    async fn stage_folders(&self, tree: &mut CatalogTree, folders: FolderTree) -> CatalogResult<()> {
        self.staged.save_folder_tree(self.developer(), &folders).await?;
        tree.replace_folder_tree(folders);
        Ok(())
    }

    pub async fn create_folder(
        &self,
        app: AppId,
        kind: ArtifactKind,
        parent: Option<FolderId>,
        name: &str,
    ) -> CatalogResult<FolderId> {
        if !is_valid_name(name) {
            return Err(CatalogError::InvalidName(name.to_string()));
        }
        let mut tree = self.loaded_mut().await?;
        let mut folders = self.editable_folders(&tree, app, kind)?;
        let id = folders.create(parent, name)?;
        self.stage_folders(&mut tree, folders).await?;
        Ok(id)
    }

    pub async fn rename_folder(&self, app: AppId, kind: ArtifactKind, id: FolderId, name: &str) -> CatalogResult<()> {
        if !is_valid_name(name) {
            return Err(CatalogError::InvalidName(name.to_string()));
        }
        let mut tree = self.loaded_mut().await?;
        let mut folders = self.editable_folders(&tree, app, kind)?;
        folders.rename(id, name)?;
        self.stage_folders(&mut tree, folders).await
    }

    /// Deletes an empty folder. Artifacts still filed under it block the delete.
    pub async fn delete_folder(&self, app: AppId, kind: ArtifactKind, id: FolderId) -> CatalogResult<()> {
        let mut tree = self.loaded_mut().await?;
        let mut folders = self.editable_folders(&tree, app, kind)?;
        if !tree.artifacts_in_folder(app, kind, Some(id)).is_empty() {
            return Err(CatalogError::FolderNotEmpty(id));
        }
        folders.delete(id)?;
        self.stage_folders(&mut tree, folders).await
    }

    pub async fn artifact(&self, id: ArtifactId) -> Option<Artifact> {
        self.tree.read().await.artifact(id).cloned()
    }

    pub async fn find_by_full_name(&self, full_name: &str) -> Option<Artifact> {
        self.tree.read().await.find_by_full_name(full_name).cloned()
    }
}
