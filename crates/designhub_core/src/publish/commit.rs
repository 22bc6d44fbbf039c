//! Commit phase: apply a validated, compiled package under per-store
//! transactions and finalize them.
//!
//! # Invariants
//! - One metadata transaction per publish; external transactions open
//!   lazily, only for stores that receive DDL.
//! - Check-in and staged deletion run inside the metadata transaction.
//! - Finalize commits external stores in name order, then the metadata
//!   store. Any failure rolls back every still-open transaction, externals
//!   first, metadata last.
//! - External stores committed before a later failure stay committed; that
//!   window is reported through `committed_stores` and logged as
//!   `partial_commit_window`.

use super::error::{CommitStage, PublishError};
use super::package::{committed_folder, PublishPackage};
use crate::catalog::CatalogTree;
use crate::checkout::CheckoutLedger;
use crate::model::artifact::{Artifact, ArtifactBody};
use crate::model::entity::EntityDef;
use crate::model::id::ArtifactKind;
use crate::model::state::PersistentState;
use crate::session::DeveloperId;
use crate::staged::StagedEditStore;
use crate::store::ddl::sql_shape_changed;
use crate::store::{ExternalStoreRegistry, ExternalTxn, MetaStore, MetaTxn, StoreError, StoreResult, TableContext};
use log::{debug, error, warn};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

pub(crate) struct CommitContext<'a> {
    pub tree: &'a CatalogTree,
    pub package: &'a PublishPackage,
    pub registry: &'a ExternalStoreRegistry,
    pub ledger: &'a CheckoutLedger,
    pub staged: &'a StagedEditStore,
    pub developer: DeveloperId,
}

struct TxnSet<'a> {
    meta: Box<dyn MetaTxn>,
    externals: BTreeMap<String, Box<dyn ExternalTxn>>,
    registry: &'a ExternalStoreRegistry,
}

impl<'a> TxnSet<'a> {
    fn new(meta: Box<dyn MetaTxn>, registry: &'a ExternalStoreRegistry) -> Self {
        Self {
            meta,
            externals: BTreeMap::new(),
            registry,
        }
    }

    fn meta(&mut self) -> &mut dyn MetaTxn {
        self.meta.as_mut()
    }

    /// Transaction on `store`, opened on first use.
    async fn external(&mut self, store: &str) -> StoreResult<&mut dyn ExternalTxn> {
        let txn = match self.externals.entry(store.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let handle = self.registry.get(store).ok_or_else(|| StoreError::Driver {
                    store: store.to_string(),
                    message: "store is not registered".to_string(),
                })?;
                debug!("event=external_txn module=publish status=open store={store}");
                entry.insert(handle.begin().await?)
            }
        };
        Ok(txn.as_mut())
    }

    fn opened_stores(&self) -> Vec<String> {
        self.externals.keys().cloned().collect()
    }

    async fn rollback_all(self) {
        for (store, txn) in self.externals {
            if let Err(err) = txn.rollback().await {
                warn!("event=publish_rollback module=publish status=warn store={store} error={err}");
            }
        }
        if let Err(err) = self.meta.rollback().await {
            warn!("event=publish_rollback module=publish status=warn store=metadata error={err}");
        }
    }

    async fn finalize(self) -> Result<Vec<String>, PublishError> {
        let TxnSet {
            meta,
            mut externals,
            ..
        } = self;
        let mut committed = Vec::new();
        while let Some((store, txn)) = externals.pop_first() {
            if let Err(cause) = txn.commit().await {
                error!("event=publish_commit module=publish status=error stage=external_commit store={store} error={cause}");
                for (rest, txn) in std::mem::take(&mut externals) {
                    if let Err(err) = txn.rollback().await {
                        warn!("event=publish_rollback module=publish status=warn store={rest} error={err}");
                    }
                }
                if let Err(err) = meta.rollback().await {
                    warn!("event=publish_rollback module=publish status=warn store=metadata error={err}");
                }
                log_partial_window(&committed, &store);
                return Err(PublishError::CommitFailure {
                    stage: CommitStage::ExternalCommit { store },
                    cause,
                    committed_stores: committed,
                });
            }
            committed.push(store);
        }
        if let Err(cause) = meta.commit().await {
            error!("event=publish_commit module=publish status=error stage=metadata_commit error={cause}");
            log_partial_window(&committed, "metadata");
            return Err(PublishError::CommitFailure {
                stage: CommitStage::MetadataCommit,
                cause,
                committed_stores: committed,
            });
        }
        Ok(committed)
    }
}

fn log_partial_window(committed: &[String], failed: &str) {
    if !committed.is_empty() {
        error!(
            "event=partial_commit_window module=publish status=error committed_stores={} failed={} action=manual_reconciliation",
            committed.join(","),
            failed
        );
    }
}

/// Applies and finalizes `ctx.package`. Returns the external stores committed.
pub(crate) async fn commit_package(meta: &dyn MetaStore, ctx: &CommitContext<'_>) -> Result<Vec<String>, PublishError> {
    let meta_txn = meta.begin().await.map_err(|cause| PublishError::CommitFailure {
        stage: CommitStage::Begin,
        cause,
        committed_stores: Vec::new(),
    })?;
    let mut txns = TxnSet::new(meta_txn, ctx.registry);
    if let Err((stage, cause)) = apply(&mut txns, ctx).await {
        error!(
            "event=publish_commit module=publish status=error stage=\"{}\" opened_stores={} error={}",
            stage,
            txns.opened_stores().join(","),
            cause
        );
        txns.rollback_all().await;
        return Err(PublishError::CommitFailure {
            stage,
            cause,
            committed_stores: Vec::new(),
        });
    }
    txns.finalize().await
}

async fn apply(txns: &mut TxnSet<'_>, ctx: &CommitContext<'_>) -> Result<(), (CommitStage, StoreError)> {
    let folder_stage = |folder: &crate::model::folder::Folder| CommitStage::Apply {
        target: format!("folder {}", folder.name),
    };
    for folder in ctx.package.folders.iter().filter(|folder| !folder.state.is_deleted()) {
        txns.meta()
            .upsert_folder(&committed_folder(folder))
            .await
            .map_err(|cause| (folder_stage(folder), cause))?;
    }

    for artifact in &ctx.package.artifacts {
        commit_step(artifact, txns, ctx).await.map_err(|cause| {
            (
                CommitStage::Apply {
                    target: artifact.full_name(ctx.package.app_name(artifact.id().app_id())),
                },
                cause,
            )
        })?;
    }

    for folder in ctx.package.folders.iter().filter(|folder| folder.state.is_deleted()) {
        txns.meta()
            .delete_folder(folder)
            .await
            .map_err(|cause| (folder_stage(folder), cause))?;
    }

    let checkin = async {
        let released = ctx.ledger.checkin_in(txns.meta(), ctx.developer).await?;
        let dropped = ctx.staged.delete_all_in(txns.meta(), ctx.developer).await?;
        debug!(
            "event=publish_checkin module=publish status=ok developer={} released={} staged_dropped={}",
            ctx.developer, released, dropped
        );
        Ok::<(), StoreError>(())
    };
    checkin.await.map_err(|cause| (CommitStage::Checkin, cause))
}

/// Per-variant commit action, selected by one match on the body.
async fn commit_step(artifact: &Artifact, txns: &mut TxnSet<'_>, ctx: &CommitContext<'_>) -> StoreResult<()> {
    match &artifact.body {
        ArtifactBody::Entity(entity) => commit_entity(artifact, entity, txns, ctx).await,
        ArtifactBody::Service(_) => commit_service(artifact, txns, ctx).await,
        ArtifactBody::View(_) => commit_view(artifact, txns).await,
        ArtifactBody::DataStore(_) => write_metadata(artifact, txns.meta()).await,
    }
}

async fn write_metadata(artifact: &Artifact, meta: &mut dyn MetaTxn) -> StoreResult<()> {
    match artifact.state() {
        PersistentState::Detached => meta.insert_artifact(&artifact.committed_copy()).await,
        PersistentState::Modified => {
            meta.update_artifact(&artifact.committed_copy(), artifact.version())
                .await
        }
        PersistentState::Deleted => meta.delete_artifact(artifact.id()).await,
        PersistentState::Unchanged => Ok(()),
    }
}

async fn commit_entity(
    artifact: &Artifact,
    entity: &EntityDef,
    txns: &mut TxnSet<'_>,
    ctx: &CommitContext<'_>,
) -> StoreResult<()> {
    write_metadata(artifact, txns.meta()).await?;
    let Some(sql) = entity.sql() else {
        return Ok(());
    };
    let store = ctx
        .tree
        .artifact(sql.store)
        .map(|store| store.name().to_string())
        .ok_or_else(|| StoreError::InvalidData(format!("data store {} is not in the catalog", sql.store)))?;
    let table = TableContext {
        app_name: ctx.package.app_name(artifact.id().app_id()),
    };
    match artifact.state() {
        PersistentState::Detached => txns.external(&store).await?.create_table(artifact, table).await,
        PersistentState::Modified if sql_shape_changed(artifact) => {
            txns.external(&store).await?.alter_table(artifact, table).await
        }
        PersistentState::Deleted => txns.external(&store).await?.drop_table(artifact, table).await,
        PersistentState::Modified | PersistentState::Unchanged => Ok(()),
    }
}

async fn commit_service(artifact: &Artifact, txns: &mut TxnSet<'_>, ctx: &CommitContext<'_>) -> StoreResult<()> {
    write_metadata(artifact, txns.meta()).await?;
    let app = artifact.id().app_id();
    let committed_unit = ctx.package.unit_name(app, artifact.committed_name());
    let meta = txns.meta();
    if artifact.state().is_deleted() {
        meta.delete_source_blob(artifact.id()).await?;
        return meta.delete_compiled_unit(ArtifactKind::Service, &committed_unit).await;
    }

    let unit = ctx.package.unit_name(app, artifact.name());
    let source = ctx.package.source_of(artifact.id()).unwrap_or_default();
    let compiled = ctx
        .package
        .compiled_unit(&unit)
        .ok_or_else(|| StoreError::InvalidData(format!("no compiled unit for `{unit}`")))?;
    meta.upsert_source_blob(artifact.id(), source).await?;
    meta.upsert_compiled_unit(ArtifactKind::Service, &unit, compiled).await?;
    if artifact.is_renamed() {
        meta.delete_compiled_unit(ArtifactKind::Service, &committed_unit).await?;
    }
    Ok(())
}

async fn commit_view(artifact: &Artifact, txns: &mut TxnSet<'_>) -> StoreResult<()> {
    let meta = txns.meta();
    write_metadata(artifact, meta).await?;
    match artifact.source() {
        Some(_) if artifact.state().is_deleted() => meta.delete_source_blob(artifact.id()).await,
        Some(source) => meta.upsert_source_blob(artifact.id(), source.as_bytes()).await,
        None => Ok(()),
    }
}
