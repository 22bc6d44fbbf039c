//! Per-developer staged edits.
//!
//! # Responsibility
//! - Persist in-progress snapshots keyed by `(developer, kind, id)`.
//! - Rebuild staged-only artifacts and folder trees for catalog loading.
//!
//! # Invariants
//! - The storage never interprets blobs; only [`StagedEdit::decode`] does.
//! - Bulk deletion for a developer happens only inside a successful publish
//!   transaction ([`StagedEditStore::delete_all_in`]).

use crate::checkout::CheckoutKey;
use crate::model::artifact::Artifact;
use crate::model::folder::FolderTree;
use crate::model::id::ArtifactKind;
use crate::session::DeveloperId;
use crate::store::{MetaTxn, StagedStorage, StoreResult};
use crate::wire::{decode_artifact, decode_folder_tree, encode_artifact, encode_folder_tree, BlobScope, WireResult};
use log::{debug, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEdit {
    pub developer: DeveloperId,
    pub key: CheckoutKey,
    pub blob: Vec<u8>,
}

/// Decoded content of one staged blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedItem {
    Artifact(Artifact),
    Folders(FolderTree),
}

impl StagedEdit {
    pub fn decode(&self) -> WireResult<StagedItem> {
        if self.key.kind == ArtifactKind::Folder {
            decode_folder_tree(&self.blob).map(StagedItem::Folders)
        } else {
            decode_artifact(&self.blob).map(StagedItem::Artifact)
        }
    }
}

/// Everything one developer has staged, decoded.
#[derive(Debug, Default)]
pub struct StagedItems {
    pub artifacts: Vec<Artifact>,
    pub folder_trees: Vec<FolderTree>,
}

#[derive(Clone)]
pub struct StagedEditStore {
    storage: Arc<dyn StagedStorage>,
}

impl StagedEditStore {
    pub fn new(storage: Arc<dyn StagedStorage>) -> Self {
        Self { storage }
    }

    pub async fn save(&self, developer: DeveloperId, key: CheckoutKey, blob: Vec<u8>) -> StoreResult<()> {
        let edit = StagedEdit { developer, key, blob };
        self.storage.save_staged(&edit).await?;
        debug!(
            "event=staged_save module=staged status=ok developer={} key={} bytes={}",
            developer,
            key,
            edit.blob.len()
        );
        Ok(())
    }

    pub async fn save_artifact(&self, developer: DeveloperId, artifact: &Artifact) -> StoreResult<()> {
        self.save(
            developer,
            CheckoutKey::artifact(artifact.id()),
            encode_artifact(artifact, BlobScope::Full)?,
        )
        .await
    }

    pub async fn save_folder_tree(&self, developer: DeveloperId, tree: &FolderTree) -> StoreResult<()> {
        self.save(
            developer,
            CheckoutKey::folder_tree(tree.app_id(), tree.target_kind()),
            encode_folder_tree(tree)?,
        )
        .await
    }

    pub async fn load(&self, developer: DeveloperId, key: CheckoutKey) -> StoreResult<Option<Vec<u8>>> {
        self.storage.load_staged(developer, key).await
    }

    pub async fn load_all(&self, developer: DeveloperId) -> StoreResult<Vec<StagedEdit>> {
        self.storage.load_all_staged(developer).await
    }

    /// Decodes every staged blob of `developer`.
    ///
    /// # Contract
    /// - Artifacts that exist only in staged form are included.
    /// - A blob that fails to decode fails the whole call.
    pub async fn load_items(&self, developer: DeveloperId) -> StoreResult<StagedItems> {
        let mut items = StagedItems::default();
        for edit in self.load_all(developer).await? {
            match edit.decode()? {
                StagedItem::Artifact(artifact) => {
                    if artifact.id() != edit.key.id {
                        warn!(
                            "event=staged_load module=staged status=warn key={} blob_id={}",
                            edit.key,
                            artifact.id()
                        );
                        continue;
                    }
                    items.artifacts.push(artifact);
                }
                StagedItem::Folders(tree) => items.folder_trees.push(tree),
            }
        }
        Ok(items)
    }

    pub async fn delete(&self, developer: DeveloperId, key: CheckoutKey) -> StoreResult<bool> {
        self.storage.delete_staged(developer, key).await
    }

    /// Out-of-transaction bulk delete, for administrative cleanup.
    pub async fn delete_all(&self, developer: DeveloperId) -> StoreResult<usize> {
        self.storage.delete_all_staged(developer).await
    }

    /// Deletes every staged edit of `developer` inside a publish transaction.
    pub async fn delete_all_in(&self, txn: &mut dyn MetaTxn, developer: DeveloperId) -> StoreResult<usize> {
        txn.delete_staged(developer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::artifact::{ArtifactBody, ServiceDef};
    use crate::model::id::{ArtifactId, Layer};
    use crate::store::SqliteMetaStore;

    fn store() -> StagedEditStore {
        StagedEditStore::new(Arc::new(SqliteMetaStore::in_memory().unwrap()))
    }

    fn draft(seq: u32) -> Artifact {
        let id = ArtifactId::new(1, ArtifactKind::Service, seq, Layer::User).unwrap();
        Artifact::new(id, &format!("Draft{seq}"), ArtifactBody::Service(ServiceDef::default()))
    }

    #[tokio::test]
    async fn later_save_replaces_earlier_blob() {
        let store = store();
        let dev = DeveloperId::random();
        let key = CheckoutKey::artifact(draft(1).id());
        store.save(dev, key, vec![1]).await.unwrap();
        store.save(dev, key, vec![2, 3]).await.unwrap();

        assert_eq!(store.load(dev, key).await.unwrap(), Some(vec![2, 3]));
        assert_eq!(store.load_all(dev).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_items_rebuilds_staged_only_artifacts_and_folders() {
        let store = store();
        let dev = DeveloperId::random();
        store.save_artifact(dev, &draft(1)).await.unwrap();
        let mut folders = FolderTree::new(1, ArtifactKind::Service);
        folders.create(None, "Billing").unwrap();
        store.save_folder_tree(dev, &folders).await.unwrap();

        let items = store.load_items(dev).await.unwrap();
        assert_eq!(items.artifacts, vec![draft(1)]);
        assert_eq!(items.folder_trees, vec![folders]);
        assert!(store.load_items(DeveloperId::random()).await.unwrap().artifacts.is_empty());
    }

    #[tokio::test]
    async fn corrupt_blob_fails_load_items() {
        let store = store();
        let dev = DeveloperId::random();
        store
            .save(dev, CheckoutKey::artifact(draft(1).id()), vec![0xFF, 0xFF])
            .await
            .unwrap();
        assert!(store.load_items(dev).await.is_err());
    }
}
