//! Checkout ledger: the single-writer registry of design artifacts.
//!
//! # Responsibility
//! - Grant, look up and release whole-artifact edit locks per developer.
//! - Check a developer's locks back in inside a publish transaction.
//!
//! # Invariants
//! - At most one live entry per `(kind, id)`; a held entry is never
//!   overwritten by `acquire`.
//! - Release only removes entries held by the caller.
//! - Folder trees are locked as one unit via [`CheckoutKey::folder_tree`].
//!
//! # See also
//! - crate::catalog for the edit paths that consult the ledger.

use crate::model::id::{AppId, ArtifactId, ArtifactKind};
use crate::session::{DeveloperId, DeveloperSession};
use crate::store::{LedgerStorage, MetaTxn, StoreResult};
use log::{info, warn};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Ledger key: one lockable catalog node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckoutKey {
    pub kind: ArtifactKind,
    pub id: ArtifactId,
}

impl CheckoutKey {
    pub fn artifact(id: ArtifactId) -> Self {
        Self { kind: id.kind(), id }
    }

    /// Key of the folder tree of `target` artifacts in `app`.
    pub fn folder_tree(app: AppId, target: ArtifactKind) -> Self {
        Self {
            kind: ArtifactKind::Folder,
            id: ArtifactId::folder_root(app, target),
        }
    }
}

impl Display for CheckoutKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutInfo {
    pub key: CheckoutKey,
    pub developer: DeveloperId,
    pub developer_name: String,
    /// Committed version the holder started from; 0 for new artifacts.
    pub version: u32,
}

impl CheckoutInfo {
    pub fn new(key: CheckoutKey, session: &DeveloperSession, version: u32) -> Self {
        Self {
            key,
            developer: session.id,
            developer_name: session.display_name.clone(),
            version,
        }
    }

    pub fn is_held_by(&self, developer: DeveloperId) -> bool {
        self.developer == developer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds the key (newly or from an earlier acquire).
    Granted(CheckoutInfo),
    /// Another developer holds the key; their entry is returned untouched.
    AlreadyHeld(CheckoutInfo),
}

/// Application-level lock service over injected storage.
#[derive(Clone)]
pub struct CheckoutLedger {
    storage: Arc<dyn LedgerStorage>,
}

impl CheckoutLedger {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        Self { storage }
    }

    /// Acquires `key` for `session` if nobody else holds it.
    ///
    /// # Contract
    /// - Re-acquiring a key the caller already holds is granted and keeps the
    ///   version captured by the first acquire.
    pub async fn acquire(
        &self,
        key: CheckoutKey,
        session: &DeveloperSession,
        version: u32,
    ) -> StoreResult<AcquireOutcome> {
        let requested = CheckoutInfo::new(key, session, version);
        let holder = self.storage.insert_checkout(&requested).await?;
        if holder.is_held_by(session.id) {
            info!(
                "event=checkout module=checkout status=ok key={} developer={} version={}",
                key, session.id, holder.version
            );
            Ok(AcquireOutcome::Granted(holder))
        } else {
            warn!(
                "event=checkout module=checkout status=conflict key={} developer={} holder={}",
                key, session.id, holder.developer
            );
            Ok(AcquireOutcome::AlreadyHeld(holder))
        }
    }

    /// Records a freshly created artifact as held by its creator.
    pub async fn acquire_new(&self, key: CheckoutKey, session: &DeveloperSession) -> StoreResult<CheckoutInfo> {
        let info = CheckoutInfo::new(key, session, 0);
        self.storage.upsert_checkout(&info).await?;
        info!(
            "event=checkout module=checkout status=ok key={} developer={} version=0 new=true",
            key, session.id
        );
        Ok(info)
    }

    /// Removes the entry only when `developer` holds it.
    pub async fn release(&self, key: CheckoutKey, developer: DeveloperId) -> StoreResult<bool> {
        let removed = self.storage.delete_checkout(key, developer).await?;
        if removed {
            info!("event=checkout_release module=checkout status=ok key={key} developer={developer}");
        }
        Ok(removed)
    }

    pub async fn lookup(&self, key: CheckoutKey) -> StoreResult<Option<CheckoutInfo>> {
        self.storage.find_checkout(key).await
    }

    pub async fn release_all_for_developer(&self, developer: DeveloperId) -> StoreResult<usize> {
        let removed = self.storage.delete_checkouts_for(developer).await?;
        info!(
            "event=checkout_release module=checkout status=ok developer={developer} released={removed}"
        );
        Ok(removed)
    }

    /// Whole ledger, keyed for tree construction.
    pub async fn load_all(&self) -> StoreResult<HashMap<CheckoutKey, CheckoutInfo>> {
        let rows = self.storage.load_checkouts().await?;
        Ok(rows.into_iter().map(|info| (info.key, info)).collect())
    }

    /// Releases every lock of `developer` inside a publish transaction.
    pub async fn checkin_in(&self, txn: &mut dyn MetaTxn, developer: DeveloperId) -> StoreResult<usize> {
        txn.release_checkouts(developer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::id::Layer;
    use crate::store::SqliteMetaStore;

    fn ledger() -> CheckoutLedger {
        CheckoutLedger::new(Arc::new(SqliteMetaStore::in_memory().unwrap()))
    }

    fn key(seq: u32) -> CheckoutKey {
        CheckoutKey::artifact(ArtifactId::new(1, ArtifactKind::Entity, seq, Layer::User).unwrap())
    }

    #[tokio::test]
    async fn second_developer_sees_holder() {
        let ledger = ledger();
        let alice = DeveloperSession::new(DeveloperId::random(), "alice");
        let bob = DeveloperSession::new(DeveloperId::random(), "bob");

        assert!(matches!(
            ledger.acquire(key(1), &alice, 3).await.unwrap(),
            AcquireOutcome::Granted(_)
        ));
        match ledger.acquire(key(1), &bob, 4).await.unwrap() {
            AcquireOutcome::AlreadyHeld(info) => {
                assert_eq!(info.developer, alice.id);
                assert_eq!(info.version, 3);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reacquire_keeps_first_version() {
        let ledger = ledger();
        let alice = DeveloperSession::new(DeveloperId::random(), "alice");
        ledger.acquire(key(1), &alice, 3).await.unwrap();
        let again = ledger.acquire(key(1), &alice, 9).await.unwrap();
        assert!(matches!(again, AcquireOutcome::Granted(ref info) if info.version == 3));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let ledger = ledger();
        let alice = DeveloperSession::new(DeveloperId::random(), "alice");
        ledger.acquire(key(1), &alice, 1).await.unwrap();

        assert!(!ledger.release(key(1), DeveloperId::random()).await.unwrap());
        assert!(ledger.lookup(key(1)).await.unwrap().is_some());
        assert!(ledger.release(key(1), alice.id).await.unwrap());
        assert!(ledger.lookup(key(1)).await.unwrap().is_none());
    }

    #[test]
    fn folder_tree_key_uses_folder_kind() {
        let key = CheckoutKey::folder_tree(4, ArtifactKind::Service);
        assert_eq!(key.kind, ArtifactKind::Folder);
        assert_eq!(key.id.app_id(), 4);
        assert_eq!(key.id.sequence(), u32::from(ArtifactKind::Service.code()));
    }
}
