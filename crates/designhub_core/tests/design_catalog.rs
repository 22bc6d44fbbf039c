mod common;

use common::{keyed_entity, service, Harness};
use designhub_core::model::artifact::{ArtifactBody, DataStoreDef};
use designhub_core::model::id::ArtifactKind;
use designhub_core::model::state::PersistentState;
use designhub_core::store::MetaStore;
use designhub_core::{CatalogError, CheckoutKey, DesignCatalog, DeveloperId, DeveloperSession};
use std::sync::Arc;
use std::time::Duration;

fn set_source(body: &mut ArtifactBody, source: &str) {
    if let ArtifactBody::Service(service) = body {
        service.source = source.to_string();
    }
}

#[tokio::test]
async fn second_load_while_one_is_in_flight_fails_fast() {
    let harness = Harness::new(&[]).await;
    let catalog = Arc::new(
        harness
            .hub
            .open_session(DeveloperSession::new(DeveloperId::random(), "alice")),
    );

    // Hold the metadata connection so the first load parks mid-way.
    let blocker = harness.meta.begin().await.unwrap();
    let first = {
        let catalog = catalog.clone();
        tokio::spawn(async move { catalog.load().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(catalog.load().await, Err(CatalogError::AlreadyLoading)));
    assert!(!catalog.read().await.is_loaded());

    blocker.rollback().await.unwrap();
    first.await.unwrap().unwrap();
    assert!(catalog.read().await.is_loaded());
    catalog.load().await.unwrap();
}

#[tokio::test]
async fn edits_before_load_are_rejected() {
    let harness = Harness::new(&[]).await;
    let catalog = harness
        .hub
        .open_session(DeveloperSession::new(DeveloperId::random(), "alice"));
    let err = catalog
        .create_artifact(harness.app.id, "Billing", service("", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::NotLoaded));
}

#[tokio::test]
async fn checkout_held_by_another_developer_is_a_lock_conflict() {
    let harness = Harness::new(&["Sales"]).await;
    let alice = harness.session("alice").await;
    let id = alice
        .create_artifact(harness.app.id, "Customer", keyed_entity(harness.data_store("Sales")))
        .await
        .unwrap();
    harness.publisher().publish(&alice).await.unwrap();

    let bob = harness.session("bob").await;
    alice.checkout(CheckoutKey::artifact(id)).await.unwrap();
    let err = bob.checkout(CheckoutKey::artifact(id)).await.unwrap_err();
    match err {
        CatalogError::LockConflict { holder, holder_name, .. } => {
            assert_eq!(holder, alice.session().id);
            assert_eq!(holder_name, "alice");
        }
        other => panic!("unexpected error: {other}"),
    }
    let tree = bob.read().await;
    assert!(tree.is_held_by(CheckoutKey::artifact(id), alice.session().id));
}

#[tokio::test]
async fn reload_overlays_own_staged_edits_only() {
    let harness = Harness::new(&[]).await;
    let alice = harness.session("alice").await;
    let id = alice
        .create_artifact(harness.app.id, "Billing", service("v1", Vec::new()))
        .await
        .unwrap();
    alice.edit(id, |body| {
        set_source(body, "v2");
        Ok(())
    })
    .await
    .unwrap();

    let again = harness.hub.open_session(alice.session().clone());
    again.load().await.unwrap();
    let staged = again.artifact(id).await.unwrap();
    assert_eq!(staged.source(), Some("v2"));
    assert_eq!(staged.state(), PersistentState::Detached);

    let bob = harness.session("bob").await;
    assert!(bob.artifact(id).await.is_none());
}

#[tokio::test]
async fn edits_require_the_sessions_own_checkout() {
    let harness = Harness::new(&[]).await;
    let alice = harness.session("alice").await;
    let id = alice
        .create_artifact(harness.app.id, "Billing", service("v1", Vec::new()))
        .await
        .unwrap();
    harness.publisher().publish(&alice).await.unwrap();

    let err = alice.rename(id, "Invoicing").await.unwrap_err();
    assert!(matches!(err, CatalogError::NotCheckedOut(_)));

    alice.checkout(CheckoutKey::artifact(id)).await.unwrap();
    alice.rename(id, "Invoicing").await.unwrap();
    let renamed = alice.artifact(id).await.unwrap();
    assert_eq!(renamed.name(), "Invoicing");
    assert_eq!(renamed.committed_name(), "Billing");
    assert_eq!(renamed.state(), PersistentState::Modified);
}

#[tokio::test]
async fn deleting_a_never_published_artifact_discards_it() {
    let harness = Harness::new(&[]).await;
    let alice = harness.session("alice").await;
    let id = alice
        .create_artifact(harness.app.id, "Scratch", service("", Vec::new()))
        .await
        .unwrap();
    let key = CheckoutKey::artifact(id);

    alice.delete(id).await.unwrap();
    assert!(alice.artifact(id).await.is_none());
    assert!(harness.hub.ledger().lookup(key).await.unwrap().is_none());
    assert!(harness
        .hub
        .staged()
        .load(alice.session().id, key)
        .await
        .unwrap()
        .is_none());
    assert!(alice.find_pending_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn checkout_picks_up_a_newer_committed_version() {
    let harness = Harness::new(&[]).await;
    let alice = harness.session("alice").await;
    let id = alice
        .create_artifact(harness.app.id, "Billing", service("v1", Vec::new()))
        .await
        .unwrap();
    harness.publisher().publish(&alice).await.unwrap();

    let bob = harness.session("bob").await;
    alice.checkout(CheckoutKey::artifact(id)).await.unwrap();
    alice.edit(id, |body| {
        set_source(body, "v2");
        Ok(())
    })
    .await
    .unwrap();
    harness.publisher().publish(&alice).await.unwrap();

    assert_eq!(bob.artifact(id).await.unwrap().source(), Some("v1"));
    let outcome = bob.checkout(CheckoutKey::artifact(id)).await.unwrap();
    assert!(outcome.model_changed);
    assert_eq!(outcome.info.version, 2);
    let fresh = bob.artifact(id).await.unwrap();
    assert_eq!(fresh.source(), Some("v2"));
    assert_eq!(fresh.version(), 2);
}

#[tokio::test]
async fn duplicate_and_invalid_names_are_rejected_on_create() {
    let harness = Harness::new(&[]).await;
    let alice = harness.session("alice").await;
    alice
        .create_artifact(harness.app.id, "Billing", service("", Vec::new()))
        .await
        .unwrap();

    assert!(matches!(
        alice
            .create_artifact(harness.app.id, "Billing", service("", Vec::new()))
            .await,
        Err(CatalogError::DuplicateName { .. })
    ));
    assert!(matches!(
        alice
            .create_artifact(harness.app.id, "9lives", service("", Vec::new()))
            .await,
        Err(CatalogError::InvalidName(_))
    ));
    assert!(matches!(
        alice
            .create_artifact(harness.app.id, "Store", ArtifactBody::DataStore(DataStoreDef::sql("sqlite")))
            .await,
        Err(CatalogError::ApplicationNotFound(_))
    ));
}

#[tokio::test]
async fn lookups_by_full_name_and_pending_changes_are_stable() {
    let harness = Harness::new(&["Sales"]).await;
    let alice = harness.session("alice").await;
    let id = alice
        .create_artifact(harness.app.id, "Invoice", keyed_entity(harness.data_store("Sales")))
        .await
        .unwrap();

    let found = alice.find_by_full_name("sales.Entities.Invoice").await.unwrap();
    assert_eq!(found.id(), id);
    let store = alice.find_by_full_name("sys.DataStores.Sales").await.unwrap();
    assert_eq!(store.id(), harness.data_store("Sales"));

    let first = alice.find_pending_changes().await.unwrap();
    let second = alice.find_pending_changes().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.artifacts.len(), 1);
}

#[tokio::test]
async fn folder_edits_need_the_folder_tree_checkout() {
    let harness = Harness::new(&[]).await;
    let alice = harness.session("alice").await;
    let app = harness.app.id;
    let err = alice
        .create_folder(app, ArtifactKind::Service, None, "Billing")
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::NotCheckedOut(_)));

    alice
        .checkout(CheckoutKey::folder_tree(app, ArtifactKind::Service))
        .await
        .unwrap();
    let folder = alice
        .create_folder(app, ArtifactKind::Service, None, "Billing")
        .await
        .unwrap();
    let id = alice
        .create_artifact(app, "Invoicing", service("", Vec::new()))
        .await
        .unwrap();
    alice.move_to_folder(id, Some(folder)).await.unwrap();

    let err = alice
        .delete_folder(app, ArtifactKind::Service, folder)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::FolderNotEmpty(_)));

    alice.move_to_folder(id, None).await.unwrap();
    alice
        .delete_folder(app, ArtifactKind::Service, folder)
        .await
        .unwrap();
    let tree = alice.read().await;
    assert!(tree
        .folder_tree(app, ArtifactKind::Service)
        .unwrap()
        .get(folder)
        .is_none());
}

#[tokio::test]
async fn unloaded_catalog_reports_not_loaded_for_pending_changes() {
    let harness = Harness::new(&[]).await;
    let catalog: DesignCatalog = harness
        .hub
        .open_session(DeveloperSession::new(DeveloperId::random(), "alice"));
    assert!(matches!(
        catalog.find_pending_changes().await,
        Err(CatalogError::NotLoaded)
    ));
}
