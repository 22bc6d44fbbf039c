use designhub_core::model::artifact::{Artifact, ArtifactBody, ViewDef};
use designhub_core::model::folder::FolderTree;
use designhub_core::model::id::{ArtifactId, ArtifactKind, Layer};
use designhub_core::store::SqliteMetaStore;
use designhub_core::{CheckoutKey, DeveloperId, StagedEditStore};
use std::sync::Arc;
use std::time::Duration;

fn view(seq: u32, source: &str) -> Artifact {
    let id = ArtifactId::new(1, ArtifactKind::View, seq, Layer::User).unwrap();
    Artifact::new(
        id,
        &format!("Page{seq}"),
        ArtifactBody::View(ViewDef {
            source: source.to_string(),
            route: Some(format!("/page/{seq}")),
            references: Vec::new(),
        }),
    )
}

#[tokio::test]
async fn staged_edits_are_private_to_each_developer() {
    let staged = StagedEditStore::new(Arc::new(SqliteMetaStore::in_memory().unwrap()));
    let alice = DeveloperId::random();
    let bob = DeveloperId::random();
    staged.save_artifact(alice, &view(1, "<a/>")).await.unwrap();
    staged.save_artifact(bob, &view(2, "<b/>")).await.unwrap();

    let key = CheckoutKey::artifact(view(1, "").id());
    assert!(staged.load(alice, key).await.unwrap().is_some());
    assert!(staged.load(bob, key).await.unwrap().is_none());

    assert_eq!(staged.delete_all(alice).await.unwrap(), 1);
    assert!(staged.load_all(alice).await.unwrap().is_empty());
    assert_eq!(staged.load_all(bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn staged_only_artifacts_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");
    let developer = DeveloperId::random();
    let mut folders = FolderTree::new(1, ArtifactKind::View);
    folders.create(None, "Reports").unwrap();
    {
        let staged = StagedEditStore::new(Arc::new(SqliteMetaStore::open(&path, Duration::from_secs(1)).unwrap()));
        staged.save_artifact(developer, &view(1, "<first/>")).await.unwrap();
        staged.save_artifact(developer, &view(1, "<second/>")).await.unwrap();
        staged.save_folder_tree(developer, &folders).await.unwrap();
    }

    let staged = StagedEditStore::new(Arc::new(SqliteMetaStore::open(&path, Duration::from_secs(1)).unwrap()));
    let items = staged.load_items(developer).await.unwrap();
    assert_eq!(items.artifacts, vec![view(1, "<second/>")]);
    assert_eq!(items.folder_trees, vec![folders]);
}

#[tokio::test]
async fn delete_only_touches_the_named_key() {
    let staged = StagedEditStore::new(Arc::new(SqliteMetaStore::in_memory().unwrap()));
    let developer = DeveloperId::random();
    staged.save_artifact(developer, &view(1, "")).await.unwrap();
    staged.save_artifact(developer, &view(2, "")).await.unwrap();

    let first = CheckoutKey::artifact(view(1, "").id());
    assert!(staged.delete(developer, first).await.unwrap());
    assert!(!staged.delete(developer, first).await.unwrap());
    let left = staged.load_all(developer).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].key, CheckoutKey::artifact(view(2, "").id()));
}
