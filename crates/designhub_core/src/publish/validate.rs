//! Structural checks run before compilation. They read and never write.

use super::error::ValidationIssue;
use super::package::PublishPackage;
use crate::catalog::CatalogTree;
use crate::model::application::is_valid_name;
use crate::model::artifact::Artifact;
use crate::model::entity::EntityDef;
use crate::model::id::ArtifactKind;
use crate::store::ExternalStoreRegistry;
use std::collections::BTreeSet;

fn display_name(tree: &CatalogTree, artifact: &Artifact) -> String {
    tree.app_name(artifact.id().app_id())
        .map(|app| artifact.full_name(app))
        .unwrap_or_else(|| artifact.id().to_string())
}

/// Returns every issue found in `package`; empty means valid.
pub(crate) fn validate(
    tree: &CatalogTree,
    package: &PublishPackage,
    stores: &ExternalStoreRegistry,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for artifact in &package.artifacts {
        if artifact.is_visible() {
            check_live(tree, artifact, stores, &mut issues);
        } else {
            check_deleted(tree, artifact, stores, &mut issues);
        }
    }
    check_folders(tree, package, &mut issues);

    let mut unique: Vec<ValidationIssue> = Vec::with_capacity(issues.len());
    for issue in issues {
        if !unique.contains(&issue) {
            unique.push(issue);
        }
    }
    unique
}

fn check_live(tree: &CatalogTree, artifact: &Artifact, stores: &ExternalStoreRegistry, issues: &mut Vec<ValidationIssue>) {
    let id = artifact.id();
    if !is_valid_name(artifact.name()) {
        issues.push(ValidationIssue::InvalidName {
            id,
            name: artifact.name().to_string(),
        });
    }
    let same_name = tree
        .artifacts_of(id.app_id(), id.kind())
        .into_iter()
        .filter(|other| other.name() == artifact.name())
        .count();
    if same_name > 1 {
        issues.push(ValidationIssue::DuplicateName {
            app: id.app_id(),
            kind: id.kind(),
            name: artifact.name().to_string(),
        });
    }

    let from = display_name(tree, artifact);
    for target in artifact.references() {
        match tree.artifact(target) {
            None => issues.push(ValidationIssue::DanglingReference {
                from: from.clone(),
                target,
            }),
            Some(used) if !used.is_visible() => issues.push(ValidationIssue::ReferenceToDeleted {
                from: from.clone(),
                target: display_name(tree, used),
            }),
            Some(_) => {}
        }
    }

    if let Some(entity) = artifact.as_entity() {
        check_entity(tree, &from, entity, stores, issues);
    }
}

fn check_entity(
    tree: &CatalogTree,
    from: &str,
    entity: &EntityDef,
    stores: &ExternalStoreRegistry,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut seen = BTreeSet::new();
    for member in entity.members() {
        if !seen.insert(member.name.as_str()) {
            issues.push(ValidationIssue::DuplicateMemberName {
                artifact: from.to_string(),
                member: member.name.clone(),
            });
        }
    }
    let Some(sql) = entity.sql() else {
        return;
    };
    for key in &sql.primary_keys {
        let is_field = entity
            .member(*key)
            .is_some_and(|member| member.as_data_field().is_some() && !member.state.is_deleted());
        if !is_field {
            issues.push(ValidationIssue::UnknownPrimaryKey {
                artifact: from.to_string(),
                member: *key,
            });
        }
    }
    check_store(tree, from, entity, stores, issues);
}

fn check_store(
    tree: &CatalogTree,
    from: &str,
    entity: &EntityDef,
    stores: &ExternalStoreRegistry,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(sql) = entity.sql() else {
        return;
    };
    match tree.artifact(sql.store).filter(|store| store.as_data_store().is_some()) {
        None => issues.push(ValidationIssue::UnboundStore {
            artifact: from.to_string(),
            store: sql.store,
        }),
        Some(store) if !stores.contains(store.name()) => issues.push(ValidationIssue::UnregisteredStore {
            artifact: from.to_string(),
            store: store.name().to_string(),
        }),
        Some(_) => {}
    }
}

fn check_deleted(tree: &CatalogTree, artifact: &Artifact, stores: &ExternalStoreRegistry, issues: &mut Vec<ValidationIssue>) {
    let target = display_name(tree, artifact);
    if let Some(entity) = artifact.as_entity() {
        check_store(tree, &target, entity, stores, issues);
    }
    let app_ids: Vec<_> = tree.applications().map(|app| app.id).collect();
    for app in app_ids {
        for kind in ArtifactKind::APPLICATION_KINDS {
            for user in tree.artifacts_of(app, kind) {
                if user.references().contains(&artifact.id()) {
                    issues.push(ValidationIssue::ReferenceToDeleted {
                        from: display_name(tree, user),
                        target: target.clone(),
                    });
                }
            }
        }
    }
}

fn check_folders(tree: &CatalogTree, package: &PublishPackage, issues: &mut Vec<ValidationIssue>) {
    let mut reported = BTreeSet::new();
    for folder in package.folders.iter().filter(|folder| !folder.state.is_deleted()) {
        let Some(folders) = tree.folder_tree(folder.app_id, folder.target_kind) else {
            continue;
        };
        let clashes = folders
            .children(folder.parent)
            .into_iter()
            .filter(|sibling| sibling.name == folder.name)
            .count();
        if clashes > 1 && reported.insert((folder.app_id, folder.target_kind, folder.parent, folder.name.clone())) {
            issues.push(ValidationIssue::DuplicateFolderName {
                name: folder.name.clone(),
            });
        }
    }
}
