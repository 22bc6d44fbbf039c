//! Dependency ordering of package artifacts.
//!
//! # Invariants
//! - Deleted artifacts come first, dependents before the artifacts they use,
//!   so a name or table they free is gone before a live artifact claims it.
//! - Live artifacts follow, every referenced package artifact before its
//!   dependents. Ties break by id, so the order is deterministic.
//! - A live artifact taking a name another package artifact is renamed away
//!   from waits for that rename. Renames that swap names are rejected.
//! - A cycle among live artifacts is rejected; self references are ignored.

use super::error::ValidationIssue;
use crate::model::artifact::Artifact;
use crate::model::id::ArtifactId;
use crate::model::state::PersistentState;
use std::collections::{BTreeMap, BTreeSet};

/// Kahn's algorithm over `deps` (node -> nodes it depends on, all in the map).
/// Returns the sorted nodes and the nodes left in cycles.
fn kahn(deps: &BTreeMap<ArtifactId, Vec<ArtifactId>>) -> (Vec<ArtifactId>, Vec<ArtifactId>) {
    let mut indegree: BTreeMap<ArtifactId, usize> = deps.keys().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<ArtifactId, Vec<ArtifactId>> = BTreeMap::new();
    for (node, node_deps) in deps {
        for dep in node_deps {
            if dep == node || !deps.contains_key(dep) {
                continue;
            }
            *indegree.entry(*node).or_default() += 1;
            dependents.entry(*dep).or_default().push(*node);
        }
    }

    let mut ready: BTreeSet<ArtifactId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = Vec::with_capacity(deps.len());
    while let Some(node) = ready.pop_first() {
        sorted.push(node);
        for dependent in dependents.get(&node).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }
    let stuck = indegree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id)
        .collect();
    (sorted, stuck)
}

fn graph<'a>(artifacts: impl Iterator<Item = &'a Artifact>) -> BTreeMap<ArtifactId, Vec<ArtifactId>> {
    let mut deps: BTreeMap<ArtifactId, Vec<ArtifactId>> =
        artifacts.map(|artifact| (artifact.id(), artifact.references())).collect();
    let members: BTreeSet<ArtifactId> = deps.keys().copied().collect();
    for node_deps in deps.values_mut() {
        node_deps.retain(|dep| members.contains(dep));
    }
    deps
}

/// Adds an edge from every live artifact to the package artifact that is
/// renamed away from the name it takes.
fn add_name_handoffs(live: &[&Artifact], deps: &mut BTreeMap<ArtifactId, Vec<ArtifactId>>) {
    for taker in live {
        for holder in live {
            let frees_name = holder.state() == PersistentState::Modified
                && holder.name() != holder.committed_name()
                && holder.committed_name() == taker.name();
            if holder.id() != taker.id()
                && frees_name
                && holder.id().app_id() == taker.id().app_id()
                && holder.id().kind() == taker.id().kind()
            {
                deps.entry(taker.id()).or_default().push(holder.id());
            }
        }
    }
}

fn sorted_names(artifacts: &[Artifact], ids: &[ArtifactId]) -> Vec<String> {
    let mut names: Vec<String> = artifacts
        .iter()
        .filter(|artifact| ids.contains(&artifact.id()))
        .map(|artifact| artifact.name().to_string())
        .collect();
    names.sort();
    names
}

/// Reorders `artifacts` for commit.
pub(crate) fn commit_order(artifacts: Vec<Artifact>) -> Result<Vec<Artifact>, ValidationIssue> {
    let live: Vec<&Artifact> = artifacts.iter().filter(|artifact| artifact.is_visible()).collect();
    let mut live_deps = graph(live.iter().copied());
    let (_, stuck) = kahn(&live_deps);
    if !stuck.is_empty() {
        return Err(ValidationIssue::DependencyCycle {
            names: sorted_names(&artifacts, &stuck),
        });
    }
    add_name_handoffs(&live, &mut live_deps);
    let (live_order, stuck) = kahn(&live_deps);
    if !stuck.is_empty() {
        return Err(ValidationIssue::RenameCycle {
            names: sorted_names(&artifacts, &stuck),
        });
    }

    let deleted = graph(artifacts.iter().filter(|artifact| !artifact.is_visible()));
    let (mut deleted_order, deleted_stuck) = kahn(&deleted);
    deleted_order.reverse();
    deleted_order.extend(deleted_stuck);

    let mut by_id: BTreeMap<ArtifactId, Artifact> =
        artifacts.into_iter().map(|artifact| (artifact.id(), artifact)).collect();
    Ok(deleted_order
        .into_iter()
        .chain(live_order)
        .filter_map(|id| by_id.remove(&id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::artifact::{ArtifactBody, ServiceDef};
    use crate::model::id::{ArtifactKind, Layer};

    fn service(seq: u32, refs: &[u32]) -> Artifact {
        let id = |seq| ArtifactId::new(1, ArtifactKind::Service, seq, Layer::User).unwrap();
        Artifact::new(
            id(seq),
            &format!("S{seq}"),
            ArtifactBody::Service(ServiceDef {
                source: String::new(),
                references: refs.iter().map(|seq| id(*seq)).collect(),
            }),
        )
    }

    fn names(artifacts: &[Artifact]) -> Vec<&str> {
        artifacts.iter().map(Artifact::name).collect()
    }

    #[test]
    fn referenced_artifacts_come_first() {
        let ordered = commit_order(vec![service(1, &[3]), service(2, &[]), service(3, &[2])]).unwrap();
        assert_eq!(names(&ordered), vec!["S2", "S3", "S1"]);
    }

    #[test]
    fn references_outside_the_package_and_self_loops_are_ignored() {
        let ordered = commit_order(vec![service(1, &[1, 9]), service(2, &[])]).unwrap();
        assert_eq!(names(&ordered), vec!["S1", "S2"]);
    }

    #[test]
    fn mutual_references_are_a_cycle() {
        let err = commit_order(vec![service(1, &[2]), service(2, &[1]), service(3, &[])]).unwrap_err();
        assert_eq!(
            err,
            ValidationIssue::DependencyCycle {
                names: vec!["S1".to_string(), "S2".to_string()]
            }
        );
    }

    #[test]
    fn deletes_precede_live_artifacts_dependents_first() {
        let mut used = service(1, &[]).committed_copy();
        used.mark_deleted();
        let mut user = service(2, &[1]).committed_copy();
        user.mark_deleted();
        let ordered = commit_order(vec![service(3, &[]), used, user]).unwrap();
        assert_eq!(names(&ordered), vec!["S2", "S1", "S3"]);
    }

    #[test]
    fn a_name_freed_by_a_rename_is_taken_after_the_rename() {
        let mut first = service(1, &[]).committed_copy();
        first.rename("S9");
        let mut second = service(2, &[]).committed_copy();
        second.rename("S1");
        let ordered = commit_order(vec![second, first]).unwrap();
        assert_eq!(names(&ordered), vec!["S9", "S1"]);
    }

    #[test]
    fn swapped_names_are_a_rename_cycle() {
        let mut first = service(1, &[]).committed_copy();
        first.rename("S2");
        let mut second = service(2, &[]).committed_copy();
        second.rename("S1");
        let err = commit_order(vec![first, second]).unwrap_err();
        assert_eq!(
            err,
            ValidationIssue::RenameCycle {
                names: vec!["S1".to_string(), "S2".to_string()]
            }
        );
    }
}
