//! Publish failure taxonomy.

use crate::catalog::CatalogError;
use crate::compile::Diagnostic;
use crate::model::id::{AppId, ArtifactId, ArtifactKind, MemberId};
use crate::store::StoreError;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// One structural problem found before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("invalid name `{name}` on {id}")]
    InvalidName { id: ArtifactId, name: String },
    #[error("duplicate {kind} name `{name}` in application {app}")]
    DuplicateName {
        app: AppId,
        kind: ArtifactKind,
        name: String,
    },
    #[error("duplicate folder name `{name}` under one parent")]
    DuplicateFolderName { name: String },
    #[error("duplicate member `{member}` in `{artifact}`")]
    DuplicateMemberName { artifact: String, member: String },
    #[error("`{from}` references missing artifact {target}")]
    DanglingReference { from: String, target: ArtifactId },
    #[error("`{from}` references `{target}` which is being deleted")]
    ReferenceToDeleted { from: String, target: String },
    #[error("`{artifact}` keys on unknown member {member}")]
    UnknownPrimaryKey { artifact: String, member: MemberId },
    #[error("`{artifact}` is bound to missing data store {store}")]
    UnboundStore { artifact: String, store: ArtifactId },
    #[error("`{artifact}` is bound to unregistered store `{store}`")]
    UnregisteredStore { artifact: String, store: String },
    #[error("dependency cycle between {}", .names.join(", "))]
    DependencyCycle { names: Vec<String> },
    #[error("renames swap the names {}", .names.join(", "))]
    RenameCycle { names: Vec<String> },
}

/// Diagnostics of one service that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub unit_name: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Where inside the commit phase a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStage {
    Begin,
    Apply { target: String },
    Checkin,
    ExternalCommit { store: String },
    MetadataCommit,
}

impl Display for CommitStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => f.write_str("begin"),
            Self::Apply { target } => write!(f, "apply {target}"),
            Self::Checkin => f.write_str("checkin"),
            Self::ExternalCommit { store } => write!(f, "commit of store `{store}`"),
            Self::MetadataCommit => f.write_str("metadata commit"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),
    #[error("compilation failed for {} unit(s)", .0.len())]
    Compile(Vec<CompileFailure>),
    /// `committed_stores` lists external stores whose DDL was already
    /// committed when the failure hit; non-empty means the partial commit
    /// window was entered and needs manual reconciliation.
    #[error("commit failed at {stage}: {cause}")]
    CommitFailure {
        stage: CommitStage,
        #[source]
        cause: StoreError,
        committed_stores: Vec<String>,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PublishError {
    pub fn is_partial_commit(&self) -> bool {
        matches!(self, Self::CommitFailure { committed_stores, .. } if !committed_stores.is_empty())
    }

    /// Stable code for log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Compile(_) => "compile",
            Self::CommitFailure { .. } => "commit_failure",
            Self::Catalog(_) => "catalog",
            Self::Store(_) => "store",
        }
    }
}
