//! Publish coordinator.
//!
//! # Responsibility
//! - Turn a developer's pending changes into a package, validate and order
//!   it, compile its services, and commit it to the metadata store and the
//!   external stores it touches.
//! - Check the developer's locks back in and notify the cluster.
//!
//! # Invariants
//! - Phases run in order: collecting, validating, compiling, committing,
//!   checked in, invalidated. Any failure before the metadata commit aborts.
//! - Validation and compilation never write; a failure there leaves every
//!   store, the ledger and the staged edits untouched.
//! - The session tree is only updated after the metadata commit succeeded.
//! - Invalidation failures become report warnings, never errors.
//! - No check detects folder-structure changes made by other sessions
//!   between load and publish.
//!
//! # See also
//! - `commit` for the transaction ordering and the partial commit window.

mod commit;
pub mod error;
mod order;
pub mod package;
mod validate;

use crate::catalog::{CatalogTree, DesignCatalog};
use crate::checkout::CheckoutLedger;
use crate::cluster::CacheInvalidator;
use crate::compile::{CompileDependency, CompileRequest, Compiler};
use crate::model::folder::FolderId;
use crate::model::id::ArtifactId;
use crate::session::DeveloperId;
use crate::staged::StagedEditStore;
use crate::store::{ExternalStoreRegistry, MetaStore};
use commit::{commit_package, CommitContext};
use log::{info, warn};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use error::{CommitStage, CompileFailure, PublishError, ValidationIssue};
pub use package::{CompiledUnit, PublishPackage, SourceBlob};

pub const DEFAULT_INVALIDATION_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    Collecting,
    Validating,
    Compiling,
    Committing,
    CheckedIn,
    Invalidated,
    Aborted,
}

impl PublishPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Validating => "validating",
            Self::Compiling => "compiling",
            Self::Committing => "committing",
            Self::CheckedIn => "checked_in",
            Self::Invalidated => "invalidated",
            Self::Aborted => "aborted",
        }
    }
}

impl Display for PublishPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub phase: PublishPhase,
    /// Artifacts in commit order, deletions included.
    pub committed_artifacts: Vec<ArtifactId>,
    pub committed_folders: Vec<FolderId>,
    /// External stores whose transaction was committed.
    pub external_stores: Vec<String>,
    pub invalidated: Vec<String>,
    pub warnings: Vec<String>,
}

impl PublishReport {
    fn noop() -> Self {
        Self {
            phase: PublishPhase::Invalidated,
            committed_artifacts: Vec::new(),
            committed_folders: Vec::new(),
            external_stores: Vec::new(),
            invalidated: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// True when there was nothing to publish.
    pub fn is_noop(&self) -> bool {
        self.committed_artifacts.is_empty() && self.committed_folders.is_empty()
    }
}

pub struct PublishCoordinator {
    meta: Arc<dyn MetaStore>,
    ledger: CheckoutLedger,
    staged: StagedEditStore,
    stores: Arc<ExternalStoreRegistry>,
    compiler: Arc<dyn Compiler>,
    invalidator: Arc<dyn CacheInvalidator>,
    invalidation_timeout: Duration,
}

impl PublishCoordinator {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        ledger: CheckoutLedger,
        staged: StagedEditStore,
        stores: Arc<ExternalStoreRegistry>,
        compiler: Arc<dyn Compiler>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            meta,
            ledger,
            staged,
            stores,
            compiler,
            invalidator,
            invalidation_timeout: DEFAULT_INVALIDATION_TIMEOUT,
        }
    }

    pub fn with_invalidation_timeout(mut self, timeout: Duration) -> Self {
        self.invalidation_timeout = timeout;
        self
    }

    /// Publishes every pending change of the catalog's session.
    ///
    /// # Contract
    /// - An empty package is a no-op success that touches no store.
    /// - Holds the catalog's tree exclusively until the publish ends.
    pub async fn publish(&self, catalog: &DesignCatalog) -> Result<PublishReport, PublishError> {
        let started = Instant::now();
        let developer = catalog.session().id;
        let mut tree = catalog.lock_for_publish().await?;
        let result = self.run(&mut tree, developer).await;
        match &result {
            Ok(report) => info!(
                "event=publish module=publish status=ok developer={} artifacts={} folders={} stores={} warnings={} duration_ms={}",
                developer,
                report.committed_artifacts.len(),
                report.committed_folders.len(),
                report.external_stores.len(),
                report.warnings.len(),
                started.elapsed().as_millis()
            ),
            Err(err) => {
                log_phase(developer, PublishPhase::Aborted);
                warn!(
                    "event=publish_abort module=publish status=error developer={} error_code={} partial_commit={} duration_ms={} error={}",
                    developer,
                    err.code(),
                    err.is_partial_commit(),
                    started.elapsed().as_millis(),
                    err
                );
            }
        }
        result
    }

    async fn run(&self, tree: &mut CatalogTree, developer: DeveloperId) -> Result<PublishReport, PublishError> {
        log_phase(developer, PublishPhase::Collecting);
        let pending = tree.find_pending_changes(developer);
        if pending.is_empty() {
            info!("event=publish module=publish status=ok developer={developer} noop=true");
            return Ok(PublishReport::noop());
        }

        log_phase(developer, PublishPhase::Validating);
        let mut package = PublishPackage::collect(tree, pending)?;
        let mut issues = validate::validate(tree, &package, &self.stores);
        match order::commit_order(std::mem::take(&mut package.artifacts)) {
            Ok(ordered) => package.artifacts = ordered,
            Err(cycle) => issues.push(cycle),
        }
        if !issues.is_empty() {
            return Err(PublishError::Validation(issues));
        }

        log_phase(developer, PublishPhase::Compiling);
        self.compile_all(tree, &mut package).await?;

        log_phase(developer, PublishPhase::Committing);
        let ctx = CommitContext {
            tree: &*tree,
            package: &package,
            registry: &self.stores,
            ledger: &self.ledger,
            staged: &self.staged,
            developer,
        };
        let external_stores = commit_package(self.meta.as_ref(), &ctx).await?;

        log_phase(developer, PublishPhase::CheckedIn);
        tree.checkin_all(developer, &package.checkin_set());

        log_phase(developer, PublishPhase::Invalidated);
        let (names, also_non_executable) = package.invalidation();
        let warnings = self.invalidate(&names, also_non_executable).await;

        Ok(PublishReport {
            phase: PublishPhase::Invalidated,
            committed_artifacts: package.artifacts.iter().map(|artifact| artifact.id()).collect(),
            committed_folders: package.folders.iter().map(|folder| folder.id).collect(),
            external_stores,
            invalidated: names,
            warnings,
        })
    }

    /// Compiles every live service; any failure fails the whole package.
    async fn compile_all(&self, tree: &CatalogTree, package: &mut PublishPackage) -> Result<(), PublishError> {
        let mut failures = Vec::new();
        let mut units = Vec::new();
        for artifact in package
            .artifacts
            .iter()
            .filter(|artifact| artifact.is_executable() && artifact.is_visible())
        {
            let unit_name = package.unit_name(artifact.id().app_id(), artifact.name());
            let dependencies = artifact
                .references()
                .into_iter()
                .filter_map(|id| tree.artifact(id))
                .map(|used| CompileDependency {
                    full_name: used.full_name(tree.app_name(used.id().app_id()).unwrap_or_default()),
                    source: used.source().map(str::to_string),
                })
                .collect();
            let request = CompileRequest {
                unit_name: unit_name.clone(),
                source: artifact.source().unwrap_or_default().to_string(),
                dependencies,
            };
            match self.compiler.compile(&request).await {
                Ok(unit) => units.push(CompiledUnit {
                    unit_name,
                    bytes: unit.bytes,
                }),
                Err(diagnostics) => failures.push(CompileFailure {
                    unit_name,
                    diagnostics,
                }),
            }
        }
        if !failures.is_empty() {
            return Err(PublishError::Compile(failures));
        }
        package.compiled_units = units;
        Ok(())
    }

    async fn invalidate(&self, names: &[String], also_non_executable: bool) -> Vec<String> {
        if names.is_empty() {
            return Vec::new();
        }
        let call = self.invalidator.invalidate_artifacts(names, also_non_executable);
        let warning = match tokio::time::timeout(self.invalidation_timeout, call).await {
            Ok(Ok(())) => {
                info!(
                    "event=cache_invalidation module=publish status=ok names={} also_non_executable={}",
                    names.len(),
                    also_non_executable
                );
                return Vec::new();
            }
            Ok(Err(err)) => format!("cache invalidation failed: {err}"),
            Err(_) => format!(
                "cache invalidation timed out after {} ms",
                self.invalidation_timeout.as_millis()
            ),
        };
        warn!("event=cache_invalidation module=publish status=warn names={} reason=\"{}\"", names.len(), warning);
        vec![warning]
    }
}

fn log_phase(developer: DeveloperId, phase: PublishPhase) {
    info!("event=publish_phase module=publish status=ok developer={developer} phase={phase}");
}
