//! Core of the design hub: the artifact catalog, checkout locks, staged
//! edits and the publish transaction coordinator.
//! This crate is the single source of truth for catalog invariants.

pub mod catalog;
pub mod checkout;
pub mod cluster;
pub mod compile;
pub mod config;
pub mod db;
pub mod hub;
pub mod logging;
pub mod model;
pub mod publish;
pub mod session;
pub mod staged;
pub mod store;
pub mod wire;

pub use catalog::{CatalogError, CatalogResult, CatalogTree, CheckoutOutcome, DesignCatalog};
pub use checkout::{AcquireOutcome, CheckoutInfo, CheckoutKey, CheckoutLedger};
pub use cluster::{CacheInvalidator, InvalidationError, LogOnlyInvalidator};
pub use compile::{CompileOutcome, CompileRequest, Compiler, Diagnostic, ExecutableUnit};
pub use config::{ConfigError, HubConfig};
pub use hub::{DesignHub, HubError, HubParts, HubResult, HubStatus};
pub use logging::{default_log_level, init_logging, logging_status, LogLevel};
pub use model::artifact::{Artifact, ArtifactBody};
pub use model::id::{AppId, ArtifactId, ArtifactKind};
pub use publish::{PublishCoordinator, PublishError, PublishPhase, PublishReport};
pub use session::{DeveloperId, DeveloperSession};
pub use staged::StagedEditStore;
pub use store::{StoreError, StoreResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
