//! Cluster cache-invalidation contract.
//!
//! # Invariants
//! - Invalidation runs after the metadata commit and never undoes it; the
//!   publish coordinator turns failures into report warnings.

use async_trait::async_trait;
use log::info;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidationError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("invalidation rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Evicts `names` from every node's model cache. `also_non_executable`
    /// asks nodes to drop cached entity and view models as well.
    async fn invalidate_artifacts(&self, names: &[String], also_non_executable: bool) -> Result<(), InvalidationError>;
}

/// Invalidator for single-node deployments: records the request in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyInvalidator;

#[async_trait]
impl CacheInvalidator for LogOnlyInvalidator {
    async fn invalidate_artifacts(&self, names: &[String], also_non_executable: bool) -> Result<(), InvalidationError> {
        info!(
            "event=cache_invalidation module=cluster status=ok names={} also_non_executable={}",
            names.join(","),
            also_non_executable
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_only_invalidator_always_succeeds() {
        let names = vec!["sales.Billing".to_string()];
        assert!(LogOnlyInvalidator.invalidate_artifacts(&names, true).await.is_ok());
    }
}
