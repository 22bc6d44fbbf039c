//! Hub wiring: one metadata store, its ledger and staged storage, and the
//! registered external stores, shared by every developer session.
//!
//! # Responsibility
//! - Open the stores named by a [`HubConfig`].
//! - Hand out per-session catalogs and publish coordinators.
//! - Cover the administrative writes that sit outside the checkout flow:
//!   creating applications and registering data stores.

use crate::catalog::DesignCatalog;
use crate::checkout::{CheckoutInfo, CheckoutLedger};
use crate::cluster::CacheInvalidator;
use crate::compile::Compiler;
use crate::config::{ConfigError, HubConfig, IN_MEMORY_PATH};
use crate::model::application::{is_valid_name, Application, HUB_APP_NAME};
use crate::model::artifact::{Artifact, ArtifactBody, DataStoreDef};
use crate::model::id::{AppId, ArtifactId, ArtifactKind, IdError, Layer, HUB_APP_ID};
use crate::publish::PublishCoordinator;
use crate::session::{DeveloperId, DeveloperSession};
use crate::staged::StagedEditStore;
use crate::store::{
    ExternalStore, ExternalStoreRegistry, MetaStore, RegistryError, SqliteExternalStore, SqliteMetaStore,
    StoreError,
};
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error("invalid name `{0}`")]
    InvalidName(String),
    #[error("application `{0}` already exists")]
    DuplicateApplication(String),
    #[error("data store `{name}` is already registered with provider `{provider}`")]
    DataStoreMismatch { name: String, provider: String },
}

/// Explicit parts for a hub assembled in code.
pub struct HubParts {
    pub meta: Arc<dyn MetaStore>,
    pub ledger: CheckoutLedger,
    pub staged: StagedEditStore,
    pub stores: ExternalStoreRegistry,
    pub invalidation_timeout: Duration,
}

impl HubParts {
    /// Ledger and staged storage both live in `meta`'s database.
    pub fn sqlite(meta: SqliteMetaStore, stores: ExternalStoreRegistry) -> Self {
        let meta = Arc::new(meta);
        Self {
            meta: meta.clone(),
            ledger: CheckoutLedger::new(meta.clone()),
            staged: StagedEditStore::new(meta),
            stores,
            invalidation_timeout: crate::publish::DEFAULT_INVALIDATION_TIMEOUT,
        }
    }
}

/// Snapshot returned by [`DesignHub::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStatus {
    pub applications: Vec<Application>,
    pub artifact_counts: BTreeMap<ArtifactKind, usize>,
    pub checkouts: Vec<CheckoutInfo>,
    pub stores: Vec<String>,
}

pub struct DesignHub {
    meta: Arc<dyn MetaStore>,
    ledger: CheckoutLedger,
    staged: StagedEditStore,
    stores: Arc<ExternalStoreRegistry>,
    invalidation_timeout: Duration,
}

impl DesignHub {
    pub fn new(parts: HubParts) -> Self {
        Self {
            meta: parts.meta,
            ledger: parts.ledger,
            staged: parts.staged,
            stores: Arc::new(parts.stores),
            invalidation_timeout: parts.invalidation_timeout,
        }
    }

    /// Opens the metadata store and every configured external store.
    pub fn from_config(config: &HubConfig) -> HubResult<Self> {
        config.validate()?;
        let meta = if config.metadata.is_in_memory() {
            SqliteMetaStore::in_memory()?
        } else {
            SqliteMetaStore::open(&config.metadata.path, config.metadata.busy_timeout())?
        };

        let mut stores = ExternalStoreRegistry::new();
        for store in &config.stores {
            let external = if store.path == IN_MEMORY_PATH {
                SqliteExternalStore::in_memory(&store.name)?
            } else {
                SqliteExternalStore::open(&store.name, &store.path, store.busy_timeout())?
            };
            stores.register(Arc::new(external) as Arc<dyn ExternalStore>)?;
        }
        info!(
            "event=hub_open module=hub status=ok metadata={} stores={}",
            config.metadata.path,
            stores.names().join(",")
        );

        let mut parts = HubParts::sqlite(meta, stores);
        parts.invalidation_timeout = config.publish.invalidation_timeout();
        Ok(Self::new(parts))
    }

    pub fn ledger(&self) -> &CheckoutLedger {
        &self.ledger
    }

    pub fn staged(&self) -> &StagedEditStore {
        &self.staged
    }

    pub fn stores(&self) -> &ExternalStoreRegistry {
        &self.stores
    }

    /// A fresh, unloaded catalog for `session`.
    pub fn open_session(&self, session: DeveloperSession) -> DesignCatalog {
        DesignCatalog::new(session, self.meta.clone(), self.ledger.clone(), self.staged.clone())
    }

    pub fn publisher(&self, compiler: Arc<dyn Compiler>, invalidator: Arc<dyn CacheInvalidator>) -> PublishCoordinator {
        PublishCoordinator::new(
            self.meta.clone(),
            self.ledger.clone(),
            self.staged.clone(),
            self.stores.clone(),
            compiler,
            invalidator,
        )
        .with_invalidation_timeout(self.invalidation_timeout)
    }

    /// Creates an application with the next free id.
    pub async fn create_application(&self, name: &str, owner: &str) -> HubResult<Application> {
        let name = name.trim();
        if !is_valid_name(name) || name.eq_ignore_ascii_case(HUB_APP_NAME) {
            return Err(HubError::InvalidName(name.to_string()));
        }
        let existing = self.meta.load_applications().await?;
        if existing.iter().any(|app| app.name == name) {
            return Err(HubError::DuplicateApplication(name.to_string()));
        }
        let id: AppId = existing.iter().map(|app| app.id).max().unwrap_or(HUB_APP_ID) + 1;
        let app = Application::new(id, name, owner);

        let mut txn = self.meta.begin().await?;
        txn.create_application(&app).await?;
        txn.commit().await?;
        info!("event=application_create module=hub status=ok app_id={id} name={name}");
        Ok(app)
    }

    /// Records a committed data-store artifact named `name`.
    ///
    /// # Contract
    /// - Registering the same name and provider again returns the existing id.
    /// - A name already bound to another provider is rejected.
    pub async fn register_data_store(&self, name: &str, provider: &str) -> HubResult<ArtifactId> {
        if !is_valid_name(name) {
            return Err(HubError::InvalidName(name.to_string()));
        }
        let existing = self
            .meta
            .load_artifacts()
            .await?
            .into_iter()
            .find(|artifact| artifact.kind() == ArtifactKind::DataStore && artifact.name() == name);
        if let Some(artifact) = existing {
            let registered = artifact
                .as_data_store()
                .map(|store| store.provider.clone())
                .unwrap_or_default();
            if registered != provider {
                return Err(HubError::DataStoreMismatch {
                    name: name.to_string(),
                    provider: registered,
                });
            }
            return Ok(artifact.id());
        }

        let seq = self.meta.next_sequence(HUB_APP_ID, ArtifactKind::DataStore).await?;
        let id = ArtifactId::new(HUB_APP_ID, ArtifactKind::DataStore, seq, Layer::User)?;
        let artifact = Artifact::new(id, name, ArtifactBody::DataStore(DataStoreDef::sql(provider))).committed_copy();
        let mut txn = self.meta.begin().await?;
        txn.insert_artifact(&artifact).await?;
        txn.commit().await?;
        info!("event=data_store_register module=hub status=ok artifact={id} name={name} provider={provider}");
        Ok(id)
    }

    pub async fn status(&self) -> HubResult<HubStatus> {
        let applications = self.meta.load_applications().await?;
        let mut artifact_counts = BTreeMap::new();
        for artifact in self.meta.load_artifacts().await? {
            *artifact_counts.entry(artifact.kind()).or_insert(0) += 1;
        }
        let mut checkouts: Vec<CheckoutInfo> = self.ledger.load_all().await?.into_values().collect();
        checkouts.sort_by_key(|info| info.key);
        Ok(HubStatus {
            applications,
            artifact_counts,
            checkouts,
            stores: self.stores.names(),
        })
    }

    /// Drops every lock and staged edit of `developer`.
    pub async fn release_developer(&self, developer: DeveloperId) -> HubResult<(usize, usize)> {
        let started = Instant::now();
        let released = self.ledger.release_all_for_developer(developer).await?;
        let dropped = self.staged.delete_all(developer).await?;
        info!(
            "event=developer_release module=hub status=ok developer={} released={} staged_dropped={} duration_ms={}",
            developer,
            released,
            dropped,
            started.elapsed().as_millis()
        );
        Ok((released, dropped))
    }
}
