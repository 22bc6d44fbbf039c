//! Storage contracts and their SQLite implementations.
//!
//! # Responsibility
//! - Define the metadata store, ledger, staged-edit and external SQL store
//!   contracts the catalog and the publish coordinator are written against.
//! - Provide SQLite implementations of each contract.
//!
//! # Invariants
//! - Every write that belongs to a publish goes through a transaction object.
//! - A transaction object that is dropped without commit rolls back.
//!
//! # See also
//! - crate::publish for the order in which transactions are finalized.

use crate::checkout::{CheckoutInfo, CheckoutKey};
use crate::db::DbError;
use crate::model::application::Application;
use crate::model::artifact::Artifact;
use crate::model::folder::Folder;
use crate::model::id::{AppId, ArtifactId, ArtifactKind};
use crate::session::DeveloperId;
use crate::staged::StagedEdit;
use crate::wire::WireError;
use async_trait::async_trait;
use thiserror::Error;

pub mod ddl;
pub mod registry;
mod sqlite_external;
mod sqlite_meta;

pub use registry::{ExternalStoreRegistry, RegistryError};
pub use sqlite_external::SqliteExternalStore;
pub use sqlite_meta::SqliteMetaStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("corrupt blob: {0}")]
    Wire(#[from] WireError),
    #[error("artifact {id} changed underneath: expected version {expected}, found {found:?}")]
    VersionConflict {
        id: ArtifactId,
        expected: u32,
        found: Option<u32>,
    },
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error("store `{store}` failed: {message}")]
    Driver { store: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Durable home of applications, folders and committed artifacts.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn MetaTxn>>;

    async fn load_applications(&self) -> StoreResult<Vec<Application>>;

    async fn load_folders(&self) -> StoreResult<Vec<Folder>>;

    /// Committed artifacts, source text included.
    async fn load_artifacts(&self) -> StoreResult<Vec<Artifact>>;

    async fn load_artifact(&self, id: ArtifactId) -> StoreResult<Option<Artifact>>;

    async fn load_compiled_unit(&self, kind: ArtifactKind, name: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Allocates the next artifact sequence for (app, kind). Never returns the
    /// same value twice.
    async fn next_sequence(&self, app: AppId, kind: ArtifactKind) -> StoreResult<u32>;
}

/// One metadata-store transaction.
#[async_trait]
pub trait MetaTxn: Send {
    async fn create_application(&mut self, app: &Application) -> StoreResult<()>;

    async fn insert_artifact(&mut self, artifact: &Artifact) -> StoreResult<()>;

    /// Replaces the row only if it is still at `expected_version`.
    async fn update_artifact(&mut self, artifact: &Artifact, expected_version: u32) -> StoreResult<()>;

    async fn delete_artifact(&mut self, id: ArtifactId) -> StoreResult<()>;

    async fn upsert_folder(&mut self, folder: &Folder) -> StoreResult<()>;

    async fn delete_folder(&mut self, folder: &Folder) -> StoreResult<()>;

    async fn upsert_source_blob(&mut self, id: ArtifactId, bytes: &[u8]) -> StoreResult<()>;

    async fn delete_source_blob(&mut self, id: ArtifactId) -> StoreResult<()>;

    async fn upsert_compiled_unit(&mut self, kind: ArtifactKind, name: &str, bytes: &[u8]) -> StoreResult<()>;

    async fn delete_compiled_unit(&mut self, kind: ArtifactKind, name: &str) -> StoreResult<()>;

    /// Drops every checkout held by `developer`. Returns the count removed.
    async fn release_checkouts(&mut self, developer: DeveloperId) -> StoreResult<usize>;

    /// Drops every staged edit of `developer`. Returns the count removed.
    async fn delete_staged(&mut self, developer: DeveloperId) -> StoreResult<usize>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Persistence behind the checkout ledger.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn load_checkouts(&self) -> StoreResult<Vec<CheckoutInfo>>;

    async fn find_checkout(&self, key: CheckoutKey) -> StoreResult<Option<CheckoutInfo>>;

    /// Inserts `info` unless the key is taken. Returns the row that holds the
    /// key afterwards, which is `info` exactly when the insert won.
    async fn insert_checkout(&self, info: &CheckoutInfo) -> StoreResult<CheckoutInfo>;

    /// Inserts or overwrites the row for the key.
    async fn upsert_checkout(&self, info: &CheckoutInfo) -> StoreResult<()>;

    /// Deletes the row only when `developer` holds it.
    async fn delete_checkout(&self, key: CheckoutKey, developer: DeveloperId) -> StoreResult<bool>;

    async fn delete_checkouts_for(&self, developer: DeveloperId) -> StoreResult<usize>;
}

/// Persistence behind the staged-edit store.
#[async_trait]
pub trait StagedStorage: Send + Sync {
    async fn save_staged(&self, edit: &StagedEdit) -> StoreResult<()>;

    async fn load_staged(&self, developer: DeveloperId, key: CheckoutKey) -> StoreResult<Option<Vec<u8>>>;

    async fn load_all_staged(&self, developer: DeveloperId) -> StoreResult<Vec<StagedEdit>>;

    async fn delete_staged(&self, developer: DeveloperId, key: CheckoutKey) -> StoreResult<bool>;

    async fn delete_all_staged(&self, developer: DeveloperId) -> StoreResult<usize>;
}

/// Naming context for tables derived from entities.
#[derive(Debug, Clone, Copy)]
pub struct TableContext<'a> {
    pub app_name: &'a str,
}

/// An independently administered SQL database holding entity tables.
#[async_trait]
pub trait ExternalStore: Send + Sync {
    fn name(&self) -> &str;

    async fn begin(&self) -> StoreResult<Box<dyn ExternalTxn>>;
}

/// One DDL transaction against an external store.
#[async_trait]
pub trait ExternalTxn: Send {
    fn store_name(&self) -> &str;

    async fn create_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()>;

    /// Brings the table in line with the pending member changes of `entity`.
    async fn alter_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()>;

    async fn drop_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

pub(crate) fn id_to_sql(id: ArtifactId) -> i64 {
    id.raw() as i64
}

pub(crate) fn id_from_sql(raw: i64) -> StoreResult<ArtifactId> {
    ArtifactId::from_raw(raw as u64)
        .map_err(|err| StoreError::InvalidData(format!("artifact id {raw}: {err}")))
}
