#![allow(dead_code)]

use async_trait::async_trait;
use designhub_core::compile::{CompileOutcome, CompileRequest, Compiler, Diagnostic, ExecutableUnit};
use designhub_core::cluster::{CacheInvalidator, InvalidationError};
use designhub_core::model::application::Application;
use designhub_core::model::artifact::{Artifact, ArtifactBody, ServiceDef};
use designhub_core::model::entity::{DataField, EntityDef, FieldType};
use designhub_core::model::folder::Folder;
use designhub_core::model::id::{AppId, ArtifactId, ArtifactKind};
use designhub_core::store::{
    ExternalStore, ExternalStoreRegistry, ExternalTxn, MetaStore, MetaTxn, SqliteExternalStore, SqliteMetaStore,
    StoreError, StoreResult, TableContext,
};
use designhub_core::{
    CheckoutLedger, DesignCatalog, DesignHub, DeveloperId, DeveloperSession, HubParts, PublishCoordinator,
    StagedEditStore,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static CAPTURED_LOGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static INSTALL_CAPTURE: Once = Once::new();

/// Records info-and-above log lines of the whole test binary.
struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            CAPTURED_LOGS.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

/// Installs the capturing logger once per test binary.
pub fn capture_logs() {
    INSTALL_CAPTURE.call_once(|| {
        if log::set_logger(&CaptureLogger).is_ok() {
            log::set_max_level(log::LevelFilter::Info);
        }
    });
}

/// Captured lines containing every fragment in `parts`. Tests share the
/// logger, so callers match on values unique to their own run.
pub fn logged_lines(parts: &[&str]) -> Vec<String> {
    CAPTURED_LOGS
        .lock()
        .unwrap()
        .iter()
        .filter(|line| parts.iter().all(|part| line.contains(part)))
        .cloned()
        .collect()
}

/// Compiler double: fails the units named in `fail_on`, records every request.
#[derive(Clone, Default)]
pub struct ScriptedCompiler {
    inner: Arc<Mutex<CompilerInner>>,
}

#[derive(Default)]
struct CompilerInner {
    fail_on: HashSet<String>,
    requests: Vec<CompileRequest>,
}

impl ScriptedCompiler {
    pub fn fail_on(&self, unit_name: &str) {
        self.inner.lock().unwrap().fail_on.insert(unit_name.to_string());
    }

    pub fn requests(&self) -> Vec<CompileRequest> {
        self.inner.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl Compiler for ScriptedCompiler {
    async fn compile(&self, request: &CompileRequest) -> CompileOutcome {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(request.clone());
        if inner.fail_on.contains(&request.unit_name) {
            return Err(vec![Diagnostic {
                line: 1,
                column: 1,
                message: format!("cannot compile {}", request.unit_name),
            }]);
        }
        Ok(ExecutableUnit {
            bytes: format!("unit:{}", request.unit_name).into_bytes(),
        })
    }
}

/// Invalidator double: records calls, optionally failing or stalling.
#[derive(Clone, Default)]
pub struct RecordingInvalidator {
    inner: Arc<Mutex<InvalidatorInner>>,
}

#[derive(Default)]
struct InvalidatorInner {
    fail: bool,
    delay: Option<Duration>,
    calls: Vec<(Vec<String>, bool)>,
}

impl RecordingInvalidator {
    pub fn set_fail(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<(Vec<String>, bool)> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate_artifacts(&self, names: &[String], also_non_executable: bool) -> Result<(), InvalidationError> {
        let (fail, delay) = {
            let inner = self.inner.lock().unwrap();
            (inner.fail, inner.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .lock()
            .unwrap()
            .calls
            .push((names.to_vec(), also_non_executable));
        if fail {
            return Err(InvalidationError::Unreachable("node-2".to_string()));
        }
        Ok(())
    }
}

/// External SQLite store whose COMMIT can be made to fail.
pub struct FlakyExternalStore {
    inner: SqliteExternalStore,
    fail_commit: AtomicBool,
}

impl FlakyExternalStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: SqliteExternalStore::in_memory(name).unwrap(),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.inner.table_names().await.unwrap()
    }

    pub async fn column_names(&self, table: &str) -> Vec<String> {
        self.inner.column_names(table).await.unwrap()
    }
}

#[async_trait]
impl ExternalStore for FlakyExternalStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn begin(&self) -> StoreResult<Box<dyn ExternalTxn>> {
        Ok(Box::new(FlakyExternalTxn {
            inner: self.inner.begin().await?,
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
        }))
    }
}

struct FlakyExternalTxn {
    inner: Box<dyn ExternalTxn>,
    fail_commit: bool,
}

#[async_trait]
impl ExternalTxn for FlakyExternalTxn {
    fn store_name(&self) -> &str {
        self.inner.store_name()
    }

    async fn create_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()> {
        self.inner.create_table(entity, ctx).await
    }

    async fn alter_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()> {
        self.inner.alter_table(entity, ctx).await
    }

    async fn drop_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()> {
        self.inner.drop_table(entity, ctx).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.fail_commit {
            let store = self.inner.store_name().to_string();
            self.inner.rollback().await?;
            return Err(StoreError::Driver {
                store,
                message: "commit: disk I/O error".to_string(),
            });
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

/// Metadata store whose transaction COMMIT can be made to fail.
pub struct FlakyMetaStore {
    inner: SqliteMetaStore,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl MetaStore for FlakyMetaStore {
    async fn begin(&self) -> StoreResult<Box<dyn MetaTxn>> {
        Ok(Box::new(FlakyMetaTxn {
            inner: self.inner.begin().await?,
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
        }))
    }

    async fn load_applications(&self) -> StoreResult<Vec<Application>> {
        self.inner.load_applications().await
    }

    async fn load_folders(&self) -> StoreResult<Vec<Folder>> {
        self.inner.load_folders().await
    }

    async fn load_artifacts(&self) -> StoreResult<Vec<Artifact>> {
        self.inner.load_artifacts().await
    }

    async fn load_artifact(&self, id: ArtifactId) -> StoreResult<Option<Artifact>> {
        self.inner.load_artifact(id).await
    }

    async fn load_compiled_unit(&self, kind: ArtifactKind, name: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.load_compiled_unit(kind, name).await
    }

    async fn next_sequence(&self, app: AppId, kind: ArtifactKind) -> StoreResult<u32> {
        self.inner.next_sequence(app, kind).await
    }
}

struct FlakyMetaTxn {
    inner: Box<dyn MetaTxn>,
    fail_commit: bool,
}

#[async_trait]
impl MetaTxn for FlakyMetaTxn {
    async fn create_application(&mut self, app: &Application) -> StoreResult<()> {
        self.inner.create_application(app).await
    }

    async fn insert_artifact(&mut self, artifact: &Artifact) -> StoreResult<()> {
        self.inner.insert_artifact(artifact).await
    }

    async fn update_artifact(&mut self, artifact: &Artifact, expected_version: u32) -> StoreResult<()> {
        self.inner.update_artifact(artifact, expected_version).await
    }

    async fn delete_artifact(&mut self, id: ArtifactId) -> StoreResult<()> {
        self.inner.delete_artifact(id).await
    }

    async fn upsert_folder(&mut self, folder: &Folder) -> StoreResult<()> {
        self.inner.upsert_folder(folder).await
    }

    async fn delete_folder(&mut self, folder: &Folder) -> StoreResult<()> {
        self.inner.delete_folder(folder).await
    }

    async fn upsert_source_blob(&mut self, id: ArtifactId, bytes: &[u8]) -> StoreResult<()> {
        self.inner.upsert_source_blob(id, bytes).await
    }

    async fn delete_source_blob(&mut self, id: ArtifactId) -> StoreResult<()> {
        self.inner.delete_source_blob(id).await
    }

    async fn upsert_compiled_unit(&mut self, kind: ArtifactKind, name: &str, bytes: &[u8]) -> StoreResult<()> {
        self.inner.upsert_compiled_unit(kind, name, bytes).await
    }

    async fn delete_compiled_unit(&mut self, kind: ArtifactKind, name: &str) -> StoreResult<()> {
        self.inner.delete_compiled_unit(kind, name).await
    }

    async fn release_checkouts(&mut self, developer: DeveloperId) -> StoreResult<usize> {
        self.inner.release_checkouts(developer).await
    }

    async fn delete_staged(&mut self, developer: DeveloperId) -> StoreResult<usize> {
        self.inner.delete_staged(developer).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.fail_commit {
            self.inner.rollback().await?;
            return Err(StoreError::Driver {
                store: "metadata".to_string(),
                message: "commit: database is locked".to_string(),
            });
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

/// A hub over in-memory SQLite with one application and one data store per
/// external store name.
pub struct Harness {
    pub hub: DesignHub,
    pub meta: SqliteMetaStore,
    pub app: Application,
    pub stores: BTreeMap<String, Arc<FlakyExternalStore>>,
    pub data_stores: BTreeMap<String, ArtifactId>,
    pub compiler: ScriptedCompiler,
    pub invalidator: RecordingInvalidator,
    meta_fail_commit: Arc<AtomicBool>,
}

impl Harness {
    pub async fn new(store_names: &[&str]) -> Self {
        let meta = SqliteMetaStore::in_memory().unwrap();
        let meta_fail_commit = Arc::new(AtomicBool::new(false));
        let mut registry = ExternalStoreRegistry::new();
        let mut stores = BTreeMap::new();
        for name in store_names {
            let store = Arc::new(FlakyExternalStore::new(name));
            registry.register(store.clone()).unwrap();
            stores.insert(name.to_string(), store);
        }
        let hub = DesignHub::new(HubParts {
            meta: Arc::new(FlakyMetaStore {
                inner: meta.clone(),
                fail_commit: meta_fail_commit.clone(),
            }),
            ledger: CheckoutLedger::new(Arc::new(meta.clone())),
            staged: StagedEditStore::new(Arc::new(meta.clone())),
            stores: registry,
            invalidation_timeout: Duration::from_millis(200),
        });

        let app = hub.create_application("sales", "ops").await.unwrap();
        let mut data_stores = BTreeMap::new();
        for name in store_names {
            let id = hub.register_data_store(name, "sqlite").await.unwrap();
            data_stores.insert(name.to_string(), id);
        }
        Self {
            hub,
            meta,
            app,
            stores,
            data_stores,
            compiler: ScriptedCompiler::default(),
            invalidator: RecordingInvalidator::default(),
            meta_fail_commit,
        }
    }

    pub fn store(&self, name: &str) -> &FlakyExternalStore {
        &self.stores[name]
    }

    pub fn data_store(&self, name: &str) -> ArtifactId {
        self.data_stores[name]
    }

    pub fn fail_metadata_commit(&self, fail: bool) {
        self.meta_fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn publisher(&self) -> PublishCoordinator {
        self.hub
            .publisher(Arc::new(self.compiler.clone()), Arc::new(self.invalidator.clone()))
    }

    /// A loaded catalog for a new developer called `name`.
    pub async fn session(&self, name: &str) -> DesignCatalog {
        let catalog = self
            .hub
            .open_session(DeveloperSession::new(DeveloperId::random(), name));
        catalog.load().await.unwrap();
        catalog
    }

    /// `(version, name)` of the committed row, if any.
    pub async fn committed_row(&self, id: ArtifactId) -> Option<(u32, String)> {
        self.meta
            .with_connection(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT version, name FROM artifacts WHERE artifact_id = ?1;",
                    [id.raw() as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })
            .await
            .unwrap()
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {table};");
        self.meta
            .with_connection(|conn| conn.query_row(&sql, [], |row| row.get(0)))
            .await
            .unwrap()
    }
}

/// Entity bound to `store` with an integer primary key `Id` and a text `Code`.
pub fn keyed_entity(store: ArtifactId) -> ArtifactBody {
    let mut entity = EntityDef::bound_to(store);
    let id = entity
        .add_data_field("Id", DataField::new(FieldType::Int))
        .unwrap();
    entity
        .add_data_field("Code", DataField::new(FieldType::String).nullable())
        .unwrap();
    entity.set_primary_keys(vec![id]).unwrap();
    ArtifactBody::Entity(entity)
}

pub fn service(source: &str, references: Vec<ArtifactId>) -> ArtifactBody {
    ArtifactBody::Service(ServiceDef {
        source: source.to_string(),
        references,
    })
}
