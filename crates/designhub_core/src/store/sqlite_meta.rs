//! SQLite implementation of the metadata store, ledger and staged storage.
//!
//! # Responsibility
//! - Persist applications, folders, artifacts, source text and compiled units.
//! - Persist checkout rows and staged-edit rows in the same database so that
//!   publish can check in inside its metadata transaction.
//!
//! # Invariants
//! - Artifact rows carry the `BlobScope::Metadata` encoding; source text lives
//!   in `source_blobs`.
//! - Loaded artifacts are always `Unchanged` with no pending rename.
//! - `update_artifact` only matches the row at the expected version.

use super::{
    id_from_sql, id_to_sql, LedgerStorage, MetaStore, MetaTxn, StagedStorage, StoreError,
    StoreResult,
};
use crate::checkout::{CheckoutInfo, CheckoutKey};
use crate::db::{open_db_in_memory, open_db_with_timeout};
use crate::model::application::Application;
use crate::model::artifact::{Artifact, ArtifactBody};
use crate::model::folder::Folder;
use crate::model::id::{AppId, ArtifactId, ArtifactKind};
use crate::model::state::PersistentState;
use crate::session::DeveloperId;
use crate::staged::StagedEdit;
use crate::wire::{decode_artifact, encode_artifact, BlobScope};
use async_trait::async_trait;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Metadata database handle shared by every service of one hub process.
#[derive(Clone)]
pub struct SqliteMetaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetaStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        Ok(Self::from_connection(open_db_with_timeout(path, busy_timeout)?))
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps an already migrated connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `f` against the raw connection. Intended for inspection.
    pub async fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let conn = self.conn.lock().await;
        Ok(f(&conn)?)
    }
}

fn kind_to_sql(kind: ArtifactKind) -> i64 {
    i64::from(kind.code())
}

fn kind_from_sql(code: i64) -> StoreResult<ArtifactKind> {
    u8::try_from(code)
        .ok()
        .and_then(|code| ArtifactKind::from_code(code).ok())
        .ok_or_else(|| StoreError::InvalidData(format!("artifact kind code {code}")))
}

fn uuid_from_sql(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| StoreError::InvalidData(format!("uuid `{value}`: {err}")))
}

fn developer_from_sql(value: &str) -> StoreResult<DeveloperId> {
    uuid_from_sql(value).map(DeveloperId::new)
}

/// Decodes an artifact row and attaches its source text.
fn artifact_from_parts(data: &[u8], version: u32, source: Option<Vec<u8>>) -> StoreResult<Artifact> {
    let mut artifact = decode_artifact(data)?;
    artifact.header.state = PersistentState::Unchanged;
    artifact.header.original_name = None;
    artifact.header.version = version;
    if let Some(source) = source {
        let text = String::from_utf8(source).map_err(|_| {
            StoreError::InvalidData(format!("source of {} is not utf-8", artifact.id()))
        })?;
        match &mut artifact.body {
            ArtifactBody::Service(service) => service.source = text,
            ArtifactBody::View(view) => view.source = text,
            ArtifactBody::Entity(_) | ArtifactBody::DataStore(_) => {
                warn!(
                    "event=catalog_read module=store status=warn artifact={} reason=unexpected_source",
                    artifact.id()
                );
            }
        }
    }
    Ok(artifact)
}

type RawArtifact = (Vec<u8>, u32, Option<Vec<u8>>);

fn raw_artifact(row: &Row<'_>) -> rusqlite::Result<RawArtifact> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

const ARTIFACT_SELECT: &str = "SELECT a.data, a.version, s.data
     FROM artifacts a
     LEFT JOIN source_blobs s ON s.artifact_id = a.artifact_id";

type RawFolder = (String, i64, i64, Option<String>, String, i32, u32);

fn raw_folder(row: &Row<'_>) -> rusqlite::Result<RawFolder> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn folder_from_raw(raw: RawFolder) -> StoreResult<Folder> {
    let (id, app_id, target_kind, parent, name, sort_order, version) = raw;
    Ok(Folder {
        id: uuid_from_sql(&id)?,
        app_id: AppId::try_from(app_id)
            .map_err(|_| StoreError::InvalidData(format!("app id {app_id}")))?,
        target_kind: kind_from_sql(target_kind)?,
        parent: parent.as_deref().map(uuid_from_sql).transpose()?,
        name,
        sort_order,
        version,
        state: PersistentState::Unchanged,
    })
}

type RawCheckout = (i64, i64, String, String, u32);

fn raw_checkout(row: &Row<'_>) -> rusqlite::Result<RawCheckout> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn checkout_from_raw(raw: RawCheckout) -> StoreResult<CheckoutInfo> {
    let (kind, id, developer, developer_name, version) = raw;
    Ok(CheckoutInfo {
        key: CheckoutKey {
            kind: kind_from_sql(kind)?,
            id: id_from_sql(id)?,
        },
        developer: developer_from_sql(&developer)?,
        developer_name,
        version,
    })
}

const CHECKOUT_SELECT: &str =
    "SELECT kind, artifact_id, developer_id, developer_name, version FROM checkouts";

fn find_checkout_row(conn: &Connection, key: CheckoutKey) -> StoreResult<Option<CheckoutInfo>> {
    conn.query_row(
        &format!("{CHECKOUT_SELECT} WHERE kind = ?1 AND artifact_id = ?2;"),
        params![kind_to_sql(key.kind), id_to_sql(key.id)],
        raw_checkout,
    )
    .optional()?
    .map(checkout_from_raw)
    .transpose()
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn begin(&self) -> StoreResult<Box<dyn MetaTxn>> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        debug!("event=meta_txn module=store status=start");
        Ok(Box::new(SqliteMetaTxn { conn: Some(conn) }))
    }

    async fn load_applications(&self) -> StoreResult<Vec<Application>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT app_id, name, owner FROM applications ORDER BY name ASC;")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Application {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    owner: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn load_folders(&self) -> StoreResult<Vec<Folder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT folder_id, app_id, target_kind, parent_id, name, sort_order, version
             FROM folders
             ORDER BY app_id ASC, target_kind ASC, sort_order ASC, folder_id ASC;",
        )?;
        let raws = stmt
            .query_map([], raw_folder)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(folder_from_raw).collect()
    }

    async fn load_artifacts(&self) -> StoreResult<Vec<Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{ARTIFACT_SELECT} ORDER BY a.artifact_id ASC;"))?;
        let raws = stmt
            .query_map([], raw_artifact)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter()
            .map(|(data, version, source)| artifact_from_parts(&data, version, source))
            .collect()
    }

    async fn load_artifact(&self, id: ArtifactId) -> StoreResult<Option<Artifact>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("{ARTIFACT_SELECT} WHERE a.artifact_id = ?1;"),
                [id_to_sql(id)],
                raw_artifact,
            )
            .optional()?;
        raw.map(|(data, version, source)| artifact_from_parts(&data, version, source))
            .transpose()
    }

    async fn load_compiled_unit(&self, kind: ArtifactKind, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let data = conn
            .query_row(
                "SELECT data FROM compiled_units WHERE kind = ?1 AND name = ?2;",
                params![kind_to_sql(kind), name],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }

    async fn next_sequence(&self, app: AppId, kind: ArtifactKind) -> StoreResult<u32> {
        let conn = self.conn.lock().await;
        let seq: u32 = conn.query_row(
            "INSERT INTO id_sequences (app_id, kind, next_seq) VALUES (?1, ?2, 1)
             ON CONFLICT(app_id, kind) DO UPDATE SET next_seq = next_seq + 1
             RETURNING next_seq;",
            params![app, kind_to_sql(kind)],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

struct SqliteMetaTxn {
    conn: Option<OwnedMutexGuard<Connection>>,
}

impl SqliteMetaTxn {
    fn conn(&self) -> StoreResult<&Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| StoreError::InvalidData("metadata transaction already finished".to_string()))
    }

    fn finish(&mut self, sql: &str) -> StoreResult<()> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| StoreError::InvalidData("metadata transaction already finished".to_string()))?;
        if let Err(err) = conn.execute_batch(sql) {
            // A failed COMMIT can leave the transaction open.
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                    warn!("event=meta_txn module=store status=warn op=finish_rollback error={rollback}");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MetaTxn for SqliteMetaTxn {
    async fn create_application(&mut self, app: &Application) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO applications (app_id, name, owner) VALUES (?1, ?2, ?3);",
            params![app.id, app.name, app.owner],
        )?;
        Ok(())
    }

    async fn insert_artifact(&mut self, artifact: &Artifact) -> StoreResult<()> {
        let data = encode_artifact(artifact, BlobScope::Metadata)?;
        self.conn()?.execute(
            "INSERT INTO artifacts (artifact_id, app_id, kind, name, folder_id, version, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                id_to_sql(artifact.id()),
                artifact.id().app_id(),
                kind_to_sql(artifact.kind()),
                artifact.name(),
                artifact.header.folder.map(|folder| folder.to_string()),
                artifact.version(),
                data,
            ],
        )?;
        Ok(())
    }

    async fn update_artifact(&mut self, artifact: &Artifact, expected_version: u32) -> StoreResult<()> {
        let data = encode_artifact(artifact, BlobScope::Metadata)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE artifacts
             SET name = ?2, folder_id = ?3, version = ?4, data = ?5
             WHERE artifact_id = ?1 AND version = ?6;",
            params![
                id_to_sql(artifact.id()),
                artifact.name(),
                artifact.header.folder.map(|folder| folder.to_string()),
                artifact.version(),
                data,
                expected_version,
            ],
        )?;
        if changed == 0 {
            let found = conn
                .query_row(
                    "SELECT version FROM artifacts WHERE artifact_id = ?1;",
                    [id_to_sql(artifact.id())],
                    |row| row.get::<_, u32>(0),
                )
                .optional()?;
            return Err(StoreError::VersionConflict {
                id: artifact.id(),
                expected: expected_version,
                found,
            });
        }
        Ok(())
    }

    async fn delete_artifact(&mut self, id: ArtifactId) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM artifacts WHERE artifact_id = ?1;", [id_to_sql(id)])?;
        Ok(())
    }

    async fn upsert_folder(&mut self, folder: &Folder) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO folders (folder_id, app_id, target_kind, parent_id, name, sort_order, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(folder_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                sort_order = excluded.sort_order,
                version = excluded.version;",
            params![
                folder.id.to_string(),
                folder.app_id,
                kind_to_sql(folder.target_kind),
                folder.parent.map(|parent| parent.to_string()),
                folder.name,
                folder.sort_order,
                folder.version,
            ],
        )?;
        Ok(())
    }

    async fn delete_folder(&mut self, folder: &Folder) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM folders WHERE folder_id = ?1;", [folder.id.to_string()])?;
        Ok(())
    }

    async fn upsert_source_blob(&mut self, id: ArtifactId, bytes: &[u8]) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO source_blobs (artifact_id, data) VALUES (?1, ?2)
             ON CONFLICT(artifact_id) DO UPDATE SET data = excluded.data;",
            params![id_to_sql(id), bytes],
        )?;
        Ok(())
    }

    async fn delete_source_blob(&mut self, id: ArtifactId) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM source_blobs WHERE artifact_id = ?1;", [id_to_sql(id)])?;
        Ok(())
    }

    async fn upsert_compiled_unit(&mut self, kind: ArtifactKind, name: &str, bytes: &[u8]) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO compiled_units (kind, name, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind, name) DO UPDATE SET data = excluded.data;",
            params![kind_to_sql(kind), name, bytes],
        )?;
        Ok(())
    }

    async fn delete_compiled_unit(&mut self, kind: ArtifactKind, name: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "DELETE FROM compiled_units WHERE kind = ?1 AND name = ?2;",
            params![kind_to_sql(kind), name],
        )?;
        Ok(())
    }

    async fn release_checkouts(&mut self, developer: DeveloperId) -> StoreResult<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM checkouts WHERE developer_id = ?1;",
            [developer.to_string()],
        )?;
        Ok(removed)
    }

    async fn delete_staged(&mut self, developer: DeveloperId) -> StoreResult<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM staged_edits WHERE developer_id = ?1;",
            [developer.to_string()],
        )?;
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut txn = self;
        txn.finish("COMMIT;")?;
        debug!("event=meta_txn module=store status=commit");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let mut txn = self;
        txn.finish("ROLLBACK;")?;
        debug!("event=meta_txn module=store status=rollback");
        Ok(())
    }
}

impl Drop for SqliteMetaTxn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.execute_batch("ROLLBACK;") {
                warn!("event=meta_txn module=store status=warn op=drop_rollback error={err}");
            }
        }
    }
}

#[async_trait]
impl LedgerStorage for SqliteMetaStore {
    async fn load_checkouts(&self) -> StoreResult<Vec<CheckoutInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{CHECKOUT_SELECT} ORDER BY kind ASC, artifact_id ASC;"))?;
        let raws = stmt
            .query_map([], raw_checkout)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(checkout_from_raw).collect()
    }

    async fn find_checkout(&self, key: CheckoutKey) -> StoreResult<Option<CheckoutInfo>> {
        let conn = self.conn.lock().await;
        find_checkout_row(&conn, key)
    }

    async fn insert_checkout(&self, info: &CheckoutInfo) -> StoreResult<CheckoutInfo> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO checkouts (kind, artifact_id, developer_id, developer_name, version)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, artifact_id) DO NOTHING;",
            params![
                kind_to_sql(info.key.kind),
                id_to_sql(info.key.id),
                info.developer.to_string(),
                info.developer_name,
                info.version,
            ],
        )?;
        find_checkout_row(&conn, info.key)?.ok_or_else(|| {
            StoreError::InvalidData(format!("checkout {} vanished after insert", info.key))
        })
    }

    async fn upsert_checkout(&self, info: &CheckoutInfo) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO checkouts (kind, artifact_id, developer_id, developer_name, version)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, artifact_id) DO UPDATE SET
                developer_id = excluded.developer_id,
                developer_name = excluded.developer_name,
                version = excluded.version;",
            params![
                kind_to_sql(info.key.kind),
                id_to_sql(info.key.id),
                info.developer.to_string(),
                info.developer_name,
                info.version,
            ],
        )?;
        Ok(())
    }

    async fn delete_checkout(&self, key: CheckoutKey, developer: DeveloperId) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM checkouts WHERE kind = ?1 AND artifact_id = ?2 AND developer_id = ?3;",
            params![kind_to_sql(key.kind), id_to_sql(key.id), developer.to_string()],
        )?;
        Ok(removed > 0)
    }

    async fn delete_checkouts_for(&self, developer: DeveloperId) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM checkouts WHERE developer_id = ?1;",
            [developer.to_string()],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl StagedStorage for SqliteMetaStore {
    async fn save_staged(&self, edit: &StagedEdit) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO staged_edits (developer_id, kind, artifact_id, data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(developer_id, kind, artifact_id) DO UPDATE SET data = excluded.data;",
            params![
                edit.developer.to_string(),
                kind_to_sql(edit.key.kind),
                id_to_sql(edit.key.id),
                edit.blob,
            ],
        )?;
        Ok(())
    }

    async fn load_staged(&self, developer: DeveloperId, key: CheckoutKey) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let blob = conn
            .query_row(
                "SELECT data FROM staged_edits
                 WHERE developer_id = ?1 AND kind = ?2 AND artifact_id = ?3;",
                params![developer.to_string(), kind_to_sql(key.kind), id_to_sql(key.id)],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    async fn load_all_staged(&self, developer: DeveloperId) -> StoreResult<Vec<StagedEdit>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT kind, artifact_id, data FROM staged_edits
             WHERE developer_id = ?1
             ORDER BY kind ASC, artifact_id ASC;",
        )?;
        let raws = stmt
            .query_map([developer.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter()
            .map(|(kind, id, blob)| {
                Ok(StagedEdit {
                    developer,
                    key: CheckoutKey {
                        kind: kind_from_sql(kind)?,
                        id: id_from_sql(id)?,
                    },
                    blob,
                })
            })
            .collect()
    }

    async fn delete_staged(&self, developer: DeveloperId, key: CheckoutKey) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM staged_edits WHERE developer_id = ?1 AND kind = ?2 AND artifact_id = ?3;",
            params![developer.to_string(), kind_to_sql(key.kind), id_to_sql(key.id)],
        )?;
        Ok(removed > 0)
    }

    async fn delete_all_staged(&self, developer: DeveloperId) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM staged_edits WHERE developer_id = ?1;",
            [developer.to_string()],
        )?;
        Ok(removed)
    }
}
