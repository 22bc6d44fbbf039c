//! External SQL store backed by one SQLite database.
//!
//! # Invariants
//! - DDL runs inside `BEGIN IMMEDIATE`; nothing is visible until commit.
//! - A transaction holds the connection until it commits or rolls back.
//! - Dropping an unfinished transaction rolls it back.

use super::ddl;
use super::{ExternalStore, ExternalTxn, StoreError, StoreResult, TableContext};
use crate::db::{open_external_db, open_external_db_in_memory};
use crate::model::artifact::Artifact;
use async_trait::async_trait;
use log::{debug, info, warn};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct SqliteExternalStore {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExternalStore {
    pub fn open(name: &str, path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        Ok(Self::from_connection(name, open_external_db(path, busy_timeout)?))
    }

    pub fn in_memory(name: &str) -> StoreResult<Self> {
        Ok(Self::from_connection(name, open_external_db_in_memory()?))
    }

    pub fn from_connection(name: &str, conn: Connection) -> Self {
        Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// User tables currently present, sorted by name.
    pub async fn table_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC;",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Column names of `table` in declaration order.
    pub async fn column_names(&self, table: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid ASC;")?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

#[async_trait]
impl ExternalStore for SqliteExternalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self) -> StoreResult<Box<dyn ExternalTxn>> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE;")
            .map_err(|err| driver_error(&self.name, "begin", err))?;
        debug!("event=external_txn module=store status=start store={}", self.name);
        Ok(Box::new(SqliteExternalTxn {
            store: self.name.clone(),
            conn: Some(conn),
        }))
    }
}

struct SqliteExternalTxn {
    store: String,
    conn: Option<OwnedMutexGuard<Connection>>,
}

impl SqliteExternalTxn {
    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_deref().ok_or_else(|| StoreError::Driver {
            store: self.store.clone(),
            message: "transaction already finished".to_string(),
        })
    }

    fn run(&self, op: &str, table: &str, statements: &[String]) -> StoreResult<()> {
        let conn = self.conn()?;
        for statement in statements {
            conn.execute_batch(statement)
                .map_err(|err| driver_error(&self.store, op, err))?;
        }
        info!(
            "event=ddl module=store status=ok store={} op={} table={} statements={}",
            self.store,
            op,
            table,
            statements.len()
        );
        Ok(())
    }

    fn finish(&mut self, sql: &str, op: &str) -> StoreResult<()> {
        let conn = self.conn.take().ok_or_else(|| StoreError::Driver {
            store: self.store.clone(),
            message: "transaction already finished".to_string(),
        })?;
        if let Err(err) = conn.execute_batch(sql) {
            // A failed COMMIT can leave the transaction open.
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                    warn!(
                        "event=external_txn module=store status=warn store={} op=finish_rollback error={}",
                        self.store, rollback
                    );
                }
            }
            return Err(driver_error(&self.store, op, err));
        }
        debug!("event=external_txn module=store status={op} store={}", self.store);
        Ok(())
    }
}

#[async_trait]
impl ExternalTxn for SqliteExternalTxn {
    fn store_name(&self) -> &str {
        &self.store
    }

    async fn create_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()> {
        let statements = ddl::create_table_statements(entity, ctx)?;
        self.run("create_table", entity.name(), &statements)
    }

    async fn alter_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()> {
        let statements = ddl::alter_table_statements(entity, ctx)?;
        self.run("alter_table", entity.name(), &statements)
    }

    async fn drop_table(&mut self, entity: &Artifact, ctx: TableContext<'_>) -> StoreResult<()> {
        let statement = ddl::drop_table_statement(entity, ctx)?;
        self.run("drop_table", entity.committed_name(), &[statement])
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut txn = self;
        txn.finish("COMMIT;", "commit")
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let mut txn = self;
        txn.finish("ROLLBACK;", "rollback")
    }
}

impl Drop for SqliteExternalTxn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.execute_batch("ROLLBACK;") {
                warn!(
                    "event=external_txn module=store status=warn store={} op=drop_rollback error={}",
                    self.store, err
                );
            }
        }
    }
}

fn driver_error(store: &str, op: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Driver {
        store: store.to_string(),
        message: format!("{op}: {err}"),
    }
}
