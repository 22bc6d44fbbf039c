//! Metadata-store schema steps.
//!
//! # Responsibility
//! - List the catalog schema steps, each with a version and a short name.
//! - Bring a metadata database up to the newest step inside one transaction.
//!
//! # Invariants
//! - Step versions start at 1 and increase by exactly one.
//! - The applied version lives in `PRAGMA user_version`.
//! - A database newer than this binary is rejected, never downgraded.
//! - Only metadata databases are migrated; external stores own no catalog
//!   tables.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "design_catalog",
        sql: include_str!("0001_design_catalog.sql"),
    },
    SchemaStep {
        version: 2,
        name: "publish_state",
        sql: include_str!("0002_publish_state.sql"),
    },
];

/// Schema version written by the newest step this binary knows.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// What [`apply_migrations`] did to one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaUpgrade {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<&'static str>,
}

impl SchemaUpgrade {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies every step newer than the database's version.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<SchemaUpgrade> {
    let from = schema_version(conn)?;
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }

    let pending: Vec<&SchemaStep> = SCHEMA_STEPS.iter().filter(|step| step.version > from).collect();
    if pending.is_empty() {
        return Ok(SchemaUpgrade {
            from,
            to: from,
            applied: Vec::new(),
        });
    }

    let tx = conn.transaction()?;
    for step in &pending {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        debug!(
            "event=schema_step module=db status=ok version={} step={}",
            step.version, step.name
        );
    }
    tx.commit()?;

    let upgrade = SchemaUpgrade {
        from,
        to: latest,
        applied: pending.iter().map(|step| step.name).collect(),
    };
    info!(
        "event=schema_upgrade module=db status=ok from={} to={} steps={}",
        upgrade.from,
        upgrade.to,
        upgrade.applied.join(",")
    );
    Ok(upgrade)
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered_without_gaps() {
        for (index, step) in SCHEMA_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, index + 1, "step {}", step.name);
        }
    }

    #[test]
    fn fresh_database_runs_every_step_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        let upgrade = apply_migrations(&mut conn).unwrap();
        assert_eq!(upgrade.from, 0);
        assert_eq!(upgrade.to, latest_version());
        assert_eq!(upgrade.applied, vec!["design_catalog", "publish_state"]);

        let again = apply_migrations(&mut conn).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.to, latest_version());
    }

    #[test]
    fn partially_upgraded_database_runs_only_newer_steps() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_STEPS[0].sql).unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();

        let upgrade = apply_migrations(&mut conn).unwrap();
        assert_eq!(upgrade.from, 1);
        assert_eq!(upgrade.applied, vec!["publish_state"]);
    }
}
