//! DDL derived from bound entity definitions (SQLite dialect).
//!
//! # Invariants
//! - Table name is `"<app>.<Entity>"`; identifiers are always double-quoted.
//! - Committed tables are addressed by the committed (original) name.
//! - [`sql_shape_changed`] is true exactly when [`alter_table_statements`]
//!   would produce at least one statement.

use super::{StoreError, StoreResult, TableContext};
use crate::model::artifact::Artifact;
use crate::model::entity::{DataField, EntityDef, EntityMember, FieldType};
use crate::model::state::PersistentState;

/// Double-quotes an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_name(app_name: &str, entity_name: &str) -> String {
    quote_ident(&format!("{app_name}.{entity_name}"))
}

pub fn column_type(field: &DataField) -> String {
    match (field.field_type, field.length) {
        (FieldType::String, Some(length)) => format!("VARCHAR({length})"),
        (FieldType::String, None) => "TEXT".to_string(),
        (FieldType::Bool, _) => "BOOLEAN".to_string(),
        (FieldType::Byte, _) => "TINYINT".to_string(),
        (FieldType::Short, _) => "SMALLINT".to_string(),
        (FieldType::Int, _) => "INTEGER".to_string(),
        (FieldType::Long, _) => "BIGINT".to_string(),
        (FieldType::Float, _) => "REAL".to_string(),
        (FieldType::Double, _) => "DOUBLE".to_string(),
        (FieldType::Decimal, _) => "DECIMAL".to_string(),
        (FieldType::DateTime, _) => "DATETIME".to_string(),
        (FieldType::Guid, _) => "UUID".to_string(),
        (FieldType::Binary, _) => "BLOB".to_string(),
    }
}

fn column_def(name: &str, field: &DataField) -> String {
    let mut def = format!("{} {}", quote_ident(name), column_type(field));
    if !field.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

/// Default for NOT NULL columns added to a table that may hold rows.
fn fill_default(field: &DataField) -> &'static str {
    match field.field_type {
        FieldType::String | FieldType::DateTime | FieldType::Guid => "''",
        FieldType::Binary => "X''",
        FieldType::Bool
        | FieldType::Byte
        | FieldType::Short
        | FieldType::Int
        | FieldType::Long
        | FieldType::Float
        | FieldType::Double
        | FieldType::Decimal => "0",
    }
}

fn bound_entity(artifact: &Artifact) -> StoreResult<&EntityDef> {
    let entity = artifact.as_entity().ok_or_else(|| {
        StoreError::InvalidData(format!("artifact {} is not an entity", artifact.id()))
    })?;
    if entity.sql().is_none() {
        return Err(StoreError::InvalidData(format!(
            "entity `{}` is not bound to a data store",
            artifact.name()
        )));
    }
    Ok(entity)
}

pub fn create_table_statements(artifact: &Artifact, ctx: TableContext<'_>) -> StoreResult<Vec<String>> {
    let entity = bound_entity(artifact)?;
    let table = table_name(ctx.app_name, artifact.name());
    let columns: Vec<String> = entity
        .members()
        .filter_map(|member| member.as_data_field().map(|field| column_def(&member.name, field)))
        .collect();
    if columns.is_empty() {
        return Err(StoreError::InvalidData(format!(
            "entity `{}` has no data fields",
            artifact.name()
        )));
    }

    let member_names = |ids: &[crate::model::id::MemberId]| -> StoreResult<Vec<String>> {
        ids.iter()
            .map(|id| {
                entity
                    .member(*id)
                    .map(|member| quote_ident(&member.name))
                    .ok_or_else(|| StoreError::InvalidData(format!("unknown member {id}")))
            })
            .collect()
    };

    let mut body = columns.join(", ");
    let mut statements = Vec::new();
    if let Some(sql) = entity.sql() {
        if !sql.primary_keys.is_empty() {
            body.push_str(&format!(
                ", PRIMARY KEY ({})",
                member_names(&sql.primary_keys)?.join(", ")
            ));
        }
        statements.push(format!("CREATE TABLE {table} ({body})"));
        for index in &sql.indexes {
            statements.push(format!(
                "CREATE {}INDEX {} ON {table} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote_ident(&format!("{}.{}.{}", ctx.app_name, artifact.name(), index.name)),
                member_names(&index.fields)?.join(", ")
            ));
        }
    }
    Ok(statements)
}

enum AlterStep<'a> {
    RenameTable,
    AddColumn(&'a EntityMember, &'a DataField),
    RenameColumn(&'a EntityMember),
    DropColumn(&'a EntityMember),
}

fn alter_plan<'a>(entity: &'a EntityDef, artifact: &Artifact) -> Vec<AlterStep<'a>> {
    let mut steps = Vec::new();
    if artifact.is_renamed() {
        steps.push(AlterStep::RenameTable);
    }
    for member in entity.all_members() {
        let Some(field) = member.as_data_field() else {
            continue;
        };
        match member.state {
            PersistentState::Detached => steps.push(AlterStep::AddColumn(member, field)),
            PersistentState::Deleted => steps.push(AlterStep::DropColumn(member)),
            PersistentState::Modified if member.is_renamed() => {
                steps.push(AlterStep::RenameColumn(member))
            }
            PersistentState::Modified | PersistentState::Unchanged => {}
        }
    }
    steps
}

/// Returns whether publishing `artifact` needs DDL on its table.
pub fn sql_shape_changed(artifact: &Artifact) -> bool {
    match artifact.as_entity() {
        Some(entity) if entity.sql().is_some() => !alter_plan(entity, artifact).is_empty(),
        _ => false,
    }
}

pub fn alter_table_statements(artifact: &Artifact, ctx: TableContext<'_>) -> StoreResult<Vec<String>> {
    let entity = bound_entity(artifact)?;
    let table = table_name(ctx.app_name, artifact.name());
    let mut statements = Vec::new();
    for step in alter_plan(entity, artifact) {
        statements.push(match step {
            AlterStep::RenameTable => format!(
                "ALTER TABLE {} RENAME TO {table}",
                table_name(ctx.app_name, artifact.committed_name())
            ),
            AlterStep::AddColumn(member, field) => {
                let mut def = column_def(&member.name, field);
                if !field.nullable {
                    def.push_str(&format!(" DEFAULT {}", fill_default(field)));
                }
                format!("ALTER TABLE {table} ADD COLUMN {def}")
            }
            AlterStep::RenameColumn(member) => format!(
                "ALTER TABLE {table} RENAME COLUMN {} TO {}",
                quote_ident(member.original_name.as_deref().unwrap_or(&member.name)),
                quote_ident(&member.name)
            ),
            AlterStep::DropColumn(member) => format!(
                "ALTER TABLE {table} DROP COLUMN {}",
                quote_ident(member.original_name.as_deref().unwrap_or(&member.name))
            ),
        });
    }
    Ok(statements)
}

pub fn drop_table_statement(artifact: &Artifact, ctx: TableContext<'_>) -> StoreResult<String> {
    bound_entity(artifact)?;
    Ok(format!(
        "DROP TABLE IF EXISTS {}",
        table_name(ctx.app_name, artifact.committed_name())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::artifact::ArtifactBody;
    use crate::model::entity::SqlIndex;
    use crate::model::id::{ArtifactId, ArtifactKind, Layer};

    const CTX: TableContext<'static> = TableContext { app_name: "sales" };

    fn invoice() -> Artifact {
        let store = ArtifactId::new(0, ArtifactKind::DataStore, 1, Layer::User).unwrap();
        let mut entity = EntityDef::bound_to(store);
        let id = entity
            .add_data_field("Id", DataField::new(FieldType::Int))
            .unwrap();
        let code = entity
            .add_data_field("Code", DataField::new(FieldType::String).with_length(20))
            .unwrap();
        entity
            .add_data_field("Memo", DataField::new(FieldType::String).nullable())
            .unwrap();
        entity.set_primary_keys(vec![id]).unwrap();
        entity
            .add_index(SqlIndex {
                name: "UX_Code".to_string(),
                unique: true,
                fields: vec![code],
            })
            .unwrap();
        let artifact_id = ArtifactId::new(1, ArtifactKind::Entity, 1, Layer::User).unwrap();
        Artifact::new(artifact_id, "Invoice", ArtifactBody::Entity(entity))
    }

    #[test]
    fn create_table_lists_columns_keys_and_indexes() {
        let statements = create_table_statements(&invoice(), CTX).unwrap();
        assert_eq!(
            statements,
            vec![
                "CREATE TABLE \"sales.Invoice\" (\"Id\" INTEGER NOT NULL, \"Code\" VARCHAR(20) NOT NULL, \"Memo\" TEXT, PRIMARY KEY (\"Id\"))".to_string(),
                "CREATE UNIQUE INDEX \"sales.Invoice.UX_Code\" ON \"sales.Invoice\" (\"Code\")".to_string(),
            ]
        );
    }

    #[test]
    fn unchanged_entity_needs_no_ddl() {
        let committed = invoice().committed_copy();
        assert!(!sql_shape_changed(&committed));
        assert!(alter_table_statements(&committed, CTX).unwrap().is_empty());
    }

    #[test]
    fn alter_covers_rename_add_rename_column_and_drop() {
        let mut artifact = invoice().committed_copy();
        artifact.rename("Bill");
        let entity = artifact.as_entity_mut().unwrap();
        let memo = entity.member_by_name("Memo").unwrap().id;
        let code = entity.member_by_name("Code").unwrap().id;
        entity.remove_member(memo).unwrap();
        entity.rename_member(code, "Number").unwrap();
        entity
            .add_data_field("Total", DataField::new(FieldType::Decimal))
            .unwrap();

        assert!(sql_shape_changed(&artifact));
        let statements = alter_table_statements(&artifact, CTX).unwrap();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"sales.Invoice\" RENAME TO \"sales.Bill\"".to_string(),
                "ALTER TABLE \"sales.Bill\" RENAME COLUMN \"Code\" TO \"Number\"".to_string(),
                "ALTER TABLE \"sales.Bill\" DROP COLUMN \"Memo\"".to_string(),
                "ALTER TABLE \"sales.Bill\" ADD COLUMN \"Total\" DECIMAL NOT NULL DEFAULT 0".to_string(),
            ]
        );
    }

    #[test]
    fn drop_uses_committed_name() {
        let mut artifact = invoice().committed_copy();
        artifact.rename("Bill");
        assert_eq!(
            drop_table_statement(&artifact, CTX).unwrap(),
            "DROP TABLE IF EXISTS \"sales.Invoice\""
        );
    }

    #[test]
    fn identifiers_escape_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn unbound_entity_is_rejected() {
        let id = ArtifactId::new(1, ArtifactKind::Entity, 2, Layer::User).unwrap();
        let artifact = Artifact::new(id, "Loose", ArtifactBody::Entity(EntityDef::new()));
        assert!(create_table_statements(&artifact, CTX).is_err());
        assert!(!sql_shape_changed(&artifact));
    }
}
