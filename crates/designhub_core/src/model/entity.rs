//! Entity definitions: members, SQL binding and member lifecycle.
//!
//! # Responsibility
//! - Own the ordered member list of one entity and allocate member ids.
//! - Track per-member persistence state so DDL can be derived on publish.
//!
//! # Invariants
//! - Visible (non-deleted) member names are unique within one entity.
//! - Member ids are never reused inside one entity.
//! - Primary keys can only be changed while the owning entity is `Detached`.

use crate::model::id::{ArtifactId, IdError, Layer, MemberId};
use crate::model::state::{DeleteOutcome, PersistentState};
use thiserror::Error;

/// Errors raised while editing an entity definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("member name `{0}` already exists")]
    DuplicateMemberName(String),
    #[error("member {0} not found")]
    MemberNotFound(MemberId),
    #[error("member {0} is not a data field")]
    NotDataField(MemberId),
    #[error("the SQL binding of a published entity cannot change")]
    BindingLocked,
    #[error("entity is not bound to a data store")]
    NotBound,
    #[error("member {0} is used by a key, index or reference")]
    MemberInUse(MemberId),
    #[error(transparent)]
    Id(#[from] IdError),
}

/// Scalar column types an entity data field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Decimal,
    DateTime,
    Guid,
    Binary,
}

impl FieldType {
    pub fn code(self) -> u8 {
        match self {
            Self::String => 1,
            Self::Bool => 2,
            Self::Byte => 3,
            Self::Short => 4,
            Self::Int => 5,
            Self::Long => 6,
            Self::Float => 7,
            Self::Double => 8,
            Self::Decimal => 9,
            Self::DateTime => 10,
            Self::Guid => 11,
            Self::Binary => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::String,
            2 => Self::Bool,
            3 => Self::Byte,
            4 => Self::Short,
            5 => Self::Int,
            6 => Self::Long,
            7 => Self::Float,
            8 => Self::Double,
            9 => Self::Decimal,
            10 => Self::DateTime,
            11 => Self::Guid,
            12 => Self::Binary,
            _ => return None,
        })
    }
}

/// Scalar column member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub field_type: FieldType,
    pub nullable: bool,
    /// Maximum length for string/binary columns.
    pub length: Option<u32>,
}

impl DataField {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            nullable: false,
            length: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }
}

/// Shape of one entity member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    DataField(DataField),
    /// Reference to one of `targets`, resolved through `foreign_keys`.
    EntityRef {
        targets: Vec<ArtifactId>,
        foreign_keys: Vec<MemberId>,
    },
    /// Collection of `target` rows whose `ref_member` points back here.
    EntitySet {
        target: ArtifactId,
        ref_member: MemberId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMember {
    pub id: MemberId,
    pub name: String,
    /// Name at the last publish, set while a rename is pending.
    pub original_name: Option<String>,
    pub state: PersistentState,
    pub kind: MemberKind,
}

impl EntityMember {
    pub fn as_data_field(&self) -> Option<&DataField> {
        match &self.kind {
            MemberKind::DataField(field) => Some(field),
            _ => None,
        }
    }

    /// Returns whether the member was renamed since the last publish.
    pub fn is_renamed(&self) -> bool {
        self.original_name
            .as_deref()
            .is_some_and(|original| original != self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlIndex {
    pub name: String,
    pub unique: bool,
    pub fields: Vec<MemberId>,
}

/// Binding of an entity to a table in an external SQL store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBinding {
    /// Data-store artifact the table lives in.
    pub store: ArtifactId,
    pub primary_keys: Vec<MemberId>,
    pub indexes: Vec<SqlIndex>,
}

/// Body of an entity artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    members: Vec<EntityMember>,
    next_member_seq: u16,
    sql: Option<SqlBinding>,
}

impl Default for EntityDef {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityDef {
    /// Creates an entity with no members and no SQL binding.
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            next_member_seq: 1,
            sql: None,
        }
    }

    /// Creates an entity bound to the data store `store`.
    pub fn bound_to(store: ArtifactId) -> Self {
        let mut entity = Self::new();
        entity.sql = Some(SqlBinding {
            store,
            primary_keys: Vec::new(),
            indexes: Vec::new(),
        });
        entity
    }

    /// Rebuilds an entity from decoded parts.
    pub(crate) fn from_parts(
        members: Vec<EntityMember>,
        next_member_seq: u16,
        sql: Option<SqlBinding>,
    ) -> Self {
        Self {
            members,
            next_member_seq,
            sql,
        }
    }

    pub(crate) fn next_member_seq(&self) -> u16 {
        self.next_member_seq
    }

    /// All members, including the ones pending deletion.
    pub fn all_members(&self) -> &[EntityMember] {
        &self.members
    }

    /// Members that are not marked deleted.
    pub fn members(&self) -> impl Iterator<Item = &EntityMember> {
        self.members.iter().filter(|member| !member.state.is_deleted())
    }

    pub fn member(&self, id: MemberId) -> Option<&EntityMember> {
        self.members.iter().find(|member| member.id == id)
    }

    pub fn member_by_name(&self, name: &str) -> Option<&EntityMember> {
        self.members().find(|member| member.name == name)
    }

    pub fn sql(&self) -> Option<&SqlBinding> {
        self.sql.as_ref()
    }

    pub fn add_data_field(&mut self, name: &str, field: DataField) -> Result<MemberId, EntityError> {
        self.push_member(name, MemberKind::DataField(field))
    }

    pub fn add_entity_ref(
        &mut self,
        name: &str,
        targets: Vec<ArtifactId>,
        foreign_keys: Vec<MemberId>,
    ) -> Result<MemberId, EntityError> {
        for key in &foreign_keys {
            self.require_data_field(*key)?;
        }
        self.push_member(
            name,
            MemberKind::EntityRef {
                targets,
                foreign_keys,
            },
        )
    }

    pub fn add_entity_set(
        &mut self,
        name: &str,
        target: ArtifactId,
        ref_member: MemberId,
    ) -> Result<MemberId, EntityError> {
        self.push_member(name, MemberKind::EntitySet { target, ref_member })
    }

    fn push_member(&mut self, name: &str, kind: MemberKind) -> Result<MemberId, EntityError> {
        if self.member_by_name(name).is_some() {
            return Err(EntityError::DuplicateMemberName(name.to_string()));
        }
        let id = MemberId::new(self.next_member_seq, Layer::User)?;
        self.next_member_seq += 1;
        self.members.push(EntityMember {
            id,
            name: name.to_string(),
            original_name: None,
            state: PersistentState::Detached,
            kind,
        });
        Ok(id)
    }

    pub fn rename_member(&mut self, id: MemberId, new_name: &str) -> Result<(), EntityError> {
        if self
            .member_by_name(new_name)
            .is_some_and(|other| other.id != id)
        {
            return Err(EntityError::DuplicateMemberName(new_name.to_string()));
        }
        let member = self.member_mut(id)?;
        if member.name == new_name {
            return Ok(());
        }
        if member.state != PersistentState::Detached && member.original_name.is_none() {
            member.original_name = Some(member.name.clone());
        }
        member.name = new_name.to_string();
        member.state = member.state.on_mutation();
        Ok(())
    }

    /// Updates nullability/length of a data field.
    pub fn update_data_field(
        &mut self,
        id: MemberId,
        update: impl FnOnce(&mut DataField),
    ) -> Result<(), EntityError> {
        let member = self.member_mut(id)?;
        match &mut member.kind {
            MemberKind::DataField(field) => update(field),
            _ => return Err(EntityError::NotDataField(id)),
        }
        member.state = member.state.on_mutation();
        Ok(())
    }

    /// Removes a member: never-published members vanish, others are marked.
    pub fn remove_member(&mut self, id: MemberId) -> Result<(), EntityError> {
        let position = self
            .members
            .iter()
            .position(|member| member.id == id && !member.state.is_deleted())
            .ok_or(EntityError::MemberNotFound(id))?;
        if self.is_member_in_use(id) {
            return Err(EntityError::MemberInUse(id));
        }
        match self.members[position].state.on_delete() {
            DeleteOutcome::Discard => {
                self.members.remove(position);
            }
            DeleteOutcome::MarkDeleted => {
                self.members[position].state = PersistentState::Deleted;
            }
        }
        Ok(())
    }

    fn is_member_in_use(&self, id: MemberId) -> bool {
        let in_binding = self.sql.as_ref().is_some_and(|sql| {
            sql.primary_keys.contains(&id)
                || sql.indexes.iter().any(|index| index.fields.contains(&id))
        });
        let in_reference = self.members().any(|member| match &member.kind {
            MemberKind::EntityRef { foreign_keys, .. } => foreign_keys.contains(&id),
            _ => false,
        });
        in_binding || in_reference
    }

    /// Sets the primary key members.
    ///
    /// The binding is frozen once the entity is published; the catalog
    /// rejects edits that change it on anything but a detached entity.
    pub fn set_primary_keys(&mut self, keys: Vec<MemberId>) -> Result<(), EntityError> {
        for key in &keys {
            self.require_data_field(*key)?;
        }
        let sql = self.sql.as_mut().ok_or(EntityError::NotBound)?;
        sql.primary_keys = keys;
        Ok(())
    }

    /// Adds an index. Indexes are created with the table.
    pub fn add_index(&mut self, index: SqlIndex) -> Result<(), EntityError> {
        for field in &index.fields {
            self.require_data_field(*field)?;
        }
        let sql = self.sql.as_mut().ok_or(EntityError::NotBound)?;
        sql.indexes.push(index);
        Ok(())
    }

    fn require_data_field(&self, id: MemberId) -> Result<(), EntityError> {
        let member = self
            .members()
            .find(|member| member.id == id)
            .ok_or(EntityError::MemberNotFound(id))?;
        member
            .as_data_field()
            .map(|_| ())
            .ok_or(EntityError::NotDataField(id))
    }

    fn member_mut(&mut self, id: MemberId) -> Result<&mut EntityMember, EntityError> {
        self.members
            .iter_mut()
            .find(|member| member.id == id && !member.state.is_deleted())
            .ok_or(EntityError::MemberNotFound(id))
    }

    /// Artifacts this entity depends on: referenced entities and its store.
    pub fn references(&self) -> Vec<ArtifactId> {
        let mut refs = Vec::new();
        for member in self.members() {
            match &member.kind {
                MemberKind::EntityRef { targets, .. } => refs.extend(targets.iter().copied()),
                MemberKind::EntitySet { target, .. } => refs.push(*target),
                MemberKind::DataField(_) => {}
            }
        }
        if let Some(sql) = &self.sql {
            refs.push(sql.store);
        }
        refs.sort();
        refs.dedup();
        refs
    }

    /// Drops deleted members and marks the rest as committed.
    pub fn accept_changes(&mut self) {
        self.members.retain(|member| !member.state.is_deleted());
        for member in &mut self.members {
            member.state = PersistentState::Unchanged;
            member.original_name = None;
        }
    }
}
