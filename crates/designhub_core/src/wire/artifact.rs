//! Artifact blob encoding.
//!
//! # Invariants
//! - The body variant must match the kind packed in the artifact id.
//! - `BlobScope::Metadata` omits service/view source text; the metadata store
//!   keeps source in its own table.

use super::{required, WireError, WireReader, WireResult, WireWriter};
use crate::model::artifact::{
    Artifact, ArtifactBody, ArtifactHeader, DataStoreDef, DataStoreKind, ServiceDef, ViewDef,
};
use crate::model::entity::{
    DataField, EntityDef, EntityMember, FieldType, MemberKind, SqlBinding, SqlIndex,
};
use crate::model::id::{ArtifactId, MemberId};
use crate::model::state::PersistentState;

/// Which parts of an artifact a blob carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobScope {
    /// Everything, used for staged edits.
    Full,
    /// Everything except source text.
    Metadata,
}

mod tag {
    pub const ID: u32 = 1;
    pub const NAME: u32 = 2;
    pub const ORIGINAL_NAME: u32 = 3;
    pub const FOLDER: u32 = 4;
    pub const VERSION: u32 = 5;
    pub const STATE: u32 = 6;
    pub const ENTITY: u32 = 10;
    pub const SERVICE: u32 = 11;
    pub const VIEW: u32 = 12;
    pub const DATA_STORE: u32 = 13;

    pub const ENTITY_MEMBER: u32 = 1;
    pub const ENTITY_NEXT_MEMBER: u32 = 2;
    pub const ENTITY_SQL: u32 = 3;

    pub const MEMBER_ID: u32 = 1;
    pub const MEMBER_NAME: u32 = 2;
    pub const MEMBER_ORIGINAL_NAME: u32 = 3;
    pub const MEMBER_STATE: u32 = 4;
    pub const MEMBER_DATA_FIELD: u32 = 5;
    pub const MEMBER_ENTITY_REF: u32 = 6;
    pub const MEMBER_ENTITY_SET: u32 = 7;

    pub const FIELD_TYPE: u32 = 1;
    pub const FIELD_NULLABLE: u32 = 2;
    pub const FIELD_LENGTH: u32 = 3;

    pub const REF_TARGET: u32 = 1;
    pub const REF_FOREIGN_KEY: u32 = 2;

    pub const SET_TARGET: u32 = 1;
    pub const SET_REF_MEMBER: u32 = 2;

    pub const SQL_STORE: u32 = 1;
    pub const SQL_PRIMARY_KEY: u32 = 2;
    pub const SQL_INDEX: u32 = 3;

    pub const INDEX_NAME: u32 = 1;
    pub const INDEX_UNIQUE: u32 = 2;
    pub const INDEX_FIELD: u32 = 3;

    pub const SOURCE: u32 = 1;
    pub const REFERENCE: u32 = 2;
    pub const ROUTE: u32 = 3;

    pub const STORE_KIND: u32 = 1;
    pub const STORE_PROVIDER: u32 = 2;
    pub const STORE_SETTINGS: u32 = 3;
}

/// Serializes an artifact into a self-describing blob.
pub fn encode_artifact(artifact: &Artifact, scope: BlobScope) -> WireResult<Vec<u8>> {
    let mut w = WireWriter::new();
    let header = &artifact.header;
    w.field(tag::ID, |w| w.write_u64(header.id.raw()));
    w.field(tag::NAME, |w| w.write_str(&header.name));
    if let Some(original) = &header.original_name {
        w.field(tag::ORIGINAL_NAME, |w| w.write_str(original));
    }
    if let Some(folder) = header.folder {
        w.field(tag::FOLDER, |w| w.write_uuid(folder));
    }
    w.field(tag::VERSION, |w| w.write_u32(header.version));
    w.field(tag::STATE, |w| w.write_u8(header.state.code()));

    match &artifact.body {
        ArtifactBody::Entity(entity) => w.field(tag::ENTITY, |w| write_entity(w, entity)),
        ArtifactBody::Service(service) => {
            w.field(tag::SERVICE, |w| write_service(w, service, scope))
        }
        ArtifactBody::View(view) => w.field(tag::VIEW, |w| write_view(w, view, scope)),
        ArtifactBody::DataStore(store) => {
            w.field(tag::DATA_STORE, |w| write_data_store(w, store))
        }
    }
    w.write_end();
    w.finish()
}

/// Decodes a blob produced by [`encode_artifact`].
pub fn decode_artifact(bytes: &[u8]) -> WireResult<Artifact> {
    const CTX: &str = "artifact";
    let mut r = WireReader::new(bytes);
    let mut id = None;
    let mut name = None;
    let mut original_name = None;
    let mut folder = None;
    let mut version = 0;
    let mut state = PersistentState::Detached;
    let mut body = None;

    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::ID => id = Some(read_artifact_id(&mut r, CTX)?),
            tag::NAME => name = Some(r.read_string()?),
            tag::ORIGINAL_NAME => original_name = Some(r.read_string()?),
            tag::FOLDER => folder = Some(r.read_uuid()?),
            tag::VERSION => version = r.read_u32()?,
            tag::STATE => state = read_state(&mut r, CTX)?,
            tag::ENTITY => body = Some(ArtifactBody::Entity(read_entity(&mut r)?)),
            tag::SERVICE => body = Some(ArtifactBody::Service(read_service(&mut r)?)),
            tag::VIEW => body = Some(ArtifactBody::View(read_view(&mut r)?)),
            tag::DATA_STORE => body = Some(ArtifactBody::DataStore(read_data_store(&mut r)?)),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    r.finish()?;

    let id: ArtifactId = required(id, CTX, "id")?;
    let body = required(body, CTX, "body")?;
    if body.kind() != id.kind() {
        return Err(WireError::invalid(
            CTX,
            format!("body kind {} does not match id kind {}", body.kind(), id.kind()),
        ));
    }
    Ok(Artifact {
        header: ArtifactHeader {
            id,
            name: required(name, CTX, "name")?,
            original_name,
            folder,
            version,
            state,
        },
        body,
    })
}

pub(crate) fn read_artifact_id(r: &mut WireReader<'_>, context: &'static str) -> WireResult<ArtifactId> {
    ArtifactId::from_raw(r.read_u64()?).map_err(|err| WireError::invalid(context, err))
}

fn read_member_id(r: &mut WireReader<'_>, context: &'static str) -> WireResult<MemberId> {
    MemberId::from_raw(r.read_u16()?).map_err(|err| WireError::invalid(context, err))
}

pub(crate) fn read_state(r: &mut WireReader<'_>, context: &'static str) -> WireResult<PersistentState> {
    let code = r.read_u8()?;
    PersistentState::from_code(code).ok_or_else(|| WireError::invalid(context, format!("state {code}")))
}

fn write_entity(w: &mut WireWriter, entity: &EntityDef) {
    for member in entity.all_members() {
        w.field(tag::ENTITY_MEMBER, |w| write_member(w, member));
    }
    w.field(tag::ENTITY_NEXT_MEMBER, |w| w.write_u16(entity.next_member_seq()));
    if let Some(sql) = entity.sql() {
        w.field(tag::ENTITY_SQL, |w| write_sql(w, sql));
    }
    w.write_end();
}

fn read_entity(r: &mut WireReader<'_>) -> WireResult<EntityDef> {
    const CTX: &str = "entity";
    let mut members = Vec::new();
    let mut next_member_seq = None;
    let mut sql = None;
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::ENTITY_MEMBER => members.push(read_member(r)?),
            tag::ENTITY_NEXT_MEMBER => next_member_seq = Some(r.read_u16()?),
            tag::ENTITY_SQL => sql = Some(read_sql(r)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    let next_member_seq = required(next_member_seq, CTX, "next_member_seq")?;
    if members
        .iter()
        .any(|member: &EntityMember| member.id.sequence() >= next_member_seq)
    {
        return Err(WireError::invalid(CTX, "member id beyond allocation counter"));
    }
    let known = |id: &MemberId| members.iter().any(|member| member.id == *id);
    let mut referenced: Vec<MemberId> = Vec::new();
    if let Some(sql) = &sql {
        referenced.extend(sql.primary_keys.iter().copied());
        for index in &sql.indexes {
            referenced.extend(index.fields.iter().copied());
        }
    }
    for member in &members {
        if let MemberKind::EntityRef { foreign_keys, .. } = &member.kind {
            referenced.extend(foreign_keys.iter().copied());
        }
    }
    if let Some(unknown) = referenced.iter().find(|id| !known(id)) {
        return Err(WireError::invalid(CTX, format!("unknown member id {unknown}")));
    }
    Ok(EntityDef::from_parts(members, next_member_seq, sql))
}

fn write_member(w: &mut WireWriter, member: &EntityMember) {
    w.field(tag::MEMBER_ID, |w| w.write_u16(member.id.raw()));
    w.field(tag::MEMBER_NAME, |w| w.write_str(&member.name));
    if let Some(original) = &member.original_name {
        w.field(tag::MEMBER_ORIGINAL_NAME, |w| w.write_str(original));
    }
    w.field(tag::MEMBER_STATE, |w| w.write_u8(member.state.code()));
    match &member.kind {
        MemberKind::DataField(field) => w.field(tag::MEMBER_DATA_FIELD, |w| {
            w.field(tag::FIELD_TYPE, |w| w.write_u8(field.field_type.code()));
            w.field(tag::FIELD_NULLABLE, |w| w.write_bool(field.nullable));
            if let Some(length) = field.length {
                w.field(tag::FIELD_LENGTH, |w| w.write_u32(length));
            }
            w.write_end();
        }),
        MemberKind::EntityRef {
            targets,
            foreign_keys,
        } => w.field(tag::MEMBER_ENTITY_REF, |w| {
            for target in targets {
                w.field(tag::REF_TARGET, |w| w.write_u64(target.raw()));
            }
            for key in foreign_keys {
                w.field(tag::REF_FOREIGN_KEY, |w| w.write_u16(key.raw()));
            }
            w.write_end();
        }),
        MemberKind::EntitySet { target, ref_member } => w.field(tag::MEMBER_ENTITY_SET, |w| {
            w.field(tag::SET_TARGET, |w| w.write_u64(target.raw()));
            w.field(tag::SET_REF_MEMBER, |w| w.write_u16(ref_member.raw()));
            w.write_end();
        }),
    }
    w.write_end();
}

fn read_member(r: &mut WireReader<'_>) -> WireResult<EntityMember> {
    const CTX: &str = "entity member";
    let mut id = None;
    let mut name = None;
    let mut original_name = None;
    let mut state = PersistentState::Detached;
    let mut kind = None;
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::MEMBER_ID => id = Some(read_member_id(r, CTX)?),
            tag::MEMBER_NAME => name = Some(r.read_string()?),
            tag::MEMBER_ORIGINAL_NAME => original_name = Some(r.read_string()?),
            tag::MEMBER_STATE => state = read_state(r, CTX)?,
            tag::MEMBER_DATA_FIELD => kind = Some(MemberKind::DataField(read_data_field(r)?)),
            tag::MEMBER_ENTITY_REF => kind = Some(read_entity_ref(r)?),
            tag::MEMBER_ENTITY_SET => kind = Some(read_entity_set(r)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(EntityMember {
        id: required(id, CTX, "id")?,
        name: required(name, CTX, "name")?,
        original_name,
        state,
        kind: required(kind, CTX, "kind")?,
    })
}

fn read_data_field(r: &mut WireReader<'_>) -> WireResult<DataField> {
    const CTX: &str = "data field";
    let mut field_type = None;
    let mut nullable = false;
    let mut length = None;
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::FIELD_TYPE => {
                let code = r.read_u8()?;
                field_type = Some(
                    FieldType::from_code(code)
                        .ok_or_else(|| WireError::invalid(CTX, format!("field type {code}")))?,
                );
            }
            tag::FIELD_NULLABLE => nullable = r.read_bool()?,
            tag::FIELD_LENGTH => length = Some(r.read_u32()?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(DataField {
        field_type: required(field_type, CTX, "type")?,
        nullable,
        length,
    })
}

fn read_entity_ref(r: &mut WireReader<'_>) -> WireResult<MemberKind> {
    const CTX: &str = "entity ref";
    let mut targets = Vec::new();
    let mut foreign_keys = Vec::new();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::REF_TARGET => targets.push(read_artifact_id(r, CTX)?),
            tag::REF_FOREIGN_KEY => foreign_keys.push(read_member_id(r, CTX)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(MemberKind::EntityRef {
        targets,
        foreign_keys,
    })
}

fn read_entity_set(r: &mut WireReader<'_>) -> WireResult<MemberKind> {
    const CTX: &str = "entity set";
    let mut target = None;
    let mut ref_member = None;
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::SET_TARGET => target = Some(read_artifact_id(r, CTX)?),
            tag::SET_REF_MEMBER => ref_member = Some(read_member_id(r, CTX)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(MemberKind::EntitySet {
        target: required(target, CTX, "target")?,
        ref_member: required(ref_member, CTX, "ref_member")?,
    })
}

fn write_sql(w: &mut WireWriter, sql: &SqlBinding) {
    w.field(tag::SQL_STORE, |w| w.write_u64(sql.store.raw()));
    for key in &sql.primary_keys {
        w.field(tag::SQL_PRIMARY_KEY, |w| w.write_u16(key.raw()));
    }
    for index in &sql.indexes {
        w.field(tag::SQL_INDEX, |w| {
            w.field(tag::INDEX_NAME, |w| w.write_str(&index.name));
            w.field(tag::INDEX_UNIQUE, |w| w.write_bool(index.unique));
            for field in &index.fields {
                w.field(tag::INDEX_FIELD, |w| w.write_u16(field.raw()));
            }
            w.write_end();
        });
    }
    w.write_end();
}

fn read_sql(r: &mut WireReader<'_>) -> WireResult<SqlBinding> {
    const CTX: &str = "sql binding";
    let mut store = None;
    let mut primary_keys = Vec::new();
    let mut indexes = Vec::new();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::SQL_STORE => store = Some(read_artifact_id(r, CTX)?),
            tag::SQL_PRIMARY_KEY => primary_keys.push(read_member_id(r, CTX)?),
            tag::SQL_INDEX => indexes.push(read_index(r)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(SqlBinding {
        store: required(store, CTX, "store")?,
        primary_keys,
        indexes,
    })
}

fn read_index(r: &mut WireReader<'_>) -> WireResult<SqlIndex> {
    const CTX: &str = "sql index";
    let mut name = None;
    let mut unique = false;
    let mut fields = Vec::new();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::INDEX_NAME => name = Some(r.read_string()?),
            tag::INDEX_UNIQUE => unique = r.read_bool()?,
            tag::INDEX_FIELD => fields.push(read_member_id(r, CTX)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(SqlIndex {
        name: required(name, CTX, "name")?,
        unique,
        fields,
    })
}

fn write_service(w: &mut WireWriter, service: &ServiceDef, scope: BlobScope) {
    if scope == BlobScope::Full {
        w.field(tag::SOURCE, |w| w.write_str(&service.source));
    }
    for reference in &service.references {
        w.field(tag::REFERENCE, |w| w.write_u64(reference.raw()));
    }
    w.write_end();
}

fn read_service(r: &mut WireReader<'_>) -> WireResult<ServiceDef> {
    const CTX: &str = "service";
    let mut service = ServiceDef::default();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::SOURCE => service.source = r.read_string()?,
            tag::REFERENCE => service.references.push(read_artifact_id(r, CTX)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(service)
}

fn write_view(w: &mut WireWriter, view: &ViewDef, scope: BlobScope) {
    if scope == BlobScope::Full {
        w.field(tag::SOURCE, |w| w.write_str(&view.source));
    }
    for reference in &view.references {
        w.field(tag::REFERENCE, |w| w.write_u64(reference.raw()));
    }
    if let Some(route) = &view.route {
        w.field(tag::ROUTE, |w| w.write_str(route));
    }
    w.write_end();
}

fn read_view(r: &mut WireReader<'_>) -> WireResult<ViewDef> {
    const CTX: &str = "view";
    let mut view = ViewDef::default();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::SOURCE => view.source = r.read_string()?,
            tag::REFERENCE => view.references.push(read_artifact_id(r, CTX)?),
            tag::ROUTE => view.route = Some(r.read_string()?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(view)
}

fn write_data_store(w: &mut WireWriter, store: &DataStoreDef) {
    w.field(tag::STORE_KIND, |w| w.write_u8(store.kind.code()));
    w.field(tag::STORE_PROVIDER, |w| w.write_str(&store.provider));
    w.field(tag::STORE_SETTINGS, |w| w.write_str(&store.settings));
    w.write_end();
}

fn read_data_store(r: &mut WireReader<'_>) -> WireResult<DataStoreDef> {
    const CTX: &str = "data store";
    let mut kind = None;
    let mut provider = None;
    let mut settings = String::new();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            tag::STORE_KIND => {
                let code = r.read_u8()?;
                kind = Some(
                    DataStoreKind::from_code(code)
                        .ok_or_else(|| WireError::invalid(CTX, format!("store kind {code}")))?,
                );
            }
            tag::STORE_PROVIDER => provider = Some(r.read_string()?),
            tag::STORE_SETTINGS => settings = r.read_string()?,
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok(DataStoreDef {
        kind: required(kind, CTX, "kind")?,
        provider: required(provider, CTX, "provider")?,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::id::{ArtifactKind, Layer};
    use uuid::Uuid;

    fn sample_entity() -> Artifact {
        let store = ArtifactId::new(0, ArtifactKind::DataStore, 1, Layer::User).unwrap();
        let customer = ArtifactId::new(1, ArtifactKind::Entity, 2, Layer::User).unwrap();
        let mut entity = EntityDef::bound_to(store);
        let id = entity
            .add_data_field("Id", DataField::new(FieldType::Guid))
            .unwrap();
        let customer_id = entity
            .add_data_field("CustomerId", DataField::new(FieldType::Guid).nullable())
            .unwrap();
        entity
            .add_data_field("Note", DataField::new(FieldType::String).with_length(200))
            .unwrap();
        entity
            .add_entity_ref("Customer", vec![customer], vec![customer_id])
            .unwrap();
        entity
            .set_primary_keys(vec![id])
            .unwrap();
        entity
            .add_index(SqlIndex {
                name: "IX_Customer".to_string(),
                unique: false,
                fields: vec![customer_id],
            })
            .unwrap();

        let artifact_id = ArtifactId::new(1, ArtifactKind::Entity, 5, Layer::User).unwrap();
        let mut artifact = Artifact::new(artifact_id, "Invoice", ArtifactBody::Entity(entity));
        artifact.header.folder = Some(Uuid::new_v4());
        artifact
    }

    fn sample_service() -> Artifact {
        let id = ArtifactId::new(1, ArtifactKind::Service, 1, Layer::User).unwrap();
        let mut artifact = Artifact::new(
            id,
            "Billing",
            ArtifactBody::Service(ServiceDef {
                source: "fn bill() {}".to_string(),
                references: vec![sample_entity().id()],
            }),
        );
        artifact.header.version = 3;
        artifact.header.state = PersistentState::Modified;
        artifact.header.original_name = Some("Billing0".to_string());
        artifact
    }

    #[test]
    fn entity_blob_decodes_to_identical_artifact() {
        let artifact = sample_entity();
        let decoded = decode_artifact(&encode_artifact(&artifact, BlobScope::Full).unwrap()).unwrap();
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn metadata_scope_drops_source_only() {
        let artifact = sample_service();
        let decoded = decode_artifact(&encode_artifact(&artifact, BlobScope::Metadata).unwrap()).unwrap();
        assert_eq!(decoded.source(), Some(""));
        assert_eq!(decoded.header, artifact.header);
        assert_eq!(decoded.references(), artifact.references());
    }

    #[test]
    fn unknown_member_tag_is_a_hard_error() {
        let mut artifact = sample_entity();
        artifact.header.folder = None;
        let mut bytes = encode_artifact(&artifact, BlobScope::Full).unwrap();
        // Splice an unknown tag into the first member, right after its id field.
        let member_start = bytes
            .windows(2)
            .position(|pair| pair[0] == tag::ENTITY as u8 && pair[1] == tag::ENTITY_MEMBER as u8)
            .unwrap()
            + 2;
        let after_id = member_start + 1 + 2;
        bytes.insert(after_id, 42);

        let err = decode_artifact(&bytes).unwrap_err();
        assert!(matches!(
            err,
            WireError::UnknownTag {
                context: "entity member",
                tag: 42
            }
        ));
    }

    #[test]
    fn reference_to_unknown_member_id_fails() {
        let mut artifact = sample_entity();
        let ghost = MemberId::new(50, Layer::User).unwrap();
        let entity = artifact.as_entity_mut().unwrap();
        let mut members = entity.all_members().to_vec();
        members.truncate(1);
        let mut sql = entity.sql().cloned().unwrap();
        sql.primary_keys = vec![ghost];
        sql.indexes.clear();
        *entity = EntityDef::from_parts(members, 60, Some(sql));

        let err = decode_artifact(&encode_artifact(&artifact, BlobScope::Full).unwrap()).unwrap_err();
        assert!(matches!(err, WireError::InvalidValue { context: "entity", .. }));
    }

    #[test]
    fn body_kind_must_match_id_kind() {
        let mut artifact = sample_service();
        artifact.header.id = ArtifactId::new(1, ArtifactKind::View, 1, Layer::User).unwrap();
        let err = decode_artifact(&encode_artifact(&artifact, BlobScope::Full).unwrap()).unwrap_err();
        assert!(matches!(err, WireError::InvalidValue { context: "artifact", .. }));
    }

    #[test]
    fn truncated_blob_fails() {
        let bytes = encode_artifact(&sample_entity(), BlobScope::Full).unwrap();
        assert!(decode_artifact(&bytes[..bytes.len() - 3]).is_err());
    }
}
