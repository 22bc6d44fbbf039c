//! Packed identifiers for design artifacts and entity members.
//!
//! # Responsibility
//! - Pack application id, artifact kind, sequence and layer into one `u64`.
//! - Provide the fixed per-kind folder-root ids used as checkout keys.
//! - Pack member sequence and layer into one `u16`.
//!
//! # Invariants
//! - Bit layout of [`ArtifactId`]: app `32..64`, kind `24..32`,
//!   sequence `3..24`, bit `2` reserved (always zero), layer `0..2`.
//! - Bit layout of [`MemberId`]: sequence `4..16`, bits `2..4` reserved,
//!   layer `0..2`.
//! - Ordering follows the raw value, so ids sort by application, then kind,
//!   then sequence.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Application identifier. `0` is reserved for hub-scoped artifacts.
pub type AppId = u32;

/// Application id used by artifacts that live outside any application.
pub const HUB_APP_ID: AppId = 0;

const APP_SHIFT: u32 = 32;
const KIND_SHIFT: u32 = 24;
const SEQ_SHIFT: u32 = 3;
const SEQ_BITS: u32 = 21;
const LAYER_MASK: u64 = 0b11;
const RESERVED_BIT: u64 = 0b100;

/// Largest sequence an [`ArtifactId`] can carry.
pub const MAX_ARTIFACT_SEQUENCE: u32 = (1 << SEQ_BITS) - 1;

const MEMBER_SEQ_SHIFT: u16 = 4;
/// Largest sequence a [`MemberId`] can carry.
pub const MAX_MEMBER_SEQUENCE: u16 = (1 << 12) - 1;

/// Errors produced while building or decoding identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("sequence {0} is outside 1..={MAX_ARTIFACT_SEQUENCE}")]
    SequenceOutOfRange(u32),
    #[error("member sequence {0} is outside 1..={MAX_MEMBER_SEQUENCE}")]
    MemberSequenceOutOfRange(u16),
    #[error("unknown artifact kind code {0}")]
    UnknownKind(u8),
    #[error("unknown layer code {0}")]
    UnknownLayer(u8),
    #[error("reserved bit set in artifact id {0:#x}")]
    ReservedBit(u64),
}

/// Closed set of design-artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Entity,
    Service,
    View,
    Folder,
    DataStore,
}

impl ArtifactKind {
    /// Kinds that live under an application root.
    pub const APPLICATION_KINDS: [ArtifactKind; 3] =
        [ArtifactKind::Entity, ArtifactKind::Service, ArtifactKind::View];

    /// Returns the stable code stored in ids and persisted rows.
    pub fn code(self) -> u8 {
        match self {
            Self::Entity => 1,
            Self::Service => 2,
            Self::View => 3,
            Self::Folder => 4,
            Self::DataStore => 5,
        }
    }

    /// Parses a stable code back into a kind.
    pub fn from_code(code: u8) -> Result<Self, IdError> {
        match code {
            1 => Ok(Self::Entity),
            2 => Ok(Self::Service),
            3 => Ok(Self::View),
            4 => Ok(Self::Folder),
            5 => Ok(Self::DataStore),
            other => Err(IdError::UnknownKind(other)),
        }
    }

    /// Plural segment used in dotted full names (`app.Entities.Customer`).
    pub fn plural(self) -> &'static str {
        match self {
            Self::Entity => "Entities",
            Self::Service => "Services",
            Self::View => "Views",
            Self::Folder => "Folders",
            Self::DataStore => "DataStores",
        }
    }

    pub fn from_plural(segment: &str) -> Option<Self> {
        match segment {
            "Entities" => Some(Self::Entity),
            "Services" => Some(Self::Service),
            "Views" => Some(Self::View),
            "Folders" => Some(Self::Folder),
            "DataStores" => Some(Self::DataStore),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Service => "service",
            Self::View => "view",
            Self::Folder => "folder",
            Self::DataStore => "data_store",
        }
    }

    /// Returns whether artifacts of this kind belong to an application.
    pub fn is_application_scoped(self) -> bool {
        Self::APPLICATION_KINDS.contains(&self)
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ownership layer of an artifact or member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Layer {
    /// Shipped with the hub; not editable by developers.
    System,
    /// Created by developers.
    User,
}

impl Layer {
    pub fn code(self) -> u8 {
        match self {
            Self::System => 0,
            Self::User => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, IdError> {
        match code {
            0 => Ok(Self::System),
            1 => Ok(Self::User),
            other => Err(IdError::UnknownLayer(other)),
        }
    }
}

/// Packed 64-bit artifact identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(u64);

impl ArtifactId {
    /// Packs the components into one id.
    pub fn new(app: AppId, kind: ArtifactKind, seq: u32, layer: Layer) -> Result<Self, IdError> {
        if seq == 0 || seq > MAX_ARTIFACT_SEQUENCE {
            return Err(IdError::SequenceOutOfRange(seq));
        }
        Ok(Self::pack(app, kind, seq, layer))
    }

    /// Fixed id of the folder tree root for `target` inside `app`.
    ///
    /// The sequence slot carries the target kind code, so every
    /// (application, kind) pair owns exactly one root.
    pub fn folder_root(app: AppId, target: ArtifactKind) -> Self {
        Self::pack(app, ArtifactKind::Folder, u32::from(target.code()), Layer::System)
    }

    fn pack(app: AppId, kind: ArtifactKind, seq: u32, layer: Layer) -> Self {
        let raw = (u64::from(app) << APP_SHIFT)
            | (u64::from(kind.code()) << KIND_SHIFT)
            | (u64::from(seq) << SEQ_SHIFT)
            | u64::from(layer.code());
        Self(raw)
    }

    /// Validates and wraps a raw persisted value.
    pub fn from_raw(raw: u64) -> Result<Self, IdError> {
        if raw & RESERVED_BIT != 0 {
            return Err(IdError::ReservedBit(raw));
        }
        ArtifactKind::from_code(((raw >> KIND_SHIFT) & 0xFF) as u8)?;
        Layer::from_code((raw & LAYER_MASK) as u8)?;
        Ok(Self(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn app_id(self) -> AppId {
        (self.0 >> APP_SHIFT) as AppId
    }

    pub fn kind(self) -> ArtifactKind {
        // Every constructor validates the kind byte.
        ArtifactKind::from_code(((self.0 >> KIND_SHIFT) & 0xFF) as u8)
            .unwrap_or(ArtifactKind::Folder)
    }

    pub fn sequence(self) -> u32 {
        ((self.0 >> SEQ_SHIFT) & u64::from(MAX_ARTIFACT_SEQUENCE)) as u32
    }

    pub fn layer(self) -> Layer {
        if self.0 & LAYER_MASK == 0 {
            Layer::System
        } else {
            Layer::User
        }
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.app_id(), self.kind(), self.sequence())
    }
}

/// Packed 16-bit entity member identifier, unique within one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u16);

impl MemberId {
    pub fn new(seq: u16, layer: Layer) -> Result<Self, IdError> {
        if seq == 0 || seq > MAX_MEMBER_SEQUENCE {
            return Err(IdError::MemberSequenceOutOfRange(seq));
        }
        Ok(Self((seq << MEMBER_SEQ_SHIFT) | u16::from(layer.code())))
    }

    pub fn from_raw(raw: u16) -> Result<Self, IdError> {
        let seq = raw >> MEMBER_SEQ_SHIFT;
        if seq == 0 {
            return Err(IdError::MemberSequenceOutOfRange(seq));
        }
        let layer = Layer::from_code((raw & 0b11) as u8)?;
        Self::new(seq, layer)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn sequence(self) -> u16 {
        self.0 >> MEMBER_SEQ_SHIFT
    }

    pub fn layer(self) -> Layer {
        if self.0 & 0b11 == 0 {
            Layer::System
        } else {
            Layer::User
        }
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn packs_and_unpacks_components() {
        let id = ArtifactId::new(7, ArtifactKind::Entity, 42, Layer::User).unwrap();
        assert_eq!(id.app_id(), 7);
        assert_eq!(id.kind(), ArtifactKind::Entity);
        assert_eq!(id.sequence(), 42);
        assert_eq!(id.layer(), Layer::User);
        assert_eq!(id.raw() & RESERVED_BIT, 0);
    }

    #[test]
    fn rejects_zero_and_oversized_sequences() {
        assert_eq!(
            ArtifactId::new(1, ArtifactKind::View, 0, Layer::User),
            Err(IdError::SequenceOutOfRange(0))
        );
        assert!(ArtifactId::new(1, ArtifactKind::View, MAX_ARTIFACT_SEQUENCE + 1, Layer::User)
            .is_err());
    }

    #[test]
    fn folder_roots_are_distinct_per_kind_and_app() {
        let entity_root = ArtifactId::folder_root(3, ArtifactKind::Entity);
        let service_root = ArtifactId::folder_root(3, ArtifactKind::Service);
        let other_app = ArtifactId::folder_root(4, ArtifactKind::Entity);

        assert_eq!(entity_root.kind(), ArtifactKind::Folder);
        assert_ne!(entity_root, service_root);
        assert_ne!(entity_root, other_app);
        assert_eq!(entity_root, ArtifactId::folder_root(3, ArtifactKind::Entity));
    }

    #[test]
    fn from_raw_rejects_reserved_bit_and_unknown_kind() {
        let id = ArtifactId::new(1, ArtifactKind::Entity, 1, Layer::User).unwrap();
        assert!(matches!(
            ArtifactId::from_raw(id.raw() | RESERVED_BIT),
            Err(IdError::ReservedBit(_))
        ));
        assert_eq!(
            ArtifactId::from_raw(9u64 << KIND_SHIFT),
            Err(IdError::UnknownKind(9))
        );
    }

    #[test]
    fn ids_sort_by_app_then_kind_then_sequence() {
        let a = ArtifactId::new(1, ArtifactKind::Entity, 900, Layer::User).unwrap();
        let b = ArtifactId::new(1, ArtifactKind::Service, 1, Layer::User).unwrap();
        let c = ArtifactId::new(2, ArtifactKind::Entity, 1, Layer::User).unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn member_ids_pack_sequence_and_layer() {
        let member = MemberId::new(12, Layer::User).unwrap();
        assert_eq!(member.sequence(), 12);
        assert_eq!(member.layer(), Layer::User);
        assert_eq!(MemberId::from_raw(member.raw()), Ok(member));
        assert!(MemberId::new(MAX_MEMBER_SEQUENCE + 1, Layer::User).is_err());
    }

    #[test]
    fn full_name_segments_round_trip() {
        for kind in [
            ArtifactKind::Entity,
            ArtifactKind::Service,
            ArtifactKind::View,
            ArtifactKind::Folder,
            ArtifactKind::DataStore,
        ] {
            assert_eq!(ArtifactKind::from_plural(kind.plural()), Some(kind));
            assert_eq!(ArtifactKind::from_code(kind.code()), Ok(kind));
        }
    }

    fn any_kind() -> impl Strategy<Value = ArtifactKind> {
        prop_oneof![
            Just(ArtifactKind::Entity),
            Just(ArtifactKind::Service),
            Just(ArtifactKind::View),
            Just(ArtifactKind::Folder),
            Just(ArtifactKind::DataStore),
        ]
    }

    proptest! {
        #[test]
        fn packing_is_lossless(
            app in any::<u32>(),
            kind in any_kind(),
            seq in 1..=MAX_ARTIFACT_SEQUENCE,
            user in any::<bool>(),
        ) {
            let layer = if user { Layer::User } else { Layer::System };
            let id = ArtifactId::new(app, kind, seq, layer).unwrap();
            prop_assert_eq!(id.app_id(), app);
            prop_assert_eq!(id.kind(), kind);
            prop_assert_eq!(id.sequence(), seq);
            prop_assert_eq!(id.layer(), layer);
            prop_assert_eq!(ArtifactId::from_raw(id.raw()), Ok(id));
        }
    }
}
