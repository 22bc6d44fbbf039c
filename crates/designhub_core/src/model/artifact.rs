//! Versioned design artifacts.
//!
//! # Responsibility
//! - Define the common artifact header and the closed set of artifact bodies.
//! - Apply persistence-state transitions on mutation, rename and delete.
//!
//! # Invariants
//! - `header.id.kind()` always matches the body variant.
//! - `version` is the committed version; `0` means never committed.
//! - `original_name` is only set while a rename of a committed artifact is
//!   pending.

use crate::model::entity::EntityDef;
use crate::model::folder::FolderId;
use crate::model::id::{ArtifactId, ArtifactKind};
use crate::model::state::{DeleteOutcome, PersistentState};

/// Executable server-side logic; compiled on publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDef {
    pub source: String,
    pub references: Vec<ArtifactId>,
}

/// UI definition; stored with its source, never compiled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewDef {
    pub source: String,
    pub route: Option<String>,
    pub references: Vec<ArtifactId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStoreKind {
    Sql,
}

impl DataStoreKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Sql => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Sql),
            _ => None,
        }
    }
}

/// External store registration. Its name selects the registered store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStoreDef {
    pub kind: DataStoreKind,
    pub provider: String,
    pub settings: String,
}

impl DataStoreDef {
    pub fn sql(provider: &str) -> Self {
        Self {
            kind: DataStoreKind::Sql,
            provider: provider.to_string(),
            settings: String::new(),
        }
    }
}

/// Kind-specific payload of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactBody {
    Entity(EntityDef),
    Service(ServiceDef),
    View(ViewDef),
    DataStore(DataStoreDef),
}

impl ArtifactBody {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Entity(_) => ArtifactKind::Entity,
            Self::Service(_) => ArtifactKind::Service,
            Self::View(_) => ArtifactKind::View,
            Self::DataStore(_) => ArtifactKind::DataStore,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub id: ArtifactId,
    pub name: String,
    pub original_name: Option<String>,
    pub folder: Option<FolderId>,
    pub version: u32,
    pub state: PersistentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub header: ArtifactHeader,
    pub body: ArtifactBody,
}

impl Artifact {
    /// Creates a never-committed artifact.
    pub fn new(id: ArtifactId, name: &str, body: ArtifactBody) -> Self {
        Self {
            header: ArtifactHeader {
                id,
                name: name.to_string(),
                original_name: None,
                folder: None,
                version: 0,
                state: PersistentState::Detached,
            },
            body,
        }
    }

    pub fn id(&self) -> ArtifactId {
        self.header.id
    }

    pub fn kind(&self) -> ArtifactKind {
        self.body.kind()
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn state(&self) -> PersistentState {
        self.header.state
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn is_visible(&self) -> bool {
        !self.header.state.is_deleted()
    }

    /// Name under which the committed copy is known.
    pub fn committed_name(&self) -> &str {
        self.header
            .original_name
            .as_deref()
            .unwrap_or(&self.header.name)
    }

    pub fn is_renamed(&self) -> bool {
        self.committed_name() != self.header.name
    }

    /// Records a content mutation.
    pub fn mark_modified(&mut self) {
        self.header.state = self.header.state.on_mutation();
    }

    /// Marks the artifact for deletion, or reports it should be discarded.
    pub fn mark_deleted(&mut self) -> DeleteOutcome {
        let outcome = self.header.state.on_delete();
        if outcome == DeleteOutcome::MarkDeleted {
            self.header.state = PersistentState::Deleted;
        }
        outcome
    }

    pub fn rename(&mut self, new_name: &str) {
        if self.header.name == new_name {
            return;
        }
        if self.header.state != PersistentState::Detached && self.header.original_name.is_none() {
            self.header.original_name = Some(self.header.name.clone());
        }
        self.header.name = new_name.to_string();
        self.mark_modified();
    }

    /// Artifacts that must be committed before this one.
    pub fn references(&self) -> Vec<ArtifactId> {
        let mut refs = match &self.body {
            ArtifactBody::Entity(entity) => entity.references(),
            ArtifactBody::Service(service) => service.references.clone(),
            ArtifactBody::View(view) => view.references.clone(),
            ArtifactBody::DataStore(_) => Vec::new(),
        };
        refs.retain(|id| *id != self.header.id);
        refs.sort();
        refs.dedup();
        refs
    }

    /// Source text for services and views.
    pub fn source(&self) -> Option<&str> {
        match &self.body {
            ArtifactBody::Service(service) => Some(&service.source),
            ArtifactBody::View(view) => Some(&view.source),
            _ => None,
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self.body, ArtifactBody::Service(_))
    }

    pub fn as_entity(&self) -> Option<&EntityDef> {
        match &self.body {
            ArtifactBody::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_entity_mut(&mut self) -> Option<&mut EntityDef> {
        match &mut self.body {
            ArtifactBody::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_data_store(&self) -> Option<&DataStoreDef> {
        match &self.body {
            ArtifactBody::DataStore(store) => Some(store),
            _ => None,
        }
    }

    /// Dotted full name, e.g. `sales.Entities.Customer`.
    pub fn full_name(&self, app_name: &str) -> String {
        format!("{app_name}.{}.{}", self.kind().plural(), self.header.name)
    }

    /// Returns the copy that a successful publish leaves behind.
    pub fn committed_copy(&self) -> Self {
        let mut committed = self.clone();
        committed.header.version = self.header.version + 1;
        committed.header.state = PersistentState::Unchanged;
        committed.header.original_name = None;
        if let ArtifactBody::Entity(entity) = &mut committed.body {
            entity.accept_changes();
        }
        committed
    }
}
