//! Design-time domain model.
//!
//! # Responsibility
//! - Define identifiers, persistence states and the artifact sum type.
//! - Keep editing rules (renames, deletes, member lifecycle) next to the data.
//!
//! # Invariants
//! - Every artifact is identified by a packed `ArtifactId`.
//! - Deletion of committed objects is a `Deleted` marker until publish.
//!
//! # See also
//! - crate::wire for the binary encoding of these types.

pub mod application;
pub mod artifact;
pub mod entity;
pub mod folder;
pub mod id;
pub mod state;
