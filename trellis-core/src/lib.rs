//! Trellis core library: domain types, scope registry persistence, lifecycle.
//!
//! Public API surface:
//! - [`types`]: identity newtypes, the closed object taxonomy, scope records
//! - [`layout`]: per-scope file-tree layout
//! - [`lifecycle`]: scope state machine and retry backoff
//! - [`error`]: [`CoreError`]
//! - [`registry`]: load / save / init / remove scope records

pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod registry;
pub mod types;

pub use error::CoreError;
pub use layout::ScopeLayout;
pub use lifecycle::{backoff_delay, ScopeEvent, ScopeState};
pub use types::{
    ArchiveStrategy, FieldOwnership, ManagedObject, ObjectDocument, ObjectIdentity, ObjectKind,
    ObjectOrigin, ReferenceField, Scope, ScopeConfig, ScopeError, ScopeErrorKind, ScopeId, Spec,
};
