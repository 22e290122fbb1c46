//! # trellis-sync
//!
//! Ingestion, drift detection and reconciliation for one scope at a time.
//!
//! Call [`ingest_scope`] to normalize raw inputs into the canonical tree, or
//! [`run_scope`] for a full reconciliation run: ingest, audit the tree,
//! compare file tree, control plane and catalog, then plan and apply the
//! operations that bring them back into agreement.

pub mod apply;
pub mod audit;
pub mod catalog;
pub mod control_plane;
pub mod drift;
pub mod error;
pub mod ingest;
pub mod lock;
pub mod manifest;
pub mod plan;
pub mod preview;
pub mod reconcile;
pub mod vcs;
pub mod writer;

pub use catalog::{Catalog, CatalogEntry, CatalogError, FileCatalog};
pub use control_plane::{ClientError, ClientErrorKind, ControlPlane, LocalControlPlane, RemoteObject};
pub use drift::{Authority, DiffOp, DiffRecord, SpecDelta};
pub use error::{BlockError, ErrorClass, SyncError};
pub use ingest::{ingest_scope, IngestReport};
pub use plan::Plan;
pub use preview::{diff_scope, ScopePreview};
pub use reconcile::{
    prune_object, resolve_conflict, run_scope, ReconcileEnv, ReconcileOptions, ReconcileReport,
    ResolveSide,
};
pub use vcs::{GitCli, VcsError, VersionControl};
pub use writer::WriteResult;
