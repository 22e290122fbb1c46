//! Control-plane client seam.
//!
//! The engine talks to the live control plane only through [`ControlPlane`]:
//! per-kind list plus single-object get/create/update/delete, each returning
//! a typed result. No multi-object transactions are assumed.
//!
//! [`LocalControlPlane`] stores objects as JSON files under a directory and
//! is what the CLI and daemon use when a scope names a `control_plane`
//! directory.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trellis_core::types::{ObjectDocument, ObjectIdentity, ObjectKind, ScopeId};

use crate::drift::SpecDelta;

// ---------------------------------------------------------------------------
// Client errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientErrorKind {
    Connectivity,
    Authorization,
    NotFound,
    AlreadyExists,
    /// `expected_version` did not match the live object.
    VersionConflict,
    /// The control plane refused this object (validation, policy).
    Rejected,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientErrorKind::Connectivity => "connectivity",
            ClientErrorKind::Authorization => "authorization",
            ClientErrorKind::NotFound => "not found",
            ClientErrorKind::AlreadyExists => "already exists",
            ClientErrorKind::VersionConflict => "version conflict",
            ClientErrorKind::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Errors that make the rest of the run pointless.
    pub fn is_scope_level(&self) -> bool {
        matches!(
            self.kind,
            ClientErrorKind::Connectivity | ClientErrorKind::Authorization
        )
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// An object as the control plane holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub document: ObjectDocument,
    pub resource_version: String,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list(&self, scope: &ScopeId, kind: ObjectKind) -> Result<Vec<RemoteObject>, ClientError>;

    async fn get(&self, identity: &ObjectIdentity) -> Result<Option<RemoteObject>, ClientError>;

    async fn create(
        &self,
        scope: &ScopeId,
        document: &ObjectDocument,
    ) -> Result<RemoteObject, ClientError>;

    /// Apply `delta` to the live object. With `expected_version` set, the
    /// update is refused if the object changed since that version.
    async fn update(
        &self,
        identity: &ObjectIdentity,
        delta: &SpecDelta,
        expected_version: Option<&str>,
    ) -> Result<RemoteObject, ClientError>;

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), ClientError>;
}

// ---------------------------------------------------------------------------
// Directory-backed implementation
// ---------------------------------------------------------------------------

/// Marker file that makes every call fail with an authorization error.
pub const DENY_MARKER: &str = ".deny";

#[derive(Debug, Serialize, Deserialize)]
struct StoredObject {
    resource_version: u64,
    document: ObjectDocument,
}

/// `<root>/<scope>/<kind>/<namespace>/<name>.json`
#[derive(Debug, Clone)]
pub struct LocalControlPlane {
    root: PathBuf,
}

impl LocalControlPlane {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, identity: &ObjectIdentity) -> PathBuf {
        self.root
            .join(&identity.scope.0)
            .join(identity.kind.as_str())
            .join(&identity.namespace)
            .join(format!("{}.json", identity.name))
    }

    async fn reachable(&self) -> Result<(), ClientError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(ClientError::new(
                    ClientErrorKind::Connectivity,
                    format!("control plane unreachable at {}", self.root.display()),
                ))
            }
        }
        if tokio::fs::metadata(self.root.join(DENY_MARKER)).await.is_ok() {
            return Err(ClientError::new(
                ClientErrorKind::Authorization,
                "credentials rejected",
            ));
        }
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<StoredObject>, ClientError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                ClientError::new(
                    ClientErrorKind::Rejected,
                    format!("corrupt object at {}: {e}", path.display()),
                )
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(connectivity(path, err)),
        }
    }

    async fn write(&self, path: &Path, stored: &StoredObject) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| connectivity(parent, e))?;
        }
        let json = serde_json::to_string_pretty(stored)
            .map_err(|e| ClientError::new(ClientErrorKind::Rejected, e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| connectivity(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| connectivity(path, e))
    }
}

fn connectivity(path: &Path, err: std::io::Error) -> ClientError {
    ClientError::new(
        ClientErrorKind::Connectivity,
        format!("{}: {err}", path.display()),
    )
}

fn remote(stored: StoredObject) -> RemoteObject {
    RemoteObject {
        document: stored.document,
        resource_version: stored.resource_version.to_string(),
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn list(&self, scope: &ScopeId, kind: ObjectKind) -> Result<Vec<RemoteObject>, ClientError> {
        self.reachable().await?;
        let kind_dir = self.root.join(&scope.0).join(kind.as_str());
        let mut out = Vec::new();
        let mut namespaces = match tokio::fs::read_dir(&kind_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(connectivity(&kind_dir, err)),
        };
        while let Some(ns) = namespaces
            .next_entry()
            .await
            .map_err(|e| connectivity(&kind_dir, e))?
        {
            if !ns.path().is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(ns.path())
                .await
                .map_err(|e| connectivity(&ns.path(), e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| connectivity(&ns.path(), e))?
            {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stored) = self.read(&path).await? {
                    out.push(remote(stored));
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.document.namespace, &a.document.name).cmp(&(&b.document.namespace, &b.document.name))
        });
        Ok(out)
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<Option<RemoteObject>, ClientError> {
        self.reachable().await?;
        Ok(self.read(&self.object_path(identity)).await?.map(remote))
    }

    async fn create(
        &self,
        scope: &ScopeId,
        document: &ObjectDocument,
    ) -> Result<RemoteObject, ClientError> {
        self.reachable().await?;
        let identity = document.identity(scope);
        let path = self.object_path(&identity);
        if self.read(&path).await?.is_some() {
            return Err(ClientError::new(
                ClientErrorKind::AlreadyExists,
                identity.to_string(),
            ));
        }
        let stored = StoredObject {
            resource_version: 1,
            document: document.clone(),
        };
        self.write(&path, &stored).await?;
        Ok(remote(stored))
    }

    async fn update(
        &self,
        identity: &ObjectIdentity,
        delta: &SpecDelta,
        expected_version: Option<&str>,
    ) -> Result<RemoteObject, ClientError> {
        self.reachable().await?;
        let path = self.object_path(identity);
        let Some(mut stored) = self.read(&path).await? else {
            return Err(ClientError::new(ClientErrorKind::NotFound, identity.to_string()));
        };
        if let Some(expected) = expected_version {
            if expected != stored.resource_version.to_string() {
                return Err(ClientError::new(
                    ClientErrorKind::VersionConflict,
                    format!(
                        "{identity}: expected version {expected}, found {}",
                        stored.resource_version
                    ),
                ));
            }
        }
        delta.apply(&mut stored.document.spec);
        stored.resource_version += 1;
        self.write(&path, &stored).await?;
        Ok(remote(stored))
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), ClientError> {
        self.reachable().await?;
        let path = self.object_path(identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ClientError::new(
                ClientErrorKind::NotFound,
                identity.to_string(),
            )),
            Err(err) => Err(connectivity(&path, err)),
        }
    }
}
