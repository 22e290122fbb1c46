//! Domain types for the Trellis registry and canonical object store.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Scope records serialize via serde_yaml; manifest-facing types via serde_json.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::layout::CANONICAL_EXT;
use crate::lifecycle::ScopeState;

/// Namespace whose canonical files sit directly under `managed/<kind>/`.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Longest accepted name, namespace, or scope id.
pub const MAX_SEGMENT_LEN: usize = 128;

/// Object body: top-level spec keys are the unit of ownership and diffing.
pub type Spec = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for a reconciliation scope (site, fabric, cluster).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ScopeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl ScopeId {
    /// Validates the id for use as a file name.
    pub fn validate(&self) -> Result<(), CoreError> {
        if is_valid_segment(&self.0) {
            Ok(())
        } else {
            Err(CoreError::InvalidScopeId(self.0.clone()))
        }
    }
}

/// `[A-Za-z0-9][A-Za-z0-9._-]*`, at most [`MAX_SEGMENT_LEN`] bytes.
///
/// Shared by scope ids, object names and namespaces; all of them end up as
/// path segments.
pub fn is_valid_segment(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    value.len() <= MAX_SEGMENT_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Namespaces become directories next to default-namespace canonical files,
/// so one named like such a file would shadow it.
pub fn is_valid_namespace(value: &str) -> bool {
    is_valid_segment(value)
        && !value
            .strip_suffix(CANONICAL_EXT)
            .is_some_and(|stem| stem.ends_with('.'))
}

// ---------------------------------------------------------------------------
// Object taxonomy
// ---------------------------------------------------------------------------

/// The closed set of object kinds the engine manages.
///
/// Declaration order is dependency order: every reference points at a kind
/// declared earlier. [`ObjectKind::rank`] exposes that order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    Tenant,
    Vrf,
    BridgeDomain,
    Subnet,
    Filter,
    Contract,
    ApplicationProfile,
    EndpointGroup,
    VlanPool,
    AccessPolicy,
    InterfaceProfile,
    StaticRoute,
}

/// A spec key that names another object in the same namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceField {
    pub field: &'static str,
    pub target: ObjectKind,
    /// `true` when the field holds a list of names rather than a single name.
    pub many: bool,
}

const fn one(field: &'static str, target: ObjectKind) -> ReferenceField {
    ReferenceField {
        field,
        target,
        many: false,
    }
}

const fn many(field: &'static str, target: ObjectKind) -> ReferenceField {
    ReferenceField {
        field,
        target,
        many: true,
    }
}

impl ObjectKind {
    pub fn all() -> &'static [ObjectKind] {
        use ObjectKind::*;
        &[
            Tenant,
            Vrf,
            BridgeDomain,
            Subnet,
            Filter,
            Contract,
            ApplicationProfile,
            EndpointGroup,
            VlanPool,
            AccessPolicy,
            InterfaceProfile,
            StaticRoute,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Tenant => "tenant",
            ObjectKind::Vrf => "vrf",
            ObjectKind::BridgeDomain => "bridge-domain",
            ObjectKind::Subnet => "subnet",
            ObjectKind::Filter => "filter",
            ObjectKind::Contract => "contract",
            ObjectKind::ApplicationProfile => "application-profile",
            ObjectKind::EndpointGroup => "endpoint-group",
            ObjectKind::VlanPool => "vlan-pool",
            ObjectKind::AccessPolicy => "access-policy",
            ObjectKind::InterfaceProfile => "interface-profile",
            ObjectKind::StaticRoute => "static-route",
        }
    }

    /// Dependency rank; referenced kinds always rank lower than referrers.
    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn references(self) -> &'static [ReferenceField] {
        use ObjectKind::*;
        const TENANT_PARENT: [ReferenceField; 1] = [one("tenant", Tenant)];
        const VRF_PARENT: [ReferenceField; 1] = [one("vrf", Vrf)];
        const SUBNET_REFS: [ReferenceField; 1] = [one("bridge_domain", BridgeDomain)];
        const CONTRACT_REFS: [ReferenceField; 1] = [many("filters", Filter)];
        const EPG_REFS: [ReferenceField; 3] = [
            one("application_profile", ApplicationProfile),
            one("bridge_domain", BridgeDomain),
            many("contracts", Contract),
        ];
        const POLICY_REFS: [ReferenceField; 1] = [one("vlan_pool", VlanPool)];
        const PROFILE_REFS: [ReferenceField; 1] = [one("access_policy", AccessPolicy)];

        match self {
            Tenant | Filter | VlanPool => &[],
            Vrf | ApplicationProfile => &TENANT_PARENT,
            BridgeDomain | StaticRoute => &VRF_PARENT,
            Subnet => &SUBNET_REFS,
            Contract => &CONTRACT_REFS,
            EndpointGroup => &EPG_REFS,
            AccessPolicy => &POLICY_REFS,
            InterfaceProfile => &PROFILE_REFS,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ObjectKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable, globally unique identity of a managed object.
///
/// Field order matters: the derived `Ord` sorts by kind, then namespace,
/// then name within a scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub scope: ScopeId,
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(
        scope: ScopeId,
        kind: ObjectKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Scope-relative key: `<kind>/<namespace>/<name>`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }

    /// Inverse of [`ObjectIdentity::key`].
    pub fn parse_key(scope: &ScopeId, key: &str) -> Result<Self, CoreError> {
        let mut parts = key.split('/');
        let (Some(kind), Some(namespace), Some(name), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CoreError::InvalidIdentity(format!(
                "expected <kind>/<namespace>/<name>, got '{key}'"
            )));
        };
        let identity = Self::new(scope.clone(), kind.parse()?, namespace, name);
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (label, value) in [("namespace", &self.namespace), ("name", &self.name)] {
            if !is_valid_segment(value) {
                return Err(CoreError::InvalidIdentity(format!(
                    "{label} '{value}' must match [A-Za-z0-9][A-Za-z0-9._-]*"
                )));
            }
        }
        if !is_valid_namespace(&self.namespace) {
            return Err(CoreError::InvalidIdentity(format!(
                "namespace '{}' must not end in .{CANONICAL_EXT}",
                self.namespace
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.key())
    }
}

// ---------------------------------------------------------------------------
// Documents and managed objects
// ---------------------------------------------------------------------------

/// A parsed configuration object, independent of which scope holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDocument {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub spec: Spec,
}

impl ObjectDocument {
    pub fn identity(&self, scope: &ScopeId) -> ObjectIdentity {
        ObjectIdentity::new(scope.clone(), self.kind, &self.namespace, &self.name)
    }

    /// Objects this document points at through its reference fields.
    ///
    /// Values of the wrong shape are ignored here; the codec rejects them
    /// at parse time.
    pub fn referenced(&self, scope: &ScopeId) -> Vec<ObjectIdentity> {
        let mut out = Vec::new();
        for reference in self.kind.references() {
            let Some(value) = self.spec.get(reference.field) else {
                continue;
            };
            let names: Vec<&str> = match value {
                serde_json::Value::String(name) => vec![name.as_str()],
                serde_json::Value::Array(items) => {
                    items.iter().filter_map(|item| item.as_str()).collect()
                }
                _ => Vec::new(),
            };
            for name in names {
                out.push(ObjectIdentity::new(
                    scope.clone(),
                    reference.target,
                    &self.namespace,
                    name,
                ));
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

/// Where a managed object first entered the canonical tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectOrigin {
    /// Normalized from a `raw/` inbox document.
    #[default]
    Ingested,
    /// Imported from the control plane.
    Imported,
}

/// Per-field record of which spec keys the user has set.
///
/// Fields not listed are system-owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldOwnership {
    #[serde(default)]
    pub user_fields: BTreeSet<String>,
}

impl FieldOwnership {
    pub fn is_user_owned(&self, field: &str) -> bool {
        self.user_fields.contains(field)
    }

    pub fn user_modified(&self) -> bool {
        !self.user_fields.is_empty()
    }

    /// Mark `field` user-owned. Returns `true` if ownership changed.
    pub fn claim(&mut self, field: impl Into<String>) -> bool {
        self.user_fields.insert(field.into())
    }

    /// Hand `field` back to the system. Returns `true` if ownership changed.
    pub fn release(&mut self, field: &str) -> bool {
        self.user_fields.remove(field)
    }
}

/// Everything the engine knows about one object between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub identity: ObjectIdentity,
    /// Relative to the scope root.
    pub canonical_path: PathBuf,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub origin: ObjectOrigin,
    #[serde(default)]
    pub ownership: FieldOwnership,
    /// Spec as of the last successful reconciliation; `None` until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Spec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl ManagedObject {
    pub fn is_reconciled(&self) -> bool {
        self.last_reconciled.is_some()
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

pub const MIN_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 3600;

/// How an inbox file is retired once all its objects are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveStrategy {
    /// `raw/<file>` → `raw/<file>.ingested-<timestamp>`.
    #[default]
    RenameWithSuffix,
    /// `raw/<file>` → `archive/<timestamp>-<file>`.
    MoveToArchiveDir,
}

impl fmt::Display for ArchiveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveStrategy::RenameWithSuffix => write!(f, "rename-with-suffix"),
            ArchiveStrategy::MoveToArchiveDir => write!(f, "move-to-archive-dir"),
        }
    }
}

/// User-facing reconciliation settings for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub archive_strategy: ArchiveStrategy,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Directory backing the local control plane, if this scope uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<PathBuf>,
    /// Commit and push the scope root (a git working copy) after each run.
    #[serde(default)]
    pub vcs: bool,
}

fn default_enabled() -> bool {
    true
}
fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}
fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_INTERVAL_SECS,
            archive_strategy: ArchiveStrategy::default(),
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            control_plane: None,
            vcs: false,
        }
    }
}

impl ScopeConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(CoreError::InvalidConfig(format!(
                "interval_secs must be at least {MIN_INTERVAL_SECS}, got {}",
                self.interval_secs
            )));
        }
        if self.max_backoff_secs < self.interval_secs {
            return Err(CoreError::InvalidConfig(format!(
                "max_backoff_secs ({}) must not be below interval_secs ({})",
                self.max_backoff_secs, self.interval_secs
            )));
        }
        Ok(())
    }
}

/// Classification of a scope-level failure; drives retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeErrorKind {
    Connectivity,
    Authorization,
    Timeout,
    Internal,
}

impl fmt::Display for ScopeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScopeErrorKind::Connectivity => "connectivity",
            ScopeErrorKind::Authorization => "authorization",
            ScopeErrorKind::Timeout => "timeout",
            ScopeErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Last scope-level failure, kept on the record for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeError {
    pub kind: ScopeErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A reconciliation scope and its durable schedule record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    /// Absolute path to the scope's canonical file tree.
    pub root: PathBuf,
    #[serde(default)]
    pub config: ScopeConfig,
    #[serde(default)]
    pub state: ScopeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Earliest time the scheduler may start another run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    #[serde(default = "default_health")]
    pub health: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ScopeError>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub needs_attention: bool,
    #[serde(default)]
    pub pending_conflicts: usize,
    #[serde(default)]
    pub pending_push: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_health() -> f64 {
    1.0
}

impl Scope {
    pub fn new(id: ScopeId, root: PathBuf, config: ScopeConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            root,
            config,
            state: ScopeState::NeverSynced,
            last_run: None,
            next_eligible_at: None,
            health: default_health(),
            last_error: None,
            consecutive_failures: 0,
            needs_attention: false,
            pending_conflicts: 0,
            pending_push: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
