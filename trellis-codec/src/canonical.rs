//! Canonical one-object-per-file rendering and content hashing.
//!
//! Canonical form is deterministic: keys in a fixed order (`kind`,
//! `metadata.name`, `metadata.namespace`, then `spec` with sorted keys),
//! LF line endings, trailing newline. Equal documents always render to equal
//! bytes, so the SHA-256 of the rendering is a stable content hash.

use serde::Serialize;
use sha2::{Digest, Sha256};

use trellis_core::types::{ObjectDocument, ObjectKind, Spec};

use crate::document::{parse_block, RawBlock};
use crate::error::CodecError;

#[derive(Serialize)]
struct CanonicalDoc<'a> {
    kind: ObjectKind,
    metadata: CanonicalMeta<'a>,
    spec: &'a Spec,
}

#[derive(Serialize)]
struct CanonicalMeta<'a> {
    name: &'a str,
    namespace: &'a str,
}

/// Render `doc` in canonical form.
pub fn render_canonical(doc: &ObjectDocument) -> Result<String, CodecError> {
    let canonical = CanonicalDoc {
        kind: doc.kind,
        metadata: CanonicalMeta {
            name: &doc.name,
            namespace: &doc.namespace,
        },
        spec: &doc.spec,
    };
    let mut out = serde_yaml::to_string(&canonical)?;
    if out.contains('\r') {
        out = out.replace("\r\n", "\n");
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// SHA-256 hex of arbitrary bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical text plus its content hash.
pub fn render_with_hash(doc: &ObjectDocument) -> Result<(String, String), CodecError> {
    let text = render_canonical(doc)?;
    let hash = content_hash(text.as_bytes());
    Ok((text, hash))
}

/// Decode a canonical file's contents back into a document.
pub fn parse_canonical(text: &str) -> Result<ObjectDocument, CodecError> {
    parse_block(&RawBlock {
        index: 1,
        line: 1,
        text: text.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bridge_domain() -> ObjectDocument {
        let mut spec = Spec::new();
        spec.insert("vrf".into(), json!("main"));
        spec.insert("mtu".into(), json!(9000));
        spec.insert("arp_flood".into(), json!(true));
        spec.insert("l2_unknown".into(), json!({"mode": "proxy", "limit": 10}));
        ObjectDocument {
            kind: ObjectKind::BridgeDomain,
            namespace: "prod".into(),
            name: "web".into(),
            spec,
        }
    }

    #[test]
    fn key_order_is_fixed() {
        let text = render_canonical(&bridge_domain()).unwrap();
        let kind = text.find("kind:").unwrap();
        let meta = text.find("metadata:").unwrap();
        let spec = text.find("spec:").unwrap();
        assert!(kind < meta && meta < spec, "{text}");
        let arp = text.find("arp_flood").unwrap();
        let vrf = text.find("vrf:").unwrap();
        assert!(arp < vrf, "spec keys must be sorted: {text}");
        assert!(text.starts_with("kind: bridge-domain\n"));
        assert!(!text.contains('\r'));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn render_then_parse_is_identity() {
        let doc = bridge_domain();
        let text = render_canonical(&doc).unwrap();
        assert_eq!(parse_canonical(&text).unwrap(), doc);
    }

    #[test]
    fn rendering_is_stable_across_insertion_order() {
        let a = bridge_domain();
        let mut b = bridge_domain();
        let reordered: Spec = b.spec.clone().into_iter().rev().collect();
        b.spec = reordered;
        assert_eq!(render_with_hash(&a).unwrap(), render_with_hash(&b).unwrap());
    }

    #[test]
    fn hash_is_sha256_hex() {
        let hash = content_hash(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let (_, h1) = render_with_hash(&bridge_domain()).unwrap();
        let mut changed = bridge_domain();
        changed.spec.insert("mtu".into(), json!(1500));
        let (_, h2) = render_with_hash(&changed).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn empty_spec_still_renders() {
        let doc = ObjectDocument {
            kind: ObjectKind::Tenant,
            namespace: "default".into(),
            name: "acme".into(),
            spec: Spec::new(),
        };
        let text = render_canonical(&doc).unwrap();
        assert_eq!(parse_canonical(&text).unwrap(), doc);
    }
}
