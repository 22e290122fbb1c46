//! Multi-document splitting and per-block decoding.
//!
//! An input file is an ordered sequence of YAML documents separated by
//! `---` (and optionally terminated by `...`). Blank and comment-only
//! documents are dropped before decoding; every remaining block decodes
//! independently so one malformed object never hides its neighbours.

use serde_json::{Map, Value};

use trellis_core::types::{is_valid_namespace, is_valid_segment, ObjectDocument, ObjectKind, Spec};

use crate::error::CodecError;

/// One non-empty document cut out of a larger input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// 1-based ordinal among the non-empty documents of the input.
    pub index: usize,
    /// 1-based line of the input where this document's text begins.
    pub line: usize,
    pub text: String,
}

/// Split `input` into its non-empty documents, in input order.
pub fn split_documents(input: &str) -> Vec<RawBlock> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;

    let flush = |text: &mut String, line: usize, blocks: &mut Vec<RawBlock>| {
        if !is_blank(text) {
            blocks.push(RawBlock {
                index: blocks.len() + 1,
                line,
                text: std::mem::take(text),
            });
        } else {
            text.clear();
        }
    };

    for (n, raw_line) in input.lines().enumerate() {
        let line_no = n + 1;
        let line = raw_line.trim_end_matches('\r');
        if let Some(rest) = document_start(line) {
            flush(&mut current, start_line, &mut blocks);
            start_line = line_no;
            if !rest.trim().is_empty() {
                current.push_str(rest);
                current.push('\n');
            }
            continue;
        }
        if line.trim_end() == "..." {
            flush(&mut current, start_line, &mut blocks);
            start_line = line_no + 1;
            continue;
        }
        if current.trim().is_empty() {
            start_line = line_no;
        }
        current.push_str(line);
        current.push('\n');
    }
    flush(&mut current, start_line, &mut blocks);
    blocks
}

/// `---` on its own, or followed by whitespace and inline content.
fn document_start(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("---")?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

fn is_blank(text: &str) -> bool {
    text.lines().all(|line| {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('%')
    })
}

// ---------------------------------------------------------------------------
// Block decoding
// ---------------------------------------------------------------------------

const TOP_LEVEL_KEYS: &[&str] = &["kind", "metadata", "spec"];
const METADATA_KEYS: &[&str] = &["name", "namespace"];

/// Decode one block into a typed document of a known kind.
pub fn parse_block(block: &RawBlock) -> Result<ObjectDocument, CodecError> {
    let parse = |message: String| CodecError::Parse {
        block: block.index,
        line: block.line,
        message,
    };
    let missing = |field: &'static str| CodecError::MissingField {
        block: block.index,
        line: block.line,
        field,
    };

    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&block.text).map_err(|e| parse(e.to_string()))?;
    let value = serde_json::to_value(&yaml).map_err(|e| parse(e.to_string()))?;
    let Value::Object(mut top) = value else {
        return Err(parse("expected a mapping at the document root".into()));
    };
    reject_unknown_keys(&top, TOP_LEVEL_KEYS, "").map_err(parse)?;

    let kind_str = match top.remove("kind") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
        Some(Value::String(_)) | None | Some(Value::Null) => return Err(missing("kind")),
        Some(other) => return Err(parse(format!("'kind' must be a string, got {other}"))),
    };
    let kind = lookup_kind(&kind_str).ok_or_else(|| CodecError::UnknownKind {
        block: block.index,
        line: block.line,
        kind: kind_str.clone(),
    })?;

    let mut metadata = match top.remove("metadata") {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => return Err(missing("metadata.name")),
        Some(_) => return Err(parse("'metadata' must be a mapping".into())),
    };
    reject_unknown_keys(&metadata, METADATA_KEYS, "metadata.").map_err(parse)?;
    let name = take_segment(block, &mut metadata, "name", "metadata.name")?;
    let namespace = take_segment(block, &mut metadata, "namespace", "metadata.namespace")?;
    if !is_valid_namespace(&namespace) {
        return Err(CodecError::InvalidIdentity {
            block: block.index,
            line: block.line,
            message: format!("metadata.namespace '{namespace}' collides with a canonical file name"),
        });
    }

    let spec: Spec = match top.remove("spec") {
        Some(Value::Object(map)) => map.into_iter().collect(),
        None | Some(Value::Null) => Spec::new(),
        Some(_) => return Err(parse("'spec' must be a mapping".into())),
    };
    check_references(block, kind, &spec)?;

    Ok(ObjectDocument {
        kind,
        namespace,
        name,
        spec,
    })
}

/// Split and decode a whole input. Results line up with the non-empty blocks.
pub fn parse_documents(input: &str) -> Vec<(RawBlock, Result<ObjectDocument, CodecError>)> {
    split_documents(input)
        .into_iter()
        .map(|block| {
            let parsed = parse_block(&block);
            (block, parsed)
        })
        .collect()
}

/// Kind lookup tolerant of case and of `-`/`_` separators, so
/// `BridgeDomain`, `bridge_domain` and `bridge-domain` all resolve.
pub fn lookup_kind(raw: &str) -> Option<ObjectKind> {
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .map(|c| c.to_ascii_lowercase())
            .collect()
    };
    let wanted = squash(raw.trim());
    ObjectKind::all()
        .iter()
        .copied()
        .find(|kind| squash(kind.as_str()) == wanted)
}

fn reject_unknown_keys(map: &Map<String, Value>, allowed: &[&str], prefix: &str) -> Result<(), String> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(format!("unexpected field '{prefix}{key}'")),
        None => Ok(()),
    }
}

fn take_segment(
    block: &RawBlock,
    map: &mut Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, CodecError> {
    match map.remove(key) {
        Some(Value::String(value)) if !value.is_empty() => {
            if is_valid_segment(&value) {
                Ok(value)
            } else {
                Err(CodecError::InvalidIdentity {
                    block: block.index,
                    line: block.line,
                    message: format!("{field} '{value}' must match [A-Za-z0-9][A-Za-z0-9._-]*"),
                })
            }
        }
        Some(Value::String(_)) | Some(Value::Null) | None => Err(CodecError::MissingField {
            block: block.index,
            line: block.line,
            field,
        }),
        Some(other) => Err(CodecError::InvalidIdentity {
            block: block.index,
            line: block.line,
            message: format!("{field} must be a string, got {other}"),
        }),
    }
}

fn check_references(block: &RawBlock, kind: ObjectKind, spec: &Spec) -> Result<(), CodecError> {
    let invalid = |field: &str, message: String| CodecError::InvalidReference {
        block: block.index,
        line: block.line,
        field: field.to_string(),
        message,
    };
    for reference in kind.references() {
        let Some(value) = spec.get(reference.field) else {
            continue;
        };
        let names: Vec<&Value> = match (reference.many, value) {
            (true, Value::Array(items)) => items.iter().collect(),
            (true, _) => {
                return Err(invalid(
                    reference.field,
                    format!("must be a list of {} names", reference.target),
                ))
            }
            (false, single) => vec![single],
        };
        for name in names {
            match name {
                Value::String(s) if is_valid_segment(s) => {}
                Value::String(s) => {
                    return Err(invalid(reference.field, format!("names an invalid object '{s}'")))
                }
                _ => {
                    return Err(invalid(
                        reference.field,
                        format!("must name a {} by string", reference.target),
                    ))
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const THREE: &str = "\
kind: tenant
metadata: {name: acme, namespace: default}
---
# comment-only document
---

---
kind: vrf
metadata:
  name: main
  namespace: default
spec:
  tenant: acme
...
---
kind: Filter
metadata: {name: http, namespace: prod}
";

    #[test]
    fn splits_and_skips_empty_documents() {
        let blocks = split_documents(THREE);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].index, 1);
        assert_eq!(blocks[0].line, 1);
        assert_eq!(blocks[1].index, 2);
        assert!(blocks[1].text.contains("kind: vrf"));
        assert_eq!(blocks[1].line, 8);
        assert_eq!(blocks[2].index, 3);
    }

    #[test]
    fn empty_input_has_no_blocks() {
        assert!(split_documents("").is_empty());
        assert!(split_documents("---\n---\n# nothing\n...\n").is_empty());
    }

    #[test]
    fn separator_must_stand_alone() {
        let blocks = split_documents("kind: tenant\nnote: ---inline\n");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn parses_every_block_independently() {
        let parsed = parse_documents(THREE);
        assert_eq!(parsed.len(), 3);
        let docs: Vec<ObjectDocument> = parsed.into_iter().map(|(_, r)| r.unwrap()).collect();
        assert_eq!(docs[0].kind, ObjectKind::Tenant);
        assert_eq!(docs[1].spec["tenant"], serde_json::json!("acme"));
        assert_eq!(docs[2].kind, ObjectKind::Filter);
        assert_eq!(docs[2].namespace, "prod");
    }

    #[test]
    fn kind_lookup_is_lenient_about_case_and_separators() {
        for raw in ["bridge-domain", "BridgeDomain", "bridge_domain", " BRIDGE-DOMAIN "] {
            assert_eq!(lookup_kind(raw), Some(ObjectKind::BridgeDomain), "{raw}");
        }
        assert_eq!(lookup_kind("widget"), None);
    }

    fn block(text: &str) -> RawBlock {
        RawBlock {
            index: 4,
            line: 10,
            text: text.to_string(),
        }
    }

    #[test]
    fn missing_identity_fields_are_reported() {
        let err = parse_block(&block("metadata: {name: a, namespace: b}\n")).unwrap_err();
        assert!(matches!(err, CodecError::MissingField { field: "kind", .. }));

        let err = parse_block(&block("kind: vrf\nmetadata: {name: a}\n")).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MissingField {
                field: "metadata.namespace",
                ..
            }
        ));
        assert!(err.to_string().contains("document 4 (line 10)"));
    }

    #[test]
    fn unknown_kind_and_unexpected_fields_are_rejected() {
        let err =
            parse_block(&block("kind: widget\nmetadata: {name: a, namespace: b}\n")).unwrap_err();
        assert!(matches!(err, CodecError::UnknownKind { .. }));

        let err = parse_block(&block(
            "kind: vrf\nmetadata: {name: a, namespace: b}\nstatus: {}\n",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("unexpected field 'status'"));
    }

    #[test]
    fn path_unsafe_names_are_rejected() {
        let err =
            parse_block(&block("kind: vrf\nmetadata: {name: ../x, namespace: b}\n")).unwrap_err();
        assert!(matches!(err, CodecError::InvalidIdentity { .. }));
    }

    #[test]
    fn namespace_named_like_a_canonical_file_is_rejected() {
        let err = parse_block(&block(
            "kind: vrf\nmetadata: {name: x, namespace: web.yaml}\n",
        ))
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidIdentity { .. }));

        let doc = parse_block(&block(
            "kind: vrf\nmetadata: {name: web.yaml, namespace: default}\n",
        ))
        .unwrap();
        assert_eq!(doc.name, "web.yaml");
    }

    #[test]
    fn reference_shapes_are_checked() {
        let err = parse_block(&block(
            "kind: contract\nmetadata: {name: c, namespace: b}\nspec: {filters: http}\n",
        ))
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidReference { .. }));

        let err = parse_block(&block(
            "kind: subnet\nmetadata: {name: s, namespace: b}\nspec: {bridge_domain: 7}\n",
        ))
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidReference { .. }));

        let ok = parse_block(&block(
            "kind: contract\nmetadata: {name: c, namespace: b}\nspec: {filters: [http, ssh]}\n",
        ));
        assert!(ok.is_ok());
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = parse_block(&block("kind: [unclosed\n")).unwrap_err();
        assert!(matches!(err, CodecError::Parse { .. }));
        let err = parse_block(&block("- just\n- a list\n")).unwrap_err();
        assert!(matches!(err, CodecError::Parse { .. }));
    }

    #[test]
    fn json_documents_are_accepted() {
        let doc = parse_block(&block(
            r#"{"kind": "tenant", "metadata": {"name": "acme", "namespace": "default"}, "spec": {"description": "x"}}"#,
        ))
        .unwrap();
        assert_eq!(doc.kind, ObjectKind::Tenant);
        assert_eq!(doc.spec.len(), 1);
    }
}
