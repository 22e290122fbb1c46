//! # trellis-codec
//!
//! Turns arbitrarily-shaped multi-document input into typed objects of the
//! closed kind taxonomy, and renders objects back to their canonical file
//! form.
//!
//! ```rust,no_run
//! use trellis_codec::{parse_documents, render_with_hash};
//!
//! fn normalize(input: &str) {
//!     for (block, parsed) in parse_documents(input) {
//!         match parsed.and_then(|doc| render_with_hash(&doc)) {
//!             Ok((text, hash)) => println!("block {}: {} bytes, {hash}", block.index, text.len()),
//!             Err(e) => eprintln!("{e}"),
//!         }
//!     }
//! }
//! ```

pub mod canonical;
pub mod document;
pub mod error;

pub use canonical::{content_hash, parse_canonical, render_canonical, render_with_hash};
pub use document::{lookup_kind, parse_block, parse_documents, split_documents, RawBlock};
pub use error::CodecError;
