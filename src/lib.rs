//! A parser, pixel/sound codec, and writer for MapleStory's WZ archive
//! format, written in pure Rust.
//!
//! A WZ archive is an AES-keystream-obfuscated container holding a tree of
//! directories and "images" — each image a nested property list of typed
//! primitives, vectors, embedded bitmaps ("canvas"), and sounds. This crate
//! parses that header/directory/property structure, decodes the seven
//! packed pixel formats a canvas may carry, extracts sound payloads, and
//! (with the `write` feature) re-emits a tree as a byte-exact archive.
//!
//! ## Supported
//!
//! | Capability                          | Read | Write |
//! |--------------------------------------|------|-------|
//! | Header / directory walk               | ✓    | ✓     |
//! | Property-list parsing                 | ✓    | ✓     |
//! | Canvas pixel decode (7 formats)        | ✓    | ✓     |
//! | Sound extraction                       | ✓    |       |
//! | XML projection (`xml` feature)         | ✓    |       |
//!
//! 64-bit-layout archives are read-only; the writer always emits the classic
//! form (§1 Non-goals).
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

mod archive;
#[cfg(feature = "write")]
mod archive_writer;
mod diagnostics;
mod encryption;
mod error;
mod pixel;
mod property;
mod reader;
mod sound;
mod tree;
mod version;
mod writer;
#[cfg(feature = "xml")]
mod xml;

pub use archive::{Archive, ParseOptions, Stats, parse_archive, parse_image};
#[cfg(feature = "write")]
pub use archive_writer::{OriginalLayout, WriteOptions, repack_archive};
pub use diagnostics::{Diagnostics, NullDiagnostics, WarnKind};
pub use error::Error;
pub use pixel::decode_canvas;
#[cfg(feature = "write")]
pub use pixel::compress_canvas;
pub use reader::SharedBuffer;
pub use sound::{Mime, extract_sound, sniff_mime};
pub use tree::{
    CanvasProvenance, Descendants, ImageProvenance, Node, NodeData, NodeId, PixelFormat,
    SoundProvenance, Tag, Tree,
};
pub use version::Variant;
#[cfg(feature = "xml")]
pub use xml::{PngEncoder, serialize_xml};
