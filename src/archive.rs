//! Fixed header parsing, encryption/patch-version auto-detection, and the
//! directory walk that builds a tree's `dir`/`image` skeleton (§4.4).

use std::sync::Arc;

use crate::diagnostics::{Diagnostics, WarnKind};
use crate::encryption::Keystream;
use crate::error::{Error, Result};
use crate::reader::{BinaryReader, SharedBuffer};
use crate::tree::{ImageProvenance, NodeData, NodeId, Tag, Tree};
use crate::version::{self, Variant};

const MAGIC: &[u8; 4] = b"PKG1";

/// Hints that skip auto-detection when the caller already knows them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParseOptions {
    pub variant: Option<Variant>,
    pub patch_version: Option<u16>,
}

/// A parsed archive: its tree, and the layout parameters the fast-path
/// writer must match to reuse unmodified image bytes verbatim (§4.7,
/// "Fast-path correctness").
pub struct Archive {
    pub tree: Tree,
    pub buffer: SharedBuffer,
    pub variant: Variant,
    pub patch_version: u16,
    pub data_start: usize,
    pub version_hash: u32,
    stats: Option<Stats>,
}

/// Archive-level summary counts, computed once and cached (SPEC_FULL §F.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub dir_count: usize,
    pub image_count: usize,
    pub node_count: usize,
}

impl Archive {
    /// Directory, image, and total-node counts across the whole tree, walked
    /// once and cached on first call.
    pub fn stats(&mut self) -> Stats {
        if let Some(stats) = self.stats {
            return stats;
        }
        let Some(root) = self.tree.root else {
            return Stats::default();
        };
        let mut stats = Stats::default();
        for id in self.tree.descendants(root) {
            stats.node_count += 1;
            match self.tree.get(id).tag() {
                Tag::Dir => stats.dir_count += 1,
                Tag::Image => stats.image_count += 1,
                _ => {}
            }
        }
        self.stats = Some(stats);
        stats
    }
}

/// Parses `bytes` into an [`Archive`], auto-detecting regional variant and
/// patch version unless `options` supplies them (§4.4).
pub fn parse_archive(
    bytes: Vec<u8>,
    options: ParseOptions,
    diagnostics: &impl Diagnostics,
) -> Result<Archive> {
    let buffer: SharedBuffer = Arc::from(bytes.into_boxed_slice());
    if buffer.len() < 16 || &buffer[0..4] != MAGIC {
        return Err(Error::malformed("missing \"PKG1\" magic"));
    }
    let data_start = u32::from_le_bytes(buffer[12..16].try_into().unwrap()) as usize;
    if data_start > buffer.len() {
        return Err(Error::malformed("data-section start past end of buffer"));
    }

    let header_tag = read_header_tag(&buffer, data_start)?;

    let single;
    let variants: &[Variant] = match options.variant {
        Some(v) => {
            single = [v];
            &single
        }
        None => &Variant::ALL,
    };

    for &variant in variants {
        let candidates: Box<dyn Iterator<Item = u16>> = match options.patch_version {
            Some(v) => Box::new(std::iter::once(v)),
            None if header_tag.is_64bit => Box::new(version::CANDIDATE_VERSIONS_64BIT),
            None => Box::new(version::candidate_versions_classic()),
        };

        for patch_version in candidates {
            let hash = version::version_hash(patch_version);
            if !header_tag.is_64bit {
                let expected = version::version_header_byte(hash);
                if expected != header_tag.version_header as u8 {
                    continue;
                }
            }

            let keystream = Arc::new(Keystream::new(variant.iv()));
            let root_start = data_start + if header_tag.is_64bit { 0 } else { 2 };
            let mut tree = Tree::new();
            let root = tree.insert("", NodeData::File);
            tree.root = Some(root);

            let mut reader = BinaryReader::new(buffer.clone(), root_start, keystream, data_start, hash);
            match parse_directory(&mut reader, &mut tree, root, diagnostics) {
                Ok(()) if directory_plausible(&tree, root, &reader) => {
                    return Ok(Archive {
                        tree,
                        buffer,
                        variant,
                        patch_version,
                        data_start,
                        version_hash: hash,
                        stats: None,
                    });
                }
                _ => continue,
            }
        }
    }

    Err(Error::VersionDetectionFailed)
}

struct HeaderTag {
    is_64bit: bool,
    version_header: u16,
}

fn read_header_tag(buffer: &[u8], data_start: usize) -> Result<HeaderTag> {
    if data_start + 2 > buffer.len() {
        return Err(Error::TruncatedInput { at: data_start });
    }
    let probe = u16::from_le_bytes(buffer[data_start..data_start + 2].try_into().unwrap());
    if probe > 0xFF {
        return Ok(HeaderTag {
            is_64bit: true,
            version_header: version::SYNTHETIC_VERSION_HEADER_64BIT,
        });
    }
    if probe == 0x80 && data_start + 4 <= buffer.len() {
        let wide = i32::from_le_bytes(buffer[data_start..data_start + 4].try_into().unwrap());
        if (wide & 0xFF) == 0 && (0..=0xFFFF).contains(&wide) {
            return Ok(HeaderTag {
                is_64bit: true,
                version_header: version::SYNTHETIC_VERSION_HEADER_64BIT,
            });
        }
    }
    Ok(HeaderTag {
        is_64bit: false,
        version_header: probe,
    })
}

/// At least half the printable characters in every decoded directory-entry
/// name must be printable ASCII, the walk itself must not have errored, and
/// the first image entry (if any) must point to a byte that is one of
/// `{0x1B, 0x73}`, for a variant/version candidate to be provisionally
/// accepted (§4.4).
fn directory_plausible(tree: &Tree, root: NodeId, reader: &BinaryReader) -> bool {
    for id in tree.descendants(root) {
        let node = tree.get(id);
        if !matches!(node.tag(), Tag::Dir | Tag::Image) {
            continue;
        }
        if node.name.is_empty() {
            continue;
        }
        let printable = node
            .name
            .chars()
            .filter(|c| (' '..='~').contains(c))
            .count();
        if printable * 2 < node.name.chars().count() {
            return false;
        }
    }

    let first_image = tree
        .descendants(root)
        .find(|&id| tree.get(id).tag() == Tag::Image);
    if let Some(id) = first_image {
        let NodeData::Image { provenance: Some(p) } = &tree.get(id).data else {
            return true;
        };
        match reader.buffer().get(p.offset) {
            Some(0x1B | 0x73) => {}
            _ => return false,
        }
    }
    true
}

/// Reads one directory block at the reader's current position, inserting a
/// `dir` or `image` child of `parent` for each entry and recursing into
/// subdirectories (§4.4).
fn parse_directory(
    reader: &mut BinaryReader,
    tree: &mut Tree,
    parent: NodeId,
    diagnostics: &impl Diagnostics,
) -> Result<()> {
    let count = reader.read_compressed_int()?;
    let mut to_walk = Vec::new();

    for _ in 0..count {
        let at = reader.pos();
        let discriminator = reader.read_u8()?;
        let (name, is_dir) = match discriminator {
            1 => {
                reader.skip(4)?;
                reader.skip(2)?;
                reader.read_encrypted_offset()?;
                diagnostics.warn(WarnKind::DroppedDirectoryEntry { at });
                continue;
            }
            2 => {
                let rel = reader.read_i32()?;
                let target = reader.data_start + rel as usize;
                let name = reader.with_position_at(target, |r| {
                    r.skip(1)?;
                    r.read_encrypted_string()
                })?;
                let is_img = name.to_ascii_lowercase().ends_with(".img");
                (name, !is_img)
            }
            3 => (reader.read_encrypted_string()?, true),
            4 => (reader.read_encrypted_string()?, false),
            other => {
                diagnostics.warn(WarnKind::UnrecognizedDirectoryDiscriminator {
                    discriminator: other,
                    at,
                });
                continue;
            }
        };

        let size = reader.read_compressed_int()?;
        let checksum = reader.read_compressed_int()?;
        let offset = reader.read_encrypted_offset()?;
        let _ = checksum;

        if is_dir {
            let node = tree.insert(name, NodeData::Dir);
            tree.append(parent, node);
            to_walk.push((node, offset as usize));
        } else {
            let node = tree.insert(
                name,
                NodeData::Image {
                    provenance: Some(ImageProvenance {
                        buffer: reader.buffer().clone(),
                        keystream: reader.keystream().clone(),
                        data_start: reader.data_start,
                        version_hash: reader.version_hash,
                        offset: offset as usize,
                        length: size.max(0) as usize,
                    }),
                },
            );
            tree.append(parent, node);
        }
    }

    for (node, offset) in to_walk {
        reader.with_position_at(offset, |r| parse_directory(r, tree, node, diagnostics))?;
    }
    Ok(())
}

/// Populates `image_node`'s property tree from its lazy provenance, if it
/// has not been populated already (§6.1 `parse_image`, idempotent).
pub fn parse_image(
    tree: &mut Tree,
    image_node: NodeId,
    diagnostics: &impl Diagnostics,
) -> Result<()> {
    if !tree.get(image_node).children.is_empty() {
        return Ok(());
    }
    let NodeData::Image { provenance } = &tree.get(image_node).data else {
        return Ok(());
    };
    let Some(provenance) = provenance.clone() else {
        return Ok(());
    };

    let mut reader = BinaryReader::new(
        provenance.buffer,
        provenance.offset,
        provenance.keystream,
        provenance.data_start,
        provenance.version_hash,
    );
    let tag = reader.read_u8()?;
    if tag == 0x01 {
        // Lua-flavored image; explicitly out of scope (§1 Non-goals).
        return Ok(());
    }
    let _name = reader.read_string_or_offset_block()?;
    reader.skip(2)?;
    crate::property::parse_property_list(&mut reader, tree, image_node, diagnostics)
}
