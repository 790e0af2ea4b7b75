//! The three-pass archive writer (§4.7): serialize each image, lay out the
//! directory tree, then emit a byte-exact `PKG1` archive.

use std::collections::HashMap;

use crate::encryption::Keystream;
use crate::error::{Error, Result};
use crate::property::write_property_list;
use crate::reader::{SharedBuffer, encrypted_offset_mask};
use crate::tree::{NodeData, NodeId, Tag, Tree};
use crate::version::{self, Variant};
use crate::writer::{ByteWriter, EntryKind, EntryNameCache, PropertyStringCache};

const MAGIC: &[u8; 4] = b"PKG1";

/// Regional variant and patch version an archive is (re-)written under.
/// 64-bit-layout archives are read-only; `repack_archive` always emits the
/// classic form (§1 Non-goals).
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub variant: Variant,
    pub patch_version: u16,
}

/// The layout parameters of a previously parsed archive, supplied so the
/// writer's verbatim fast path can reuse unmodified image bytes (§4.7
/// "Fast-path correctness"). Pass [`crate::archive::Archive::buffer`],
/// `data_start`, and `version_hash` from the parse this tree came from.
#[derive(Debug, Clone, Copy)]
pub struct OriginalLayout<'a> {
    pub buffer: &'a SharedBuffer,
    pub data_start: usize,
    pub version_hash: u32,
}

/// Serializes `tree` into a fresh archive byte buffer.
///
/// When `original` is supplied and its layout parameters (`data_start`,
/// `version_hash`) match what `options` would produce, any image whose node
/// is unmodified and still carries its parse-time provenance is copied
/// verbatim rather than re-serialized from the tree. A mismatch is an error
/// rather than a silent downgrade, since copying bytes encrypted or offset
/// under one layout into an archive declaring another would corrupt them
/// (§6.4 `MismatchedLayoutParameters`).
pub fn repack_archive(
    tree: &Tree,
    options: WriteOptions,
    original: Option<OriginalLayout<'_>>,
) -> Result<Vec<u8>> {
    let root = tree.root.ok_or_else(|| Error::decode(0, "tree has no root"))?;

    let data_start = header_data_start();
    let version_hash = version::version_hash(options.patch_version);

    let fast_path = match original {
        Some(o) => {
            if o.data_start != data_start || o.version_hash != version_hash {
                return Err(Error::MismatchedLayoutParameters);
            }
            Some(o.buffer)
        }
        None => None,
    };

    let keystream = Keystream::new(options.variant.iv());

    // Pass 1: serialize (or verbatim-copy) every image, independently of
    // where it will finally land in the archive.
    let mut images: HashMap<NodeId, ImageBytes> = HashMap::new();
    serialize_images(tree, root, fast_path, &keystream, &mut images)?;

    // Pass 2: lay out the directory tree. Each directory's own entry-list
    // buffer is built bottom-up (children's sizes are needed to encode their
    // entry in the parent) using one shared, never-cleared name cache, with
    // the per-entry "encrypted offset" field left as a 0 placeholder until
    // every directory's and image's absolute position is known.
    let mut entry_cache: EntryNameCache<NodeId> = EntryNameCache::new();
    let mut dir_buffers: HashMap<NodeId, DirBuffer> = HashMap::new();
    collect_dir_buffers(tree, root, &mut entry_cache, &keystream, &images, &mut dir_buffers);

    let root_start = data_start + 2;
    let mut cursor = root_start;
    let mut dir_order = Vec::new();
    let mut dir_positions = HashMap::new();
    assign_dir_positions(tree, root, &dir_buffers, &mut cursor, &mut dir_order, &mut dir_positions);

    let mut image_order = Vec::new();
    let mut image_positions = HashMap::new();
    assign_image_positions(tree, root, &images, &mut cursor, &mut image_order, &mut image_positions);

    // Pass 3: emit the header, then every directory block, then every
    // image's bytes, patching each deferred offset once its target's
    // absolute position is known.
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&(data_start as u32).to_le_bytes());
    out.extend_from_slice(version::COPYRIGHT.as_bytes());
    out.push(0);
    out.resize(data_start, 0);
    out.extend_from_slice(&(version::version_header_byte(version_hash) as u16).to_le_bytes());
    debug_assert_eq!(out.len(), root_start);

    for &id in &dir_order {
        out.extend_from_slice(&dir_buffers[&id].bytes);
    }
    for &id in &image_order {
        out.extend_from_slice(&images[&id].bytes);
    }

    for &id in &dir_order {
        let base = dir_positions[&id];
        for &(patch_pos, ref target) in &dir_buffers[&id].offset_patches {
            let target_abs = match target {
                OffsetTarget::Image(img) => image_positions[img],
                OffsetTarget::Dir(d) => dir_positions[d],
            };
            patch_encrypted_offset(&mut out, base + patch_pos, target_abs, data_start, version_hash);
        }
    }

    for (producing_dir, patch_pos, target_dir, target_offset) in entry_cache.take_patches() {
        let patch_abs = dir_positions[&producing_dir] + patch_pos;
        let target_abs = dir_positions[&target_dir] + target_offset;
        patch_plain_offset(&mut out, patch_abs, target_abs, data_start);
    }

    for &id in &image_order {
        let base = image_positions[&id];
        for &(patch_pos, target_offset) in &images[&id].patches {
            let target_abs = base + target_offset;
            patch_plain_offset(&mut out, base + patch_pos, target_abs, data_start);
        }
    }

    let total_len = out.len();
    let file_size = (total_len - data_start) as u64;
    out[4..12].copy_from_slice(&file_size.to_le_bytes());

    Ok(out)
}

fn header_data_start() -> usize {
    16 + version::COPYRIGHT.len() + 1
}

fn patch_encrypted_offset(out: &mut [u8], field_pos: usize, target_abs: usize, data_start: usize, version_hash: u32) {
    let mask = encrypted_offset_mask(field_pos, data_start, version_hash);
    let rel = (target_abs as u32).wrapping_sub(2u32.wrapping_mul(data_start as u32));
    out[field_pos..field_pos + 4].copy_from_slice(&(mask ^ rel).to_le_bytes());
}

fn patch_plain_offset(out: &mut [u8], field_pos: usize, target_abs: usize, data_start: usize) {
    let rel = target_abs as i32 - data_start as i32;
    out[field_pos..field_pos + 4].copy_from_slice(&rel.to_le_bytes());
}

struct ImageBytes {
    bytes: Vec<u8>,
    checksum: i32,
    /// `(patch position in `bytes`, intra-image target offset)` pairs from
    /// this image's own [`PropertyStringCache`], empty for a verbatim copy.
    patches: Vec<(usize, usize)>,
}

fn serialize_images(
    tree: &Tree,
    node: NodeId,
    fast_path: Option<&SharedBuffer>,
    keystream: &Keystream,
    out: &mut HashMap<NodeId, ImageBytes>,
) -> Result<()> {
    for &child in &tree.get(node).children {
        match tree.get(child).tag() {
            Tag::Image => {
                let bytes = serialize_one_image(tree, child, fast_path, keystream)?;
                out.insert(child, bytes);
            }
            Tag::Dir => serialize_images(tree, child, fast_path, keystream, out)?,
            _ => {}
        }
    }
    Ok(())
}

fn serialize_one_image(
    tree: &Tree,
    image_id: NodeId,
    fast_path: Option<&SharedBuffer>,
    keystream: &Keystream,
) -> Result<ImageBytes> {
    let node = tree.get(image_id);
    let NodeData::Image { provenance } = &node.data else {
        unreachable!("image node must carry NodeData::Image")
    };

    if !node.modified {
        if let (Some(p), Some(orig)) = (provenance, fast_path) {
            if std::sync::Arc::ptr_eq(&p.buffer, orig) {
                let bytes = p.buffer[p.offset..p.offset + p.length].to_vec();
                let checksum = checksum_of(&bytes);
                return Ok(ImageBytes { bytes, checksum, patches: Vec::new() });
            }
        }
    }

    let mut w = ByteWriter::new();
    w.write_u8(0x73);
    w.write_encrypted_string("Property", keystream);
    w.write_u16(0);
    let mut cache = PropertyStringCache::new();
    write_property_list(&mut w, tree, image_id, keystream, &mut cache)?;
    let patches = cache.take_patches();
    let bytes = w.into_bytes();
    let checksum = checksum_of(&bytes);
    Ok(ImageBytes { bytes, checksum, patches })
}

/// The byte-sum-modulo-2^31 checksum written alongside each directory entry
/// (§4.7 Pass 1). Not verified by any reader in this crate; kept for
/// fidelity with the format.
fn checksum_of(bytes: &[u8]) -> i32 {
    let sum: i64 = bytes.iter().map(|&b| b as i64).sum();
    (sum % (1i64 << 31)) as i32
}

enum OffsetTarget {
    Image(NodeId),
    Dir(NodeId),
}

struct DirBuffer {
    bytes: Vec<u8>,
    offset_patches: Vec<(usize, OffsetTarget)>,
}

fn collect_dir_buffers(
    tree: &Tree,
    node: NodeId,
    entry_cache: &mut EntryNameCache<NodeId>,
    keystream: &Keystream,
    images: &HashMap<NodeId, ImageBytes>,
    out: &mut HashMap<NodeId, DirBuffer>,
) {
    let children = tree.get(node).children.clone();
    let img_children: Vec<NodeId> = children.iter().copied().filter(|&c| tree.get(c).tag() == Tag::Image).collect();
    let dir_children: Vec<NodeId> = children.iter().copied().filter(|&c| tree.get(c).tag() == Tag::Dir).collect();

    for &d in &dir_children {
        collect_dir_buffers(tree, d, entry_cache, keystream, images, out);
    }

    let mut w = ByteWriter::new();
    w.write_compressed_int((img_children.len() + dir_children.len()) as i32);
    let mut offset_patches = Vec::new();

    for &img in &img_children {
        let name = tree.get(img).name.clone();
        entry_cache.write(&mut w, EntryKind::Image, &name, keystream, node);
        w.write_compressed_int(images[&img].bytes.len() as i32);
        w.write_compressed_int(images[&img].checksum);
        let patch_pos = w.pos();
        w.write_u32(0);
        offset_patches.push((patch_pos, OffsetTarget::Image(img)));
    }
    for &d in &dir_children {
        let name = tree.get(d).name.clone();
        entry_cache.write(&mut w, EntryKind::Dir, &name, keystream, node);
        w.write_compressed_int(out[&d].bytes.len() as i32);
        w.write_compressed_int(0);
        let patch_pos = w.pos();
        w.write_u32(0);
        offset_patches.push((patch_pos, OffsetTarget::Dir(d)));
    }

    out.insert(node, DirBuffer { bytes: w.into_bytes(), offset_patches });
}

fn assign_dir_positions(
    tree: &Tree,
    node: NodeId,
    buffers: &HashMap<NodeId, DirBuffer>,
    cursor: &mut usize,
    order: &mut Vec<NodeId>,
    positions: &mut HashMap<NodeId, usize>,
) {
    positions.insert(node, *cursor);
    order.push(node);
    *cursor += buffers[&node].bytes.len();
    for &c in &tree.get(node).children {
        if tree.get(c).tag() == Tag::Dir {
            assign_dir_positions(tree, c, buffers, cursor, order, positions);
        }
    }
}

fn assign_image_positions(
    tree: &Tree,
    node: NodeId,
    images: &HashMap<NodeId, ImageBytes>,
    cursor: &mut usize,
    order: &mut Vec<NodeId>,
    positions: &mut HashMap<NodeId, usize>,
) {
    for &c in &tree.get(node).children {
        match tree.get(c).tag() {
            Tag::Image => {
                positions.insert(c, *cursor);
                order.push(c);
                *cursor += images[&c].bytes.len();
            }
            Tag::Dir => assign_image_positions(tree, c, images, cursor, order, positions),
            _ => {}
        }
    }
}
