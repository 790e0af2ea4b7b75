//! The recursive property-list parser (§4.3): reads a tag stream of
//! primitives and extended types into [`Tree`] nodes under a given parent.

use crate::diagnostics::{Diagnostics, WarnKind};
use crate::error::{Error, Result};
use crate::reader::BinaryReader;
use crate::tree::{CanvasProvenance, NodeData, NodeId, PixelFormat, SoundProvenance, Tree};

/// Parses a property list (a compressed-int count followed by that many
/// entries) from `reader`'s current position, inserting each entry as a
/// child of `parent`.
pub fn parse_property_list(
    reader: &mut BinaryReader,
    tree: &mut Tree,
    parent: NodeId,
    diagnostics: &impl Diagnostics,
) -> Result<()> {
    let count = reader.read_compressed_int()?;
    for _ in 0..count {
        parse_property_entry(reader, tree, parent, diagnostics)?;
    }
    Ok(())
}

fn parse_property_entry(
    reader: &mut BinaryReader,
    tree: &mut Tree,
    parent: NodeId,
    diagnostics: &impl Diagnostics,
) -> Result<()> {
    let name = reader.read_string_or_offset_block()?;
    let tag = reader.read_u8()?;
    match tag {
        0 => insert_leaf(tree, parent, name, NodeData::Null),
        2 | 11 => {
            let v = reader.read_i16()?;
            insert_leaf(tree, parent, name, NodeData::Short(v));
        }
        3 | 19 => {
            let v = reader.read_compressed_int()?;
            insert_leaf(tree, parent, name, NodeData::Int(v));
        }
        4 => {
            let flag = reader.read_u8()?;
            let v = if flag == 0x80 { reader.read_f32()? } else { 0.0 };
            insert_leaf(tree, parent, name, NodeData::Float(v));
        }
        5 => {
            let v = reader.read_f64()?;
            insert_leaf(tree, parent, name, NodeData::Double(v));
        }
        8 => {
            let s = reader.read_string_or_offset_block()?;
            insert_leaf(tree, parent, name, NodeData::String(s));
        }
        9 => {
            let at = reader.pos();
            let block_len = reader.read_u32()? as usize;
            let end = reader.pos() + block_len;
            let type_name = reader.read_string_or_offset_block()?;
            dispatch_extended(reader, tree, parent, name, &type_name, diagnostics, at)?;
            reader.seek(end);
        }
        20 => {
            let v = reader.read_compressed_long()?;
            insert_leaf(tree, parent, name, NodeData::Long(v));
        }
        other => return Err(Error::decode(reader.pos(), format!("unknown property tag 0x{other:02x}"))),
    }
    Ok(())
}

fn insert_leaf(tree: &mut Tree, parent: NodeId, name: String, data: NodeData) {
    let node = tree.insert(name, data);
    tree.append(parent, node);
}

/// Builds the node (or nodes) an extended type name selects, per the
/// dispatch table in §4.3. Shared between tag-9 entries (which read the type
/// name themselves after a length prefix) and convex children (which read
/// it the same way but with no length prefix).
fn dispatch_extended(
    reader: &mut BinaryReader,
    tree: &mut Tree,
    parent: NodeId,
    name: String,
    type_name: &str,
    diagnostics: &impl Diagnostics,
    at: usize,
) -> Result<()> {
    match type_name {
        "Property" => {
            reader.skip(2)?;
            let node = tree.insert(name, NodeData::Sub);
            tree.append(parent, node);
            parse_property_list(reader, tree, node, diagnostics)?;
        }
        "Canvas" => {
            reader.skip(1)?;
            let has_children = reader.read_u8()? == 1;
            let node = tree.insert(
                name,
                NodeData::Canvas {
                    width: 0,
                    height: 0,
                    format: PixelFormat::Unknown(0),
                    provenance: None,
                    decoded: None,
                },
            );
            tree.append(parent, node);
            if has_children {
                reader.skip(2)?;
                parse_property_list(reader, tree, node, diagnostics)?;
            }

            let width = reader.read_compressed_int()? as u32;
            let height = reader.read_compressed_int()? as u32;
            let format_low = reader.read_compressed_int()? as u32;
            let format_high = reader.read_compressed_int()? as u32;
            let format = PixelFormat::from_id(format_low | (format_high << 8));
            reader.skip(4)?;
            let raw_len = reader.read_i32()?;
            let length = (raw_len - 1).max(0) as usize;
            reader.skip(1)?;
            let offset = reader.pos();
            reader.skip(length)?;

            if matches!(format, PixelFormat::Unknown(_)) {
                diagnostics.warn(WarnKind::UnknownPixelFormat { format: format.id() });
            }
            if let NodeData::Canvas {
                width: w,
                height: h,
                format: f,
                provenance,
                ..
            } = &mut tree.get_mut(node).data
            {
                *w = width;
                *h = height;
                *f = format;
                *provenance = Some(CanvasProvenance {
                    buffer: reader.buffer().clone(),
                    offset,
                    length,
                });
            }
        }
        "Shape2D#Vector2D" => {
            let x = reader.read_compressed_int()?;
            let y = reader.read_compressed_int()?;
            let node = tree.insert(name, NodeData::Vector { x, y });
            tree.append(parent, node);
        }
        "Shape2D#Convex2D" => {
            let node = tree.insert(name, NodeData::Convex);
            tree.append(parent, node);
            let count = reader.read_compressed_int()?;
            for _ in 0..count {
                let child_at = reader.pos();
                let child_type = reader.read_string_or_offset_block()?;
                dispatch_extended(reader, tree, node, String::new(), &child_type, diagnostics, child_at)?;
            }
        }
        "Sound_DX8" => {
            reader.skip(1)?;
            let data_len = reader.read_compressed_int()? as usize;
            let duration_ms = reader.read_compressed_int()?;
            let header_offset = reader.pos();
            reader.skip(51)?;
            let ext_len = reader.read_u8()? as usize;
            reader.skip(ext_len)?;
            let header_len = reader.pos() - header_offset;
            let data_offset = reader.pos();
            reader.skip(data_len)?;
            let node = tree.insert(
                name,
                NodeData::Sound {
                    duration_ms,
                    provenance: Some(SoundProvenance {
                        buffer: reader.buffer().clone(),
                        header_offset,
                        header_len,
                        data_offset,
                        data_len,
                    }),
                },
            );
            tree.append(parent, node);
        }
        "UOL" => {
            reader.skip(1)?;
            let target = reader.read_string_or_offset_block()?;
            let node = tree.insert(name, NodeData::Uol(target));
            tree.append(parent, node);
        }
        other => {
            diagnostics.warn(WarnKind::UnknownExtendedType {
                name: other.to_string(),
                at,
            });
        }
    }
    Ok(())
}

#[cfg(feature = "write")]
mod write {
    use super::*;
    use crate::encryption::Keystream;
    use crate::pixel;
    use crate::tree::CanvasProvenance;
    use crate::writer::{ByteWriter, PropertyStringCache};

    /// The mirror of [`parse_property_list`]: serializes `node`'s children as
    /// a property list (§4.7 Pass 1). Every string write — names, string
    /// values, extended type names, UOL targets — goes through `cache` so
    /// repeats within this image are interned exactly as §4.7.1 describes.
    pub fn write_property_list(
        w: &mut ByteWriter,
        tree: &Tree,
        node: NodeId,
        keystream: &Keystream,
        cache: &mut PropertyStringCache,
    ) -> Result<()> {
        let children = tree.get(node).children.clone();
        w.write_compressed_int(children.len() as i32);
        for child in children {
            write_property_entry(w, tree, child, keystream, cache)?;
        }
        Ok(())
    }

    fn write_property_entry(
        w: &mut ByteWriter,
        tree: &Tree,
        node: NodeId,
        keystream: &Keystream,
        cache: &mut PropertyStringCache,
    ) -> Result<()> {
        let n = tree.get(node);
        cache.write(w, &n.name, keystream);
        match &n.data {
            NodeData::Null => w.write_u8(0),
            NodeData::Short(v) => {
                w.write_u8(2);
                w.write_i16(*v);
            }
            NodeData::Int(v) => {
                w.write_u8(3);
                w.write_compressed_int(*v);
            }
            NodeData::Float(v) => {
                w.write_u8(4);
                if *v == 0.0 {
                    w.write_u8(0);
                } else {
                    w.write_u8(0x80);
                    w.write_f32(*v);
                }
            }
            NodeData::Double(v) => {
                w.write_u8(5);
                w.write_f64(*v);
            }
            NodeData::String(s) => {
                w.write_u8(8);
                cache.write(w, s, keystream);
            }
            NodeData::Long(v) => {
                w.write_u8(20);
                w.write_compressed_long(*v);
            }
            NodeData::Sub
            | NodeData::Canvas { .. }
            | NodeData::Vector { .. }
            | NodeData::Convex
            | NodeData::Sound { .. }
            | NodeData::Uol(_) => {
                w.write_u8(9);
                let len_pos = w.pos();
                w.write_u32(0);
                let body_start = w.pos();
                write_extended_body(w, tree, node, keystream, cache)?;
                let len = (w.pos() - body_start) as u32;
                w.patch_u32(len_pos, len);
            }
            NodeData::File | NodeData::Dir | NodeData::Image { .. } => {
                return Err(Error::decode(w.pos(), "file/dir/image cannot appear in a property list"));
            }
        }
        Ok(())
    }

    /// The mirror of `dispatch_extended`: writes an extended type's name and
    /// body. Shared between tag-9 entries and convex children, which write
    /// the same shape with no enclosing length prefix.
    fn write_extended_body(
        w: &mut ByteWriter,
        tree: &Tree,
        node: NodeId,
        keystream: &Keystream,
        cache: &mut PropertyStringCache,
    ) -> Result<()> {
        match &tree.get(node).data {
            NodeData::Sub => {
                cache.write(w, "Property", keystream);
                w.write_u16(0);
                write_property_list(w, tree, node, keystream, cache)?;
            }
            NodeData::Canvas {
                width,
                height,
                format,
                provenance,
                decoded,
            } => {
                cache.write(w, "Canvas", keystream);
                w.write_u8(0);
                let has_children = !tree.get(node).children.is_empty();
                w.write_u8(if has_children { 1 } else { 0 });
                if has_children {
                    w.write_u16(0);
                    write_property_list(w, tree, node, keystream, cache)?;
                }
                w.write_compressed_int(*width as i32);
                w.write_compressed_int(*height as i32);
                let id = format.id();
                w.write_compressed_int((id & 0xFF) as i32);
                w.write_compressed_int((id >> 8) as i32);
                w.write_u32(0);
                let payload = canvas_payload(tree, node, provenance, decoded, *width, *height, *format)?;
                w.write_i32(payload.len() as i32 + 1);
                w.write_u8(0x78);
                w.write_bytes(&payload);
            }
            NodeData::Vector { x, y } => {
                cache.write(w, "Shape2D#Vector2D", keystream);
                w.write_compressed_int(*x);
                w.write_compressed_int(*y);
            }
            NodeData::Convex => {
                cache.write(w, "Shape2D#Convex2D", keystream);
                let children = tree.get(node).children.clone();
                w.write_compressed_int(children.len() as i32);
                for child in children {
                    write_extended_body(w, tree, child, keystream, cache)?;
                }
            }
            NodeData::Sound { duration_ms, provenance } => {
                cache.write(w, "Sound_DX8", keystream);
                w.write_u8(0);
                let Some(provenance) = provenance else {
                    return Err(Error::CanvasPayloadMissing);
                };
                let data = provenance.buffer[provenance.data_offset..provenance.data_offset + provenance.data_len].to_vec();
                let header = provenance.buffer[provenance.header_offset..provenance.header_offset + provenance.header_len].to_vec();
                w.write_compressed_int(data.len() as i32);
                w.write_compressed_int(*duration_ms);
                w.write_bytes(&header);
                w.write_bytes(&data);
            }
            NodeData::Uol(target) => {
                cache.write(w, "UOL", keystream);
                w.write_u8(0);
                cache.write(w, target, keystream);
            }
            _ => return Err(Error::decode(w.pos(), "not an extended property type")),
        }
        Ok(())
    }

    /// Picks the bytes to emit for a canvas's compressed pixel payload: the
    /// original deflate stream if the node is unmodified and still has it,
    /// freshly deflated pixels if a host has decoded/edited this canvas, or
    /// an error if neither is available (§4.7 Pass 1, §1 Non-goals).
    fn canvas_payload(
        tree: &Tree,
        node: NodeId,
        provenance: &Option<CanvasProvenance>,
        decoded: &Option<Vec<u8>>,
        width: u32,
        height: u32,
        format: crate::tree::PixelFormat,
    ) -> Result<Vec<u8>> {
        if !tree.get(node).modified {
            if let Some(p) = provenance {
                return Ok(p.buffer[p.offset..p.offset + p.length].to_vec());
            }
        }
        if let Some(rgba) = decoded {
            return Ok(pixel::compress_canvas(rgba, width, height, format));
        }
        if let Some(p) = provenance {
            return Ok(p.buffer[p.offset..p.offset + p.length].to_vec());
        }
        Err(Error::CanvasPayloadMissing)
    }
}

#[cfg(feature = "write")]
pub use write::write_property_list;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::diagnostics::NullDiagnostics;
    use crate::encryption::Keystream;
    use crate::reader::BinaryReader;
    use crate::tree::Tag;
    use crate::version::Variant;
    use crate::writer::ByteWriter;

    fn reader_for(bytes: Vec<u8>) -> BinaryReader {
        let ks = Arc::new(Keystream::new(Variant::Bms.iv()));
        let shared: std::sync::Arc<[u8]> = bytes.into();
        BinaryReader::new(shared, 0, ks, 0, 1)
    }

    #[test]
    fn flat_property_list_with_every_primitive_tag() {
        let ks = Keystream::new(Variant::Bms.iv());
        let mut w = ByteWriter::new();
        w.write_compressed_int(6);

        w.write_encrypted_string("a_null", &ks);
        w.write_u8(0);

        w.write_encrypted_string("a_short", &ks);
        w.write_u8(2);
        w.write_u16(7);

        w.write_encrypted_string("an_int", &ks);
        w.write_u8(3);
        w.write_compressed_int(42);

        w.write_encrypted_string("a_float", &ks);
        w.write_u8(4);
        w.write_u8(0x80);
        w.write_f32(1.5);

        w.write_encrypted_string("a_double", &ks);
        w.write_u8(5);
        w.write_f64(2.25);

        w.write_encrypted_string("a_string", &ks);
        w.write_u8(8);
        w.write_u8(0x73);
        w.write_encrypted_string("hello", &ks);

        let mut reader = reader_for(w.into_bytes());
        let mut tree = Tree::new();
        let root = tree.insert("root", NodeData::Dir);
        parse_property_list(&mut reader, &mut tree, root, &NullDiagnostics).unwrap();

        assert_eq!(tree.get(root).children.len(), 6);
        let short = tree.get_child(root, "a_short").unwrap();
        assert!(matches!(tree.get(short).data, NodeData::Short(7)));
        let int = tree.get_child(root, "an_int").unwrap();
        assert!(matches!(tree.get(int).data, NodeData::Int(42)));
        let float = tree.get_child(root, "a_float").unwrap();
        assert!(matches!(tree.get(float).data, NodeData::Float(v) if v == 1.5));
        let string = tree.get_child(root, "a_string").unwrap();
        assert!(matches!(&tree.get(string).data, NodeData::String(s) if s == "hello"));
    }

    #[test]
    fn unknown_extended_type_warns_and_parsing_resynchronizes() {
        use std::cell::RefCell;

        #[derive(Default)]
        struct Collect(RefCell<Vec<WarnKind>>);
        impl Diagnostics for Collect {
            fn warn(&self, kind: WarnKind) {
                self.0.borrow_mut().push(kind);
            }
        }

        let ks = Keystream::new(Variant::Bms.iv());
        let mut w = ByteWriter::new();
        w.write_compressed_int(2);

        w.write_encrypted_string("mystery", &ks);
        w.write_u8(9);
        let mut body = ByteWriter::new();
        body.write_u8(0x73);
        body.write_encrypted_string("SomeFutureType", &ks);
        body.write_bytes(&[0xAA; 8]);
        let body_bytes = body.into_bytes();
        w.write_u32(body_bytes.len() as u32);
        w.write_bytes(&body_bytes);

        w.write_encrypted_string("after", &ks);
        w.write_u8(3);
        w.write_compressed_int(99);

        let mut reader = reader_for(w.into_bytes());
        let mut tree = Tree::new();
        let root = tree.insert("root", NodeData::Dir);
        let diag = Collect::default();
        parse_property_list(&mut reader, &mut tree, root, &diag).unwrap();

        assert_eq!(tree.get(root).children.len(), 1);
        let after = tree.get_child(root, "after").unwrap();
        assert!(matches!(tree.get(after).data, NodeData::Int(99)));
        assert_eq!(diag.0.borrow().len(), 1);
        assert!(matches!(diag.0.borrow()[0], WarnKind::UnknownExtendedType { .. }));
    }

    #[test]
    fn nested_sub_property_recurses() {
        let ks = Keystream::new(Variant::Bms.iv());
        let mut inner = ByteWriter::new();
        inner.write_compressed_int(1);
        inner.write_encrypted_string("leaf", &ks);
        inner.write_u8(3);
        inner.write_compressed_int(7);
        let inner_bytes = inner.into_bytes();

        let mut w = ByteWriter::new();
        w.write_compressed_int(1);
        w.write_encrypted_string("sub", &ks);
        w.write_u8(9);
        let mut body = ByteWriter::new();
        body.write_u8(0x73);
        body.write_encrypted_string("Property", &ks);
        body.write_u16(0);
        body.write_bytes(&inner_bytes);
        let body_bytes = body.into_bytes();
        w.write_u32(body_bytes.len() as u32);
        w.write_bytes(&body_bytes);

        let mut reader = reader_for(w.into_bytes());
        let mut tree = Tree::new();
        let root = tree.insert("root", NodeData::Dir);
        parse_property_list(&mut reader, &mut tree, root, &NullDiagnostics).unwrap();

        let sub = tree.get_child(root, "sub").unwrap();
        assert_eq!(tree.get(sub).tag(), Tag::Sub);
        let leaf = tree.get_child(sub, "leaf").unwrap();
        assert!(matches!(tree.get(leaf).data, NodeData::Int(7)));
    }
}
