//! The tree-to-text XML projection (§4.8): one element per node, attribute
//! names and shapes fixed per tag, escaped and nested to mirror child order.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::tree::{NodeData, NodeId, Tree};

/// A host-supplied PNG encoder, invoked for canvas nodes that carry decoded
/// pixels, so a canvas's `basedata` attribute can embed a real image rather
/// than raw pixel bytes (§6.1 `encode_canvas_png`). The core never encodes
/// PNG itself.
pub trait PngEncoder {
    /// Encodes `rgba` (tightly packed, `width * height * 4` bytes) as PNG.
    fn encode(&self, rgba: &[u8], width: u32, height: u32) -> Vec<u8>;
}

/// Projects `node` and its descendants to XML text, prefixed with the
/// standard prolog. Never fails (§6.1): a canvas or sound node missing
/// decoded pixels, or with no `png` encoder supplied, simply omits its
/// optional payload attributes rather than erroring.
pub fn serialize_xml(tree: &Tree, node: NodeId, png: Option<&dyn PngEncoder>) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    write_node(&mut out, tree, node, png);
    out
}

fn write_node(out: &mut String, tree: &Tree, node: NodeId, png: Option<&dyn PngEncoder>) {
    let n = tree.get(node);
    match &n.data {
        NodeData::File | NodeData::Dir | NodeData::Image { .. } | NodeData::Sub => {
            write_container(out, tree, node, "imgdir", png);
        }
        NodeData::Int(v) => write_leaf(out, "int", &[("name", &n.name), ("value", &v.to_string())]),
        NodeData::Short(v) => write_leaf(out, "short", &[("name", &n.name), ("value", &v.to_string())]),
        NodeData::Long(v) => write_leaf(out, "long", &[("name", &n.name), ("value", &v.to_string())]),
        NodeData::Float(v) => write_leaf(out, "float", &[("name", &n.name), ("value", &format_float(*v as f64))]),
        NodeData::Double(v) => write_leaf(out, "double", &[("name", &n.name), ("value", &format_float(*v))]),
        NodeData::String(s) => write_leaf(out, "string", &[("name", &n.name), ("value", s)]),
        NodeData::Uol(target) => write_leaf(out, "uol", &[("name", &n.name), ("value", target)]),
        NodeData::Null => write_leaf(out, "null", &[("name", &n.name)]),
        NodeData::Vector { x, y } => {
            write_leaf(out, "vector", &[("name", &n.name), ("x", &x.to_string()), ("y", &y.to_string())]);
        }
        NodeData::Canvas { width, height, decoded, .. } => {
            write_canvas(out, tree, node, *width, *height, decoded, png);
        }
        NodeData::Sound { duration_ms, provenance } => {
            write_sound(out, &n.name, *duration_ms, provenance);
        }
        NodeData::Convex => write_container(out, tree, node, "extended", png),
    }
}

fn write_container(out: &mut String, tree: &Tree, node: NodeId, element: &str, png: Option<&dyn PngEncoder>) {
    let n = tree.get(node);
    out.push('<');
    out.push_str(element);
    push_attr(out, "name", &n.name);
    if n.children.is_empty() {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");
    for &child in &n.children {
        write_node(out, tree, child, png);
    }
    out.push_str("</");
    out.push_str(element);
    out.push_str(">\n");
}

fn write_canvas(
    out: &mut String,
    tree: &Tree,
    node: NodeId,
    width: u32,
    height: u32,
    decoded: &Option<Vec<u8>>,
    png: Option<&dyn PngEncoder>,
) {
    let n = tree.get(node);
    out.push_str("<canvas");
    push_attr(out, "name", &n.name);
    push_attr(out, "width", &width.to_string());
    push_attr(out, "height", &height.to_string());
    if let (Some(rgba), Some(encoder)) = (decoded, png) {
        let png_bytes = encoder.encode(rgba, width, height);
        push_attr(out, "basedata", &BASE64.encode(png_bytes));
    }
    if n.children.is_empty() {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");
    for &child in &n.children {
        write_node(out, tree, child, png);
    }
    out.push_str("</canvas>\n");
}

fn write_sound(out: &mut String, name: &str, duration_ms: i32, provenance: &Option<crate::tree::SoundProvenance>) {
    out.push_str("<sound");
    push_attr(out, "name", name);
    push_attr(out, "length", &duration_ms.to_string());
    if let Some(p) = provenance {
        let header = &p.buffer[p.header_offset..p.header_offset + p.header_len];
        let data = &p.buffer[p.data_offset..p.data_offset + p.data_len];
        push_attr(out, "basehead", &BASE64.encode(header));
        push_attr(out, "basedata", &BASE64.encode(data));
    }
    out.push_str("/>\n");
}

fn write_leaf(out: &mut String, element: &str, attrs: &[(&str, &str)]) {
    out.push('<');
    out.push_str(element);
    for &(key, value) in attrs {
        push_attr(out, key, value);
    }
    out.push_str("/>\n");
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("=\"");
    escape_into(out, value);
    out.push('"');
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

/// Formats a float/double value so it always contains a `.`, per §4.8.
fn format_float(v: f64) -> String {
    let s = v.to_string();
    if s.contains('.') { s } else { format!("{s}.0") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeData;

    fn build_tree() -> (Tree, NodeId) {
        let mut tree = Tree::new();
        let root = tree.insert("Map.img", NodeData::Image { provenance: None });
        tree.root = Some(root);
        let n = tree.insert("hp", NodeData::Int(100));
        tree.append(root, n);
        let f = tree.insert("speed", NodeData::Float(1.0));
        tree.append(root, f);
        let s = tree.insert("name & title", NodeData::String("<tag>\"quoted\"".to_string()));
        tree.append(root, s);
        (tree, root)
    }

    #[test]
    fn prolog_and_imgdir_root_element() {
        let (tree, root) = build_tree();
        let xml = serialize_xml(&tree, root, None);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n"));
        assert!(xml.contains("<imgdir name=\"Map.img\">"));
        assert!(xml.contains("</imgdir>"));
    }

    #[test]
    fn float_value_always_contains_a_dot() {
        let (tree, root) = build_tree();
        let xml = serialize_xml(&tree, root, None);
        assert!(xml.contains("value=\"1.0\""));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let (tree, root) = build_tree();
        let xml = serialize_xml(&tree, root, None);
        assert!(xml.contains("name=\"name &amp; title\""));
        assert!(xml.contains("value=\"&lt;tag&gt;&quot;quoted&quot;\""));
    }

    #[test]
    fn int_leaf_has_no_closing_children() {
        let (tree, root) = build_tree();
        let xml = serialize_xml(&tree, root, None);
        assert!(xml.contains("<int name=\"hp\" value=\"100\"/>"));
    }
}
