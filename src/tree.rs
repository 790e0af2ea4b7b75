//! The in-memory archive tree: an arena of nodes reachable from a single
//! `file` root, per §3.1.
//!
//! Nodes reference each other by [`NodeId`] rather than directly, so a
//! child's back-reference to its parent doesn't need a cycle of owning
//! pointers — the arena (a `Tree`) is the single owner of every node, and a
//! `NodeId` is just an index into it (§9 "Parent back-references").

use std::sync::Arc;

use crate::encryption::Keystream;
use crate::reader::SharedBuffer;

/// An index into a [`Tree`]'s arena. Only meaningful together with the
/// `Tree` that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Which archive construct a node represents. Determines which of
/// [`NodeData`]'s variants its `data` field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    File,
    Dir,
    Image,
    Sub,
    Int,
    Short,
    Long,
    Float,
    Double,
    String,
    Uol,
    Null,
    Vector,
    Canvas,
    Sound,
    Convex,
}

/// Where an image's property list is parsed from, when it hasn't been yet.
///
/// Kept on the node so [`crate::property::parse_image`] can populate an
/// image's children on first demand without the caller re-threading the
/// buffer, keystream, and offset base through every call site (§3.3).
#[derive(Debug, Clone)]
pub struct ImageProvenance {
    pub buffer: SharedBuffer,
    pub keystream: Arc<Keystream>,
    pub data_start: usize,
    pub version_hash: u32,
    /// Byte offset of the image's property payload within `buffer`.
    pub offset: usize,
    /// Length in bytes of the image's data block, as recorded by its
    /// directory entry — the span the writer's fast path copies verbatim
    /// (§4.7 Pass 1).
    pub length: usize,
}

/// A canvas's source payload, kept until the node is both unmodified and
/// asked to re-serialize, so the writer's fast path can copy it verbatim
/// (§3.3, §4.7 Pass 1).
#[derive(Debug, Clone)]
pub struct CanvasProvenance {
    pub buffer: SharedBuffer,
    pub offset: usize,
    pub length: usize,
}

/// A sound node's header and data slices, recorded rather than copied
/// (§3.3, §4.6).
#[derive(Debug, Clone)]
pub struct SoundProvenance {
    pub buffer: SharedBuffer,
    pub header_offset: usize,
    pub header_len: usize,
    pub data_offset: usize,
    pub data_len: usize,
}

/// The seven packed/compressed pixel formats a canvas payload may carry
/// (§4.5), plus whatever numeric id a parse encountered that isn't one of
/// them — kept rather than discarded so a warning and the raw id can still
/// be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra4444,
    Bgra8888,
    Argb1555,
    Rgb565,
    Rgb565MacroBlock,
    Dxt3,
    Dxt5,
    Unknown(u32),
}

impl PixelFormat {
    /// Maps a canvas's combined `format-low | (format-high << 8)` value to
    /// the format it names, per the table in §4.5.
    pub fn from_id(id: u32) -> PixelFormat {
        match id {
            1 => PixelFormat::Bgra4444,
            2 => PixelFormat::Bgra8888,
            3 | 1026 => PixelFormat::Dxt3,
            257 => PixelFormat::Argb1555,
            513 => PixelFormat::Rgb565,
            517 => PixelFormat::Rgb565MacroBlock,
            2050 => PixelFormat::Dxt5,
            other => PixelFormat::Unknown(other),
        }
    }

    /// The numeric id this format was (or would be) read from.
    pub fn id(self) -> u32 {
        match self {
            PixelFormat::Bgra4444 => 1,
            PixelFormat::Bgra8888 => 2,
            PixelFormat::Dxt3 => 3,
            PixelFormat::Argb1555 => 257,
            PixelFormat::Rgb565 => 513,
            PixelFormat::Rgb565MacroBlock => 517,
            PixelFormat::Dxt5 => 2050,
            PixelFormat::Unknown(id) => id,
        }
    }
}

/// The tag-specific value a node carries, per the table in §3.1.
#[derive(Debug, Clone)]
pub enum NodeData {
    File,
    Dir,
    Image {
        provenance: Option<ImageProvenance>,
    },
    Sub,
    Int(i32),
    Short(i16),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Uol(String),
    Null,
    Vector {
        x: i32,
        y: i32,
    },
    Canvas {
        width: u32,
        height: u32,
        format: PixelFormat,
        provenance: Option<CanvasProvenance>,
        /// Set once a host has decoded (or supplied) RGBA8888 pixels for
        /// this canvas, e.g. after [`crate::pixel::decode_canvas`].
        decoded: Option<Vec<u8>>,
    },
    Sound {
        duration_ms: i32,
        provenance: Option<SoundProvenance>,
    },
    Convex,
}

impl NodeData {
    /// The [`Tag`] this data's shape corresponds to.
    pub fn tag(&self) -> Tag {
        match self {
            NodeData::File => Tag::File,
            NodeData::Dir => Tag::Dir,
            NodeData::Image { .. } => Tag::Image,
            NodeData::Sub => Tag::Sub,
            NodeData::Int(_) => Tag::Int,
            NodeData::Short(_) => Tag::Short,
            NodeData::Long(_) => Tag::Long,
            NodeData::Float(_) => Tag::Float,
            NodeData::Double(_) => Tag::Double,
            NodeData::String(_) => Tag::String,
            NodeData::Uol(_) => Tag::Uol,
            NodeData::Null => Tag::Null,
            NodeData::Vector { .. } => Tag::Vector,
            NodeData::Canvas { .. } => Tag::Canvas,
            NodeData::Sound { .. } => Tag::Sound,
            NodeData::Convex => Tag::Convex,
        }
    }
}

/// One node in the tree: the header fields common to every tag (§3.1), plus
/// the tag-specific payload in `data`.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub modified: bool,
    pub data: NodeData,
}

impl Node {
    fn new(name: impl Into<String>, data: NodeData) -> Self {
        Self {
            name: name.into(),
            parent: None,
            children: Vec::new(),
            modified: false,
            data,
        }
    }

    /// This node's tag.
    pub fn tag(&self) -> Tag {
        self.data.tag()
    }
}

/// An arena owning every [`Node`] reachable from `root`.
///
/// Children reference their parent by [`NodeId`] rather than by pointer, so
/// the arena (not any individual node) is the sole owner of the graph —
/// dropping a `Tree` drops every node regardless of how many children
/// reference a given parent.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    pub root: Option<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a detached node (no parent, no children) and returns its id.
    pub fn insert(&mut self, name: impl Into<String>, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, data));
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Appends `child` to `parent`'s child sequence and sets its parent
    /// back-reference, maintaining the §3.1 invariant that a node's parent,
    /// if present, lists it exactly once.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        debug_assert!(
            !self.nodes[parent.0].children.contains(&child),
            "child already appended to this parent"
        );
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Removes `child` from `parent`'s child sequence and clears its parent
    /// back-reference. The child's own subtree and provenance are left
    /// untouched so it can be re-inserted later with provenance intact
    /// (§3.4).
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.0].children.retain(|&c| c != child);
        self.nodes[child.0].parent = None;
    }

    /// Looks up a direct child of `parent` by case-insensitive name
    /// (§3.2, §8.1 property 10).
    pub fn get_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].name.eq_ignore_ascii_case(name))
    }

    /// Renames `node`, marking it modified. Does not check for a sibling
    /// collision; §3.2 leaves that to the XML re-parser.
    pub fn rename(&mut self, node: NodeId, name: impl Into<String>) {
        let node = self.get_mut(node);
        node.name = name.into();
        node.modified = true;
    }

    /// The slash-joined absolute path from the root to `node`, e.g.
    /// `"Map.wz/Map1/100000000.img"`.
    pub fn path(&self, node: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            segments.push(self.nodes[id.0].name.as_str());
            current = self.nodes[id.0].parent;
        }
        segments.reverse();
        segments.join("/")
    }

    /// Walks `path` (slash-separated, case-insensitive per segment) from
    /// `root`, returning the node it resolves to if every segment matches a
    /// child. Supplements §6.1's case-insensitive child lookup with the path
    /// form a `uol` resolver needs.
    pub fn resolve_path(&self, root: NodeId, path: &str) -> Option<NodeId> {
        let mut current = root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.get_child(current, segment)?;
        }
        Some(current)
    }

    /// Iterates every descendant of `node` (not including `node` itself), in
    /// depth-first, pre-order, child-sequence order.
    pub fn descendants(&self, node: NodeId) -> Descendants<'_> {
        Descendants {
            tree: self,
            stack: self.nodes[node.0].children.iter().rev().copied().collect(),
        }
    }

    /// The number of descendants of `node` carrying `tag`. A thin combinator
    /// over [`Tree::descendants`] rather than a separate traversal (§6.1,
    /// SPEC_FULL §F.2).
    pub fn count_descendants(&self, node: NodeId, tag: Tag) -> usize {
        self.descendants(node)
            .filter(|&id| self.get(id).tag() == tag)
            .count()
    }
}

/// A depth-first, pre-order iterator over a node's descendants, returned by
/// [`Tree::descendants`].
pub struct Descendants<'a> {
    tree: &'a Tree,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        let node = self.tree.get(id);
        self.stack.extend(node.children.iter().rev().copied());
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tree: &mut Tree, parent: NodeId, name: &str, value: i32) -> NodeId {
        let id = tree.insert(name, NodeData::Int(value));
        tree.append(parent, id);
        id
    }

    #[test]
    fn child_lookup_is_case_insensitive() {
        let mut tree = Tree::new();
        let root = tree.insert("root", NodeData::Dir);
        leaf(&mut tree, root, "Foo", 1);
        assert_eq!(
            tree.get_child(root, "foo"),
            tree.get_child(root, "FOO")
        );
        assert!(tree.get_child(root, "foo").is_some());
    }

    #[test]
    fn removing_a_child_clears_its_parent_and_preserves_the_node() {
        let mut tree = Tree::new();
        let root = tree.insert("root", NodeData::Dir);
        let child = leaf(&mut tree, root, "n", 42);

        tree.remove_child(root, child);
        assert!(tree.get(child).parent.is_none());
        assert!(tree.get_child(root, "n").is_none());
        assert_eq!(tree.get(child).name, "n");

        tree.append(root, child);
        assert_eq!(tree.get(child).parent, Some(root));
    }

    #[test]
    fn path_joins_ancestors_with_slashes() {
        let mut tree = Tree::new();
        let root = tree.insert("Map.wz", NodeData::File);
        let dir = tree.insert("Map1", NodeData::Dir);
        tree.append(root, dir);
        let img = tree.insert("100000000.img", NodeData::Image { provenance: None });
        tree.append(dir, img);

        assert_eq!(tree.path(img), "Map.wz/Map1/100000000.img");
        assert_eq!(tree.resolve_path(root, "Map1/100000000.img"), Some(img));
        assert_eq!(tree.resolve_path(root, "map1/100000000.IMG"), Some(img));
    }

    #[test]
    fn descendants_and_count_cover_the_whole_subtree() {
        let mut tree = Tree::new();
        let root = tree.insert("root", NodeData::Dir);
        let sub = tree.insert("sub", NodeData::Sub);
        tree.append(root, sub);
        leaf(&mut tree, sub, "a", 1);
        leaf(&mut tree, sub, "b", 2);
        leaf(&mut tree, root, "c", 3);

        assert_eq!(tree.descendants(root).count(), 4);
        assert_eq!(tree.count_descendants(root, Tag::Int), 3);
        assert_eq!(tree.count_descendants(root, Tag::Sub), 1);
    }

    #[test]
    fn pixel_format_id_roundtrips_known_values() {
        for id in [1, 2, 3, 257, 513, 517, 1026, 2050] {
            assert_eq!(PixelFormat::from_id(id).id(), if id == 1026 { 3 } else { id });
        }
        assert_eq!(PixelFormat::from_id(9999), PixelFormat::Unknown(9999));
    }
}
