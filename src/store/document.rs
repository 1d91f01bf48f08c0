use std::{
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    str::FromStr,
};

use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};

use crate::common::error::DocumentError;

/// An ordered tree of named nodes, the in-memory shape of a tom document.
///
/// Every node carries a textual value (empty for intermediate nodes) and a
/// list of named children. Multiple children may share a name; path lookups
/// resolve to the first match per segment, matching the underlying XML
/// document where element names are not unique.
///
/// Paths are `'/'`-separated, e.g. `"tom/root/a/c/d"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TomTree {
    value: String,
    children: Vec<(String, TomTree)>,
}

impl TomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    /// Returns the node at `path`, if the whole path exists.
    pub fn get(&self, path: &str) -> Option<&TomTree> {
        let mut node = self;
        for segment in segments(path) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut TomTree> {
        let mut node = self;
        for segment in segments(path) {
            node = node.child_mut(segment)?;
        }
        Some(node)
    }

    /// Returns the node at `path`, creating every missing intermediate
    /// node.
    pub fn ensure(&mut self, path: &str) -> &mut TomTree {
        let mut node = self;
        for segment in segments(path) {
            let index = match node.children.iter().position(|(name, _)| name == segment) {
                Some(index) => index,
                None => {
                    node.children.push((segment.to_owned(), TomTree::new()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index].1;
        }
        node
    }

    /// Removes the node at `path` (the first match) from its parent.
    /// Returns whether a node was removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let mut parts: Vec<&str> = segments(path).collect();
        let Some(last) = parts.pop() else {
            return false;
        };

        let mut parent = self;
        for segment in parts {
            match parent.child_mut(segment) {
                Some(node) => parent = node,
                None => return false,
            }
        }
        parent.remove_child(last)
    }

    pub fn child(&self, name: &str) -> Option<&TomTree> {
        self.children
            .iter()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, child)| child)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut TomTree> {
        self.children
            .iter_mut()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, child)| child)
    }

    /// Removes the first child named `name`. Returns whether one existed.
    pub fn remove_child(&mut self, name: &str) -> bool {
        match self.children.iter().position(|(child_name, _)| child_name == name) {
            Some(index) => {
                self.children.remove(index);
                true
            }
            None => false,
        }
    }

    /// Reads the child leaf `name` parsed as `T`.
    ///
    /// A missing child yields `Ok(None)`; a present child whose text does
    /// not parse is a document error.
    pub fn leaf<T: FromStr>(&self, name: &str) -> Result<Option<T>, DocumentError> {
        match self.child(name) {
            Some(child) => child
                .value
                .parse()
                .map(Some)
                .map_err(|_| DocumentError::parse(name, &child.value)),
            None => Ok(None),
        }
    }

    /// Writes `value` into the child leaf `name`, creating the leaf if
    /// needed.
    pub fn set_leaf<T: Display + ?Sized>(&mut self, name: &str, value: &T) {
        match self.child_mut(name) {
            Some(child) => child.value = value.to_string(),
            None => {
                let mut child = TomTree::new();
                child.value = value.to_string();
                self.children.push((name.to_owned(), child));
            }
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Parses the XML document at `path` into a tree.
///
/// The returned tree is a super-root whose children are the document's
/// top-level elements, so a tom file yields a tree addressable as
/// `"tom/root/…"`.
pub fn read_tom(path: &str) -> Result<TomTree, DocumentError> {
    let mut reader = Reader::from_file(path).map_err(|e| map_open_error(path, e))?;
    reader.trim_text(true);

    let mut root = TomTree::new();
    let mut stack: Vec<(String, TomTree)> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                stack.push((name, TomTree::new()));
            }
            Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                attach(&mut root, &mut stack, name, TomTree::new());
            }
            Ok(Event::End(_)) => {
                // The reader has already validated that the end tag matches.
                let (name, node) = stack.pop().expect("end tag without a start tag");
                attach(&mut root, &mut stack, name, node);
            }
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| DocumentError::xml(path, e))?;
                if let Some((_, node)) = stack.last_mut() {
                    node.value.push_str(&text);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some((_, node)) = stack.last_mut() {
                    node.value.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(DocumentError::xml(path, e)),
        }
        buf.clear();
    }

    Ok(root)
}

fn attach(root: &mut TomTree, stack: &mut [(String, TomTree)], name: String, node: TomTree) {
    let parent = match stack.last_mut() {
        Some((_, parent)) => parent,
        None => root,
    };
    parent.children.push((name, node));
}

fn map_open_error(path: &str, error: quick_xml::Error) -> DocumentError {
    match error {
        quick_xml::Error::Io(io) => DocumentError::io(
            path,
            std::sync::Arc::try_unwrap(io).unwrap_or_else(|arc| {
                std::io::Error::new(arc.kind(), arc.to_string())
            }),
        ),
        other => DocumentError::xml(path, other),
    }
}

/// Serializes `tree` as the XML document at `path`, replacing the file.
///
/// Writing then re-reading an unmodified tree yields an equal tree.
pub fn write_tom(path: &str, tree: &TomTree) -> Result<(), DocumentError> {
    let file = File::create(path).map_err(|e| DocumentError::io(path, e))?;
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(|e| DocumentError::xml(path, e))?;
    for (name, child) in &tree.children {
        write_node(&mut writer, name, child).map_err(|e| DocumentError::xml(path, e))?;
    }

    writer
        .into_inner()
        .flush()
        .map_err(|e| DocumentError::io(path, e))
}

fn write_node<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    node: &TomTree,
) -> quick_xml::Result<()> {
    if node.value.is_empty() && node.children.is_empty() {
        return writer.write_event(Event::Empty(BytesStart::new(name)));
    }

    writer.write_event(Event::Start(BytesStart::new(name)))?;
    if !node.value.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&node.value)))?;
    }
    for (child_name, child) in &node.children {
        write_node(writer, child_name, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))
}

#[cfg(test)]
mod tests {
    use super::{read_tom, write_tom, TomTree};
    use crate::common::error::DocumentError;

    fn temp_path() -> String {
        std::env::temp_dir()
            .join(format!("tomstore-doc-{}.xml", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    fn sample_tree() -> TomTree {
        let mut tree = TomTree::new();
        let entry = tree.ensure("tom/root/a/c/d");
        entry.set_leaf("key", &4);
        entry.set_leaf("mapped", &400);
        tree.ensure("tom/root/b").set_leaf("key", &6);
        tree
    }

    #[test]
    fn path_operations() {
        let mut tree = sample_tree();

        assert!(tree.get("tom/root/a/c").is_some());
        assert!(tree.get("tom/root/a/x").is_none());
        assert_eq!(
            tree.get("tom/root/a/c/d/key").map(TomTree::value),
            Some("4")
        );

        tree.ensure("tom/root/a/c").set_leaf("mapped", &7);
        assert_eq!(
            tree.get("tom/root/a/c/mapped").map(TomTree::value),
            Some("7")
        );

        assert!(tree.remove("tom/root/a/c/d"));
        assert!(!tree.remove("tom/root/a/c/d"));
        assert!(tree.get("tom/root/a/c/d").is_none());
    }

    #[test]
    fn typed_leaf_access() {
        let mut tree = TomTree::new();
        let node = tree.ensure("tom/root/e");
        node.set_leaf("key", &42);
        node.set_leaf("mapped", "forty-two");

        let node = tree.get("tom/root/e").unwrap();
        assert_eq!(node.leaf::<u64>("key").unwrap(), Some(42));
        assert_eq!(
            node.leaf::<String>("mapped").unwrap().as_deref(),
            Some("forty-two")
        );
        assert_eq!(node.leaf::<u64>("lifetime").unwrap(), None);

        let err = node.leaf::<u64>("mapped").unwrap_err();
        assert!(matches!(err, DocumentError::Parse { .. }));
    }

    #[test]
    fn xml_round_trip_is_idempotent() {
        let path = temp_path();
        let tree = sample_tree();

        write_tom(&path, &tree).unwrap();
        let first = read_tom(&path).unwrap();
        assert_eq!(first, tree);

        write_tom(&path, &first).unwrap();
        let second = read_tom(&path).unwrap();
        assert_eq!(second, first);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_subtrees_survive_round_trip() {
        let path = temp_path();
        let mut tree = TomTree::new();
        tree.ensure("tom/root");

        write_tom(&path, &tree).unwrap();
        let read = read_tom(&path).unwrap();
        assert!(read.get("tom/root").is_some());
        assert_eq!(read, tree);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = read_tom("/nonexistent/tomstore/tom.xml").unwrap_err();
        assert!(matches!(err, DocumentError::Io { .. }));
    }

    #[test]
    fn escaped_text_round_trips() {
        let path = temp_path();
        let mut tree = TomTree::new();
        tree.ensure("tom/root/e").set_leaf("mapped", "a < b & c > d");

        write_tom(&path, &tree).unwrap();
        let read = read_tom(&path).unwrap();
        assert_eq!(
            read.get("tom/root/e/mapped").map(TomTree::value),
            Some("a < b & c > d")
        );

        std::fs::remove_file(&path).unwrap();
    }
}
