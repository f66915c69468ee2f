use super::parser::{tokenize, XmlEvent};
use super::{XmlError, XmlResult, XmlWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

/// Arena-backed element tree.
///
/// Node zero is the unnamed document node; top level elements are its
/// children. Paths are slash separated element names, optionally ending in
/// an `@attribute` step. A leading `/` starts at the document node, `.` and
/// `..` are honoured, and the first child with a matching name is taken.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Element>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

enum PathStep<'p> {
    Current,
    Parent,
    Child(&'p str),
    Attribute(&'p str),
}

fn parse_path(path: &str) -> XmlResult<(bool, Vec<PathStep<'_>>)> {
    let trimmed = path.trim();
    let absolute = trimmed.starts_with('/');
    let mut steps = Vec::new();
    let parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    for (index, part) in parts.iter().enumerate() {
        let step = match *part {
            "." => PathStep::Current,
            ".." => PathStep::Parent,
            name if name.starts_with('@') => {
                if index + 1 != parts.len() || name.len() == 1 {
                    return Err(XmlError::InvalidPath(path.to_string()));
                }
                PathStep::Attribute(&name[1..])
            }
            name if name.contains(['*', '[', ']', '(', ')', ' ']) => {
                return Err(XmlError::InvalidPath(path.to_string()))
            }
            name => PathStep::Child(name),
        };
        steps.push(step);
    }
    Ok((absolute, steps))
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Element::default()],
        }
    }

    pub fn parse(xml: &str) -> XmlResult<Self> {
        let mut document = Self::new();
        let mut stack = vec![document.root()];
        for event in tokenize(xml)? {
            match event {
                XmlEvent::StartTag { name, attributes } => {
                    let parent = *stack.last().unwrap_or(&NodeId(0));
                    let node = document.add_child(parent, &name);
                    document.nodes[node.0].attributes = attributes;
                    stack.push(node);
                }
                XmlEvent::Content(text) => {
                    if let Some(node) = stack.last() {
                        if node.0 != 0 {
                            document.nodes[node.0].text.push_str(&text);
                        }
                    }
                }
                XmlEvent::EndTag { .. } => {
                    stack.pop();
                }
            }
        }
        for element in document.nodes.iter_mut().skip(1) {
            if !element.children.is_empty() && element.text.trim().is_empty() {
                element.text.clear();
            }
        }
        Ok(document)
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn document_element(&self) -> Option<NodeId> {
        self.nodes[0].children.first().copied()
    }

    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.0].name
    }

    pub fn text(&self, node: NodeId) -> &str {
        &self.nodes[node.0].text
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    pub fn child_named(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.children(node)
            .iter()
            .copied()
            .find(|child| self.name(*child) == name)
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes[node.0]
            .attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self, node: NodeId) -> impl Iterator<Item = (&str, &str)> {
        self.nodes[node.0]
            .attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Concatenated text of the node and its descendants, in document order.
    pub fn string_value(&self, node: NodeId) -> String {
        let mut value = self.nodes[node.0].text.clone();
        for child in self.children(node) {
            value.push_str(&self.string_value(*child));
        }
        value
    }

    /// All elements below `node`, depth first.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut pending: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(next) = pending.pop() {
            found.push(next);
            pending.extend(self.children(next).iter().rev().copied());
        }
        found
    }

    pub fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let node = NodeId(self.nodes.len());
        self.nodes.push(Element {
            name: name.to_string(),
            parent: Some(parent),
            ..Element::default()
        });
        self.nodes[parent.0].children.push(node);
        node
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        let attributes = &mut self.nodes[node.0].attributes;
        match attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn set_text(&mut self, node: NodeId, value: &str) {
        self.nodes[node.0].text = value.to_string();
    }

    /// Resolves an element path without creating anything.
    pub fn find(&self, from: NodeId, path: &str) -> Option<NodeId> {
        let (absolute, steps) = parse_path(path).ok()?;
        let mut node = if absolute { self.root() } else { from };
        for step in steps {
            node = match step {
                PathStep::Current => node,
                PathStep::Parent => self.parent(node)?,
                PathStep::Child(name) => self.child_named(node, name)?,
                PathStep::Attribute(_) => return None,
            };
        }
        Some(node)
    }

    /// Resolves an element path, creating missing elements along the way.
    pub fn ensure_branch(&mut self, from: NodeId, path: &str) -> XmlResult<NodeId> {
        let (absolute, steps) = parse_path(path)?;
        let mut node = if absolute { self.root() } else { from };
        for step in steps {
            node = match step {
                PathStep::Current => node,
                PathStep::Parent => self
                    .parent(node)
                    .ok_or_else(|| XmlError::InvalidPath(path.to_string()))?,
                PathStep::Child(name) => match self.child_named(node, name) {
                    Some(child) => child,
                    None => self.add_child(node, name),
                },
                PathStep::Attribute(_) => return Err(XmlError::InvalidPath(path.to_string())),
            };
        }
        Ok(node)
    }

    fn split_attribute(path: &str) -> (&str, Option<&str>) {
        match path.rsplit_once('/') {
            Some((branch, last)) if last.starts_with('@') => (branch, Some(&last[1..])),
            None if path.starts_with('@') => ("", Some(&path[1..])),
            _ => (path, None),
        }
    }

    /// Replaces the text (or attribute) addressed by `path`.
    pub fn set_prop(&mut self, from: NodeId, path: &str, value: &str) -> XmlResult<()> {
        let (branch, attribute) = Self::split_attribute(path);
        let node = self.ensure_branch(from, branch)?;
        match attribute {
            Some("") => return Err(XmlError::InvalidPath(path.to_string())),
            Some(name) => self.set_attribute(node, name, value),
            None => self.set_text(node, value),
        }
        Ok(())
    }

    /// Appends to the text (or attribute) addressed by `path`.
    pub fn append_prop(&mut self, from: NodeId, path: &str, value: &str) -> XmlResult<()> {
        let (branch, attribute) = Self::split_attribute(path);
        let node = self.ensure_branch(from, branch)?;
        match attribute {
            Some("") => return Err(XmlError::InvalidPath(path.to_string())),
            Some(name) => {
                let mut current = self.attribute(node, name).unwrap_or_default().to_string();
                current.push_str(value);
                self.set_attribute(node, name, &current);
            }
            None => self.nodes[node.0].text.push_str(value),
        }
        Ok(())
    }

    pub fn query_prop(&self, from: NodeId, path: &str) -> Option<String> {
        let (branch, attribute) = Self::split_attribute(path);
        let node = self.find(from, branch)?;
        match attribute {
            Some(name) => self.attribute(node, name).map(str::to_string),
            None => Some(self.text(node).to_string()),
        }
    }

    pub fn to_xml(&self) -> XmlResult<String> {
        let mut writer = XmlWriter::new();
        for child in self.children(self.root()) {
            self.write_element(&mut writer, *child)?;
        }
        writer.into_string()
    }

    /// Serializes `node` and its subtree.
    pub fn element_to_xml(&self, node: NodeId) -> XmlResult<String> {
        let mut writer = XmlWriter::new();
        self.write_element(&mut writer, node)?;
        writer.into_string()
    }

    fn write_element(&self, writer: &mut XmlWriter, node: NodeId) -> XmlResult<()> {
        let element = &self.nodes[node.0];
        let attributes: Vec<(&str, &str)> = self.attributes(node).collect();
        if element.children.is_empty() && element.text.is_empty() {
            return writer.empty(&element.name, &attributes);
        }
        writer.start(&element.name, &attributes)?;
        if !element.text.is_empty() {
            writer.text(&element.text)?;
        }
        for child in &element.children {
            self.write_element(writer, *child)?;
        }
        writer.end(&element.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_query() {
        let doc = Document::parse(r#"<Req><User id="7">alice</User><Item/></Req>"#).unwrap();
        let root = doc.root();
        assert_eq!(doc.query_prop(root, "Req/User"), Some("alice".to_string()));
        assert_eq!(doc.query_prop(root, "Req/User/@id"), Some("7".to_string()));
        assert_eq!(doc.query_prop(root, "Req/Missing"), None);
        let user = doc.find(root, "/Req/User").unwrap();
        assert_eq!(doc.find(user, "../Item").map(|n| doc.name(n)), Some("Item"));
    }

    #[test]
    fn test_set_and_append_create_branches() {
        let mut doc = Document::new();
        let root = doc.root();
        doc.set_prop(root, "Out/Flag", "yes").unwrap();
        doc.set_prop(root, "Out/@kind", "a").unwrap();
        doc.append_prop(root, "Out/Flag", "-no").unwrap();
        doc.append_prop(root, "Out/@kind", "b").unwrap();
        assert_eq!(
            doc.to_xml().unwrap(),
            r#"<Out kind="ab"><Flag>yes-no</Flag></Out>"#
        );
    }

    #[test]
    fn test_invalid_paths_are_rejected() {
        let mut doc = Document::new();
        let root = doc.root();
        assert!(doc.set_prop(root, "a/@x/b", "1").is_err());
        assert!(doc.ensure_branch(root, "a/*").is_err());
    }
}
