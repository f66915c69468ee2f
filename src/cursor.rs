//! Scoped read and write cursors over the transaction documents.
//!
//! Each cursor keeps a stack of roots. A statement pushes its declared root
//! before it runs and the frame is restored when it finishes, however it
//! finishes. Roots are element paths resolved against the current root, or
//! against the document node when they start with `/`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::variables::{fold_name, VariableListener};
use crate::xml::{Document, NodeId, XmlResult};
use crate::xpath::{
    CompiledExpression, EvaluationScope, VariableResolver, XPathEngine, XPathError, XPathResult,
    XPathValue,
};

/// Variable values as seen by expressions. Kept current by the variable
/// stack, which notifies it of every change in visibility. Clones share one
/// map, owned by a single transaction.
#[derive(Debug, Clone, Default)]
pub struct VariableBindings {
    values: Rc<RefCell<HashMap<String, String>>>,
}

impl VariableBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.borrow().get(&fold_name(name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    pub fn replace_all<I: IntoIterator<Item = (String, String)>>(&self, values: I) {
        let mut map = self.values.borrow_mut();
        map.clear();
        map.extend(values.into_iter().map(|(name, value)| (fold_name(&name), value)));
    }
}

impl VariableListener for VariableBindings {
    fn on_variable_change(&self, name: &str, value: Option<&str>) {
        trace!(name, ?value, "variable binding changed");
        let mut map = self.values.borrow_mut();
        match value {
            Some(value) => {
                map.insert(fold_name(name), value.to_string());
            }
            None => {
                map.remove(&fold_name(name));
            }
        }
    }
}

impl VariableResolver for VariableBindings {
    fn resolve(&self, name: &str) -> Option<String> {
        self.get(name)
    }
}

#[derive(Debug, Clone)]
struct Frame {
    root: String,
    node: Option<NodeId>,
}

/// Handed out by `push_root`; give it back to `pop_to` to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorMark {
    depth: usize,
    valid: bool,
}

impl CursorMark {
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

fn join_root(current: &str, root: &str) -> String {
    if root.starts_with('/') || current.is_empty() {
        root.to_string()
    } else if current.ends_with('/') {
        format!("{}{}", current, root)
    } else {
        format!("{}/{}", current, root)
    }
}

#[derive(Debug)]
pub struct ReadCursor {
    document: Document,
    frames: Vec<Frame>,
    bindings: VariableBindings,
    engine: Arc<dyn XPathEngine>,
}

impl ReadCursor {
    pub fn new(
        document: Document,
        root: &str,
        bindings: VariableBindings,
        engine: Arc<dyn XPathEngine>,
    ) -> Self {
        let node = document.find(document.root(), root);
        Self {
            document,
            frames: vec![Frame {
                root: root.to_string(),
                node,
            }],
            bindings,
            engine,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn bindings(&self) -> &VariableBindings {
        &self.bindings
    }

    pub fn root(&self) -> &str {
        self.frames.last().map_or("", |f| f.root.as_str())
    }

    pub fn node(&self) -> Option<NodeId> {
        self.frames.last().and_then(|f| f.node)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Replaces the current root. Returns whether it resolves.
    pub fn set_root(&mut self, root: &str) -> bool {
        let node = self.document.find(self.document.root(), root);
        if let Some(frame) = self.frames.last_mut() {
            frame.root = root.to_string();
            frame.node = node;
        }
        node.is_some()
    }

    /// Enters `root` relative to the current root. `None` keeps the current
    /// root without pushing anything.
    pub fn push_root(&mut self, root: Option<&str>) -> CursorMark {
        let depth = self.frames.len();
        let Some(root) = root.filter(|r| !r.is_empty()) else {
            return CursorMark {
                depth,
                valid: self.node().is_some(),
            };
        };
        let node = self
            .node()
            .and_then(|current| self.document.find(current, root));
        let joined = join_root(self.root(), root);
        self.frames.push(Frame { root: joined, node });
        CursorMark {
            depth,
            valid: node.is_some(),
        }
    }

    pub fn pop_to(&mut self, mark: CursorMark) {
        self.truncate(mark.depth);
    }

    pub(crate) fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth.max(1));
    }

    pub fn evaluate(&self, expression: &dyn CompiledExpression) -> XPathResult<XPathValue> {
        let node = self.node().ok_or_else(|| {
            XPathError::Evaluation(format!("read root '{}' does not resolve", self.root()))
        })?;
        let scope = EvaluationScope {
            document: &self.document,
            node,
            variables: &self.bindings,
        };
        expression.evaluate(&scope)
    }

    pub fn evaluate_bool(&self, expression: &dyn CompiledExpression) -> XPathResult<bool> {
        Ok(self.evaluate(expression)?.to_bool())
    }

    pub fn evaluate_string(&self, expression: &dyn CompiledExpression) -> XPathResult<String> {
        Ok(self.evaluate(expression)?.into_string())
    }

    /// Compiles and evaluates in one go, for callers without a compiled form.
    pub fn evaluate_str(&self, expression: &str) -> XPathResult<XPathValue> {
        let compiled = self.engine.compile(expression)?;
        self.evaluate(compiled.as_ref())
    }
}

#[derive(Debug)]
pub struct WriteCursor {
    document: Document,
    frames: Vec<Frame>,
}

impl WriteCursor {
    /// The initial root is created if the document lacks it.
    pub fn new(mut document: Document, root: &str) -> Self {
        let node = document.ensure_branch(document.root(), root).ok();
        Self {
            document,
            frames: vec![Frame {
                root: root.to_string(),
                node,
            }],
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    pub fn root(&self) -> &str {
        self.frames.last().map_or("", |f| f.root.as_str())
    }

    pub fn node(&self) -> Option<NodeId> {
        self.frames.last().and_then(|f| f.node)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn set_root(&mut self, root: &str) -> bool {
        let node = self.document.ensure_branch(self.document.root(), root).ok();
        if let Some(frame) = self.frames.last_mut() {
            frame.root = root.to_string();
            frame.node = node;
        }
        node.is_some()
    }

    pub fn push_root(&mut self, root: Option<&str>) -> CursorMark {
        let depth = self.frames.len();
        let Some(root) = root.filter(|r| !r.is_empty()) else {
            return CursorMark {
                depth,
                valid: self.node().is_some(),
            };
        };
        let node = match self.node() {
            Some(current) => self.document.ensure_branch(current, root).ok(),
            None => None,
        };
        let joined = join_root(self.root(), root);
        self.frames.push(Frame { root: joined, node });
        CursorMark {
            depth,
            valid: node.is_some(),
        }
    }

    pub fn pop_to(&mut self, mark: CursorMark) {
        self.truncate(mark.depth);
    }

    pub(crate) fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth.max(1));
    }

    fn current(&self) -> XmlResult<NodeId> {
        self.node()
            .ok_or_else(|| crate::xml::XmlError::InvalidPath(self.root().to_string()))
    }

    pub fn ensure_branch(&mut self, path: &str) -> XmlResult<NodeId> {
        let current = self.current()?;
        self.document.ensure_branch(current, path)
    }

    pub fn set_prop(&mut self, path: &str, value: &str) -> XmlResult<()> {
        let current = self.current()?;
        self.document.set_prop(current, path, value)
    }

    pub fn append_prop(&mut self, path: &str, value: &str) -> XmlResult<()> {
        let current = self.current()?;
        self.document.append_prop(current, path, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpath::SimpleXPath;
    use pretty_assertions::assert_eq;

    fn read_cursor(xml: &str) -> ReadCursor {
        ReadCursor::new(
            Document::parse(xml).unwrap(),
            "/",
            VariableBindings::new(),
            Arc::new(SimpleXPath),
        )
    }

    #[test]
    fn test_read_frames_nest_and_restore() {
        let mut cursor = read_cursor("<Req><User><Name>bob</Name></User></Req>");
        let outer = cursor.push_root(Some("Req"));
        assert!(outer.is_valid());
        let inner = cursor.push_root(Some("User"));
        assert!(inner.is_valid());
        assert_eq!(cursor.root(), "/Req/User");
        assert_eq!(cursor.evaluate_str("Name").unwrap().into_string(), "bob");

        let missing = cursor.push_root(Some("Nope"));
        assert!(!missing.is_valid());
        cursor.pop_to(missing);
        cursor.pop_to(inner);
        assert_eq!(cursor.root(), "/Req");
        cursor.pop_to(outer);
        assert_eq!(cursor.depth(), 1);
    }

    #[test]
    fn test_absent_root_keeps_current() {
        let mut cursor = read_cursor("<Req/>");
        let mark = cursor.push_root(None);
        assert!(mark.is_valid());
        assert_eq!(cursor.depth(), 1);
        assert!(!cursor.set_root("/Missing"));
        assert!(cursor.evaluate_str("true()").is_err());
    }

    #[test]
    fn test_bindings_follow_variable_changes() {
        let bindings = VariableBindings::new();
        bindings.on_variable_change("User", Some("alice"));
        let cursor = ReadCursor::new(
            Document::new(),
            "/",
            bindings.clone(),
            Arc::new(SimpleXPath),
        );
        assert!(cursor.evaluate_str("$user = 'alice'").unwrap().to_bool());
        bindings.on_variable_change("USER", None);
        assert!(cursor.evaluate_str("$user").is_err());
    }

    #[test]
    fn test_write_cursor_creates_roots() {
        let mut cursor = WriteCursor::new(Document::new(), "/Resp");
        let mark = cursor.push_root(Some("Body"));
        assert!(mark.is_valid());
        cursor.set_prop("Status", "ok").unwrap();
        cursor.pop_to(mark);
        cursor.append_prop("@seen", "1").unwrap();
        assert_eq!(
            cursor.into_document().to_xml().unwrap(),
            r#"<Resp seen="1"><Body><Status>ok</Status></Body></Resp>"#
        );
    }
}
