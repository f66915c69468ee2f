//! Statement tree model.
//!
//! A loaded script is a tree of [`Statement`]s. The structural part (tag,
//! phase, acceptance flags, children, cursor roots) lives in the struct; what
//! a particular tag means is supplied by a [`StatementBehavior`] chosen by the
//! [`Factory`] when the element is read. Trees are immutable once loaded and
//! are shared between threads.

mod conditional;
mod control;
mod factory;
mod library;
mod phase;
mod update;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::context::{LoadContext, ProcessContext};
use crate::outcome::{codes, Severity};
use crate::trace::TraceError;
use crate::variables::VariableError;
use crate::xml::XmlError;
use crate::xpath::{CompiledExpression, XPathError};

pub use conditional::{
    CaseStatement, ChooseStatement, DefaultStatement, IfStatement, OtherwiseStatement,
    SwitchStatement, WhenStatement,
};
pub use control::{
    AbortStatement, FailStatement, LogAgentFilterStatement, SetTraceLevelStatement,
    VariableStatement,
};
pub use factory::{Creator, Factory};
pub use library::Library;
pub use phase::{BlockStatement, Phase, PhaseStatement};
pub use update::{UpdateMode, ValueStatement};

/// Element and attribute names of the script vocabulary.
pub mod tags {
    pub const ESDL_SCRIPT: &str = "EsdlScript";
    pub const LIBRARY: &str = "xsdl:Library";

    pub const PREFLIGHT_PHASE: &str = "xsdl:PreflightPhase";
    pub const REQUEST_PHASE: &str = "xsdl:RequestPhase";
    pub const RESPONSE_PHASE: &str = "xsdl:ResponsePhase";
    pub const LOG_MANAGER_PHASE: &str = "xsdl:LogManagerPhase";
    pub const LOG_AGENT_PHASE: &str = "xsdl:LogAgentPhase";

    pub const CUSTOM_REQUEST_TRANSFORM: &str = "xsdl:CustomRequestTransform";

    pub const CHOOSE: &str = "xsdl:choose";
    pub const WHEN: &str = "xsdl:when";
    pub const OTHERWISE: &str = "xsdl:otherwise";
    pub const SWITCH: &str = "xsdl:switch";
    pub const CASE: &str = "xsdl:case";
    pub const DEFAULT: &str = "xsdl:default";
    pub const IF: &str = "xsdl:if";

    pub const SET_VALUE: &str = "xsdl:SetValue";
    pub const APPEND_VALUE: &str = "xsdl:appendValue";

    pub const VARIABLE: &str = "xsdl:variable";
    pub const PARAM: &str = "xsdl:param";
    pub const ABORT: &str = "xsdl:abort";
    pub const FAIL: &str = "xsdl:fail";
    pub const SET_TRACE_LEVEL: &str = "xsdl:SetTraceLevel";
    pub const INCLUDE_LOG_AGENTS: &str = "xsdl:IncludeLogAgents";
    pub const EXCLUDE_LOG_AGENTS: &str = "xsdl:ExcludeLogAgents";

    pub const ATTR_TEST: &str = "test";
    pub const ATTR_VALUE: &str = "value";
    pub const ATTR_TARGET: &str = "target";
    pub const ATTR_UID: &str = "uid";
    pub const ATTR_READ_ROOT: &str = "readRoot";
    pub const ATTR_WRITE_ROOT: &str = "writeRoot";
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("statement '{tag}' was processed before it was initialized")]
    Uninitialized { tag: String },
    #[error(transparent)]
    XPath(#[from] XPathError),
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum InitializationState {
    New,
    InProgress,
    Initialized,
    Failed,
}

/// What a statement admits between its start and end tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acceptance {
    pub children: bool,
    pub content: bool,
    pub extensions: bool,
}

impl Default for Acceptance {
    fn default() -> Self {
        Self {
            children: true,
            content: false,
            extensions: false,
        }
    }
}

impl Acceptance {
    pub fn leaf() -> Self {
        Self {
            children: false,
            ..Self::default()
        }
    }
}

/// Information a parent hands to the children it processes.
#[derive(Debug, Clone, PartialEq)]
pub enum ParentInfo {
    /// Value children compare themselves against.
    Comparable(String),
}

/// How processing of a subtree ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
    Fail,
}

/// Result of a statement's own processing step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Go on with the children.
    Descend(Option<ParentInfo>),
    /// Finished; children are not visited.
    Done,
    Abort,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub matched: bool,
    pub stop: bool,
}

impl Selection {
    pub const MATCH_CONTINUE: Selection = Selection {
        matched: true,
        stop: false,
    };
    pub const MATCH_STOP: Selection = Selection {
        matched: true,
        stop: true,
    };
    pub const SKIP_CONTINUE: Selection = Selection {
        matched: false,
        stop: false,
    };
    pub const SKIP_STOP: Selection = Selection {
        matched: false,
        stop: true,
    };
}

/// Decides, child by child, which children a statement processes.
pub trait ChildPredicate: Send + Sync {
    fn select(
        &self,
        child: &Statement,
        context: &ProcessContext,
        parent: Option<&ParentInfo>,
    ) -> ProcessResult<Selection>;
}

pub struct AllChildren;

impl ChildPredicate for AllChildren {
    fn select(&self, _: &Statement, _: &ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Selection> {
        Ok(Selection::MATCH_CONTINUE)
    }
}

pub struct NoChildren;

impl ChildPredicate for NoChildren {
    fn select(&self, _: &Statement, _: &ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Selection> {
        Ok(Selection::SKIP_STOP)
    }
}

/// Every child whose evaluation is true.
pub struct EvaluatedChildren;

impl ChildPredicate for EvaluatedChildren {
    fn select(
        &self,
        child: &Statement,
        context: &ProcessContext,
        parent: Option<&ParentInfo>,
    ) -> ProcessResult<Selection> {
        Ok(Selection {
            matched: child.evaluate(context, parent)?,
            stop: false,
        })
    }
}

/// The first child whose evaluation is true, then stop.
pub struct FirstEvaluatedChild;

impl ChildPredicate for FirstEvaluatedChild {
    fn select(
        &self,
        child: &Statement,
        context: &ProcessContext,
        parent: Option<&ParentInfo>,
    ) -> ProcessResult<Selection> {
        Ok(if child.evaluate(context, parent)? {
            Selection::MATCH_STOP
        } else {
            Selection::SKIP_CONTINUE
        })
    }
}

/// Unconditional children, plus evaluable children that evaluate true.
pub struct ActionableChildren;

impl ChildPredicate for ActionableChildren {
    fn select(
        &self,
        child: &Statement,
        context: &ProcessContext,
        parent: Option<&ParentInfo>,
    ) -> ProcessResult<Selection> {
        Ok(Selection {
            matched: !child.is_evaluable() || child.evaluate(context, parent)?,
            stop: false,
        })
    }
}

/// Tag-specific meaning of a statement. Every method has a default, so a
/// behavior only overrides the capabilities it has.
pub trait StatementBehavior: Send + Sync + fmt::Debug {
    fn acceptance(&self) -> Acceptance {
        Acceptance::default()
    }

    /// Phase this statement establishes for its subtree.
    fn own_phase(&self) -> Option<Phase> {
        None
    }

    fn accepts_parent(&self, _parent: Option<&Statement>) -> bool {
        true
    }

    /// Called only when the statement accepts children at all.
    fn accepts_child(&self, _tag: &str, _siblings: &[Statement]) -> bool {
        true
    }

    /// Reads attributes. The parser is on the statement's start tag.
    fn initialize_self(
        &mut self,
        _tag: &str,
        _acceptance: &mut Acceptance,
        _context: &mut LoadContext,
    ) -> bool {
        true
    }

    /// Consumes accepted content or an accepted extension element. Returning
    /// false leaves the token to the default handling.
    fn extend_self(&mut self, _tag: &str, _context: &mut LoadContext) -> bool {
        false
    }

    fn validate_self(
        &self,
        _tag: &str,
        _acceptance: &Acceptance,
        _children: &[Statement],
        _context: &mut LoadContext,
    ) {
    }

    /// Reports constraints that depend on the phase the statement ended up in.
    fn check_phase(&self, _tag: &str, _phase: Phase, _context: &mut LoadContext) {}

    fn read_root(&self) -> Option<&str> {
        None
    }

    fn write_root(&self) -> Option<&str> {
        None
    }

    fn process_self(
        &self,
        _context: &mut ProcessContext,
        _parent: Option<&ParentInfo>,
    ) -> ProcessResult<Step> {
        Ok(Step::Descend(None))
    }

    /// Runs after the children whenever `process_self` descended.
    fn finish(&self, _context: &mut ProcessContext) {}

    fn child_predicate(&self) -> &dyn ChildPredicate {
        &AllChildren
    }

    fn is_evaluable(&self) -> bool {
        false
    }

    fn evaluate(&self, _context: &ProcessContext, _parent: Option<&ParentInfo>) -> ProcessResult<bool> {
        Ok(false)
    }
}

#[derive(Debug)]
pub struct Statement {
    tag: String,
    uid: Option<String>,
    phase: Phase,
    state: InitializationState,
    acceptance: Acceptance,
    read_root: Option<String>,
    write_root: Option<String>,
    children: Vec<Statement>,
    behavior: Box<dyn StatementBehavior>,
}

impl Statement {
    pub fn new(behavior: Box<dyn StatementBehavior>) -> Self {
        Self {
            tag: String::new(),
            uid: None,
            phase: Phase::Unknown,
            state: InitializationState::New,
            acceptance: behavior.acceptance(),
            read_root: None,
            write_root: None,
            children: Vec::new(),
            behavior,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> InitializationState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == InitializationState::Initialized
    }

    pub fn acceptance(&self) -> Acceptance {
        self.acceptance
    }

    pub fn children(&self) -> &[Statement] {
        &self.children
    }

    pub fn read_root(&self) -> Option<&str> {
        self.read_root.as_deref().or_else(|| self.behavior.read_root())
    }

    pub fn write_root(&self) -> Option<&str> {
        self.write_root.as_deref().or_else(|| self.behavior.write_root())
    }

    pub fn accepts_child(&self, tag: &str) -> bool {
        self.acceptance.children && !tag.is_empty() && self.behavior.accepts_child(tag, &self.children)
    }

    pub fn accepts_parent(&self, parent: Option<&Statement>) -> bool {
        self.behavior.accepts_parent(parent)
    }

    pub fn is_evaluable(&self) -> bool {
        self.behavior.is_evaluable()
    }

    pub fn evaluate(&self, context: &ProcessContext, parent: Option<&ParentInfo>) -> ProcessResult<bool> {
        if !self.is_evaluable() {
            return Ok(false);
        }
        self.behavior.evaluate(context, parent)
    }

    /// Builds the statement and its subtree from the element under the
    /// parser. Leaves the parser on the element's end tag. Returns false when
    /// the statement itself is unusable; defects in children only drop those
    /// children.
    pub fn initialize(&mut self, context: &mut LoadContext, parent: Option<&Statement>) -> bool {
        if self.state != InitializationState::New {
            context.outcomes_mut().error(
                codes::STRUCTURE,
                format!("statement '{}' cannot be initialized twice", self.tag),
            );
            return false;
        }
        self.state = InitializationState::InProgress;
        self.tag = context.current_tag().unwrap_or_default().to_string();
        self.uid = context.current_attribute(tags::ATTR_UID).map(str::to_string);
        self.read_root = context
            .current_attribute(tags::ATTR_READ_ROOT)
            .map(str::to_string);
        self.write_root = context
            .current_attribute(tags::ATTR_WRITE_ROOT)
            .map(str::to_string);
        self.phase = self
            .behavior
            .own_phase()
            .or_else(|| parent.map(Statement::phase))
            .unwrap_or(Phase::Unknown);

        let mark = context.outcomes().mark();
        if !self
            .behavior
            .initialize_self(&self.tag, &mut self.acceptance, context)
        {
            context.skip();
            self.state = InitializationState::Failed;
            return false;
        }
        let mut failed = context.outcomes().severity_since(mark) >= Severity::Error;

        while context.next() {
            if context.at_end_tag(None) {
                break;
            } else if context.at_start_tag(None) {
                self.handle_start_tag(context);
            } else if context.at_content() {
                self.handle_content(context);
            }
        }

        let mark = context.outcomes().mark();
        self.behavior
            .validate_self(&self.tag, &self.acceptance, &self.children, context);
        failed |= context.outcomes().severity_since(mark) >= Severity::Error;

        self.state = if failed {
            InitializationState::Failed
        } else {
            InitializationState::Initialized
        };
        trace!(tag = %self.tag, state = %self.state, "statement initialized");
        !failed
    }

    fn handle_start_tag(&mut self, context: &mut LoadContext) {
        let tag = context.current_tag().unwrap_or_default().to_string();
        let factory = context.factory().clone();
        if factory.is_statement(&tag) {
            if let Some(child) = factory.create(context, Some(&*self)) {
                self.children.push(child);
            }
        } else if self.acceptance.extensions {
            if !self.behavior.extend_self(&self.tag, context) {
                context.outcomes_mut().warning(
                    codes::STRUCTURE,
                    format!("'{}' ignored extension element '{}'", self.tag, tag),
                );
                context.skip();
            }
        } else {
            context.outcomes_mut().warning(
                codes::STRUCTURE,
                format!("unrecognized element '{}' in '{}'", tag, self.tag),
            );
            context.skip();
        }
    }

    fn handle_content(&mut self, context: &mut LoadContext) {
        if context.is_current_content_space() {
            return;
        }
        if self.acceptance.content && self.behavior.extend_self(&self.tag, context) {
            return;
        }
        context.outcomes_mut().warning(
            codes::STRUCTURE,
            format!("ignoring unexpected content in '{}'", self.tag),
        );
    }

    /// Walks the subtree reporting phase-dependent constraint violations.
    pub fn check_phase(&self, context: &mut LoadContext) {
        self.behavior.check_phase(&self.tag, self.phase, context);
        for child in &self.children {
            child.check_phase(context);
        }
    }

    /// Runs the statement with its cursor roots in effect. The roots are
    /// restored before returning, whatever the result.
    pub fn process(&self, context: &mut ProcessContext, parent: Option<&ParentInfo>) -> ProcessResult<Flow> {
        if !self.is_initialized() {
            return Err(ProcessError::Uninitialized {
                tag: self.tag.clone(),
            });
        }
        let read = context.read_cursor_mut().push_root(self.read_root());
        let write = context.write_cursor_mut().push_root(self.write_root());
        let result = if read.is_valid() && write.is_valid() {
            self.run(context, parent)
        } else {
            debug!(tag = %self.tag, "cursor root does not resolve, statement skipped");
            Ok(Flow::Continue)
        };
        context.write_cursor_mut().pop_to(write);
        context.read_cursor_mut().pop_to(read);
        result
    }

    fn run(&self, context: &mut ProcessContext, parent: Option<&ParentInfo>) -> ProcessResult<Flow> {
        match self.behavior.process_self(context, parent)? {
            Step::Done => Ok(Flow::Continue),
            Step::Abort => Ok(Flow::Abort),
            Step::Fail => Ok(Flow::Fail),
            Step::Descend(info) => {
                let flow = self.process_children(context, info.as_ref());
                self.behavior.finish(context);
                flow
            }
        }
    }

    fn process_children(&self, context: &mut ProcessContext, info: Option<&ParentInfo>) -> ProcessResult<Flow> {
        let predicate = self.behavior.child_predicate();
        for child in &self.children {
            let selection = predicate.select(child, context, info)?;
            if selection.matched {
                match child.process(context, info)? {
                    Flow::Continue => {}
                    flow => return Ok(flow),
                }
            }
            if selection.stop {
                break;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Compiles a required expression attribute, recording why when it cannot.
pub(crate) fn compile_attribute(
    context: &mut LoadContext,
    tag: &str,
    attribute: &str,
) -> Option<Arc<dyn CompiledExpression>> {
    let Some(expression) = context.current_attribute(attribute).map(str::to_string) else {
        context.outcomes_mut().error(
            codes::ATTRIBUTE,
            format!("'{}' requires a '{}' attribute", tag, attribute),
        );
        return None;
    };
    compile_expression(context, tag, attribute, &expression)
}

pub(crate) fn compile_expression(
    context: &mut LoadContext,
    tag: &str,
    attribute: &str,
    expression: &str,
) -> Option<Arc<dyn CompiledExpression>> {
    match context.compile(expression) {
        Ok(compiled) => Some(compiled),
        Err(error) => {
            context.outcomes_mut().error(
                codes::EXPRESSION,
                format!("'{}' has an invalid '{}' expression: {}", tag, attribute, error),
            );
            None
        }
    }
}

/// True when the parent exists and carries `tag`.
pub(crate) fn parent_is(parent: Option<&Statement>, tag: &str) -> bool {
    parent.map_or(false, |p| p.tag() == tag)
}

pub(crate) fn has_sibling(siblings: &[Statement], tag: &str) -> bool {
    siblings.iter().any(|s| s.tag() == tag)
}

/// Expression a behavior compiled during initialization.
pub(crate) fn required<'a>(
    expression: &'a Option<Arc<dyn CompiledExpression>>,
    tag: &str,
) -> ProcessResult<&'a dyn CompiledExpression> {
    expression
        .as_deref()
        .ok_or_else(|| ProcessError::Uninitialized {
            tag: tag.to_string(),
        })
}
