use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::conditional::{
    CaseStatement, ChooseStatement, DefaultStatement, IfStatement, OtherwiseStatement,
    SwitchStatement, WhenStatement,
};
use super::control::{
    AbortStatement, FailStatement, LogAgentFilterStatement, SetTraceLevelStatement,
    VariableStatement,
};
use super::phase::{BlockStatement, Phase, PhaseStatement};
use super::update::{UpdateMode, ValueStatement};
use super::{tags, Statement, StatementBehavior};
use crate::context::LoadContext;
use crate::log_agent::FilterMode;
use crate::outcome::{codes, OutcomeType, Outcomes, Severity};
use crate::variables::VariableState;

/// Produces a fresh behavior for one element. `None` means construction
/// failed.
pub type Creator = Arc<dyn Fn() -> Option<Box<dyn StatementBehavior>> + Send + Sync>;

/// Registry of statement constructors keyed by element tag. A tag may be
/// bound more than once; the newest binding is used and unbinding reverts to
/// the one underneath.
#[derive(Clone, Default)]
pub struct Factory {
    creators: Arc<DashMap<String, Vec<Creator>>>,
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("tags", &self.tags())
            .finish()
    }
}

fn report(outcomes: Option<&mut Outcomes>, severity: Severity, message: String) -> OutcomeType {
    match outcomes {
        Some(outcomes) => outcomes.record(severity, codes::REGISTRY, message),
        None => debug!("{}", message),
    }
    OutcomeType::from(severity)
}

fn creator<F>(make: F) -> Creator
where
    F: Fn() -> Box<dyn StatementBehavior> + Send + Sync + 'static,
{
    Arc::new(move || -> Option<Box<dyn StatementBehavior>> { Some(make()) })
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with every built-in statement registered.
    pub fn with_builtins() -> Self {
        let factory = Self::new();
        factory.initialize();
        factory
    }

    /// Registers the built-in vocabulary. Returns the worst registration
    /// result.
    pub fn initialize(&self) -> OutcomeType {
        let mut builtins: Vec<(&str, Creator)> = Phase::roots()
            .map(|phase| {
                (
                    phase.tag(),
                    creator(move || Box::new(PhaseStatement::new(phase))),
                )
            })
            .collect();
        builtins.extend([
            (
                tags::CUSTOM_REQUEST_TRANSFORM,
                creator(|| Box::new(BlockStatement)),
            ),
            (tags::IF, creator(|| Box::<IfStatement>::default())),
            (tags::CHOOSE, creator(|| Box::new(ChooseStatement))),
            (tags::WHEN, creator(|| Box::<WhenStatement>::default())),
            (tags::OTHERWISE, creator(|| Box::new(OtherwiseStatement))),
            (tags::SWITCH, creator(|| Box::<SwitchStatement>::default())),
            (tags::CASE, creator(|| Box::<CaseStatement>::default())),
            (tags::DEFAULT, creator(|| Box::new(DefaultStatement))),
            (
                tags::SET_VALUE,
                creator(|| Box::new(ValueStatement::new(UpdateMode::Set))),
            ),
            (
                tags::APPEND_VALUE,
                creator(|| Box::new(ValueStatement::new(UpdateMode::Append))),
            ),
            (
                tags::VARIABLE,
                creator(|| Box::new(VariableStatement::new(VariableState::Defined))),
            ),
            (
                tags::PARAM,
                creator(|| Box::new(VariableStatement::new(VariableState::Declared))),
            ),
            (tags::ABORT, creator(|| Box::new(AbortStatement))),
            (tags::FAIL, creator(|| Box::<FailStatement>::default())),
            (
                tags::SET_TRACE_LEVEL,
                creator(|| Box::<SetTraceLevelStatement>::default()),
            ),
            (
                tags::INCLUDE_LOG_AGENTS,
                creator(|| Box::new(LogAgentFilterStatement::new(FilterMode::Inclusive))),
            ),
            (
                tags::EXCLUDE_LOG_AGENTS,
                creator(|| Box::new(LogAgentFilterStatement::new(FilterMode::Exclusive))),
            ),
        ]);

        let result = builtins
            .into_iter()
            .map(|(tag, creator)| self.register_statement(tag, creator, None))
            .fold(OutcomeType::Success, OutcomeType::worst);
        info!(tags = self.creators.len(), "statement factory initialized");
        result
    }

    pub fn register_statement(
        &self,
        tag: &str,
        creator: Creator,
        outcomes: Option<&mut Outcomes>,
    ) -> OutcomeType {
        if tag.is_empty() {
            return report(
                outcomes,
                Severity::Error,
                "cannot register a statement without a tag".to_string(),
            );
        }
        let mut bindings = self.creators.entry(tag.to_string()).or_default();
        bindings.push(creator);
        if bindings.len() > 1 {
            drop(bindings);
            report(
                outcomes,
                Severity::Warning,
                format!("statement '{}' rebound; previous binding retained", tag),
            )
        } else {
            drop(bindings);
            report(
                outcomes,
                Severity::Progress,
                format!("statement '{}' registered", tag),
            )
        }
    }

    /// Registers a constructor that cannot fail.
    pub fn register<F>(&self, tag: &str, make: F) -> OutcomeType
    where
        F: Fn() -> Box<dyn StatementBehavior> + Send + Sync + 'static,
    {
        self.register_statement(tag, creator(make), None)
    }

    pub fn unregister_statement(&self, tag: &str, outcomes: Option<&mut Outcomes>) -> OutcomeType {
        if tag.is_empty() {
            return report(
                outcomes,
                Severity::Error,
                "cannot unregister a statement without a tag".to_string(),
            );
        }
        let remaining = match self.creators.get_mut(tag) {
            None => None,
            Some(mut bindings) => {
                bindings.pop();
                Some(bindings.len())
            }
        };
        match remaining {
            None => report(
                outcomes,
                Severity::Progress,
                format!("statement '{}' was not registered", tag),
            ),
            Some(0) => {
                self.creators.remove_if(tag, |_, bindings| bindings.is_empty());
                report(
                    outcomes,
                    Severity::Progress,
                    format!("statement '{}' unregistered", tag),
                )
            }
            Some(_) => report(
                outcomes,
                Severity::Warning,
                format!("statement '{}' reverted to its previous binding", tag),
            ),
        }
    }

    pub fn is_statement(&self, tag: &str) -> bool {
        self.creators
            .get(tag)
            .map_or(false, |bindings| !bindings.is_empty())
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.creators.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Builds the statement for the start tag under the parser. Rejected
    /// elements are skipped, leaving the parser on their end tag.
    pub fn create(&self, context: &mut LoadContext, parent: Option<&Statement>) -> Option<Statement> {
        let tag = context.current_tag()?.to_string();
        if let Some(parent) = parent {
            if !parent.accepts_child(&tag) {
                context.outcomes_mut().warning(
                    codes::STRUCTURE,
                    format!("'{}' does not accept child '{}'", parent.tag(), tag),
                );
                context.skip();
                return None;
            }
        }

        let creator = self
            .creators
            .get(&tag)
            .and_then(|bindings| bindings.last().cloned());
        let Some(creator) = creator else {
            context
                .outcomes_mut()
                .warning(codes::STRUCTURE, format!("'{}' is not a defined statement", tag));
            context.skip();
            return None;
        };
        let Some(behavior) = creator() else {
            context.outcomes_mut().error(
                codes::STRUCTURE,
                format!("construction of statement '{}' failed", tag),
            );
            context.skip();
            return None;
        };

        let mut statement = Statement::new(behavior);
        if !statement.accepts_parent(parent) {
            let parent_tag = parent.map_or("<root>", Statement::tag);
            context.outcomes_mut().warning(
                codes::STRUCTURE,
                format!("'{}' cannot appear in '{}'", tag, parent_tag),
            );
            context.skip();
            return None;
        }

        statement
            .initialize(context, parent)
            .then_some(statement)
    }
}
