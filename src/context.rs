//! Load-time and process-time contexts.
//!
//! A [`LoadContext`] carries the parser, registries and ledger while scripts
//! are turned into statement trees. A [`ProcessContext`] owns everything one
//! transaction touches while trees run: the documents behind the cursors, the
//! variable and trace stacks, the outcome ledger and the log agent filter.
//! Neither is shared between threads.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cursor::{ReadCursor, VariableBindings, WriteCursor};
use crate::log_agent::{FilterMode, LogAgentState, LogAgentVariant, MatchKind};
use crate::outcome::{OutcomeContext, Outcomes};
use crate::persist::{expect_start, skip_to_end, PersistResult, Persistent};
use crate::statement::{Factory, Library, Phase};
use crate::trace::{TraceCategory, TraceDefaults, TraceState};
use crate::variables::{fold_name, Variables};
use crate::xml::{Document, PullParser, XmlPullSource, XmlResult, XmlWriter};
use crate::xpath::{CompiledExpression, XPathEngine, XPathResult};

/// Identity of the request a transaction serves.
pub trait RequestContext {
    fn service(&self) -> &str;
    fn method(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service: String,
    pub method: String,
}

impl ServiceRequest {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl RequestContext for ServiceRequest {
    fn service(&self) -> &str {
        &self.service
    }

    fn method(&self) -> &str {
        &self.method
    }
}

pub struct LoadContext {
    factory: Factory,
    library: Library,
    xpath: Arc<dyn XPathEngine>,
    parser: PullParser,
    outcomes: Outcomes,
    service_constraints: HashSet<String>,
    phase_exclusions: HashSet<Phase>,
    service: Option<String>,
    method: Option<String>,
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("outcomes", &self.outcomes.events().len())
            .finish()
    }
}

impl LoadContext {
    pub fn new(factory: Factory, xpath: Arc<dyn XPathEngine>) -> Self {
        Self {
            factory,
            library: Library::new(),
            xpath,
            parser: PullParser::default(),
            outcomes: Outcomes::new(),
            service_constraints: HashSet::new(),
            phase_exclusions: HashSet::new(),
            service: None,
            method: None,
        }
    }

    pub fn with_library(mut self, library: Library) -> Self {
        self.library = library;
        self
    }

    pub fn with_outcomes(mut self, outcomes: Outcomes) -> Self {
        self.outcomes = outcomes;
        self
    }

    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn xpath(&self) -> &Arc<dyn XPathEngine> {
        &self.xpath
    }

    pub fn outcomes(&self) -> &Outcomes {
        &self.outcomes
    }

    pub fn outcomes_mut(&mut self) -> &mut Outcomes {
        &mut self.outcomes
    }

    pub fn into_outcomes(self) -> Outcomes {
        self.outcomes
    }

    /// Replaces the parser input. The parser starts before the first token.
    pub fn set_input(&mut self, xml: &str) -> XmlResult<()> {
        self.parser = PullParser::new(xml)?;
        Ok(())
    }

    pub fn compile(&self, expression: &str) -> XPathResult<Arc<dyn CompiledExpression>> {
        self.xpath.compile(expression)
    }

    pub fn next(&mut self) -> bool {
        self.parser.next()
    }

    pub fn skip(&mut self) -> bool {
        self.parser.skip()
    }

    pub fn at_start_tag(&self, tag: Option<&str>) -> bool {
        self.parser.at_start_tag(tag)
    }

    pub fn at_end_tag(&self, tag: Option<&str>) -> bool {
        self.parser.at_end_tag(tag)
    }

    pub fn at_content(&self) -> bool {
        self.parser.at_content()
    }

    pub fn current_tag(&self) -> Option<&str> {
        self.parser.current_tag()
    }

    pub fn current_attribute(&self, attribute: &str) -> Option<&str> {
        self.parser.current_attribute(attribute)
    }

    pub fn current_content(&self) -> Option<&str> {
        self.parser.current_content()
    }

    pub fn is_current_content_space(&self) -> bool {
        self.parser.is_current_content_space()
    }

    pub fn add_service_constraint(&mut self, service: &str) {
        self.service_constraints.insert(fold_name(service));
    }

    pub fn remove_service_constraint(&mut self, service: &str) {
        self.service_constraints.remove(&fold_name(service));
    }

    pub fn clear_service_constraints(&mut self) {
        self.service_constraints.clear();
    }

    /// With no constraints every service is accepted.
    pub fn is_service_accepted(&self, service: &str) -> bool {
        self.service_constraints.is_empty()
            || self.service_constraints.contains(&fold_name(service))
    }

    pub fn exclude_phase(&mut self, phase: Phase) {
        self.phase_exclusions.insert(phase);
    }

    pub fn include_phase(&mut self, phase: Phase) {
        self.phase_exclusions.remove(&phase);
    }

    pub fn is_phase_excluded(&self, phase: Phase) -> bool {
        self.phase_exclusions.contains(&phase)
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn set_service(&mut self, service: Option<&str>) {
        self.service = service.map(str::to_string);
    }

    pub fn set_method(&mut self, method: Option<&str>) {
        self.method = method.map(str::to_string);
    }
}

/// Frame depths recorded when a phase starts, restored when it ends.
#[derive(Debug)]
pub(crate) struct PhaseMarks {
    phase: Phase,
    variables: usize,
    trace: usize,
    read: usize,
    write: usize,
    outcome_context: OutcomeContext,
}

/// State owned by one transaction.
#[derive(Debug)]
pub struct ProcessContext {
    transaction: Uuid,
    service: String,
    method: String,
    phase: Phase,
    read_cursor: ReadCursor,
    write_cursor: WriteCursor,
    variables: Variables,
    trace_state: TraceState,
    outcomes: Outcomes,
    log_agents: LogAgentState,
    log_filter_path: Vec<usize>,
}

/// Inputs for a new transaction beyond the request identity.
pub(crate) struct ProcessSetup<'a> {
    pub read_document: Document,
    pub read_root: &'a str,
    pub write_root: &'a str,
    pub xpath: Arc<dyn XPathEngine>,
    pub trace_defaults: Arc<TraceDefaults>,
    pub variants: Vec<Arc<LogAgentVariant>>,
    pub warning_as_failure: bool,
}

impl ProcessContext {
    pub(crate) fn new(request: &dyn RequestContext, setup: ProcessSetup<'_>) -> Self {
        let bindings = VariableBindings::new();
        let mut variables = Variables::new();
        variables.set_listener(Box::new(bindings.clone()));
        variables.push_frame();
        let mut trace_state = TraceState::new(setup.trace_defaults);
        trace_state.push_frame();

        let transaction = Uuid::new_v4();
        debug!(%transaction, service = request.service(), method = request.method(), "transaction started");
        Self {
            transaction,
            service: request.service().to_string(),
            method: request.method().to_string(),
            phase: Phase::Unknown,
            read_cursor: ReadCursor::new(setup.read_document, setup.read_root, bindings, setup.xpath),
            write_cursor: WriteCursor::new(Document::new(), setup.write_root),
            variables,
            trace_state,
            outcomes: Outcomes::with_warning_as_failure(setup.warning_as_failure),
            log_agents: LogAgentState::new(setup.variants),
            log_filter_path: Vec::new(),
        }
    }

    pub fn transaction(&self) -> Uuid {
        self.transaction
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn read_cursor(&self) -> &ReadCursor {
        &self.read_cursor
    }

    pub fn read_cursor_mut(&mut self) -> &mut ReadCursor {
        &mut self.read_cursor
    }

    pub fn write_cursor(&self) -> &WriteCursor {
        &self.write_cursor
    }

    pub fn write_cursor_mut(&mut self) -> &mut WriteCursor {
        &mut self.write_cursor
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    pub fn trace_state_mut(&mut self) -> &mut TraceState {
        &mut self.trace_state
    }

    pub fn outcomes(&self) -> &Outcomes {
        &self.outcomes
    }

    pub fn outcomes_mut(&mut self) -> &mut Outcomes {
        &mut self.outcomes
    }

    pub fn log_agents(&self) -> &LogAgentState {
        &self.log_agents
    }

    pub fn log_agents_mut(&mut self) -> &mut LogAgentState {
        &mut self.log_agents
    }

    /// The document written by the request and response phases.
    pub fn response(&self) -> &Document {
        self.write_cursor.document()
    }

    pub fn into_response(self) -> Document {
        self.write_cursor.into_document()
    }

    /// Logs through the trace state and records the message in the ledger.
    /// Returns whether the message was emitted.
    pub fn trace(&mut self, category: TraceCategory, code: u32, message: &str) -> bool {
        let text = format!("[{}|{}] {}", self.service, self.method, message);
        let emitted = self.trace_state.emit(category, code, &text);
        self.outcomes.record_silent(category.severity(), code, text);
        emitted
    }

    /// Narrows the filter node currently being refined. On success the new
    /// node becomes current until [`Self::end_log_agent_refinement`].
    pub fn refine_log_agents(&mut self, mode: FilterMode, kind: MatchKind, pattern: &str) -> bool {
        let Some(filter) = self.log_agents.filter_at(&self.log_filter_path) else {
            return false;
        };
        if filter.refine(mode, kind, pattern).is_none() {
            return false;
        }
        let index = filter.refinements().len() - 1;
        self.log_filter_path.push(index);
        true
    }

    pub fn end_log_agent_refinement(&mut self) {
        self.log_filter_path.pop();
    }

    pub(crate) fn enter_phase(&mut self, phase: Phase) -> PhaseMarks {
        let marks = PhaseMarks {
            phase: self.phase,
            variables: self.variables.depth(),
            trace: self.trace_state.depth(),
            read: self.read_cursor.depth(),
            write: self.write_cursor.depth(),
            outcome_context: self
                .outcomes
                .set_context(&self.service, &phase.to_string()),
        };
        self.phase = phase;
        self.variables.push_frame();
        self.trace_state.push_frame();
        self.log_filter_path.clear();
        marks
    }

    pub(crate) fn leave_phase(&mut self, marks: PhaseMarks) {
        while self.variables.depth() > marks.variables {
            if self.variables.pop_frame().is_err() {
                break;
            }
        }
        while self.trace_state.depth() > marks.trace {
            if self.trace_state.pop_frame().is_err() {
                break;
            }
        }
        self.read_cursor.truncate(marks.read);
        self.write_cursor.truncate(marks.write);
        self.log_filter_path.clear();
        self.outcomes.restore_context(marks.outcome_context);
        self.phase = marks.phase;
    }

    fn restore_component<T: Persistent>(component: &mut T, source: &mut dyn XmlPullSource) {
        if let Err(error) = component.restore(source) {
            warn!("failed to restore {}: {}", T::ELEMENT, error);
            skip_to_end(source, T::ELEMENT);
        }
    }
}

impl Persistent for ProcessContext {
    const ELEMENT: &'static str = "ProcessContext";

    fn persist(&self, writer: &mut XmlWriter) -> XmlResult<()> {
        let phase = self.phase.to_string();
        let transaction = self.transaction.to_string();
        writer.start(
            Self::ELEMENT,
            &[
                ("service", &self.service),
                ("method", &self.method),
                ("phase", &phase),
                ("transaction", &transaction),
            ],
        )?;
        self.variables.persist(writer)?;
        self.trace_state.persist(writer)?;
        self.log_agents.persist(writer)?;
        self.outcomes.persist(writer)?;
        writer.end(Self::ELEMENT)
    }

    /// Components that fail to restore keep their current state.
    fn restore(&mut self, source: &mut dyn XmlPullSource) -> PersistResult<()> {
        expect_start(source, Self::ELEMENT)?;
        if let Some(service) = source.current_attribute("service") {
            self.service = service.to_string();
        }
        if let Some(method) = source.current_attribute("method") {
            self.method = method.to_string();
        }
        if let Some(phase) = source.current_attribute("phase").and_then(|p| p.parse().ok()) {
            self.phase = phase;
        }
        if let Some(transaction) = source
            .current_attribute("transaction")
            .and_then(|t| Uuid::parse_str(t).ok())
        {
            self.transaction = transaction;
        }

        while source.next() {
            if source.at_end_tag(Some(Self::ELEMENT)) {
                break;
            }
            if !source.at_start_tag(None) {
                continue;
            }
            let tag = source.current_tag().unwrap_or_default().to_string();
            if tag == Variables::ELEMENT {
                Self::restore_component(&mut self.variables, source);
            } else if tag == TraceState::ELEMENT {
                Self::restore_component(&mut self.trace_state, source);
            } else if tag == LogAgentState::ELEMENT {
                Self::restore_component(&mut self.log_agents, source);
            } else if tag == Outcomes::ELEMENT {
                Self::restore_component(&mut self.outcomes, source);
            } else {
                warn!("skipping unexpected '{}' in process context", tag);
                source.skip();
            }
        }
        self.read_cursor.bindings().replace_all(self.variables.visible());
        self.log_filter_path.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpath::SimpleXPath;
    use pretty_assertions::assert_eq;

    fn process_context(variants: Vec<Arc<LogAgentVariant>>) -> ProcessContext {
        ProcessContext::new(
            &ServiceRequest::new("Svc", "Op"),
            ProcessSetup {
                read_document: Document::parse("<Req><Id>7</Id></Req>").unwrap(),
                read_root: "/Req",
                write_root: "/Resp",
                xpath: Arc::new(SimpleXPath),
                trace_defaults: Arc::new(TraceDefaults::default()),
                variants,
                warning_as_failure: false,
            },
        )
    }

    #[test]
    fn test_load_context_constraints() {
        let mut context = LoadContext::new(Factory::new(), Arc::new(SimpleXPath));
        assert!(context.is_service_accepted("Anything"));
        context.add_service_constraint("Billing");
        assert!(context.is_service_accepted("BILLING"));
        assert!(!context.is_service_accepted("Other"));
        context.remove_service_constraint("billing");
        assert!(context.is_service_accepted("Other"));

        context.exclude_phase(Phase::LogAgent);
        assert!(context.is_phase_excluded(Phase::LogAgent));
        context.include_phase(Phase::LogAgent);
        assert!(!context.is_phase_excluded(Phase::LogAgent));
    }

    #[test]
    fn test_phase_frames_are_restored() {
        let mut context = process_context(Vec::new());
        let marks = context.enter_phase(Phase::Request);
        assert_eq!(context.phase(), Phase::Request);
        let frame = context.variables().current_frame();
        context.variables_mut().define_variable("id", "7", frame).unwrap();
        assert_eq!(context.read_cursor().bindings().get("id").as_deref(), Some("7"));
        context.read_cursor_mut().push_root(Some("Id"));

        context.leave_phase(marks);
        assert_eq!(context.phase(), Phase::Unknown);
        assert_eq!(context.read_cursor().depth(), 1);
        assert!(context.read_cursor().bindings().get("id").is_none());
        assert!(!context.variables().is_variable("id"));
    }

    #[test]
    fn test_nested_refinement_tracks_path() {
        let variants = vec![
            Arc::new(LogAgentVariant::new("a", "file", "g1")),
            Arc::new(LogAgentVariant::new("b", "db", "g1")),
            Arc::new(LogAgentVariant::new("c", "db", "g2")),
        ];
        let mut context = process_context(variants);
        assert!(context.refine_log_agents(FilterMode::Inclusive, MatchKind::Group, "g1"));
        assert!(context.refine_log_agents(FilterMode::Exclusive, MatchKind::Type, "file"));
        context.end_log_agent_refinement();
        assert!(!context.refine_log_agents(FilterMode::Inclusive, MatchKind::Name, "b"));
        context.end_log_agent_refinement();

        let enabled: Vec<String> = context
            .log_agents()
            .enabled_variants()
            .iter()
            .map(|v| v.name().to_string())
            .collect();
        assert_eq!(enabled, vec!["b".to_string()]);
    }

    #[test]
    fn test_trace_records_with_request_prefix() {
        let mut context = process_context(Vec::new());
        assert!(context.trace(TraceCategory::Disaster, 9, "boom"));
        assert!(!context.trace(TraceCategory::DeveloperInfo, 1, "quiet"));
        let events = context.outcomes().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "[Svc|Op] boom");
        assert!(context.outcomes().is_error());
    }

    #[test]
    fn test_persist_and_restore_round_trip() {
        let mut original = process_context(vec![Arc::new(LogAgentVariant::new("a", "t", "g"))]);
        let frame = original.variables().current_frame();
        original.variables_mut().define_variable("user", "alice", frame).unwrap();
        original
            .trace_state_mut()
            .set_log_level(TraceCategory::UserInfo, crate::trace::LogLevel::MAX, None)
            .unwrap();
        original.outcomes_mut().warning(5, "careful");
        original.refine_log_agents(FilterMode::Exclusive, MatchKind::Name, "a");
        let xml = original.to_xml().unwrap();

        let mut restored = process_context(vec![Arc::new(LogAgentVariant::new("a", "t", "g"))]);
        restored.restore_xml(&xml).unwrap();
        assert_eq!(restored.transaction(), original.transaction());
        assert_eq!(restored.variables().query_variable("USER").unwrap().value, "alice");
        assert_eq!(restored.read_cursor().bindings().get("user").as_deref(), Some("alice"));
        assert_eq!(
            restored.trace_state().log_level(TraceCategory::UserInfo),
            crate::trace::LogLevel::MAX
        );
        assert_eq!(restored.outcomes().events().len(), 1);
        assert!(restored.log_agents().enabled_variants().is_empty());
    }
}
