//! Phase repository and transaction entry points.
//!
//! Statement trees are stored per service, method and phase. Each level is
//! its own concurrent map; lookups clone the inner `Arc` and release the outer
//! guard before descending, so locks are only ever taken outer to inner.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::config::EnvironmentConfig;
use crate::context::{LoadContext, ProcessContext, ProcessSetup, RequestContext, ServiceRequest};
use crate::error::{ScriptError, ScriptResult};
use crate::log_agent::LogAgentVariant;
use crate::outcome::{codes, OutcomeType, Outcomes};
use crate::persist::Persistent;
use crate::statement::{tags, Factory, Flow, Library, Phase, ProcessError, Statement};
use crate::trace::TraceDefaults;
use crate::variables::fold_name;
use crate::xml::{Document, NodeId};
use crate::xpath::{SimpleXPath, XPathEngine};

type PhaseTrees = Arc<DashMap<Phase, Arc<Statement>>>;
type MethodTrees = Arc<DashMap<String, PhaseTrees>>;

/// How a phase run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PhaseResult {
    Success,
    Aborted,
    Failed,
    AbnormalTermination,
}

/// Script text bound to a service and, for phase content, a method.
#[derive(Debug, Clone)]
pub struct Script {
    pub content: String,
    pub service: String,
    pub method: Option<String>,
}

impl Script {
    pub fn new(content: &str, service: &str, method: Option<&str>) -> Self {
        Self {
            content: content.to_string(),
            service: service.to_string(),
            method: method.map(str::to_string),
        }
    }
}

const BINDING_DEFINITION: &str = "Definition";
const BINDING_METHODS: &str = "Methods";
const BINDING_METHOD: &str = "Method";
const BINDING_TRANSFORMS: &str = "Transforms";

pub struct Environment {
    config: EnvironmentConfig,
    factory: Factory,
    library: Library,
    services: DashMap<String, MethodTrees>,
    xpath: Arc<dyn XPathEngine>,
    trace_defaults: Arc<TraceDefaults>,
    variants: Vec<Arc<LogAgentVariant>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("services", &self.services.len())
            .field("library", &self.library.len())
            .field("variants", &self.variants.len())
            .finish()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(EnvironmentConfig::default())
    }
}

impl Environment {
    pub fn new(config: EnvironmentConfig) -> Self {
        let variants = config
            .log_agents
            .iter()
            .map(|agent| Arc::new(LogAgentVariant::from(agent)))
            .collect();
        Self {
            trace_defaults: Arc::new(TraceDefaults::from_config(&config.trace)),
            factory: Factory::with_builtins(),
            library: Library::new(),
            services: DashMap::new(),
            xpath: Arc::new(SimpleXPath),
            variants,
            config,
        }
    }

    pub fn with_xpath_engine(mut self, xpath: Arc<dyn XPathEngine>) -> Self {
        self.xpath = xpath;
        self
    }

    pub fn with_factory(mut self, factory: Factory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn create_load_context(&self) -> LoadContext {
        LoadContext::new(self.factory.clone(), Arc::clone(&self.xpath))
            .with_library(self.library.clone())
            .with_outcomes(Outcomes::with_warning_as_failure(
                self.config.warning_as_failure,
            ))
    }

    /// Loads one script document. Returns the worst outcome recorded while
    /// loading it.
    #[instrument(level = "debug", skip(self, context, script), fields(service = %script.service))]
    pub fn load_script(&self, context: &mut LoadContext, script: &Script) -> OutcomeType {
        if !context.is_service_accepted(&script.service) {
            debug!("service not accepted by the load constraints");
            return OutcomeType::Success;
        }
        let mark = context.outcomes().mark();
        context.set_service(Some(&script.service));
        context.set_method(script.method.as_deref());
        if let Err(error) = context.set_input(&script.content) {
            context
                .outcomes_mut()
                .error(codes::INPUT, format!("unreadable script: {}", error));
            return OutcomeType::Error;
        }
        while context.next() {
            if !context.at_start_tag(None) {
                continue;
            }
            if context.at_start_tag(Some(tags::ESDL_SCRIPT)) {
                self.load_fragment(context);
            } else {
                let tag = context.current_tag().unwrap_or_default().to_string();
                context.outcomes_mut().warning(
                    codes::STRUCTURE,
                    format!("skipping unexpected script element '{}'", tag),
                );
                context.skip();
            }
        }
        context.outcomes().outcome_since(mark)
    }

    /// Convenience wrapper creating its own load context.
    pub fn load(&self, content: &str, service: &str, method: Option<&str>) -> Outcomes {
        let mut context = self.create_load_context();
        self.load_script(&mut context, &Script::new(content, service, method));
        context.into_outcomes()
    }

    /// Loads the `EsdlScript` element under the parser, leaving the parser on
    /// its end tag.
    pub fn load_fragment(&self, context: &mut LoadContext) -> OutcomeType {
        let mark = context.outcomes().mark();
        while context.next() {
            if context.at_end_tag(None) {
                break;
            }
            if context.at_content() {
                if !context.is_current_content_space() {
                    context
                        .outcomes_mut()
                        .warning(codes::STRUCTURE, "ignoring text in script");
                }
                continue;
            }
            let tag = context.current_tag().unwrap_or_default().to_string();
            if tag == tags::LIBRARY {
                let library = context.library().clone();
                library.load(context);
            } else if let Some(phase) = Phase::from_tag(&tag) {
                self.load_phase(context, phase);
            } else {
                context.outcomes_mut().warning(
                    codes::STRUCTURE,
                    format!("skipping unexpected script element '{}'", tag),
                );
                context.skip();
            }
        }
        context.outcomes().outcome_since(mark)
    }

    fn load_phase(&self, context: &mut LoadContext, phase: Phase) {
        let (Some(service), Some(method)) = (
            context.service().map(fold_name),
            context.method().map(fold_name),
        ) else {
            context.outcomes_mut().error(
                codes::STRUCTURE,
                format!("unexpected phase statement '{}' outside a method definition", phase.tag()),
            );
            context.skip();
            return;
        };
        if context.is_phase_excluded(phase) {
            debug!(%phase, "phase excluded from loading");
            context.skip();
            return;
        }

        let methods = self.services.entry(service).or_default().value().clone();
        let phases = methods.entry(method.clone()).or_default().value().clone();
        if phases.contains_key(&phase) {
            Self::warn_extra_phase(context, phase, &method);
            context.skip();
            return;
        }
        let factory = context.factory().clone();
        let Some(statement) = factory.create(context, None) else {
            return;
        };
        match phases.entry(phase) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(statement));
                debug!(%phase, method = %method, "phase loaded");
            }
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                drop(entry);
                Self::warn_extra_phase(context, phase, &method);
            }
        };
    }

    fn warn_extra_phase(context: &mut LoadContext, phase: Phase, method: &str) {
        context.outcomes_mut().warning(
            codes::DUPLICATE,
            format!("ignoring extra '{}' statement for method '{}'", phase.tag(), method),
        );
    }

    /// Loads the scripts of a service binding. `service` is used when the
    /// definition does not name one.
    #[instrument(level = "debug", skip(self, context, xml))]
    pub fn load_binding(
        &self,
        context: &mut LoadContext,
        xml: &str,
        service: Option<&str>,
    ) -> ScriptResult<OutcomeType> {
        let document = Document::parse(xml)?;
        let root = document.root();
        let definition = document
            .descendants(root)
            .into_iter()
            .find(|node| *node != root && document.name(*node) == BINDING_DEFINITION)
            .ok_or_else(|| {
                ScriptError::Config(format!("binding has no '{}' element", BINDING_DEFINITION))
            })?;
        let service = document
            .attribute(definition, "esdlService")
            .or(service)
            .ok_or_else(|| ScriptError::Config("binding does not name a service".to_string()))?
            .to_string();
        if !context.is_service_accepted(&service) {
            debug!(%service, "service not accepted by the load constraints");
            return Ok(OutcomeType::Success);
        }

        let mark = context.outcomes().mark();
        for child in document.children(definition) {
            if document.name(*child) == tags::ESDL_SCRIPT {
                let script = Script::new(&document.element_to_xml(*child)?, &service, None);
                self.load_script(context, &script);
            }
        }
        let methods = document
            .child_named(definition, BINDING_METHODS)
            .map(|methods| document.children(methods).to_vec())
            .unwrap_or_default();
        for method_node in methods {
            if document.name(method_node) != BINDING_METHOD {
                continue;
            }
            let Some(method) = document.attribute(method_node, "name") else {
                context
                    .outcomes_mut()
                    .warning(codes::ATTRIBUTE, "binding method without a name ignored");
                continue;
            };
            for script in self.method_scripts(&document, method_node)? {
                self.load_script(context, &Script::new(&script, &service, Some(method)));
            }
        }
        info!(%service, "binding loaded");
        Ok(context.outcomes().outcome_since(mark))
    }

    /// Script documents carried by one binding method, legacy transforms
    /// wrapped into a request phase.
    fn method_scripts(&self, document: &Document, method: NodeId) -> ScriptResult<Vec<String>> {
        let wrap = |xml: String| {
            format!(
                "<{script}><{phase}>{xml}</{phase}></{script}>",
                script = tags::ESDL_SCRIPT,
                phase = tags::REQUEST_PHASE,
            )
        };
        let mut scripts = Vec::new();
        for child in document.children(method) {
            match document.name(*child) {
                tags::ESDL_SCRIPT => scripts.push(document.element_to_xml(*child)?),
                tags::CUSTOM_REQUEST_TRANSFORM => scripts.push(wrap(document.element_to_xml(*child)?)),
                BINDING_TRANSFORMS => {
                    for transform in document.children(*child) {
                        if document.name(*transform) == tags::CUSTOM_REQUEST_TRANSFORM {
                            scripts.push(wrap(document.element_to_xml(*transform)?));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(scripts)
    }

    /// Reports constraints that depend on where statements ended up, such as
    /// log agent filters outside the log manager phase.
    pub fn check_syntax(&self, context: &mut LoadContext) -> OutcomeType {
        let mark = context.outcomes().mark();
        for tree in self.trees() {
            tree.check_phase(context);
        }
        context.outcomes().outcome_since(mark)
    }

    fn trees(&self) -> Vec<Arc<Statement>> {
        let methods: Vec<MethodTrees> = self.services.iter().map(|e| Arc::clone(e.value())).collect();
        let phases: Vec<PhaseTrees> = methods
            .iter()
            .flat_map(|m| m.iter().map(|e| Arc::clone(e.value())).collect::<Vec<_>>())
            .collect();
        phases
            .iter()
            .flat_map(|p| p.iter().map(|e| Arc::clone(e.value())).collect::<Vec<_>>())
            .collect()
    }

    pub fn query_phase(&self, service: &str, method: &str, phase: Phase) -> Option<Arc<Statement>> {
        let methods = self
            .services
            .get(&fold_name(service))
            .map(|m| Arc::clone(m.value()))?;
        let phases = methods
            .get(&fold_name(method))
            .map(|p| Arc::clone(p.value()))?;
        let tree = phases.get(&phase).map(|t| Arc::clone(t.value()));
        tree
    }

    pub fn create_process_context(
        &self,
        request: &dyn RequestContext,
        read_document: Document,
    ) -> ProcessContext {
        ProcessContext::new(
            request,
            ProcessSetup {
                read_document,
                read_root: &self.config.read_root,
                write_root: &self.config.write_root,
                xpath: Arc::clone(&self.xpath),
                trace_defaults: Arc::clone(&self.trace_defaults),
                variants: self.variants.clone(),
                warning_as_failure: self.config.warning_as_failure,
            },
        )
    }

    /// Rebuilds a context from `ProcessContext` persistence output.
    pub fn restore_process_context(
        &self,
        xml: &str,
        read_document: Document,
    ) -> ScriptResult<ProcessContext> {
        let mut context = self.create_process_context(&ServiceRequest::new("", ""), read_document);
        context.restore_xml(xml)?;
        Ok(context)
    }

    /// Runs the tree bound to the context's service, method and `phase`.
    /// Failures inside the tree, panics included, are recorded and reported
    /// as [`PhaseResult::AbnormalTermination`].
    #[instrument(level = "debug", skip(self, context), fields(service = context.service(), method = context.method()))]
    pub fn process_phase(&self, context: &mut ProcessContext, phase: Phase) -> ScriptResult<PhaseResult> {
        let Some(tree) = self.query_phase(context.service(), context.method(), phase) else {
            return Ok(PhaseResult::Success);
        };
        let marks = context.enter_phase(phase);
        let result = panic::catch_unwind(AssertUnwindSafe(|| tree.process(context, None)));
        context.leave_phase(marks);

        let message = match result {
            Ok(Ok(Flow::Continue)) => return Ok(PhaseResult::Success),
            Ok(Ok(Flow::Abort)) => return Ok(PhaseResult::Aborted),
            Ok(Ok(Flow::Fail)) => return Ok(PhaseResult::Failed),
            Ok(Err(error @ ProcessError::Uninitialized { .. })) => {
                return Err(ScriptError::internal(error.to_string()))
            }
            Ok(Err(error)) => error.to_string(),
            Err(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string()),
        };
        context.outcomes_mut().error(
            codes::ABNORMAL,
            format!("abnormal termination of {} phase: {}", phase, message),
        );
        Ok(PhaseResult::AbnormalTermination)
    }

    pub fn process_preflight(&self, context: &mut ProcessContext) -> ScriptResult<PhaseResult> {
        self.process_phase(context, Phase::Preflight)
    }

    pub fn process_request(&self, context: &mut ProcessContext) -> ScriptResult<PhaseResult> {
        self.process_phase(context, Phase::Request)
    }

    pub fn process_response(&self, context: &mut ProcessContext) -> ScriptResult<PhaseResult> {
        self.process_phase(context, Phase::Response)
    }

    pub fn process_log_manager(&self, context: &mut ProcessContext) -> ScriptResult<PhaseResult> {
        self.process_phase(context, Phase::LogManager)
    }

    pub fn process_log_agent(&self, context: &mut ProcessContext) -> ScriptResult<PhaseResult> {
        self.process_phase(context, Phase::LogAgent)
    }
}
