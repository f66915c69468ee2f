//! Variables, flow control, trace levels and log agent filtering.

use std::str::FromStr;
use std::sync::Arc;

use super::{
    compile_expression, tags, Acceptance, ParentInfo, Phase, ProcessResult, Statement,
    StatementBehavior, Step,
};
use crate::context::{LoadContext, ProcessContext};
use crate::log_agent::{FilterMode, MatchKind};
use crate::outcome::codes;
use crate::trace::{LogLevel, TraceCategory};
use crate::variables::VariableState;
use crate::xpath::CompiledExpression;

fn required_text(context: &mut LoadContext, tag: &str, attribute: &str) -> Option<String> {
    match context.current_attribute(attribute) {
        Some(value) if !value.trim().is_empty() => Some(value.to_string()),
        _ => {
            context.outcomes_mut().error(
                codes::ATTRIBUTE,
                format!("'{}' requires a non-empty '{}' attribute", tag, attribute),
            );
            None
        }
    }
}

/// `xsdl:variable` defines, `xsdl:param` declares, in the frame current when
/// the statement runs.
#[derive(Debug)]
pub struct VariableStatement {
    state: VariableState,
    name: String,
    select: Option<Arc<dyn CompiledExpression>>,
}

impl VariableStatement {
    pub fn new(state: VariableState) -> Self {
        Self {
            state,
            name: String::new(),
            select: None,
        }
    }
}

impl StatementBehavior for VariableStatement {
    fn acceptance(&self) -> Acceptance {
        Acceptance::leaf()
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        let Some(name) = required_text(context, tag, "name") else {
            return false;
        };
        self.name = name;
        if let Some(select) = context.current_attribute("select").map(str::to_string) {
            self.select = compile_expression(context, tag, "select", &select);
            return self.select.is_some();
        }
        true
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        let value = match &self.select {
            Some(select) => context.read_cursor().evaluate_string(select.as_ref())?,
            None => String::new(),
        };
        let variables = context.variables_mut();
        let frame = variables.current_frame();
        variables.add_variable(self.state, &self.name, &value, frame)?;
        Ok(Step::Done)
    }
}

#[derive(Debug)]
pub struct AbortStatement;

impl StatementBehavior for AbortStatement {
    fn acceptance(&self) -> Acceptance {
        Acceptance::leaf()
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        context.outcomes_mut().info(codes::ABORTED, "script aborted");
        Ok(Step::Abort)
    }
}

#[derive(Debug)]
pub struct FailStatement {
    code: u32,
    message: String,
}

impl Default for FailStatement {
    fn default() -> Self {
        Self {
            code: codes::FAILED,
            message: "script failed".to_string(),
        }
    }
}

impl StatementBehavior for FailStatement {
    fn acceptance(&self) -> Acceptance {
        Acceptance::leaf()
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        if let Some(code) = context.current_attribute("code").map(str::to_string) {
            match code.trim().parse::<u32>() {
                Ok(code) => self.code = code,
                Err(_) => {
                    context.outcomes_mut().error(
                        codes::ATTRIBUTE,
                        format!("'{}' has an invalid code '{}'", tag, code),
                    );
                    return false;
                }
            }
        }
        if let Some(message) = context.current_attribute("message") {
            self.message = message.to_string();
        }
        true
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        context.outcomes_mut().error(self.code, self.message.clone());
        Ok(Step::Fail)
    }
}

#[derive(Debug)]
pub struct SetTraceLevelStatement {
    category: TraceCategory,
    level: LogLevel,
}

impl Default for SetTraceLevelStatement {
    fn default() -> Self {
        Self {
            category: TraceCategory::DeveloperInfo,
            level: LogLevel::NONE,
        }
    }
}

impl StatementBehavior for SetTraceLevelStatement {
    fn acceptance(&self) -> Acceptance {
        Acceptance::leaf()
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        let (Some(category), Some(level)) = (
            required_text(context, tag, "category"),
            required_text(context, tag, "level"),
        ) else {
            return false;
        };
        match (TraceCategory::from_str(category.trim()), LogLevel::from_str(&level)) {
            (Ok(category), Ok(level)) => {
                self.category = category;
                self.level = level;
                true
            }
            (Err(_), _) => {
                context.outcomes_mut().error(
                    codes::ATTRIBUTE,
                    format!("'{}' has an unknown trace category '{}'", tag, category),
                );
                false
            }
            (_, Err(message)) => {
                context
                    .outcomes_mut()
                    .error(codes::ATTRIBUTE, format!("'{}': {}", tag, message));
                false
            }
        }
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        context
            .trace_state_mut()
            .set_log_level(self.category, self.level, None)?;
        Ok(Step::Done)
    }
}

/// `xsdl:IncludeLogAgents` and `xsdl:ExcludeLogAgents`. Nested filter
/// statements refine the subset this one selects.
#[derive(Debug)]
pub struct LogAgentFilterStatement {
    mode: FilterMode,
    kind: MatchKind,
    pattern: String,
}

impl LogAgentFilterStatement {
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            kind: MatchKind::Name,
            pattern: String::new(),
        }
    }
}

impl StatementBehavior for LogAgentFilterStatement {
    fn accepts_child(&self, tag: &str, _: &[Statement]) -> bool {
        tag == tags::INCLUDE_LOG_AGENTS || tag == tags::EXCLUDE_LOG_AGENTS
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        let Some(by) = required_text(context, tag, "by") else {
            return false;
        };
        match MatchKind::from_str(by.trim()) {
            Ok(kind) if kind != MatchKind::Unfiltered => self.kind = kind,
            _ => {
                context.outcomes_mut().error(
                    codes::ATTRIBUTE,
                    format!("'{}' cannot filter by '{}'", tag, by),
                );
                return false;
            }
        }
        self.pattern = context
            .current_attribute("pattern")
            .unwrap_or_default()
            .to_string();
        true
    }

    fn check_phase(&self, tag: &str, phase: Phase, context: &mut LoadContext) {
        if phase != Phase::LogManager {
            context.outcomes_mut().error(
                codes::PHASE_CONSTRAINT,
                format!("'{}' is only allowed in '{}', found in {}", tag, tags::LOG_MANAGER_PHASE, phase),
            );
        }
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        if context.refine_log_agents(self.mode, self.kind, &self.pattern) {
            Ok(Step::Descend(None))
        } else {
            context.outcomes_mut().warning(
                codes::LOG_FILTER,
                format!(
                    "{} refinement by {} '{}' conflicts with its siblings",
                    self.mode, self.kind, self.pattern
                ),
            );
            Ok(Step::Done)
        }
    }

    fn finish(&self, context: &mut ProcessContext) {
        context.end_log_agent_refinement();
    }
}
