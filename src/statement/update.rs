use std::sync::Arc;

use super::{
    compile_expression, tags, Acceptance, ParentInfo, ProcessResult, Statement, StatementBehavior,
    Step,
};
use crate::context::{LoadContext, ProcessContext};
use crate::outcome::codes;
use crate::xpath::CompiledExpression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum UpdateMode {
    Set,
    Append,
}

#[derive(Debug)]
enum Source {
    /// `value=""`
    Empty,
    Expression(Arc<dyn CompiledExpression>),
    /// No `value`; nested statements write under the target.
    Nested,
}

/// `xsdl:SetValue` and `xsdl:appendValue`.
#[derive(Debug)]
pub struct ValueStatement {
    mode: UpdateMode,
    target: String,
    source: Source,
}

impl ValueStatement {
    pub fn new(mode: UpdateMode) -> Self {
        Self {
            mode,
            target: String::new(),
            source: Source::Nested,
        }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl StatementBehavior for ValueStatement {
    fn acceptance(&self) -> Acceptance {
        Acceptance::leaf()
    }

    fn initialize_self(&mut self, tag: &str, acceptance: &mut Acceptance, context: &mut LoadContext) -> bool {
        let target = context.current_attribute(tags::ATTR_TARGET).map(str::to_string);
        let value = context.current_attribute(tags::ATTR_VALUE).map(str::to_string);
        match target {
            Some(target) if !target.trim().is_empty() => self.target = target,
            _ => {
                context.outcomes_mut().error(
                    codes::ATTRIBUTE,
                    format!("'{}' requires a non-empty '{}' attribute", tag, tags::ATTR_TARGET),
                );
                return false;
            }
        }
        self.source = match value {
            None => {
                acceptance.children = true;
                Source::Nested
            }
            Some(value) if value.trim().is_empty() => Source::Empty,
            Some(value) => match compile_expression(context, tag, tags::ATTR_VALUE, &value) {
                Some(expression) => Source::Expression(expression),
                None => return false,
            },
        };
        true
    }

    fn validate_self(
        &self,
        tag: &str,
        acceptance: &Acceptance,
        children: &[Statement],
        context: &mut LoadContext,
    ) {
        if acceptance.children && children.is_empty() {
            context.outcomes_mut().error(
                codes::STRUCTURE,
                format!(
                    "'{}' without a '{}' attribute requires nested statements",
                    tag,
                    tags::ATTR_VALUE
                ),
            );
        }
    }

    fn write_root(&self) -> Option<&str> {
        match self.source {
            Source::Nested => Some(&self.target),
            _ => None,
        }
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        let value = match &self.source {
            Source::Nested => return Ok(Step::Descend(None)),
            Source::Empty => String::new(),
            Source::Expression(expression) => context.read_cursor().evaluate_string(expression.as_ref())?,
        };
        let cursor = context.write_cursor_mut();
        match self.mode {
            UpdateMode::Set => cursor.set_prop(&self.target, &value)?,
            UpdateMode::Append => cursor.append_prop(&self.target, &value)?,
        }
        Ok(Step::Done)
    }
}
