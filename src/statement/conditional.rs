//! Branching statements.

use std::sync::Arc;

use super::{
    compile_attribute, has_sibling, parent_is, required, tags, Acceptance, ChildPredicate,
    FirstEvaluatedChild, ParentInfo, ProcessResult, Statement, StatementBehavior, Step,
};
use crate::context::{LoadContext, ProcessContext};
use crate::xpath::CompiledExpression;

/// Runs its children only when `test` holds.
#[derive(Debug, Default)]
pub struct IfStatement {
    test: Option<Arc<dyn CompiledExpression>>,
}

impl StatementBehavior for IfStatement {
    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        self.test = compile_attribute(context, tag, tags::ATTR_TEST);
        self.test.is_some()
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        let test = required(&self.test, tags::IF)?;
        if context.read_cursor().evaluate_bool(test)? {
            Ok(Step::Descend(None))
        } else {
            Ok(Step::Done)
        }
    }
}

#[derive(Debug)]
pub struct ChooseStatement;

impl StatementBehavior for ChooseStatement {
    fn accepts_child(&self, tag: &str, siblings: &[Statement]) -> bool {
        (tag == tags::WHEN || tag == tags::OTHERWISE) && !has_sibling(siblings, tags::OTHERWISE)
    }

    fn child_predicate(&self) -> &dyn ChildPredicate {
        &FirstEvaluatedChild
    }
}

#[derive(Debug, Default)]
pub struct WhenStatement {
    test: Option<Arc<dyn CompiledExpression>>,
}

impl StatementBehavior for WhenStatement {
    fn accepts_parent(&self, parent: Option<&Statement>) -> bool {
        parent_is(parent, tags::CHOOSE)
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        self.test = compile_attribute(context, tag, tags::ATTR_TEST);
        self.test.is_some()
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn evaluate(&self, context: &ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<bool> {
        let test = required(&self.test, tags::WHEN)?;
        Ok(context.read_cursor().evaluate_bool(test)?)
    }
}

#[derive(Debug)]
pub struct OtherwiseStatement;

impl StatementBehavior for OtherwiseStatement {
    fn accepts_parent(&self, parent: Option<&Statement>) -> bool {
        parent_is(parent, tags::CHOOSE)
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn evaluate(&self, _: &ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<bool> {
        Ok(true)
    }
}

/// Evaluates `test` to a string and runs the first `case` whose value equals
/// it, or the `default`.
#[derive(Debug, Default)]
pub struct SwitchStatement {
    test: Option<Arc<dyn CompiledExpression>>,
}

impl StatementBehavior for SwitchStatement {
    fn accepts_child(&self, tag: &str, siblings: &[Statement]) -> bool {
        (tag == tags::CASE || tag == tags::DEFAULT) && !has_sibling(siblings, tags::DEFAULT)
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        self.test = compile_attribute(context, tag, tags::ATTR_TEST);
        self.test.is_some()
    }

    fn process_self(&self, context: &mut ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<Step> {
        let test = required(&self.test, tags::SWITCH)?;
        let value = context.read_cursor().evaluate_string(test)?;
        Ok(Step::Descend(Some(ParentInfo::Comparable(value))))
    }

    fn child_predicate(&self) -> &dyn ChildPredicate {
        &FirstEvaluatedChild
    }
}

#[derive(Debug, Default)]
pub struct CaseStatement {
    value: Option<Arc<dyn CompiledExpression>>,
}

impl StatementBehavior for CaseStatement {
    fn accepts_parent(&self, parent: Option<&Statement>) -> bool {
        parent_is(parent, tags::SWITCH)
    }

    fn initialize_self(&mut self, tag: &str, _: &mut Acceptance, context: &mut LoadContext) -> bool {
        self.value = compile_attribute(context, tag, tags::ATTR_VALUE);
        self.value.is_some()
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn evaluate(&self, context: &ProcessContext, parent: Option<&ParentInfo>) -> ProcessResult<bool> {
        let Some(ParentInfo::Comparable(expected)) = parent else {
            return Ok(false);
        };
        let value = required(&self.value, tags::CASE)?;
        Ok(context.read_cursor().evaluate_string(value)? == *expected)
    }
}

#[derive(Debug)]
pub struct DefaultStatement;

impl StatementBehavior for DefaultStatement {
    fn accepts_parent(&self, parent: Option<&Statement>) -> bool {
        parent_is(parent, tags::SWITCH)
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn evaluate(&self, _: &ProcessContext, _: Option<&ParentInfo>) -> ProcessResult<bool> {
        Ok(true)
    }
}
