//! Expression evaluation seam.
//!
//! Statements compile their expressions once at load time through an
//! [`XPathEngine`] and evaluate the resulting [`CompiledExpression`] against
//! the read cursor at process time. [`SimpleXPath`] is the built-in engine.

mod simple;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::xml::{Document, NodeId};

pub use simple::SimpleXPath;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum XPathError {
    #[error("syntax error in '{expression}' at offset {offset}: {message}")]
    Syntax {
        expression: String,
        offset: usize,
        message: String,
    },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' does not take {count} argument(s)")]
    Arity { name: String, count: usize },
    #[error("undefined variable '${0}'")]
    UndefinedVariable(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

pub type XPathResult<T> = Result<T, XPathError>;

/// Source of `$name` bindings during evaluation.
pub trait VariableResolver {
    fn resolve(&self, name: &str) -> Option<String>;
}

impl VariableResolver for () {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Everything an expression may look at while evaluating.
pub struct EvaluationScope<'a> {
    pub document: &'a Document,
    pub node: NodeId,
    pub variables: &'a dyn VariableResolver,
}

#[derive(Debug, Clone, PartialEq)]
pub enum XPathValue {
    /// String values of the selected nodes, in document order.
    NodeSet(Vec<String>),
    String(String),
    Number(f64),
    Boolean(bool),
}

fn format_number(number: f64) -> String {
    if number.is_nan() {
        "NaN".to_string()
    } else if number.is_infinite() {
        if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        format!("{}", number)
    }
}

fn parse_number(text: &str) -> f64 {
    text.trim().parse::<f64>().unwrap_or(f64::NAN)
}

impl XPathValue {
    pub fn to_bool(&self) -> bool {
        match self {
            XPathValue::NodeSet(nodes) => !nodes.is_empty(),
            XPathValue::String(text) => !text.is_empty(),
            XPathValue::Number(number) => *number != 0.0 && !number.is_nan(),
            XPathValue::Boolean(value) => *value,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            XPathValue::NodeSet(nodes) => nodes.first().map_or(f64::NAN, |n| parse_number(n)),
            XPathValue::String(text) => parse_number(text),
            XPathValue::Number(number) => *number,
            XPathValue::Boolean(value) => {
                if *value {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn into_string(self) -> String {
        match self {
            XPathValue::NodeSet(nodes) => nodes.into_iter().next().unwrap_or_default(),
            XPathValue::String(text) => text,
            XPathValue::Number(number) => format_number(number),
            XPathValue::Boolean(value) => value.to_string(),
        }
    }
}

impl fmt::Display for XPathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().into_string())
    }
}

pub trait CompiledExpression: Send + Sync + fmt::Debug {
    fn source(&self) -> &str;

    fn evaluate(&self, scope: &EvaluationScope<'_>) -> XPathResult<XPathValue>;

    fn evaluate_bool(&self, scope: &EvaluationScope<'_>) -> XPathResult<bool> {
        Ok(self.evaluate(scope)?.to_bool())
    }

    fn evaluate_string(&self, scope: &EvaluationScope<'_>) -> XPathResult<String> {
        Ok(self.evaluate(scope)?.into_string())
    }
}

pub trait XPathEngine: Send + Sync + fmt::Debug {
    fn compile(&self, expression: &str) -> XPathResult<Arc<dyn CompiledExpression>>;
}
