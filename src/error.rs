use thiserror::Error;

use crate::persist::PersistError;
use crate::statement::ProcessError;
use crate::trace::TraceError;
use crate::variables::VariableError;
use crate::xml::XmlError;
use crate::xpath::XPathError;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("XML error: {0}")]
    Xml(#[from] XmlError),
    #[error("XPath error: {0}")]
    XPath(#[from] XPathError),
    #[error("Variable error: {0}")]
    Variable(#[from] VariableError),
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

impl ScriptError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ScriptError::Internal(message.into())
    }
}
