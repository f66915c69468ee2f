//! XML plumbing shared by the loader, the cursors and persisted state.
//!
//! Scripts and persisted state are consumed through [`XmlPullSource`], a
//! forward-only token view. [`PullParser`] is the default source, backed by
//! `quick-xml`. Transaction data lives in the arena [`Document`].

mod document;
mod parser;
mod writer;

pub use document::{Document, NodeId};
pub use parser::{PullParser, XmlEvent, XmlPullSource};
pub use writer::XmlWriter;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum XmlError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("unexpected end tag '{found}'")]
    UnexpectedEnd { found: String },
    #[error("element '{0}' is never closed")]
    Unclosed(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("invalid path '{0}'")]
    InvalidPath(String),
}

pub type XmlResult<T> = Result<T, XmlError>;
