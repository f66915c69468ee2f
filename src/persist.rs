//! Mid-transaction persistence of process state as XML snippets.

use thiserror::Error;
use tracing::warn;

use crate::xml::{PullParser, XmlError, XmlPullSource, XmlResult, XmlWriter};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("expected '{0}' element")]
    MissingElement(String),
    #[error("invalid frame count '{0}'")]
    InvalidFrameCount(String),
    #[error("invalid frame index '{0}'")]
    InvalidFrameIndex(String),
    #[error("duplicate frame index {0}")]
    DuplicateFrame(usize),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// State that can be written to, and rebuilt from, an XML snippet.
///
/// `restore` is entered with the source positioned on the component's start
/// tag and leaves it on the matching end tag. An error means the component
/// kept its previous state.
pub trait Persistent {
    const ELEMENT: &'static str;

    fn persist(&self, writer: &mut XmlWriter) -> XmlResult<()>;

    fn restore(&mut self, source: &mut dyn XmlPullSource) -> PersistResult<()>;

    fn to_xml(&self) -> XmlResult<String> {
        let mut writer = XmlWriter::new();
        self.persist(&mut writer)?;
        writer.into_string()
    }

    /// Restores from the first `ELEMENT` found in `xml`.
    fn restore_xml(&mut self, xml: &str) -> PersistResult<()> {
        let mut parser = PullParser::new(xml)?;
        if !parser.seek_start_tag(Self::ELEMENT) {
            return Err(PersistError::MissingElement(Self::ELEMENT.to_string()));
        }
        self.restore(&mut parser)
    }
}

pub(crate) fn expect_start(source: &dyn XmlPullSource, element: &str) -> PersistResult<()> {
    if source.at_start_tag(Some(element)) {
        Ok(())
    } else {
        Err(PersistError::MissingElement(element.to_string()))
    }
}

/// Reads an attribute the entry cannot do without, logging when it is absent.
pub(crate) fn required_attribute(
    source: &dyn XmlPullSource,
    element: &str,
    attribute: &str,
) -> Option<String> {
    let value = source.current_attribute(attribute).map(str::to_string);
    if value.is_none() {
        warn!("'{}' entry without '{}' attribute skipped", element, attribute);
    }
    value
}

/// Moves past the rest of `element` after a failed restore, so the caller can
/// carry on with the next sibling.
pub(crate) fn skip_to_end(source: &mut dyn XmlPullSource, element: &str) {
    if source.at_start_tag(Some(element)) {
        source.skip();
        return;
    }
    let mut depth = 0usize;
    loop {
        if source.at_start_tag(None) {
            depth += 1;
        } else if source.at_end_tag(None) {
            if depth == 0 && source.at_end_tag(Some(element)) {
                return;
            }
            depth = depth.saturating_sub(1);
        }
        if !source.next() {
            return;
        }
    }
}
