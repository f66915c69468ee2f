use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{XmlError, XmlResult};

/// One token of a pull source.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    StartTag {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Content(String),
    EndTag {
        name: String,
    },
}

/// Forward-only view over a stream of XML tokens.
///
/// A self-closing element produces a start tag immediately followed by its
/// end tag, so consumers never need to special case it.
pub trait XmlPullSource {
    /// Advances to the next token. Returns false once the input is exhausted.
    fn next(&mut self) -> bool;

    fn current(&self) -> Option<&XmlEvent>;

    /// Moves from a start tag to its matching end tag. Any other position is
    /// left unchanged.
    fn skip(&mut self) -> bool;

    fn at_start_tag(&self, tag: Option<&str>) -> bool {
        match self.current() {
            Some(XmlEvent::StartTag { name, .. }) => tag.map_or(true, |t| t == name),
            _ => false,
        }
    }

    fn at_end_tag(&self, tag: Option<&str>) -> bool {
        match self.current() {
            Some(XmlEvent::EndTag { name }) => tag.map_or(true, |t| t == name),
            _ => false,
        }
    }

    fn at_content(&self) -> bool {
        matches!(self.current(), Some(XmlEvent::Content(_)))
    }

    /// Name of the current start or end tag.
    fn current_tag(&self) -> Option<&str> {
        match self.current() {
            Some(XmlEvent::StartTag { name, .. }) | Some(XmlEvent::EndTag { name }) => {
                Some(name.as_str())
            }
            _ => None,
        }
    }

    fn current_attribute(&self, attribute: &str) -> Option<&str> {
        match self.current() {
            Some(XmlEvent::StartTag { attributes, .. }) => attributes
                .iter()
                .find(|(key, _)| key == attribute)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    fn current_content(&self) -> Option<&str> {
        match self.current() {
            Some(XmlEvent::Content(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    fn is_current_content_space(&self) -> bool {
        self.current_content()
            .map_or(false, |text| text.chars().all(char::is_whitespace))
    }
}

/// Pull source over an in-memory document, tokenized up front.
#[derive(Debug, Clone, Default)]
pub struct PullParser {
    events: Vec<XmlEvent>,
    position: Option<usize>,
}

impl PullParser {
    pub fn new(xml: &str) -> XmlResult<Self> {
        Ok(Self {
            events: tokenize(xml)?,
            position: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Advances until a start tag with the given name is current.
    pub fn seek_start_tag(&mut self, tag: &str) -> bool {
        while self.next() {
            if self.at_start_tag(Some(tag)) {
                return true;
            }
        }
        false
    }
}

impl XmlPullSource for PullParser {
    fn next(&mut self) -> bool {
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next.min(self.events.len()));
        next < self.events.len()
    }

    fn current(&self) -> Option<&XmlEvent> {
        self.position.and_then(|p| self.events.get(p))
    }

    fn skip(&mut self) -> bool {
        let Some(start) = self.position else {
            return false;
        };
        if !self.at_start_tag(None) {
            return false;
        }
        let mut depth = 0usize;
        for (index, event) in self.events.iter().enumerate().skip(start) {
            match event {
                XmlEvent::StartTag { .. } => depth += 1,
                XmlEvent::EndTag { .. } => {
                    depth -= 1;
                    if depth == 0 {
                        self.position = Some(index);
                        return true;
                    }
                }
                XmlEvent::Content(_) => {}
            }
        }
        self.position = Some(self.events.len());
        false
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn start_tag(element: &BytesStart<'_>) -> XmlResult<XmlEvent> {
    let mut attributes = Vec::new();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| XmlError::Malformed {
            position: 0,
            message: e.to_string(),
        })?;
        let value = attribute.unescape_value().map_err(|e| XmlError::Malformed {
            position: 0,
            message: e.to_string(),
        })?;
        attributes.push((decode(attribute.key.as_ref()), value.into_owned()));
    }
    Ok(XmlEvent::StartTag {
        name: decode(element.name().as_ref()),
        attributes,
    })
}

fn push_content(events: &mut Vec<XmlEvent>, text: String) {
    if text.is_empty() {
        return;
    }
    match events.last_mut() {
        Some(XmlEvent::Content(existing)) => existing.push_str(&text),
        _ => events.push(XmlEvent::Content(text)),
    }
}

/// Reads the whole input into owned tokens, checking element balance.
pub(crate) fn tokenize(xml: &str) -> XmlResult<Vec<XmlEvent>> {
    let mut reader = Reader::from_str(xml);
    let mut events = Vec::new();
    let mut open: Vec<String> = Vec::new();

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader.read_event().map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })?;
        match event {
            Event::Start(element) => {
                open.push(decode(element.name().as_ref()));
                events.push(start_tag(&element)?);
            }
            Event::Empty(element) => {
                let name = decode(element.name().as_ref());
                events.push(start_tag(&element)?);
                events.push(XmlEvent::EndTag { name });
            }
            Event::End(element) => {
                let name = decode(element.name().as_ref());
                match open.pop() {
                    Some(expected) if expected == name => events.push(XmlEvent::EndTag { name }),
                    _ => return Err(XmlError::UnexpectedEnd { found: name }),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| XmlError::Malformed {
                    position,
                    message: e.to_string(),
                })?;
                if !open.is_empty() {
                    push_content(&mut events, text.into_owned());
                }
            }
            Event::CData(data) => push_content(&mut events, decode(&data.into_inner())),
            Event::Eof => break,
            _ => {}
        }
    }

    match open.pop() {
        Some(name) => Err(XmlError::Unclosed(name)),
        None => Ok(events),
    }
}
