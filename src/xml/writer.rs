use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{XmlError, XmlResult};

/// Thin event writer used for persisted state and document serialization.
pub struct XmlWriter {
    writer: Writer<Vec<u8>>,
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlWriter {
    pub fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn element<'a>(name: &'a str, attributes: &[(&str, &str)]) -> BytesStart<'a> {
        let mut element = BytesStart::new(name);
        for (key, value) in attributes {
            element.push_attribute((*key, *value));
        }
        element
    }

    fn write(&mut self, event: Event<'_>) -> XmlResult<()> {
        self.writer
            .write_event(event)
            .map_err(|e| XmlError::Write(e.to_string()))
    }

    pub fn start(&mut self, name: &str, attributes: &[(&str, &str)]) -> XmlResult<()> {
        self.write(Event::Start(Self::element(name, attributes)))
    }

    pub fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) -> XmlResult<()> {
        self.write(Event::Empty(Self::element(name, attributes)))
    }

    pub fn end(&mut self, name: &str) -> XmlResult<()> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    pub fn text(&mut self, text: &str) -> XmlResult<()> {
        self.write(Event::Text(BytesText::new(text)))
    }

    pub fn into_string(self) -> XmlResult<String> {
        String::from_utf8(self.writer.into_inner()).map_err(|e| XmlError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_attributes_and_text() {
        let mut writer = XmlWriter::new();
        writer.start("a", &[("v", "x<y")]).unwrap();
        writer.text("1 & 2").unwrap();
        writer.empty("b", &[]).unwrap();
        writer.end("a").unwrap();
        assert_eq!(
            writer.into_string().unwrap(),
            r#"<a v="x&lt;y">1 &amp; 2<b/></a>"#
        );
    }
}
