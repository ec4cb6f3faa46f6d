use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Element of an XML payload tree. Names carry their namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Element holding only text content.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).text(text)
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn children<I>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = XmlElement>,
    {
        self.children
            .extend(children.into_iter().map(XmlNode::Element));
        self
    }

    /// Appends `child` only when present.
    pub fn optional(self, child: Option<XmlElement>) -> Self {
        match child {
            Some(child) => self.child(child),
            None => self,
        }
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Depth-first search for the first element called `name`.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| match child {
            XmlNode::Element(element) => element.find_mut(name),
            XmlNode::Text(_) => None,
        })
    }

    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| match child {
            XmlNode::Element(element) => element.find(name),
            XmlNode::Text(_) => None,
        })
    }

    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .map(|child| match child {
                XmlNode::Text(text) => text.clone(),
                XmlNode::Element(element) => element.text_content(),
            })
            .collect()
    }

    /// Serialization without the XML declaration; the form digested by signers.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, quick_xml::Error> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, self)?;
        Ok(writer.into_inner())
    }

    pub fn to_document_bytes(&self) -> Result<Vec<u8>, quick_xml::Error> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write_element(&mut writer, self)?;
        Ok(writer.into_inner())
    }
}

/// `(local name, text)` for every text node of a reply document, in document
/// order. Namespace prefixes are dropped.
pub fn leaf_texts(bytes: &[u8]) -> Result<Vec<(String, String)>, quick_xml::Error> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut texts = Vec::new();

    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Start(start) => {
                open.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
            }
            Event::End(_) => {
                open.pop();
            }
            Event::Text(text) => {
                if let Some(name) = open.last() {
                    texts.push((name.clone(), text.unescape()?.into_owned()));
                }
            }
            Event::CData(data) => {
                if let Some(name) = open.last() {
                    texts.push((
                        name.clone(),
                        String::from_utf8_lossy(&data.into_inner()).into_owned(),
                    ));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buffer.clear();
    }

    Ok(texts)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> Result<(), quick_xml::Error> {
    let mut start = BytesStart::new(element.name.as_str());
    for (name, value) in &element.attributes {
        start.push_attribute((name.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        match child {
            XmlNode::Element(nested) => write_element(writer, nested)?,
            XmlNode::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}
