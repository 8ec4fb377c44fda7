use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum element nesting depth. Deeper documents are rejected
/// rather than walked.
const MAX_DEPTH: usize = 64;

/// Errors that can occur while parsing an RSS document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The XML itself is ill-formed (mismatched tags, bad syntax).
    #[error("XML parse error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    /// The document parsed but has no `<channel>` under its root element.
    #[error("Document has no <channel> element")]
    MissingChannel,

    /// The document ended with elements still open.
    #[error("Document ended inside <{0}>")]
    Truncated(String),

    /// SEC-003: Nesting depth exceeds the safety limit.
    #[error("Element nesting exceeds maximum of {0} levels")]
    TooDeep(usize),
}

/// Channel fields and items exactly as they appear in the feed.
///
/// Text is trimmed and XML entities are decoded, but HTML entities that were
/// escaped a second time (`&amp;amp;`) or sit in CDATA are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFeedDocument {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RawItem>,
}

/// One `<item>` as it appears in the feed, with its publish date unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
}

impl Field {
    fn for_channel(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" => Some(Field::Description),
            _ => None,
        }
    }

    fn for_item(name: &[u8]) -> Option<Self> {
        match name {
            b"pubDate" => Some(Field::PubDate),
            other => Self::for_channel(other),
        }
    }
}

/// Where the reader currently is relative to the first `<channel>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Outside,
    Channel,
    Item,
    Done,
}

/// Parses an RSS 2.0 document into a [`RawFeedDocument`].
///
/// The first `<channel>` directly under the root element supplies the
/// channel fields and its `<item>` children, in document order. Elements
/// are matched on their full name, so namespaced siblings such as
/// `<atom:link>` or `<dc:date>` are skipped. Text inside a field, including
/// text of nested markup, is concatenated.
///
/// # Errors
///
/// Returns [`ParseError`] for ill-formed XML, a document without a
/// channel, or a document that ends with open elements.
///
/// # Security
///
/// SEC-002: quick-xml never expands `<!ENTITY>` declarations; only the five
/// predefined XML entities and character references are decoded.
pub fn parse_feed(bytes: &[u8]) -> Result<RawFeedDocument, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().check_end_names = true;

    let mut doc = RawFeedDocument::default();
    let mut scope = Scope::Outside;
    let mut found_channel = false;
    let mut item = RawItem::default();

    // Open element names, innermost last
    let mut stack: Vec<String> = Vec::new();
    // Field currently collecting text and the stack depth it was opened at
    let mut field: Option<(Field, usize)> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| ParseError::Xml {
            position: reader.error_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => {
                let name = e.name();
                let name = name.as_ref();
                let depth = stack.len();

                if depth >= MAX_DEPTH {
                    return Err(ParseError::TooDeep(MAX_DEPTH));
                }

                match (scope, depth, field) {
                    (Scope::Outside, 1, _) if name == b"channel" => {
                        scope = Scope::Channel;
                        found_channel = true;
                    }
                    (Scope::Channel, 2, _) if name == b"item" => {
                        scope = Scope::Item;
                        item = RawItem::default();
                    }
                    (Scope::Channel, 2, None) => {
                        if let Some(f) = Field::for_channel(name) {
                            field = Some((f, depth + 1));
                            text.clear();
                        }
                    }
                    (Scope::Item, 3, None) => {
                        if let Some(f) = Field::for_item(name) {
                            field = Some((f, depth + 1));
                            text.clear();
                        }
                    }
                    _ => {}
                }

                stack.push(String::from_utf8_lossy(name).into_owned());
            }
            Event::End(_) => {
                let depth = stack.len();
                stack.pop();

                match field {
                    Some((f, field_depth)) if field_depth == depth => {
                        let value = text.trim().to_string();
                        match scope {
                            Scope::Channel => assign(&mut doc, f, value),
                            Scope::Item => assign_item(&mut item, f, value),
                            Scope::Outside | Scope::Done => {}
                        }
                        field = None;
                        text.clear();
                    }
                    Some(_) => {}
                    None => match (scope, depth) {
                        (Scope::Item, 3) => {
                            doc.items.push(std::mem::take(&mut item));
                            scope = Scope::Channel;
                        }
                        (Scope::Channel, 2) => scope = Scope::Done,
                        _ => {}
                    },
                }
            }
            Event::Text(e) => {
                if field.is_some() {
                    // Text with an entity XML doesn't define (e.g. `&nbsp;`) is kept
                    // verbatim; HTML entity decoding happens during normalization.
                    match e.unescape() {
                        Ok(t) => text.push_str(&t),
                        Err(_) => text.push_str(&String::from_utf8_lossy(&e)),
                    }
                }
            }
            Event::CData(e) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Truncated(open.clone()));
    }
    if !found_channel {
        return Err(ParseError::MissingChannel);
    }

    Ok(doc)
}

fn assign(doc: &mut RawFeedDocument, field: Field, value: String) {
    match field {
        Field::Title => doc.title = value,
        Field::Link => doc.link = value,
        Field::Description => doc.description = value,
        Field::PubDate => {}
    }
}

fn assign_item(item: &mut RawItem, field: Field, value: String) {
    match field {
        Field::Title => item.title = value,
        Field::Link => item.link = value,
        Field::Description => item.description = value,
        Field::PubDate => item.pub_date = value,
    }
}
