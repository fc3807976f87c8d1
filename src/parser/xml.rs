//! Push/pull XML tokenizer for reporter output that arrives in arbitrary chunks.
//!
//! Chunks are appended with [`XmlTokenizer::push`]; complete tokens are pulled
//! with [`XmlTokenizer::next_token`]. Markup that is still incomplete stays
//! buffered until the next chunk. Each complete tag is decoded on its own with
//! `quick-xml`, so unbalanced documents (the process may be killed at any
//! point) never poison later tokens.

use std::collections::VecDeque;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl XmlElement {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlToken {
    Start(XmlElement),
    Empty(XmlElement),
    End(String),
    Text(String),
}

#[derive(Debug, Default)]
pub struct XmlTokenizer {
    buf: String,
    tokens: VecDeque<XmlToken>,
}

/// Outcome of scanning the head of the buffer.
enum Scan {
    /// `n` bytes consumed, possibly producing a token.
    Consumed(usize, Option<XmlToken>),
    NeedMore,
}

impl XmlTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        self.scan(false);
    }

    /// Flush whatever text is still buffered at end of stream.
    pub fn finish(&mut self) {
        self.scan(true);
        if !self.buf.is_empty() {
            tracing::debug!("Discarding incomplete XML at end of stream: {:?}", self.buf);
            self.buf.clear();
        }
    }

    pub fn next_token(&mut self) -> Option<XmlToken> {
        self.tokens.pop_front()
    }

    fn scan(&mut self, eof: bool) {
        loop {
            let scan = if self.buf.starts_with('<') {
                scan_markup(&self.buf)
            } else {
                scan_text(&self.buf, eof)
            };
            match scan {
                Scan::Consumed(0, _) | Scan::NeedMore => break,
                Scan::Consumed(n, token) => {
                    self.buf.drain(..n);
                    if let Some(token) = token {
                        tracing::debug!("xml token: {:?}", token);
                        self.tokens.push_back(token);
                    }
                }
            }
        }
    }
}

const COMMENT_OPEN: &str = "<!--";
const CDATA_OPEN: &str = "<![CDATA[";

fn scan_markup(buf: &str) -> Scan {
    // A prefix of a comment or CDATA opener cannot be classified yet.
    if buf.len() < CDATA_OPEN.len() && (CDATA_OPEN.starts_with(buf) || COMMENT_OPEN.starts_with(buf)) {
        return Scan::NeedMore;
    }

    if buf.starts_with(COMMENT_OPEN) {
        return match buf[COMMENT_OPEN.len()..].find("-->") {
            Some(end) => Scan::Consumed(COMMENT_OPEN.len() + end + 3, None),
            None => Scan::NeedMore,
        };
    }
    if let Some(body) = buf.strip_prefix(CDATA_OPEN) {
        return match body.find("]]>") {
            Some(end) => {
                let text = body[..end].to_string();
                let token = (!text.is_empty()).then_some(XmlToken::Text(text));
                Scan::Consumed(CDATA_OPEN.len() + end + 3, token)
            }
            None => Scan::NeedMore,
        };
    }
    if buf.starts_with("<?") {
        return match buf.find("?>") {
            Some(end) => Scan::Consumed(end + 2, None),
            None => Scan::NeedMore,
        };
    }

    match find_tag_end(buf) {
        Some(end) => {
            let markup = &buf[..=end];
            let token = if markup.starts_with("<!") { None } else { decode_markup(markup) };
            Scan::Consumed(end + 1, token)
        }
        None => Scan::NeedMore,
    }
}

/// Index of the `>` closing the tag at the head of `buf`, skipping quoted values.
fn find_tag_end(buf: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in buf.char_indices().skip(1) {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn scan_text(buf: &str, eof: bool) -> Scan {
    let end = match buf.find('<') {
        Some(end) => end,
        None if eof => buf.len(),
        // Hold back a trailing entity reference that may continue in the next chunk.
        None => match buf.rfind('&') {
            Some(amp) if !buf[amp..].contains(';') => amp,
            _ => buf.len(),
        },
    };
    if end == 0 {
        return Scan::NeedMore;
    }

    let raw = &buf[..end];
    let text = match quick_xml::escape::unescape(raw) {
        Ok(text) => text.into_owned(),
        Err(e) => {
            tracing::debug!("Keeping raw XML text after unescape failure ({}): {:?}", e, raw);
            raw.to_string()
        }
    };
    Scan::Consumed(end, Some(XmlToken::Text(text)))
}

fn decode_markup(markup: &str) -> Option<XmlToken> {
    let mut reader = Reader::from_str(markup);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    match reader.read_event() {
        Ok(Event::Start(e)) => Some(XmlToken::Start(element(&e))),
        Ok(Event::Empty(e)) => Some(XmlToken::Empty(element(&e))),
        Ok(Event::End(e)) => Some(XmlToken::End(String::from_utf8_lossy(e.name().as_ref()).into_owned())),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Skipping malformed XML markup {:?}: {}", markup, e);
            None
        }
    }
}

fn element(e: &BytesStart) -> XmlElement {
    let attrs = e
        .attributes()
        .flatten()
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
            (key, value)
        })
        .collect();
    XmlElement { name: String::from_utf8_lossy(e.name().as_ref()).into_owned(), attrs }
}
