//! Just enough HTML scanning to work on compose bodies.
//!
//! Compose bodies are treated as flat markup strings: text runs between tags
//! stand in for DOM text nodes, and `<img>` tags are parsed into an attribute
//! list that can be edited and written back out.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::LazyLock;

use markdown_weaver_escape::escape_html;
use regex::{Captures, Regex};

/// Tags, comments, doctypes and processing instructions.
static MARKUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->|<[!/?a-zA-Z][^>]*>").unwrap());

static IMG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img\b[^>]*>").unwrap());

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s"'<>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#).unwrap()
});

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,31});").unwrap()
});

/// An image either standing alone or wrapped the way mail hosts insert
/// uploads: `<div><img ...><br></div>`, or a bare tag followed by line breaks.
static IMAGE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<div\b[^>]*>\s*(<img\b[^>]*>)(?:\s*<br\s*/?>)*\s*</div>|(<img\b[^>]*>)(?:\s*<br\s*/?>)*",
    )
    .unwrap()
});

/// Text runs between markup, with their byte offset in `body`.
pub fn text_segments(body: &str) -> Vec<(usize, &str)> {
    let mut segments = Vec::new();
    let mut last = 0;
    for m in MARKUP_RE.find_iter(body) {
        if m.start() > last {
            segments.push((last, &body[last..m.start()]));
        }
        last = m.end();
    }
    if last < body.len() {
        segments.push((last, &body[last..]));
    }
    segments
}

/// Escape text for use in element content or a double-quoted attribute.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    // Writing to a String can't fail
    let _ = escape_html(&mut out, s);
    out
}

/// Decode character references. Unknown named references are left as written.
pub fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    ENTITY_RE.replace_all(s, |caps: &Captures| {
        let entity = &caps[1];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => {
                if let Some(hex) = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().ok().and_then(char::from_u32)
                } else {
                    None
                }
            }
        };
        match decoded {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        }
    })
}

/// A start tag parsed into its attributes. Attribute values are stored decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    name: String,
    attrs: Vec<(String, Option<String>)>,
}

impl Tag {
    pub fn parse(markup: &str) -> Option<Self> {
        let inner = markup.strip_prefix('<')?.strip_suffix('>')?;
        let inner = inner.strip_suffix('/').unwrap_or(inner);
        let name_end = inner
            .find(|c: char| c.is_whitespace())
            .unwrap_or(inner.len());
        let name = inner[..name_end].to_ascii_lowercase();
        if name.is_empty() || name.starts_with(['/', '!']) {
            return None;
        }
        let attrs = ATTR_RE
            .captures_iter(&inner[name_end..])
            .map(|caps| {
                let key = caps[1].to_ascii_lowercase();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|v| decode_entities(v.as_str()).into_owned());
                (key, value)
            })
            .collect();
        Some(Self { name, attrs })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute value; valueless attributes read as `""`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = Some(value.into());
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == key)?;
        self.attrs.remove(idx).1
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref().unwrap_or("")))
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.get("class")
            .map(|classes| classes.split_ascii_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        let classes = match self.get("class") {
            Some(existing) if !existing.trim().is_empty() => {
                format!("{} {class}", existing.trim())
            }
            _ => class.to_string(),
        };
        self.set("class", classes);
    }

    pub fn to_html(&self) -> String {
        let mut out = format!("<{}", self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            if let Some(value) = value {
                out.push_str("=\"");
                let _ = escape_html(&mut out, value);
                out.push('"');
            }
        }
        out.push('>');
        out
    }
}

/// An `<img>` found in a body, with the byte range it occupies.
///
/// For [`image_blocks`] the range includes host artifacts around the tag
/// (wrapping `<div>`, trailing `<br>`s); for [`images`] it is the tag alone.
#[derive(Debug, Clone)]
pub struct ImageBlock {
    pub range: Range<usize>,
    pub markup: String,
    pub tag: Tag,
}

/// Every `<img>` tag in document order.
pub fn images(body: &str) -> Vec<ImageBlock> {
    IMG_RE
        .find_iter(body)
        .filter_map(|m| {
            Tag::parse(m.as_str()).map(|tag| ImageBlock {
                range: m.range(),
                markup: m.as_str().to_string(),
                tag,
            })
        })
        .collect()
}

/// Every `<img>` together with the wrapper markup a host put around it.
pub fn image_blocks(body: &str) -> Vec<ImageBlock> {
    IMAGE_BLOCK_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let img = caps.get(1).or_else(|| caps.get(2))?;
            Tag::parse(img.as_str()).map(|tag| ImageBlock {
                range: whole.range(),
                markup: img.as_str().to_string(),
                tag,
            })
        })
        .collect()
}

/// Copy of `body` with the given sorted, non-overlapping ranges cut out.
pub fn remove_ranges<'a>(body: &str, ranges: impl IntoIterator<Item = &'a Range<usize>>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for range in ranges {
        if range.start < last {
            continue;
        }
        out.push_str(&body[last..range.start]);
        last = range.end;
    }
    out.push_str(&body[last..]);
    out
}
