//! Rich-text content sanitation and transformation.
//!
//! Source descriptions arrive as possibly malformed HTML written by a
//! decade of shop editors. The tokenizer below is deliberately tolerant:
//! unbalanced or unclosed tags never raise, they are repaired best-effort
//! and processing continues. Output is rebuilt from an allow-list, so
//! anything not explicitly permitted (scripts, event handlers,
//! `javascript:` URIs) cannot survive into the target.

use std::sync::Arc;

use super::media::ImageResolver;

/// Marker appended when plain-text extraction truncates.
pub const ELLIPSIS_MARKER: &str = "...";

/// Structural and formatting tags retained by sanitation.
const ALLOWED_TAGS: &[&str] = &[
    "p", "br", "strong", "b", "em", "i", "u", "h1", "h2", "h3", "a", "div", "span", "table",
    "thead", "tbody", "tr", "th", "td", "ol", "ul", "li", "img",
];

/// Tags whose text content is dropped along with the tag itself.
const STRIP_WITH_CONTENT: &[&str] = &["script", "style", "noscript"];

/// Tags that mark content as "rich" for layout decisions downstream.
const RICH_CONTENT_TAGS: &[&str] = &["table", "ol", "ul"];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Open(Tag),
    Close(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
}

impl Tag {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Tolerant HTML tokenizer.
///
/// Anything that does not parse as markup is emitted as text; an unclosed
/// tag at end of input is treated as if it were closed there.
fn tokenize(html: &str) -> Vec<Token> {
    let chars: Vec<char> = html.chars().collect();
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '<' {
            if let Some((token, next)) = parse_markup(&chars, i) {
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                if let Some(token) = token {
                    tokens.push(token);
                }
                i = next;
                continue;
            }
        }
        text.push(chars[i]);
        i += 1;
    }

    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    tokens
}

/// Parse markup starting at a `<`. Returns the token (or `None` for
/// comments/doctypes, which produce nothing) and the index after the
/// construct, or `None` when the `<` is literal text.
fn parse_markup(chars: &[char], start: usize) -> Option<(Option<Token>, usize)> {
    let mut i = start + 1;
    if i >= chars.len() {
        return None;
    }

    // Comment: skip to --> or end of input.
    if chars[i..].starts_with(&['!', '-', '-']) {
        let mut j = i + 3;
        while j < chars.len() {
            if chars[j..].starts_with(&['-', '-', '>']) {
                return Some((None, j + 3));
            }
            j += 1;
        }
        return Some((None, chars.len()));
    }

    // Doctype or processing instruction: skip to >.
    if chars[i] == '!' || chars[i] == '?' {
        while i < chars.len() && chars[i] != '>' {
            i += 1;
        }
        return Some((None, (i + 1).min(chars.len())));
    }

    let closing = chars[i] == '/';
    if closing {
        i += 1;
    }

    if i >= chars.len() || !chars[i].is_ascii_alphabetic() {
        // Literal '<' in text.
        return None;
    }

    let mut name = String::new();
    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '-') {
        name.push(chars[i].to_ascii_lowercase());
        i += 1;
    }

    if closing {
        while i < chars.len() && chars[i] != '>' {
            i += 1;
        }
        return Some((Some(Token::Close(name)), (i + 1).min(chars.len())));
    }

    let mut attrs = Vec::new();
    let mut self_closing = false;
    loop {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            // Unclosed tag at end of input: treat it as closed here.
            break;
        }
        match chars[i] {
            '>' => {
                i += 1;
                break;
            }
            '/' => {
                self_closing = true;
                i += 1;
            }
            _ => {
                let mut attr_name = String::new();
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '=' | '>' | '/')
                {
                    attr_name.push(chars[i].to_ascii_lowercase());
                    i += 1;
                }
                if attr_name.is_empty() {
                    i += 1;
                    continue;
                }
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                let mut value = String::new();
                if i < chars.len() && chars[i] == '=' {
                    i += 1;
                    while i < chars.len() && chars[i].is_whitespace() {
                        i += 1;
                    }
                    if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
                        let quote = chars[i];
                        i += 1;
                        while i < chars.len() && chars[i] != quote {
                            value.push(chars[i]);
                            i += 1;
                        }
                        if i < chars.len() {
                            i += 1;
                        }
                    } else {
                        while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '>' {
                            value.push(chars[i]);
                            i += 1;
                        }
                    }
                }
                attrs.push((attr_name, value));
            }
        }
    }

    Some((
        Some(Token::Open(Tag {
            name,
            attrs,
            self_closing,
        })),
        i,
    ))
}

fn is_allowed(tag: &str) -> bool {
    ALLOWED_TAGS.contains(&tag)
}

fn strips_content(tag: &str) -> bool {
    STRIP_WITH_CONTENT.contains(&tag)
}

/// Attributes retained per tag; everything else is dropped.
fn allowed_attrs(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" => &["href", "title", "target"],
        "img" => &["src", "alt", "title"],
        "td" | "th" => &["colspan", "rowspan"],
        _ => &[],
    }
}

/// Detect a `javascript:` scheme, tolerant of embedded whitespace and
/// control characters used to disguise it.
fn is_javascript_uri(value: &str) -> bool {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    cleaned.to_ascii_lowercase().starts_with("javascript:")
}

fn keep_attr(tag: &str, name: &str, value: &str) -> bool {
    if name.starts_with("on") {
        return false;
    }
    if !allowed_attrs(tag).contains(&name) {
        return false;
    }
    if matches!(name, "href" | "src") && is_javascript_uri(value) {
        return false;
    }
    true
}

fn escape_attr_value(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

fn render_open(tag: &Tag, out: &mut String) {
    out.push('<');
    out.push_str(&tag.name);
    for (name, value) in &tag.attrs {
        if keep_attr(&tag.name, name, value) {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr_value(value));
            out.push('"');
        }
    }
    if tag.self_closing {
        out.push_str(" />");
    } else {
        out.push('>');
    }
}

/// Sanitizes and transforms rich-text fields, delegating embedded media
/// references to an [`ImageResolver`].
pub struct ContentMigrator {
    images: Arc<dyn ImageResolver>,
}

impl ContentMigrator {
    pub fn new(images: Arc<dyn ImageResolver>) -> Self {
        Self { images }
    }

    /// Sanitize markup and rewrite image references to target-hosted URLs.
    ///
    /// Image references whose migration fails are dropped; everything else
    /// is filtered against the allow-list. Never fails: malformed input
    /// yields a best-effort repaired result.
    pub async fn process_html_content(&self, html: &str) -> String {
        if html.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        let mut strip_depth: usize = 0;

        for token in tokenize(html) {
            match token {
                Token::Text(text) => {
                    if strip_depth == 0 {
                        out.push_str(&text);
                    }
                }
                Token::Close(name) => {
                    if strips_content(&name) {
                        strip_depth = strip_depth.saturating_sub(1);
                        continue;
                    }
                    if strip_depth > 0 {
                        continue;
                    }
                    if is_allowed(&name) {
                        out.push_str("</");
                        out.push_str(&name);
                        out.push('>');
                    }
                }
                Token::Open(tag) => {
                    if strips_content(&tag.name) {
                        if !tag.self_closing {
                            strip_depth += 1;
                        }
                        continue;
                    }
                    if strip_depth > 0 {
                        continue;
                    }
                    if tag.name == "img" {
                        self.rewrite_image(&tag, &mut out).await;
                    } else if is_allowed(&tag.name) {
                        render_open(&tag, &mut out);
                    }
                    // Disallowed tags are dropped; their children flow
                    // through as text.
                }
            }
        }

        out
    }

    /// Rewrite one image reference, dropping it when migration fails.
    async fn rewrite_image(&self, tag: &Tag, out: &mut String) {
        let src = match tag.attr("src") {
            Some(src) if !src.is_empty() && !is_javascript_uri(src) => src,
            _ => return,
        };
        let alt = tag.attr("alt").unwrap_or("");

        match self.images.resolve(src, alt).await {
            Some(target_url) => {
                out.push_str("<img src=\"");
                out.push_str(&escape_attr_value(&target_url));
                out.push_str("\" alt=\"");
                out.push_str(&escape_attr_value(alt));
                out.push_str("\" />");
            }
            None => {
                // Dropped reference: a dead asset never fails the entity.
            }
        }
    }

    /// Whether the content carries structure worth a rich layout on the
    /// target: true iff a table or list element is present.
    pub fn has_rich_content(&self, html: &str) -> bool {
        let mut strip_depth: usize = 0;
        for token in tokenize(html) {
            match token {
                Token::Open(tag) => {
                    if strips_content(&tag.name) {
                        if !tag.self_closing {
                            strip_depth += 1;
                        }
                    } else if strip_depth == 0 && RICH_CONTENT_TAGS.contains(&tag.name.as_str()) {
                        return true;
                    }
                }
                Token::Close(name) => {
                    if strips_content(&name) {
                        strip_depth = strip_depth.saturating_sub(1);
                    }
                }
                Token::Text(_) => {}
            }
        }
        false
    }

    /// Strip all markup, collapse whitespace runs to single spaces and
    /// trim. Results longer than `max_len` characters are truncated and
    /// suffixed with [`ELLIPSIS_MARKER`].
    pub fn extract_plain_text(&self, html: &str, max_len: usize) -> String {
        let mut pieces: Vec<String> = Vec::new();
        let mut strip_depth: usize = 0;

        for token in tokenize(html) {
            match token {
                Token::Text(text) => {
                    if strip_depth == 0 {
                        pieces.push(text.replace("&nbsp;", " "));
                    }
                }
                Token::Open(tag) => {
                    if strips_content(&tag.name) && !tag.self_closing {
                        strip_depth += 1;
                    }
                }
                Token::Close(name) => {
                    if strips_content(&name) {
                        strip_depth = strip_depth.saturating_sub(1);
                    }
                }
            }
        }

        let joined = pieces.join(" ");
        let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.chars().count() > max_len {
            let truncated: String = collapsed.chars().take(max_len).collect();
            format!("{}{}", truncated, ELLIPSIS_MARKER)
        } else {
            collapsed
        }
    }
}
