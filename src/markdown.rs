//! Markdown to HTML for rich room messages.
//!
//! Covers the subset agents actually produce: headings, paragraphs, fenced
//! code, block quotes, ordered/unordered/task lists, pipe tables, and inline
//! code, links, bare URLs, bold, italic, strikethrough, `^sup^` and `~sub~`.
//!
//! [`render_html`] returns `Ok(None)` when the text has no markup, so plain
//! replies go out without a formatted body.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Errors from rendering.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// An inline pattern failed to compile.
    #[error("invalid inline pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Signature of a text transform used for outbound messages.
pub type Renderer = fn(&str) -> Result<Option<String>, RenderError>;

/// Escape special HTML characters.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Inline patterns, compiled on first use.
static INLINE_RULES: LazyLock<Result<InlineRules, regex::Error>> = LazyLock::new(InlineRules::new);

/// Render markdown to HTML, or `None` if the text is plain.
///
/// # Errors
///
/// Returns [`RenderError`] if the inline patterns failed to compile.
pub fn render_html(text: &str) -> Result<Option<String>, RenderError> {
    let inline = INLINE_RULES
        .as_ref()
        .map_err(|e| RenderError::Pattern(e.clone()))?;
    let html = render_blocks(text, inline);

    let plain = format!("<p>{}</p>", inline.apply(&escape_html(text.trim())));
    if text.trim().is_empty() || (html == plain && !inline.changed(text)) {
        return Ok(None);
    }
    Ok(Some(html))
}

/// Compiled inline patterns.
struct InlineRules {
    code: Regex,
    link: Regex,
    bold: Regex,
    strike: Regex,
    italic: Regex,
    sup: Regex,
    sub: Regex,
}

impl InlineRules {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            code: Regex::new(r"`([^`]+)`")?,
            link: Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)|(https?://[^\s<]+)")?,
            bold: Regex::new(r"\*\*([^*]+)\*\*|__([^_]+)__")?,
            strike: Regex::new(r"~~([^~]+)~~")?,
            italic: Regex::new(r"\*([^*\s][^*]*)\*")?,
            sup: Regex::new(r"\^([^\^\s]+)\^")?,
            sub: Regex::new(r"~([^~\s]+)~")?,
        })
    }

    /// Whether any inline rule would fire on `text`.
    fn changed(&self, text: &str) -> bool {
        let escaped = escape_html(text);
        self.apply(&escaped) != escaped
    }

    /// Apply inline rules to already-escaped text.
    ///
    /// Code spans are rendered verbatim; other rules run only on the text
    /// between them.
    fn apply(&self, escaped: &str) -> String {
        let mut out = String::with_capacity(escaped.len());
        let mut last = 0;
        for caps in self.code.captures_iter(escaped) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&self.apply_links(&escaped[last..whole.start()]));
            out.push_str("<code>");
            out.push_str(caps.get(1).map_or("", |m| m.as_str()));
            out.push_str("</code>");
            last = whole.end();
        }
        out.push_str(&self.apply_links(&escaped[last..]));
        out
    }

    /// Render links, then emphasis on the text between them.
    ///
    /// URLs are never passed to the emphasis rules, so `~`, `*` and `_`
    /// inside an href stay literal.
    fn apply_links(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in self.link.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&self.apply_emphasis(&text[last..whole.start()]));
            if let (Some(label), Some(href)) = (caps.get(1), caps.get(2)) {
                out.push_str(&format!(
                    "<a href=\"{}\">{}</a>",
                    href.as_str(),
                    self.apply_emphasis(label.as_str())
                ));
                last = whole.end();
            } else {
                let url = whole.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
                out.push_str(&format!("<a href=\"{url}\">{url}</a>"));
                // Trailing punctuation goes back into the plain text.
                last = whole.start().saturating_add(url.len());
            }
        }
        out.push_str(&self.apply_emphasis(&text[last..]));
        out
    }

    fn apply_emphasis(&self, text: &str) -> String {
        let bolded = self.bold.replace_all(text, |caps: &Captures<'_>| {
            let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            format!("<strong>{inner}</strong>")
        });
        let struck = self.strike.replace_all(&bolded, "<del>$1</del>");
        let italic = self.italic.replace_all(&struck, "<em>$1</em>");
        let sup = self.sup.replace_all(&italic, "<sup>$1</sup>");
        self.sub.replace_all(&sup, "<sub>$1</sub>").into_owned()
    }
}

/// Which list container is open.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Unordered,
    Ordered,
}

/// Line-oriented block renderer.
fn render_blocks(text: &str, inline: &InlineRules) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = String::new();
    let mut paragraph: Vec<String> = Vec::new();
    let mut list: Option<ListKind> = None;
    let mut i = 0;

    while let Some(&line) = lines.get(i) {
        let trimmed = line.trim();

        // Fenced code block.
        if trimmed.starts_with("```") {
            flush_paragraph(&mut out, &mut paragraph);
            close_list(&mut out, &mut list);
            let mut code = Vec::new();
            i = i.saturating_add(1);
            while let Some(&inner) = lines.get(i) {
                if inner.trim().starts_with("```") {
                    break;
                }
                code.push(escape_html(inner));
                i = i.saturating_add(1);
            }
            out.push_str("<pre><code>");
            out.push_str(&code.join("\n"));
            out.push_str("</code></pre>");
            i = i.saturating_add(1);
            continue;
        }

        if trimmed.is_empty() {
            flush_paragraph(&mut out, &mut paragraph);
            close_list(&mut out, &mut list);
            i = i.saturating_add(1);
            continue;
        }

        // Table: header row followed by a separator row.
        if trimmed.starts_with('|') && lines.get(i.saturating_add(1)).is_some_and(|l| is_table_separator(l)) {
            flush_paragraph(&mut out, &mut paragraph);
            close_list(&mut out, &mut list);
            out.push_str("<table><thead><tr>");
            for cell in table_cells(trimmed) {
                out.push_str(&format!("<th>{}</th>", inline.apply(&escape_html(cell))));
            }
            out.push_str("</tr></thead><tbody>");
            i = i.saturating_add(2);
            while let Some(&row) = lines.get(i) {
                let row = row.trim();
                if !row.starts_with('|') {
                    break;
                }
                out.push_str("<tr>");
                for cell in table_cells(row) {
                    out.push_str(&format!("<td>{}</td>", inline.apply(&escape_html(cell))));
                }
                out.push_str("</tr>");
                i = i.saturating_add(1);
            }
            out.push_str("</tbody></table>");
            continue;
        }

        if let Some((level, heading)) = parse_heading(trimmed) {
            flush_paragraph(&mut out, &mut paragraph);
            close_list(&mut out, &mut list);
            out.push_str(&format!(
                "<h{level}>{}</h{level}>",
                inline.apply(&escape_html(heading))
            ));
        } else if let Some(quote) = trimmed.strip_prefix('>') {
            flush_paragraph(&mut out, &mut paragraph);
            close_list(&mut out, &mut list);
            out.push_str(&format!(
                "<blockquote>{}</blockquote>",
                inline.apply(&escape_html(quote.trim()))
            ));
        } else if let Some((kind, item)) = parse_list_item(trimmed) {
            flush_paragraph(&mut out, &mut paragraph);
            if list != Some(kind) {
                close_list(&mut out, &mut list);
                out.push_str(if kind == ListKind::Ordered { "<ol>" } else { "<ul>" });
                list = Some(kind);
            }
            out.push_str(&render_list_item(item, inline));
        } else {
            close_list(&mut out, &mut list);
            paragraph.push(inline.apply(&escape_html(trimmed)));
        }
        i = i.saturating_add(1);
    }

    flush_paragraph(&mut out, &mut paragraph);
    close_list(&mut out, &mut list);
    out
}

fn flush_paragraph(out: &mut String, paragraph: &mut Vec<String>) {
    if paragraph.is_empty() {
        return;
    }
    out.push_str("<p>");
    out.push_str(&paragraph.join("<br />"));
    out.push_str("</p>");
    paragraph.clear();
}

fn close_list(out: &mut String, list: &mut Option<ListKind>) {
    match list.take() {
        Some(ListKind::Unordered) => out.push_str("</ul>"),
        Some(ListKind::Ordered) => out.push_str("</ol>"),
        None => {}
    }
}

fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    rest.starts_with(' ').then(|| (level, rest.trim()))
}

fn parse_list_item(line: &str) -> Option<(ListKind, &str)> {
    for marker in ["- ", "* ", "+ "] {
        if let Some(item) = line.strip_prefix(marker) {
            return Some((ListKind::Unordered, item));
        }
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(item) = line[digits..].strip_prefix(". ") {
            return Some((ListKind::Ordered, item));
        }
    }
    None
}

fn render_list_item(item: &str, inline: &InlineRules) -> String {
    let task = if let Some(rest) = item.strip_prefix("[ ] ") {
        Some((false, rest))
    } else {
        item.strip_prefix("[x] ")
            .or_else(|| item.strip_prefix("[X] "))
            .map(|rest| (true, rest))
    };
    match task {
        Some((checked, rest)) => format!(
            "<li class=\"task-list-item\"><input type=\"checkbox\" class=\"task-list-item-checkbox\" disabled{} /> {}</li>",
            if checked { " checked" } else { "" },
            inline.apply(&escape_html(rest))
        ),
        None => format!("<li>{}</li>", inline.apply(&escape_html(item))),
    }
}

fn is_table_separator(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('|')
        && line.contains('-')
        && line
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn table_cells(row: &str) -> Vec<&str> {
    row.trim_matches('|').split('|').map(str::trim).collect()
}
