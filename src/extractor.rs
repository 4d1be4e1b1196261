//! Code extractor — salvages typed file content from noisy model output.
//!
//! Small CPU models wrap code in prose, mislabel fences, prepend filename
//! comments, and truncate mid-word. Everything that consumes generated file
//! content goes through [`extract`] so the cleanup lives in one place.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Py,
    Js,
    Ts,
    Css,
    Html,
    Json,
    Md,
    Other,
}

impl ContentKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => ContentKind::Py,
            Some("js") => ContentKind::Js,
            Some("ts") => ContentKind::Ts,
            Some("css") => ContentKind::Css,
            Some("html") | Some("htm") => ContentKind::Html,
            Some("json") => ContentKind::Json,
            Some("md") => ContentKind::Md,
            _ => ContentKind::Other,
        }
    }

    /// Fence language tags that identify this kind.
    fn fence_tags(&self) -> &'static [&'static str] {
        match self {
            ContentKind::Py => &["python", "py"],
            ContentKind::Js => &["javascript", "js"],
            ContentKind::Ts => &["typescript", "ts"],
            ContentKind::Css => &["css"],
            ContentKind::Html => &["html"],
            ContentKind::Json => &["json"],
            ContentKind::Md => &["markdown", "md"],
            ContentKind::Other => &[],
        }
    }

    /// Markdown fence tag used when quoting this kind back to the user.
    pub fn fence_label(&self) -> &'static str {
        match self {
            ContentKind::Py => "python",
            ContentKind::Js => "javascript",
            ContentKind::Ts => "typescript",
            ContentKind::Css => "css",
            ContentKind::Html => "html",
            ContentKind::Json => "json",
            ContentKind::Md => "markdown",
            ContentKind::Other => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub content: String,
    pub confidence: f32,
}

static FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```([a-zA-Z0-9_+-]*)[ \t]*\n(.*?)(?:```|\z)").unwrap());

static FILENAME_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:#|//)?\s*file:\s*\S+\s*$").unwrap());

static BARE_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[\w-]+/)*[\w-]+\.(?:py|js|ts|css|html|json|md|txt)\s*$").unwrap()
});

static STEP_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:step\s+\d+|EDIT\s+\d+:|-{3,}|\*{3,})\s*$").unwrap());

/// Fragments of "completed"/"deleted" the model leaves behind when its
/// natural-language tail is cut mid-word.
const TAIL_FRAGMENTS: &[&str] = &["pleted", "leted", "eted"];

/// Extract content of `kind` from raw model output. Returns `None` when
/// nothing usable is found.
pub fn extract(raw: &str, kind: ContentKind) -> Option<Extraction> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("Error") {
        return None;
    }

    if let Some((content, tagged)) = best_fenced_block(raw, kind) {
        let content = clean(&content);
        if !content.is_empty() {
            if validate(&content, kind) {
                return Some(Extraction {
                    content,
                    confidence: if tagged { 0.9 } else { 0.75 },
                });
            }
            if let Some(salvaged) = salvage(raw, kind) {
                return Some(Extraction {
                    content: salvaged,
                    confidence: 0.5,
                });
            }
            // Keep the cleaned block at low confidence rather than drop it.
            return Some(Extraction {
                content,
                confidence: 0.4,
            });
        }
    }

    // No fences: accept the raw text only when it opens like the target
    // kind, otherwise prose headers would ride along.
    let content = clean(raw);
    if !content.is_empty() && starts_like(&content, kind) && validate(&content, kind) {
        return Some(Extraction {
            content,
            confidence: 0.6,
        });
    }

    salvage(raw, kind).map(|content| Extraction {
        content,
        confidence: 0.5,
    })
}

/// Pick the best fenced block: first one whose tag matches the expected
/// kind, else the longest block. Returns (content, tag_matched).
fn best_fenced_block(raw: &str, kind: ContentKind) -> Option<(String, bool)> {
    let mut untagged_best: Option<String> = None;
    for cap in FENCE.captures_iter(raw) {
        let tag = cap[1].to_ascii_lowercase();
        let body = cap[2].to_string();
        if kind.fence_tags().contains(&tag.as_str()) {
            return Some((body, true));
        }
        if untagged_best.as_ref().map(|b| b.len()).unwrap_or(0) < body.len() {
            untagged_best = Some(body);
        }
    }
    untagged_best.map(|body| (body, false))
}

/// Strip filename comments, stray fences, step markers, and truncated
/// word fragments the model leaves at the tail.
fn clean(content: &str) -> String {
    let mut lines: Vec<&str> = content
        .lines()
        .enumerate()
        .filter(|(i, line)| {
            if line.trim_start().starts_with("```") {
                return false;
            }
            if FILENAME_COMMENT.is_match(line) {
                return false;
            }
            // Bare filename lines only appear as a heading, never mid-file.
            if *i < 3 && BARE_FILENAME.is_match(line) {
                return false;
            }
            true
        })
        .map(|(_, line)| line)
        .collect();

    // Trailing noise: "File:" echoes, step markers, rules, tail fragments.
    while let Some(last) = lines.last() {
        let trimmed = last.trim();
        let is_noise = trimmed.is_empty()
            || trimmed.starts_with("File:")
            || STEP_MARKER.is_match(trimmed)
            || TAIL_FRAGMENTS.contains(&trimmed);
        if is_noise {
            lines.pop();
        } else {
            break;
        }
    }
    while lines.first().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.remove(0);
    }

    lines.join("\n")
}

static CSS_RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^{}\n]+\{[^{}]*\}").unwrap());
static CSS_OPENING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:/\*|@|[a-zA-Z#.\[\*:][^{]*\{)").unwrap());
static JS_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:function|const|let|var|class|import|export|async|document\.|window\.|[A-Za-z_$][\w$]*\s*[=(])").unwrap()
});
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[a-zA-Z][^>]*>").unwrap());
static HTML_CSS_OPENING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:body|\.|#[a-z])[^\n{]*\{").unwrap());
static PY_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:import |from |def |class |@|if __name__|[A-Za-z_]\w*\s*=)").unwrap()
});

/// Shallow structural check that `content` plausibly is the target kind.
/// Rejects content carrying another kind's unmistakable markers first.
pub fn validate(content: &str, kind: ContentKind) -> bool {
    if wrong_type(content, kind) {
        return false;
    }
    match kind {
        ContentKind::Css => CSS_RULE.is_match(content),
        ContentKind::Js | ContentKind::Ts => JS_STATEMENT.is_match(content),
        ContentKind::Html => HTML_TAG.is_match(content),
        ContentKind::Json => {
            let t = content.trim_start();
            t.starts_with('{') || t.starts_with('[')
        }
        ContentKind::Py => PY_STATEMENT.is_match(content),
        ContentKind::Md => !content.trim().is_empty(),
        ContentKind::Other => !content.trim().is_empty(),
    }
}

fn wrong_type(content: &str, kind: ContentKind) -> bool {
    match kind {
        ContentKind::Css => ["<!DOCTYPE", "<html", "<head", "<body", "function ", "const "]
            .iter()
            .any(|marker| content.contains(marker)),
        ContentKind::Js | ContentKind::Ts => ["<!DOCTYPE", "<html", "<head", "<body", "@media"]
            .iter()
            .any(|marker| content.contains(marker)),
        ContentKind::Py => ["<!DOCTYPE", "<html", "function (", "const "]
            .iter()
            .any(|marker| content.contains(marker)),
        ContentKind::Html => HTML_CSS_OPENING.is_match(content) && !HTML_TAG.is_match(content),
        _ => false,
    }
}

/// Does the first non-empty line read like the start of this kind of file?
fn starts_like(content: &str, kind: ContentKind) -> bool {
    let Some(first) = content.lines().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    match kind {
        ContentKind::Py => {
            PY_STATEMENT.is_match(first) || first.trim_start().starts_with('#')
                || first.trim_start().starts_with("\"\"\"")
        }
        ContentKind::Js | ContentKind::Ts => {
            JS_STATEMENT.is_match(first) || first.trim_start().starts_with("//")
        }
        ContentKind::Css => CSS_OPENING.is_match(first),
        ContentKind::Html => first.contains('<'),
        ContentKind::Json => {
            let t = first.trim_start();
            t.starts_with('{') || t.starts_with('[')
        }
        ContentKind::Md | ContentKind::Other => true,
    }
}

/// Last resort for CSS/JS: find the longest substring of the raw response
/// that passes the kind heuristic.
fn salvage(raw: &str, kind: ContentKind) -> Option<String> {
    match kind {
        ContentKind::Css => {
            let mut best: Option<(usize, usize)> = None;
            let mut run_start: Option<usize> = None;
            let mut run_end = 0;
            for m in CSS_RULE.find_iter(raw) {
                match run_start {
                    Some(start) if raw[run_end..m.start()].trim().is_empty() => {
                        run_end = m.end();
                        if best.map(|(s, e)| e - s).unwrap_or(0) < run_end - start {
                            best = Some((start, run_end));
                        }
                    }
                    _ => {
                        run_start = Some(m.start());
                        run_end = m.end();
                        if best.map(|(s, e)| e - s).unwrap_or(0) < m.end() - m.start() {
                            best = Some((m.start(), m.end()));
                        }
                    }
                }
            }
            best.map(|(s, e)| raw[s..e].trim().to_string())
        }
        ContentKind::Js | ContentKind::Ts => {
            let m = JS_STATEMENT.find(raw)?;
            // From the first statement up to any closing markup tag.
            let tail = &raw[m.start()..];
            let end = tail.find("</").unwrap_or(tail.len());
            let candidate = clean(tail[..end].trim());
            (!candidate.is_empty()).then_some(candidate)
        }
        _ => None,
    }
}
