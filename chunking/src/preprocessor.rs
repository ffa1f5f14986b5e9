//! Cleanup of extracted text before chunking.
//!
//! PDF and office extractors leave behind noise that hurts both chunk
//! boundaries and embedding quality: decomposed unicode, hard-wrapped lines,
//! words hyphenated across line breaks, and running headers/footers repeated
//! on every page. [`TextPreprocessor`] removes that noise in a fixed sequence
//! of stages, each of which can be switched off.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::chunker::{DEFAULT_SENTENCE_SPLIT, split_sentences_with};

/// Glyphs treated as bullet markers at the start of a line.
const BULLET_GLYPHS: &[char] = &['•', '▪', '◦', '●', '‣', '∙', '–', '*', '-'];

/// Stage toggles for [`TextPreprocessor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPreprocessorConfig {
    /// Apply NFC canonical composition.
    pub normalize_unicode: bool,

    /// Unify line endings and collapse horizontal whitespace.
    pub collapse_spaces: bool,

    /// Drop control characters other than newline and tab.
    pub strip_control_chars: bool,

    /// Join words split by a hyphen at a line break.
    pub dehyphenate: bool,

    /// Merge hard-wrapped continuation lines into their paragraph line.
    pub merge_hard_wraps: bool,

    /// Drop short lines repeated next to blank lines.
    pub remove_headers_footers: bool,

    /// Rewrite bullet glyphs to a single `- ` marker.
    pub normalize_bullets: bool,

    /// Shortest line (in characters) considered a header/footer.
    pub min_header_len: usize,

    /// Longest line (in characters) considered a header/footer.
    pub max_header_line_len: usize,
}

impl Default for TextPreprocessorConfig {
    fn default() -> Self {
        Self {
            normalize_unicode: true,
            collapse_spaces: true,
            strip_control_chars: true,
            dehyphenate: true,
            merge_hard_wraps: true,
            remove_headers_footers: true,
            normalize_bullets: true,
            min_header_len: 8,
            max_header_line_len: 120,
        }
    }
}

impl TextPreprocessorConfig {
    /// Set the header/footer length window.
    pub fn with_header_bounds(mut self, min_len: usize, max_len: usize) -> Self {
        self.min_header_len = min_len;
        self.max_header_line_len = max_len;
        self
    }

    /// Enable or disable header/footer removal.
    pub fn with_header_removal(mut self, enabled: bool) -> Self {
        self.remove_headers_footers = enabled;
        self
    }

    /// Enable or disable hard-wrap merging.
    pub fn with_hard_wrap_merge(mut self, enabled: bool) -> Self {
        self.merge_hard_wraps = enabled;
        self
    }
}

/// Deterministic text cleaner.
#[derive(Debug, Clone, Default)]
pub struct TextPreprocessor {
    config: TextPreprocessorConfig,
}

impl TextPreprocessor {
    /// Create a preprocessor with every stage enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a preprocessor with custom stage toggles.
    pub fn with_config(config: TextPreprocessorConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &TextPreprocessorConfig {
        &self.config
    }

    /// Run every enabled stage over `text`. Empty input yields an empty
    /// string.
    pub fn preprocess(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let cfg = &self.config;
        let mut s = text.to_string();

        if cfg.normalize_unicode {
            s = s.nfc().collect();
        }
        if cfg.collapse_spaces {
            s = collapse_spaces_and_newlines(&s);
        }
        if cfg.strip_control_chars {
            s = strip_controls(&s);
        }
        if cfg.dehyphenate {
            s = dehyphenate_line_breaks(&s);
        }
        if cfg.merge_hard_wraps {
            s = merge_hard_wraps(&s);
        }
        if cfg.remove_headers_footers {
            s = remove_repeated_headers_footers(&s, cfg.min_header_len, cfg.max_header_line_len);
        }
        if cfg.normalize_bullets {
            s = normalize_bullets(&s);
        }

        final_trim(&s)
    }

    /// Split already-clean text into sentences on terminal punctuation
    /// followed by an uppercase letter or digit.
    pub fn split_sentences(&self, text: &str) -> Vec<String> {
        match regex_lite::Regex::new(DEFAULT_SENTENCE_SPLIT) {
            Ok(re) => split_sentences_with(text.trim(), &re),
            Err(_) => vec![text.trim().to_string()],
        }
    }

    /// Split text into paragraphs on blank lines.
    pub fn paragraphs(&self, text: &str) -> Vec<String> {
        split_paragraphs(text)
    }
}

/// Split on runs of lines that are empty or whitespace-only.
pub(crate) fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Replace every run of three or more newlines with exactly two.
fn cap_blank_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut newlines = 0usize;
    for ch in s.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out
}

fn collapse_spaces_and_newlines(s: &str) -> String {
    let unified = s.replace("\r\n", "\n").replace('\r', "\n").replace('\u{feff}', "");

    let mut out = String::with_capacity(unified.len());
    let mut in_space = false;
    for ch in unified.chars() {
        if ch.is_whitespace() && ch != '\n' && ch != '\t' {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            in_space = false;
            out.push(ch);
        }
    }
    cap_blank_runs(&out)
}

fn strip_controls(s: &str) -> String {
    s.chars()
        .filter(|&ch| ch == '\n' || ch == '\t' || !ch.is_control())
        .collect()
}

/// `co-\noperate` becomes `cooperate`; only ASCII letters on both sides.
fn dehyphenate_line_breaks(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        let joins = chars[i] == '-'
            && i > 0
            && chars[i - 1].is_ascii_alphabetic()
            && chars.get(i + 1) == Some(&'\n')
            && chars.get(i + 2).is_some_and(char::is_ascii_alphabetic);
        if joins {
            i += 2;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// A wrapped line continues the previous one when the previous line ends in
/// an alphanumeric and the next starts with a lowercase letter, digit, or `(`.
fn is_continuation(prev: &str, next: &str) -> bool {
    let ends_alnum = prev.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    let starts_lower = next
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '(');
    ends_alnum && starts_lower
}

fn merge_hard_wraps(s: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut open_paragraph = false;

    for line in s.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            out.push(String::new());
            open_paragraph = false;
            continue;
        }
        match out.last_mut() {
            Some(prev) if open_paragraph && is_continuation(prev, trimmed) => {
                prev.push(' ');
                prev.push_str(trimmed);
            }
            _ => out.push(trimmed.to_string()),
        }
        open_paragraph = true;
    }

    cap_blank_runs(&out.join("\n")).trim().to_string()
}

fn remove_repeated_headers_footers(s: &str, min_len: usize, max_line_len: usize) -> String {
    let lines: Vec<&str> = s.split('\n').collect();

    let mut freq: HashMap<&str, usize> = HashMap::new();
    for line in &lines {
        let stripped = line.trim();
        let len = stripped.chars().count();
        if len > 0 && len <= max_line_len {
            *freq.entry(stripped).or_insert(0) += 1;
        }
    }

    let is_candidate = |stripped: &str| {
        freq.get(stripped)
            .is_some_and(|&n| n >= 2 && stripped.chars().count() >= min_len)
    };
    let is_blank = |idx: Option<usize>| idx.and_then(|i| lines.get(i)).is_some_and(|l| l.trim().is_empty());

    let kept: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, line)| {
            if !is_candidate(line.trim()) {
                return true;
            }
            let prev_blank = is_blank(i.checked_sub(1));
            let next_blank = is_blank(Some(i + 1));
            !(prev_blank || next_blank)
        })
        .map(|(_, line)| *line)
        .collect();

    cap_blank_runs(&kept.join("\n")).trim().to_string()
}

fn normalize_bullets(s: &str) -> String {
    s.split('\n')
        .map(|line| {
            let body = line.trim_start();
            let mut chars = body.chars();
            match (chars.next(), chars.next()) {
                (Some(glyph), Some(after)) if BULLET_GLYPHS.contains(&glyph) && after.is_whitespace() => {
                    let rest = body[glyph.len_utf8()..].trim_start();
                    format!("- {}", collapse_inner_spaces(rest))
                }
                _ => collapse_inner_spaces(line),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_inner_spaces(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut prev_space = false;
    for ch in line.chars() {
        if ch == ' ' {
            if !prev_space {
                out.push(ch);
            }
            prev_space = true;
        } else {
            prev_space = false;
            out.push(ch);
        }
    }
    out
}

fn final_trim(s: &str) -> String {
    let lines: Vec<&str> = s.split('\n').map(str::trim).collect();
    cap_blank_runs(lines.join("\n").trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_input() {
        assert_eq!(TextPreprocessor::new().preprocess(""), "");
    }

    #[test]
    fn test_nfc_composition() {
        let decomposed = "cafe\u{301}";
        assert_eq!(TextPreprocessor::new().preprocess(decomposed), "caf\u{e9}");
    }

    #[test]
    fn test_collapse_and_cap_blank_lines() {
        let text = "alpha   beta\r\n\r\n\r\n\r\ngamma";
        assert_eq!(TextPreprocessor::new().preprocess(text), "alpha beta\n\ngamma");
    }

    #[test]
    fn test_strip_controls_keeps_tabs() {
        assert_eq!(strip_controls("a\u{7}b\tc\n"), "ab\tc\n");
    }

    #[test]
    fn test_dehyphenate() {
        assert_eq!(dehyphenate_line_breaks("co-\noperate"), "cooperate");
        assert_eq!(dehyphenate_line_breaks("well-\n42"), "well-\n42");
    }

    #[test]
    fn test_merge_hard_wraps() {
        let text = "The quick brown fox\njumps over the dog.\nNext Line starts here";
        assert_eq!(
            merge_hard_wraps(text),
            "The quick brown fox jumps over the dog.\nNext Line starts here"
        );
    }

    #[test]
    fn test_blank_line_ends_paragraph() {
        let text = "first part\n\nsecond part";
        assert_eq!(merge_hard_wraps(text), "first part\n\nsecond part");
    }

    #[test]
    fn test_headers_next_to_blank_lines_are_removed() {
        let text = "ACME Annual Report\n\nBody text one.\n\nACME Annual Report\n\nBody text two.";
        let out = TextPreprocessor::new().preprocess(text);
        assert_eq!(out, "Body text one.\n\nBody text two.");
    }

    #[test]
    fn test_body_occurrence_of_repeated_line_is_kept() {
        let text = "Intro.\nRepeated phrase here\nOutro.\nRepeated phrase here\nEnd.";
        let pre = TextPreprocessor::with_config(
            TextPreprocessorConfig::default().with_hard_wrap_merge(false),
        );
        assert_eq!(pre.preprocess(text), text);
    }

    #[test]
    fn test_bullet_glyphs_normalized() {
        let text = "Items:\n\n• first\n▪ second\n*   third";
        assert_eq!(
            TextPreprocessor::new().preprocess(text),
            "Items:\n\n- first\n- second\n- third"
        );
    }

    #[test]
    fn test_idempotent_on_clean_text() {
        let pre = TextPreprocessor::new();
        let once = pre.preprocess("Hello world. This is clean.\n\nSecond paragraph here.");
        assert_eq!(pre.preprocess(&once), once);
    }

    #[test]
    fn test_paragraphs_and_sentences() {
        let pre = TextPreprocessor::new();
        assert_eq!(pre.paragraphs("a\n \nb\n\n\nc"), vec!["a", "b", "c"]);
        assert_eq!(
            pre.split_sentences("One fish. Two fish! 3 fish? red fish"),
            vec!["One fish.", "Two fish!", "3 fish? red fish"]
        );
    }
}
