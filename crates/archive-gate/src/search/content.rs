//! Line-oriented content matching

use super::{Deadline, SearchMatch};
use crate::{Error, Result};
use std::io::BufRead;

const MAX_TERM_CHARS: usize = 1000;

/// Bytes inspected when deciding whether content is text
pub(crate) const SNIFF_LEN: usize = 8192;

/// Longest line excerpt carried in a match
const MAX_LINE_EXCERPT: usize = 500;

/// One occurrence within a line, in character columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineHit {
    /// 0-based start column
    pub start: usize,
    /// 0-based end column, exclusive
    pub end: usize,
    /// Matched text in its original case
    pub text: String,
}

/// Compiled content search term
#[derive(Debug, Clone)]
pub struct LineMatcher {
    needle: Vec<char>,
    case_sensitive: bool,
    whole_word: bool,
}

impl LineMatcher {
    /// Build a matcher
    ///
    /// # Errors
    ///
    /// `Error::InvalidInput` for blank or oversized terms
    pub fn new(term: &str, case_sensitive: bool, whole_word: bool) -> Result<Self> {
        if term.trim().is_empty() {
            return Err(Error::invalid("Search term must not be empty"));
        }
        if term.chars().count() > MAX_TERM_CHARS {
            return Err(Error::invalid(format!(
                "Search term longer than {MAX_TERM_CHARS} characters"
            )));
        }
        if term.contains(['\n', '\r']) {
            return Err(Error::invalid("Search term must be a single line"));
        }

        Ok(Self {
            needle: term.chars().map(|c| fold(c, case_sensitive)).collect(),
            case_sensitive,
            whole_word,
        })
    }

    /// Every non-overlapping occurrence in `line`, left to right
    pub fn find_all(&self, line: &str) -> Vec<LineHit> {
        let original: Vec<char> = line.chars().collect();
        let folded: Vec<char> = original
            .iter()
            .map(|c| fold(*c, self.case_sensitive))
            .collect();

        let width = self.needle.len();
        let mut hits = Vec::new();
        let mut i = 0;

        while i + width <= folded.len() {
            let end = i + width;
            if folded[i..end] == self.needle[..]
                && (!self.whole_word || word_bounded(&original, i, end))
            {
                hits.push(LineHit {
                    start: i,
                    end,
                    text: original[i..end].iter().collect(),
                });
                i = end;
            } else {
                i += 1;
            }
        }

        hits
    }
}

/// Single-char case folding that keeps column positions stable
fn fold(c: char, case_sensitive: bool) -> char {
    if case_sensitive {
        return c;
    }
    if c.is_ascii() {
        return c.to_ascii_lowercase();
    }
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(single), None) => single,
        _ => c,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn word_bounded(line: &[char], start: usize, end: usize) -> bool {
    let before = start == 0 || !is_word_char(line[start - 1]);
    let after = end == line.len() || !is_word_char(line[end]);
    before && after
}

/// Heuristic text check over a leading sample
///
/// NUL bytes, or more than 30% control bytes other than whitespace, mark binary.
pub fn looks_binary(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return true;
    }
    if sample.is_empty() {
        return false;
    }
    let control = sample
        .iter()
        .filter(|b| b.is_ascii_control() && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0c))
        .count();
    control * 10 > sample.len() * 3
}

/// Bounded match accumulator
#[derive(Debug)]
pub(crate) struct MatchCollector {
    pub(crate) matches: Vec<SearchMatch>,
    limit: usize,
    pub(crate) truncated: bool,
}

impl MatchCollector {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            matches: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.truncated
    }

    /// Returns `false` once the cap is reached
    fn push(&mut self, item: SearchMatch) -> bool {
        if self.matches.len() >= self.limit {
            self.truncated = true;
            return false;
        }
        self.matches.push(item);
        if self.matches.len() >= self.limit {
            self.truncated = true;
        }
        !self.truncated
    }
}

/// Scan a text stream line by line, recording every hit
pub(crate) fn scan_lines<R: BufRead>(
    mut reader: R,
    file: &str,
    entry: Option<&str>,
    matcher: &LineMatcher,
    collector: &mut MatchCollector,
    deadline: &Deadline,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut line_number: u64 = 0;

    loop {
        deadline.check()?;
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_number += 1;

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);

        for hit in matcher.find_all(&line) {
            let item = SearchMatch {
                file: file.to_string(),
                entry: entry.map(str::to_string),
                line_number,
                line: line.chars().take(MAX_LINE_EXCERPT).collect(),
                matched_text: hit.text,
                column_start: hit.start,
                column_end: hit.end,
            };
            if !collector.push(item) {
                return Ok(());
            }
        }
    }

    Ok(())
}
