//! YouTube id extraction from URLs, CSV exports and pasted text

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Largest batch accepted in one submission
pub const MAX_BATCH_ITEMS: usize = 100;

static URL_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:watch\?(?:[^\s#]*&)?v=|shorts/|embed/|live/|v/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)",
    )
    .expect("valid youtube url regex")
});

static BARE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid youtube id regex"));

/// Extract the 11-character video id from a URL or a bare id
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim().trim_matches(|c: char| c == '"' || c == '\'');
    if BARE_ID.is_match(input) {
        return Some(input.to_string());
    }
    URL_ID
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Ids found in a batch input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    /// Unique ids in first-seen order
    pub ids: Vec<String>,
    /// Cells that looked like YouTube links but had no usable id
    pub rejected: Vec<String>,
    /// Ids dropped because they were already listed
    pub duplicates: usize,
}

/// Parse CSV or free text into video ids
///
/// Input containing commas, semicolons or tabs is read as a table. Links are
/// taken from any cell, but bare ids only from the column that holds ids on
/// most rows, so titles and labels never pass for ids. A first row without
/// links is a header when its id cell is not an id or the column below it
/// holds links. Anything else is read as whitespace separated words.
pub fn parse_batch_input(text: &str) -> ParsedBatch {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    if lines.iter().any(|line| line.contains(is_delimiter)) {
        parse_table(&lines)
    } else {
        parse_words(&lines)
    }
}

#[derive(Default)]
struct Collector {
    parsed: ParsedBatch,
    seen: HashSet<String>,
}

impl Collector {
    fn add(&mut self, id: String) {
        if self.seen.insert(id.clone()) {
            self.parsed.ids.push(id);
        } else {
            self.parsed.duplicates += 1;
        }
    }

    fn reject(&mut self, cell: &str) {
        self.parsed.rejected.push(cell.to_string());
    }
}

fn parse_words(lines: &[&str]) -> ParsedBatch {
    let mut collector = Collector::default();
    for word in lines.iter().flat_map(|line| line.split_whitespace()) {
        let word = clean_cell(word);
        if word.is_empty() {
            continue;
        }
        if let Some(id) = url_id(word) {
            collector.add(id);
        } else if BARE_ID.is_match(word) && !is_plain_word(word) {
            collector.add(word.to_string());
        } else if looks_like_youtube_link(word) {
            collector.reject(word);
        }
    }
    collector.parsed
}

fn parse_table(lines: &[&str]) -> ParsedBatch {
    let rows: Vec<Vec<&str>> = lines
        .iter()
        .map(|line| line.split(is_delimiter).map(clean_cell).collect())
        .collect();

    let body_start = usize::from(rows.len() > 1);
    let ids_at = id_column(&rows[body_start..]);
    let skip = usize::from(rows.len() > 1 && is_header(&rows[0], &rows[1..], ids_at));

    let mut collector = Collector::default();
    for row in &rows[skip..] {
        for (index, cell) in row.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            if let Some(id) = url_id(cell) {
                collector.add(id);
            } else if Some(index) == ids_at && BARE_ID.is_match(cell) {
                collector.add(cell.to_string());
            } else if looks_like_youtube_link(cell) {
                collector.reject(cell);
            }
        }
    }
    collector.parsed
}

/// Column with the most id cells, links breaking ties, then leftmost
fn id_column(rows: &[Vec<&str>]) -> Option<usize> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|column| {
            let mut ids = 0usize;
            let mut links = 0usize;
            for cell in rows.iter().filter_map(|row| row.get(column)) {
                if url_id(cell).is_some() {
                    ids += 1;
                    links += 1;
                } else if BARE_ID.is_match(cell) {
                    ids += 1;
                }
            }
            (column, ids, links)
        })
        .filter(|(_, ids, _)| *ids > 0)
        .max_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)).then(b.0.cmp(&a.0)))
        .map(|(column, _, _)| column)
}

fn is_header(first: &[&str], body: &[Vec<&str>], id_column: Option<usize>) -> bool {
    if first.iter().any(|cell| url_id(cell).is_some()) {
        return false;
    }
    let Some(column) = id_column else {
        return true;
    };
    let label = first.get(column).copied().unwrap_or("");
    !BARE_ID.is_match(label)
        || body
            .iter()
            .any(|row| row.get(column).map_or(false, |cell| url_id(cell).is_some()))
}

fn is_delimiter(c: char) -> bool {
    c == ',' || c == ';' || c == '\t'
}

fn clean_cell(cell: &str) -> &str {
    cell.trim().trim_matches(|c: char| c == '"' || c == '\'')
}

fn url_id(cell: &str) -> Option<String> {
    URL_ID
        .captures(cell)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Words like "Description" are 11 letters too
fn is_plain_word(cell: &str) -> bool {
    let mut chars = cell.chars();
    let first_ok = chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    first_ok && chars.all(|c| c.is_ascii_lowercase())
}

fn looks_like_youtube_link(cell: &str) -> bool {
    let lower = cell.to_ascii_lowercase();
    lower.contains("youtube.") || lower.contains("youtu.be")
}
