//! Research intent extraction from note text
//!
//! Explicit `#investigate <query>` tags are collected first, then free-text
//! phrases such as "look into X" on lines without a tag. Queries are
//! normalized, filtered and deduplicated case-insensitively across notes.

use regex::Regex;
use signalforge_sdk::{ResearchTask, SourceItem, TaskExtractor, TaskReason};
use std::collections::HashSet;

const HINT_PATTERNS: &[&str] = &[
    r"\bread about\s+(.+)",
    r"\blook into\s+(.+)",
    r"\bresearch\s+(.+)",
    r"\bwondering what\s+(.+)",
    r"\b(?:something|smth) about\s+(.+)",
    r"\bexplore\s+(.+)",
    r"\bdig into\s+(.+)",
    r"\bcheck out\s+(.+)",
    r"\blearn (?:more )?about\s+(.+)",
    r"\bfigure out\s+(.+)",
    r"\bunderstand\s+(.+)",
    r"\bhow does\s+(.+)\s+work",
    r"\bwhat is\s+(.+)",
    r"\bwhat are\s+(.+)",
    r"\bwhy (?:is|are|does|do)\s+(.+)",
    r"\bneed to (?:know|understand|learn)\s+(.+)",
    r"\bcurious about\s+(.+)",
    r"\binvestigate\s+(.+)",
    r"\bfollow up on\s+(.+)",
    r"\bkeep an eye on\s+(.+)",
];

/// Words that make a captured phrase a pronoun or filler rather than a topic
const BAD_STARTS: &[&str] = &[
    "that", "this", "it", "as", "well", "maybe", "and", "but", "so", "the", "a", "an",
];

const MIN_QUERY_CHARS: usize = 3;
const MAX_QUERY_CHARS: usize = 80;

pub struct IntentExtractor {
    explicit: Regex,
    hints: Vec<Regex>,
    leading: Regex,
    quotes: Regex,
    whitespace: Regex,
    filler_tail: Regex,
    verb_tail: Regex,
    trailing_punct: Regex,
    alnum: Regex,
}

impl Default for IntentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentExtractor {
    pub fn new() -> Self {
        let re = |pattern: &str| Regex::new(pattern).expect("intent regex must compile");
        Self {
            explicit: re(r"(?i)#investigate\b(?::|\s+)?([^\n#]*)"),
            hints: HINT_PATTERNS.iter().map(|p| re(&format!("(?i){p}"))).collect(),
            leading: re(r"^[:\-\s]+"),
            quotes: re(r#"["'`]+"#),
            whitespace: re(r"\s+"),
            filler_tail: re(r"(?i)\b(as well|maybe|for now|at some point)\b.*$"),
            verb_tail: re(r"(?i)\b(could help|might help|is|are)\b.*$"),
            trailing_punct: re(r"[.?!;:]+$"),
            alnum: re(r"(?i)[a-z0-9]"),
        }
    }

    /// Cleans a captured phrase down to a search query
    pub fn normalize_query(&self, text: &str) -> String {
        let value = self.leading.replace(text, "");
        let value = self.quotes.replace_all(&value, "");
        let value = self.whitespace.replace_all(&value, " ");
        let value = value.trim();

        let value = self.filler_tail.replace(value, "");
        let value = self.verb_tail.replace(&value, "");
        let value = value.trim();

        let value = value.split(',').next().unwrap_or_default().trim();
        let value = self.trailing_punct.replace(value, "");
        value.trim().to_string()
    }

    pub fn is_reasonable_query(&self, query: &str) -> bool {
        let len = query.chars().count();
        if !(MIN_QUERY_CHARS..=MAX_QUERY_CHARS).contains(&len) {
            return false;
        }
        let Some(first) = query.split_whitespace().next() else {
            return false;
        };
        if BAD_STARTS.contains(&first.to_lowercase().as_str()) {
            return false;
        }
        self.alnum.is_match(query)
    }

    fn collect_explicit(&self, item: &SourceItem, out: &mut Vec<ResearchTask>, seen: &mut HashSet<String>) {
        for captures in self.explicit.captures_iter(&item.content) {
            let raw = captures.get(1).map_or("", |m| m.as_str()).trim();
            if raw.is_empty() {
                continue;
            }
            let query = self.normalize_query(raw);
            if !self.is_reasonable_query(&query) {
                continue;
            }
            let snippet = captures.get(0).map_or("", |m| m.as_str()).trim().to_string();
            push_task(out, seen, query, item, TaskReason::Explicit, snippet);
        }
    }

    fn collect_heuristic(&self, item: &SourceItem, out: &mut Vec<ResearchTask>, seen: &mut HashSet<String>) {
        let lines = item
            .content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.contains("#investigate"));

        for line in lines {
            // first pattern yielding a usable query wins for a line
            let query = self.hints.iter().find_map(|hint| {
                let captured = hint.captures(line)?.get(1)?;
                let query = self.normalize_query(captured.as_str());
                self.is_reasonable_query(&query).then_some(query)
            });
            if let Some(query) = query {
                push_task(out, seen, query, item, TaskReason::Heuristic, line.to_string());
            }
        }
    }
}

fn push_task(
    out: &mut Vec<ResearchTask>,
    seen: &mut HashSet<String>,
    query: String,
    item: &SourceItem,
    reason: TaskReason,
    snippet: String,
) {
    if seen.insert(query.to_lowercase()) {
        out.push(ResearchTask {
            query,
            source_id: item.id.clone(),
            reason,
            snippet,
        });
    }
}

impl TaskExtractor for IntentExtractor {
    fn extract(&self, items: &[SourceItem], limit: usize) -> Vec<ResearchTask> {
        let mut tasks = Vec::new();
        let mut seen = HashSet::new();
        for item in items {
            self.collect_explicit(item, &mut tasks, &mut seen);
            self.collect_heuristic(item, &mut tasks, &mut seen);
            if tasks.len() >= limit {
                break;
            }
        }
        tasks.truncate(limit);
        tasks
    }
}
