use aho_corasick::AhoCorasick;
use anyhow::Context;
use regex::Regex;
use tracing::{debug, instrument, trace};

use crate::ledger::{Finding, LedgerError, Session, SessionState, Severity};

const DEFAULT_CONFIDENCE: f64 = 0.70;
const MAX_DESCRIPTION_CHARS: usize = 500;
const UNKNOWN_KIND: &str = "unknown";

/// Keyword families in priority order; the earliest family with any hit wins.
const KIND_KEYWORDS: &[(&str, &[&str])] = &[
    ("reentrancy", &["reentrancy", "reentrant", "re-entrancy"]),
    ("flash loan", &["flash loan", "flashloan", "flash-loan"]),
    ("oracle manipulation", &["oracle", "price manipulation"]),
    ("access control", &["access control", "unauthorized", "permission"]),
    ("integer overflow", &["overflow", "underflow", "integer"]),
    ("inflation attack", &["inflation", "first depositor", "donation"]),
    ("front-running", &["front-run", "frontrun", "mev", "sandwich"]),
    ("logic error", &["logic", "edge case", "off-by-one"]),
];

/// Parses FINDINGS-style markdown reports into findings.
///
/// A report is split into sections at markdown headings. A section becomes a
/// finding when it carries a severity marker: `## High: title`,
/// `Severity: Critical` or `**Medium**`.
pub struct TextFindingExtractor {
    heading: Regex,
    labeled: Regex,
    bold: Regex,
    confidence: Regex,
    keywords: AhoCorasick,
    keyword_kinds: Vec<usize>,
}

impl TextFindingExtractor {
    pub fn new() -> anyhow::Result<Self> {
        let heading = Regex::new(r"(?i)^#+\s*(critical|high|medium|low)\b[\s:\-]*(.*)$")
            .context("invalid heading severity pattern")?;
        let labeled = Regex::new(r"(?i)severity\**\s*:\s*\**\s*(critical|high|medium|low|info)\b")
            .context("invalid labeled severity pattern")?;
        let bold = Regex::new(r"(?i)\*\*(critical|high|medium|low)\*\*")
            .context("invalid bold severity pattern")?;
        let confidence = Regex::new(r"(?i)confidence\**[:\s]*\**\s*(\d+(?:\.\d+)?)\s*(%?)")
            .context("invalid confidence pattern")?;

        let mut patterns = Vec::new();
        let mut keyword_kinds = Vec::new();
        for (kind_idx, (_, keywords)) in KIND_KEYWORDS.iter().enumerate() {
            for keyword in keywords.iter() {
                patterns.push(*keyword);
                keyword_kinds.push(kind_idx);
            }
        }
        let keywords = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(patterns)
            .context("failed to build vulnerability keyword automaton")?;

        Ok(Self {
            heading,
            labeled,
            bold,
            confidence,
            keywords,
            keyword_kinds,
        })
    }

    /// Extract the findings reported for a completed session.
    ///
    /// Findings are attributed to the session's target contract. Sessions that
    /// have not completed yield `SessionNotCompleted`.
    #[instrument(
        name = "extract_findings",
        skip(self, session, text),
        fields(session_id = %session.id)
    )]
    pub fn extract(&self, session: &Session, text: &str) -> Result<Vec<Finding>, LedgerError> {
        if session.state != SessionState::Completed {
            return Err(LedgerError::SessionNotCompleted {
                id: session.id.clone(),
                state: session.state,
            });
        }

        let mut findings = Vec::new();
        for section in split_sections(text) {
            let Some(parsed) = self.parse_section(section) else {
                trace!("section without severity marker skipped");
                continue;
            };
            let finding = Finding::new(
                session.target.contract.clone(),
                self.guess_kind(&parsed.description),
                parsed.confidence,
                session.id.clone(),
                parsed.description,
            )?
            .with_severity(parsed.severity);
            findings.push(finding);
        }
        debug!(count = findings.len(), "extracted findings");
        Ok(findings)
    }

    /// Vulnerability family for a free-text description, `unknown` when nothing matches.
    pub fn guess_kind(&self, text: &str) -> &'static str {
        self.keywords
            .find_overlapping_iter(text)
            .map(|hit| self.keyword_kinds[hit.pattern().as_usize()])
            .min()
            .map_or(UNKNOWN_KIND, |idx| KIND_KEYWORDS[idx].0)
    }

    fn parse_section(&self, section: &str) -> Option<ParsedSection> {
        let (first_line, body) = section.split_once('\n').unwrap_or((section, ""));
        let first_line = first_line.trim();

        let (severity, description) = if let Some(caps) = self.heading.captures(first_line) {
            let severity = caps[1].parse::<Severity>().ok()?;
            let title = caps.get(2).map_or("", |m| m.as_str()).trim();
            (severity, join_description(title, body))
        } else {
            let caps = self
                .labeled
                .captures(section)
                .or_else(|| self.bold.captures(section))?;
            let severity = caps[1].parse::<Severity>().ok()?;
            let title = first_line.trim_start_matches('#').trim();
            (severity, join_description(title, body))
        };

        let confidence = self
            .confidence
            .captures(section)
            .and_then(|caps| {
                let value: f64 = caps[1].parse().ok()?;
                let percent = !caps[2].is_empty() || value > 1.0;
                Some(if percent { value / 100.0 } else { value })
            })
            .map_or(DEFAULT_CONFIDENCE, |value| value.clamp(0.0, 1.0));

        Some(ParsedSection {
            severity,
            confidence,
            description: truncate(&description, MAX_DESCRIPTION_CHARS),
        })
    }
}

struct ParsedSection {
    severity: Severity,
    confidence: f64,
    description: String,
}

/// Split at heading lines, keeping each heading with the body beneath it.
fn split_sections(text: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with('#') && offset > start {
            sections.push(&text[start..offset]);
            start = offset;
        }
        offset += line.len();
    }
    if start < text.len() {
        sections.push(&text[start..]);
    }
    sections
        .into_iter()
        .filter(|section| !section.trim().is_empty())
        .collect()
}

fn join_description(title: &str, body: &str) -> String {
    let body = body.trim();
    let joined = match (title.is_empty(), body.is_empty()) {
        (true, true) => return "see reference for details".to_string(),
        (false, true) => title.to_string(),
        (true, false) => body.to_string(),
        (false, false) => format!("{title}\n{body}"),
    };
    joined.trim().to_string()
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect()
}
