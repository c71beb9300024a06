//! Output classification
//!
//! The wrapped CLI has no structured status protocol, so status is inferred
//! from free-form text. A `RuleClassifier` runs an ordered list of rules
//! over each output chunk and the first rule that matches decides the
//! outcome. Rules are pure and panics inside them are contained, so a bad
//! rule degrades to "no hint" instead of taking down process supervision.

use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, Error, Result};
use crate::types::AgentStatus;
use regex::{Regex, RegexBuilder};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Outcome of classifying one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Status the agent should move to, if different from the prior one
    pub status_hint: Option<AgentStatus>,
    /// Short UI hint describing the latest activity
    pub task_summary: Option<String>,
}

/// Maps an output chunk plus the prior status to a status hint
pub trait StatusClassifier: Send + Sync {
    fn classify(&self, prior: AgentStatus, chunk: &str) -> Classification;
}

/// What a matching rule decided
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub status: Option<AgentStatus>,
    /// Overrides the default last-line summary
    pub summary: Option<String>,
}

impl Verdict {
    /// Matched, but the status stays as it is
    pub fn keep() -> Self {
        Self::default()
    }

    pub fn transition(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// One step of the classification pipeline.
///
/// Returning `None` passes the chunk on to the next rule.
#[cfg_attr(test, mockall::automock)]
pub trait ClassifierRule: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, prior: AgentStatus, chunk: &str) -> Option<Verdict>;
}

/// Ordered, first-match-wins rule pipeline
pub struct RuleClassifier {
    rules: Vec<Box<dyn ClassifierRule>>,
    summary_max_chars: usize,
}

impl RuleClassifier {
    pub fn new(rules: Vec<Box<dyn ClassifierRule>>, summary_max_chars: usize) -> Self {
        Self {
            rules,
            summary_max_chars,
        }
    }

    /// Default rule set built from the configured waiting patterns
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let rules: Vec<Box<dyn ClassifierRule>> = vec![
            Box::new(BlankChunkRule),
            Box::new(ToolInvocationRule),
            Box::new(AwaitingInputRule::new(&config.waiting_patterns)?),
            Box::new(ResumedOutputRule),
        ];
        Ok(Self::new(rules, config.summary_max_chars))
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    fn first_verdict(&self, prior: AgentStatus, chunk: &str) -> Option<Verdict> {
        for rule in &self.rules {
            match catch_unwind(AssertUnwindSafe(|| rule.evaluate(prior, chunk))) {
                Ok(Some(verdict)) => return Some(verdict),
                Ok(None) => continue,
                Err(_) => {
                    warn!("Classifier rule '{}' panicked; ignoring chunk", rule.name());
                    return None;
                }
            }
        }
        None
    }
}

impl StatusClassifier for RuleClassifier {
    fn classify(&self, prior: AgentStatus, chunk: &str) -> Classification {
        let verdict = self.first_verdict(prior, chunk).unwrap_or_default();

        let status_hint = verdict.status.filter(|s| *s != prior);
        let task_summary = verdict
            .summary
            .or_else(|| last_meaningful_line(chunk))
            .map(|s| truncate_summary(&s, self.summary_max_chars));

        Classification {
            status_hint,
            task_summary,
        }
    }
}

/// Whitespace-only chunks never change anything
pub struct BlankChunkRule;

impl ClassifierRule for BlankChunkRule {
    fn name(&self) -> &str {
        "blank"
    }

    fn evaluate(&self, _prior: AgentStatus, chunk: &str) -> Option<Verdict> {
        strip_ansi(chunk).trim().is_empty().then(Verdict::keep)
    }
}

/// Tool invocation markers such as `Tool: grep` or `⏺ Using tool Edit`.
///
/// The agent is busy: a running agent stays Running and a waiting one
/// has evidently resumed.
pub struct ToolInvocationRule;

impl ToolInvocationRule {
    const PREFIXES: [&'static str; 4] = ["tool:", "using tool", "calling tool", "running tool"];

    fn tool_name(line: &str) -> Option<String> {
        let line = line.trim_start_matches(|c: char| c.is_whitespace() || "⏺●•*-".contains(c));
        let lower = line.to_lowercase();
        let prefix = Self::PREFIXES.iter().find(|p| lower.starts_with(*p))?;
        let rest = line.get(prefix.len()..)?;
        let name: String = rest
            .trim_start_matches(|c: char| c.is_whitespace() || c == ':')
            .chars()
            .take_while(|c| c.is_alphanumeric() || "_-./".contains(*c))
            .collect();
        Some(name)
    }
}

impl ClassifierRule for ToolInvocationRule {
    fn name(&self) -> &str {
        "tool_invocation"
    }

    fn evaluate(&self, prior: AgentStatus, chunk: &str) -> Option<Verdict> {
        let clean = strip_ansi(chunk);
        let name = clean.lines().rev().find_map(Self::tool_name)?;
        let verdict = if prior == AgentStatus::Waiting {
            Verdict::transition(AgentStatus::Running)
        } else {
            Verdict::keep()
        };
        if name.is_empty() {
            Some(verdict)
        } else {
            Some(verdict.with_summary(format!("Using {}", name)))
        }
    }
}

/// Running -> Waiting when the last line looks like a prompt for input
pub struct AwaitingInputRule {
    patterns: Vec<Regex>,
}

impl AwaitingInputRule {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::Config(ConfigError::Invalid(format!(
                            "waiting pattern {:?}: {}",
                            p, e
                        )))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl ClassifierRule for AwaitingInputRule {
    fn name(&self) -> &str {
        "awaiting_input"
    }

    fn evaluate(&self, prior: AgentStatus, chunk: &str) -> Option<Verdict> {
        let clean = strip_ansi(chunk);
        let line = clean.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
        if !self.patterns.iter().any(|re| re.is_match(line)) {
            return None;
        }
        match prior {
            AgentStatus::Running => Some(Verdict::transition(AgentStatus::Waiting)),
            _ => Some(Verdict::keep()),
        }
    }
}

/// Any other output while Waiting means the agent carried on
pub struct ResumedOutputRule;

impl ClassifierRule for ResumedOutputRule {
    fn name(&self) -> &str {
        "resumed_output"
    }

    fn evaluate(&self, prior: AgentStatus, chunk: &str) -> Option<Verdict> {
        (prior == AgentStatus::Waiting && !chunk.trim().is_empty())
            .then(|| Verdict::transition(AgentStatus::Running))
    }
}

/// Last line with at least two alphanumeric characters
pub fn last_meaningful_line(chunk: &str) -> Option<String> {
    strip_ansi(chunk)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.chars().filter(|c| c.is_alphanumeric()).count() >= 2)
        .map(str::to_string)
}

/// Bound `text` to `max_chars` characters, marking the cut with "..."
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Remove ANSI CSI/OSC escape sequences
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {
                chars.next();
            }
        }
    }
    out
}
