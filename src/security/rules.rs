//! Declarative policy rule table.
//!
//! Rules are loaded from configuration as `{id, pattern, kind, action,
//! priority, mutating, rationale}` and compiled once. Deny rules and allow
//! rules are kept in separate lists, each sorted by descending priority with
//! ties kept in declaration order.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::normalize::{NormalizedCommand, Segment};

/// Pattern token that swallows the rest of a segment. Deny rules only.
const REST_WILDCARD: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Token-wise match with `*` wildcards confined to one token.
    #[default]
    Glob,
    /// Case-insensitive regular expression over the canonical command text.
    Regex,
}

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub kind: PatternKind,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    /// Whether an allowed command changes state. Unknown means yes.
    #[serde(default = "default_mutating")]
    pub mutating: bool,
    #[serde(default)]
    pub rationale: String,
}

fn default_mutating() -> bool {
    true
}

impl RuleSpec {
    pub fn allow(id: &str, pattern: &str, mutating: bool, rationale: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            kind: PatternKind::Glob,
            action: RuleAction::Allow,
            priority: 0,
            mutating,
            rationale: rationale.to_string(),
        }
    }

    pub fn deny(id: &str, kind: PatternKind, pattern: &str, rationale: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            kind,
            action: RuleAction::Deny,
            priority: 100,
            mutating: true,
            rationale: rationale.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{0}' has an empty pattern")]
    EmptyPattern(String),
    #[error("allow rule '{0}' must use a bounded glob pattern")]
    UnboundedAllow(String),
    #[error("rule '{id}' has an invalid regex")]
    InvalidRegex {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate rule id '{0}'")]
    DuplicateId(String),
}

#[derive(Debug)]
enum Matcher {
    Glob { tokens: Vec<String>, open_ended: bool },
    Regex(Regex),
}

/// A compiled rule.
#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub action: RuleAction,
    pub priority: i32,
    pub mutating: bool,
    pub rationale: String,
    matcher: Matcher,
}

impl Rule {
    fn compile(spec: &RuleSpec) -> Result<Self, RuleError> {
        let pattern = spec.pattern.trim();
        if pattern.is_empty() {
            return Err(RuleError::EmptyPattern(spec.id.clone()));
        }

        let matcher = match spec.kind {
            PatternKind::Regex => {
                if spec.action == RuleAction::Allow {
                    return Err(RuleError::UnboundedAllow(spec.id.clone()));
                }
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RuleError::InvalidRegex {
                        id: spec.id.clone(),
                        source,
                    })?;
                Matcher::Regex(regex)
            }
            PatternKind::Glob => {
                let mut tokens: Vec<String> =
                    pattern.split_whitespace().map(str::to_lowercase).collect();
                let open_ended = tokens.last().map(String::as_str) == Some(REST_WILDCARD);
                if open_ended {
                    if spec.action == RuleAction::Allow {
                        return Err(RuleError::UnboundedAllow(spec.id.clone()));
                    }
                    tokens.pop();
                }
                Matcher::Glob { tokens, open_ended }
            }
        };

        Ok(Self {
            id: spec.id.clone(),
            action: spec.action,
            priority: spec.priority,
            mutating: spec.mutating,
            rationale: spec.rationale.clone(),
            matcher,
        })
    }

    /// Match one simple command. Regex rules see the segment's canonical text.
    pub fn matches_segment(&self, segment: &Segment) -> bool {
        match &self.matcher {
            Matcher::Glob { tokens, open_ended } => {
                let arity_ok = if *open_ended {
                    segment.folded.len() >= tokens.len()
                } else {
                    segment.folded.len() == tokens.len()
                };
                arity_ok
                    && tokens
                        .iter()
                        .zip(&segment.folded)
                        .all(|(pattern, token)| glob_match(pattern, token))
            }
            Matcher::Regex(regex) => regex.is_match(&segment.canonical()),
        }
    }

    /// Match a whole command: regex rules see the full canonical text, glob
    /// rules match if any segment does.
    pub fn matches_command(&self, command: &NormalizedCommand) -> bool {
        match &self.matcher {
            Matcher::Regex(regex) => regex.is_match(command.canonical()),
            Matcher::Glob { .. } => command.segments().iter().any(|s| self.matches_segment(s)),
        }
    }
}

/// Compiled deny and allow lists.
#[derive(Debug, Default)]
pub struct RuleTable {
    deny: Vec<Rule>,
    allow: Vec<Rule>,
}

impl RuleTable {
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, RuleError> {
        let mut seen = HashSet::new();
        let mut deny = Vec::new();
        let mut allow = Vec::new();

        for spec in specs {
            if !seen.insert(spec.id.as_str()) {
                return Err(RuleError::DuplicateId(spec.id.clone()));
            }
            let rule = Rule::compile(spec)?;
            match rule.action {
                RuleAction::Deny => deny.push(rule),
                RuleAction::Allow => allow.push(rule),
            }
        }

        // Stable sort keeps declaration order among equal priorities.
        deny.sort_by(|a, b| b.priority.cmp(&a.priority));
        allow.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self { deny, allow })
    }

    pub fn first_deny(&self, command: &NormalizedCommand) -> Option<&Rule> {
        self.deny.iter().find(|r| r.matches_command(command))
    }

    pub fn first_allow(&self, segment: &Segment) -> Option<&Rule> {
        self.allow.iter().find(|r| r.matches_segment(segment))
    }

    pub fn len(&self) -> usize {
        self.deny.len() + self.allow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `*` matches any run of characters inside a single token except `/`;
/// `**` also crosses `/`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let n = text.len();
    // reach[i]: the pattern consumed so far can match `text[..i]`.
    let mut reach = vec![false; n + 1];
    reach[0] = true;

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        let mut next = vec![false; n + 1];
        if c == '*' {
            let crosses = chars.peek() == Some(&'*');
            while chars.peek() == Some(&'*') {
                chars.next();
            }
            let mut open = false;
            for i in 0..=n {
                open |= reach[i];
                next[i] = open;
                if !crosses && text.get(i) == Some(&'/') {
                    open = false;
                }
            }
        } else {
            for i in 0..n {
                if reach[i] && text[i] == c {
                    next[i + 1] = true;
                }
            }
        }
        reach = next;
    }
    reach[n]
}
