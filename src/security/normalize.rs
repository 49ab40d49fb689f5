//! Command normalization.
//!
//! Every request is normalized exactly once before it reaches the rule table,
//! so lexically different spellings of the same command (extra whitespace,
//! quoting, letter case, absolute program paths) are classified identically.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Shell constructs detected outside single quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellConstruct {
    Pipe,
    Sequence,
    And,
    Or,
    Background,
    Newline,
    RedirectOut,
    RedirectIn,
    CommandSubstitution,
    ProcessSubstitution,
    ParameterExpansion,
    InlineAssignment,
}

impl ShellConstruct {
    /// Chain operators separate simple commands that can be judged one by one.
    /// Everything else changes what the command reads, writes or executes.
    pub fn is_chain_operator(self) -> bool {
        matches!(self, Self::Pipe | Self::Sequence | Self::And | Self::Or)
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Pipe => "|",
            Self::Sequence => ";",
            Self::And => "&&",
            Self::Or => "||",
            Self::Background => "&",
            Self::Newline => ";",
            Self::RedirectOut => ">",
            Self::RedirectIn => "<",
            Self::CommandSubstitution => "$(",
            Self::ProcessSubstitution => "<(",
            Self::ParameterExpansion => "$",
            Self::InlineAssignment => "=",
        }
    }
}

impl fmt::Display for ShellConstruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("empty command")]
    Empty,
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("trailing escape character")]
    TrailingEscape,
    #[error("command contains a NUL byte")]
    NulByte,
}

/// One simple command between chain operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Unquoted tokens in their original spelling, used for execution.
    pub tokens: Vec<String>,
    /// Case-folded tokens with the program reduced to its basename.
    pub folded: Vec<String>,
    /// Directory part of a path-qualified program, original spelling.
    pub program_dir: Option<String>,
}

impl Segment {
    fn new(tokens: Vec<String>) -> Self {
        let folded = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| fold_token(t, i == 0))
            .collect();
        let program_dir = tokens.first().and_then(|t| program_dir(t));
        Self {
            tokens,
            folded,
            program_dir,
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.folded.first().map(String::as_str)
    }

    /// What actually runs: the folded program name, resolved through the
    /// child's PATH, followed by the arguments in their original spelling.
    pub fn argv(&self) -> Vec<String> {
        self.folded
            .iter()
            .take(1)
            .chain(self.tokens.iter().skip(1))
            .cloned()
            .collect()
    }

    pub fn canonical(&self) -> String {
        self.folded.join(" ")
    }
}

/// A command after quoting resolution, construct detection and folding.
#[derive(Debug, Clone)]
pub struct NormalizedCommand {
    raw: String,
    segments: Vec<Segment>,
    /// Operator between `segments[i]` and `segments[i + 1]`.
    joins: Vec<ShellConstruct>,
    constructs: Vec<ShellConstruct>,
    canonical: String,
}

impl NormalizedCommand {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn constructs(&self) -> &[ShellConstruct] {
        &self.constructs
    }

    /// Folded tokens of every segment joined by single spaces, with chain
    /// operators kept between segments.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn has_constructs(&self) -> bool {
        !self.constructs.is_empty()
    }

    /// True when the only constructs present are chain operators.
    pub fn is_plain_chain(&self) -> bool {
        self.constructs.iter().all(|c| c.is_chain_operator())
    }

    /// All tokens across segments, original spelling.
    pub fn all_tokens(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().flat_map(|s| s.tokens.iter().map(String::as_str))
    }

    /// Rebuild a shell script from each segment's argv. Every token is quoted,
    /// so the shell only ever sees the chain operators we validated.
    pub fn to_shell_script(&self) -> String {
        let mut script = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                if let Some(op) = self.joins.get(i - 1) {
                    script.push(' ');
                    script.push_str(op.symbol());
                    script.push(' ');
                }
            }
            let quoted: Vec<String> = segment.argv().iter().map(|t| shell_quote(t)).collect();
            script.push_str(&quoted.join(" "));
        }
        script
    }
}

/// Normalize a raw command string.
pub fn normalize(raw: &str) -> Result<NormalizedCommand, NormalizeError> {
    if raw.contains('\0') {
        return Err(NormalizeError::NulByte);
    }

    let mut lexer = Lexer::default();
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                lexer.in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => lexer.current.push(c),
                        None => return Err(NormalizeError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                lexer.in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => lexer.current.push(c),
                            Some('\n') => {}
                            Some(c) => {
                                lexer.current.push('\\');
                                lexer.current.push(c);
                            }
                            None => return Err(NormalizeError::UnterminatedQuote),
                        },
                        Some('`') => {
                            lexer.construct(ShellConstruct::CommandSubstitution);
                            lexer.current.push('`');
                        }
                        Some('$') => {
                            lexer.dollar(chars.peek().copied());
                            lexer.current.push('$');
                        }
                        Some(c) => lexer.current.push(c),
                        None => return Err(NormalizeError::UnterminatedQuote),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(c) => {
                    lexer.in_token = true;
                    lexer.current.push(c);
                }
                None => return Err(NormalizeError::TrailingEscape),
            },
            c if c.is_whitespace() && c != '\n' => lexer.end_token(),
            '\n' => lexer.split(ShellConstruct::Newline),
            ';' => lexer.split(ShellConstruct::Sequence),
            '|' => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                    lexer.split(ShellConstruct::Or);
                } else {
                    lexer.split(ShellConstruct::Pipe);
                }
            }
            '&' => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                    lexer.split(ShellConstruct::And);
                } else {
                    lexer.split(ShellConstruct::Background);
                }
            }
            '>' | '<' => {
                lexer.end_token();
                if chars.peek() == Some(&'(') {
                    lexer.construct(ShellConstruct::ProcessSubstitution);
                } else if ch == '>' {
                    lexer.construct(ShellConstruct::RedirectOut);
                } else {
                    lexer.construct(ShellConstruct::RedirectIn);
                }
                // `>>`, `>&`, `<<` and friends are the same construct.
                while matches!(chars.peek(), Some('>' | '<' | '&')) {
                    chars.next();
                }
            }
            '`' => {
                lexer.construct(ShellConstruct::CommandSubstitution);
                lexer.in_token = true;
                lexer.current.push('`');
            }
            '$' => {
                lexer.dollar(chars.peek().copied());
                lexer.in_token = true;
                lexer.current.push('$');
            }
            c => {
                lexer.in_token = true;
                lexer.current.push(c);
            }
        }
    }

    lexer.finish(raw)
}

#[derive(Default)]
struct Lexer {
    current: String,
    in_token: bool,
    tokens: Vec<String>,
    segments: Vec<Segment>,
    joins: Vec<ShellConstruct>,
    constructs: Vec<ShellConstruct>,
}

impl Lexer {
    fn end_token(&mut self) {
        if self.in_token {
            self.tokens.push(std::mem::take(&mut self.current));
            self.in_token = false;
        }
    }

    fn construct(&mut self, construct: ShellConstruct) {
        if !self.constructs.contains(&construct) {
            self.constructs.push(construct);
        }
    }

    fn dollar(&mut self, next: Option<char>) {
        match next {
            Some('(') => self.construct(ShellConstruct::CommandSubstitution),
            Some(c) if c == '{' || c == '_' || c.is_ascii_alphanumeric() => {
                self.construct(ShellConstruct::ParameterExpansion)
            }
            Some('?' | '$' | '!' | '#' | '@' | '*' | '-') => {
                self.construct(ShellConstruct::ParameterExpansion)
            }
            _ => {}
        }
    }

    fn split(&mut self, op: ShellConstruct) {
        self.end_token();
        self.construct(op);
        self.push_segment();
        self.joins.push(op);
    }

    fn push_segment(&mut self) {
        let tokens = std::mem::take(&mut self.tokens);
        if let Some(first) = tokens.first() {
            if is_inline_assignment(first) {
                self.construct(ShellConstruct::InlineAssignment);
            }
        }
        self.segments.push(Segment::new(tokens));
    }

    fn finish(mut self, raw: &str) -> Result<NormalizedCommand, NormalizeError> {
        self.end_token();
        self.push_segment();

        // Drop empty segments produced by trailing operators (`ls;`), keeping
        // the joins aligned with the segments that remain.
        let mut segments = Vec::with_capacity(self.segments.len());
        let mut joins = Vec::with_capacity(self.joins.len());
        for (i, segment) in self.segments.into_iter().enumerate() {
            if segment.tokens.is_empty() {
                continue;
            }
            if !segments.is_empty() {
                if let Some(op) = self.joins.get(i.saturating_sub(1)) {
                    joins.push(*op);
                }
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(NormalizeError::Empty);
        }

        let mut canonical = String::new();
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                if let Some(op) = joins.get(i - 1) {
                    canonical.push(' ');
                    canonical.push_str(op.symbol());
                    canonical.push(' ');
                }
            }
            canonical.push_str(&segment.canonical());
        }

        Ok(NormalizedCommand {
            raw: raw.to_string(),
            segments,
            joins,
            constructs: self.constructs,
            canonical,
        })
    }
}

fn is_inline_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn program_dir(token: &str) -> Option<String> {
    match token.rsplit_once('/') {
        Some((_, "")) | None => None,
        Some(("", _)) => Some("/".to_string()),
        Some((dir, _)) => Some(dir.to_string()),
    }
}

fn fold_token(token: &str, is_program: bool) -> String {
    let folded = token.to_lowercase();
    if is_program {
        match folded.rsplit_once('/') {
            Some((_, base)) if !base.is_empty() => base.to_string(),
            _ => folded,
        }
    } else {
        folded
    }
}

/// Quote a word for POSIX `sh`.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | ',' | '+'));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
