//! Command classification.
//!
//! The classifier walks the rule table: deny rules first (a match is final),
//! then shell-construct checks, then allow rules per segment. Anything that
//! falls through is denied as unrecognized.

use tracing::debug;

use super::normalize::NormalizedCommand;
use super::root_guard::{RootAssessment, RootGuard};
use super::rules::RuleTable;
use super::{ClassificationVerdict, VerdictCategory};

/// Rule id reported when a command carries a construct we refuse.
pub const SHELL_CONSTRUCT_RULE: &str = "shell-construct";

#[derive(Debug)]
pub struct Classifier {
    table: RuleTable,
    allow_validated_chains: bool,
}

impl Classifier {
    pub fn new(table: RuleTable, allow_validated_chains: bool) -> Self {
        Self {
            table,
            allow_validated_chains,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.table.len()
    }

    pub fn classify(&self, command: &NormalizedCommand) -> ClassificationVerdict {
        if let Some(rule) = self.table.first_deny(command) {
            return ClassificationVerdict::denied(&rule.id, &rule.rationale);
        }

        if command.has_constructs() {
            let chain_ok = self.allow_validated_chains && command.is_plain_chain();
            if !chain_ok {
                let offending = command
                    .constructs()
                    .iter()
                    .find(|c| !self.allow_validated_chains || !c.is_chain_operator())
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                return ClassificationVerdict::denied(
                    SHELL_CONSTRUCT_RULE,
                    &format!("shell construct '{offending}' is not permitted"),
                );
            }
        }

        let mut ids = Vec::with_capacity(command.segments().len());
        let mut rationale = Vec::with_capacity(command.segments().len());
        let mut mutating = false;
        for segment in command.segments() {
            match self.table.first_allow(segment) {
                Some(rule) => {
                    ids.push(rule.id.as_str());
                    rationale.push(rule.rationale.as_str());
                    mutating |= rule.mutating;
                }
                None => {
                    debug!("no allow rule for segment '{}'", segment.canonical());
                    return ClassificationVerdict::unrecognized("no allow rule matches");
                }
            }
        }

        ClassificationVerdict::allowed(&ids.join(","), &rationale.join("; "), mutating)
    }
}

/// Classifier plus root guard. The guard runs on every command and its veto
/// wins over any classifier outcome, deny rules included.
#[derive(Debug)]
pub struct Policy {
    classifier: Classifier,
    root_guard: RootGuard,
}

impl Policy {
    pub fn new(classifier: Classifier, root_guard: RootGuard) -> Self {
        Self {
            classifier,
            root_guard,
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn root_guard(&self) -> &RootGuard {
        &self.root_guard
    }

    pub fn evaluate(&self, command: &NormalizedCommand) -> ClassificationVerdict {
        let assessment = self.root_guard.assess(command);
        self.combine(command, assessment, false)
    }

    /// Merge a root assessment with the classifier's view of `command`.
    /// `intrinsically_mutating` covers structured actions whose effect is
    /// known regardless of rule flags.
    pub fn combine(
        &self,
        command: &NormalizedCommand,
        assessment: RootAssessment,
        intrinsically_mutating: bool,
    ) -> ClassificationVerdict {
        if assessment.is_violation() {
            if let Some(class) = assessment.verb_class {
                return ClassificationVerdict::root_protected(class);
            }
        }

        let mut verdict = self.classifier.classify(command);
        if verdict.category == VerdictCategory::Allowed
            && (assessment.is_mutating() || intrinsically_mutating)
        {
            verdict.mutating = true;
        }
        verdict
    }
}
