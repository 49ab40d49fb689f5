//! Protected-identity invariant checker.
//!
//! Literal patterns can never enumerate every spelling of "change the root
//! password". Instead this checker pulls two things out of a command: the
//! identities it mentions and the class of verb it applies. A command that
//! mentions the protected identity and carries any mutating verb is vetoed,
//! whatever tool, subcommand or alias surfaced it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::normalize::NormalizedCommand;
use crate::api::HttpMethod;

/// Mutating verb classes, least to most specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerbClass {
    Modify,
    Disable,
    Delete,
    ChangePrivilege,
    ChangeCredential,
}

impl fmt::Display for VerbClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Modify => "modify",
            Self::Disable => "disable",
            Self::Delete => "delete",
            Self::ChangePrivilege => "change-privilege",
            Self::ChangeCredential => "change-credential",
        };
        f.write_str(s)
    }
}

const CREDENTIAL_VERBS: &[&str] = &[
    "passwd", "chpasswd", "password", "passwords", "passphrase", "pw", "pwd", "credential",
    "credentials", "secret", "token", "tokens", "key", "keys", "keygen", "authorized", "totp",
    "tfa", "otp", "2fa", "shadow",
];

const PRIVILEGE_VERBS: &[&str] = &[
    "gpasswd", "groupmod", "group", "chgrp", "setfacl", "acl", "role", "roles", "grant", "revoke",
    "sudoers", "visudo", "privilege", "privileges", "priv", "privs", "perm", "perms", "permission",
    "permissions", "chmod", "elevate", "promote", "demote", "wheel",
];

const DELETE_VERBS: &[&str] = &[
    "userdel", "deluser", "rmuser", "del", "delete", "remove", "rm", "rmdir", "destroy", "purge",
    "erase", "drop", "wipe", "unlink", "shred",
];

const DISABLE_VERBS: &[&str] = &[
    "disable", "lock", "expire", "expiry", "chage", "suspend", "kill", "pkill", "killall", "block",
    "ban", "deactivate", "nologin", "logout",
];

const MODIFY_VERBS: &[&str] = &[
    "usermod", "moduser", "useradd", "adduser", "chsh", "chfn", "chown", "modify", "mod", "set",
    "update", "edit", "change", "rename", "mv", "move", "replace", "reset", "unlock", "enable",
    "create", "write", "truncate", "tee", "assign",
];

/// Programs that only read account state; their arguments are not verbs.
const READ_ONLY_PROGRAMS: &[&str] = &[
    "id", "getent", "groups", "whoami", "who", "w", "finger", "last", "lastlog", "ls", "cat",
    "stat", "du", "grep", "head", "tail", "less", "more", "wc", "echo", "printf",
];

/// The designated identity that may never be mutated through the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedIdentity {
    /// Case-folded user parts (realm suffixes stripped).
    names: BTreeSet<String>,
}

impl ProtectedIdentity {
    pub fn new(primary: &str, aliases: &[String]) -> Self {
        let names = std::iter::once(primary)
            .chain(aliases.iter().map(String::as_str))
            .map(user_part)
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    pub fn matches(&self, word: &str) -> bool {
        let candidate = user_part(word);
        !candidate.is_empty() && self.names.contains(&candidate)
    }
}

fn user_part(name: &str) -> String {
    name.split('@').next().unwrap_or_default().trim().to_lowercase()
}

/// Outcome of a root-protection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootAssessment {
    /// Most specific mutating verb class found, protected identity or not.
    pub verb_class: Option<VerbClass>,
    pub targets_protected: bool,
}

impl RootAssessment {
    pub fn is_violation(&self) -> bool {
        self.targets_protected && self.verb_class.is_some()
    }

    pub fn is_mutating(&self) -> bool {
        self.verb_class.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RootGuard {
    identity: ProtectedIdentity,
}

impl RootGuard {
    pub fn new(identity: ProtectedIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &ProtectedIdentity {
        &self.identity
    }

    /// Assess a shell command. Identities are collected across every segment
    /// so `echo root | xargs userdel` still counts.
    pub fn assess(&self, command: &NormalizedCommand) -> RootAssessment {
        let targets_protected = command
            .all_tokens()
            .flat_map(identity_words)
            .any(|w| self.identity.matches(w));

        let verb_class = command
            .segments()
            .iter()
            .filter(|s| !s.program().is_some_and(|p| READ_ONLY_PROGRAMS.contains(&p)))
            .flat_map(|s| s.folded.iter())
            .flat_map(|t| verb_words(t))
            .filter_map(classify_verb)
            .max();

        RootAssessment {
            verb_class,
            targets_protected,
        }
    }

    /// Assess a structured management API call. The method decides whether
    /// the call mutates; the path and payload say what it mutates.
    pub fn assess_api(
        &self,
        method: HttpMethod,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> RootAssessment {
        let mut texts: Vec<&str> = vec![path];
        if let Some(value) = payload {
            collect_strings(value, &mut texts);
        }

        let targets_protected = texts
            .iter()
            .copied()
            .flat_map(identity_words)
            .any(|w| self.identity.matches(w));

        let verb_class = match method {
            HttpMethod::Get => None,
            HttpMethod::Delete => Some(VerbClass::Delete),
            HttpMethod::Post | HttpMethod::Put => {
                let path_class = verb_words(&path.to_lowercase())
                    .filter_map(classify_verb)
                    .filter(|c| *c >= VerbClass::ChangePrivilege)
                    .max();
                Some(path_class.unwrap_or(VerbClass::Modify))
            }
        };

        RootAssessment {
            verb_class,
            targets_protected,
        }
    }
}

fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                out.push(k);
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

/// Identity candidates: split on whitespace and separators, keeping `-`, `_`
/// and `.` inside names.
fn identity_words(token: &str) -> impl Iterator<Item = &str> {
    token
        .split(|c: char| {
            c.is_whitespace()
                || matches!(
                    c,
                    '=' | ':' | '/' | ',' | ';' | '\'' | '"' | '(' | ')' | '[' | ']' | '{' | '}'
                        | '<' | '>' | '|' | '&' | '`' | '$' | '~'
                )
        })
        .filter(|w| !w.is_empty())
}

/// Verb candidates: alphanumeric runs, so `set-password` yields `set` and
/// `password`.
fn verb_words(token: &str) -> impl Iterator<Item = &str> {
    token
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
}

fn classify_verb(word: &str) -> Option<VerbClass> {
    let word = word.to_ascii_lowercase();
    let word = word.as_str();
    if CREDENTIAL_VERBS.contains(&word) {
        Some(VerbClass::ChangeCredential)
    } else if PRIVILEGE_VERBS.contains(&word) {
        Some(VerbClass::ChangePrivilege)
    } else if DELETE_VERBS.contains(&word) {
        Some(VerbClass::Delete)
    } else if DISABLE_VERBS.contains(&word) {
        Some(VerbClass::Disable)
    } else if MODIFY_VERBS.contains(&word) {
        Some(VerbClass::Modify)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::normalize::normalize;

    fn guard(name: &str) -> RootGuard {
        RootGuard::new(ProtectedIdentity::new(name, &["root@pam".to_string()]))
    }

    fn assess(g: &RootGuard, cmd: &str) -> RootAssessment {
        g.assess(&normalize(cmd).unwrap())
    }

    #[test]
    fn test_alias_invariance() {
        let g = guard("root");
        let phrasings = [
            "passwd root",
            "usermod -L root",
            "userdel root",
            "deluser root",
            "chpasswd root",
            "pveum passwd root@pam",
            "pveum user modify root@pam --enable 0",
            "pveum user delete root@pam",
            "pveum acl modify / --users root@pam --roles NoAccess",
            "/usr/sbin/USERMOD --lock ROOT",
            "account set-password root --value X",
            "account reset-credentials --user=root",
            "chage -E 0 root",
            "pkill -u root",
            "gpasswd -d root wheel",
            "sudo passwd root",
            "cp key /root/.ssh/authorized_keys",
            "sh -c 'usermod -s /bin/false root'",
            "echo root | xargs userdel",
        ];
        for cmd in phrasings {
            let a = assess(&g, cmd);
            assert!(a.is_violation(), "not vetoed: {cmd} -> {a:?}");
        }
    }

    #[test]
    fn test_set_password_on_configured_identity() {
        let g = RootGuard::new(ProtectedIdentity::new("admin", &[]));
        let a = assess(&g, "account set-password admin --value X");
        assert!(a.is_violation());
        assert_eq!(a.verb_class, Some(VerbClass::ChangeCredential));

        // The same verb against a different account is mutating but allowed
        // through to classification.
        let a = assess(&g, "account set-password alice --value X");
        assert!(!a.is_violation());
        assert!(a.is_mutating());
    }

    #[test]
    fn test_most_specific_class_wins() {
        let g = guard("root");
        assert_eq!(
            assess(&g, "pveum user modify root@pam --password x").verb_class,
            Some(VerbClass::ChangeCredential)
        );
        assert_eq!(assess(&g, "userdel root").verb_class, Some(VerbClass::Delete));
        assert_eq!(assess(&g, "usermod -c x root").verb_class, Some(VerbClass::Modify));
    }

    #[test]
    fn test_read_only_commands_pass() {
        let g = guard("root");
        for cmd in ["id root", "getent passwd root", "groups root", "ls -la /root", "service status", "qm list"] {
            assert!(!assess(&g, cmd).is_violation(), "wrongly vetoed: {cmd}");
        }
        assert!(!assess(&g, "service status").is_mutating());
    }

    #[test]
    fn test_identity_matching_is_whole_word() {
        let g = guard("root");
        assert!(!assess(&g, "usermod -c x rootless").is_violation());
        assert!(!assess(&g, "userdel groot").is_violation());
    }

    #[test]
    fn test_api_assessment() {
        let g = guard("root");
        let a = g.assess_api(HttpMethod::Delete, "/access/users/root@pam", None);
        assert!(a.is_violation());
        assert_eq!(a.verb_class, Some(VerbClass::Delete));

        let a = g.assess_api(HttpMethod::Put, "/access/users/root@pam", None);
        assert_eq!(a.verb_class, Some(VerbClass::Modify));
        assert!(a.is_violation());

        let payload = serde_json::json!({ "userid": "root@pam", "password": "x" });
        let a = g.assess_api(HttpMethod::Put, "/access/password", Some(&payload));
        assert!(a.is_violation());
        assert_eq!(a.verb_class, Some(VerbClass::ChangeCredential));

        let a = g.assess_api(HttpMethod::Get, "/access/users/root@pam", None);
        assert!(!a.is_violation());

        let a = g.assess_api(HttpMethod::Post, "/nodes/pve/qemu/101/status/start", None);
        assert!(!a.is_violation());
        assert!(a.is_mutating());
    }
}
