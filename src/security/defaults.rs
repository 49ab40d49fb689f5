//! Built-in rule table used when configuration does not supply one.

use super::rules::{PatternKind, RuleSpec};

/// Start of a simple command inside the canonical text.
const SEGMENT_START: &str = r"(^|[;&|]\s*)(sudo\s+|doas\s+)?";

pub fn default_rules() -> Vec<RuleSpec> {
    let mut rules = deny_rules();
    rules.extend(allow_rules());
    rules
}

fn deny_rules() -> Vec<RuleSpec> {
    use PatternKind::{Glob, Regex};

    vec![
        RuleSpec::deny(
            "deny.rm-root",
            Regex,
            r"\brm\s+(\S+\s+)*(/|/\*|~|--no-preserve-root)(\s|$)",
            "recursive removal of the filesystem root",
        ),
        RuleSpec::deny(
            "deny.dd-device",
            Regex,
            r"\bdd\b.*\b(if=/dev/(zero|random|urandom)|of=/dev/)",
            "raw device overwrite",
        ),
        RuleSpec::deny(
            "deny.mkfs",
            Regex,
            r"\b(mkfs(\.[a-z0-9]+)?|mke2fs|wipefs)\b",
            "filesystem creation destroys existing data",
        ),
        RuleSpec::deny(
            "deny.fork-bomb",
            Regex,
            r":\s*\(\s*\)\s*\{",
            "fork bomb",
        ),
        RuleSpec::deny(
            "deny.partition",
            Regex,
            &format!(r"{SEGMENT_START}(fdisk|sfdisk|sgdisk|parted|gdisk)\b"),
            "disk partitioning",
        ),
        RuleSpec::deny(
            "deny.package-install",
            Regex,
            &format!(
                r"{SEGMENT_START}(pkg|apt|apt-get|aptitude|yum|dnf|zypper|apk|pacman|rpm|dpkg|pip3?|npm)\s+(install|add|-i|-s|-u)\b"
            ),
            "package installation is not permitted through the gateway",
        ),
        RuleSpec::deny(
            "deny.interpreter",
            Regex,
            &format!(
                r"{SEGMENT_START}(sh|bash|zsh|dash|ksh|fish|csh|tcsh|python[0-9.]*|perl|ruby|node|php|lua|eval|exec|source|xargs|busybox)(\s|$)"
            ),
            "nested interpreters bypass command classification",
        ),
        RuleSpec::deny("deny.shutdown", Glob, "shutdown ...", "host power state change"),
        RuleSpec::deny("deny.reboot", Glob, "reboot ...", "host power state change"),
        RuleSpec::deny("deny.poweroff", Glob, "poweroff ...", "host power state change"),
        RuleSpec::deny("deny.halt", Glob, "halt ...", "host power state change"),
        RuleSpec::deny(
            "deny.systemctl-power",
            Regex,
            &format!(r"{SEGMENT_START}systemctl\s+(reboot|poweroff|halt|kexec|emergency|rescue)\b"),
            "host power state change",
        ),
        RuleSpec::deny(
            "deny.cluster-membership",
            Regex,
            &format!(r"{SEGMENT_START}pvecm\s+(add|delnode|expected)\b"),
            "cluster membership change",
        ),
        RuleSpec::deny(
            "deny.firewall-flush",
            Regex,
            &format!(r"{SEGMENT_START}(iptables|ip6tables|nft)\s+(-f|--flush|flush)\b"),
            "firewall flush",
        ),
        RuleSpec::deny(
            "deny.guest-destroy",
            Regex,
            &format!(r"{SEGMENT_START}(qm|pct)\s+(destroy|unlink)\b"),
            "guest destruction",
        ),
    ]
}

fn allow_rules() -> Vec<RuleSpec> {
    const READ: bool = false;
    const WRITE: bool = true;

    let entries: &[(&str, &str, bool, &str)] = &[
        ("allow.service-status", "service status", READ, "service overview"),
        ("allow.service-unit-status", "service * status", READ, "service status"),
        ("allow.systemctl-status", "systemctl status *", READ, "unit status"),
        ("allow.uptime", "uptime", READ, "host uptime"),
        ("allow.hostname", "hostname", READ, "host name"),
        ("allow.uname", "uname", READ, "kernel info"),
        ("allow.uname-all", "uname -a", READ, "kernel info"),
        ("allow.whoami", "whoami", READ, "current user"),
        ("allow.date", "date", READ, "host clock"),
        ("allow.df", "df -h", READ, "disk usage"),
        ("allow.free", "free -m", READ, "memory usage"),
        ("allow.free-h", "free -h", READ, "memory usage"),
        ("allow.ip-addr", "ip addr", READ, "network addresses"),
        ("allow.ip-brief", "ip -br addr", READ, "network addresses"),
        ("allow.pveversion", "pveversion", READ, "platform version"),
        ("allow.pveversion-verbose", "pveversion -v", READ, "platform version"),
        ("allow.qm-list", "qm list", READ, "guest inventory"),
        ("allow.qm-status", "qm status *", READ, "guest status"),
        ("allow.qm-config", "qm config *", READ, "guest configuration"),
        ("allow.pct-list", "pct list", READ, "container inventory"),
        ("allow.pct-status", "pct status *", READ, "container status"),
        ("allow.pvesm-status", "pvesm status", READ, "storage status"),
        ("allow.pvecm-status", "pvecm status", READ, "cluster status"),
        ("allow.zpool-status", "zpool status", READ, "pool health"),
        ("allow.zfs-list", "zfs list", READ, "datasets"),
        ("allow.journal-tail", "journalctl -n *", READ, "recent journal"),
        ("allow.qm-start", "qm start *", WRITE, "guest lifecycle"),
        ("allow.qm-stop", "qm stop *", WRITE, "guest lifecycle"),
        ("allow.qm-shutdown", "qm shutdown *", WRITE, "guest lifecycle"),
        ("allow.qm-reboot", "qm reboot *", WRITE, "guest lifecycle"),
        ("allow.qm-suspend", "qm suspend *", WRITE, "guest lifecycle"),
        ("allow.qm-resume", "qm resume *", WRITE, "guest lifecycle"),
        ("allow.pct-start", "pct start *", WRITE, "container lifecycle"),
        ("allow.pct-stop", "pct stop *", WRITE, "container lifecycle"),
        ("allow.systemctl-restart", "systemctl restart *", WRITE, "service restart"),
        ("allow.service-restart", "service * restart", WRITE, "service restart"),
        ("allow.pveum-passwd", "pveum passwd *", WRITE, "user password change"),
        ("allow.pveum-user-modify", "pveum user modify * *", WRITE, "user account change"),
        ("allow.api-read", "api get /**", READ, "management API read"),
        ("allow.api-vm-status", "api post /nodes/*/qemu/*/status/*", WRITE, "guest lifecycle"),
        ("allow.api-ct-status", "api post /nodes/*/lxc/*/status/*", WRITE, "container lifecycle"),
        ("allow.mode-toggle", "gateway mode *", READ, "operating mode toggle"),
    ];

    entries
        .iter()
        .map(|(id, pattern, mutating, rationale)| RuleSpec::allow(id, pattern, *mutating, rationale))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::normalize::normalize;
    use crate::security::rules::RuleTable;

    #[test]
    fn test_default_rules_compile() {
        let table = RuleTable::from_specs(&default_rules()).unwrap();
        assert_eq!(table.len(), default_rules().len());
    }

    #[test]
    fn test_legacy_dangerous_commands_denied() {
        let table = RuleTable::from_specs(&default_rules()).unwrap();
        for cmd in [
            "rm -rf /",
            "rm -rf /*",
            "rm -r -f /",
            "RM -RF /",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sdb1",
            ":(){ :|:& };:",
        ] {
            let normalized = normalize(cmd).unwrap();
            assert!(table.first_deny(&normalized).is_some(), "not denied: {cmd}");
        }
    }

    #[test]
    fn test_package_install_denied() {
        let table = RuleTable::from_specs(&default_rules()).unwrap();
        let rule = table.first_deny(&normalize("pkg install foo").unwrap()).unwrap();
        assert_eq!(rule.id, "deny.package-install");
        assert!(table.first_deny(&normalize("sudo apt-get install curl").unwrap()).is_some());
    }

    #[test]
    fn test_vm_shutdown_action_not_caught_by_host_power_rules() {
        let table = RuleTable::from_specs(&default_rules()).unwrap();
        let cmd = normalize("api post /nodes/pve/qemu/101/status/shutdown").unwrap();
        assert!(table.first_deny(&cmd).is_none());
        let cmd = normalize("qm shutdown 101").unwrap();
        assert!(table.first_deny(&cmd).is_none());
    }

    #[test]
    fn test_rm_of_ordinary_path_not_root_rule() {
        let table = RuleTable::from_specs(&default_rules()).unwrap();
        let cmd = normalize("rm -rf /var/tmp/build").unwrap();
        assert!(table.first_deny(&cmd).is_none());
    }
}
