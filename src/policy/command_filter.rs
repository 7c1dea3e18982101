//! Command Filter: deny-on-match classification of shell command strings.
//!
//! This is a best-effort filter, not a sandbox. It never parses shell
//! grammar; it matches case-insensitive regexes against two views of the
//! command: the raw text with whitespace collapsed, and a normalized form
//! with quotes and backslashes removed, so `r''m  -"rf" /` is still seen as
//! `rm -rf /`. The rule tables are data and can be extended from config.

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::config::SecurityLevel;
use crate::error::SandboxError;

/// One deny rule: a regex and a short human-readable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DenyRule {
    pub pattern: String,
    pub description: String,
}

impl DenyRule {
    pub fn new(pattern: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            description: description.into(),
        }
    }
}

// ── Rule tables ──────────────────────────────────────────

/// Applied at every security level.
const STANDARD_RULES: &[(&str, &str)] = &[
    // rm flags anywhere in the same command, bundled or split, either order
    (r"\brm\b[^;&|\n]*\s-(?:[a-z]*r[a-z]*f|[a-z]*f[a-z]*r)[a-z]*\b", "recursive forced delete"),
    (r"\brm\b[^;&|\n]*\s(?:-[a-z]*r[a-z]*|--recursive)\b[^;&|\n]*\s(?:-[a-z]*f[a-z]*|--force)\b", "recursive forced delete"),
    (r"\brm\b[^;&|\n]*\s(?:-[a-z]*f[a-z]*|--force)\b[^;&|\n]*\s(?:-[a-z]*r[a-z]*|--recursive)\b", "recursive forced delete"),
    (r"\brm\s+(?:-\S+\s+)*(?:/|/\*|~|~/|\$home)(?:\s|$)", "delete of root or home"),
    (r"\bsudo\b", "privilege escalation"),
    (r"\bdoas\b", "privilege escalation"),
    (r"(?:^|[;&|]\s*)su(?:\s|$)", "privilege escalation"),
    (r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:\s*&[^}]*\}\s*;\s*:", "fork bomb"),
    (r"\bdd\b[^|;&]*\bof=/dev/", "raw device write"),
    (r">\s*/dev/(?:sd|hd|nvme|xvd|vd|disk|mmcblk)", "raw device write"),
    (r"\bmkfs(?:\.\w+)?\b", "filesystem formatting"),
    (r"\b(?:fdisk|parted|wipefs)\b", "partition tooling"),
    (r"\b(?:shutdown|reboot|halt|poweroff)\b", "power control"),
    (r"\binit\s+[06]\b", "power control"),
    (r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b", "download piped to shell"),
    (r"\b(?:nc|ncat|netcat)\b.*\s-(?:e|c)\s", "reverse shell"),
    (r"/dev/tcp/", "raw network socket"),
    (r">>?\s*/etc/", "write to system configuration"),
    (r"\bchmod\s+(?:-\S+\s+)*[0-7]?777\s+/(?:\s|$)", "world-writable root"),
    (r"\bchown\s+(?:-\S+\s+)*\S+\s+/(?:\s|$)", "ownership change of root"),
    (r"\bkill\s+-9\s+-1\b", "kill every process"),
    (r"\bhistory\s+-c\b", "audit trail tampering"),
];

/// Added at `high`: no network egress, no shell escapes, no installs.
const HIGH_RULES: &[(&str, &str)] = &[
    (r"\b(?:curl|wget|nc|ncat|netcat|ssh|scp|sftp|rsync|ftp|telnet)\b", "network egress"),
    (r"\$\(", "command substitution"),
    (r"`", "command substitution"),
    (r"\beval\b", "dynamic evaluation"),
    (r"\b(?:python3?|perl|ruby|node)\s+(?:-\S+\s+)*-(?:c|e)\b", "inline interpreter"),
    (r"\b(?:ba|z|da|k)?sh\s+-c\b", "nested shell"),
    (r"\b(?:pip3?|uv\s+pip|conda|apt|apt-get|yum|dnf|brew|npm|yarn)\s+install\b", "package installation"),
    (r"\b(?:kill|pkill|killall)\b", "process signalling"),
    (r"\bcrontab\b", "scheduled execution"),
];

#[derive(Debug, Clone)]
pub struct CommandFilter {
    rules: Vec<(DenyRule, Regex)>,
}

impl CommandFilter {
    /// Builds a filter from explicit rules; fails on an invalid regex.
    pub fn new(rules: Vec<DenyRule>) -> Result<Self, regex::Error> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let re = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()?;
                Ok((rule, re))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules: compiled })
    }

    /// Built-in rule table for a security level.
    pub fn builtin_rules(level: SecurityLevel) -> Vec<DenyRule> {
        let mut rules: Vec<DenyRule> = STANDARD_RULES
            .iter()
            .map(|(p, d)| DenyRule::new(*p, *d))
            .collect();
        if level == SecurityLevel::High {
            rules.extend(HIGH_RULES.iter().map(|(p, d)| DenyRule::new(*p, *d)));
        }
        rules
    }

    /// Built-in table plus extra patterns from config. Invalid extra
    /// patterns are logged and skipped rather than disabling the filter.
    pub fn for_level(level: SecurityLevel, extra_patterns: &[String]) -> Self {
        let mut rules = Self::builtin_rules(level);
        for pattern in extra_patterns {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(_) => rules.push(DenyRule::new(pattern.clone(), "configured pattern")),
                Err(e) => warn!("Ignoring invalid blocked pattern '{pattern}': {e}"),
            }
        }
        Self::new(rules).unwrap_or_else(|e| {
            warn!("Command filter rules failed to compile: {e}");
            Self { rules: Vec::new() }
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Allows the command or reports the first matching deny rule.
    pub fn check(&self, command: &str) -> Result<(), SandboxError> {
        let raw = collapse_whitespace(command);
        let normalized = normalize(command);
        for (rule, re) in &self.rules {
            if re.is_match(&raw) || re.is_match(&normalized) {
                warn!("Command blocked ({}): {}", rule.description, raw);
                return Err(SandboxError::SecurityViolation {
                    pattern: rule.pattern.clone(),
                    description: rule.description.clone(),
                    command: command.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn collapse_whitespace(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops quoting characters and line continuations, collapses whitespace.
fn normalize(command: &str) -> String {
    let unquoted: String = command
        .replace("\\\n", " ")
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '\\'))
        .collect();
    collapse_whitespace(&unquoted)
}
