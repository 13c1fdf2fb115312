//! Input validation for everything that ends up in a git or docker argv.
//!
//! Agent names are the canonical identifier: branch names, worktree paths,
//! and container names are all derived from them. The single regex here is
//! the only gate between operator input and subprocess arguments, so no
//! name may reach a `Command` without passing through it. Commands are
//! always built from explicit argument arrays, never shell strings.

use crate::constants::{AGENT_NAME_MAX_LEN, AGENT_NAME_PATTERN};
use crate::{Result, TanukiError};
use regex::Regex;
use std::sync::OnceLock;

fn agent_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(AGENT_NAME_PATTERN).expect("agent name pattern is valid"))
}

/// Validate an agent name against the canonical pattern.
///
/// Names are lowercase alphanumeric plus hyphens, 2-63 characters,
/// starting with a letter and ending with an alphanumeric.
pub fn validate_agent_name(name: &str) -> Result<()> {
    if agent_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(TanukiError::invalid(
            "agent name",
            format!(
                "{name:?} must be 2-63 lowercase alphanumeric/hyphen characters, \
                 start with a letter, and end with an alphanumeric"
            ),
        ))
    }
}

/// Validate a git branch name supplied by the operator.
///
/// Deliberately narrower than what git accepts: path-ish segments of
/// alphanumerics, `.`, `_`, and `-`, separated by `/`, never starting
/// with a hyphen or dot.
pub fn validate_branch_name(branch: &str) -> Result<()> {
    let well_formed = !branch.is_empty()
        && branch.split('/').all(|segment| {
            !segment.is_empty()
                && !segment.starts_with('-')
                && !segment.starts_with('.')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if well_formed {
        Ok(())
    } else {
        Err(TanukiError::invalid(
            "branch name",
            format!("{branch:?} contains disallowed characters"),
        ))
    }
}

/// Derive a valid agent name from free-form project and workstream labels.
///
/// Lowercases, maps every disallowed character to a hyphen, collapses runs,
/// and trims so the result always passes [`validate_agent_name`].
pub fn derive_agent_name(project: &str, workstream: &str) -> String {
    let raw = if project.is_empty() {
        workstream.to_string()
    } else {
        format!("{project}-{workstream}")
    };

    let mut out = String::with_capacity(raw.len());
    let mut last_hyphen = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_hyphen = false;
        } else if !last_hyphen && !out.is_empty() {
            out.push('-');
            last_hyphen = true;
        }
    }

    // Must start with a letter and end with an alphanumeric.
    while out
        .chars()
        .next()
        .is_some_and(|c| !c.is_ascii_lowercase())
    {
        out.remove(0);
    }
    out.truncate(AGENT_NAME_MAX_LEN);
    while out
        .chars()
        .last()
        .is_some_and(|c| !c.is_ascii_alphanumeric())
    {
        out.pop();
    }

    if out.len() < 2 {
        out = format!("ws-{out}");
        out.truncate(AGENT_NAME_MAX_LEN);
        while out
            .chars()
            .last()
            .is_some_and(|c| !c.is_ascii_alphanumeric())
        {
            out.pop();
        }
    }

    out
}
