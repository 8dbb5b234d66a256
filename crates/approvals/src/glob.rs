//! Allowlist glob matching (spec §3, §4.D, §8).
//!
//! `**` matches any characters including path separators; `*` matches
//! anything except `/`; `?` matches exactly one character. Patterns
//! containing a `/` match the resolved absolute path; otherwise they
//! match the executable basename. Matching is case-insensitive.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub pattern: String,
    #[serde(default)]
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_used_command: Option<String>,
    #[serde(default)]
    pub last_resolved_path: Option<String>,
}

impl AllowlistEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            last_used_at: None,
            last_used_command: None,
            last_resolved_path: None,
        }
    }
}

/// The facts a single exec request resolves to, used for allowlist
/// matching.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub raw_executable: String,
    pub resolved_path: Option<String>,
    pub executable_name: String,
}

/// Glob-match one pattern against one resolution target. The target is
/// the resolved absolute path when the pattern contains a `/`, otherwise
/// the executable basename.
pub fn glob_matches_resolution(pattern: &str, resolution: &Resolution) -> bool {
    let target = if pattern.contains('/') {
        match &resolution.resolved_path {
            Some(p) => p.as_str(),
            None => return false,
        }
    } else {
        resolution.executable_name.as_str()
    };
    glob_match(&pattern.to_lowercase(), &target.to_lowercase())
}

/// Iterate entries in order; the first pattern that matches wins (spec
/// §4.D `matchAllowlist`).
pub fn match_allowlist<'a>(
    entries: &'a [AllowlistEntry],
    resolution: &Resolution,
) -> Option<&'a AllowlistEntry> {
    entries
        .iter()
        .find(|e| glob_matches_resolution(&e.pattern, resolution))
}

/// Core glob matcher: `**` crosses `/`, `*` does not, `?` matches one
/// char. Implemented as a small recursive matcher over pattern/text
/// bytes (patterns here are short, so this is not performance-critical).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_from(&p, 0, &t, 0)
}

fn match_from(p: &[char], pi: usize, t: &[char], ti: usize) -> bool {
    if pi == p.len() {
        return ti == t.len();
    }

    // Detect "**" (may be followed by more pattern).
    if p[pi] == '*' && pi + 1 < p.len() && p[pi + 1] == '*' {
        let mut next = pi + 2;
        // Collapse consecutive '*' runs.
        while next < p.len() && p[next] == '*' {
            next += 1;
        }
        for split in ti..=t.len() {
            if match_from(p, next, t, split) {
                return true;
            }
        }
        return false;
    }

    match p[pi] {
        '*' => {
            for split in ti..=t.len() {
                if t[ti..split].iter().all(|c| *c != '/') && match_from(p, pi + 1, t, split) {
                    return true;
                }
            }
            false
        }
        '?' => ti < t.len() && t[ti] != '/' && match_from(p, pi + 1, t, ti + 1),
        c => ti < t.len() && t[ti] == c && match_from(p, pi + 1, t, ti + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(raw: &str, resolved: &str, name: &str) -> Resolution {
        Resolution {
            raw_executable: raw.into(),
            resolved_path: Some(resolved.into()),
            executable_name: name.into(),
        }
    }

    #[test]
    fn exact_basename_match() {
        let r = res("rg", "/opt/homebrew/bin/rg", "rg");
        assert!(glob_matches_resolution("RG", &r));
    }

    #[test]
    fn single_star_does_not_cross_slash() {
        let r = res("rg", "/opt/homebrew/bin/rg", "rg");
        assert!(!glob_matches_resolution("/opt/*/rg", &r));
    }

    #[test]
    fn double_star_crosses_slash() {
        let r = res("rg", "/opt/homebrew/bin/rg", "rg");
        assert!(glob_matches_resolution("/opt/**/rg", &r));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(glob_match("r?", "rg"));
        assert!(!glob_match("r?", "rng"));
    }

    #[test]
    fn idempotent_and_case_insensitive() {
        let r = res("rg", "/opt/homebrew/bin/rg", "rg");
        let first = glob_matches_resolution("RG", &r);
        let second = glob_matches_resolution("RG", &r);
        assert_eq!(first, second);
        assert!(first);
    }

    #[test]
    fn match_allowlist_first_match_wins() {
        let entries = vec![
            AllowlistEntry::new("/usr/bin/false"),
            AllowlistEntry::new("rg"),
        ];
        let r = res("rg", "/opt/homebrew/bin/rg", "rg");
        let m = match_allowlist(&entries, &r).unwrap();
        assert_eq!(m.pattern, "rg");
    }

    #[test]
    fn no_slash_pattern_ignores_resolved_path() {
        let r = Resolution {
            raw_executable: "rg".into(),
            resolved_path: None,
            executable_name: "rg".into(),
        };
        assert!(glob_matches_resolution("rg", &r));
    }
}
