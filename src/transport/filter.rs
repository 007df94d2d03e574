//! Include/exclude globs for file sync.
//!
//! Rules are checked in order and the first match decides; a path no rule
//! matches is included. Built-in excludes are checked before user rules.
//! Glob syntax: `*` and `?` stay within one path segment, `**` crosses
//! segments, a trailing `/` matches directories only, and a pattern without
//! a `/` matches the basename at any depth.

use regex::Regex;

use crate::error::{Result, StaxError};

/// Always excluded, in addition to user patterns.
pub const BUILTIN_EXCLUDES: &[&str] = &[
    ".git/",
    ".svn/",
    ".hg/",
    "node_modules/",
    "vendor/",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "*.log",
    "*.tmp",
    "uploads/cache/",
    "uploads/et-cache/",
    "uploads/wpo-cache/",
    "uploads/wp-rocket-cache/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
struct Rule {
    verdict: Verdict,
    glob: String,
    regex: Regex,
    dir_only: bool,
    basename: bool,
}

impl Rule {
    fn new(verdict: Verdict, glob: &str) -> Result<Self> {
        let trimmed = glob.trim();
        if trimmed.is_empty() {
            return Err(StaxError::invalid("empty filter pattern"));
        }
        let dir_only = trimmed.ends_with('/');
        let body = trimmed.trim_end_matches('/');
        let basename = !body.contains('/');
        let body = body.trim_start_matches('/');
        let regex = Regex::new(&format!("^{}$", glob_to_regex(body)))
            .map_err(|e| StaxError::invalid(format!("bad filter pattern '{}': {}", glob, e)))?;
        Ok(Self {
            verdict,
            glob: glob.to_string(),
            regex,
            dir_only,
            basename,
        })
    }

    fn matches(&self, path: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        let subject = if self.basename {
            path.rsplit('/').next().unwrap_or(path)
        } else {
            path
        };
        self.regex.is_match(subject)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::new();
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => match chars[i..].iter().position(|c| *c == ']') {
                Some(end) if end > 1 => {
                    let class: String = chars[i + 1..i + end].iter().collect();
                    let class = class.strip_prefix('!').map(|c| format!("^{}", c)).unwrap_or(class);
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i += end + 1;
                    continue;
                }
                _ => out.push_str("\\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out
}

/// Ordered rule list.
#[derive(Debug, Clone)]
pub struct FilterSet {
    rules: Vec<Rule>,
}

impl FilterSet {
    /// Built-in excludes, then user includes, then user excludes.
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        let mut rules = Vec::new();
        for glob in BUILTIN_EXCLUDES {
            rules.push(Rule::new(Verdict::Exclude, glob)?);
        }
        for glob in includes {
            rules.push(Rule::new(Verdict::Include, glob)?);
        }
        for glob in excludes {
            rules.push(Rule::new(Verdict::Exclude, glob)?);
        }
        Ok(Self { rules })
    }

    /// Verdict for one path, ignoring its ancestors.
    pub fn decide(&self, path: &str, is_dir: bool) -> Verdict {
        self.rules
            .iter()
            .find(|r| r.matches(path, is_dir))
            .map(|r| {
                tracing::trace!(path, rule = %r.glob, verdict = ?r.verdict, "filter match");
                r.verdict
            })
            .unwrap_or(Verdict::Include)
    }

    /// Whether a directory walk should enter `dir`. Only directory rules
    /// (trailing `/`) prune whole subtrees.
    pub fn descend(&self, dir: &str) -> bool {
        let dir = dir.trim_matches('/');
        self.rules
            .iter()
            .find(|r| r.dir_only && r.matches(dir, true))
            .is_none_or(|r| r.verdict == Verdict::Include)
    }

    /// Whether a relative path is transferred.
    pub fn allows(&self, path: &str, is_dir: bool) -> bool {
        let path = path.trim_matches('/');
        for (idx, _) in path.match_indices('/') {
            if !self.descend(&path[..idx]) {
                return false;
            }
        }
        self.decide(path, is_dir) == Verdict::Include
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(includes: &[&str], excludes: &[&str]) -> FilterSet {
        FilterSet::new(
            &includes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &excludes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn builtins_always_apply() {
        let f = set(&["*.log"], &[]);
        assert!(!f.allows("plugins/foo/.git/config", false));
        assert!(!f.allows("themes/t/node_modules/x/index.js", false));
        assert!(!f.allows("debug.log", false));
        assert!(!f.allows("uploads/cache/thumb.jpg", false));
        assert!(!f.allows("uploads/2024/.DS_Store", false));
        assert!(f.allows("uploads/2024/photo.jpg", false));
    }

    #[test]
    fn first_match_wins() {
        let f = set(&["uploads/keep/**"], &["uploads/**"]);
        assert!(f.allows("uploads/keep/a.png", false));
        assert!(!f.allows("uploads/drop/a.png", false));
        assert!(f.allows("plugins/a.php", false));
    }

    #[test]
    fn single_star_stays_in_segment() {
        let f = set(&[], &["uploads/*.zip"]);
        assert!(!f.allows("uploads/a.zip", false));
        assert!(f.allows("uploads/2024/a.zip", false));

        let g = set(&[], &["uploads/**/*.zip"]);
        assert!(!g.allows("uploads/a.zip", false));
        assert!(!g.allows("uploads/2024/01/a.zip", false));
    }

    #[test]
    fn trailing_slash_matches_directories_only() {
        let f = set(&[], &["backups/"]);
        assert!(!f.allows("backups", true));
        assert!(!f.allows("backups/db.sql", false));
        assert!(f.allows("plugins/backups", false));
        assert!(!f.allows("plugins/backups/x", false));
    }

    #[test]
    fn character_classes() {
        let f = set(&[], &["*.[ch]"]);
        assert!(!f.allows("src/a.c", false));
        assert!(f.allows("src/a.o", false));
    }
}
