//! Include/exclude selection of archive entries by name.

use std::path::Path;

/// Selects entries by name.
///
/// Include patterns without wildcards match either the full entry name or
/// its final component; with `*`/`?` they are matched as globs against
/// the full name. An empty include list selects everything. Exclude
/// patterns match as a substring or as a glob and always win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// Patterns an entry must match (any of)
    pub include: Vec<String>,
    /// Patterns that remove an entry
    pub exclude: Vec<String>,
}

impl EntryFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Returns true if the entry called `name` is selected.
    pub fn matches(&self, name: &str) -> bool {
        if !self.include.is_empty() {
            let included = self.include.iter().any(|f| {
                if has_glob_chars(f) {
                    glob_match(f, name)
                } else {
                    let basename = Path::new(name)
                        .file_name()
                        .map(|s| s.to_string_lossy())
                        .unwrap_or_default();
                    name == f.as_str() || basename == f.as_str()
                }
            });
            if !included {
                return false;
            }
        }

        !self
            .exclude
            .iter()
            .any(|x| name.contains(x.as_str()) || glob_match(x, name))
    }
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Match `text` against a pattern of literals, `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative matcher with single-star backtracking
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
