//! Ignore policies consulted by the diff engine for untracked paths.

/// Decides whether an untracked path should be reported as ignored rather
/// than added. Paths are relative to the mount root, `/`-separated.
pub trait IgnorePolicy: Send + Sync {
    fn is_ignored(&self, path: &str, is_dir: bool) -> bool;
}

/// Ignores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnore;

impl IgnorePolicy for NoIgnore {
    fn is_ignored(&self, _path: &str, _is_dir: bool) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: String,
    negated: bool,
    dir_only: bool,
    /// Contains a `/` before any trailing one; matched against the whole
    /// path instead of the basename.
    anchored: bool,
}

impl IgnoreRule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, rest) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, rest) = match rest.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let anchored = rest.contains('/');
        let pattern = rest.strip_prefix('/').unwrap_or(rest);
        if pattern.is_empty() {
            return None;
        }

        Some(Self {
            pattern: pattern.to_string(),
            negated,
            dir_only,
            anchored,
        })
    }

    fn matches(&self, path: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            return glob_match(&self.pattern, path);
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        glob_match(&self.pattern, name)
    }
}

/// Gitignore-style rules: `*`, `?` and `[...]` wildcards, trailing `/` for
/// directories only, leading `!` to re-include. The last matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct GlobIgnore {
    rules: Vec<IgnoreRule>,
}

impl GlobIgnore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ignore = Self::new();
        for p in patterns {
            ignore.add_rule(p.as_ref());
        }
        ignore
    }

    pub fn add_rule(&mut self, pattern: &str) {
        if let Some(rule) = IgnoreRule::parse(pattern) {
            self.rules.push(rule);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl IgnorePolicy for GlobIgnore {
    fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(path, is_dir))
            .is_some_and(|rule| !rule.negated)
    }
}

/// Match `input` against a shell-style glob. `*` does not cross `/`.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = input.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Last `*` seen and the input position it is currently standing in for.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pat.len() {
            match pat[p] {
                '*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' if text[t] != '/' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&pat, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    } else if text[t] == '[' {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) if text[st] != '/' => {
                star = Some((sp, st + 1));
                p = sp + 1;
                t = st + 1;
            }
            _ => return false,
        }
    }

    pat[p..].iter().all(|&c| c == '*')
}

/// Evaluate a `[...]` class starting at `pat[start]`. Returns whether `c`
/// matched and the index just past the class, or `None` when the class is
/// unterminated.
fn match_class(pat: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negated = matches!(pat.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < pat.len() {
        if pat[i] == ']' && !first {
            return Some((matched != negated && c != '/', i + 1));
        }
        first = false;
        if i + 2 < pat.len() && pat[i + 1] == '-' && pat[i + 2] != ']' {
            if pat[i] <= c && c <= pat[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pat[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
