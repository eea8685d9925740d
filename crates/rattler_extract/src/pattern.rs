//! Inclusion pattern matching for archive entries.
//!
//! A [`PatternMatcher`] decides which entries of an archive are extracted. With no patterns
//! configured every entry is included. Otherwise an entry is included when its path matches at
//! least one pattern, either as a whole or through one of its leading directories, so a pattern
//! `docs` also includes `docs/guide/index.md`.
//!
//! Every pattern remembers whether it has matched an entry yet. Once all of them have,
//! [`PatternMatcher::all_satisfied`] returns true and a fast-read scan can stop early.

use glob::{MatchOptions, Pattern};

use crate::error::{ExtractError, Result};

/// A single inclusion pattern together with its match count.
#[derive(Debug)]
struct IncludePattern {
    source: String,
    glob: Pattern,
    matches: usize,
}

impl IncludePattern {
    fn matches(&self, path: &str) -> bool {
        let options = MatchOptions::new();
        if self.glob.matches_with(path, options) {
            return true;
        }

        // Try every leading directory of the path as well.
        path.match_indices('/')
            .map(|(idx, _)| &path[..idx])
            .filter(|prefix| !prefix.is_empty())
            .any(|prefix| self.glob.matches_with(prefix, options))
    }
}

/// Matches archive entry paths against an ordered set of inclusion patterns.
#[derive(Debug, Default)]
pub struct PatternMatcher {
    patterns: Vec<IncludePattern>,
}

impl PatternMatcher {
    /// Compiles the given inclusion patterns.
    ///
    /// Fails with [`ExtractError::Pattern`] naming the first pattern that is not a valid glob.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let source = pattern.as_ref();
                let normalized = normalize(source);
                if normalized.is_empty() {
                    return Err(ExtractError::pattern(source, "empty pattern"));
                }
                let glob = Pattern::new(normalized)
                    .map_err(|err| ExtractError::pattern(source, err))?;
                Ok(IncludePattern {
                    source: source.to_string(),
                    glob,
                    matches: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// Returns true if no inclusion patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the number of configured inclusion patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if the entry at `path` must not be extracted.
    ///
    /// The first pattern that matches records the match. Patterns that have not matched anything
    /// yet are tried before the ones that already have.
    pub fn excluded(&mut self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let path = normalize(path);

        let hit = self
            .patterns
            .iter()
            .position(|p| p.matches == 0 && p.matches(path))
            .or_else(|| {
                self.patterns
                    .iter()
                    .position(|p| p.matches > 0 && p.matches(path))
            });

        match hit {
            Some(idx) => {
                self.patterns[idx].matches += 1;
                false
            }
            None => true,
        }
    }

    /// Returns true once every configured pattern has matched at least one entry.
    ///
    /// Always false when no patterns are configured, there is nothing to wait for and a scan
    /// must not stop because of it.
    pub fn all_satisfied(&self) -> bool {
        !self.patterns.is_empty() && self.patterns.iter().all(|p| p.matches > 0)
    }

    /// Returns the patterns that have not matched any entry, in insertion order.
    pub fn unmatched(&self) -> impl Iterator<Item = &str> {
        self.patterns
            .iter()
            .filter(|p| p.matches == 0)
            .map(|p| p.source.as_str())
    }
}

/// Strips leading `/` and `./` components and trailing slashes.
fn normalize(path: &str) -> &str {
    let mut path = path;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            return path.trim_end_matches('/');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_empty_set_excludes_nothing() {
        let mut matcher = PatternMatcher::new(Vec::<String>::new()).unwrap();
        assert!(!matcher.excluded("a.txt"));
        assert!(!matcher.excluded("deep/nested/file"));
        assert!(!matcher.all_satisfied());
    }

    #[test]
    fn test_glob_inclusion() {
        let mut matcher = PatternMatcher::new(["*.raw"]).unwrap();
        assert!(!matcher.excluded("a.raw"));
        assert!(matcher.excluded("c.txt"));
        // `*` crosses directory separators
        assert!(!matcher.excluded("images/disk.raw"));
    }

    #[test]
    fn test_directory_prefix_match() {
        let mut matcher = PatternMatcher::new(["docs"]).unwrap();
        assert!(!matcher.excluded("docs/"));
        assert!(!matcher.excluded("docs/guide/index.md"));
        assert!(matcher.excluded("docs-old/index.md"));
        assert!(matcher.excluded("src/docs.rs"));
    }

    #[test]
    fn test_trailing_slash_on_pattern() {
        let mut matcher = PatternMatcher::new(["docs/"]).unwrap();
        assert!(!matcher.excluded("docs/"));
        assert!(!matcher.excluded("docs/guide/index.md"));
        assert!(matcher.excluded("src/main.rs"));
        assert!(matcher.all_satisfied());

        assert!(matches!(
            PatternMatcher::new(["/"]),
            Err(ExtractError::Pattern { .. })
        ));
    }

    #[test]
    fn test_leading_dot_slash_is_ignored() {
        let mut matcher = PatternMatcher::new(["./etc/hosts"]).unwrap();
        assert!(!matcher.excluded("etc/hosts"));

        let mut matcher = PatternMatcher::new(["etc/hosts"]).unwrap();
        assert!(!matcher.excluded("./etc/hosts"));
        assert!(!matcher.excluded("/etc/hosts"));
    }

    #[test]
    fn test_all_satisfied_tracks_each_pattern() {
        let mut matcher = PatternMatcher::new(["a.raw", "b.raw"]).unwrap();
        assert!(!matcher.all_satisfied());

        assert!(!matcher.excluded("a.raw"));
        assert!(!matcher.all_satisfied());
        assert_eq!(matcher.unmatched().collect::<Vec<_>>(), vec!["b.raw"]);

        assert!(matcher.excluded("c.txt"));
        assert!(!matcher.all_satisfied());

        assert!(!matcher.excluded("b.raw"));
        assert!(matcher.all_satisfied());
        assert_eq!(matcher.unmatched().count(), 0);
    }

    #[test]
    fn test_unmatched_patterns_are_preferred() {
        // Both patterns match `x.raw`; the second one must still be credited when the first has
        // already matched.
        let mut matcher = PatternMatcher::new(["*.raw", "x*"]).unwrap();
        assert!(!matcher.excluded("a.raw"));
        assert!(!matcher.excluded("x.raw"));
        assert!(matcher.all_satisfied());
    }

    #[test]
    fn test_malformed_pattern() {
        let err = PatternMatcher::new(["ok", "[unclosed"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        match err {
            ExtractError::Pattern { pattern, .. } => assert_eq!(pattern, "[unclosed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_pattern_is_rejected() {
        assert!(matches!(
            PatternMatcher::new([""]),
            Err(ExtractError::Pattern { .. })
        ));
    }
}
