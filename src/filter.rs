// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusion patterns for the scan.
//!
//! A pattern ending in `/` applies only to directories.  A
//! pattern containing a `/` elsewhere (or starting with one) is
//! matched against the whole sub-path, anchored at the disk
//! root; any other pattern is matched against the entry name
//! alone.  `*` matches any run of characters except `/` in name
//! patterns (any run at all in path patterns), `?` matches one.

/// A single exclusion.
#[derive(Clone, Debug)]
struct Pattern {
    glob: String,
    /// Match directories only.
    is_dir: bool,
    /// Match against the full sub-path rather than the name.
    is_path: bool,
}

/// An ordered set of exclusion patterns.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    patterns: Vec<Pattern>,
}

impl Filter {
    pub fn new(patterns: &[String]) -> Filter {
        let patterns = patterns
            .iter()
            .map(|p| {
                let mut glob = p.as_str();
                let is_dir = glob.ends_with('/');
                if is_dir {
                    glob = &glob[..glob.len() - 1];
                }
                let is_path = glob.contains('/');
                let glob = glob.strip_prefix('/').unwrap_or(glob).to_string();
                Pattern { glob, is_dir, is_path }
            })
            .collect();
        Filter { patterns }
    }

    /// Returns true if the entry is excluded.
    pub fn excluded(&self, sub: &str, is_dir: bool) -> bool {
        let name = sub.rsplit('/').next().unwrap_or(sub);
        self.patterns.iter().any(|p| {
            if p.is_dir && !is_dir {
                return false;
            }
            if p.is_path {
                glob_match(p.glob.as_bytes(), sub.as_bytes(), true)
            } else {
                glob_match(p.glob.as_bytes(), name.as_bytes(), false)
            }
        })
    }
}

/// Shell-style matcher.  `span_slash` lets `*` cross path
/// separators, which is wanted when matching whole sub-paths.
fn glob_match(pat: &[u8], s: &[u8], span_slash: bool) -> bool {
    match (pat.first(), s.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            if glob_match(&pat[1..], s, span_slash) {
                return true;
            }
            match s.first() {
                Some(&c) if span_slash || c != b'/' => {
                    glob_match(pat, &s[1..], span_slash)
                }
                _ => false,
            }
        }
        (Some(b'?'), Some(_)) => glob_match(&pat[1..], &s[1..], span_slash),
        (Some(&p), Some(&c)) if p == c => {
            glob_match(&pat[1..], &s[1..], span_slash)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(pats: &[&str]) -> Filter {
        let pats: Vec<String> = pats.iter().map(|s| s.to_string()).collect();
        Filter::new(&pats)
    }

    #[test]
    fn name_patterns() {
        let f = filter(&["*.tmp"]);
        assert!(f.excluded("a.tmp", false));
        assert!(f.excluded("sub/dir/b.tmp", false));
        assert!(!f.excluded("a.tmpx", false));
        assert!(!f.excluded("a.txt", false));
    }

    #[test]
    fn dir_only_patterns() {
        let f = filter(&["lost+found/"]);
        assert!(f.excluded("lost+found", true));
        assert!(!f.excluded("lost+found", false));
    }

    #[test]
    fn anchored_patterns() {
        let f = filter(&["/tmp/*"]);
        assert!(f.excluded("tmp/scratch", false));
        assert!(!f.excluded("data/tmp/scratch", false));
    }

    #[test]
    fn question_mark() {
        let f = filter(&["?.o"]);
        assert!(f.excluded("a.o", false));
        assert!(!f.excluded("ab.o", false));
    }

    #[test]
    fn empty_filter_excludes_nothing() {
        let f = Filter::default();
        assert!(!f.excluded("anything", false));
        assert!(!f.excluded("any/where", true));
    }
}
