//! Domain exclusion filter: hosts matching any configured shell-glob
//! pattern bypass the tunnel and get a direct connection instead.

use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<Regex>,
}

impl ExclusionFilter {
    pub fn compile(globs: &[String]) -> Result<Self, (String, regex::Error)> {
        let mut patterns = Vec::with_capacity(globs.len());
        for glob in globs {
            let regex = Regex::new(&glob_to_regex(glob)).map_err(|e| (glob.clone(), e))?;
            patterns.push(regex);
        }
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(host))
    }
}

/// Translates a shell-style glob (`*`, `?`, and literal characters) into
/// an anchored regex. `*` matches any run of characters including none;
/// `?` matches exactly one character.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_suffix_matches_subdomains() {
        let filter = ExclusionFilter::compile(&["*.internal.example".to_string()]).unwrap();
        assert!(filter.is_excluded("api.internal.example"));
        assert!(!filter.is_excluded("internal.example"));
        assert!(!filter.is_excluded("other.example"));
    }

    #[test]
    fn exact_host_matches_only_itself() {
        let filter = ExclusionFilter::compile(&["example.com".to_string()]).unwrap();
        assert!(filter.is_excluded("example.com"));
        assert!(!filter.is_excluded("sub.example.com"));
    }

    #[test]
    fn empty_filter_excludes_nothing() {
        let filter = ExclusionFilter::default();
        assert!(!filter.is_excluded("anything.example"));
    }

    #[test]
    fn literal_dot_does_not_act_as_a_wildcard() {
        let filter = ExclusionFilter::compile(&["a.b.example".to_string()]).unwrap();
        assert!(filter.is_excluded("a.b.example"));
        assert!(!filter.is_excluded("aXb.example"));
    }
}
