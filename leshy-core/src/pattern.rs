// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Precompiled name patterns used by zone matching.

use serde::Deserialize;

/// A single lowercased domain label.
pub type Label = Box<str>;

/// A compiled match pattern. Built once from a configured string so that
/// matching a query name never touches string parsing again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches the name itself, or any name ending in `.<labels>`.
    Suffix(Vec<Label>),
    /// Matches if the label appears anywhere among the name's labels.
    Bare(Label),
    /// Matches any name strictly under `<labels>` (excludes the bare suffix).
    Wildcard(Vec<Label>),
}

impl Pattern {
    /// Compile a configured pattern string per the grammar: `*.suffix` is a
    /// wildcard, a single dotless label is a bare-label match, anything else
    /// is a label-aligned suffix match.
    pub fn compile(raw: &str) -> Self {
        let raw = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if let Some(suffix) = raw.strip_prefix("*.") {
            Pattern::Wildcard(split_labels(suffix))
        } else if !raw.is_empty() && !raw.contains('.') {
            Pattern::Bare(raw.into_boxed_str())
        } else {
            Pattern::Suffix(split_labels(&raw))
        }
    }

    /// Test a pre-split, already-lowercased label sequence against this
    /// pattern.
    pub fn matches(&self, name_labels: &[Label]) -> bool {
        match self {
            Pattern::Suffix(pat) => ends_with_labels(name_labels, pat),
            Pattern::Bare(label) => name_labels.iter().any(|l| l == label),
            Pattern::Wildcard(pat) => {
                name_labels.len() > pat.len() && ends_with_labels(name_labels, pat)
            }
        }
    }
}

/// Deserialize a raw config string straight into its compiled form.
impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Pattern::compile(&raw))
    }
}

fn split_labels(s: &str) -> Vec<Label> {
    s.split('.')
        .filter(|l| !l.is_empty())
        .map(Label::from)
        .collect()
}

fn ends_with_labels(name: &[Label], pat: &[Label]) -> bool {
    if pat.len() > name.len() {
        return false;
    }
    name[name.len() - pat.len()..] == *pat
}

/// Normalize a query name (as decoded off the wire) into lowercased,
/// dot-stripped labels suitable for [`Pattern::matches`].
pub fn labels_of(name: &str) -> Vec<Label> {
    split_labels(&name.trim_end_matches('.').to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn suffix_is_label_aligned() {
        let p = Pattern::compile("a.b.c");
        assert!(p.matches(&labels_of("a.b.c")));
        assert!(p.matches(&labels_of("x.a.b.c")));
        assert!(!p.matches(&labels_of("fooa.b.c")));
        assert!(!p.matches(&labels_of("a.b.c.d")));
    }

    #[test]
    fn bare_label_matches_anywhere() {
        let p = Pattern::compile("corp");
        assert!(p.matches(&labels_of("service.corp.internal")));
        assert!(p.matches(&labels_of("corp")));
        assert!(!p.matches(&labels_of("corporate.example.com")));
    }

    #[test]
    fn wildcard_excludes_bare_suffix() {
        let p = Pattern::compile("*.ru");
        assert!(p.matches(&labels_of("yandex.ru")));
        assert!(!p.matches(&labels_of("ru")));
        assert!(!p.matches(&labels_of("google.com")));
    }

    proptest! {
        #[test]
        fn compile_is_deterministic(raw in "[a-z]{1,5}(\\.[a-z]{1,5}){0,3}") {
            let p1 = Pattern::compile(&raw);
            let p2 = Pattern::compile(&raw);
            prop_assert_eq!(p1, p2);
        }

        #[test]
        fn matching_is_deterministic(raw in "[a-z]{1,5}(\\.[a-z]{1,5}){0,3}", name in "[a-z]{1,5}(\\.[a-z]{1,5}){0,3}") {
            let p = Pattern::compile(&raw);
            let labels = labels_of(&name);
            prop_assert_eq!(p.matches(&labels), p.matches(&labels));
        }
    }
}
