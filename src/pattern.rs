//! Dependency patterns: csh-style alternatives, version ranges and globs.
//!
//! Matching runs against an ordered name index (a `BTreeSet<Pkgname>` or the
//! keys of a `BTreeMap<Pkgname, _>`) so that every pattern kind can narrow
//! its scan to a contiguous key range instead of walking the whole set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

use crate::name::{Pkgbase, Pkgname};
use crate::version::Pkgversion;

#[derive(Debug, thiserror::Error)]
pub enum PatternParseError {
    #[error("Malformed alternate `{0}'")]
    MalformedAlternatives(String),
    #[error("Malformed version constraint `{0}'")]
    MalformedVersionRange(String),
}

/// An ordered set of package names that supports range scans. Implemented
/// for the two shapes the tools actually use.
pub trait NameIndex {
    fn iter_from<'a>(&'a self, start: &Pkgname) -> Box<dyn Iterator<Item = &'a Pkgname> + 'a>;
    fn iter_after<'a>(&'a self, start: &Pkgname) -> Box<dyn Iterator<Item = &'a Pkgname> + 'a>;
    fn lookup<'a>(&'a self, name: &Pkgname) -> Option<&'a Pkgname>;
}

impl NameIndex for BTreeSet<Pkgname> {
    fn iter_from<'a>(&'a self, start: &Pkgname) -> Box<dyn Iterator<Item = &'a Pkgname> + 'a> {
        Box::new(self.range(start.clone()..))
    }

    fn iter_after<'a>(&'a self, start: &Pkgname) -> Box<dyn Iterator<Item = &'a Pkgname> + 'a> {
        Box::new(self.range((Bound::Excluded(start.clone()), Bound::Unbounded)))
    }

    fn lookup<'a>(&'a self, name: &Pkgname) -> Option<&'a Pkgname> {
        self.get(name)
    }
}

impl<V> NameIndex for BTreeMap<Pkgname, V> {
    fn iter_from<'a>(&'a self, start: &Pkgname) -> Box<dyn Iterator<Item = &'a Pkgname> + 'a> {
        Box::new(self.range(start.clone()..).map(|(name, _)| name))
    }

    fn iter_after<'a>(&'a self, start: &Pkgname) -> Box<dyn Iterator<Item = &'a Pkgname> + 'a> {
        Box::new(
            self.range((Bound::Excluded(start.clone()), Bound::Unbounded))
                .map(|(name, _)| name),
        )
    }

    fn lookup<'a>(&'a self, name: &Pkgname) -> Option<&'a Pkgname> {
        self.get_key_value(name).map(|(name, _)| name)
    }
}

/// csh-style alternatives: `foo{bar,{baz,qux}}`.
#[derive(Clone, Debug)]
pub struct Alternatives {
    original: String,
    expanded: Vec<Pkgpattern>,
}

impl Alternatives {
    fn parse(patstr: &str) -> Result<Self, PatternParseError> {
        let malformed = || PatternParseError::MalformedAlternatives(patstr.to_owned());

        // Reject anything that is not strictly brace-balanced, stray
        // closing braces included.
        let mut depth = 0i32;
        for ch in patstr.chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(malformed());
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(malformed());
        }

        let bytes = patstr.as_bytes();
        let o_brace = patstr.find('{').ok_or_else(malformed)?;
        let head = &patstr[..o_brace];

        // The part following the matching close brace may itself contain
        // braces; those are handled by the recursive parse of each
        // expansion.
        let mut c_brace = None;
        let mut level = 0;
        for i in o_brace..bytes.len() {
            match bytes[i] {
                b'{' => level += 1,
                b'}' => {
                    level -= 1;
                    if level == 0 {
                        c_brace = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let c_brace = c_brace.ok_or_else(malformed)?;
        let tail = &patstr[c_brace + 1..];

        // Comma-separated segments enclosed by the outermost braces.
        // Commas inside nested braces do not split.
        let mut expanded = Vec::new();
        let mut seg_begin = o_brace + 1;
        let mut level = 1;
        for i in o_brace + 1..=c_brace {
            match bytes[i] {
                b'{' => level += 1,
                b'}' => {
                    level -= 1;
                    if level == 0 {
                        let segment = &patstr[seg_begin..i];
                        expanded.push(Pkgpattern::parse(&format!("{head}{segment}{tail}"))?);
                    }
                }
                b',' if level == 1 => {
                    let segment = &patstr[seg_begin..i];
                    expanded.push(Pkgpattern::parse(&format!("{head}{segment}{tail}"))?);
                    seg_begin = i + 1;
                }
                _ => {}
            }
        }

        Ok(Alternatives {
            original: patstr.to_owned(),
            expanded,
        })
    }

    pub fn expanded(&self) -> &[Pkgpattern] {
        &self.expanded
    }
}

impl fmt::Display for Alternatives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// An optional upper bound on `>=` / `>` ranges.
#[derive(Clone, Debug)]
pub enum UpperBound {
    Le(Pkgversion),
    Lt(Pkgversion),
}

impl UpperBound {
    fn admits(&self, version: &Pkgversion) -> bool {
        match self {
            UpperBound::Le(sup) => version <= sup,
            UpperBound::Lt(sup) => version < sup,
        }
    }
}

impl fmt::Display for UpperBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpperBound::Le(sup) => write!(f, "<={sup}"),
            UpperBound::Lt(sup) => write!(f, "<{sup}"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Constraint {
    Le(Pkgversion),
    Lt(Pkgversion),
    Ge {
        min: Pkgversion,
        sup: Option<UpperBound>,
    },
    Gt {
        inf: Pkgversion,
        sup: Option<UpperBound>,
    },
    Eq(Pkgversion),
    Ne(Pkgversion),
}

/// Version constraints: `foo>=1.1<2`.
#[derive(Clone, Debug)]
pub struct VersionRange {
    pub base: Pkgbase,
    pub constraint: Constraint,
}

impl VersionRange {
    fn parse(patstr: &str) -> Result<Self, PatternParseError> {
        let malformed = || PatternParseError::MalformedVersionRange(patstr.to_owned());

        let op_begin = patstr
            .find(['<', '>', '!', '='])
            .ok_or_else(malformed)?;
        let base = Pkgbase::from(&patstr[..op_begin]);
        let rest = &patstr[op_begin..];

        let require_version = |s: &str| {
            if s.is_empty() {
                Err(malformed())
            } else {
                Ok(Pkgversion::parse(s))
            }
        };

        let constraint = if let Some(rest) = rest.strip_prefix("<=") {
            Constraint::Le(require_version(rest)?)
        } else if let Some(rest) = rest.strip_prefix('<') {
            Constraint::Lt(require_version(rest)?)
        } else if rest.starts_with('>') {
            let is_ge = rest.starts_with(">=");
            let lower = &rest[if is_ge { 2 } else { 1 }..];

            let (inf, sup) = match lower.find('<') {
                Some(op2) => {
                    let inf = Pkgversion::parse(&lower[..op2]);
                    let sup_str = &lower[op2..];
                    let sup = if let Some(s) = sup_str.strip_prefix("<=") {
                        UpperBound::Le(require_version(s)?)
                    } else {
                        UpperBound::Lt(require_version(&sup_str[1..])?)
                    };
                    (inf, Some(sup))
                }
                None => (Pkgversion::parse(lower), None),
            };

            if is_ge {
                Constraint::Ge { min: inf, sup }
            } else {
                Constraint::Gt { inf, sup }
            }
        } else if let Some(rest) = rest.strip_prefix("==") {
            Constraint::Eq(require_version(rest)?)
        } else if let Some(rest) = rest.strip_prefix("!=") {
            Constraint::Ne(require_version(rest)?)
        } else {
            return Err(malformed());
        };

        Ok(VersionRange { base, constraint })
    }

    fn for_each<'a>(&self, set: &'a dyn NameIndex, f: &mut dyn FnMut(&'a Pkgname)) {
        let bottom = Pkgname::new(self.base.clone(), Pkgversion::default());
        match &self.constraint {
            Constraint::Le(sup) => {
                for name in set.iter_from(&bottom) {
                    if name.base != self.base || name.version > *sup {
                        break;
                    }
                    f(name);
                }
            }
            Constraint::Lt(sup) => {
                for name in set.iter_from(&bottom) {
                    if name.base != self.base || name.version >= *sup {
                        break;
                    }
                    f(name);
                }
            }
            Constraint::Ge { min, sup } => {
                let start = Pkgname::new(self.base.clone(), min.clone());
                for name in set.iter_from(&start) {
                    if name.base != self.base
                        || !sup.as_ref().is_none_or(|sup| sup.admits(&name.version))
                    {
                        break;
                    }
                    f(name);
                }
            }
            Constraint::Gt { inf, sup } => {
                let start = Pkgname::new(self.base.clone(), inf.clone());
                for name in set.iter_after(&start) {
                    if name.base != self.base
                        || !sup.as_ref().is_none_or(|sup| sup.admits(&name.version))
                    {
                        break;
                    }
                    f(name);
                }
            }
            Constraint::Eq(version) => {
                // The cheapest constraint of all: a single lookup.
                let wanted = Pkgname::new(self.base.clone(), version.clone());
                if let Some(name) = set.lookup(&wanted) {
                    f(name);
                }
            }
            Constraint::Ne(version) => {
                for name in set.iter_from(&bottom) {
                    if name.base != self.base {
                        break;
                    }
                    if name.version != *version {
                        f(name);
                    }
                }
            }
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        match &self.constraint {
            Constraint::Le(v) => write!(f, "<={v}"),
            Constraint::Lt(v) => write!(f, "<{v}"),
            Constraint::Ge { min, sup } => {
                write!(f, ">={min}")?;
                if let Some(sup) = sup {
                    write!(f, "{sup}")?;
                }
                Ok(())
            }
            Constraint::Gt { inf, sup } => {
                write!(f, ">{inf}")?;
                if let Some(sup) = sup {
                    write!(f, "{sup}")?;
                }
                Ok(())
            }
            Constraint::Eq(v) => write!(f, "=={v}"),
            Constraint::Ne(v) => write!(f, "!={v}"),
        }
    }
}

const GLOB_MATCH_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    // fnmatch(3) with FNM_PERIOD.
    require_literal_leading_dot: true,
};

/// A literal fnmatch-style pattern on the full `base-version` string.
#[derive(Clone, Debug)]
pub struct Glob(String);

impl Glob {
    fn matches(&self, name: &Pkgname) -> bool {
        let name_str = name.to_string();
        if let Ok(pat) = glob::Pattern::new(&self.0) {
            if pat.matches_with(&name_str, GLOB_MATCH_OPTIONS) {
                return true;
            }
        }
        // The match may have failed only because the pattern lacks a
        // version part.
        if let Ok(pat) = glob::Pattern::new(&format!("{}-[0-9]*", self.0)) {
            if pat.matches_with(&name_str, GLOB_MATCH_OPTIONS) {
                return true;
            }
        }
        false
    }

    fn for_each<'a>(&self, set: &'a dyn NameIndex, f: &mut dyn FnMut(&'a Pkgname)) {
        // Narrow the scan with the literal part preceding any meta
        // character. A glob may come with or without a version, so the last
        // hyphen of the literal has to be treated as a meta character too.
        let literal = match self.0.find(['*', '?', '[', ']']) {
            Some(meta) => &self.0[..meta],
            None => &self.0,
        };
        let literal = match literal.rfind('-') {
            Some(hyphen) => &literal[..hyphen],
            None => literal,
        };

        let start = Pkgname::new(literal, Pkgversion::default());
        for name in set.iter_from(&start) {
            if !name.base.as_str().starts_with(literal) {
                break;
            }
            if self.matches(name) {
                f(name);
            }
        }
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub enum Pkgpattern {
    Alternatives(Alternatives),
    VersionRange(VersionRange),
    Glob(Glob),
}

impl Pkgpattern {
    pub fn parse(patstr: &str) -> Result<Self, PatternParseError> {
        if patstr.contains(['{', '}']) {
            Ok(Pkgpattern::Alternatives(Alternatives::parse(patstr)?))
        } else if patstr.contains(['<', '>', '!', '=']) {
            Ok(Pkgpattern::VersionRange(VersionRange::parse(patstr)?))
        } else {
            Ok(Pkgpattern::Glob(Glob(patstr.to_owned())))
        }
    }

    /// When the pattern is a plain version range its base is right there in
    /// the pattern. Globs cannot be unpicked this way: `foo-[0-9]*` could
    /// in principle match `foo-0-bar-1.2nb3`.
    pub fn obvious_base(&self) -> Option<&Pkgbase> {
        match self {
            Pkgpattern::VersionRange(range) => Some(&range.base),
            _ => None,
        }
    }

    /// Apply `f` to every entry of the index matching the pattern.
    pub fn for_each<'a>(&self, set: &'a dyn NameIndex, f: &mut dyn FnMut(&'a Pkgname)) {
        match self {
            Pkgpattern::Alternatives(alts) => {
                for pat in alts.expanded() {
                    pat.for_each(set, f);
                }
            }
            Pkgpattern::VersionRange(range) => range.for_each(set, f),
            Pkgpattern::Glob(glob) => glob.for_each(set, f),
        }
    }

    /// The greatest matching name, or `None` if nothing matches.
    pub fn best<'a>(&self, set: &'a dyn NameIndex) -> Option<&'a Pkgname> {
        let mut current: Option<&'a Pkgname> = None;
        self.for_each(set, &mut |name| {
            if current.is_none_or(|cur| cur < name) {
                current = Some(name);
            }
        });
        current
    }
}

impl fmt::Display for Pkgpattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pkgpattern::Alternatives(p) => p.fmt(f),
            Pkgpattern::VersionRange(p) => p.fmt(f),
            Pkgpattern::Glob(p) => p.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn index(names: &[&str]) -> BTreeSet<Pkgname> {
        names.iter().map(|s| Pkgname::parse(s)).collect()
    }

    fn matched(pat: &str, names: &[&str]) -> Vec<String> {
        let set = index(names);
        let pat = Pkgpattern::parse(pat).unwrap();
        let mut found = Vec::new();
        pat.for_each(&set, &mut |name| found.push(name.to_string()));
        found
    }

    #[test]
    fn alternatives_expand_to_the_product_of_group_arities() {
        let pat = Pkgpattern::parse("foo{bar,baz}-[0-9]*").unwrap();
        let Pkgpattern::Alternatives(alts) = &pat else {
            panic!("expected alternatives");
        };
        let strs: Vec<_> = alts.expanded().iter().map(ToString::to_string).collect();
        assert_eq!(strs, ["foobar-[0-9]*", "foobaz-[0-9]*"]);
        assert!(alts
            .expanded()
            .iter()
            .all(|p| matches!(p, Pkgpattern::Glob(_))));
    }

    #[test]
    fn nested_alternatives_expand_recursively() {
        let pat = Pkgpattern::parse("a{b,{c,d}e}").unwrap();
        let Pkgpattern::Alternatives(alts) = &pat else {
            panic!("expected alternatives");
        };
        let mut leaves = Vec::new();
        fn walk(pat: &Pkgpattern, out: &mut Vec<String>) {
            match pat {
                Pkgpattern::Alternatives(alts) => {
                    for sub in alts.expanded() {
                        walk(sub, out);
                    }
                }
                other => out.push(other.to_string()),
            }
        }
        for sub in alts.expanded() {
            walk(sub, &mut leaves);
        }
        assert_eq!(leaves, ["ab", "ace", "ade"]);
    }

    #[rstest]
    #[case("foo{bar")]
    #[case("foo}bar{x}")]
    #[case("foo{a,{b}")]
    fn unbalanced_braces_are_rejected(#[case] pat: &str) {
        assert!(matches!(
            Pkgpattern::parse(pat),
            Err(PatternParseError::MalformedAlternatives(_))
        ));
    }

    #[rstest]
    #[case("openssl<")]
    #[case("openssl<=")]
    #[case("openssl==")]
    #[case("openssl!=")]
    #[case("openssl>=1.1<")]
    #[case("openssl=1")]
    fn truncated_ranges_are_rejected(#[case] pat: &str) {
        assert!(matches!(
            Pkgpattern::parse(pat),
            Err(PatternParseError::MalformedVersionRange(_))
        ));
    }

    #[test]
    fn bounded_range_selects_within_the_window() {
        let found = matched(
            "openssl>=1.1<3",
            &["openssl-1.0.2zh", "openssl-1.1.1w", "openssl-3.0.12"],
        );
        assert_eq!(found, ["openssl-1.1.1w"]);
    }

    #[rstest]
    #[case("foo<2", &["foo-1.9"])]
    #[case("foo<=2", &["foo-1.9", "foo-2.0"])]
    #[case("foo>2", &["foo-2.5"])]
    #[case("foo>=2", &["foo-2.0", "foo-2.5"])]
    #[case("foo==2.0", &["foo-2.0"])]
    #[case("foo!=2.0", &["foo-1.9", "foo-2.5"])]
    fn each_operator_selects_its_window(#[case] pat: &str, #[case] expected: &[&str]) {
        let found = matched(pat, &["bar-1.0", "foo-1.9", "foo-2.0", "foo-2.5", "zzz-9"]);
        assert_eq!(found, expected);
    }

    #[test]
    fn glob_without_version_retries_with_version_suffix() {
        let found = matched("emacs*", &["emacs-29.1", "emacs-nox-29.1", "vim-9.0"]);
        assert_eq!(found, ["emacs-29.1", "emacs-nox-29.1"]);
    }

    #[test]
    fn glob_narrowing_does_not_lose_matches_across_hyphens() {
        // The literal prefix "pkg-config" must be trimmed at its last
        // hyphen, otherwise the range scan would start past "pkg-config".
        let found = matched("pkg-config-[0-9]*", &["pkg-config-0.29.2", "pkgconf-2.1"]);
        assert_eq!(found, ["pkg-config-0.29.2"]);
    }

    #[test]
    fn best_returns_the_greatest_match() {
        let set = index(&["foo-1.0", "foo-1.5", "foo-2.0", "goo-9"]);
        let pat = Pkgpattern::parse("foo<2").unwrap();
        assert_eq!(pat.best(&set).unwrap().to_string(), "foo-1.5");
        let none = Pkgpattern::parse("foo>9").unwrap();
        assert!(none.best(&set).is_none());
    }

    #[test]
    fn matching_works_against_map_keys() {
        let mut map = BTreeMap::new();
        map.insert(Pkgname::parse("foo-1.0"), "one");
        map.insert(Pkgname::parse("foo-2.0"), "two");
        let pat = Pkgpattern::parse("foo>=1.5").unwrap();
        let best = pat.best(&map).unwrap();
        assert_eq!(map[best], "two");
    }
}
