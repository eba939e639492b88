//! The tagged declarative package list (`pkgchk.conf`).
//!
//! Line oriented: `#` comments, `TAG = PAT…` group definitions, and
//! `PKGPATH PAT…` package selections. A line with no patterns matches
//! unconditionally.

use std::collections::BTreeSet;
use std::fmt;

use camino::Utf8Path;

use crate::name::Pkgpath;

/// A set of tags. Built from platform facts, mk.conf variables and the
/// command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tagset(BTreeSet<String>);

impl Tagset {
    pub fn new() -> Self {
        Tagset::default()
    }

    /// Split comma-separated tags; the empty string yields the empty set.
    pub fn from_csv(tags: &str) -> Self {
        if tags.is_empty() {
            return Tagset::default();
        }
        Tagset(tags.split(',').map(str::to_owned).collect())
    }

    pub fn insert(&mut self, tag: impl Into<String>) {
        self.0.insert(tag.into());
    }

    pub fn extend_from(&mut self, other: &Tagset) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for Tagset {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Tagset(iter.into_iter().collect())
    }
}

impl fmt::Display for Tagset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

/// One alternative in a pattern list: `a+b` is a conjunction, a leading `-`
/// negates the whole conjunction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tagpat {
    pub negative: bool,
    pub tags_and: Vec<String>,
}

impl Tagpat {
    pub fn parse(pattern: &str) -> Self {
        let (negative, tags) = match pattern.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        Tagpat {
            negative,
            tags_and: tags.split('+').map(str::to_owned).collect(),
        }
    }

    /// Evaluate against the effective tag set: every conjunct must be in
    /// `included` and none in `excluded`; a negative pattern flips the
    /// result.
    fn evaluates(&self, included: &Tagset, excluded: &Tagset) -> bool {
        let all_set = self
            .tags_and
            .iter()
            .all(|tag| included.contains(tag) && !excluded.contains(tag));
        self.negative != all_set
    }
}

impl fmt::Display for Tagpat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", self.tags_and.join("+"))
    }
}

fn any_matches(patterns: &[Tagpat], included: &Tagset, excluded: &Tagset) -> bool {
    patterns.is_empty() || patterns.iter().any(|pat| pat.evaluates(included, excluded))
}

/// `TAG = PAT…`: the tag becomes effective iff any alternative matches.
#[derive(Clone, Debug)]
pub struct GroupDef {
    pub group: String,
    pub patterns_or: Vec<Tagpat>,
}

/// `PKGPATH PAT…`: selects the pkgpath when any alternative matches.
#[derive(Clone, Debug)]
pub struct PkgDef {
    pub path: Pkgpath,
    pub patterns_or: Vec<Tagpat>,
}

#[derive(Clone, Debug)]
pub enum Definition {
    Group(GroupDef),
    Pkg(PkgDef),
}

#[derive(Debug, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct ConfigError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    defs: Vec<Definition>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn load(file: &Utf8Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("Failed to read {file}: {e}"))?;
        Ok(Self::parse(&text, file.as_str())?)
    }

    pub fn parse(text: &str, file: &str) -> Result<Self, ConfigError> {
        let mut defs = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(hash) => &raw[..hash],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let first = tokens.next().expect("non-empty line has a token");

            // Group lines come as "TAG = …", "TAG= …" or "TAG=…".
            let group = if tokens.clone().next() == Some("=") {
                tokens.next();
                Some((first.to_owned(), None))
            } else if let Some((tag, rest)) = first.split_once('=') {
                Some((tag.to_owned(), Some(rest)))
            } else {
                None
            };

            match group {
                Some((tag, inline_rest)) => {
                    let mut patterns: Vec<Tagpat> = Vec::new();
                    if let Some(rest) = inline_rest {
                        if !rest.is_empty() {
                            patterns.push(Tagpat::parse(rest));
                        }
                    }
                    patterns.extend(tokens.map(Tagpat::parse));
                    defs.push(Definition::Group(GroupDef {
                        group: tag,
                        patterns_or: patterns,
                    }));
                }
                None => {
                    let path: Pkgpath = first.parse().map_err(|e| ConfigError {
                        file: file.to_owned(),
                        line: lineno + 1,
                        message: format!("{e}"),
                    })?;
                    defs.push(Definition::Pkg(PkgDef {
                        path,
                        patterns_or: tokens.map(Tagpat::parse).collect(),
                    }));
                }
            }
        }
        Ok(Config { defs })
    }

    pub fn push(&mut self, def: Definition) {
        self.defs.push(def);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Definition> {
        self.defs.iter()
    }

    /// The pkgpaths selected by the config under the given tag sets. Group
    /// tags that evaluate true extend the included set for all later lines.
    pub fn pkgpaths(&self, included: &Tagset, excluded: &Tagset) -> BTreeSet<Pkgpath> {
        let mut effective = included.clone();
        let mut selected = BTreeSet::new();
        for def in &self.defs {
            match def {
                Definition::Group(group) => {
                    if any_matches(&group.patterns_or, &effective, excluded) {
                        effective.insert(group.group.clone());
                    }
                }
                Definition::Pkg(pkg) => {
                    if any_matches(&pkg.patterns_or, &effective, excluded) {
                        selected.insert(pkg.path.clone());
                    }
                }
            }
        }
        selected
    }

    /// Every pkgpath, regardless of tags. Used for `PKGCHK_UPDATE_CONF`,
    /// which is a bare list.
    pub fn all_pkgpaths(&self) -> BTreeSet<Pkgpath> {
        self.pkgpaths(&Tagset::new(), &Tagset::new())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for def in &self.defs {
            match def {
                Definition::Group(group) => {
                    write!(f, "{} =", group.group)?;
                    for pat in &group.patterns_or {
                        write!(f, " {pat}")?;
                    }
                }
                Definition::Pkg(pkg) => {
                    write!(f, "{}", pkg.path)?;
                    for pat in &pkg.patterns_or {
                        write!(f, " {pat}")?;
                    }
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(csv: &str) -> Tagset {
        Tagset::from_csv(csv)
    }

    fn paths(conf: &Config, included: &str, excluded: &str) -> Vec<String> {
        conf.pkgpaths(&tags(included), &tags(excluded))
            .into_iter()
            .map(|p| p.to_string())
            .collect()
    }

    #[test]
    fn empty_pattern_list_matches_unconditionally() {
        let conf = Config::parse("devel/pkg-config\n", "t").unwrap();
        assert_eq!(paths(&conf, "", ""), ["devel/pkg-config"]);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let conf = Config::parse(
            "# header\n\nmisc/figlet  # trailing comment\n   \n",
            "t",
        )
        .unwrap();
        assert_eq!(paths(&conf, "", ""), ["misc/figlet"]);
    }

    #[test]
    fn conjunction_and_negation() {
        let text = "x11/xterm x11\nmisc/screen -x11\nwww/firefox x11+amd64\n";
        let conf = Config::parse(text, "t").unwrap();
        assert_eq!(paths(&conf, "x11", ""), ["x11/xterm"]);
        assert_eq!(paths(&conf, "", ""), ["misc/screen"]);
        assert_eq!(paths(&conf, "x11,amd64", ""), ["www/firefox", "x11/xterm"]);
    }

    #[test]
    fn alternatives_are_a_disjunction() {
        let conf = Config::parse("editors/vim NetBSD Linux\n", "t").unwrap();
        assert_eq!(paths(&conf, "Linux", ""), ["editors/vim"]);
        assert_eq!(paths(&conf, "SunOS", ""), Vec::<String>::new());
    }

    #[test]
    fn excluded_tags_defeat_positive_patterns() {
        let conf = Config::parse("x11/xterm x11\n", "t").unwrap();
        assert_eq!(paths(&conf, "x11", "x11"), Vec::<String>::new());
    }

    #[test]
    fn group_tags_extend_the_effective_set() {
        let text = "servers = NetBSD Linux\nnet/nsd servers\nnet/unbound -servers\n";
        let conf = Config::parse(text, "t").unwrap();
        assert_eq!(paths(&conf, "Linux", ""), ["net/nsd"]);
        assert_eq!(paths(&conf, "SunOS", ""), ["net/unbound"]);
    }

    #[test]
    fn bad_pkgpath_reports_file_and_line() {
        let err = Config::parse("# fine\nnot-a-path\n", "conf").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.file, "conf");
    }

    #[test]
    fn round_trips_through_display() {
        let text = "peers = NetBSD\ndevel/glib2 -x11 gtk\nmisc/tmux\n";
        let conf = Config::parse(text, "t").unwrap();
        let printed = conf.to_string();
        let reparsed = Config::parse(&printed, "t").unwrap();
        assert_eq!(printed, reparsed.to_string());
    }
}
