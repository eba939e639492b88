//! The pkgsrc `doc/TODO` file: "o PKGNAME [comment]" lines announcing
//! newer upstream releases.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use camino::Utf8Path;
use regex::Regex;

use crate::name::{Pkgbase, Pkgname};
use crate::version::Pkgversion;

static RE_PACKAGE_TODO: LazyLock<Regex> = LazyLock::new(|| {
    // #1: PKGBASE, #2: PKGVERSION, #3: comment
    Regex::new(r"^\s*o (\S+?)-([0-9][^-\s]*)(?:\s+(.+))?$").unwrap()
});

#[derive(Clone, Debug)]
pub struct TodoEntry {
    pub name: Pkgname,
    pub comment: String,
}

/// Entries keyed by base; when a base shows up more than once the highest
/// announced version wins.
#[derive(Clone, Debug, Default)]
pub struct TodoFile(BTreeMap<Pkgbase, TodoEntry>);

impl TodoFile {
    pub fn load(file: &Utf8Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries: BTreeMap<Pkgbase, TodoEntry> = BTreeMap::new();
        for line in text.lines() {
            let Some(captures) = RE_PACKAGE_TODO.captures(line) else {
                continue;
            };
            let base = Pkgbase::from(&captures[1]);
            let version = Pkgversion::parse(&captures[2]);
            let comment = captures
                .get(3)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default();

            let keep = entries
                .get(&base)
                .is_none_or(|existing| existing.name.version < version);
            if keep {
                entries.insert(
                    base.clone(),
                    TodoEntry {
                        name: Pkgname::new(base, version),
                        comment,
                    },
                );
            }
        }
        TodoFile(entries)
    }

    pub fn get(&self, base: &Pkgbase) -> Option<&TodoEntry> {
        self.0.get(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Suggested package updates
=========================

	o figlet-2.2.6
	o tmux-3.4 [build fix available]
	o tmux-3.5
	not a todo line
	o weird-name
";

    #[test]
    fn collects_announced_updates() {
        let todo = TodoFile::parse(SAMPLE);
        let figlet = todo.get(&Pkgbase::from("figlet")).unwrap();
        assert_eq!(figlet.name.to_string(), "figlet-2.2.6");
        assert_eq!(figlet.comment, "");
    }

    #[test]
    fn highest_version_wins_and_comment_is_kept() {
        let todo = TodoFile::parse(SAMPLE);
        let tmux = todo.get(&Pkgbase::from("tmux")).unwrap();
        assert_eq!(tmux.name.to_string(), "tmux-3.5");

        let with_comment = TodoFile::parse("o tmux-3.4 [build fix available]\n");
        assert_eq!(
            with_comment.get(&Pkgbase::from("tmux")).unwrap().comment,
            "[build fix available]"
        );
    }

    #[test]
    fn version_must_start_with_a_digit() {
        let todo = TodoFile::parse(SAMPLE);
        assert!(todo.get(&Pkgbase::from("weird")).is_none());
        assert!(todo.get(&Pkgbase::from("weird-name")).is_none());
    }
}
