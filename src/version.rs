//! Parsing and ordering of package versions.
//!
//! A version string is tokenised left to right into a vector of components,
//! plus an optional `nbN` revision suffix. Comparison pads the shorter
//! component vector with numeric zeroes, which is what makes `1.0rc2` order
//! before `1.0`: the `rc` token projects to a negative number while the
//! padding projects to zero.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Pre-release markers order below the `.` separator they usually replace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifierKind {
    Alpha = -3,
    Beta = -2,
    Rc = -1,
    Dot = 0,
}

/// The literal modifier tokens, tried in order with a greedy
/// case-insensitive prefix match. `pre` has to come before `pl` so that
/// "prefix-like" spellings are not cut short.
const MODIFIERS: [(ModifierKind, &str); 7] = [
    (ModifierKind::Alpha, "alpha"),
    (ModifierKind::Beta, "beta"),
    (ModifierKind::Rc, "pre"),
    (ModifierKind::Rc, "rc"),
    (ModifierKind::Dot, "pl"),
    (ModifierKind::Dot, "_"),
    (ModifierKind::Dot, "."),
];

#[derive(Clone, Debug)]
pub enum Component {
    /// A run of ASCII digits. The width is kept so that leading zeroes
    /// survive round-trip printing; it does not participate in ordering.
    Digits { num: u64, width: usize },
    Modifier { kind: ModifierKind, text: &'static str },
    /// An isolated letter, e.g. the `a` in `1.2a`. Ordered by alphabet
    /// position starting at 1.
    Alpha(char),
}

impl Component {
    fn project(&self) -> i64 {
        match self {
            Component::Digits { num, .. } => *num as i64,
            Component::Modifier { kind, .. } => *kind as i64,
            Component::Alpha(c) => {
                let c = *c as u8;
                let ord = if c >= b'a' { c - b'a' } else { c - b'A' };
                i64::from(ord) + 1
            }
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Digits { num, width } => write!(f, "{num:0width$}"),
            Component::Modifier { text, .. } => f.write_str(text),
            Component::Alpha(c) => write!(f, "{c}"),
        }
    }
}

/// A package version. The default value has no components and no revision
/// and acts as negative infinity: it orders below every other version.
#[derive(Clone, Debug, Default)]
pub struct Pkgversion {
    comps: Vec<Component>,
    rev: u64,
}

fn starts_with_ci(haystack: &[u8], needle: &str) -> bool {
    haystack.len() >= needle.len()
        && haystack[..needle.len()].eq_ignore_ascii_case(needle.as_bytes())
}

impl Pkgversion {
    /// Parse a version string. This is total: bytes that fit no token are
    /// dropped.
    pub fn parse(s: &str) -> Self {
        let bytes = s.as_bytes();
        let mut comps = Vec::new();
        let mut rev = 0u64;
        let mut i = 0;

        'outer: while i < bytes.len() {
            if bytes[i].is_ascii_digit() {
                let start = i;
                let mut num = 0u64;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    num = num
                        .saturating_mul(10)
                        .saturating_add(u64::from(bytes[i] - b'0'));
                    i += 1;
                }
                comps.push(Component::Digits {
                    num,
                    width: i - start,
                });
                continue;
            }
            for (kind, text) in MODIFIERS {
                if starts_with_ci(&bytes[i..], text) {
                    comps.push(Component::Modifier { kind, text });
                    i += text.len();
                    continue 'outer;
                }
            }
            // "nb" only counts as the revision marker when everything up to
            // the end of the input is a digit; otherwise it is garbage.
            if starts_with_ci(&bytes[i..], "nb") && bytes[i + 2..].iter().all(u8::is_ascii_digit) {
                for b in &bytes[i + 2..] {
                    rev = rev.saturating_mul(10).saturating_add(u64::from(b - b'0'));
                }
                break;
            }
            if bytes[i].is_ascii_alphabetic() {
                comps.push(Component::Modifier {
                    kind: ModifierKind::Dot,
                    text: "",
                });
                comps.push(Component::Alpha(bytes[i] as char));
                i += 1;
                continue;
            }
            // Not a valid version byte. Skip it.
            i += 1;
        }

        Pkgversion { comps, rev }
    }

    pub fn revision(&self) -> u64 {
        self.rev
    }

    /// Negative infinity is the empty version: no components, no revision.
    /// A bare `nbN` is *not* negative infinity, it is `0nbN` in disguise.
    fn is_neg_inf(&self) -> bool {
        self.comps.is_empty() && self.rev == 0
    }

    fn compare(&self, other: &Pkgversion) -> Ordering {
        match (self.is_neg_inf(), other.is_neg_inf()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => {
                for i in 0..self.comps.len().max(other.comps.len()) {
                    let a = self.comps.get(i).map_or(0, Component::project);
                    let b = other.comps.get(i).map_or(0, Component::project);
                    if a != b {
                        return a.cmp(&b);
                    }
                }
                self.rev.cmp(&other.rev)
            }
        }
    }
}

impl PartialEq for Pkgversion {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Pkgversion {}

impl PartialOrd for Pkgversion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pkgversion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl FromStr for Pkgversion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Pkgversion::parse(s))
    }
}

impl From<&str> for Pkgversion {
    fn from(s: &str) -> Self {
        Pkgversion::parse(s)
    }
}

impl fmt::Display for Pkgversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for comp in &self.comps {
            write!(f, "{comp}")?;
        }
        if self.rev > 0 {
            write!(f, "nb{}", self.rev)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v(s: &str) -> Pkgversion {
        Pkgversion::parse(s)
    }

    #[test]
    fn components_of_a_plain_version() {
        let ver = v("1.2.3nb4");
        assert_eq!(ver.revision(), 4);
        assert_eq!(ver.to_string(), "1.2.3nb4");
    }

    #[rstest]
    #[case("1.2.3")]
    #[case("1.2.3nb4")]
    #[case("1.0rc2")]
    #[case("2.0alpha1")]
    #[case("1.2.3pl4")]
    #[case("20240101")]
    #[case("1.007")]
    #[case("1.2a")]
    fn display_round_trips(#[case] s: &str) {
        assert_eq!(v(s).to_string(), s);
        assert_eq!(v(&v(s).to_string()), v(s));
    }

    #[rstest]
    #[case("1.0rc2", "1.0")]
    #[case("1.0alpha1", "1.0beta1")]
    #[case("1.0beta9", "1.0rc1")]
    #[case("1.2.3", "1.2.3nb1")]
    #[case("1.2.3nb1", "1.2.3nb2")]
    #[case("1.9", "1.10")]
    #[case("1.2", "1.2a")]
    fn orders_strictly_below(#[case] lo: &str, #[case] hi: &str) {
        assert!(v(lo) < v(hi), "{lo} should be < {hi}");
        assert!(v(hi) > v(lo));
    }

    #[rstest]
    #[case("1.0", "1.0.0")]
    #[case("1.0pl1", "1.0.1")]
    #[case("1.007", "1.7")]
    #[case("nb5", "0nb5")]
    fn compares_equal(#[case] a: &str, #[case] b: &str) {
        assert_eq!(v(a), v(b));
    }

    #[test]
    fn neg_inf_is_below_everything() {
        let bottom = Pkgversion::default();
        assert_eq!(bottom, v(""));
        assert!(bottom < v("0"));
        assert!(bottom < v("nb5"));
        assert_eq!(bottom, bottom.clone());
    }

    #[test]
    fn nb_is_garbage_unless_followed_by_digits_only() {
        // "nb2x" cannot be a revision, so the tokens degrade to letters.
        let ver = v("1.0nb2x");
        assert_eq!(ver.revision(), 0);
        assert!(ver > v("1.0"));
    }

    #[test]
    fn unknown_characters_are_dropped() {
        assert_eq!(v("1,2"), v("1;2"));
        assert_eq!(v("1!!2").to_string(), "12");
    }

    #[test]
    fn ordering_is_total() {
        let samples = ["", "0", "1.0", "1.0rc1", "1.0nb3", "2a", "nb1"];
        for a in samples {
            for b in samples {
                let lt = v(a) < v(b);
                let gt = v(a) > v(b);
                let eq = v(a) == v(b);
                assert_eq!(1, [lt, gt, eq].iter().filter(|x| **x).count());
            }
        }
    }
}
