//! Package identities: `Pkgbase`, `Pkgname` and `Pkgpath`.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use derive_more::{AsRef, Display};

use crate::version::Pkgversion;

/// The name portion of a package identity, without the version.
#[derive(AsRef, Display, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pkgbase(String);

impl Pkgbase {
    pub fn new(base: impl Into<String>) -> Self {
        Pkgbase(base.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Pkgbase {
    fn from(value: String) -> Self {
        Pkgbase(value)
    }
}

impl From<&str> for Pkgbase {
    fn from(value: &str) -> Self {
        Pkgbase(value.to_owned())
    }
}

/// `<base>-<version>`. Ordered by base first, then by version, which is what
/// makes range queries over an ordered name index work.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pkgname {
    pub base: Pkgbase,
    pub version: Pkgversion,
}

impl Pkgname {
    pub fn new(base: impl Into<Pkgbase>, version: Pkgversion) -> Self {
        Pkgname {
            base: base.into(),
            version,
        }
    }

    /// Split at the last hyphen. A name without a hyphen gets the whole
    /// string as its base and negative infinity as its version.
    pub fn parse(name: &str) -> Self {
        match name.rsplit_once('-') {
            Some((base, version)) => Pkgname {
                base: Pkgbase::from(base),
                version: Pkgversion::parse(version),
            },
            None => Pkgname {
                base: Pkgbase::from(name),
                version: Pkgversion::default(),
            },
        }
    }
}

impl From<&str> for Pkgname {
    fn from(name: &str) -> Self {
        Pkgname::parse(name)
    }
}

impl fmt::Display for Pkgname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.version)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("`{0}' is not a valid PKGPATH: expected category/subdir")]
pub struct BadPkgpath(pub String);

/// `category/subdir` of a package directory below PKGSRCDIR.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pkgpath {
    category: String,
    subdir: String,
}

impl Pkgpath {
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn subdir(&self) -> &str {
        &self.subdir
    }

    /// The path relative to PKGSRCDIR.
    pub fn as_rel_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.category).join(&self.subdir)
    }

    /// The package directory below the given PKGSRCDIR.
    pub fn dir_under(&self, pkgsrcdir: &Utf8Path) -> Utf8PathBuf {
        pkgsrcdir.join(&self.category).join(&self.subdir)
    }
}

impl FromStr for Pkgpath {
    type Err = BadPkgpath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((category, subdir)) if !category.is_empty() && !subdir.is_empty() => Ok(Pkgpath {
                category: category.to_owned(),
                subdir: subdir.to_owned(),
            }),
            _ => Err(BadPkgpath(s.to_owned())),
        }
    }
}

impl fmt::Display for Pkgpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.subdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkgname_splits_at_the_last_hyphen() {
        let name = Pkgname::parse("pkg-config-0.29.2nb4");
        assert_eq!(name.base.as_str(), "pkg-config");
        assert_eq!(name.version, Pkgversion::parse("0.29.2nb4"));
        assert_eq!(name.to_string(), "pkg-config-0.29.2nb4");
    }

    #[test]
    fn pkgname_round_trips() {
        for s in ["foo-1.0", "ruby32-base-3.2.2", "a-b-c-0nb1"] {
            assert_eq!(Pkgname::parse(s).to_string(), s);
            assert_eq!(Pkgname::parse(&Pkgname::parse(s).to_string()), Pkgname::parse(s));
        }
    }

    #[test]
    fn pkgname_orders_by_base_then_version() {
        assert!(Pkgname::parse("bar-2.0") < Pkgname::parse("foo-1.0"));
        assert!(Pkgname::parse("foo-1.0") < Pkgname::parse("foo-1.1"));
        // A name with the negative-infinity version is the lower bound of
        // its base.
        let bottom = Pkgname::new("foo", Pkgversion::default());
        assert!(bottom < Pkgname::parse("foo-0"));
        assert!(Pkgname::parse("fon-99") < bottom);
    }

    #[test]
    fn pkgpath_requires_a_slash() {
        let path: Pkgpath = "devel/pkg-config".parse().unwrap();
        assert_eq!(path.category(), "devel");
        assert_eq!(path.subdir(), "pkg-config");
        assert_eq!(path.to_string(), "devel/pkg-config");
        assert!("pkg-config".parse::<Pkgpath>().is_err());
        assert!("".parse::<Pkgpath>().is_err());
    }
}
