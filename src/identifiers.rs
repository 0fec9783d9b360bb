//! [crate::identifiers] contains the logical (LID) and versioned (LIDVID) product identifiers used
//! to key registry documents, plus the numeric version ordering the provenance pass depends on.
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::error::SweepersError;

/// Separator between the LID and the version in a LIDVID string.
pub const LIDVID_SEPARATOR: &str = "::";

/// A logical identifier, stable across versions of a product.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lid(String);

impl Lid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Lid {
    type Err = SweepersError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(SweepersError::DataShape("empty LID".to_string()));
        }
        if trimmed.contains(LIDVID_SEPARATOR) {
            return Err(SweepersError::DataShape(format!(
                "LID '{trimmed}' must not contain a version separator"
            )));
        }
        if trimmed.split(':').any(str::is_empty) {
            return Err(SweepersError::DataShape(format!(
                "LID '{trimmed}' has an empty segment"
            )));
        }
        Ok(Lid(trimmed.to_string()))
    }
}

impl TryFrom<String> for Lid {
    type Error = SweepersError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Lid> for String {
    fn from(lid: Lid) -> String {
        lid.0
    }
}

impl Display for Lid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `major.minor` version. Components compare numerically, so `1.10 > 1.9`.
///
/// The text the version was parsed from is kept verbatim and is what [Display] writes, so a
/// reference built from a [Vid] names the stored document exactly. Versions that are numerically
/// equal but spelled differently (`1.0`, `1.00`) are distinct and order by their text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Vid {
    pub major: u32,
    pub minor: u32,
    text: String,
}

impl PartialOrd for Vid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vid {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor)
            .cmp(&(other.major, other.minor))
            .then_with(|| self.text.cmp(&other.text))
    }
}

impl FromStr for Vid {
    type Err = SweepersError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SweepersError::DataShape(format!("malformed version string '{s}'"));
        let text = s.trim();
        let (major, minor) = text.split_once('.').ok_or_else(malformed)?;
        let parse = |component: &str| {
            if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                Err(malformed())
            } else {
                component.parse::<u32>().map_err(|_| malformed())
            }
        };
        Ok(Vid {
            major: parse(major)?,
            minor: parse(minor)?,
            text: text.to_string(),
        })
    }
}

impl TryFrom<String> for Vid {
    type Error = SweepersError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Vid> for String {
    fn from(vid: Vid) -> String {
        vid.text
    }
}

impl Display for Vid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// A LID plus a specific version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LidVid {
    pub lid: Lid,
    pub vid: Vid,
}

// Total order used for deterministic set iteration: LID first, then numeric version.
impl PartialOrd for LidVid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LidVid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lid.cmp(&other.lid).then(self.vid.cmp(&other.vid))
    }
}

impl FromStr for LidVid {
    type Err = SweepersError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lid, vid) = s.trim().split_once(LIDVID_SEPARATOR).ok_or_else(|| {
            SweepersError::DataShape(format!("LIDVID '{s}' is missing a version separator"))
        })?;
        Ok(LidVid {
            lid: lid.parse()?,
            vid: vid.parse()?,
        })
    }
}

impl TryFrom<String> for LidVid {
    type Error = SweepersError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LidVid> for String {
    fn from(lidvid: LidVid) -> String {
        lidvid.to_string()
    }
}

impl Display for LidVid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.lid, LIDVID_SEPARATOR, self.vid)
    }
}

/// A reference target as it appears in a reference field: either a specific version or every
/// version of a logical product.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProductIdentifier {
    Lid(Lid),
    LidVid(LidVid),
}

impl ProductIdentifier {
    pub fn lid(&self) -> &Lid {
        match self {
            ProductIdentifier::Lid(lid) => lid,
            ProductIdentifier::LidVid(lidvid) => &lidvid.lid,
        }
    }
}

impl FromStr for ProductIdentifier {
    type Err = SweepersError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(LIDVID_SEPARATOR) {
            Ok(ProductIdentifier::LidVid(s.parse()?))
        } else {
            Ok(ProductIdentifier::Lid(s.parse()?))
        }
    }
}

impl Display for ProductIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProductIdentifier::Lid(lid) => write!(f, "{lid}"),
            ProductIdentifier::LidVid(lidvid) => write!(f, "{lidvid}"),
        }
    }
}
