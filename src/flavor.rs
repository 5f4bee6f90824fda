//! Slicer flavor handling.
//!
//! This module knows:
//! - Which slicers the post-processor recognises and how their generator
//!   names map to a canonical flavor
//! - The per-flavor version allow-list
//! - A small bit-set over flavors so transform actions can declare
//!   "Orca or SuperSlicer only" filters

use std::fmt;

use semver::Version;

/// Canonical identifier for the slicer (or dialect) that generated a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlicerFlavor {
    PrusaSlicer,
    OrcaSlicer,
    SuperSlicer,
    /// PrusaSlicer output in the RatOS dialect (custom start/end macros).
    RatosDialect,
    Unknown,
}

impl SlicerFlavor {
    /// Map a generator name from the identification header to a flavor.
    pub fn from_generator_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "prusaslicer" => Self::PrusaSlicer,
            "orcaslicer" => Self::OrcaSlicer,
            "superslicer" => Self::SuperSlicer,
            _ => Self::Unknown,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::PrusaSlicer => 1 << 0,
            Self::OrcaSlicer => 1 << 1,
            Self::SuperSlicer => 1 << 2,
            Self::RatosDialect => 1 << 3,
            Self::Unknown => 1 << 4,
        }
    }

    /// Whether `version` is on the allow-list for this flavor.
    ///
    /// PrusaSlicer 2.8.x, OrcaSlicer 2.1.1 or 2.2.0, SuperSlicer 2.5.59 or
    /// 2.5.60. The RatOS dialect is validated against its dialect version
    /// (0.1), not the generator version.
    pub fn supports_version(self, version: &Version) -> bool {
        match self {
            Self::PrusaSlicer => version.major == 2 && version.minor == 8,
            Self::OrcaSlicer => {
                matches!(
                    (version.major, version.minor, version.patch),
                    (2, 1, 1) | (2, 2, 0)
                )
            }
            Self::SuperSlicer => {
                matches!(
                    (version.major, version.minor, version.patch),
                    (2, 5, 59) | (2, 5, 60)
                )
            }
            Self::RatosDialect => true,
            Self::Unknown => false,
        }
    }

    /// Whether `version` is a supported RatOS dialect version.
    pub fn supports_dialect_version(version: &Version) -> bool {
        version.major == 0 && version.minor == 1
    }
}

impl fmt::Display for SlicerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrusaSlicer => "PrusaSlicer",
            Self::OrcaSlicer => "OrcaSlicer",
            Self::SuperSlicer => "SuperSlicer",
            Self::RatosDialect => "RatOS dialect",
            Self::Unknown => "unknown slicer",
        };
        f.write_str(name)
    }
}

/// A set of flavors, used by action filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlicerFlavorSet(u8);

impl SlicerFlavorSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(0b1_1111);

    pub const fn of(flavor: SlicerFlavor) -> Self {
        Self(flavor.bit())
    }

    pub const fn with(self, flavor: SlicerFlavor) -> Self {
        Self(self.0 | flavor.bit())
    }

    pub const fn contains(self, flavor: SlicerFlavor) -> bool {
        self.0 & flavor.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for SlicerFlavorSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<SlicerFlavor> for SlicerFlavorSet {
    fn from(flavor: SlicerFlavor) -> Self {
        Self::of(flavor)
    }
}

/// Parse a version that may be missing minor or patch components.
///
/// Slicer headers carry full semver ("2.8.1"), but the RatOS dialect tag is
/// just "0.1". Missing components are zero-filled before parsing.
pub fn parse_version_lenient(text: &str) -> Result<Version, semver::Error> {
    match Version::parse(text) {
        Ok(version) => Ok(version),
        Err(first_err) => {
            let dots = text.bytes().filter(|b| *b == b'.').count();
            let padded = match dots {
                0 => format!("{text}.0.0"),
                1 => format!("{text}.0"),
                _ => return Err(first_err),
            };
            Version::parse(&padded).map_err(|_| first_err)
        }
    }
}
