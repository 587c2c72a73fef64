//! Protocol versioning for STOMP.
//!
//! Clients list the versions they accept in the `accept-version` header of
//! CONNECT; the server answers with the highest version both sides speak.

use std::fmt;
use std::str::FromStr;

/// Highest protocol version this crate speaks.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 2 };

/// Every version the server accepts, lowest first.
pub const SUPPORTED_VERSIONS: [Version; 3] = [
    Version::new(1, 0),
    Version::new(1, 1),
    Version::new(1, 2),
];

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Whether this server supports the version.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(self)
    }
}

/// Pick the version to speak given a client's `accept-version` header.
///
/// A missing header means a 1.0 client. Unparseable entries are ignored.
/// Returns `None` when no listed version is supported.
#[must_use]
pub fn negotiate(accept_version: Option<&str>) -> Option<Version> {
    let Some(accepted) = accept_version else {
        return Some(Version::new(1, 0));
    };

    accepted
        .split(',')
        .filter_map(|v| v.trim().parse::<Version>().ok())
        .filter(Version::is_supported)
        .max()
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid version: {s}"))?;
        let major = major
            .parse()
            .map_err(|_| format!("Invalid major version: {s}"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("Invalid minor version: {s}"))?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
