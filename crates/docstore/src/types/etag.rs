use std::fmt;

use serde::{Deserialize, Serialize};

/// A weak entity tag carrying a resource version, rendered as `W/"<version>"`.
///
/// # Examples
///
/// ```
/// use helios_docstore::types::WeakETag;
///
/// let tag = WeakETag::from_weak_etag("W/\"3\"");
/// assert_eq!(tag.version_id(), "3");
/// assert_eq!(tag.to_string(), "W/\"3\"");
/// assert_eq!(WeakETag::from_weak_etag("3"), tag);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeakETag(String);

impl WeakETag {
    /// Creates a tag for a version id.
    pub fn from_version_id(version_id: impl Into<String>) -> Self {
        Self(version_id.into())
    }

    /// Parses `W/"v"`, `"v"` or `v`.
    pub fn from_weak_etag(etag: &str) -> Self {
        Self(normalize_etag(etag).to_string())
    }

    /// The version id carried by this tag.
    pub fn version_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WeakETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W/\"{}\"", self.0)
    }
}

/// Strips the weak prefix and quotes from an ETag.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim()
        .trim_start_matches("W/")
        .trim_start_matches('"')
        .trim_end_matches('"')
}
