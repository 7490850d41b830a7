//! Cache key definitions
//!
//! A [`ContentKey`] names one cache slot: a content id plus a canonical
//! quality token. Its on-disk file name is derived deterministically and can
//! be parsed back, which is how the store lists its entries.

use std::fmt;

use crate::delivery::quality::{Quality, STANDARD_TOKEN};

/// Suffix of published cache entries
pub const ENTRY_SUFFIX: &str = ".mp4";

/// Suffix of in-progress staging files
pub const STAGING_SUFFIX: &str = ".part";

/// One cache slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    /// Opaque content id as supplied by the client
    pub content_id: String,
    /// Canonical quality token (digits or `standard`)
    pub quality: String,
}

impl ContentKey {
    /// Create a key from an already-normalized quality
    pub fn new(content_id: &str, quality: Quality) -> Self {
        Self {
            content_id: content_id.to_string(),
            quality: quality.token(),
        }
    }

    /// Quality as a typed selection
    pub fn quality(&self) -> Quality {
        Quality::parse(&self.quality)
    }

    /// Content id escaped for use in a file name. Dots are escaped too so the
    /// quality separator stays unambiguous.
    fn escaped_id(&self) -> String {
        urlencoding::encode(&self.content_id).replace('.', "%2E")
    }

    /// Final file name: `<escaped id>.<quality>.mp4`
    pub fn file_name(&self) -> String {
        format!("{}.{}{}", self.escaped_id(), self.quality, ENTRY_SUFFIX)
    }

    /// Staging file name for one fill attempt: `<escaped id>.<quality>.<attempt>.part`
    pub fn staging_name(&self, attempt: &uuid::Uuid) -> String {
        format!(
            "{}.{}.{}{}",
            self.escaped_id(),
            self.quality,
            attempt.simple(),
            STAGING_SUFFIX
        )
    }

    /// Parse a published entry file name back into its key.
    ///
    /// Returns `None` for staging files and anything the store did not write.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(ENTRY_SUFFIX)?;
        let (escaped, quality) = stem.split_once('.')?;
        if escaped.is_empty() || !is_quality_token(quality) {
            return None;
        }
        let content_id = urlencoding::decode(escaped).ok()?.into_owned();
        Some(Self {
            content_id,
            quality: quality.to_string(),
        })
    }
}

fn is_quality_token(s: &str) -> bool {
    s == STANDARD_TOKEN || (!s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.content_id, self.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        let key = ContentKey::new("abc", Quality::Height(360));
        assert_eq!(key.file_name(), "abc.360.mp4");

        let key = ContentKey::new("abc", Quality::Standard);
        assert_eq!(key.file_name(), "abc.standard.mp4");
    }

    #[test]
    fn test_file_name_escapes_separators() {
        let key = ContentKey::new("../etc/pass.wd", Quality::Height(720));
        let name = key.file_name();
        assert!(!name.contains('/'));
        assert_eq!(name.matches('.').count(), 2);

        let parsed = ContentKey::from_file_name(&name).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(ContentKey::from_file_name("views.json").is_none());
        assert!(ContentKey::from_file_name("abc.mp4").is_none());
        assert!(ContentKey::from_file_name("abc.hd.mp4").is_none());
        assert!(ContentKey::from_file_name(".360.mp4").is_none());

        let key = ContentKey::new("abc", Quality::Height(360));
        let staging = key.staging_name(&uuid::Uuid::new_v4());
        assert!(staging.ends_with(STAGING_SUFFIX));
        assert!(ContentKey::from_file_name(&staging).is_none());
    }

    #[test]
    fn test_display() {
        let key = ContentKey::new("abc", Quality::Height(360));
        assert_eq!(key.to_string(), "abc@360");
        assert_eq!(key.quality(), Quality::Height(360));
    }
}
