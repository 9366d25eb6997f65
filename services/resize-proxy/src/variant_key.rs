//! Width-suffix naming convention for resized variants.
//!
//! A variant is addressed as `<source-url>_<width>`. The delimiter is searched
//! for in the full URL string, query included, and the last occurrence wins.

use reqwest::Url;
use std::fmt;

/// Character separating the source key from the requested width
pub const DELIMITER: char = '_';

/// A requested URL that decodes to a source object and a target width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantKey {
    source: Url,
    width: u32,
}

impl VariantKey {
    /// Decode a requested URL. Returns `None` when the URL does not name a variant.
    pub fn decode(requested: &Url) -> Option<Self> {
        Self::decode_str(requested.as_str())
    }

    /// Decode a raw URL string.
    ///
    /// The suffix must be plain ASCII digits with a value of at least 1 that
    /// fits in a `u32`. Signs, whitespace, zero and overflow are rejected.
    pub fn decode_str(requested: &str) -> Option<Self> {
        let position = requested.rfind(DELIMITER)?;
        if position < 1 {
            return None;
        }

        let width = parse_width(&requested[position + DELIMITER.len_utf8()..])?;
        let source = Url::parse(&requested[..position]).ok()?;

        Some(Self { source, width })
    }

    /// Build the variant key for `source` at `width`
    pub fn new(source: Url, width: u32) -> Option<Self> {
        (width > 0).then_some(Self { source, width })
    }

    /// The source object's URL
    pub fn source(&self) -> &Url {
        &self.source
    }

    /// Requested width in pixels, always at least 1
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn into_parts(self) -> (Url, u32) {
        (self.source, self.width)
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.source, DELIMITER, self.width)
    }
}

fn parse_width(suffix: &str) -> Option<u32> {
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    suffix.parse::<u32>().ok().filter(|width| *width > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_decode_width_suffix() {
        let key = VariantKey::decode(&url("http://minio:9000/images/cat.jpg_200")).unwrap();
        assert_eq!(key.width(), 200);
        assert_eq!(key.source().as_str(), "http://minio:9000/images/cat.jpg");
    }

    #[test]
    fn test_last_delimiter_wins() {
        let key =
            VariantKey::decode(&url("http://minio:9000/images/my_cat_photo.jpg_64")).unwrap();
        assert_eq!(key.width(), 64);
        assert_eq!(key.source().path(), "/images/my_cat_photo.jpg");
    }

    #[test]
    fn test_query_participates_in_search() {
        let key = VariantKey::decode(&url("http://minio:9000/images/cat.jpg?v=2_320")).unwrap();
        assert_eq!(key.width(), 320);
        assert_eq!(key.source().path(), "/images/cat.jpg");
        assert_eq!(key.source().query(), Some("v=2"));

        // A delimiter in the path followed by a query is not a width
        assert!(VariantKey::decode(&url("http://minio:9000/images/cat.jpg_320?v=2")).is_none());
    }

    #[test]
    fn test_rejects_non_positive_or_non_numeric() {
        for requested in [
            "http://minio:9000/images/cat.jpg_abc",
            "http://minio:9000/images/cat.jpg_-5",
            "http://minio:9000/images/cat.jpg_+5",
            "http://minio:9000/images/cat.jpg_0",
            "http://minio:9000/images/cat.jpg_",
            "http://minio:9000/images/cat.jpg_12px",
            "http://minio:9000/images/cat.jpg_99999999999",
        ] {
            assert!(VariantKey::decode_str(requested).is_none(), "{requested}");
        }
    }

    #[test]
    fn test_no_delimiter() {
        assert!(VariantKey::decode(&url("http://minio:9000/images/cat.jpg")).is_none());
    }

    #[test]
    fn test_delimiter_at_start_is_not_a_position() {
        assert!(VariantKey::decode_str("_200").is_none());
    }

    #[test]
    fn test_prefix_must_be_a_url() {
        assert!(VariantKey::decode_str("cat.jpg_200").is_none());
    }

    #[test]
    fn test_display_matches_wire_format() {
        let key = VariantKey::new(url("http://minio:9000/images/cat.jpg"), 120).unwrap();
        assert_eq!(key.to_string(), "http://minio:9000/images/cat.jpg_120");
        assert_eq!(VariantKey::decode_str(&key.to_string()), Some(key));
        assert!(VariantKey::new(url("http://minio:9000/a.png"), 0).is_none());
    }
}
