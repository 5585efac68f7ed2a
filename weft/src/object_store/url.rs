//! Object URL construction and `gs://` path handling.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Scheme prefix of object-store paths.
pub const OBJECT_PATH_SCHEME: &str = "gs://";

/// Everything outside the URL-unreserved set gets percent-encoded, slashes
/// in object names included, since the name is a single path segment.
const OBJECT_NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Builds the media-download URL for an object:
/// `{base}/storage/v1/b/{bucket}/o/{urlencoded-object}?alt=media`.
pub fn object_url(base_url: &str, bucket: &str, object: &str) -> String {
    format!(
        "{}/storage/v1/b/{}/o/{}?alt=media",
        base_url.trim_end_matches('/'),
        bucket,
        utf8_percent_encode(object, OBJECT_NAME_ENCODE_SET)
    )
}

/// Returns whether `path` looks like a `gs://bucket/object` path.
pub fn is_object_path(path: &str) -> bool {
    path.starts_with(OBJECT_PATH_SCHEME)
}

/// Splits `gs://bucket/object/name` into `("bucket", "object/name")`.
/// A bare `gs://bucket` yields an empty object name.
pub fn split_object_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(OBJECT_PATH_SCHEME)?;
    match rest.find('/') {
        Some(pos) => Some((&rest[..pos], &rest[pos + 1..])),
        None => Some((rest, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_plain_name() {
        assert_eq!(
            object_url("https://storage.example.com", "logs", "day1.txt"),
            "https://storage.example.com/storage/v1/b/logs/o/day1.txt?alt=media"
        );
    }

    #[test]
    fn test_object_url_encodes_slashes_and_spaces() {
        assert_eq!(
            object_url("https://storage.example.com/", "b", "dir/file name.txt"),
            "https://storage.example.com/storage/v1/b/b/o/dir%2Ffile%20name.txt?alt=media"
        );
    }

    #[test]
    fn test_split_object_path() {
        assert_eq!(
            split_object_path("gs://bucket/a/b/c.txt"),
            Some(("bucket", "a/b/c.txt"))
        );
        assert_eq!(split_object_path("gs://bucket"), Some(("bucket", "")));
        assert_eq!(split_object_path("/local/file"), None);
    }

    #[test]
    fn test_is_object_path() {
        assert!(is_object_path("gs://bucket/x"));
        assert!(!is_object_path("s3://bucket/x"));
    }
}
