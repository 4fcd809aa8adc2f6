//! Virtual-path encoding for restricted identities.
//!
//! A restricted identity sees its authorized roots as a flat top-level
//! listing. A root nested at `a/b/c` is presented as a single name
//! `<B(a/b)>-c`, where `B` is unpadded URL-safe base64 with alphabet index 62
//! written as `~` instead of `-`. The encoded parent therefore never contains
//! the `-` delimiter, and the split in [`decode`] is unambiguous.
//!
//! Canonical rules:
//!
//! - paths are relative; a leading `/` is ignored and empty segments dropped
//! - `encode(p)` is `p` itself when `p` has fewer than two segments
//! - `decode(s)` splits at the first `-`; if the prefix is a canonical
//!   encoding of a UTF-8 path with non-empty segments the result is
//!   `decoded_prefix/suffix`, otherwise `s` is a plain name returned unchanged
//!
//! `decode(encode(p)) == p` holds for every path with at least two segments,
//! and [`try_decode`] only accepts names with `encode(decode(s)) == s`.
//!
//! A plain name can still look like a token (`aA-x` is the encoding of
//! `h/x`). Callers that know the literal names in play, such as the
//! authorized roots of an identity, resolve that case themselves.

use base64::Engine;
use base64::alphabet::Alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig, DecodePaddingMode};

const DELIMITER: char = '-';

const VPATH_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789~_") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("invalid virtual path alphabet"),
    };

const VPATH_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &VPATH_ALPHABET,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(false),
);

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Normalizes a relative path: no leading or trailing `/`, no empty segments.
pub fn normalize(path: &str) -> String {
    segments(path).join("/")
}

/// Encodes a relative path into its flat virtual name.
pub fn encode(path: &str) -> String {
    let parts = segments(path);
    match parts.split_last() {
        Some((last, parent)) if !parent.is_empty() => {
            let prefix = VPATH_ENGINE.encode(parent.join("/"));
            format!("{prefix}{DELIMITER}{last}")
        }
        _ => parts.join("/"),
    }
}

/// Decodes a single virtual name back into a relative path.
///
/// Names that are not canonical encodings are returned unchanged.
pub fn decode(name: &str) -> String {
    try_decode(name).unwrap_or_else(|| name.to_string())
}

/// Returns the decoded path if `name` is a canonical virtual name.
pub fn try_decode(name: &str) -> Option<String> {
    let (prefix, last) = name.split_once(DELIMITER)?;
    if prefix.is_empty() || last.is_empty() || last.contains('/') {
        return None;
    }
    let bytes = VPATH_ENGINE.decode(prefix).ok()?;
    let parent = String::from_utf8(bytes).ok()?;
    if parent.split('/').any(str::is_empty) {
        return None;
    }
    let decoded = format!("{parent}/{last}");
    (encode(&decoded) == name).then_some(decoded)
}

/// Decodes a client path whose first component may be a virtual name.
///
/// `/<token>/rest/of/path` becomes `decoded/rest/of/path`. The result is
/// normalized and relative; the root decodes to the empty string.
pub fn decode_path(client_path: &str) -> String {
    let parts = segments(client_path);
    let Some((first, rest)) = parts.split_first() else {
        return String::new();
    };
    let mut decoded = decode(first);
    for part in rest {
        decoded.push('/');
        decoded.push_str(part);
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_segment_is_identity() {
        assert_eq!(encode("docs"), "docs");
        assert_eq!(encode("/docs/"), "docs");
        assert_eq!(decode("docs"), "docs");
    }

    #[test]
    fn nested_path_hides_parent() {
        let token = encode("team/finance/reports");
        assert!(token.ends_with("-reports"));
        assert!(!token.contains('/'));
        assert_eq!(decode(&token), "team/finance/reports");
    }

    #[test]
    fn hyphenated_leaf_survives() {
        let token = encode("a/my-file-v2");
        assert_eq!(decode(&token), "a/my-file-v2");
    }

    #[test]
    fn parent_that_encodes_to_index_62() {
        // '>' and '~' produce the 62nd alphabet symbol in standard base64url
        let path = "x>~/leaf";
        let token = encode(path);
        let (prefix, _) = token.split_once('-').unwrap();
        assert!(!prefix.contains('-'));
        assert_eq!(decode(&token), path);
    }

    #[test]
    fn non_utf8_or_non_canonical_prefix_is_plain_name() {
        assert_eq!(decode("my-docs"), "my-docs");
        assert_eq!(decode("-leading"), "-leading");
        assert_eq!(decode("trailing-"), "trailing-");
    }

    #[test]
    fn accepted_tokens_are_canonical() {
        assert_eq!(try_decode("aA-x").as_deref(), Some("h/x"));
        assert_eq!(encode("h/x"), "aA-x");
        // trailing bits set: not what encode would produce
        assert_eq!(try_decode("aB-x"), None);
        assert_eq!(decode("aB-x"), "aB-x");
    }

    #[test]
    fn decode_path_expands_first_component() {
        let token = encode("projects/alpha");
        assert_eq!(decode_path(&format!("/{token}/src/main.rs")), "projects/alpha/src/main.rs");
        assert_eq!(decode_path("/plain/dir"), "plain/dir");
        assert_eq!(decode_path("/"), "");
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9._~>\u{4e00}-\u{4e2f}-]{1,12}"
    }

    proptest! {
        #[test]
        fn round_trip_multi_segment(parts in prop::collection::vec(segment(), 2..6)) {
            let path = parts.join("/");
            let token = encode(&path);
            prop_assert_eq!(decode(&token), path);
            prop_assert_eq!(encode(&decode(&token)), token);
        }

        #[test]
        fn single_segment_maps_to_itself(part in segment()) {
            prop_assert_eq!(encode(&part), part);
        }
    }
}
