//! Recognizing record files by name.
//!
//! A record lives in `<id>.geojson`; alternate geometries for the same record
//! live in `<id>-alt-<label>.geojson`. Anything else in a repository is not a
//! record as far as the indexing sinks are concerned.

use std::path::Path;

fn split_stem(path: &str) -> Option<(&str, Option<&str>)> {
    let path = Path::new(path);
    if path.extension().and_then(|e| e.to_str()) != Some("geojson") {
        return None;
    }

    let stem = path.file_stem()?.to_str()?;
    let (id, rest) = match stem.split_once('-') {
        Some((id, rest)) => (id, Some(rest)),
        None => (stem, None),
    };

    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some((id, rest))
}

/// True for `<id>.geojson` and `<id>-alt-<label>.geojson`.
pub fn is_record_file(path: &str) -> bool {
    match split_stem(path) {
        Some((_, None)) => true,
        Some((_, Some(rest))) => alt_label(rest).is_some(),
        None => false,
    }
}

/// True for `<id>-alt-<label>.geojson` only.
pub fn is_alt_file(path: &str) -> bool {
    matches!(split_stem(path), Some((_, Some(rest))) if alt_label(rest).is_some())
}

/// Numeric id encoded in a record file name.
pub fn record_id(path: &str) -> Option<i64> {
    if !is_record_file(path) {
        return None;
    }
    split_stem(path).and_then(|(id, _)| id.parse().ok())
}

fn alt_label(rest: &str) -> Option<&str> {
    rest.strip_prefix("alt-").filter(|label| !label.is_empty())
}
