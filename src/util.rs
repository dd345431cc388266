use std::collections::HashMap;

pub fn is_url(path: &str) -> bool {
    if let Some(index) = path.find("://") {
        path[..index].chars().all(|ch| ch.is_ascii_alphabetic()) && index > 0
    } else {
        false
    }
}

/// Case-insensitive lookup into a header map collected off a response.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Parses the end index out of a `Range: bytes=0-{N}` header.
pub fn parse_range_end(range: &str) -> Option<u64> {
    range
        .trim()
        .strip_prefix("bytes=0-")
        .and_then(|end| end.trim().parse::<u64>().ok())
}
