//! Path normalization and URL component extraction.
//!
//! Route matching compares normalized paths only: lower-case, wrapped in `/` on both
//! ends. The helpers here also split a request target into its path, segments and
//! querystring.

use std::collections::HashMap;

use crate::parser::error::Error;
use crate::parser::method::Verb;

/// Normalize a path for route matching.
///
/// The result always starts and ends with `/` and is lower-case. An empty or
/// whitespace-only path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = String::with_capacity(trimmed.len() + 2);

    if !trimmed.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(trimmed);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }

    normalized.to_lowercase()
}

/// Normalize a verb token and a path.
///
/// Fails with [`Error::InvalidVerb`] when the token is not one of [`Verb::ALL`].
pub fn normalize(verb: &str, path: &str) -> Result<(Verb, String), Error> {
    let verb = verb.parse::<Verb>()?;
    Ok((verb, normalize_path(path)))
}

/// Split a request target at the first `?`.
///
/// The querystring is `None` when there is no `?` or nothing follows it.
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path, Some(query)),
        Some((path, _)) => (path, None),
        None => (target, None),
    }
}

/// Ordered, non-empty path segments. Repeated slashes collapse.
pub fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decode a URL-encoded component, treating `+` as a space.
///
/// Invalid escapes leave the component as-is.
pub fn url_decode(component: &str) -> String {
    let spaced = component.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parse a querystring into key/value pairs.
///
/// A key without `=` maps to `None`. Repeated keys have their values joined with a
/// comma rather than overwritten, so `a=1&a=2` yields `"1,2"`.
pub fn parse_query_string(query: &str) -> HashMap<String, Option<String>> {
    let mut entries: HashMap<String, Option<String>> = HashMap::new();

    for pair in query.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (url_decode(k), Some(url_decode(v))),
            None => (url_decode(pair), None),
        };
        if key.is_empty() {
            continue;
        }

        match entries.get_mut(&key) {
            Some(existing) => match (existing.as_mut(), value) {
                (Some(current), Some(value)) => {
                    current.push(',');
                    current.push_str(&value);
                }
                (None, Some(value)) => *existing = Some(value),
                (_, None) => {}
            },
            None => {
                entries.insert(key, value);
            }
        }
    }

    entries
}

/// Insert a header, comma-joining onto an existing entry with the same name.
///
/// Names compare case-insensitively; the first spelling seen is kept.
pub fn insert_joined(headers: &mut HashMap<String, String>, name: &str, value: &str) {
    if name.is_empty() {
        return;
    }

    let existing = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v);

    match existing {
        Some(current) => {
            current.push(',');
            current.push_str(value);
        }
        None => {
            headers.insert(name.to_string(), value.to_string());
        }
    }
}
