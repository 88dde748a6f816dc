//! `multipart/form-data` bodies.

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    /// The `name` parameter of Content-Disposition.
    pub name: Option<String>,
    /// The `filename` parameter of Content-Disposition, set for file uploads.
    pub filename: Option<String>,
    /// The part's Content-Type header.
    pub content_type: Option<String>,
    /// The raw Content-Disposition value.
    pub content_disposition: Option<String>,
    /// The part body.
    pub data: Vec<u8>,
}

/// Extract the boundary parameter from a Content-Type value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Split a multipart body into its parts.
///
/// The boundary comes from the Content-Type header; without one, the first line of the
/// body is taken as the delimiter. Malformed parts are skipped.
pub fn parse_multipart(body: &[u8], content_type: Option<&str>) -> Vec<FormPart> {
    let delimiter = match content_type.and_then(boundary_from_content_type) {
        Some(boundary) => format!("--{boundary}").into_bytes(),
        None => {
            let first_line = body.split(|&b| b == b'\n').next().unwrap_or_default();
            trim_crlf(first_line).to_vec()
        }
    };
    if delimiter.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    for section in split_on(body, &delimiter).into_iter().skip(1) {
        // "--" right after a delimiter closes the body
        if section.starts_with(b"--") {
            break;
        }
        if let Some(part) = parse_part(section) {
            parts.push(part);
        }
    }

    parts
}

fn parse_part(section: &[u8]) -> Option<FormPart> {
    let section = section
        .strip_prefix(b"\r\n")
        .or_else(|| section.strip_prefix(b"\n"))
        .unwrap_or(section);
    let (end, separator) = find(section, b"\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| find(section, b"\n\n").map(|i| (i, 2)))?;
    let (head, data) = (&section[..end], &section[end + separator..]);

    let mut part = FormPart {
        name: None,
        filename: None,
        content_type: None,
        content_disposition: None,
        data: trim_crlf(data).to_vec(),
    };

    for line in String::from_utf8_lossy(head).lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("Content-Disposition") {
            part.content_disposition = Some(value.to_string());
            for param in value.split(';').skip(1) {
                if let Some((key, val)) = param.trim().split_once('=') {
                    let val = val.trim().trim_matches('"').to_string();
                    match key.trim() {
                        "name" => part.name = Some(val),
                        "filename" => part.filename = Some(val),
                        _ => {}
                    }
                }
            }
        } else if name.trim().eq_ignore_ascii_case("Content-Type") {
            part.content_type = Some(value.to_string());
        }
    }

    Some(part)
}

fn trim_crlf(data: &[u8]) -> &[u8] {
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    data.strip_suffix(b"\r").unwrap_or(data)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn split_on<'a>(mut haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    while let Some(i) = find(haystack, needle) {
        sections.push(&haystack[..i]);
        haystack = &haystack[i + needle.len()..];
    }
    sections.push(haystack);
    sections
}
