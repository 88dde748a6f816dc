//! HTTP verbs.

use std::fmt;
use std::str::FromStr;

use crate::parser::error::Error;

/// HTTP verbs accepted by the server, including a few non-standard ones kept for
/// compatibility with older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    COPY,
    HEAD,
    OPTIONS,
    LINK,
    UNLINK,
    PURGE,
    LOCK,
    UNLOCK,
    PROPFIND,
    VIEW,
}

impl Verb {
    /// Every verb, in declaration order.
    pub const ALL: [Verb; 15] = [
        Verb::GET,
        Verb::POST,
        Verb::PUT,
        Verb::PATCH,
        Verb::DELETE,
        Verb::COPY,
        Verb::HEAD,
        Verb::OPTIONS,
        Verb::LINK,
        Verb::UNLINK,
        Verb::PURGE,
        Verb::LOCK,
        Verb::UNLOCK,
        Verb::PROPFIND,
        Verb::VIEW,
    ];

    /// The upper-case token for this verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::GET => "GET",
            Verb::POST => "POST",
            Verb::PUT => "PUT",
            Verb::PATCH => "PATCH",
            Verb::DELETE => "DELETE",
            Verb::COPY => "COPY",
            Verb::HEAD => "HEAD",
            Verb::OPTIONS => "OPTIONS",
            Verb::LINK => "LINK",
            Verb::UNLINK => "UNLINK",
            Verb::PURGE => "PURGE",
            Verb::LOCK => "LOCK",
            Verb::UNLOCK => "UNLOCK",
            Verb::PROPFIND => "PROPFIND",
            Verb::VIEW => "VIEW",
        }
    }
}

// Verbs are matched case-insensitively
impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Verb::ALL
            .iter()
            .copied()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| Error::InvalidVerb(s.to_string()))
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
