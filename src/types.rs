//! Common types and enums used throughout the rewriting engine

use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// A byte range within the original message buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    /// Create a new TextRange
    pub fn new(start: usize, end: usize) -> Self {
        TextRange { start, end }
    }

    /// Get the bytes this range represents
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }

    /// Get the length of this range
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Check if this range is empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// Well-known SIP header types, parsed from full or compact names
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum HeaderType {
    #[strum(serialize = "Via", serialize = "v")]
    Via,
    #[strum(serialize = "From", serialize = "f")]
    From,
    #[strum(serialize = "To", serialize = "t")]
    To,
    #[strum(serialize = "Call-ID", serialize = "i")]
    CallId,
    #[strum(serialize = "CSeq")]
    CSeq,
    #[strum(serialize = "Contact", serialize = "m")]
    Contact,
    #[strum(serialize = "Max-Forwards")]
    MaxForwards,
    #[strum(serialize = "Route")]
    Route,
    #[strum(serialize = "Record-Route")]
    RecordRoute,
    #[strum(serialize = "Content-Type", serialize = "c")]
    ContentType,
    #[strum(serialize = "Content-Length", serialize = "l")]
    ContentLength,
    #[strum(serialize = "Content-Disposition")]
    ContentDisposition,
    #[strum(serialize = "Content-Encoding", serialize = "e")]
    ContentEncoding,
    #[strum(serialize = "Mime-Version")]
    MimeVersion,
    #[strum(serialize = "Expires")]
    Expires,
    #[strum(serialize = "Supported", serialize = "k")]
    Supported,
    #[strum(serialize = "Require")]
    Require,
    #[strum(serialize = "Allow")]
    Allow,
    #[strum(serialize = "Event", serialize = "o")]
    Event,
    #[strum(serialize = "Subject", serialize = "s")]
    Subject,
    #[strum(serialize = "User-Agent")]
    UserAgent,
    #[strum(serialize = "Server")]
    Server,
    #[strum(serialize = "Authorization")]
    Authorization,
    #[strum(serialize = "Proxy-Authorization")]
    ProxyAuthorization,
    #[strum(serialize = "WWW-Authenticate")]
    WwwAuthenticate,
    #[strum(serialize = "Proxy-Authenticate")]
    ProxyAuthenticate,
    #[strum(serialize = "Refer-To", serialize = "r")]
    ReferTo,
    #[strum(serialize = "Diversion")]
    Diversion,
    #[strum(serialize = "P-Asserted-Identity")]
    PAssertedIdentity,
    #[strum(default)]
    Other(String),
}

impl HeaderType {
    /// Classify a raw header name
    pub fn from_name(name: &[u8]) -> HeaderType {
        match std::str::from_utf8(name) {
            // Other is the default variant, so parsing never fails
            Ok(s) => HeaderType::from_str(s.trim()).unwrap_or_else(|_| HeaderType::Other(s.to_string())),
            Err(_) => HeaderType::Other(String::from_utf8_lossy(name).into_owned()),
        }
    }

    /// Canonical (long form) header name
    pub fn canonical_name(&self) -> &str {
        match self {
            HeaderType::Via => "Via",
            HeaderType::From => "From",
            HeaderType::To => "To",
            HeaderType::CallId => "Call-ID",
            HeaderType::CSeq => "CSeq",
            HeaderType::Contact => "Contact",
            HeaderType::MaxForwards => "Max-Forwards",
            HeaderType::Route => "Route",
            HeaderType::RecordRoute => "Record-Route",
            HeaderType::ContentType => "Content-Type",
            HeaderType::ContentLength => "Content-Length",
            HeaderType::ContentDisposition => "Content-Disposition",
            HeaderType::ContentEncoding => "Content-Encoding",
            HeaderType::MimeVersion => "Mime-Version",
            HeaderType::Expires => "Expires",
            HeaderType::Supported => "Supported",
            HeaderType::Require => "Require",
            HeaderType::Allow => "Allow",
            HeaderType::Event => "Event",
            HeaderType::Subject => "Subject",
            HeaderType::UserAgent => "User-Agent",
            HeaderType::Server => "Server",
            HeaderType::Authorization => "Authorization",
            HeaderType::ProxyAuthorization => "Proxy-Authorization",
            HeaderType::WwwAuthenticate => "WWW-Authenticate",
            HeaderType::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderType::ReferTo => "Refer-To",
            HeaderType::Diversion => "Diversion",
            HeaderType::PAssertedIdentity => "P-Asserted-Identity",
            HeaderType::Other(name) => name,
        }
    }

    pub fn is_other(&self) -> bool {
        matches!(self, HeaderType::Other(_))
    }
}

impl fmt::Display for HeaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

/// How a rewriter identifies the headers it targets. Decided once when
/// the parameter is prepared, never per message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeaderMatcher {
    /// Well-known header, compared by type tag
    ByType(HeaderType),
    /// Unknown header, compared by case-insensitive name
    ByName(String),
}

impl HeaderMatcher {
    pub fn from_name(name: &str) -> HeaderMatcher {
        match HeaderType::from_name(name.as_bytes()) {
            HeaderType::Other(other) => HeaderMatcher::ByName(other),
            htype => HeaderMatcher::ByType(htype),
        }
    }

    /// Check a parsed header against this matcher
    pub fn matches(&self, htype: &HeaderType, name: &[u8]) -> bool {
        match self {
            HeaderMatcher::ByType(wanted) => wanted == htype,
            HeaderMatcher::ByName(wanted) => {
                htype.is_other() && name.eq_ignore_ascii_case(wanted.as_bytes())
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            HeaderMatcher::ByType(htype) => htype.canonical_name(),
            HeaderMatcher::ByName(name) => name,
        }
    }
}

/// Non-error result of a rewriting primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Operation matched and recorded its edits (count of matches/edits)
    Applied(usize),
    /// Nothing matched, message untouched
    NotFound,
    /// Positional lookup past the last occurrence, message untouched
    IndexOutOfRange,
}

impl Outcome {
    /// Signed result code: 1 on success, -1 not found, 2 index out of range
    pub fn code(&self) -> i32 {
        match self {
            Outcome::Applied(_) => 1,
            Outcome::NotFound => -1,
            Outcome::IndexOutOfRange => 2,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn count(&self) -> usize {
        match self {
            Outcome::Applied(n) => *n,
            _ => 0,
        }
    }

    /// Applied when `n > 0`, NotFound otherwise
    pub fn from_count(n: usize) -> Outcome {
        if n > 0 {
            Outcome::Applied(n)
        } else {
            Outcome::NotFound
        }
    }
}

/// Which of several matching headers a header-scoped rewriter touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
pub enum HfSelect {
    #[default]
    #[strum(serialize = "a")]
    All,
    #[strum(serialize = "f")]
    First,
    #[strum(serialize = "l")]
    Last,
}

/// Replacement multiplicity for literal substring replace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
pub enum ReplaceMode {
    #[strum(serialize = "f")]
    First,
    #[default]
    #[strum(serialize = "a")]
    All,
}

/// Value predicate for `remove_hf_match`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum MatchOp {
    /// Header body equals the operand
    #[strum(serialize = "eq")]
    Eq,
    /// Header body differs from the operand
    #[strum(serialize = "ne")]
    Ne,
    /// Header body contains the operand
    #[strum(serialize = "in")]
    In,
    /// Header body matches the operand as a pattern
    #[strum(serialize = "re")]
    Re,
}
