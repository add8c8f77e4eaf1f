//! Security limits and constants for the rewriting engine
//!
//! These limits bound the work a single message can cause, while the
//! defaults stay well clear of anything a legitimate message needs.

/// Maximum SIP message size we'll accept for rewriting
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Maximum number of headers scanned in a single message
pub const MAX_HEADERS: usize = 256;

/// Maximum length of a header name given to a rewriter
pub const MAX_HEADER_NAME_LEN: usize = 252;

/// Maximum number of capture groups a substitution may reference
pub const MAX_BACKREFS: usize = 10;

/// Default byte budget for lump payloads and records, per message
pub const DEFAULT_ARENA_BUDGET: usize = 1024 * 1024;

/// Default maximum number of live lumps, per message
pub const DEFAULT_MAX_LUMPS: usize = 4096;

/// Default maximum number of matches one substitution run may produce
pub const DEFAULT_MAX_MATCHES: usize = 1024;

/// Boundary used when converting a body to multipart without one
pub const DEFAULT_BOUNDARY: &str = "unique-boundary-1";

/// Content type assumed for a new body part when none is given
pub const DEFAULT_PART_CONTENT_TYPE: &str = "text/plain";

/// Content type assumed for a body when the message has no Content-Type
pub const DEFAULT_BODY_CONTENT_TYPE: &str = "application/sdp";

/// Per-message engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteLimits {
    pub max_message_size: usize,
    /// Bytes of lump payload (plus record overhead) allowed before OutOfMemory
    pub arena_budget: usize,
    pub max_lumps: usize,
    /// Matches a single rewriter call may record before failing
    pub max_matches: usize,
    pub default_boundary: String,
    pub default_part_content_type: String,
}

impl Default for RewriteLimits {
    fn default() -> Self {
        RewriteLimits {
            max_message_size: MAX_MESSAGE_SIZE,
            arena_budget: DEFAULT_ARENA_BUDGET,
            max_lumps: DEFAULT_MAX_LUMPS,
            max_matches: DEFAULT_MAX_MATCHES,
            default_boundary: DEFAULT_BOUNDARY.to_string(),
            default_part_content_type: DEFAULT_PART_CONTENT_TYPE.to_string(),
        }
    }
}

impl RewriteLimits {
    /// Limits with a custom arena budget, everything else default
    pub fn with_arena_budget(arena_budget: usize) -> Self {
        RewriteLimits {
            arena_budget,
            ..Default::default()
        }
    }
}
