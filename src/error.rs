//! Error handling for the rewriting engine
//!
//! One error type for every failure class a rewrite primitive can report.
//! "Not found" is not an error: rewriters return [`crate::types::Outcome`]
//! for that case and reserve `TextopsError` for real failures.

use std::error::Error as StdError;
use std::fmt;

/// Unified error type for rewriting operations
#[derive(Debug, Clone, PartialEq)]
pub enum TextopsError {
    /// Pattern or substitution expression could not be compiled
    BadPattern {
        pattern: String,
        reason: String,
    },

    /// Structural expectation violated (missing CRLF, empty match, ...)
    Malformed {
        message: String,
        position: Option<usize>, // byte offset into the scanned buffer
        context: Option<String>,
    },

    /// Per-message arena exhausted
    ResourceError {
        resource_type: ResourceType,
        current_usage: u64,
        limit: u64,
    },

    /// Edit range falls outside the original buffer
    InvalidRange {
        offset: usize,
        length: usize,
        buffer_len: usize,
    },

    /// Delete overlaps a range already deleted in the same edit list
    OverlappingEdit {
        offset: usize,
        length: usize,
        existing: (usize, usize),
    },

    /// Caller supplied a parameter the operation cannot use
    InvalidParam {
        name: String,
        reason: String,
    },

    /// Operation is not valid in the current message state
    StateError {
        operation: String,
        reason: String,
        context: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Memory,
    Lumps,
    Matches,
}

impl fmt::Display for TextopsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextopsError::BadPattern { pattern, reason } => {
                write!(f, "Bad pattern '{}': {}", pattern, reason)
            }
            TextopsError::Malformed { message, position, context } => {
                write!(f, "Malformed message: {}", message)?;
                if let Some(pos) = position {
                    write!(f, " at offset {}", pos)?;
                }
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            TextopsError::ResourceError { resource_type, current_usage, limit } => {
                write!(f, "Resource exhaustion: {:?} usage {} exceeds limit {}",
                       resource_type, current_usage, limit)
            }
            TextopsError::InvalidRange { offset, length, buffer_len } => {
                write!(f, "Invalid range: [{}, {}) outside buffer of {} bytes",
                       offset, offset + length, buffer_len)
            }
            TextopsError::OverlappingEdit { offset, length, existing } => {
                write!(f, "Overlapping delete: [{}, {}) overlaps [{}, {})",
                       offset, offset + length, existing.0, existing.1)
            }
            TextopsError::InvalidParam { name, reason } => {
                write!(f, "Invalid parameter {}: {}", name, reason)
            }
            TextopsError::StateError { operation, reason, context } => {
                write!(f, "State error: {} failed - {}", operation, reason)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for TextopsError {}

impl TextopsError {
    /// Create a pattern compilation error
    pub fn bad_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        TextopsError::BadPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-input error with optional byte offset
    pub fn malformed(message: impl Into<String>, position: Option<usize>, context: Option<String>) -> Self {
        TextopsError::Malformed {
            message: message.into(),
            position,
            context,
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_error(resource_type: ResourceType, current: u64, limit: u64) -> Self {
        TextopsError::ResourceError {
            resource_type,
            current_usage: current,
            limit,
        }
    }

    pub fn invalid_param(name: impl Into<String>, reason: impl Into<String>) -> Self {
        TextopsError::InvalidParam {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a state error
    pub fn state_error(operation: impl Into<String>, reason: impl Into<String>, context: Option<String>) -> Self {
        TextopsError::StateError {
            operation: operation.into(),
            reason: reason.into(),
            context,
        }
    }

    /// Check if the caller may continue processing the message
    pub fn is_recoverable(&self) -> bool {
        match self {
            TextopsError::BadPattern { .. } => false,
            TextopsError::Malformed { .. } => true,
            TextopsError::ResourceError { .. } => false,
            TextopsError::InvalidRange { .. } => true,
            TextopsError::OverlappingEdit { .. } => true,
            TextopsError::InvalidParam { .. } => true,
            TextopsError::StateError { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TextopsError::BadPattern { .. } => "pattern",
            TextopsError::Malformed { .. } => "malformed",
            TextopsError::ResourceError { .. } => "resource",
            TextopsError::InvalidRange { .. } => "range",
            TextopsError::OverlappingEdit { .. } => "overlap",
            TextopsError::InvalidParam { .. } => "param",
            TextopsError::StateError { .. } => "state",
        }
    }

    /// Signed result code. Always below -1 so it never collides with
    /// "not found" (-1) or any success code.
    pub fn code(&self) -> i32 {
        match self {
            TextopsError::BadPattern { .. } => -2,
            TextopsError::Malformed { .. } => -3,
            TextopsError::ResourceError { .. } => -4,
            TextopsError::InvalidRange { .. } => -5,
            TextopsError::OverlappingEdit { .. } => -6,
            TextopsError::InvalidParam { .. } => -7,
            TextopsError::StateError { .. } => -8,
        }
    }
}

impl From<regex::Error> for TextopsError {
    fn from(err: regex::Error) -> Self {
        match err {
            regex::Error::Syntax(reason) => TextopsError::bad_pattern("", reason),
            regex::Error::CompiledTooBig(limit) => {
                TextopsError::resource_error(ResourceType::Memory, limit as u64 + 1, limit as u64)
            }
            other => TextopsError::bad_pattern("", other.to_string()),
        }
    }
}

/// Result type for rewriting operations
pub type TextopsResult<T> = Result<T, TextopsError>;
