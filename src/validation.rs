//! Input validation for values written into messages
//!
//! Rejects header names that are not tokens, values that would smuggle in
//! extra lines, and malformed hex or numeric parameters.

use crate::error::{TextopsError, TextopsResult};
use crate::limits::MAX_HEADER_NAME_LEN;

/// RFC 3261 token characters
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b)
}

/// Validate a header name used for lookup or insertion
pub fn validate_header_name(name: &str) -> TextopsResult<()> {
    if name.is_empty() {
        return Err(TextopsError::invalid_param("header name", "empty"));
    }
    if name.len() > MAX_HEADER_NAME_LEN {
        return Err(TextopsError::invalid_param(
            "header name",
            format!("{} bytes exceeds {}", name.len(), MAX_HEADER_NAME_LEN),
        ));
    }
    if let Some(bad) = name.bytes().find(|b| !is_token_char(*b)) {
        return Err(TextopsError::invalid_param(
            "header name",
            format!("invalid character {:?}", bad as char),
        ));
    }
    Ok(())
}

/// Validate a header value for injection attacks
pub fn validate_header_value(value: &[u8]) -> TextopsResult<()> {
    // CRLF injection
    if value.iter().any(|b| *b == b'\r' || *b == b'\n') {
        return Err(TextopsError::invalid_param("header value", "line break in header value"));
    }
    if value.contains(&0) {
        return Err(TextopsError::invalid_param("header value", "null byte in header value"));
    }
    Ok(())
}

/// Validate complete header text to be inserted: one or more lines,
/// each `Name: value` and CRLF-terminated
pub fn validate_header_block(text: &[u8]) -> TextopsResult<()> {
    if text.is_empty() {
        return Err(TextopsError::invalid_param("header", "empty"));
    }
    if !text.ends_with(b"\r\n") {
        return Err(TextopsError::invalid_param("header", "must end with CRLF"));
    }
    if text.contains(&0) {
        return Err(TextopsError::invalid_param("header", "null byte in header"));
    }
    for line in text[..text.len() - 2].split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // continuation lines
        if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
            continue;
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| TextopsError::invalid_param("header", "line without ':'"))?;
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| TextopsError::invalid_param("header name", "not UTF-8"))?;
        validate_header_name(name.trim_end())?;
    }
    Ok(())
}

/// Validate a multipart boundary delimiter
pub fn validate_boundary(delimiter: &str) -> TextopsResult<()> {
    if delimiter.is_empty() {
        return Err(TextopsError::invalid_param("boundary", "empty"));
    }
    if delimiter.starts_with('-') {
        return Err(TextopsError::invalid_param("boundary", "must not start with '-'"));
    }
    if delimiter.len() > 70 {
        return Err(TextopsError::invalid_param("boundary", "longer than 70 characters"));
    }
    if delimiter.bytes().any(|b| b.is_ascii_control() || b == b'"') {
        return Err(TextopsError::invalid_param("boundary", "invalid character"));
    }
    Ok(())
}

/// Validate numeric parameter values
pub fn validate_numeric(name: &str, value: &str, min: Option<i64>, max: Option<i64>) -> TextopsResult<i64> {
    let num = value
        .trim()
        .parse::<i64>()
        .map_err(|_| TextopsError::invalid_param(name, format!("not a number: {}", value)))?;

    if let Some(min_val) = min {
        if num < min_val {
            return Err(TextopsError::invalid_param(name, format!("value {} is below minimum {}", num, min_val)));
        }
    }
    if let Some(max_val) = max {
        if num > max_val {
            return Err(TextopsError::invalid_param(name, format!("value {} exceeds maximum {}", num, max_val)));
        }
    }
    Ok(num)
}
