//! Forward scanners that locate headers, the body and MIME parts
//!
//! Nothing here builds a parse tree: every function walks lines of the
//! original buffer and hands back byte ranges. In the start line, headers,
//! part headers and delimiter lines, a line that runs off the scanned
//! region without a terminator, or a CR not followed by LF, is malformed
//! input. Part content is searched for delimiters, never split into lines.

use crate::error::{TextopsError, TextopsResult};
use crate::limits::MAX_HEADERS;
use crate::strops::find_bytes;
use crate::types::{HeaderMatcher, HeaderType, TextRange};

/// A SIP header located in the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub htype: HeaderType,
    pub name: TextRange,
    /// Value with surrounding whitespace and terminator trimmed
    pub body: TextRange,
    /// Whole header, continuation lines and terminator included
    pub line: TextRange,
}

/// Result of scanning the header section
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    pub fields: Vec<HeaderField>,
    /// Start of the empty line ending the headers, or buffer end if none
    pub eoh: usize,
    /// First byte after the empty line
    pub body_start: Option<usize>,
}

/// A header-like line found by a raw scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLine {
    pub line: TextRange,
    pub name: TextRange,
    pub value: TextRange,
}

/// A `--boundary` delimiter line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryLine {
    /// Line including its terminator
    pub line: TextRange,
    /// `--boundary--`
    pub closing: bool,
}

/// One part of a multipart body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Opening delimiter line
    pub delimiter: TextRange,
    /// Part header block, without the empty line
    pub headers: TextRange,
    /// Part content, without the line break owned by the next delimiter
    pub content: TextRange,
    /// Start of the next delimiter line (or body end)
    pub end: usize,
    pub content_type: Option<TextRange>,
}

/// Parts of a multipart body plus its closing delimiter, if present
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    pub parts: Vec<BodyPart>,
    pub closing: Option<BoundaryLine>,
}

/// Offset just past the LF ending the line that contains `from`
pub fn line_end(buf: &[u8], from: usize, limit: usize) -> TextopsResult<usize> {
    let limit = limit.min(buf.len());
    let mut i = from;
    while i < limit {
        match buf[i] {
            b'\n' => return Ok(i + 1),
            b'\r' if i + 1 < limit && buf[i + 1] == b'\n' => return Ok(i + 2),
            b'\r' => {
                return Err(TextopsError::malformed("CR not followed by LF", Some(i), None));
            }
            _ => i += 1,
        }
    }
    Err(TextopsError::malformed("unterminated line", Some(from), None))
}

/// Length of the terminator at the end of `line` (0, 1 or 2)
pub fn terminator_len(line: &[u8]) -> usize {
    if line.ends_with(b"\r\n") {
        2
    } else if line.ends_with(b"\n") {
        1
    } else {
        0
    }
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn trim_range(buf: &[u8], mut start: usize, mut end: usize) -> TextRange {
    while start < end && matches!(buf[start], b' ' | b'\t') {
        start += 1;
    }
    while end > start && matches!(buf[end - 1], b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    TextRange::new(start, end)
}

/// First byte after the start line
pub fn header_start(buf: &[u8]) -> TextopsResult<usize> {
    line_end(buf, 0, buf.len())
}

/// Scan all SIP headers from `from` up to the empty line
pub fn scan_headers(buf: &[u8], from: usize) -> TextopsResult<HeaderIndex> {
    let mut index = HeaderIndex::default();
    let mut pos = from;
    loop {
        if pos >= buf.len() {
            // headers-only message without the trailing empty line
            index.eoh = buf.len();
            return Ok(index);
        }
        let end = line_end(buf, pos, buf.len())?;
        let line = &buf[pos..end];
        if is_blank_line(line) {
            index.eoh = pos;
            index.body_start = Some(end);
            return Ok(index);
        }
        if matches!(line[0], b' ' | b'\t') {
            // folded continuation of the previous header
            let prev = index.fields.last_mut().ok_or_else(|| {
                TextopsError::malformed("continuation line without header", Some(pos), None)
            })?;
            prev.line.end = end;
            prev.body = trim_range(buf, prev.body.start, end);
            pos = end;
            continue;
        }
        if index.fields.len() >= MAX_HEADERS {
            return Err(TextopsError::malformed(
                format!("more than {} headers", MAX_HEADERS),
                Some(pos),
                None,
            ));
        }
        let header = split_header_line(buf, pos, end)
            .ok_or_else(|| TextopsError::malformed("header line without ':'", Some(pos), None))?;
        index.fields.push(HeaderField {
            htype: HeaderType::from_name(header.name.slice(buf)),
            name: header.name,
            body: header.value,
            line: header.line,
        });
        pos = end;
    }
}

/// Split `[start, end)` into name and value around the first colon
fn split_header_line(buf: &[u8], start: usize, end: usize) -> Option<HeaderLine> {
    let colon = buf[start..end].iter().position(|b| *b == b':')? + start;
    let name = trim_range(buf, start, colon);
    if name.is_empty() {
        return None;
    }
    Some(HeaderLine {
        line: TextRange::new(start, end),
        name,
        value: trim_range(buf, colon + 1, end),
    })
}

/// Find the next header line named by `matcher` inside `region`, starting
/// at line start `from`. Stops at the first empty line. Used for MIME part
/// headers, which the SIP header scan never sees.
pub fn find_header_line(
    buf: &[u8],
    region: TextRange,
    matcher: &HeaderMatcher,
    from: usize,
) -> TextopsResult<Option<HeaderLine>> {
    let mut pos = from;
    while pos < region.end {
        let end = line_end(buf, pos, region.end)?;
        let line = &buf[pos..end];
        if is_blank_line(line) {
            return Ok(None);
        }
        if let Some(header) = split_header_line(buf, pos, end) {
            let name = header.name.slice(buf);
            if matcher.matches(&HeaderType::from_name(name), name) {
                return Ok(Some(header));
            }
        }
        pos = end;
    }
    Ok(None)
}

/// Delimiter line starting at `start`, where `--boundary` was found.
/// `None` when the bytes after the boundary make it an ordinary line.
fn delimiter_line(text: &[u8], start: usize, boundary: &[u8]) -> TextopsResult<Option<BoundaryLine>> {
    let mut i = start + 2 + boundary.len();
    let closing = text[i..].starts_with(b"--");
    if closing {
        i += 2;
    }
    while i < text.len() && matches!(text[i], b' ' | b'\t') {
        i += 1;
    }
    let end = match &text[i..] {
        [] if closing => text.len(),
        [b'\n', ..] => i + 1,
        [b'\r', b'\n', ..] => i + 2,
        [b'\r', ..] => return Err(TextopsError::malformed("CR not followed by LF", Some(i), None)),
        _ => return Ok(None),
    };
    Ok(Some(BoundaryLine { line: TextRange::new(start, end), closing }))
}

/// Find the next delimiter line for `boundary` in `region`, scanning from
/// line start `from`. Part content may hold arbitrary bytes, so only lines
/// that start with `--boundary` are checked for a proper terminator. A
/// closing delimiter may lack its terminator when it ends the region.
pub fn find_boundary(
    buf: &[u8],
    region: TextRange,
    boundary: &[u8],
    from: usize,
) -> TextopsResult<Option<BoundaryLine>> {
    let text = &buf[..region.end.min(buf.len())];
    let needle = [&b"--"[..], boundary].concat();
    let mut pos = from;
    while let Some(at) = find_bytes(text, &needle, pos) {
        if at == from || text[at - 1] == b'\n' {
            if let Some(line) = delimiter_line(text, at, boundary)? {
                return Ok(Some(line));
            }
        }
        pos = at + 1;
    }
    Ok(None)
}

/// Split a multipart body into its parts
pub fn parse_parts(buf: &[u8], body: TextRange, boundary: &[u8]) -> TextopsResult<Multipart> {
    let mut result = Multipart::default();
    let mut current = match find_boundary(buf, body, boundary, body.start)? {
        Some(first) => first,
        None => return Ok(result),
    };
    let content_type = HeaderMatcher::ByType(HeaderType::ContentType);
    loop {
        if current.closing {
            result.closing = Some(current);
            return Ok(result);
        }
        let headers_start = current.line.end;
        let mut pos = headers_start;
        let content_start = loop {
            if pos >= body.end {
                return Err(TextopsError::malformed(
                    "body part without header terminator",
                    Some(headers_start),
                    None,
                ));
            }
            let end = line_end(buf, pos, body.end)?;
            if is_blank_line(&buf[pos..end]) {
                break end;
            }
            pos = end;
        };
        let headers = TextRange::new(headers_start, pos);
        let ctype = find_header_line(buf, headers, &content_type, headers_start)?.map(|h| h.value);

        let next = find_boundary(buf, body, boundary, content_start)?;
        let end = next.map(|b| b.line.start).unwrap_or(body.end);
        let mut content_end = end;
        if next.is_some() {
            content_end -= terminator_len(&buf[content_start..end]);
        }
        result.parts.push(BodyPart {
            delimiter: current.line,
            headers,
            content: TextRange::new(content_start, content_end.max(content_start)),
            end,
            content_type: ctype,
        });
        match next {
            Some(line) => current = line,
            None => return Ok(result),
        }
    }
}

/// `boundary` parameter of a Content-Type value, quotes removed
pub fn boundary_param(ctype: &[u8]) -> Option<&[u8]> {
    for param in ctype.split(|b| *b == b';').skip(1) {
        let Some(eq) = param.iter().position(|b| *b == b'=') else {
            continue;
        };
        let name = trim_bytes(&param[..eq]);
        if name.eq_ignore_ascii_case(b"boundary") {
            let value = trim_bytes(&param[eq + 1..]);
            let value = value
                .strip_prefix(b"\"")
                .and_then(|v| v.strip_suffix(b"\""))
                .unwrap_or(value);
            return if value.is_empty() { None } else { Some(value) };
        }
    }
    None
}

/// Slice without leading and trailing ASCII whitespace
pub fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end.max(start)]
}

pub fn is_multipart(ctype: &[u8]) -> bool {
    ctype.len() >= 10 && ctype[..10].eq_ignore_ascii_case(b"multipart/")
}

/// Content-type prefix match: `value` starts with `wanted` (any case) and
/// the media type ends right there
pub fn content_type_matches(value: &[u8], wanted: &[u8]) -> bool {
    if value.len() < wanted.len() || !value[..wanted.len()].eq_ignore_ascii_case(wanted) {
        return false;
    }
    matches!(value.get(wanted.len()), None | Some(b';' | b' ' | b'\t' | b'\r' | b'\n'))
}
