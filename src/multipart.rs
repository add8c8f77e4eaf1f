//! Body replacement and multipart assembly
//!
//! Part content is located with the forward scanners in [`crate::locator`];
//! new parts are generated as
//!
//! ```text
//! --boundary CRLF
//! Content-Type: type CRLF
//! [Content-Disposition: disposition CRLF]
//! CRLF
//! content [CRLF]
//! ```
//!
//! and a body is closed with `--boundary--` CRLF. Every body rewriter asks
//! [`SipMessage::build`] to keep Content-Length in step with the new body.

use crate::error::{TextopsError, TextopsResult};
use crate::locator::{self, BodyPart};
use crate::lump::LumpScope;
use crate::msg::SipMessage;
use crate::types::{HeaderMatcher, HeaderType, Outcome, TextRange};
use crate::validation::{validate_boundary, validate_header_value};
use tracing::{debug, warn};

const MIME_VERSION: &[u8] = b"Mime-Version: 1.0\r\n";

fn validate_content_type(content_type: &str) -> TextopsResult<()> {
    if content_type.is_empty() {
        return Err(TextopsError::invalid_param("content type", "empty"));
    }
    validate_header_value(content_type.as_bytes())
}

/// Hex digits with any whitespace between them
fn decode_hex_ws(digits: &str) -> TextopsResult<Vec<u8>> {
    let compact: String = digits.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(&compact).map_err(|err| TextopsError::invalid_param("hex", err.to_string()))
}

/// One part, opening delimiter included
fn encode_part(delimiter: &[u8], content_type: &[u8], disposition: Option<&[u8]>, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(delimiter.len() + content_type.len() + content.len() + 48);
    out.extend_from_slice(b"--");
    out.extend_from_slice(delimiter);
    out.extend_from_slice(b"\r\nContent-Type: ");
    out.extend_from_slice(content_type);
    out.extend_from_slice(b"\r\n");
    if let Some(disposition) = disposition.filter(|d| !d.is_empty()) {
        out.extend_from_slice(b"Content-Disposition: ");
        out.extend_from_slice(disposition);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(content);
    if !content.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn closing_delimiter(delimiter: &[u8]) -> Vec<u8> {
    [&b"--"[..], delimiter, b"--\r\n"].concat()
}

fn pick<T>(items: Vec<T>, index: isize) -> Option<T> {
    let position = if index >= 0 {
        index.unsigned_abs()
    } else {
        items.len().checked_sub(index.unsigned_abs())?
    };
    items.into_iter().nth(position)
}

impl SipMessage {
    /// Boundary of a multipart body, from the Content-Type header
    pub fn multipart_boundary(&self) -> TextopsResult<Option<Vec<u8>>> {
        Ok(self
            .content_type()?
            .filter(|ctype| locator::is_multipart(ctype))
            .and_then(locator::boundary_param)
            .map(<[u8]>::to_vec))
    }

    /// Parts of a multipart body whose Content-Type matches `content_type`.
    /// `None` when the body is missing or not multipart.
    fn matching_parts(&self, content_type: &str) -> TextopsResult<Option<Vec<BodyPart>>> {
        let (Some(body), Some(boundary)) = (self.body_range()?, self.multipart_boundary()?) else {
            return Ok(None);
        };
        let buf = self.buf();
        let parts = locator::parse_parts(buf, body, &boundary)?
            .parts
            .into_iter()
            .filter(|part| {
                part.content_type
                    .is_some_and(|ct| locator::content_type_matches(ct.slice(buf), content_type.as_bytes()))
            })
            .collect();
        Ok(Some(parts))
    }

    /// Replace the Content-Type header line with one carrying `value`
    fn replace_content_type(&mut self, value: &[u8]) -> TextopsResult<()> {
        let existing = self
            .header(&HeaderMatcher::ByType(HeaderType::ContentType))?
            .map(|h| h.line);
        let live = existing.filter(|l| !self.edits().is_deleted(l.start, l.len()));
        if let Some(line) = live {
            self.edits_mut().delete(line.start, line.len())?;
        }
        let eoh = self.eoh()?;
        let text = [&b"Content-Type: "[..], value, b"\r\n"].concat();
        self.edits_mut().insert_after(eoh, text)?;
        Ok(())
    }

    /// Delete the whole body (if any) and put `content` in its place
    fn replace_whole_body(&mut self, content: Vec<u8>) -> TextopsResult<()> {
        let body_start = self
            .body_start()?
            .ok_or_else(|| TextopsError::malformed("message has no end of headers", Some(self.len()), None))?;
        let anchor = match self.body_range()? {
            Some(body) => self.edits_mut().delete_in(body.start, body.len(), LumpScope::Body)?,
            None => self.edits_mut().anchor_in(body_start, LumpScope::Body)?,
        };
        self.edits_mut().insert_after(anchor, content)?;
        Ok(())
    }

    /// Replace the body, dropping pending body edits. Content-Type is
    /// rewritten when it differs.
    pub fn set_body(&mut self, body: impl AsRef<[u8]>, content_type: &str) -> TextopsResult<Outcome> {
        let body = body.as_ref();
        if body.is_empty() {
            return Err(TextopsError::invalid_param("body", "empty"));
        }
        validate_content_type(content_type)?;
        let ctype_changed = self.content_type()? != Some(content_type.as_bytes());

        let dropped = self.clear_body_edits();
        debug!(length = body.len(), dropped, "setting body");
        self.atomically(|msg| {
            msg.replace_whole_body(body.to_vec())?;
            if ctype_changed {
                msg.replace_content_type(content_type.as_bytes())?;
            }
            msg.request_content_length();
            Ok(Outcome::Applied(1))
        })
    }

    /// [`SipMessage::set_body`] with a hex-encoded body; whitespace in the
    /// hex text is ignored
    pub fn set_body_hex(&mut self, hex: &str, content_type: &str) -> TextopsResult<Outcome> {
        let body = decode_hex_ws(hex)?;
        self.set_body(body, content_type)
    }

    /// Body and Content-Type for a locally generated reply
    pub fn set_reply_body(&mut self, body: impl AsRef<[u8]>, content_type: &str) -> TextopsResult<Outcome> {
        let body = body.as_ref();
        if body.is_empty() {
            return Err(TextopsError::invalid_param("body", "empty"));
        }
        validate_content_type(content_type)?;
        let reply = self.reply_lumps_mut();
        reply.headers.push([&b"Content-Type: "[..], content_type.as_bytes(), b"\r\n"].concat());
        reply.body = Some(body.to_vec());
        Ok(Outcome::Applied(1))
    }

    /// Turn the body into a one-part multipart body.
    ///
    /// Without `body` the current body becomes the part, keeping its
    /// Content-Type; a body that is already multipart is then left alone.
    /// `content_type` and `boundary` default to the configured values.
    pub fn set_body_multipart(
        &mut self,
        body: Option<&[u8]>,
        content_type: Option<&str>,
        boundary: Option<&str>,
    ) -> TextopsResult<Outcome> {
        let body = body.filter(|b| !b.is_empty());
        let existing_boundary = self.multipart_boundary()?;
        if existing_boundary.is_some() && body.is_none() {
            debug!("body is already multipart");
            return Ok(Outcome::Applied(1));
        }

        let delimiter = match (boundary, &existing_boundary) {
            (Some(boundary), _) => boundary.as_bytes().to_vec(),
            (None, Some(existing)) => existing.clone(),
            (None, None) => self.limits().default_boundary.as_bytes().to_vec(),
        };
        let delimiter_str = String::from_utf8_lossy(&delimiter).into_owned();
        validate_boundary(&delimiter_str)?;
        let default_ctype = self.limits().default_part_content_type.clone();
        let new_ctype = content_type.unwrap_or(&default_ctype);
        validate_content_type(new_ctype)?;

        let (content, part_ctype) = match body {
            Some(body) => (body.to_vec(), new_ctype.as_bytes().to_vec()),
            None => {
                let Some(old) = self.body()? else {
                    warn!("no body to put in the multipart body");
                    return Ok(Outcome::NotFound);
                };
                let old_ctype = self.content_type()?.unwrap_or(new_ctype.as_bytes());
                (old.to_vec(), old_ctype.to_vec())
            }
        };

        let mut new_body = encode_part(&delimiter, &part_ctype, None, &content);
        new_body.extend_from_slice(&closing_delimiter(&delimiter));
        let convert = existing_boundary.is_none();
        let has_mime_version = self.header(&HeaderMatcher::ByType(HeaderType::MimeVersion))?.is_some();

        self.clear_body_edits();
        debug!(boundary = %delimiter_str, convert, "setting multipart body");
        self.atomically(|msg| {
            msg.replace_whole_body(new_body)?;
            if convert {
                let ctype = [&b"multipart/mixed;boundary=\""[..], delimiter.as_slice(), b"\""].concat();
                msg.replace_content_type(&ctype)?;
                if !has_mime_version {
                    let eoh = msg.eoh()?;
                    msg.edits_mut().insert_after(eoh, MIME_VERSION)?;
                }
            }
            msg.request_content_length();
            Ok(Outcome::Applied(1))
        })
    }

    /// Add a part before the closing delimiter of a multipart body
    pub fn append_body_part(
        &mut self,
        body: impl AsRef<[u8]>,
        content_type: &str,
        disposition: Option<&str>,
    ) -> TextopsResult<Outcome> {
        let body = body.as_ref();
        if body.is_empty() {
            return Err(TextopsError::invalid_param("body", "empty"));
        }
        validate_content_type(content_type)?;
        if let Some(disposition) = disposition {
            validate_header_value(disposition.as_bytes())?;
        }
        let Some(range) = self.body_range()? else {
            debug!("message body has zero length");
            return Ok(Outcome::NotFound);
        };
        let Some(boundary) = self.multipart_boundary()? else {
            return Err(TextopsError::state_error("append_body_part", "body is not multipart", None));
        };
        let layout = locator::parse_parts(self.buf(), range, &boundary)?;

        let mut part = encode_part(&boundary, content_type.as_bytes(), disposition.map(str::as_bytes), body);
        let offset = match layout.closing {
            Some(closing) => closing.line.start,
            None => {
                if !self.buf().ends_with(b"\n") {
                    part = [&b"\r\n"[..], &part[..]].concat();
                }
                part.extend_from_slice(&closing_delimiter(&boundary));
                range.end
            }
        };
        debug!(offset, length = part.len(), "appending body part");
        self.atomically(|msg| {
            let anchor = msg.edits_mut().anchor_in(offset, LumpScope::Body)?;
            msg.edits_mut().insert_before(anchor, part)?;
            msg.request_content_length();
            Ok(Outcome::Applied(1))
        })
    }

    pub fn append_body_part_hex(&mut self, hex: &str, content_type: &str, disposition: Option<&str>) -> TextopsResult<Outcome> {
        let body = decode_hex_ws(hex)?;
        self.append_body_part(body, content_type, disposition)
    }

    /// Remove the first part whose Content-Type matches, from its opening
    /// delimiter up to the next delimiter
    pub fn remove_body_part(&mut self, content_type: &str) -> TextopsResult<Outcome> {
        let Some(parts) = self.matching_parts(content_type)? else {
            warn!("body is missing or not multipart");
            return Ok(Outcome::NotFound);
        };
        let Some(part) = parts.into_iter().next() else {
            return Ok(Outcome::NotFound);
        };
        let span = TextRange::new(part.delimiter.start, part.end);
        debug!(offset = span.start, length = span.len(), "removing body part");
        self.atomically(|msg| {
            msg.edits_mut().delete_in(span.start, span.len(), LumpScope::Body)?;
            msg.request_content_length();
            Ok(Outcome::Applied(1))
        })
    }

    /// Content of the first part with a matching Content-Type. A body that
    /// is not multipart is returned whole.
    pub fn get_body_part(&self, content_type: &str) -> TextopsResult<Option<&[u8]>> {
        self.get_body_part_at(content_type, 0)
    }

    /// Content of the `index`th matching part; a negative index counts
    /// from the last matching part
    pub fn get_body_part_at(&self, content_type: &str, index: isize) -> TextopsResult<Option<&[u8]>> {
        match self.matching_parts(content_type)? {
            Some(parts) => Ok(pick(parts, index).map(|part| part.content.slice(self.buf()))),
            None => Ok(if index == 0 || index == -1 { self.body()? } else { None }),
        }
    }

    /// First matching part with its headers, delimiter lines excluded
    pub fn get_body_part_raw(&self, content_type: &str) -> TextopsResult<Option<&[u8]>> {
        match self.matching_parts(content_type)? {
            Some(parts) => Ok(parts
                .into_iter()
                .next()
                .map(|part| TextRange::new(part.headers.start, part.end).slice(self.buf()))),
            None => self.body(),
        }
    }

    /// Reduce a multipart body to the content of its first part with a
    /// matching Content-Type, which becomes the message Content-Type
    pub fn filter_body(&mut self, content_type: &str) -> TextopsResult<Outcome> {
        let Some(body) = self.body_range()? else {
            return Ok(Outcome::NotFound);
        };
        let Some(parts) = self.matching_parts(content_type)? else {
            warn!("body not multipart");
            return Ok(Outcome::NotFound);
        };
        let Some(part) = parts.into_iter().next() else {
            return Ok(Outcome::NotFound);
        };
        let keep = part.content;
        let ctype = part
            .content_type
            .map_or_else(|| content_type.as_bytes().to_vec(), |ct| ct.slice(self.buf()).to_vec());
        self.atomically(|msg| {
            msg.edits_mut().delete_in(body.start, keep.start - body.start, LumpScope::Body)?;
            if keep.end < body.end {
                msg.edits_mut().delete_in(keep.end, body.end - keep.end, LumpScope::Body)?;
            }
            msg.replace_content_type(&ctype)?;
            msg.request_content_length();
            Ok(Outcome::Applied(1))
        })
    }

    /// Is there a non-empty body, optionally of the given type. A missing
    /// Content-Type counts as `application/sdp`.
    pub fn has_body(&self, content_type: Option<&str>) -> TextopsResult<Outcome> {
        if self.content_length()? == Some(0) || self.body_range()?.is_none() {
            debug!("content length is zero");
            return Ok(Outcome::NotFound);
        }
        let Some(wanted) = content_type.filter(|ct| !ct.is_empty()) else {
            return Ok(Outcome::Applied(1));
        };
        let actual = self.effective_content_type()?;
        Ok(Outcome::from_count(locator::content_type_matches(actual, wanted.as_bytes()) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = "MESSAGE sip:bob@b.com SIP/2.0\r\n\
Content-Type: text/plain\r\n\
Content-Length: 5\r\n\
\r\n\
hello";

    const MIXED: &str = "MESSAGE sip:bob@b.com SIP/2.0\r\n\
Content-Type: multipart/mixed;boundary=\"B1\"\r\n\
\r\n\
--B1\r\n\
Content-Type: text/plain\r\n\
\r\n\
one\r\n\
--B1\r\n\
Content-Type: application/sdp\r\n\
\r\n\
v=0\r\n\
--B1\r\n\
Content-Type: text/plain\r\n\
\r\n\
two\r\n\
--B1--\r\n";

    fn built(msg: SipMessage) -> String {
        String::from_utf8(msg.build().unwrap()).unwrap()
    }

    #[test]
    fn test_set_body() {
        let mut msg = SipMessage::new(PLAIN).unwrap();
        assert_eq!(msg.set_body("v=0\r\n", "application/sdp").unwrap(), Outcome::Applied(1));
        let out = built(msg);
        assert!(out.contains("Content-Type: application/sdp\r\n"));
        assert!(!out.contains("text/plain"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_set_body_adds_content_length() {
        let mut msg = SipMessage::new("MESSAGE sip:bob@b.com SIP/2.0\r\nVia: x\r\n\r\n").unwrap();
        msg.set_body("hi there", "text/plain").unwrap();
        let out = built(msg);
        assert!(out.contains("Content-Type: text/plain\r\nContent-Length: 8\r\n\r\nhi there"));
    }

    #[test]
    fn test_set_body_drops_pending_body_edits() {
        let mut msg = SipMessage::new(PLAIN).unwrap();
        msg.replace_body(&crate::pattern::Pattern::new("hello").unwrap(), "bye").unwrap();
        msg.set_body("new", "text/plain").unwrap();
        let out = built(msg);
        assert!(out.ends_with("\r\n\r\nnew"));
        assert!(out.contains("Content-Length: 3\r\n"));
    }

    #[test]
    fn test_set_body_hex() {
        let mut msg = SipMessage::new(PLAIN).unwrap();
        msg.set_body_hex("68 69", "text/plain").unwrap();
        assert!(built(msg).ends_with("\r\n\r\nhi"));
        let mut msg = SipMessage::new(PLAIN).unwrap();
        assert!(msg.set_body_hex("6", "text/plain").is_err());
        let err = msg.set_body_hex("zz", "text/plain").unwrap_err();
        assert_eq!(err.code(), -7);
        assert!(msg.edits().is_empty());
        assert_eq!(decode_hex_ws("48 69\r\n0A").unwrap(), b"Hi\n".to_vec());
    }

    #[test]
    fn test_set_reply_body() {
        let mut msg = SipMessage::new(PLAIN).unwrap();
        msg.set_reply_body("busy", "text/plain").unwrap();
        assert_eq!(msg.reply_lumps().body.as_deref(), Some(&b"busy"[..]));
        assert_eq!(msg.reply_lumps().headers, vec![b"Content-Type: text/plain\r\n".to_vec()]);
        assert_eq!(built(msg), PLAIN);
    }

    #[test]
    fn test_set_body_multipart_converts_existing_body() {
        let mut msg = SipMessage::new(PLAIN).unwrap();
        msg.set_body_multipart(None, None, None).unwrap();
        let out = built(msg);
        assert!(out.contains("Content-Type: multipart/mixed;boundary=\"unique-boundary-1\"\r\n"));
        assert!(out.contains("Mime-Version: 1.0\r\n"));
        assert!(out.ends_with(
            "\r\n\r\n--unique-boundary-1\r\nContent-Type: text/plain\r\n\r\nhello\r\n--unique-boundary-1--\r\n"
        ));
    }

    #[test]
    fn test_set_body_multipart_noop_when_multipart() {
        let mut msg = SipMessage::new(MIXED).unwrap();
        assert_eq!(msg.set_body_multipart(None, None, None).unwrap(), Outcome::Applied(1));
        assert!(msg.edits().is_empty());
    }

    #[test]
    fn test_set_body_multipart_rejects_bad_boundary() {
        let mut msg = SipMessage::new(PLAIN).unwrap();
        assert!(msg.set_body_multipart(None, None, Some("-bad")).is_err());
        assert!(msg.edits().is_empty());
    }

    #[test]
    fn test_get_body_part() {
        let msg = SipMessage::new(MIXED).unwrap();
        assert_eq!(msg.get_body_part("text/plain").unwrap(), Some(&b"one"[..]));
        assert_eq!(msg.get_body_part_at("text/plain", -1).unwrap(), Some(&b"two"[..]));
        assert_eq!(msg.get_body_part_at("text/plain", 2).unwrap(), None);
        assert_eq!(msg.get_body_part("application/sdp").unwrap(), Some(&b"v=0"[..]));
        assert_eq!(msg.get_body_part("image/png").unwrap(), None);
        assert_eq!(
            msg.get_body_part_raw("application/sdp").unwrap(),
            Some(&b"Content-Type: application/sdp\r\n\r\nv=0\r\n"[..])
        );
    }

    #[test]
    fn test_get_body_part_after_binary_part() {
        let mut raw = b"MESSAGE sip:bob@b.com SIP/2.0\r\n\
Content-Type: multipart/mixed;boundary=B1\r\n\
\r\n\
--B1\r\n\
Content-Type: application/isup\r\n\
\r\n"
            .to_vec();
        raw.extend_from_slice(&[0x01, 0x0d, 0x20, 0x02]);
        raw.extend_from_slice(b"\r\n--B1\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n--B1--\r\n");
        let msg = SipMessage::new(raw).unwrap();
        assert_eq!(msg.get_body_part("application/sdp").unwrap(), Some(&b"v=0"[..]));
        assert_eq!(msg.get_body_part("application/isup").unwrap(), Some(&[0x01, 0x0d, 0x20, 0x02][..]));
    }

    #[test]
    fn test_get_body_part_non_multipart() {
        let msg = SipMessage::new(PLAIN).unwrap();
        assert_eq!(msg.get_body_part("application/sdp").unwrap(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_remove_body_part() {
        let mut msg = SipMessage::new(MIXED).unwrap();
        assert_eq!(msg.remove_body_part("application/sdp").unwrap(), Outcome::Applied(1));
        let out = built(msg);
        assert!(!out.contains("v=0"));
        assert!(out.contains("one\r\n--B1\r\nContent-Type: text/plain\r\n\r\ntwo\r\n--B1--\r\n"));
        assert!(out.contains("Content-Length: "));
    }

    #[test]
    fn test_append_body_part() {
        let mut msg = SipMessage::new(MIXED).unwrap();
        msg.append_body_part("three", "text/plain", Some("render")).unwrap();
        let out = built(msg);
        assert!(out.ends_with(
            "two\r\n--B1\r\nContent-Type: text/plain\r\nContent-Disposition: render\r\n\r\nthree\r\n--B1--\r\n"
        ));

        let mut plain = SipMessage::new(PLAIN).unwrap();
        assert!(plain.append_body_part("x", "text/plain", None).is_err());
    }

    #[test]
    fn test_filter_body() {
        let mut msg = SipMessage::new(MIXED).unwrap();
        assert_eq!(msg.filter_body("application/sdp").unwrap(), Outcome::Applied(1));
        let out = built(msg);
        assert!(out.contains("Content-Type: application/sdp\r\n"));
        assert!(out.ends_with("\r\n\r\nv=0"));
        assert!(out.contains("Content-Length: 3\r\n"));

        let mut plain = SipMessage::new(PLAIN).unwrap();
        assert_eq!(plain.filter_body("text/plain").unwrap(), Outcome::NotFound);
    }

    #[test]
    fn test_has_body() {
        let msg = SipMessage::new(PLAIN).unwrap();
        assert_eq!(msg.has_body(None).unwrap(), Outcome::Applied(1));
        assert_eq!(msg.has_body(Some("text/plain")).unwrap(), Outcome::Applied(1));
        assert_eq!(msg.has_body(Some("application/sdp")).unwrap(), Outcome::NotFound);

        let sdp = SipMessage::new("INVITE sip:b@b.com SIP/2.0\r\nVia: x\r\n\r\nv=0\r\n").unwrap();
        assert_eq!(sdp.has_body(Some("application/sdp")).unwrap(), Outcome::Applied(1));

        let empty = SipMessage::new("INVITE sip:b@b.com SIP/2.0\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(empty.has_body(None).unwrap(), Outcome::NotFound);
    }
}
