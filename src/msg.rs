//! SIP message under rewrite
//!
//! The received buffer is never mutated. Headers are located lazily on
//! first use; every rewriter records lumps in the message's [`EditList`]
//! and the final bytes come from [`SipMessage::build`].

use crate::error::{TextopsError, TextopsResult};
use crate::limits::{RewriteLimits, DEFAULT_BODY_CONTENT_TYPE};
use crate::locator::{self, HeaderField, HeaderIndex};
use crate::lump::{EditList, LumpScope};
use crate::subst::SubstContext;
use crate::types::{HeaderMatcher, HeaderType, TextRange};
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Parsed start line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: TextRange, uri: TextRange },
    Response { status: u16 },
}

/// Additions for a locally generated reply to this message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyLumps {
    pub headers: Vec<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

pub struct SipMessage {
    buf: Vec<u8>,
    start_line: StartLine,
    header_start: usize,
    index: OnceLock<HeaderIndex>,
    edits: EditList,
    new_uri: Option<Vec<u8>>,
    reply: ReplyLumps,
    add_content_length: bool,
    vars: HashMap<String, Vec<u8>>,
    limits: RewriteLimits,
}

impl std::fmt::Debug for SipMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipMessage")
            .field("len", &self.buf.len())
            .field("start_line", &self.start_line)
            .field("lumps", &self.edits.len())
            .finish()
    }
}

impl SipMessage {
    pub fn new(buf: impl Into<Vec<u8>>) -> TextopsResult<SipMessage> {
        SipMessage::with_limits(buf, RewriteLimits::default())
    }

    /// Take ownership of a received buffer and locate its start line
    pub fn with_limits(buf: impl Into<Vec<u8>>, limits: RewriteLimits) -> TextopsResult<SipMessage> {
        let buf = buf.into();
        if buf.len() > limits.max_message_size {
            return Err(TextopsError::malformed(
                format!("message of {} bytes exceeds {}", buf.len(), limits.max_message_size),
                None,
                None,
            ));
        }
        let header_start = locator::header_start(&buf)?;
        let start_line = parse_start_line(&buf[..header_start])?;
        let edits = EditList::with_limits(buf.len(), &limits);
        Ok(SipMessage {
            buf,
            start_line,
            header_start,
            index: OnceLock::new(),
            edits,
            new_uri: None,
            reply: ReplyLumps::default(),
            add_content_length: false,
            vars: HashMap::new(),
            limits,
        })
    }

    /// Original bytes, as received
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limits(&self) -> &RewriteLimits {
        &self.limits
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&[u8]> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method.slice(&self.buf)),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.start_line {
            StartLine::Response { status } => Some(status),
            StartLine::Request { .. } => None,
        }
    }

    /// Request-URI as received
    pub fn original_uri(&self) -> Option<&[u8]> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri.slice(&self.buf)),
            StartLine::Response { .. } => None,
        }
    }

    /// Current request-URI: the rewritten one if set, else the original
    pub fn request_uri(&self) -> Option<&[u8]> {
        self.new_uri.as_deref().or_else(|| self.original_uri())
    }

    pub fn new_uri(&self) -> Option<&[u8]> {
        self.new_uri.as_deref()
    }

    pub fn set_new_uri(&mut self, uri: impl Into<Vec<u8>>) -> TextopsResult<()> {
        if !self.is_request() {
            return Err(TextopsError::state_error("set_new_uri", "message is a reply", None));
        }
        self.new_uri = Some(uri.into());
        Ok(())
    }

    /// First byte after the start line
    pub fn header_start(&self) -> usize {
        self.header_start
    }

    fn index(&self) -> TextopsResult<&HeaderIndex> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let index = locator::scan_headers(&self.buf, self.header_start)?;
        debug!(headers = index.fields.len(), eoh = index.eoh, "scanned headers");
        Ok(self.index.get_or_init(|| index))
    }

    /// Locate every header. Idempotent.
    pub fn parse_headers(&self) -> TextopsResult<()> {
        self.index().map(|_| ())
    }

    pub fn headers(&self) -> TextopsResult<&[HeaderField]> {
        Ok(&self.index()?.fields)
    }

    /// Headers named by `matcher`, in message order
    pub fn headers_matching<'a>(
        &'a self,
        matcher: &'a HeaderMatcher,
    ) -> TextopsResult<impl Iterator<Item = &'a HeaderField> + 'a> {
        let buf = &self.buf;
        Ok(self
            .headers()?
            .iter()
            .filter(move |h| matcher.matches(&h.htype, h.name.slice(buf))))
    }

    /// First header named by `matcher`
    pub fn header(&self, matcher: &HeaderMatcher) -> TextopsResult<Option<&HeaderField>> {
        let buf = &self.buf;
        Ok(self.headers()?.iter().find(|h| matcher.matches(&h.htype, h.name.slice(buf))))
    }

    /// Start of the empty line that ends the headers
    pub fn eoh(&self) -> TextopsResult<usize> {
        Ok(self.index()?.eoh)
    }

    /// First body byte; None for a headers-only message
    pub fn body_start(&self) -> TextopsResult<Option<usize>> {
        Ok(self.index()?.body_start)
    }

    /// Body range, None when there is no body or it is empty
    pub fn body_range(&self) -> TextopsResult<Option<TextRange>> {
        Ok(self
            .body_start()?
            .filter(|start| *start < self.buf.len())
            .map(|start| TextRange::new(start, self.buf.len())))
    }

    pub fn body(&self) -> TextopsResult<Option<&[u8]>> {
        Ok(self.body_range()?.map(|r| r.slice(&self.buf)))
    }

    /// Content-Type value, if present
    pub fn content_type(&self) -> TextopsResult<Option<&[u8]>> {
        let matcher = HeaderMatcher::ByType(HeaderType::ContentType);
        Ok(self.header(&matcher)?.map(|h| h.body.slice(&self.buf)))
    }

    /// Content-Type value, defaulting to `application/sdp` when absent
    pub fn effective_content_type(&self) -> TextopsResult<&[u8]> {
        Ok(self.content_type()?.unwrap_or(DEFAULT_BODY_CONTENT_TYPE.as_bytes()))
    }

    pub fn content_length(&self) -> TextopsResult<Option<usize>> {
        let matcher = HeaderMatcher::ByType(HeaderType::ContentLength);
        match self.header(&matcher)? {
            None => Ok(None),
            Some(h) => {
                let value = std::str::from_utf8(h.body.slice(&self.buf)).ok();
                value
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .map(Some)
                    .ok_or_else(|| TextopsError::malformed("invalid Content-Length", Some(h.body.start), None))
            }
        }
    }

    pub fn edits(&self) -> &EditList {
        &self.edits
    }

    pub fn edits_mut(&mut self) -> &mut EditList {
        &mut self.edits
    }

    /// Run `op`; if it fails, drop every lump it recorded
    pub fn atomically<T>(&mut self, op: impl FnOnce(&mut SipMessage) -> TextopsResult<T>) -> TextopsResult<T> {
        let checkpoint = self.edits.checkpoint();
        let result = op(self);
        if result.is_err() {
            self.edits.rollback(checkpoint);
        }
        result
    }

    /// Discard pending body edits before a full-body replace
    pub fn clear_body_edits(&mut self) -> usize {
        self.edits.clear_scope(LumpScope::Body)
    }

    /// Ask `build` to add a Content-Length header reflecting the final body
    pub(crate) fn request_content_length(&mut self) {
        self.add_content_length = true;
    }

    pub fn reply_lumps(&self) -> &ReplyLumps {
        &self.reply
    }

    pub(crate) fn reply_lumps_mut(&mut self) -> &mut ReplyLumps {
        &mut self.reply
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&[u8]> {
        self.vars.get(name).map(|v| v.as_slice())
    }

    /// User part of the current request-URI
    pub fn uri_user(&self) -> Option<&[u8]> {
        let uri = self.request_uri()?;
        uri_user_range(uri).map(|r| &uri[r])
    }

    /// Linearize all edits into the outgoing wire bytes. Consumes the
    /// message: lumps are emitted exactly once.
    ///
    /// An undeleted Content-Length header gets the real body length, and
    /// one is added when a body rewriter asked for it.
    pub fn build(self) -> TextopsResult<Vec<u8>> {
        let SipMessage { buf, start_line, header_start, index, mut edits, new_uri, add_content_length, .. } = self;

        if let (Some(uri), StartLine::Request { uri: range, .. }) = (new_uri, &start_line) {
            match edits.delete(range.start, range.len()) {
                Ok(handle) => {
                    edits.insert_after(handle, uri)?;
                }
                Err(err) => warn!(%err, "request-URI already edited, keeping lumps"),
            }
        }

        let index = match index.into_inner() {
            Some(index) => index,
            None => locator::scan_headers(&buf, header_start)?,
        };
        if let Some(body_start) = index.body_start {
            let body_len = edits.output_len(body_start..buf.len());
            let existing = index
                .fields
                .iter()
                .find(|h| h.htype == HeaderType::ContentLength && !edits.is_deleted(h.line.start, h.line.len()));
            match existing {
                Some(h) => {
                    if h.body.slice(&buf) != body_len.to_string().as_bytes() {
                        match edits.delete(h.body.start, h.body.len()) {
                            Ok(handle) => {
                                edits.insert_after(handle, body_len.to_string())?;
                            }
                            Err(err) => warn!(%err, "Content-Length already edited"),
                        }
                    }
                }
                None if add_content_length => {
                    edits.insert_after(index.eoh, format!("Content-Length: {}\r\n", body_len))?;
                }
                None => {}
            }
        }
        debug!(lumps = edits.len(), "linearizing");
        Ok(edits.linearize(&buf))
    }

    /// Build and reparse, so later rewrites see the edited bytes
    pub fn apply_edits(mut self) -> TextopsResult<SipMessage> {
        let limits = self.limits.clone();
        let vars = self.vars.clone();
        let reply = std::mem::take(&mut self.reply);
        let out = self.build()?;
        let mut msg = SipMessage::with_limits(out, limits)?;
        msg.vars = vars;
        msg.reply = reply;
        Ok(msg)
    }
}

impl SubstContext for SipMessage {
    fn request_uri(&self) -> Option<&[u8]> {
        SipMessage::request_uri(self)
    }

    /// Message variables first, then `ru`, `rU`, `rm` and `hdr(Name)`
    fn variable(&self, name: &str) -> Option<Cow<'_, [u8]>> {
        if let Some(value) = self.var(name) {
            return Some(Cow::Borrowed(value));
        }
        match name {
            "ru" => self.request_uri().map(Cow::Borrowed),
            "rU" => self.uri_user().map(Cow::Borrowed),
            "rm" => self.method().map(Cow::Borrowed),
            _ => {
                let header = name.strip_prefix("hdr(")?.strip_suffix(')')?;
                let matcher = HeaderMatcher::from_name(header);
                let field = self.header(&matcher).ok()??;
                Some(Cow::Borrowed(field.body.slice(&self.buf)))
            }
        }
    }
}

/// Range of the user part in a `scheme:user[:password]@host` URI
pub fn uri_user_range(uri: &[u8]) -> Option<Range<usize>> {
    let colon = uri.iter().position(|b| *b == b':')?;
    let at = uri[colon + 1..].iter().position(|b| *b == b'@')? + colon + 1;
    let user_end = uri[colon + 1..at]
        .iter()
        .position(|b| *b == b':')
        .map_or(at, |p| p + colon + 1);
    Some(colon + 1..user_end)
}

fn parse_start_line(line: &[u8]) -> TextopsResult<StartLine> {
    let line = &line[..line.len() - locator::terminator_len(line)];
    let mut parts = line.splitn(3, |b| *b == b' ');
    let first = parts.next().unwrap_or_default();
    let second = parts.next().ok_or_else(|| TextopsError::malformed("short start line", Some(0), None))?;
    let third = parts.next().unwrap_or_default();

    if first.starts_with(b"SIP/") {
        let status = std::str::from_utf8(second)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| TextopsError::malformed("invalid status code", Some(first.len() + 1), None))?;
        return Ok(StartLine::Response { status });
    }
    if first.is_empty() || !third.starts_with(b"SIP/") {
        return Err(TextopsError::malformed("invalid request line", Some(0), None));
    }
    let uri_start = first.len() + 1;
    Ok(StartLine::Request {
        method: TextRange::new(0, first.len()),
        uri: TextRange::new(uri_start, uri_start + second.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\n";

    #[test]
    fn test_start_line() {
        let msg = SipMessage::new(INVITE).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(&b"INVITE"[..]));
        assert_eq!(msg.request_uri(), Some(&b"sip:bob@biloxi.com"[..]));
        assert_eq!(msg.uri_user(), Some(&b"bob"[..]));

        let reply = SipMessage::new("SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\n\r\n").unwrap();
        assert_eq!(reply.status(), Some(200));
        assert!(SipMessage::new("garbage\r\n").is_err());
    }

    #[test]
    fn test_lazy_header_access() {
        let msg = SipMessage::new(INVITE).unwrap();
        assert_eq!(msg.headers().unwrap().len(), 7);
        assert_eq!(msg.content_type().unwrap(), Some(&b"application/sdp"[..]));
        assert_eq!(msg.content_length().unwrap(), Some(4));
        assert_eq!(msg.body().unwrap(), Some(&b"v=0\n"[..]));
    }

    #[test]
    fn test_build_without_edits_is_identity() {
        let msg = SipMessage::new(INVITE).unwrap();
        assert_eq!(msg.build().unwrap(), INVITE.as_bytes());
    }

    #[test]
    fn test_build_fixes_content_length() {
        let mut msg = SipMessage::new(INVITE).unwrap();
        let start = msg.body_start().unwrap().unwrap();
        let handle = msg.edits_mut().delete_in(start, 4, LumpScope::Body).unwrap();
        msg.edits_mut().insert_after(handle, "v=0\r\no=x\r\n").unwrap();
        let out = String::from_utf8(msg.build().unwrap()).unwrap();
        assert!(out.contains("Content-Length: 10\r\n"));
        assert!(out.ends_with("\r\n\r\nv=0\r\no=x\r\n"));
    }

    #[test]
    fn test_build_applies_new_uri() {
        let mut msg = SipMessage::new(INVITE).unwrap();
        msg.set_new_uri("sip:carol@chicago.com").unwrap();
        let out = msg.build().unwrap();
        assert!(out.starts_with(b"INVITE sip:carol@chicago.com SIP/2.0\r\n"));
    }

    #[test]
    fn test_atomically_rolls_back() {
        let mut msg = SipMessage::new(INVITE).unwrap();
        let result: TextopsResult<()> = msg.atomically(|m| {
            m.edits_mut().delete(40, 2)?;
            m.edits_mut().delete(41, 2)?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(msg.edits().is_empty());
    }

    #[test]
    fn test_uri_user_range() {
        assert_eq!(uri_user_range(b"sip:alice:secret@host"), Some(4..9));
        assert_eq!(uri_user_range(b"sip:host.com"), None);
    }

    #[test]
    fn test_variables() {
        let mut msg = SipMessage::new(INVITE).unwrap();
        msg.set_var("x", "1");
        assert_eq!(msg.variable("x").as_deref(), Some(&b"1"[..]));
        assert_eq!(msg.variable("rm").as_deref(), Some(&b"INVITE"[..]));
        assert_eq!(msg.variable("hdr(call-id)").as_deref(), Some(&b"a84b4c76e66710@pc33.atlanta.com"[..]));
        assert_eq!(msg.variable("nope"), None);
    }

    #[test]
    fn test_apply_edits_keeps_reply_lumps() {
        let mut msg = SipMessage::new(INVITE).unwrap();
        msg.append_to_reply("Retry-After: 5\r\n").unwrap();
        msg.set_reply_body("busy", "text/plain").unwrap();
        msg.set_var("x", "1");
        let msg = msg.apply_edits().unwrap();
        assert_eq!(
            msg.reply_lumps().headers,
            vec![b"Retry-After: 5\r\n".to_vec(), b"Content-Type: text/plain\r\n".to_vec()]
        );
        assert_eq!(msg.reply_lumps().body.as_deref(), Some(&b"busy"[..]));
        assert_eq!(msg.variable("x").as_deref(), Some(&b"1"[..]));
    }
}
