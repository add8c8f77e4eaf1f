//! SIP header removal, presence and insertion
//!
//! Headers are addressed through a [`HeaderMatcher`], so well-known names
//! (including RFC 3261 compact forms such as `f` for `From`) compare by
//! type and anything else by case-insensitive name. Removal always deletes
//! the whole header line, continuation lines and terminator included.

use crate::error::TextopsResult;
use crate::locator::HeaderField;
use crate::lump::LumpScope;
use crate::msg::SipMessage;
use crate::pattern::{Bol, Pattern};
use crate::strops::find_bytes;
use crate::types::{HeaderMatcher, MatchOp, Outcome, TextRange};
use crate::validation::validate_header_block;
use tracing::{debug, warn};

/// Operand of a [`MatchOp`] comparison
#[derive(Debug, Clone, Copy)]
pub enum MatchValue<'a> {
    Literal(&'a [u8]),
    Pattern(&'a Pattern),
}

impl SipMessage {
    /// Delete every header line in `lines`, skipping ones already removed
    fn remove_lines(&mut self, lines: Vec<TextRange>) -> TextopsResult<Outcome> {
        let lines: Vec<TextRange> = lines
            .into_iter()
            .filter(|line| !self.edits().is_deleted(line.start, line.len()))
            .collect();
        if lines.is_empty() {
            return Ok(Outcome::NotFound);
        }
        self.atomically(|msg| {
            for line in &lines {
                debug!(offset = line.start, length = line.len(), "removing header");
                msg.edits_mut().delete_in(line.start, line.len(), LumpScope::Message)?;
            }
            Ok(Outcome::Applied(lines.len()))
        })
    }

    fn lines_where(&self, mut keep: impl FnMut(&HeaderField) -> bool) -> TextopsResult<Vec<TextRange>> {
        Ok(self.headers()?.iter().filter(|h| keep(*h)).map(|h| h.line).collect())
    }

    /// Remove all headers named by `matcher`
    pub fn remove_hf(&mut self, matcher: &HeaderMatcher) -> TextopsResult<Outcome> {
        let lines: Vec<TextRange> = self.headers_matching(matcher)?.map(|h| h.line).collect();
        self.remove_lines(lines)
    }

    /// Remove all headers whose name matches `re`
    pub fn remove_hf_re(&mut self, re: &Pattern) -> TextopsResult<Outcome> {
        let buf = self.buf();
        let lines = self.lines_where(|h| re.find_at(h.name.slice(buf), 0, Bol::Armed).is_some())?;
        self.remove_lines(lines)
    }

    /// Remove headers whose name matches `matching` but not `skip`
    pub fn remove_hf_exp(&mut self, matching: &Pattern, skip: &Pattern) -> TextopsResult<Outcome> {
        let buf = self.buf();
        let lines = self.lines_where(|h| {
            let name = h.name.slice(buf);
            skip.find_at(name, 0, Bol::Armed).is_none() && matching.find_at(name, 0, Bol::Armed).is_some()
        })?;
        self.remove_lines(lines)
    }

    /// Remove the `index`th header named by `matcher`. A negative index
    /// counts from the last one, so -1 is the last header.
    pub fn remove_hf_idx(&mut self, matcher: &HeaderMatcher, index: isize) -> TextopsResult<Outcome> {
        let lines: Vec<TextRange> = self.headers_matching(matcher)?.map(|h| h.line).collect();
        let position = if index >= 0 {
            Some(index.unsigned_abs())
        } else {
            lines.len().checked_sub(index.unsigned_abs())
        };
        match position.and_then(|p| lines.get(p)) {
            Some(line) => self.remove_lines(vec![*line]),
            None => {
                debug!(header = matcher.name(), index, count = lines.len(), "header index out of range");
                Ok(Outcome::IndexOutOfRange)
            }
        }
    }

    /// Remove headers named by `matcher` whose body satisfies `op`
    ///
    /// `Eq`/`Ne` compare bytes exactly, `In` looks for a substring and `Re`
    /// needs a [`MatchValue::Pattern`] operand.
    pub fn remove_hf_match(&mut self, matcher: &HeaderMatcher, op: MatchOp, operand: MatchValue<'_>) -> TextopsResult<Outcome> {
        let buf = self.buf();
        let lines: Vec<TextRange> = self
            .headers_matching(matcher)?
            .filter(|h| body_matches(h.body.slice(buf), op, operand))
            .map(|h| h.line)
            .collect();
        if lines.is_empty() {
            debug!(header = matcher.name(), %op, "no header value matched");
        }
        self.remove_lines(lines)
    }

    pub fn is_present_hf(&self, matcher: &HeaderMatcher) -> TextopsResult<Outcome> {
        Ok(Outcome::from_count(self.header(matcher)?.is_some() as usize))
    }

    /// Is there a header whose name matches `re`
    pub fn is_present_hf_re(&self, re: &Pattern) -> TextopsResult<Outcome> {
        let buf = self.buf();
        let found = self
            .headers()?
            .iter()
            .any(|h| re.find_at(h.name.slice(buf), 0, Bol::Armed).is_some());
        Ok(Outcome::from_count(found as usize))
    }

    /// Add header text after the last header named by `after`, or after
    /// the last header of the message
    pub fn append_hf(&mut self, text: impl AsRef<[u8]>, after: Option<&HeaderMatcher>) -> TextopsResult<Outcome> {
        let text = text.as_ref();
        validate_header_block(text)?;
        let anchor = match after {
            Some(matcher) => self.headers_matching(matcher)?.last().map(|h| h.line.end),
            None => None,
        };
        let offset = match anchor {
            Some(offset) => offset,
            None => self.eoh()?,
        };
        self.insert_header_text(offset, text)
    }

    /// Add header text before the first header named by `before`, or
    /// before the first header of the message
    pub fn insert_hf(&mut self, text: impl AsRef<[u8]>, before: Option<&HeaderMatcher>) -> TextopsResult<Outcome> {
        let text = text.as_ref();
        validate_header_block(text)?;
        let anchor = match before {
            Some(matcher) => self.header(matcher)?.map(|h| h.line.start),
            None => None,
        };
        let offset = match anchor {
            Some(offset) => offset,
            None => self.headers()?.first().map_or(self.header_start(), |h| h.line.start),
        };
        self.insert_header_text(offset, text)
    }

    /// Append a header made of `prefix`, the request-URI and `suffix`,
    /// e.g. `Contact: <` + URI + `>\r\n`
    pub fn append_urihf(&mut self, prefix: impl AsRef<[u8]>, suffix: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        let Some(uri) = self.request_uri() else {
            warn!("append_urihf on a reply");
            return Ok(Outcome::NotFound);
        };
        let mut text = prefix.as_ref().to_vec();
        text.extend_from_slice(uri);
        text.extend_from_slice(suffix.as_ref());
        self.append_hf(text, None)
    }

    fn insert_header_text(&mut self, offset: usize, text: &[u8]) -> TextopsResult<Outcome> {
        debug!(offset, length = text.len(), "inserting header");
        self.atomically(|msg| {
            let anchor = msg.edits_mut().anchor_in(offset, LumpScope::Message)?;
            msg.edits_mut().insert_before(anchor, text)?;
            Ok(Outcome::Applied(1))
        })
    }

    /// Queue header text for a locally generated reply
    pub fn append_to_reply(&mut self, text: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        let text = text.as_ref();
        validate_header_block(text)?;
        self.reply_lumps_mut().headers.push(text.to_vec());
        Ok(Outcome::Applied(1))
    }
}

fn body_matches(body: &[u8], op: MatchOp, operand: MatchValue<'_>) -> bool {
    match (op, operand) {
        (MatchOp::Eq, MatchValue::Literal(value)) => body == value,
        (MatchOp::Ne, MatchValue::Literal(value)) => body != value,
        (MatchOp::In, MatchValue::Literal(value)) => find_bytes(body, value, 0).is_some(),
        (MatchOp::Re, MatchValue::Pattern(re)) => re.find_at(body, 0, Bol::Armed).is_some(),
        (op, MatchValue::Pattern(re)) => body_matches(body, op, MatchValue::Literal(re.as_str().as_bytes())),
        (MatchOp::Re, MatchValue::Literal(_)) => {
            warn!("regex operator needs a compiled pattern");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HeaderType;

    const TAGGED: &str = "OPTIONS sip:host.com SIP/2.0\r\n\
Via: SIP/2.0/UDP a\r\n\
X-Tag: one\r\n\
X-Tag: two\r\n\
Call-ID: c1\r\n\
X-Tag: three\r\n\
\r\n";

    fn tag() -> HeaderMatcher {
        HeaderMatcher::from_name("X-Tag")
    }

    fn built(msg: SipMessage) -> String {
        String::from_utf8(msg.build().unwrap()).unwrap()
    }

    #[test]
    fn test_remove_hf() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.remove_hf(&tag()).unwrap(), Outcome::Applied(3));
        assert_eq!(
            built(msg),
            "OPTIONS sip:host.com SIP/2.0\r\nVia: SIP/2.0/UDP a\r\nCall-ID: c1\r\n\r\n"
        );

        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.remove_hf(&HeaderMatcher::from_name("X-None")).unwrap(), Outcome::NotFound);
    }

    #[test]
    fn test_remove_hf_twice_is_noop() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.remove_hf(&tag()).unwrap();
        assert_eq!(msg.remove_hf(&tag()).unwrap(), Outcome::NotFound);
    }

    #[test]
    fn test_remove_hf_compact_form() {
        let mut msg = SipMessage::new("OPTIONS sip:h SIP/2.0\r\ni: abc\r\nVia: x\r\n\r\n").unwrap();
        assert_eq!(msg.remove_hf(&HeaderMatcher::ByType(HeaderType::CallId)).unwrap(), Outcome::Applied(1));
        assert_eq!(built(msg), "OPTIONS sip:h SIP/2.0\r\nVia: x\r\n\r\n");
    }

    #[test]
    fn test_remove_hf_idx() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.remove_hf_idx(&tag(), -1).unwrap(), Outcome::Applied(1));
        let out = built(msg);
        assert!(out.contains("X-Tag: one\r\nX-Tag: two\r\n"));
        assert!(!out.contains("three"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.remove_hf_idx(&tag(), 0).unwrap(), Outcome::Applied(1));
        assert!(!built(msg).contains("one"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.remove_hf_idx(&tag(), 3).unwrap(), Outcome::IndexOutOfRange);
        assert_eq!(msg.remove_hf_idx(&tag(), -4).unwrap(), Outcome::IndexOutOfRange);
        assert_eq!(msg.remove_hf_idx(&tag(), 3).unwrap().code(), 2);
        assert!(msg.edits().is_empty());
    }

    #[test]
    fn test_remove_hf_re_and_exp() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.remove_hf_re(&Pattern::new("^x-").unwrap()).unwrap(), Outcome::Applied(3));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        let matching = Pattern::new("^(x-tag|call-id)$").unwrap();
        let skip = Pattern::new("^call").unwrap();
        assert_eq!(msg.remove_hf_exp(&matching, &skip).unwrap(), Outcome::Applied(3));
        assert!(built(msg).contains("Call-ID: c1\r\n"));
    }

    #[test]
    fn test_remove_hf_match() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        let out = msg.remove_hf_match(&tag(), MatchOp::Eq, MatchValue::Literal(b"two")).unwrap();
        assert_eq!(out, Outcome::Applied(1));
        assert!(!built(msg).contains("two"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        let out = msg.remove_hf_match(&tag(), MatchOp::Ne, MatchValue::Literal(b"two")).unwrap();
        assert_eq!(out, Outcome::Applied(2));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        let out = msg.remove_hf_match(&tag(), MatchOp::In, MatchValue::Literal(b"hre")).unwrap();
        assert_eq!(out, Outcome::Applied(1));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        let re = Pattern::new("^t").unwrap();
        let out = msg.remove_hf_match(&tag(), MatchOp::Re, MatchValue::Pattern(&re)).unwrap();
        assert_eq!(out, Outcome::Applied(2));
        assert!(built(msg).contains("X-Tag: one\r\n"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        let out = msg.remove_hf_match(&tag(), MatchOp::Eq, MatchValue::Literal(b"four")).unwrap();
        assert_eq!(out, Outcome::NotFound);
    }

    #[test]
    fn test_presence() {
        let msg = SipMessage::new(TAGGED).unwrap();
        assert_eq!(msg.is_present_hf(&tag()).unwrap(), Outcome::Applied(1));
        assert_eq!(msg.is_present_hf(&HeaderMatcher::ByType(HeaderType::Contact)).unwrap(), Outcome::NotFound);
        assert_eq!(msg.is_present_hf_re(&Pattern::new("^call-").unwrap()).unwrap(), Outcome::Applied(1));
        assert_eq!(msg.is_present_hf_re(&Pattern::new("^route").unwrap()).unwrap(), Outcome::NotFound);
    }

    #[test]
    fn test_append_hf() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.append_hf("X-New: 1\r\n", None).unwrap();
        assert!(built(msg).ends_with("X-Tag: three\r\nX-New: 1\r\n\r\n"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.append_hf("X-New: 1\r\n", Some(&HeaderMatcher::ByType(HeaderType::Via))).unwrap();
        assert!(built(msg).contains("Via: SIP/2.0/UDP a\r\nX-New: 1\r\nX-Tag: one\r\n"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        assert!(msg.append_hf("X-Bad: 1", None).is_err());
        assert!(msg.edits().is_empty());
    }

    #[test]
    fn test_insert_hf() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.insert_hf("X-First: 1\r\n", None).unwrap();
        assert!(built(msg).starts_with("OPTIONS sip:host.com SIP/2.0\r\nX-First: 1\r\nVia:"));

        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.insert_hf("X-New: 1\r\n", Some(&tag())).unwrap();
        assert!(built(msg).contains("Via: SIP/2.0/UDP a\r\nX-New: 1\r\nX-Tag: one\r\n"));
    }

    #[test]
    fn test_append_then_insert_at_same_header() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.append_hf("X-A: 1\r\n", Some(&HeaderMatcher::ByType(HeaderType::Via))).unwrap();
        msg.insert_hf("X-B: 2\r\n", Some(&tag())).unwrap();
        assert!(built(msg).contains("Via: SIP/2.0/UDP a\r\nX-A: 1\r\nX-B: 2\r\nX-Tag: one\r\n"));
    }

    #[test]
    fn test_append_urihf() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.append_urihf("Contact: <", ">\r\n").unwrap();
        assert!(built(msg).ends_with("Contact: <sip:host.com>\r\n\r\n"));

        let mut reply = SipMessage::new("SIP/2.0 200 OK\r\nVia: x\r\n\r\n").unwrap();
        assert_eq!(reply.append_urihf("Contact: <", ">\r\n").unwrap(), Outcome::NotFound);
    }

    #[test]
    fn test_append_to_reply() {
        let mut msg = SipMessage::new(TAGGED).unwrap();
        msg.append_to_reply("Retry-After: 30\r\n").unwrap();
        assert_eq!(msg.reply_lumps().headers, vec![b"Retry-After: 30\r\n".to_vec()]);
        // the forwarded message is untouched
        assert_eq!(built(msg), TAGGED);
    }
}
