//! Search, replace and substitution rewriters
//!
//! Each rewriter scans one region of the original buffer, decides every
//! edit first, then records all of them at once. A failure while recording
//! rolls back the lumps of that call only.

use crate::error::{ResourceType, TextopsError, TextopsResult};
use crate::lump::{LumpScope, Payload};
use crate::msg::{uri_user_range, SipMessage};
use crate::pattern::{Bol, Pattern};
use crate::strops::find_bytes;
use crate::subst::{Replacement, SubstExpr};
use crate::types::{HeaderMatcher, HfSelect, Outcome, ReplaceMode, TextRange};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error};

/// Part of the message a rewriter works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// The whole buffer, start line included
    Whole,
    /// Everything after the start line
    AfterStartLine,
    /// Header lines, up to the empty line
    Headers,
    Body,
}

impl Region {
    fn scope(self) -> LumpScope {
        match self {
            Region::Body => LumpScope::Body,
            _ => LumpScope::Message,
        }
    }
}

/// How repeated matching treats `^` after the first match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rearm {
    /// Line start again right after a line terminator
    AfterNewline,
    /// Never again within this pass
    Never,
}

impl SipMessage {
    /// Byte range of `region`, None when it is absent or empty
    pub fn region(&self, region: Region) -> TextopsResult<Option<TextRange>> {
        let range = match region {
            Region::Whole => Some(TextRange::new(0, self.len())),
            Region::AfterStartLine => Some(TextRange::new(self.header_start(), self.len())),
            Region::Headers => Some(TextRange::new(self.header_start(), self.eoh()?)),
            Region::Body => self.body_range()?,
        };
        Ok(range.filter(|r| !r.is_empty()))
    }

    fn region_or_log(&self, region: Region) -> TextopsResult<Option<TextRange>> {
        let range = self.region(region)?;
        if range.is_none() {
            debug!(?region, "region is empty");
        }
        Ok(range)
    }

    /// Record replacements computed against `base`
    fn record_replacements(&mut self, base: usize, scope: LumpScope, replacements: Vec<Replacement>) -> TextopsResult<Outcome> {
        let count = replacements.len();
        self.atomically(|msg| {
            for rpl in replacements {
                let offset = base + rpl.offset;
                debug!(offset, size = rpl.size, "replacing");
                let handle = msg.edits_mut().delete_in(offset, rpl.size, scope)?;
                msg.edits_mut().insert_after(handle, rpl.bytes)?;
            }
            Ok(Outcome::from_count(count))
        })
    }

    /// Replace each of `spans` (relative to `base`) with the same value
    fn record_spans(&mut self, base: usize, scope: LumpScope, spans: &[Range<usize>], value: &[u8]) -> TextopsResult<Outcome> {
        if spans.is_empty() {
            return Ok(Outcome::NotFound);
        }
        // one shared copy of the value for every match
        let shared: Arc<[u8]> = Arc::from(value);
        self.atomically(|msg| {
            for span in spans {
                let handle = msg.edits_mut().delete_in(base + span.start, span.len(), scope)?;
                msg.edits_mut().insert_after(handle, Payload::Borrowed(shared.clone()))?;
            }
            Ok(Outcome::Applied(spans.len()))
        })
    }

    fn find_in(&self, re: &Pattern, region: Region) -> TextopsResult<Option<(TextRange, Range<usize>)>> {
        let Some(range) = self.region_or_log(region)? else {
            return Ok(None);
        };
        Ok(re.find_at(range.slice(self.buf()), 0, Bol::Armed).map(|m| (range, m)))
    }

    fn replace_first(&mut self, re: &Pattern, value: &[u8], region: Region) -> TextopsResult<Outcome> {
        match self.find_in(re, region)? {
            Some((range, m)) => self.record_spans(range.start, region.scope(), &[m], value),
            None => Ok(Outcome::NotFound),
        }
    }

    fn replace_repeated(&mut self, re: &Pattern, value: &[u8], region: Region, rearm: Rearm) -> TextopsResult<Outcome> {
        let Some(range) = self.region_or_log(region)? else {
            return Ok(Outcome::NotFound);
        };
        let text = range.slice(self.buf());
        let mut spans = Vec::new();
        let mut pos = 0;
        let mut bol = Bol::Armed;
        while pos < text.len() {
            let Some(m) = re.find_at(text, pos, bol) else {
                break;
            };
            if m.is_empty() {
                error!(pattern = re.as_str(), offset = range.start + m.start, "matched string is empty");
                return Err(TextopsError::malformed(
                    "pattern matched the empty string",
                    Some(range.start + m.start),
                    Some(re.as_str().to_string()),
                ));
            }
            self.check_match_cap(spans.len())?;
            pos = m.end;
            spans.push(m);
            bol = match rearm {
                Rearm::AfterNewline => Bol::NotBol,
                Rearm::Never => Bol::Disarmed,
            };
        }
        self.record_spans(range.start, region.scope(), &spans, value)
    }

    fn replace_literal(&mut self, key: &[u8], value: &[u8], mode: ReplaceMode, region: Region) -> TextopsResult<Outcome> {
        if key.is_empty() {
            return Err(TextopsError::invalid_param("key", "empty search string"));
        }
        let Some(range) = self.region_or_log(region)? else {
            return Ok(Outcome::NotFound);
        };
        let text = range.slice(self.buf());
        let mut spans = Vec::new();
        let mut pos = 0;
        while let Some(at) = find_bytes(text, key, pos) {
            self.check_match_cap(spans.len())?;
            spans.push(at..at + key.len());
            pos = at + key.len();
            if mode == ReplaceMode::First {
                break;
            }
        }
        self.record_spans(range.start, region.scope(), &spans, value)
    }

    /// Fails once `found` matches already fill the per-call cap
    fn check_match_cap(&self, found: usize) -> TextopsResult<()> {
        let max = self.limits().max_matches;
        if found >= max {
            error!(max, "too many matches");
            return Err(TextopsError::resource_error(ResourceType::Matches, found as u64 + 1, max as u64));
        }
        Ok(())
    }

    fn subst_in(&mut self, se: &SubstExpr, region: Region) -> TextopsResult<Outcome> {
        let Some(range) = self.region_or_log(region)? else {
            return Ok(Outcome::NotFound);
        };
        match se.run_capped(range.slice(self.buf()), &*self, self.limits().max_matches)? {
            Some(replacements) => self.record_replacements(range.start, region.scope(), replacements),
            None => Ok(Outcome::NotFound),
        }
    }

    /// Does `re` match anywhere in the message
    pub fn search(&self, re: &Pattern) -> Outcome {
        Outcome::from_count(re.find_at(self.buf(), 0, Bol::Armed).is_some() as usize)
    }

    pub fn search_body(&self, re: &Pattern) -> TextopsResult<Outcome> {
        Ok(Outcome::from_count(self.find_in(re, Region::Body)?.is_some() as usize))
    }

    /// Insert `value` right after the first match following the start line
    pub fn search_append(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.append_after_match(re, value.as_ref(), Region::AfterStartLine)
    }

    pub fn search_append_body(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.append_after_match(re, value.as_ref(), Region::Body)
    }

    fn append_after_match(&mut self, re: &Pattern, value: &[u8], region: Region) -> TextopsResult<Outcome> {
        let Some((range, m)) = self.find_in(re, region)? else {
            return Ok(Outcome::NotFound);
        };
        let offset = range.start + m.end;
        self.atomically(|msg| {
            let anchor = msg.edits_mut().anchor_in(offset, region.scope())?;
            msg.edits_mut().insert_after(anchor, value)?;
            Ok(Outcome::Applied(1))
        })
    }

    /// Replace the first match after the start line
    pub fn replace(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.replace_first(re, value.as_ref(), Region::AfterStartLine)
    }

    pub fn replace_body(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.replace_first(re, value.as_ref(), Region::Body)
    }

    /// Replace the first match inside the header section
    pub fn replace_hdrs(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.replace_first(re, value.as_ref(), Region::Headers)
    }

    /// Replace every match after the start line; `^` matches again at
    /// each new line start
    pub fn replace_all(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.replace_repeated(re, value.as_ref(), Region::AfterStartLine, Rearm::AfterNewline)
    }

    pub fn replace_body_all(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.replace_repeated(re, value.as_ref(), Region::Body, Rearm::AfterNewline)
    }

    /// Replace every match in the body in one pass; after the first match
    /// `^` never matches again
    pub fn replace_body_atonce(&mut self, re: &Pattern, value: impl AsRef<[u8]>) -> TextopsResult<Outcome> {
        self.replace_repeated(re, value.as_ref(), Region::Body, Rearm::Never)
    }

    /// Literal (non-pattern) replace after the start line
    pub fn replace_str(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, mode: ReplaceMode) -> TextopsResult<Outcome> {
        self.replace_literal(key.as_ref(), value.as_ref(), mode, Region::AfterStartLine)
    }

    pub fn replace_body_str(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, mode: ReplaceMode) -> TextopsResult<Outcome> {
        self.replace_literal(key.as_ref(), value.as_ref(), mode, Region::Body)
    }

    pub fn replace_hdrs_str(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, mode: ReplaceMode) -> TextopsResult<Outcome> {
        self.replace_literal(key.as_ref(), value.as_ref(), mode, Region::Headers)
    }

    /// sed-style substitution over everything after the start line
    pub fn subst(&mut self, se: &SubstExpr) -> TextopsResult<Outcome> {
        self.subst_in(se, Region::AfterStartLine)
    }

    pub fn subst_body(&mut self, se: &SubstExpr) -> TextopsResult<Outcome> {
        self.subst_in(se, Region::Body)
    }

    /// Substitute on the request-URI; the result becomes the new URI
    pub fn subst_uri(&mut self, se: &SubstExpr) -> TextopsResult<Outcome> {
        let Some(uri) = self.request_uri() else {
            debug!("no request-URI on a reply");
            return Ok(Outcome::NotFound);
        };
        match se.apply(uri, &*self)? {
            Some((new_uri, _)) => {
                debug!(new_uri = %String::from_utf8_lossy(&new_uri), "rewrote request-URI");
                self.set_new_uri(new_uri)?;
                Ok(Outcome::Applied(1))
            }
            None => Ok(Outcome::NotFound),
        }
    }

    /// Substitute on the user part of the request-URI
    pub fn subst_user(&mut self, se: &SubstExpr) -> TextopsResult<Outcome> {
        let Some(uri) = self.request_uri() else {
            return Ok(Outcome::NotFound);
        };
        let uri = uri.to_vec();
        let user_range = uri_user_range(&uri);
        let user = user_range.clone().map_or(&b""[..], |r| &uri[r]);
        let Some((new_user, _)) = se.apply(user, &*self)? else {
            return Ok(Outcome::NotFound);
        };

        let mut rebuilt = Vec::with_capacity(uri.len() + new_user.len());
        match user_range {
            Some(range) => {
                let at = uri[range.end..].iter().position(|b| *b == b'@').map_or(range.end, |p| p + range.end);
                rebuilt.extend_from_slice(&uri[..range.start]);
                if new_user.is_empty() {
                    rebuilt.extend_from_slice(&uri[at + 1..]);
                } else {
                    rebuilt.extend_from_slice(&new_user);
                    rebuilt.extend_from_slice(&uri[range.end..]);
                }
            }
            None => {
                let colon = uri.iter().position(|b| *b == b':').ok_or_else(|| {
                    TextopsError::malformed("request-URI without scheme", None, None)
                })?;
                rebuilt.extend_from_slice(&uri[..colon + 1]);
                if !new_user.is_empty() {
                    rebuilt.extend_from_slice(&new_user);
                    rebuilt.push(b'@');
                }
                rebuilt.extend_from_slice(&uri[colon + 1..]);
            }
        }
        self.set_new_uri(rebuilt)?;
        Ok(Outcome::Applied(1))
    }

    /// Header bodies selected by `matcher` and `select`
    fn selected_bodies(&self, matcher: &HeaderMatcher, select: HfSelect) -> TextopsResult<Vec<TextRange>> {
        let bodies: Vec<TextRange> = self.headers_matching(matcher)?.map(|h| h.body).collect();
        Ok(match select {
            HfSelect::All => bodies,
            HfSelect::First => bodies.into_iter().take(1).collect(),
            HfSelect::Last => bodies.into_iter().last().into_iter().collect(),
        })
    }

    /// Substitute inside the bodies of the selected headers
    pub fn subst_hf(&mut self, matcher: &HeaderMatcher, se: &SubstExpr, select: HfSelect) -> TextopsResult<Outcome> {
        let mut edits = Vec::new();
        for body in self.selected_bodies(matcher, select)? {
            let remaining = self.limits().max_matches.saturating_sub(edits.len());
            if let Some(replacements) = se.run_capped(body.slice(self.buf()), &*self, remaining)? {
                edits.extend(replacements.into_iter().map(|mut rpl| {
                    rpl.offset += body.start;
                    rpl
                }));
            }
        }
        if edits.is_empty() {
            return Ok(Outcome::NotFound);
        }
        self.record_replacements(0, LumpScope::Message, edits)
    }

    /// Does `re` match the body of a selected header
    pub fn search_hf(&self, matcher: &HeaderMatcher, re: &Pattern, select: HfSelect) -> TextopsResult<Outcome> {
        let found = self
            .selected_bodies(matcher, select)?
            .iter()
            .any(|body| re.find_at(body.slice(self.buf()), 0, Bol::Armed).is_some());
        Ok(Outcome::from_count(found as usize))
    }
}
