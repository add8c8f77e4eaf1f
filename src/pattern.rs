//! Compiled patterns with start-of-line anchoring control
//!
//! Matching works on explicit byte spans, never on NUL-terminated runs, so
//! the message buffer is never touched while a pattern runs.
//!
//! `^` eligibility is decided per search through [`Bol`]:
//! - `Armed`: the search start counts as a line start.
//! - `NotBol`: the search start is a line start only if it is offset 0 or
//!   the byte before it is `\n` or `\r`, whatever the compile flags.
//! - `Disarmed`: `^` never matches. Implemented with a second program in
//!   which every start-of-line assertion is replaced by a failing one.

use crate::error::{TextopsError, TextopsResult};
use regex::bytes::{CaptureLocations, Regex, RegexBuilder};
use regex_syntax::hir::{Capture, Hir, HirKind, Look, Repetition};
use regex_syntax::ParserBuilder;
use std::fmt;
use std::ops::Range;

/// Compile flags, the POSIX extended dialect is always on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternFlags {
    pub icase: bool,
    /// `.` does not match line terminators, `^`/`$` match at line boundaries
    pub newline: bool,
}

impl Default for PatternFlags {
    /// Case-insensitive, newline-sensitive
    fn default() -> Self {
        PatternFlags { icase: true, newline: true }
    }
}

/// Start-of-line eligibility for one search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bol {
    Armed,
    NotBol,
    Disarmed,
}

/// Offsets of a match and its groups, absolute in the searched text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Groups {
    spans: Vec<Option<Range<usize>>>,
}

impl Groups {
    /// Whole-match span
    pub fn span(&self) -> Range<usize> {
        self.spans[0].clone().unwrap_or(0..0)
    }

    pub fn get(&self, index: usize) -> Option<Range<usize>> {
        self.spans.get(index).cloned().flatten()
    }

    /// Number of slots, including group 0
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// An immutable compiled pattern, safe to share between threads
#[derive(Clone)]
pub struct Pattern {
    source: String,
    flags: PatternFlags,
    re: Regex,
    /// Present only when the pattern contains a start-of-line assertion
    disarmed: Option<Regex>,
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("source", &self.source)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Pattern {
    /// Compile with the default rewriter flags (case-insensitive, newline mode)
    pub fn new(expr: &str) -> TextopsResult<Pattern> {
        Pattern::with_flags(expr, PatternFlags::default())
    }

    pub fn with_flags(expr: &str, flags: PatternFlags) -> TextopsResult<Pattern> {
        let re = RegexBuilder::new(expr)
            .case_insensitive(flags.icase)
            .multi_line(flags.newline)
            .crlf(flags.newline)
            .dot_matches_new_line(!flags.newline)
            .unicode(false)
            .build()
            .map_err(|err| TextopsError::bad_pattern(expr, err.to_string()))?;

        let hir = ParserBuilder::new()
            .case_insensitive(flags.icase)
            .multi_line(flags.newline)
            .crlf(flags.newline)
            .dot_matches_new_line(!flags.newline)
            .unicode(false)
            .utf8(false)
            .build()
            .parse(expr)
            .map_err(|err| TextopsError::bad_pattern(expr, err.to_string()))?;

        let disarmed = if has_line_start(&hir) {
            let printed = disarm_line_starts(&hir).to_string();
            let compiled = RegexBuilder::new(&printed)
                .unicode(false)
                .build()
                .map_err(|err| TextopsError::bad_pattern(expr, err.to_string()))?;
            Some(compiled)
        } else {
            None
        };

        Ok(Pattern {
            source: expr.to_string(),
            flags,
            re,
            disarmed,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> PatternFlags {
        self.flags
    }

    /// Number of capture slots, including the whole match
    pub fn captures_len(&self) -> usize {
        self.re.captures_len()
    }

    pub fn is_match(&self, text: &[u8]) -> bool {
        self.re.is_match(text)
    }

    /// First match at or after `start`
    pub fn find_at(&self, text: &[u8], start: usize, bol: Bol) -> Option<Range<usize>> {
        if start > text.len() {
            return None;
        }
        match rearm(text, start, bol) {
            Bol::Armed if start > 0 => self
                .re
                .find(&text[start..])
                .map(|m| m.start() + start..m.end() + start),
            Bol::Armed | Bol::NotBol => self.re.find_at(text, start).map(|m| m.range()),
            Bol::Disarmed => self.program(bol).find_at(text, start).map(|m| m.range()),
        }
    }

    /// First match at or after `start`, with capture group offsets
    pub fn captures_at(&self, text: &[u8], start: usize, bol: Bol) -> Option<Groups> {
        if start > text.len() {
            return None;
        }
        let bol = rearm(text, start, bol);
        let re = self.program(bol);
        let mut locs: CaptureLocations = re.capture_locations();
        let shift = match bol {
            Bol::Armed if start > 0 => {
                re.captures_read(&mut locs, &text[start..])?;
                start
            }
            _ => {
                re.captures_read_at(&mut locs, text, start)?;
                0
            }
        };
        let spans = (0..locs.len())
            .map(|i| locs.get(i).map(|(s, e)| s + shift..e + shift))
            .collect();
        Some(Groups { spans })
    }

    fn program(&self, bol: Bol) -> &Regex {
        match (bol, &self.disarmed) {
            (Bol::Disarmed, Some(disarmed)) => disarmed,
            _ => &self.re,
        }
    }
}

/// A search resuming right after a line terminator starts a new line
fn rearm(text: &[u8], start: usize, bol: Bol) -> Bol {
    match bol {
        Bol::NotBol if start > 0 && matches!(text[start - 1], b'\n' | b'\r') => Bol::Armed,
        _ => bol,
    }
}

fn is_line_start(look: Look) -> bool {
    matches!(look, Look::Start | Look::StartLF | Look::StartCRLF)
}

fn has_line_start(hir: &Hir) -> bool {
    match hir.kind() {
        HirKind::Look(look) => is_line_start(*look),
        HirKind::Empty | HirKind::Literal(_) | HirKind::Class(_) => false,
        HirKind::Repetition(rep) => has_line_start(&rep.sub),
        HirKind::Capture(cap) => has_line_start(&cap.sub),
        HirKind::Concat(subs) | HirKind::Alternation(subs) => subs.iter().any(has_line_start),
    }
}

/// Rebuild `hir` with every start-of-line assertion made unsatisfiable
fn disarm_line_starts(hir: &Hir) -> Hir {
    match hir.kind() {
        HirKind::Look(look) if is_line_start(*look) => Hir::fail(),
        HirKind::Empty | HirKind::Literal(_) | HirKind::Class(_) | HirKind::Look(_) => hir.clone(),
        HirKind::Repetition(rep) => Hir::repetition(Repetition {
            min: rep.min,
            max: rep.max,
            greedy: rep.greedy,
            sub: Box::new(disarm_line_starts(&rep.sub)),
        }),
        HirKind::Capture(cap) => Hir::capture(Capture {
            index: cap.index,
            name: cap.name.clone(),
            sub: Box::new(disarm_line_starts(&cap.sub)),
        }),
        HirKind::Concat(subs) => Hir::concat(subs.iter().map(disarm_line_starts).collect()),
        HirKind::Alternation(alts) => Hir::alternation(alts.iter().map(disarm_line_starts).collect()),
    }
}
