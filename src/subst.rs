//! sed-style substitution expressions: `s/pattern/replacement/flags`
//!
//! The delimiter is whatever follows the leading `s`. Flags:
//! `i` case-insensitive, `g` replace every match, `s` newline-sensitive
//! matching (`.` stops at line ends, `^`/`$` match at line boundaries).
//!
//! Replacement escapes: `\0`..`\9` back-references, `\u` the request URI,
//! `\n`, `\r`, `\t`, `\\` and an escaped delimiter. `$name` and
//! `$name(arg)` expand message variables.
//!
//! Back-reference indices are checked when the expression runs, not when
//! it is compiled.

use crate::error::{ResourceType, TextopsError, TextopsResult};
use crate::limits::{DEFAULT_MAX_MATCHES, MAX_BACKREFS};
use crate::pattern::{Bol, Groups, Pattern, PatternFlags};
use std::borrow::Cow;
use tracing::{debug, error};

/// Values a replacement may pull from the message being rewritten
pub trait SubstContext {
    fn request_uri(&self) -> Option<&[u8]>;
    fn variable(&self, name: &str) -> Option<Cow<'_, [u8]>>;
}

/// Context with no message behind it
impl SubstContext for () {
    fn request_uri(&self) -> Option<&[u8]> {
        None
    }

    fn variable(&self, _name: &str) -> Option<Cow<'_, [u8]>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplacePart {
    Literal(Vec<u8>),
    Backref(usize),
    RequestUri,
    Variable(String),
}

/// One computed edit, relative to the start of the scanned text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub offset: usize,
    pub size: usize,
    pub bytes: Vec<u8>,
}

/// A compiled substitution, immutable after [`SubstExpr::parse`]
#[derive(Debug, Clone)]
pub struct SubstExpr {
    source: String,
    pattern: Pattern,
    replacement: Vec<ReplacePart>,
    global: bool,
    max_matches: usize,
}

impl SubstExpr {
    pub fn parse(expr: &str) -> TextopsResult<SubstExpr> {
        let bad = |reason: &str| TextopsError::bad_pattern(expr, reason);
        let bytes = expr.as_bytes();
        if bytes.len() < 4 || bytes[0] != b's' {
            return Err(bad("expression must look like s/re/repl/flags"));
        }
        let delim = bytes[1];
        if delim == b'\\' || delim.is_ascii_whitespace() || delim.is_ascii_alphanumeric() {
            return Err(bad("invalid delimiter"));
        }

        let (re_src, rest) = split_pattern(&bytes[2..], delim).ok_or_else(|| bad("unterminated pattern"))?;
        let (replacement, flag_bytes) =
            parse_replacement(rest, delim).map_err(|reason| bad(reason.as_str()))?;

        let mut flags = PatternFlags { icase: false, newline: false };
        let mut global = false;
        for &flag in flag_bytes {
            match flag {
                b'i' => flags.icase = true,
                b'g' => global = true,
                b's' => flags.newline = true,
                other => return Err(bad(format!("unknown flag '{}'", other as char).as_str())),
            }
        }

        let re_src = String::from_utf8(re_src).map_err(|_| bad("pattern is not valid UTF-8"))?;
        let pattern = Pattern::with_flags(&re_src, flags)
            .map_err(|err| match err {
                TextopsError::BadPattern { reason, .. } => bad(reason.as_str()),
                other => other,
            })?;

        debug!(expr, global, parts = replacement.len(), "compiled substitution");
        Ok(SubstExpr {
            source: expr.to_string(),
            pattern,
            replacement,
            global,
            max_matches: DEFAULT_MAX_MATCHES,
        })
    }

    /// Cap on matches a single run may produce
    pub fn with_max_matches(mut self, max_matches: usize) -> Self {
        self.max_matches = max_matches;
        self
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn replacement(&self) -> &[ReplacePart] {
        &self.replacement
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Match over `text` and compute replacements. `Ok(None)` means no match.
    ///
    /// The first search treats offset 0 as a line start; later searches
    /// only see a line start right after a line terminator.
    pub fn run(&self, text: &[u8], ctx: &dyn SubstContext) -> TextopsResult<Option<Vec<Replacement>>> {
        self.run_capped(text, ctx, self.max_matches)
    }

    /// [`run`](Self::run) with the match cap lowered to `max_matches`
    pub fn run_capped(
        &self,
        text: &[u8],
        ctx: &dyn SubstContext,
        max_matches: usize,
    ) -> TextopsResult<Option<Vec<Replacement>>> {
        let max_matches = max_matches.min(self.max_matches);
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < text.len() || (pos == 0 && text.is_empty()) {
            let groups = match self.pattern.captures_at(text, pos, Bol::NotBol) {
                Some(groups) => groups,
                None => break,
            };
            let span = groups.span();
            if span.is_empty() {
                error!(expr = %self.source, offset = span.start, "empty match");
                return Err(TextopsError::malformed(
                    "pattern matched the empty string",
                    Some(span.start),
                    Some(self.source.clone()),
                ));
            }
            if out.len() >= max_matches {
                return Err(TextopsError::resource_error(
                    ResourceType::Matches,
                    out.len() as u64 + 1,
                    max_matches as u64,
                ));
            }
            let bytes = self.expand(text, &groups, ctx)?;
            out.push(Replacement { offset: span.start, size: span.len(), bytes });
            pos = span.end;
            if !self.global {
                break;
            }
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    /// Run and splice the result into a new string. `Ok(None)` on no match.
    pub fn apply(&self, text: &[u8], ctx: &dyn SubstContext) -> TextopsResult<Option<(Vec<u8>, usize)>> {
        let Some(replacements) = self.run(text, ctx)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(text.len());
        let mut pos = 0;
        for rpl in &replacements {
            out.extend_from_slice(&text[pos..rpl.offset]);
            out.extend_from_slice(&rpl.bytes);
            pos = rpl.offset + rpl.size;
        }
        out.extend_from_slice(&text[pos..]);
        Ok(Some((out, replacements.len())))
    }

    fn expand(&self, text: &[u8], groups: &Groups, ctx: &dyn SubstContext) -> TextopsResult<Vec<u8>> {
        let mut out = Vec::new();
        for part in &self.replacement {
            match part {
                ReplacePart::Literal(bytes) => out.extend_from_slice(bytes),
                ReplacePart::Backref(n) => {
                    if *n >= groups.len() {
                        error!(expr = %self.source, backref = n, "invalid back-reference");
                        return Err(TextopsError::bad_pattern(
                            self.source.clone(),
                            format!("back-reference \\{} exceeds {} groups", n, groups.len() - 1),
                        ));
                    }
                    if let Some(range) = groups.get(*n) {
                        out.extend_from_slice(&text[range]);
                    }
                }
                ReplacePart::RequestUri => {
                    if let Some(uri) = ctx.request_uri() {
                        out.extend_from_slice(uri);
                    }
                }
                ReplacePart::Variable(name) => {
                    if let Some(value) = ctx.variable(name) {
                        out.extend_from_slice(&value);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Split off the pattern up to the first unescaped delimiter. An escaped
/// delimiter becomes a plain one, every other escape is kept for the regex.
fn split_pattern(bytes: &[u8], delim: u8) -> Option<(Vec<u8>, &[u8])> {
    let mut re = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                if bytes[i + 1] != delim {
                    re.push(b'\\');
                }
                re.push(bytes[i + 1]);
                i += 2;
            }
            b if b == delim => return Some((re, &bytes[i + 1..])),
            b => {
                re.push(b);
                i += 1;
            }
        }
    }
    None
}

fn parse_replacement(bytes: &[u8], delim: u8) -> Result<(Vec<ReplacePart>, &[u8]), String> {
    let mut parts = Vec::new();
    let mut lit = Vec::new();
    let mut i = 0;
    let flush = |lit: &mut Vec<u8>, parts: &mut Vec<ReplacePart>| {
        if !lit.is_empty() {
            parts.push(ReplacePart::Literal(std::mem::take(lit)));
        }
    };
    while i < bytes.len() {
        let b = bytes[i];
        if b == delim {
            flush(&mut lit, &mut parts);
            return Ok((parts, &bytes[i + 1..]));
        }
        match b {
            b'\\' => {
                let esc = *bytes.get(i + 1).ok_or("trailing backslash")?;
                match esc {
                    b'0'..=b'9' => {
                        let n = (esc - b'0') as usize;
                        if n >= MAX_BACKREFS {
                            return Err(format!("back-reference \\{} too large", n));
                        }
                        flush(&mut lit, &mut parts);
                        parts.push(ReplacePart::Backref(n));
                    }
                    b'u' => {
                        flush(&mut lit, &mut parts);
                        parts.push(ReplacePart::RequestUri);
                    }
                    b'n' => lit.push(b'\n'),
                    b'r' => lit.push(b'\r'),
                    b't' => lit.push(b'\t'),
                    b'\\' => lit.push(b'\\'),
                    e if e == delim => lit.push(e),
                    other => return Err(format!("unknown escape '\\{}'", other as char)),
                }
                i += 2;
            }
            b'$' => match variable_len(&bytes[i + 1..]) {
                Some(len) => {
                    flush(&mut lit, &mut parts);
                    let name = String::from_utf8_lossy(&bytes[i + 1..i + 1 + len]).into_owned();
                    parts.push(ReplacePart::Variable(name));
                    i += 1 + len;
                }
                None => {
                    lit.push(b'$');
                    i += 1;
                }
            },
            _ => {
                lit.push(b);
                i += 1;
            }
        }
    }
    Err("unterminated replacement".to_string())
}

/// Length of a `name` or `name(arg)` variable reference, if one starts here
fn variable_len(bytes: &[u8]) -> Option<usize> {
    let name_len = bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_' || **b == b'.')
        .count();
    if name_len == 0 {
        return None;
    }
    if bytes.get(name_len) == Some(&b'(') {
        let close = bytes[name_len..].iter().position(|b| *b == b')')?;
        return Some(name_len + close + 1);
    }
    Some(name_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Vars {
        uri: Vec<u8>,
        vars: HashMap<String, Vec<u8>>,
    }

    impl SubstContext for Vars {
        fn request_uri(&self) -> Option<&[u8]> {
            Some(&self.uri)
        }

        fn variable(&self, name: &str) -> Option<Cow<'_, [u8]>> {
            self.vars.get(name).map(|v| Cow::Borrowed(v.as_slice()))
        }
    }

    fn subst(expr: &str, text: &str) -> Option<String> {
        let se = SubstExpr::parse(expr).unwrap();
        se.apply(text.as_bytes(), &())
            .unwrap()
            .map(|(out, _)| String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_simple_replace() {
        assert_eq!(subst("s/1/99/", "A: 1\r\nB: 2\r\n").unwrap(), "A: 99\r\nB: 2\r\n");
    }

    #[test]
    fn test_global_and_icase() {
        assert_eq!(subst("s/a/b/", "aAa").unwrap(), "bAa");
        assert_eq!(subst("s/a/b/g", "aAa").unwrap(), "bAb");
        assert_eq!(subst("s/a/b/gi", "aAa").unwrap(), "bbb");
    }

    #[test]
    fn test_no_match_is_none() {
        assert_eq!(subst("s/zzz/y/", "abc"), None);
    }

    #[test]
    fn test_backrefs_and_escapes() {
        assert_eq!(
            subst(r"s/(\w+)@(\w+)/\2\t\1\\/", "alice@home").unwrap(),
            "home\talice\\"
        );
        assert_eq!(subst(r"s#a\#b#x\#y#", "a#b").unwrap(), "x#y");
    }

    #[test]
    fn test_anchor_rearms_only_after_line_terminator() {
        assert_eq!(subst("s/^x/Q/g", "xx\nxy").unwrap(), "Qx\nxy");
        assert_eq!(subst("s/^x/Q/gs", "xx\nxy").unwrap(), "Qx\nQy");
    }

    #[test]
    fn test_anchor_rearms_after_matched_terminator() {
        assert_eq!(subst("s/^a\r\n/X/g", "a\r\na\r\nb").unwrap(), "XXb");
        assert_eq!(subst("s/^a\n/X/g", "a\na\nb").unwrap(), "XXb");
        assert_eq!(subst("s/^a\r/X/g", "a\ra\rb").unwrap(), "XXb");
    }

    #[test]
    fn test_empty_match_rejected() {
        let se = SubstExpr::parse("s/x*/y/").unwrap();
        let err = se.run(b"abc", &()).unwrap_err();
        assert!(matches!(err, TextopsError::Malformed { .. }));
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn test_out_of_range_backref_fails_at_run_time() {
        let se = SubstExpr::parse(r"s/(a)/\3/").unwrap();
        let err = se.run(b"a", &()).unwrap_err();
        assert_eq!(err.code(), -2);
        // no match means no error either
        assert!(se.run(b"b", &()).unwrap().is_none());
    }

    #[test]
    fn test_parse_errors() {
        for expr in ["x/a/b/", "s/a/b", "s/a/b/q", "s/(/b/", r"s/a/\q/", "saab"] {
            let err = SubstExpr::parse(expr).unwrap_err();
            assert_eq!(err.category(), "pattern", "{}", expr);
        }
    }

    #[test]
    fn test_context_parts() {
        let ctx = Vars {
            uri: b"sip:bob@example.com".to_vec(),
            vars: HashMap::from([("fU".to_string(), b"alice".to_vec())]),
        };
        let se = SubstExpr::parse(r"s/X/<\u|$fU|$none|$/").unwrap();
        let (out, n) = se.apply(b"aXb", &ctx).unwrap().unwrap();
        assert_eq!(n, 1);
        assert_eq!(out, b"a<sip:bob@example.com|alice||$b");
    }

    #[test]
    fn test_replacement_offsets() {
        let se = SubstExpr::parse("s/b+/X/g").unwrap();
        let rpl = se.run(b"abbcb", &()).unwrap().unwrap();
        assert_eq!(
            rpl,
            vec![
                Replacement { offset: 1, size: 2, bytes: b"X".to_vec() },
                Replacement { offset: 4, size: 1, bytes: b"X".to_vec() },
            ]
        );
    }

    #[test]
    fn test_match_cap() {
        let se = SubstExpr::parse("s/a/b/g").unwrap().with_max_matches(2);
        let err = se.run(b"aaa", &()).unwrap_err();
        assert_eq!(err.category(), "resource");
    }

    #[test]
    fn test_run_capped_lowers_the_cap() {
        let se = SubstExpr::parse("s/a/b/g").unwrap();
        let err = se.run_capped(b"aaaa", &(), 1).unwrap_err();
        assert_eq!(err.code(), -4);
        assert_eq!(se.run_capped(b"aaaa", &(), 4).unwrap().map(|r| r.len()), Some(4));
        // cannot raise the expression's own cap
        let se = se.with_max_matches(2);
        assert!(se.run_capped(b"aaa", &(), 10).is_err());
    }
}
