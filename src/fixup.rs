//! Typed rewriter parameters prepared once from configuration text
//!
//! Patterns and substitutions are compiled here and shared behind `Arc`,
//! header names are resolved to a [`HeaderMatcher`] once. Per message a
//! parameter is resolved with [`Param::text`] or [`Param::int`]; dropping
//! a parameter releases everything it holds.

use crate::error::{TextopsError, TextopsResult};
use crate::msg::SipMessage;
use crate::pattern::Pattern;
use crate::subst::{SubstContext, SubstExpr};
use crate::types::{HeaderMatcher, HfSelect, MatchOp, ReplaceMode};
use crate::validation::{validate_header_name, validate_numeric};
use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone)]
pub enum Param {
    Text(Vec<u8>),
    Integer(i64),
    Subst(Arc<SubstExpr>),
    Regex(Arc<Pattern>),
    /// `$name`, looked up in the message per use
    Variable(String),
    /// Body of the first header named by the matcher
    Header(HeaderMatcher),
}

/// `$name` or `$name(arg)` as a whole value
fn variable_name(value: &str) -> Option<&str> {
    let name = value.strip_prefix('$')?;
    let simple = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.';
    let valid = match name.find('(') {
        Some(open) => name.ends_with(')') && !name[..open].is_empty() && name[..open].chars().all(simple),
        None => !name.is_empty() && name.chars().all(simple),
    };
    valid.then_some(name)
}

/// Literal text, or a variable reference when the whole value is `$name`
pub fn fixup_text(value: &str) -> Param {
    match variable_name(value) {
        Some(name) => Param::Variable(name.to_string()),
        None => Param::Text(value.as_bytes().to_vec()),
    }
}

/// Integer literal or variable reference
pub fn fixup_int(value: &str) -> TextopsResult<Param> {
    if let Some(name) = variable_name(value) {
        return Ok(Param::Variable(name.to_string()));
    }
    Ok(Param::Integer(validate_numeric("integer", value, None, None)?))
}

pub fn fixup_regex(value: &str) -> TextopsResult<Param> {
    let re = Pattern::new(value).map_err(|err| {
        error!(pattern = value, %err, "bad regular expression");
        err
    })?;
    Ok(Param::Regex(Arc::new(re)))
}

pub fn fixup_subst(value: &str) -> TextopsResult<Param> {
    let se = SubstExpr::parse(value).map_err(|err| {
        error!(expr = value, %err, "bad substitution");
        err
    })?;
    Ok(Param::Subst(Arc::new(se)))
}

/// Header name, resolved to a type tag for well-known headers
pub fn fixup_header_name(value: &str) -> TextopsResult<Param> {
    Ok(Param::Header(fixup_matcher(value)?))
}

pub fn fixup_matcher(value: &str) -> TextopsResult<HeaderMatcher> {
    validate_header_name(value)?;
    Ok(HeaderMatcher::from_name(value))
}

fn fixup_flag<T: FromStr>(name: &str, value: &str) -> TextopsResult<T> {
    T::from_str(value).map_err(|_| TextopsError::invalid_param(name, format!("unknown value '{}'", value)))
}

/// `eq`, `ne`, `in` or `re`, any case
pub fn fixup_match_op(value: &str) -> TextopsResult<MatchOp> {
    fixup_flag("operator", value)
}

/// `a`, `f` or `l`; empty selects all
pub fn fixup_select(value: &str) -> TextopsResult<HfSelect> {
    if value.is_empty() {
        return Ok(HfSelect::default());
    }
    fixup_flag("flags", value)
}

/// `f` or `a`; empty replaces all
pub fn fixup_replace_mode(value: &str) -> TextopsResult<ReplaceMode> {
    if value.is_empty() {
        return Ok(ReplaceMode::default());
    }
    fixup_flag("mode", value)
}

impl Param {
    pub fn kind(&self) -> &'static str {
        match self {
            Param::Text(_) => "text",
            Param::Integer(_) => "integer",
            Param::Subst(_) => "subst",
            Param::Regex(_) => "regex",
            Param::Variable(_) => "variable",
            Param::Header(_) => "header",
        }
    }

    /// String value for `msg`
    pub fn text<'a>(&'a self, msg: &'a SipMessage) -> TextopsResult<Cow<'a, [u8]>> {
        match self {
            Param::Text(text) => Ok(Cow::Borrowed(text)),
            Param::Integer(n) => Ok(Cow::Owned(n.to_string().into_bytes())),
            Param::Variable(name) => msg
                .variable(name)
                .ok_or_else(|| TextopsError::invalid_param(name.as_str(), "variable has no value")),
            Param::Header(matcher) => match msg.header(matcher)? {
                Some(field) => Ok(Cow::Borrowed(field.body.slice(msg.buf()))),
                None => Err(TextopsError::invalid_param(matcher.name(), "header not present")),
            },
            Param::Subst(_) | Param::Regex(_) => Err(TextopsError::invalid_param(self.kind(), "not a string value")),
        }
    }

    /// Integer value for `msg`
    pub fn int(&self, msg: &SipMessage) -> TextopsResult<i64> {
        match self {
            Param::Integer(n) => Ok(*n),
            Param::Text(_) | Param::Variable(_) | Param::Header(_) => {
                let text = self.text(msg)?;
                let text = std::str::from_utf8(&text)
                    .map_err(|_| TextopsError::invalid_param(self.kind(), "not a number"))?;
                validate_numeric(self.kind(), text, None, None)
            }
            Param::Subst(_) | Param::Regex(_) => Err(TextopsError::invalid_param(self.kind(), "not an integer value")),
        }
    }

    /// Compiled pattern, compiling a string value on the spot
    pub fn pattern(&self, msg: &SipMessage) -> TextopsResult<Cow<'_, Pattern>> {
        match self {
            Param::Regex(re) => Ok(Cow::Borrowed(re.as_ref())),
            _ => {
                let text = self.text(msg)?;
                let expr = std::str::from_utf8(&text)
                    .map_err(|_| TextopsError::bad_pattern(String::from_utf8_lossy(&text), "not UTF-8"))?;
                Ok(Cow::Owned(Pattern::new(expr)?))
            }
        }
    }

    /// Compiled substitution, parsing a string value on the spot
    pub fn subst(&self, msg: &SipMessage) -> TextopsResult<Cow<'_, SubstExpr>> {
        match self {
            Param::Subst(se) => Ok(Cow::Borrowed(se.as_ref())),
            _ => {
                let text = self.text(msg)?;
                let expr = std::str::from_utf8(&text)
                    .map_err(|_| TextopsError::bad_pattern(String::from_utf8_lossy(&text), "not UTF-8"))?;
                Ok(Cow::Owned(SubstExpr::parse(expr)?))
            }
        }
    }

    pub fn header(&self) -> TextopsResult<&HeaderMatcher> {
        match self {
            Param::Header(matcher) => Ok(matcher),
            _ => Err(TextopsError::invalid_param(self.kind(), "not a header name")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HeaderType;

    const MSG: &str = "INVITE sip:bob@b.com SIP/2.0\r\nMax-Forwards: 70\r\nX-Id: abc\r\n\r\n";

    #[test]
    fn test_fixup_text_and_variable() {
        let msg = SipMessage::new(MSG).unwrap();
        let p = fixup_text("hello");
        assert_eq!(p.text(&msg).unwrap().as_ref(), b"hello");

        let p = fixup_text("$rU");
        assert!(matches!(p, Param::Variable(ref name) if name == "rU"));
        assert_eq!(p.text(&msg).unwrap().as_ref(), b"bob");

        let p = fixup_text("$hdr(X-Id)");
        assert_eq!(p.text(&msg).unwrap().as_ref(), b"abc");

        // not a whole-value reference
        assert!(matches!(fixup_text("cost $5"), Param::Text(_)));
        assert!(fixup_text("$missing").text(&msg).is_err());
    }

    #[test]
    fn test_fixup_int() {
        let msg = SipMessage::new(MSG).unwrap();
        assert_eq!(fixup_int("-1").unwrap().int(&msg).unwrap(), -1);
        assert!(fixup_int("x1").is_err());

        let header = fixup_header_name("Max-Forwards").unwrap();
        assert_eq!(header.int(&msg).unwrap(), 70);
    }

    #[test]
    fn test_fixup_header_name() {
        let p = fixup_header_name("v").unwrap();
        assert_eq!(p.header().unwrap(), &HeaderMatcher::ByType(HeaderType::Via));
        let p = fixup_header_name("X-Id").unwrap();
        assert_eq!(p.header().unwrap(), &HeaderMatcher::ByName("X-Id".to_string()));
        assert!(fixup_header_name(&"x".repeat(253)).is_err());
        assert!(fixup_header_name("").is_err());
    }

    #[test]
    fn test_fixup_compiled() {
        let msg = SipMessage::new(MSG).unwrap();
        assert!(matches!(fixup_regex("^x-").unwrap(), Param::Regex(_)));
        assert!(fixup_regex("(").is_err());
        assert!(fixup_subst("s/a/b/").is_ok());
        assert!(fixup_subst("s/a/b").is_err());

        let dynamic = fixup_text("s/bob/carol/");
        assert_eq!(dynamic.subst(&msg).unwrap().as_str(), "s/bob/carol/");
        assert!(fixup_regex("x").unwrap().text(&msg).is_err());
    }

    #[test]
    fn test_fixup_flags() {
        assert_eq!(fixup_match_op("EQ").unwrap(), MatchOp::Eq);
        assert!(fixup_match_op("gt").is_err());
        assert_eq!(fixup_select("").unwrap(), HfSelect::All);
        assert_eq!(fixup_select("l").unwrap(), HfSelect::Last);
        assert_eq!(fixup_replace_mode("f").unwrap(), ReplaceMode::First);
        assert!(fixup_replace_mode("x").is_err());
    }
}
