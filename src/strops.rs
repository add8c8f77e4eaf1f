//! String predicates and string-level substitution
//!
//! These work on plain byte strings (usually values pulled from a message
//! or the variable store) and never record lumps.

use crate::error::{TextopsError, TextopsResult};
use crate::pattern::{Bol, Pattern, PatternFlags};
use crate::subst::{SubstContext, SubstExpr};
use std::cmp::Ordering;

/// Position of the first `needle` in `hay` at or after `from`
pub fn find_bytes(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > hay.len() || hay.len() - from < needle.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn ifind_bytes(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w.eq_ignore_ascii_case(needle))
}

pub fn cmp_str(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Case-insensitive (ASCII) comparison
pub fn cmp_istr(a: &[u8], b: &[u8]) -> Ordering {
    a.iter()
        .map(u8::to_ascii_lowercase)
        .cmp(b.iter().map(u8::to_ascii_lowercase))
}

pub fn starts_with(s: &[u8], prefix: &[u8]) -> bool {
    s.starts_with(prefix)
}

pub fn ends_with(s: &[u8], suffix: &[u8]) -> bool {
    s.ends_with(suffix)
}

/// 0-based position of `needle` in `txt`
pub fn str_find(txt: &[u8], needle: &[u8]) -> Option<usize> {
    find_bytes(txt, needle, 0)
}

pub fn str_ifind(txt: &[u8], needle: &[u8]) -> Option<usize> {
    ifind_bytes(txt, needle)
}

/// Does any byte of `txt` occur in `chars`
pub fn str_any_in(txt: &[u8], chars: &[u8]) -> bool {
    !chars.is_empty() && txt.iter().any(|b| chars.contains(b))
}

/// Does every byte of `txt` occur in `chars`
pub fn str_all_in(txt: &[u8], chars: &[u8]) -> bool {
    !txt.is_empty() && !chars.is_empty() && txt.iter().all(|b| chars.contains(b))
}

fn list_items(list: &[u8], sep: u8) -> impl Iterator<Item = &[u8]> {
    list.split(move |b| *b == sep)
        .map(crate::locator::trim_bytes)
        .filter(|item| !item.is_empty())
}

/// Is `subject` one of the `sep`-separated items of `list`
pub fn in_list(subject: &[u8], list: &[u8], sep: u8) -> bool {
    list_items(list, sep).any(|item| item == subject)
}

/// Does `subject` start with one of the `sep`-separated items of `list`
pub fn in_list_prefix(subject: &[u8], list: &[u8], sep: u8) -> bool {
    list_items(list, sep).any(|item| subject.starts_with(item))
}

/// Match a dynamic expression against `text` (case-insensitive, newline mode)
pub fn search_str(text: &[u8], expr: &str) -> TextopsResult<bool> {
    if expr.is_empty() {
        return Err(TextopsError::invalid_param("regex", "empty expression"));
    }
    let re = Pattern::new(expr)?;
    Ok(re.find_at(text, 0, Bol::Armed).is_some())
}

/// Group `index` of the first match of `expr` in `input`, with at most
/// `nmatch` groups considered. `Ok(None)` when nothing matches.
pub fn regex_substring(input: &[u8], expr: &str, index: usize, nmatch: usize) -> TextopsResult<Option<Vec<u8>>> {
    if nmatch == 0 || index > nmatch - 1 {
        return Err(TextopsError::invalid_param(
            "matched_index",
            format!("{} not below match count {}", index, nmatch),
        ));
    }
    let re = Pattern::with_flags(expr, PatternFlags { icase: false, newline: false })?;
    if index >= re.captures_len() {
        return Err(TextopsError::invalid_param(
            "matched_index",
            format!("pattern has only {} groups", re.captures_len() - 1),
        ));
    }
    let Some(groups) = re.captures_at(input, 0, Bol::Armed) else {
        return Ok(None);
    };
    match groups.get(index) {
        Some(range) if !range.is_empty() => Ok(Some(input[range].to_vec())),
        _ => Err(TextopsError::malformed("matched token is empty", None, Some(expr.to_string()))),
    }
}

/// Apply a substitution expression to `text`, returning the rewritten
/// string, or `Ok(None)` when it does not match
pub fn subst_v(text: &[u8], expr: &str, ctx: &dyn SubstContext) -> TextopsResult<Option<Vec<u8>>> {
    let se = SubstExpr::parse(expr)?;
    Ok(se.apply(text, ctx)?.map(|(out, _)| out))
}
