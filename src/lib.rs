//! SSBC textops - in-place rewriting of SIP messages
//!
//! Messages are never edited in place. Every rewriter records deletions
//! and insertions against the received buffer in an [`EditList`]; the
//! outgoing bytes are produced once, by [`SipMessage::build`].
//!
//! ```
//! use ssbc_textops::{HeaderMatcher, SipMessage, SubstExpr};
//!
//! let raw = "INVITE sip:alice@a.com SIP/2.0\r\nX-Debug: 1\r\nContent-Length: 0\r\n\r\n";
//! let mut msg = SipMessage::new(raw).unwrap();
//! msg.subst_uri(&SubstExpr::parse("s/alice/bob/").unwrap()).unwrap();
//! msg.remove_hf(&HeaderMatcher::from_name("X-Debug")).unwrap();
//! let out = msg.build().unwrap();
//! assert_eq!(out, b"INVITE sip:bob@a.com SIP/2.0\r\nContent-Length: 0\r\n\r\n");
//! ```

pub mod batch;
pub mod error;
pub mod fixup;
pub mod headers;
pub mod limits;
pub mod locator;
pub mod lump;
pub mod msg;
pub mod multipart;
pub mod pattern;
pub mod rewrite;
pub mod strops;
pub mod subst;
pub mod types;
pub mod validation;

pub use batch::{process_batch, process_batch_on, PlanReport, RewritePlan, RewriteStep};
pub use error::{ResourceType, TextopsError, TextopsResult};
pub use fixup::{
    fixup_header_name, fixup_int, fixup_match_op, fixup_matcher, fixup_regex, fixup_replace_mode, fixup_select,
    fixup_subst, fixup_text, Param,
};
pub use headers::MatchValue;
pub use limits::RewriteLimits;
pub use lump::{At, EditHandle, EditList, LumpScope, Payload};
pub use msg::{ReplyLumps, SipMessage, StartLine};
pub use pattern::{Bol, Pattern, PatternFlags};
pub use rewrite::Region;
pub use subst::{Replacement, SubstContext, SubstExpr};
pub use types::{HeaderMatcher, HeaderType, HfSelect, MatchOp, Outcome, ReplaceMode, TextRange};
