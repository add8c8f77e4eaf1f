//! Command line front end: rewrite SIP messages stored in files

use clap::Parser;
use ssbc_textops::{
    fixup_matcher, fixup_replace_mode, fixup_select, process_batch_on, Pattern, RewriteLimits, RewritePlan,
    RewriteStep, SubstExpr,
};
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Apply textops rewrites to SIP messages read from files
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Message files; LF-only line endings are converted to CRLF
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// sed-style substitution after the start line, e.g. 's/alice/bob/g'
    #[arg(long)]
    subst: Vec<String>,
    /// Substitution on the message body
    #[arg(long)]
    subst_body: Vec<String>,
    /// Substitution on the request-URI
    #[arg(long)]
    subst_uri: Vec<String>,
    /// Substitution on the request-URI user part
    #[arg(long)]
    subst_user: Vec<String>,
    /// Substitution inside header bodies, as NAME:EXPR
    #[arg(long)]
    subst_hf: Vec<String>,
    /// Header selection for --subst-hf: a, f or l
    #[arg(long, default_value = "a")]
    hf_select: String,
    /// Literal replacement, as KEY=VALUE
    #[arg(long)]
    replace_str: Vec<String>,
    /// Mode for --replace-str: f or a
    #[arg(long, default_value = "a")]
    replace_mode: String,
    /// Remove every header with this name
    #[arg(long)]
    remove_hf: Vec<String>,
    /// Remove headers whose name matches this pattern
    #[arg(long)]
    remove_hf_re: Vec<String>,
    /// Header line to append after the last header
    #[arg(long)]
    append_hf: Vec<String>,
    /// Header line to insert before the first header
    #[arg(long)]
    insert_hf: Vec<String>,
    /// Worker threads, 0 for one per core
    #[arg(long, default_value_t = 0)]
    threads: usize,
    /// Per-message lump payload budget in bytes
    #[arg(long)]
    arena_budget: Option<usize>,
}

fn subst(expr: &str) -> Result<Arc<SubstExpr>, Box<dyn Error>> {
    Ok(Arc::new(SubstExpr::parse(expr)?))
}

fn header_line(text: &str) -> Arc<[u8]> {
    let mut line = text.trim_end_matches(&['\r', '\n'][..]).as_bytes().to_vec();
    line.extend_from_slice(b"\r\n");
    Arc::from(line)
}

fn build_plan(args: &Args) -> Result<RewritePlan, Box<dyn Error>> {
    let limits = match args.arena_budget {
        Some(budget) => RewriteLimits::with_arena_budget(budget),
        None => RewriteLimits::default(),
    };
    let mut plan = RewritePlan::with_limits(limits);

    for name in &args.remove_hf {
        plan.push(RewriteStep::RemoveHf(fixup_matcher(name)?));
    }
    for re in &args.remove_hf_re {
        plan.push(RewriteStep::RemoveHfRe(Arc::new(Pattern::new(re)?)));
    }
    let mode = fixup_replace_mode(&args.replace_mode)?;
    for pair in &args.replace_str {
        let (key, value) = pair.split_once('=').ok_or_else(|| format!("--replace-str needs KEY=VALUE: {}", pair))?;
        plan.push(RewriteStep::ReplaceStr { key: Arc::from(key.as_bytes()), value: Arc::from(value.as_bytes()), mode });
    }
    for expr in &args.subst {
        plan.push(RewriteStep::Subst(subst(expr)?));
    }
    for expr in &args.subst_body {
        plan.push(RewriteStep::SubstBody(subst(expr)?));
    }
    for expr in &args.subst_uri {
        plan.push(RewriteStep::SubstUri(subst(expr)?));
    }
    for expr in &args.subst_user {
        plan.push(RewriteStep::SubstUser(subst(expr)?));
    }
    let select = fixup_select(&args.hf_select)?;
    for arg in &args.subst_hf {
        let (name, expr) = arg.split_once(':').ok_or_else(|| format!("--subst-hf needs NAME:EXPR: {}", arg))?;
        plan.push(RewriteStep::SubstHf { header: fixup_matcher(name)?, expr: subst(expr)?, select });
    }
    for text in &args.append_hf {
        plan.push(RewriteStep::AppendHf { text: header_line(text), after: None });
    }
    for text in &args.insert_hf {
        plan.push(RewriteStep::InsertHf { text: header_line(text), before: None });
    }
    Ok(plan)
}

/// Files written by hand usually have bare LF line endings
fn to_crlf(raw: Vec<u8>) -> Vec<u8> {
    if raw.windows(2).any(|w| w == b"\r\n") {
        return raw;
    }
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 16);
    for b in raw {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_target(false).with_writer(io::stderr).init();
    let args = Args::parse();
    let plan = build_plan(&args)?;

    let mut messages = Vec::with_capacity(args.files.len());
    for path in &args.files {
        messages.push(to_crlf(fs::read(path)?));
    }
    info!(files = messages.len(), steps = plan.steps().len(), "rewriting");

    let results = process_batch_on(args.threads, &plan, &messages)?;
    let mut stdout = io::stdout().lock();
    let mut failed = 0;
    for (path, result) in args.files.iter().zip(results) {
        match result {
            Ok(report) => {
                let codes: Vec<i32> = report.outcomes.iter().map(|o| o.code()).collect();
                info!(file = %path.display(), ?codes, "rewritten");
                stdout.write_all(&report.output)?;
            }
            Err(err) => {
                warn!(file = %path.display(), code = err.code(), %err, "rewrite failed");
                failed += 1;
            }
        }
    }
    stdout.flush()?;
    if failed > 0 {
        return Err(format!("{} of {} messages failed", failed, args.files.len()).into());
    }
    Ok(())
}
