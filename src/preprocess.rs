//! Script preprocessor: rewrites the blocking-style test macros into
//! suspendable Lua and wraps the result in the fixed execution harness.
//!
//! The transform pipeline is pure and deterministic, and its order is
//! load-bearing:
//!
//! 1. normalize line endings, pad with a leading/trailing newline
//! 2. strip `--` line comments and `--[[ … ]]` block comments (block comments
//!    are replaced by an equal number of blank lines so later diagnostics keep
//!    the user's line numbers)
//! 3. extract the single `TIMEOUT(ms)` / `TIMEOUT(ms, code)` directive
//! 4. rewrite `YIELD_THEN_WAIT_UNTIL(pred)` — strictly before 5 and 6
//! 5. rewrite `YIELD()`
//! 6. rewrite `WAIT_UNTIL(pred)`
//! 7. wrap in the harness
//!
//! Both the comment pass and the macro scanner are quote-aware byte scans
//! rather than greedy regexes: `--` inside a string literal is content, and
//! predicates may span lines and contain nested calls.  The macro names are
//! case-sensitive whole-call patterns; anything that does not match passes
//! through untouched for the Lua compiler to judge.

use std::fmt;

// ── Public types ──────────────────────────────────────────────────────────────

/// Deadline applied when a script carries no `TIMEOUT` directive:
/// 20 simulated minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 20 * 60 * 1_000;

/// Chunk lines occupied by the harness prologue when the script has no
/// `TIMEOUT` code block: user line `N` appears at chunk line
/// `N + HARNESS_PROLOGUE_LINES`.
pub const HARNESS_PROLOGUE_LINES: usize = 9;

/// Result of [`preprocess`]: the executable Lua chunk plus the extracted
/// timeout deadline (`None` when the script had no `TIMEOUT` directive).
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub program: String,
    pub timeout_ms: Option<u64>,
}

/// A malformed or duplicated macro directive, detected before any thread or
/// Lua state exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    /// More than one `TIMEOUT` directive in the same script.
    DuplicateTimeout,
    /// The `TIMEOUT` deadline is not an unsigned millisecond count.
    BadDeadline(String),
    /// A macro call's parenthesis was never closed.
    UnterminatedCall { name: String },
    /// The `TIMEOUT` on-timeout block contains a blocking macro.  The block
    /// runs inside a single handshake slice and must not suspend.
    BlockingTimeoutBody { name: String },
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxError::DuplicateTimeout => {
                write!(f, "at most one TIMEOUT directive is allowed per script")
            }
            SyntaxError::BadDeadline(s) => {
                write!(f, "TIMEOUT deadline must be a millisecond count, got `{s}`")
            }
            SyntaxError::UnterminatedCall { name } => {
                write!(f, "unterminated {name}(...) call")
            }
            SyntaxError::BlockingTimeoutBody { name } => {
                write!(f, "{name} must not be used inside a TIMEOUT block")
            }
        }
    }
}

impl std::error::Error for SyntaxError {}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Preprocess user script source into an executable harnessed chunk.
pub fn preprocess(source: &str) -> Result<Preprocessed, SyntaxError> {
    // 1. Normalize line endings and pad so pattern matches never straddle a
    //    text boundary.
    let mut text = source.replace("\r\n", "\n").replace('\r', "\n");
    text = format!("\n{text}\n");

    // 2. Comments.
    text = strip_comments(&text);

    // 3. TIMEOUT directive.
    let timeout = extract_timeout(&mut text)?;

    // 4. YIELD_THEN_WAIT_UNTIL before the plain rewrites, so its expansion is
    //    never rewritten a second time.
    rewrite(&mut text, "YIELD_THEN_WAIT_UNTIL", |pred| {
        format!("__engine_yield(); while not ({pred}) do __engine_yield() end")
    })?;

    // 5. Bare YIELD().
    rewrite_yield(&mut text)?;

    // 6. WAIT_UNTIL(pred): no suspension if the predicate already holds.
    rewrite(&mut text, "WAIT_UNTIL", |pred| {
        format!("while not ({pred}) do __engine_yield() end")
    })?;

    let (timeout_ms, timeout_code) = match timeout {
        Some((ms, code)) => (Some(ms), code),
        None => (None, String::new()),
    };

    Ok(Preprocessed {
        program: wrap(&text, &timeout_code),
        timeout_ms,
    })
}

// ── Harness ───────────────────────────────────────────────────────────────────

const HARNESS_HEAD: &str = "\
function __engine_yield()
  if __engine_step() == \"timeout\" then __engine_timeout() end
end
function __engine_timeout()
";

const HARNESS_MID: &str = "\
  test_failed()
end
if __engine_begin() == \"timeout\" then __engine_timeout() end
do";

const HARNESS_TAIL: &str = "\
end
while true do __engine_yield() end
";

/// Wrap a rewritten (and already padded) body in the fixed harness.
///
/// The driver routine suspends once before the body runs, so `activate`
/// returns only when the script is parked; the trailing loop suspends forever
/// after the body completes — termination is always coordinator-driven.
fn wrap(body: &str, timeout_code: &str) -> String {
    format!("{HARNESS_HEAD}{timeout_code}\n{HARNESS_MID}{body}{HARNESS_TAIL}")
}

// ── Comment stripping ─────────────────────────────────────────────────────────

/// Strip `--` line comments and `--[[ … ]]` block comments in one pass.
///
/// String literals are skipped, so a `--` inside `"…"`, `'…'`, or `[[…]]` is
/// content.  Block comments are replaced with as many newlines as they
/// spanned; an unterminated comment runs to end of input.
fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0; // everything before this offset is already in `out`
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // Short string literal: ends at the matching quote or, when
            // unterminated, at end of line.
            q @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() {
                    let b = bytes[i];
                    i += 1;
                    if b == b'\\' {
                        i += 1;
                    } else if b == q || b == b'\n' {
                        break;
                    }
                }
            }
            // Long string literal: everything up to `]]` is content.
            b'[' if bytes.get(i + 1) == Some(&b'[') => {
                i = match text[i + 2..].find("]]") {
                    Some(rel) => i + 2 + rel + 2,
                    None => bytes.len(),
                };
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                out.push_str(&text[copied..i]);
                let block = bytes.get(i + 2) == Some(&b'[') && bytes.get(i + 3) == Some(&b'[');
                let end = if block {
                    match text[i + 4..].find("]]") {
                        Some(rel) => i + 4 + rel + 2,
                        None => bytes.len(),
                    }
                } else {
                    // Line comment: the newline itself is kept.
                    match text[i..].find('\n') {
                        Some(rel) => i + rel,
                        None => bytes.len(),
                    }
                };
                for _ in text[i..end].matches('\n') {
                    out.push('\n');
                }
                copied = end;
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}

// ── Macro scanner ─────────────────────────────────────────────────────────────

/// A located `NAME( … )` call: byte span in the text plus the raw argument
/// text between the outer parentheses.
struct MacroCall {
    start: usize,
    end: usize,
    args: String,
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Find the next whole call of `name` at or after byte offset `from`.
///
/// The name must not be preceded by an identifier character (so `YIELD` never
/// matches inside `YIELD_THEN_WAIT_UNTIL` or `MY_YIELD`) and must be followed
/// immediately by `(`.  The argument scan balances parentheses and skips Lua
/// string literals, including backslash escapes.
fn find_call(text: &str, name: &str, from: usize) -> Result<Option<MacroCall>, SyntaxError> {
    let bytes = text.as_bytes();
    let mut search = from;
    while let Some(rel) = text[search..].find(name) {
        let start = search + rel;
        let after = start + name.len();
        let bounded = start == 0 || !is_ident(bytes[start - 1]);
        if !bounded || bytes.get(after) != Some(&b'(') {
            search = after;
            continue;
        }

        let mut depth = 1usize;
        let mut quote: Option<u8> = None;
        let mut i = after + 1;
        while i < bytes.len() {
            let b = bytes[i];
            match quote {
                Some(q) => {
                    if b == b'\\' {
                        i += 1; // skip the escaped byte
                    } else if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(Some(MacroCall {
                                start,
                                end: i + 1,
                                args: text[after + 1..i].to_string(),
                            }));
                        }
                    }
                    _ => {}
                },
            }
            i += 1;
        }
        return Err(SyntaxError::UnterminatedCall { name: name.to_string() });
    }
    Ok(None)
}

/// Replace every whole call of `name`, rendering the replacement from the raw
/// argument text.  Returns the number of substitutions.
fn rewrite(
    text: &mut String,
    name: &str,
    render: impl Fn(&str) -> String,
) -> Result<usize, SyntaxError> {
    let mut from = 0;
    let mut count = 0;
    while let Some(call) = find_call(text, name, from)? {
        let replacement = render(&call.args);
        text.replace_range(call.start..call.end, &replacement);
        from = call.start + replacement.len();
        count += 1;
    }
    Ok(count)
}

/// Rewrite bare `YIELD()`.  A `YIELD` call with arguments is not the macro
/// form and passes through for the Lua compiler to reject.
fn rewrite_yield(text: &mut String) -> Result<(), SyntaxError> {
    const SUSPEND: &str = "__engine_yield()";
    let mut from = 0;
    while let Some(call) = find_call(text, "YIELD", from)? {
        if call.args.trim().is_empty() {
            text.replace_range(call.start..call.end, SUSPEND);
            from = call.start + SUSPEND.len();
        } else {
            from = call.end;
        }
    }
    Ok(())
}

// ── TIMEOUT extraction ────────────────────────────────────────────────────────

/// Extract the single `TIMEOUT(ms)` / `TIMEOUT(ms, code)` directive, replacing
/// it in place with blank lines (line numbers are preserved).  A second
/// directive after the first is consumed is a syntax error.
fn extract_timeout(text: &mut String) -> Result<Option<(u64, String)>, SyntaxError> {
    let mut timeout = None;
    let mut from = 0;
    while let Some(call) = find_call(text, "TIMEOUT", from)? {
        if timeout.is_some() {
            return Err(SyntaxError::DuplicateTimeout);
        }
        let (deadline, code) = split_top_level_comma(&call.args);
        let ms: u64 = deadline
            .trim()
            .parse()
            .map_err(|_| SyntaxError::BadDeadline(deadline.trim().to_string()))?;
        let code = code.unwrap_or_default().to_string();
        validate_timeout_code(&code)?;

        let newlines = text[call.start..call.end].matches('\n').count();
        let replacement = "\n".repeat(newlines);
        text.replace_range(call.start..call.end, &replacement);
        from = call.start + replacement.len();
        timeout = Some((ms, code));
    }
    Ok(timeout)
}

/// Split at the first comma that sits outside parentheses and string literals.
fn split_top_level_comma(args: &str) -> (&str, Option<&str>) {
    let bytes = args.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => return (&args[..i], Some(&args[i + 1..])),
                _ => {}
            },
        }
        i += 1;
    }
    (args, None)
}

/// The on-timeout block runs in a single handshake slice: it may log and call
/// `test_ok`/`test_failed`, but it must not suspend.
fn validate_timeout_code(code: &str) -> Result<(), SyntaxError> {
    if find_call(code, "TIMEOUT", 0)?.is_some() {
        return Err(SyntaxError::DuplicateTimeout);
    }
    for name in ["YIELD_THEN_WAIT_UNTIL", "WAIT_UNTIL", "YIELD"] {
        if find_call(code, name, 0)?.is_some() {
            return Err(SyntaxError::BlockingTimeoutBody {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
