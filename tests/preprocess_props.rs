//! Property tests for the script preprocessor.
//!
//! The strategies generate bodies from restricted alphabets so the properties
//! stay about the transform itself: plain text passes through untouched,
//! rewrites remove every macro name, line counts survive comment stripping.

use proptest::prelude::*;

use logscript::{preprocess, SyntaxError};

/// Body text guaranteed to contain no macro names, comment markers, quotes,
/// or parentheses.
fn plain_body() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9_ =+*\n]{0,200}").expect("strategy regex")
}

/// A predicate expression safe to embed in `WAIT_UNTIL(...)`.
fn predicate() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9_]{0,10} == [0-9]{1,4}").expect("strategy regex")
}

proptest! {
    #[test]
    fn plain_text_passes_through(body in plain_body()) {
        let out = preprocess(&body).expect("plain text preprocesses");
        prop_assert_eq!(out.timeout_ms, None);
        // Normalized + padded body appears verbatim inside the harness.
        let padded = format!("\n{}\n", body);
        prop_assert!(out.program.contains(&padded));
    }

    #[test]
    fn preprocess_is_deterministic(body in plain_body()) {
        let a = preprocess(&body).expect("first run");
        let b = preprocess(&body).expect("second run");
        prop_assert_eq!(a.program, b.program);
        prop_assert_eq!(a.timeout_ms, b.timeout_ms);
    }

    #[test]
    fn timeout_deadline_extracted(ms in 1u64..10_000_000, body in plain_body()) {
        let src = format!("TIMEOUT({ms})\n{body}");
        let out = preprocess(&src).expect("single TIMEOUT is valid");
        prop_assert_eq!(out.timeout_ms, Some(ms));
        prop_assert!(!out.program.contains("TIMEOUT"));
    }

    #[test]
    fn duplicate_timeout_always_rejected(a in 1u64..1000, b in 1u64..1000) {
        let src = format!("TIMEOUT({a})\nTIMEOUT({b})");
        prop_assert_eq!(preprocess(&src).unwrap_err(), SyntaxError::DuplicateTimeout);
    }

    #[test]
    fn wait_until_fully_rewritten(pred in predicate()) {
        let src = format!("WAIT_UNTIL({pred})");
        let out = preprocess(&src).expect("valid macro call");
        prop_assert!(!out.program.contains("WAIT_UNTIL"));
        let expected = format!("while not ({pred}) do __engine_yield() end");
        prop_assert!(out.program.contains(&expected));
    }

    #[test]
    fn yield_then_wait_until_never_doubly_expanded(pred in predicate()) {
        let src = format!("YIELD_THEN_WAIT_UNTIL({pred})");
        let out = preprocess(&src).expect("valid macro call");
        prop_assert!(!out.program.contains("YIELD_THEN_WAIT_UNTIL"));
        let expected =
            format!("__engine_yield(); while not ({pred}) do __engine_yield() end");
        prop_assert!(out.program.contains(&expected));
    }

    #[test]
    fn line_comments_never_change_line_count(
        body in plain_body(),
        comment in "[a-z0-9 ]{0,40}",
    ) {
        let with = format!("{body}\n-- {comment}\nend_marker = 1");
        let without = format!("{body}\n\nend_marker = 1");
        let a = preprocess(&with).expect("commented");
        let b = preprocess(&without).expect("uncommented");
        prop_assert_eq!(a.program.lines().count(), b.program.lines().count());
    }
}
