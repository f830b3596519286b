//! Pattern redaction for LLM-bound text.
//!
//! Raw snippets never reach the model verbatim: email local parts and
//! phone numbers are stripped first, and every snippet is length-capped.

use regex::Regex;
use std::sync::OnceLock;

pub const SNIPPET_MAX_CHARS: usize = 240;
pub const EVENT_MAX_CHARS: usize = 180;

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@([A-Za-z0-9.-]+\.[A-Za-z]{2,})")
            .unwrap_or_else(|e| panic!("email regex: {e}"))
    })
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\+?\d[\d\s().-]{6,}\d")
            .unwrap_or_else(|e| panic!("phone regex: {e}"))
    })
}

/// Replace emails with `***@domain` and phone numbers with a placeholder.
pub fn redact(text: &str) -> String {
    let emails_gone = email_regex().replace_all(text, |caps: &regex::Captures<'_>| {
        format!("***@{}", caps[1].to_lowercase())
    });
    phone_regex()
        .replace_all(&emails_gone, "[redacted-phone]")
        .into_owned()
}

/// Cap text at `max_chars`, ending with an ellipsis when cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_keep_only_the_domain() {
        assert_eq!(
            redact("Reach Ana at Ana.Lopez@Acme.COM today"),
            "Reach Ana at ***@acme.com today"
        );
    }

    #[test]
    fn phone_numbers_are_removed() {
        assert_eq!(redact("call +1 (555) 123-4567 now"), "call [redacted-phone] now");
        assert_eq!(redact("ext 42"), "ext 42");
    }

    #[test]
    fn truncation_preserves_short_text() {
        assert_eq!(truncate("short", 240), "short");
    }

    #[test]
    fn truncation_caps_length_with_ellipsis() {
        let long = "a".repeat(500);
        let out = truncate(&long, SNIPPET_MAX_CHARS);
        assert_eq!(out.chars().count(), SNIPPET_MAX_CHARS);
        assert!(out.ends_with('…'));
    }
}
