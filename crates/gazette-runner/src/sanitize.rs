//! Preview sanitization for persisted error summaries and log excerpts.
//!
//! Agent CLIs occasionally echo credentials into stderr; anything that
//! looks like a secret is replaced before the text reaches the store.

const PREVIEW_LIMIT: usize = 1200;

const SECRET_PREFIXES: &[&str] = &["sk-", "sk_", "api_key=", "apikey=", "token=", "bearer "];

/// Truncate to the preview budget and redact obvious secret material.
pub fn sanitize_preview(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(PREVIEW_LIMIT));
    for (i, word) in text.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if looks_like_secret(word) {
            out.push_str("[redacted]");
        } else {
            out.push_str(word);
        }
        if out.len() >= PREVIEW_LIMIT {
            break;
        }
    }
    truncate_at_boundary(&out, PREVIEW_LIMIT)
}

fn looks_like_secret(word: &str) -> bool {
    let lowered = word.to_lowercase();
    SECRET_PREFIXES.iter().any(|p| lowered.starts_with(p)) && word.len() > 8
}

fn truncate_at_boundary(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
