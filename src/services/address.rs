//! Email address helpers shared by the job handlers.

use std::sync::OnceLock;

use regex::Regex;

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid address pattern"))
}

fn embedded_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,24}").expect("valid embedded pattern")
    })
}

/// File extensions that look like TLDs in `name@2x.png` style asset names.
const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".css", ".js"];

pub fn is_valid_email(candidate: &str) -> bool {
    address_pattern().is_match(candidate)
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Domain part of an address, lower-cased.
pub fn provider_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}

/// Reduce a user-supplied site to a bare host name.
pub fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(&trimmed);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = host.split('@').next_back().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).trim_end_matches('.').to_string()
}

/// Find email-shaped strings in free text.
pub fn extract_emails(text: &str) -> Vec<String> {
    embedded_pattern()
        .find_iter(text)
        .map(|m| normalize_email(m.as_str().trim_end_matches('.')))
        .filter(|email| !ASSET_SUFFIXES.iter().any(|suffix| email.ends_with(suffix)))
        .filter(|email| is_valid_email(email))
        .collect()
}
