//! Sample inputs shared by the integration tests.
#![allow(dead_code)]

/// `count` distinct, well-formed addresses.
pub fn sample_emails(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("person{i}@mail.example.org"))
        .collect()
}

/// Domains as users paste them: schemes, paths, `www.` and mixed case.
pub const SCRAPE_DOMAINS: &[&str] = &[
    "acme.example",
    "https://www.Globex.example/about",
    "initech.example",
];

/// Normalized form of [`SCRAPE_DOMAINS`].
pub const NORMALIZED_DOMAINS: &[&str] = &["acme.example", "globex.example", "initech.example"];
