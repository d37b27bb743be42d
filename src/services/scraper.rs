//! Website crawling boundary for contact-address discovery.
//!
//! [`HttpSiteScraper`] starts at a domain's home page and follows same-host
//! links that look like contact/about/team pages, collecting `mailto:`
//! targets and email-shaped text.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};

use crate::services::address::{extract_emails, is_valid_email, normalize_email};

/// Crawl limits for a single domain.
#[derive(Debug, Clone, Copy)]
pub struct CrawlOptions {
    pub max_depth: u8,
    pub max_pages: usize,
}

/// What a domain crawl yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlReport {
    pub emails: Vec<String>,
    pub pages_crawled: usize,
}

#[async_trait]
pub trait SiteScraper: Send + Sync {
    async fn scrape(&self, domain: &str, options: CrawlOptions) -> Result<CrawlReport, ScrapeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Site unavailable: {0}")]
    Unavailable(String),
}

/// Path fragments that usually lead to published contact details.
const CONTACT_HINTS: &[&str] = &[
    "contact", "about", "team", "staff", "people", "impressum", "kontakt", "support", "imprint",
];

/// Crawler built on `reqwest` and `scraper`.
pub struct HttpSiteScraper {
    http: reqwest::Client,
}

impl HttpSiteScraper {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, ScrapeError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { http })
    }

    async fn fetch(&self, url: &Url) -> Result<String, ScrapeError> {
        let response = self.http.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ScrapeError::Unavailable(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

/// Emails and follow-up links found on one page.
#[derive(Debug, Default)]
struct PageScan {
    emails: Vec<String>,
    links: Vec<Url>,
}

/// Parse a page synchronously; `Html` is not `Send` and must not live across awaits.
fn scan_page(html: &str, page_url: &Url) -> PageScan {
    let document = Html::parse_document(html);
    let anchor_sel = Selector::parse("a[href]").expect("valid selector");
    let body_sel = Selector::parse("body").expect("valid selector");

    let mut scan = PageScan::default();

    for anchor in document.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if let Some(target) = href.strip_prefix("mailto:") {
            let address = target.split('?').next().unwrap_or_default();
            let address = normalize_email(address);
            if is_valid_email(&address) {
                scan.emails.push(address);
            }
            continue;
        }

        let Ok(link) = page_url.join(href) else {
            continue;
        };
        if link.host_str() != page_url.host_str() || !matches!(link.scheme(), "http" | "https") {
            continue;
        }
        let path = link.path().to_ascii_lowercase();
        let label = anchor.text().collect::<String>().to_ascii_lowercase();
        if CONTACT_HINTS
            .iter()
            .any(|hint| path.contains(hint) || label.contains(hint))
        {
            scan.links.push(link);
        }
    }

    let text: String = document
        .select(&body_sel)
        .flat_map(|body| body.text())
        .collect::<Vec<_>>()
        .join(" ");
    scan.emails.extend(extract_emails(&text));
    scan
}

#[async_trait]
impl SiteScraper for HttpSiteScraper {
    async fn scrape(&self, domain: &str, options: CrawlOptions) -> Result<CrawlReport, ScrapeError> {
        let root = Url::parse(&format!("https://{domain}/"))
            .map_err(|e| ScrapeError::InvalidDomain(format!("{domain}: {e}")))?;

        let mut queue = VecDeque::from([(root.clone(), 0u8)]);
        let mut visited: HashSet<String> = HashSet::new();
        let mut emails = BTreeSet::new();
        let mut pages_crawled = 0;

        while let Some((mut url, depth)) = queue.pop_front() {
            if pages_crawled >= options.max_pages {
                break;
            }
            url.set_fragment(None);
            if !visited.insert(url.to_string()) {
                continue;
            }

            let html = match self.fetch(&url).await {
                Ok(html) => html,
                // The home page decides whether the domain is reachable at all.
                Err(e) if url == root => return Err(e),
                Err(e) => {
                    tracing::debug!(domain = %domain, url = %url, error = %e, "Skipping unreachable page");
                    continue;
                }
            };
            pages_crawled += 1;

            let scan = scan_page(&html, &url);
            emails.extend(scan.emails);
            if depth < options.max_depth {
                queue.extend(scan.links.into_iter().map(|link| (link, depth + 1)));
            }
        }

        Ok(CrawlReport {
            emails: emails.into_iter().collect(),
            pages_crawled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_page_collects_mailto_and_text() {
        let url = Url::parse("https://example.com/").unwrap();
        let html = r#"
        <html><body>
            <a href="mailto:Hello@Example.com?subject=hi">Email us</a>
            <p>Press: press@example.com</p>
            <a href="/contact-us">Contact</a>
            <a href="/blog/post-1">Blog</a>
            <a href="https://other.org/contact">Elsewhere</a>
            <a href="/x" >Meet the Team</a>
        </body></html>
        "#;
        let scan = scan_page(html, &url);
        assert!(scan.emails.contains(&"hello@example.com".to_string()));
        assert!(scan.emails.contains(&"press@example.com".to_string()));

        let links: Vec<String> = scan.links.iter().map(|l| l.to_string()).collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/contact-us".to_string(),
                "https://example.com/x".to_string()
            ]
        );
    }

    #[test]
    fn test_scan_page_ignores_invalid_mailto() {
        let url = Url::parse("https://example.com/").unwrap();
        let scan = scan_page(r#"<a href="mailto:not-an-address">x</a>"#, &url);
        assert!(scan.emails.is_empty());
    }
}
