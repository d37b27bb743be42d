//! Address generation engine boundary.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use strum::IntoEnumIterator;
use tokio::sync::Mutex;

use crate::models::job::{AddressPattern, GenerateParams};

#[async_trait]
pub trait AddressGenerator: Send + Sync {
    /// Produce `count` candidate addresses. Duplicates are allowed.
    async fn generate(
        &self,
        params: &GenerateParams,
        count: usize,
    ) -> Result<Vec<String>, GeneratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("No usable {0} for address generation")]
    EmptyPool(&'static str),

    #[error("Generation engine failed: {0}")]
    Engine(String),
}

const FIRST_NAMES: &[&str] = &[
    "james", "mary", "robert", "patricia", "john", "jennifer", "michael", "linda", "david",
    "elizabeth", "william", "barbara", "richard", "susan", "joseph", "jessica", "thomas", "sarah",
    "charles", "karen", "daniel", "lisa", "matthew", "nancy", "anthony", "sandra", "mark", "betty",
    "steven", "ashley", "andrew", "emily", "joshua", "kimberly", "kevin", "donna", "brian", "michelle",
];

const LAST_NAMES: &[&str] = &[
    "smith", "johnson", "williams", "brown", "jones", "garcia", "miller", "davis", "rodriguez",
    "martinez", "hernandez", "lopez", "gonzalez", "wilson", "anderson", "thomas", "taylor", "moore",
    "jackson", "martin", "lee", "perez", "thompson", "white", "harris", "sanchez", "clark", "ramirez",
    "lewis", "robinson", "walker", "young", "allen", "king", "wright", "scott", "torres", "nguyen",
];

/// Pattern-based generator combining name pools with provider domains.
pub struct PatternGenerator {
    rng: Mutex<StdRng>,
}

impl PatternGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for PatternGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn local_part_token(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn pool(custom: &[String], fallback: &[&str]) -> Vec<String> {
    let names: Vec<String> = if custom.is_empty() {
        fallback.iter().map(|n| n.to_string()).collect()
    } else {
        custom.iter().map(|n| local_part_token(n)).collect()
    };
    names.into_iter().filter(|n| !n.is_empty()).collect()
}

fn render(pattern: AddressPattern, first: &str, last: &str, year: u16, digits: u16) -> String {
    let initial = first.chars().next().map(String::from).unwrap_or_default();
    match pattern {
        AddressPattern::FirstDotLast => format!("{first}.{last}"),
        AddressPattern::FirstLast => format!("{first}{last}"),
        AddressPattern::FirstInitialLast => format!("{initial}{last}"),
        AddressPattern::FirstUnderscoreLast => format!("{first}_{last}"),
        AddressPattern::LastDotFirst => format!("{last}.{first}"),
        AddressPattern::FirstLastYear => format!("{first}{last}{year}"),
        AddressPattern::FirstDigits => format!("{first}{digits}"),
    }
}

#[async_trait]
impl AddressGenerator for PatternGenerator {
    async fn generate(
        &self,
        params: &GenerateParams,
        count: usize,
    ) -> Result<Vec<String>, GeneratorError> {
        let firsts = pool(&params.first_names, FIRST_NAMES);
        let lasts = pool(&params.last_names, LAST_NAMES);
        let domains: Vec<String> = params
            .domains
            .iter()
            .map(|d| d.trim().trim_start_matches('@').to_ascii_lowercase())
            .filter(|d| d.contains('.'))
            .collect();
        let patterns: Vec<AddressPattern> = if params.patterns.is_empty() {
            AddressPattern::iter().collect()
        } else {
            params.patterns.clone()
        };

        if firsts.is_empty() {
            return Err(GeneratorError::EmptyPool("first names"));
        }
        if lasts.is_empty() {
            return Err(GeneratorError::EmptyPool("last names"));
        }
        if domains.is_empty() {
            return Err(GeneratorError::EmptyPool("domains"));
        }

        let (year_from, year_to) = params
            .birth_years
            .map(|r| (r.from.min(r.to), r.from.max(r.to)))
            .unwrap_or((1960, 2005));

        let mut rng = self.rng.lock().await;
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            // Pools and pattern list are non-empty, checked above.
            let first = firsts.choose(&mut *rng).map(String::as_str).unwrap_or("user");
            let last = lasts.choose(&mut *rng).map(String::as_str).unwrap_or("mail");
            let domain = domains.choose(&mut *rng).map(String::as_str).unwrap_or("example.com");
            let pattern = patterns
                .choose(&mut *rng)
                .copied()
                .unwrap_or(AddressPattern::FirstDotLast);
            let year = rng.gen_range(year_from..=year_to);
            let digits = rng.gen_range(1..10_000);
            addresses.push(format!("{}@{}", render(pattern, first, last, year, digits), domain));
        }
        Ok(addresses)
    }
}
