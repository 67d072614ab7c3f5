use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiCategory {
    Name,
    Address,
    Email,
    Ssn,
    Password,
}

impl PiiCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Address => "address",
            Self::Email => "email",
            Self::Ssn => "ssn",
            Self::Password => "password",
        }
    }
}

impl fmt::Display for PiiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte span of a detected entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiMatch {
    pub category: PiiCategory,
    pub start: usize,
    pub end: usize,
}

/// Finds PII spans in free text.
pub trait PiiDetector: Send + Sync {
    fn detect(&self, text: &str) -> Vec<PiiMatch>;
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex is valid")
});

static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex is valid"));

static PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:password|passwd|pwd)\s*[:=]\s*\S+").expect("password regex is valid")
});

/// Pattern-based detector for emails, US SSNs and `password=` assignments.
/// Names and addresses need an NER model and are never reported.
#[derive(Debug, Default)]
pub struct RegexPiiDetector;

impl PiiDetector for RegexPiiDetector {
    fn detect(&self, text: &str) -> Vec<PiiMatch> {
        let mut out = Vec::new();
        for (category, re) in [
            (PiiCategory::Email, &*EMAIL),
            (PiiCategory::Ssn, &*SSN),
            (PiiCategory::Password, &*PASSWORD),
        ] {
            out.extend(re.find_iter(text).map(|m| PiiMatch {
                category,
                start: m.start(),
                end: m.end(),
            }));
        }
        out
    }
}
