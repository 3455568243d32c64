use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ticker symbol: '{0}'")]
pub struct InvalidTicker(pub String);

/// Stock ticker symbol: 1-12 uppercase characters, with an optional
/// exchange suffix such as `.LON` or `.HK`. Equality is symbol-exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    pub fn new(symbol: &str) -> Result<Self, InvalidTicker> {
        symbol.parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The symbol without any exchange suffix.
    pub fn base(&self) -> &str {
        match self.0.split_once('.') {
            Some((base, _)) => base,
            None => &self.0,
        }
    }

    /// The exchange suffix, if any (`"LON"` for `VOD.LON`).
    pub fn exchange(&self) -> Option<&str> {
        self.0.split_once('.').map(|(_, suffix)| suffix)
    }
}

fn valid_base(s: &str) -> bool {
    // All-digit symbols are legal on some exchanges (e.g. 0005.HK)
    (1..=12).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn valid_suffix(s: &str) -> bool {
    (1..=4).contains(&s.len()) && s.chars().all(|c| c.is_ascii_uppercase())
}

impl FromStr for Ticker {
    type Err = InvalidTicker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ok = match s.split_once('.') {
            Some((base, suffix)) => valid_base(base) && valid_suffix(suffix),
            None => valid_base(s),
        };
        if ok {
            Ok(Ticker(s.to_string()))
        } else {
            Err(InvalidTicker(s.to_string()))
        }
    }
}

impl TryFrom<String> for Ticker {
    type Error = InvalidTicker;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ticker> for String {
    fn from(t: Ticker) -> String {
        t.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
