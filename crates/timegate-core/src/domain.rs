//! Normalized website hostnames - the unit of tracking and limiting.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, CoreResult};

/// Browser tab identifier, as reported by the browser integration.
pub type TabId = i64;

/// Basic hostname shape: dot-separated labels with a TLD of 2+ letters.
static DOMAIN_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+([-.][a-z0-9]+)*\.[a-z]{2,}$").ok());

/// A normalized website hostname.
///
/// Normalization lowercases the hostname and strips a leading `www.` so
/// that `www.Example.com` and `example.com` accumulate into the same
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Creates a domain from an already-normalized or raw hostname.
    ///
    /// No validation beyond normalization - use [`Domain::validated`]
    /// when accepting user input.
    pub fn new(hostname: impl AsRef<str>) -> Self {
        Self(normalize(hostname.as_ref()))
    }

    /// Creates a domain from user input, rejecting strings that are not
    /// plausible hostnames.
    pub fn validated(input: &str) -> CoreResult<Self> {
        let normalized = normalize(input);
        let valid = DOMAIN_RE
            .as_ref()
            .map(|re| re.is_match(&normalized))
            .unwrap_or(false);

        if valid {
            Ok(Self(normalized))
        } else {
            Err(CoreError::InvalidDomain {
                value: input.to_string(),
            })
        }
    }

    /// Extracts the domain from a URL.
    ///
    /// Returns `None` for URLs without a hostname (internal pages,
    /// `about:blank`, file URLs and the like) - such tabs are not tracked.
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host))
    }

    /// Returns the domain as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn normalize(hostname: &str) -> String {
    let lower = hostname.trim().to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}
