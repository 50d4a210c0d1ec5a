//! KAS URL normalization and the reader allowlist
//!
//! URLs are compared as `scheme://host:port`. A bare `host[:port]` is taken
//! to be `https`, and a missing port is filled in from the scheme.

use super::KasError;
use std::collections::BTreeSet;
use url::Url;

/// Reduce a KAS URL to `scheme://host:port`
pub fn normalize_kas_url(raw: &str) -> Result<String, KasError> {
    let invalid = |reason: &str| KasError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty URL"));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| invalid("no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("no port and no default for scheme"))?;
    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

/// The set of KAS origins a reader may contact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KasAllowlist {
    origins: BTreeSet<String>,
}

impl KasAllowlist {
    /// Normalize every entry; any invalid entry fails the whole list
    pub fn new<I, S>(urls: I) -> Result<Self, KasError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let origins = urls
            .into_iter()
            .map(|u| normalize_kas_url(u.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(KasAllowlist { origins })
    }

    /// Whether `url` is listed; unparseable URLs never are
    pub fn is_allowed(&self, url: &str) -> bool {
        normalize_kas_url(url).is_ok_and(|origin| self.origins.contains(&origin))
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.origins.iter().map(String::as_str)
    }
}
