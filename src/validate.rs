//! URL canonicalization, cache keys, and the fetch allowlist.
//!
//! Validation is purely syntactic: hostnames are inspected as strings or IP
//! literals, and no DNS resolution is performed.  An allowlisted hostname
//! that resolves to a private address is therefore not caught here; that gap
//! is a documented limitation of the service, not something this module
//! attempts to close.

use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::{Host, Url};

use crate::config::AllowlistConfig;

/// Platform paths that point at media objects: `/p/…`, `/reel/…`,
/// `/reels/…`, `/tv/…`.
static MEDIA_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/(p|reel|reels|tv)(/|$)").expect("media path regex"));

// ---------------------------------------------------------------------------
// Deny reasons
// ---------------------------------------------------------------------------

/// Machine-readable reason a URL was refused.  Surfaced in the
/// `x-thumb-reason` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    BadProtocol,
    PrivateHost,
    NotAllowlisted,
    NonMediaPath,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::BadProtocol => "bad_protocol",
            DenyReason::PrivateHost => "private_host",
            DenyReason::NotAllowlisted => "not_allowlisted",
            DenyReason::NonMediaPath => "ig_non_media_path",
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical URL / cache key
// ---------------------------------------------------------------------------

/// A parsed request URL together with its canonical form and cache key.
///
/// The canonical form is scheme + host + path with query and fragment
/// stripped, so URLs that differ only in rotating CDN token parameters map
/// to the same key.
#[derive(Debug, Clone)]
pub struct CanonicalUrl {
    pub url: Url,
    pub canonical: String,
    pub key: String,
}

/// Parse and canonicalize a raw URL string.
///
/// Returns `None` only when the input does not parse as an absolute URL.
/// Hostless schemes (`mailto:`, `file:`) canonicalize fine and are rejected
/// later by [`ValidationPolicy::check`] as `bad_protocol`; parsing and
/// policy are separate steps.
pub fn canonicalize(raw: &str) -> Option<CanonicalUrl> {
    let url = Url::parse(raw).ok()?;

    let canonical = match url.host_str() {
        Some(host) => {
            let mut canonical = format!("{}://{host}", url.scheme());
            if let Some(port) = url.port() {
                canonical.push_str(&format!(":{port}"));
            }
            canonical.push_str(url.path());
            canonical
        }
        None => format!("{}:{}", url.scheme(), url.path()),
    };

    let key = cache_key(&canonical);
    Some(CanonicalUrl {
        url,
        canonical,
        key,
    })
}

/// Stable cache key for a canonical URL: lowercase hex SHA-256.
pub fn cache_key(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Validation policy
// ---------------------------------------------------------------------------

/// Decides whether a resource URL may be fetched.
///
/// Runs twice per request: once on the caller-supplied URL and again on the
/// final URL after redirects, since redirects can point off-allowlist.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    cdn_suffixes: Vec<String>,
    platform_hosts: Vec<String>,
    allow_private_hosts: bool,
}

impl ValidationPolicy {
    pub fn new(config: &AllowlistConfig) -> Self {
        Self {
            cdn_suffixes: config
                .cdn_suffixes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            platform_hosts: config
                .platform_hosts
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            allow_private_hosts: config.allow_private_hosts,
        }
    }

    /// Check scheme, host class, and allowlist membership for a parsed URL.
    pub fn check(&self, url: &Url) -> Result<(), DenyReason> {
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(DenyReason::BadProtocol),
        }

        let host = url.host().ok_or(DenyReason::NotAllowlisted)?;

        if !self.allow_private_hosts && is_private_host(&host) {
            return Err(DenyReason::PrivateHost);
        }

        let host_str = match &host {
            Host::Domain(d) => d.to_ascii_lowercase(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };

        if self
            .cdn_suffixes
            .iter()
            .any(|suffix| suffix_matches(&host_str, suffix))
        {
            return Ok(());
        }

        if self.platform_hosts.iter().any(|h| h == &host_str) {
            if MEDIA_PATH_RE.is_match(url.path()) {
                return Ok(());
            }
            return Err(DenyReason::NonMediaPath);
        }

        Err(DenyReason::NotAllowlisted)
    }
}

/// Suffix match with a label boundary: `scontent.cdninstagram.com` matches
/// `cdninstagram.com`, but `evilcdninstagram.com` does not.
fn suffix_matches(host: &str, suffix: &str) -> bool {
    host == suffix
        || (host.len() > suffix.len()
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
}

/// Reject loopback, private, and link-local hosts by literal inspection.
fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(d) => d.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => is_private_ipv4(*ip),
        Host::Ipv6(ip) => ip.is_loopback() || ip.is_unspecified(),
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    match octets {
        [10, ..] => true,
        [127, ..] => true,
        [192, 168, ..] => true,
        [172, b, ..] if (16..=31).contains(&b) => true,
        [169, 254, ..] => true,
        [0, ..] => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ValidationPolicy {
        ValidationPolicy::new(&AllowlistConfig::default())
    }

    fn check(raw: &str) -> Result<(), DenyReason> {
        policy().check(&Url::parse(raw).unwrap())
    }

    #[test]
    fn query_and_fragment_do_not_change_key() {
        let a = canonicalize("https://scontent.cdninstagram.com/v/t51/img.jpg?a=1&tok=xyz").unwrap();
        let b = canonicalize("https://scontent.cdninstagram.com/v/t51/img.jpg?a=2#frag").unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.canonical, "https://scontent.cdninstagram.com/v/t51/img.jpg");
    }

    #[test]
    fn different_paths_get_different_keys() {
        let a = canonicalize("https://scontent.cdninstagram.com/a.jpg").unwrap();
        let b = canonicalize("https://scontent.cdninstagram.com/b.jpg").unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn cdn_suffix_allowed() {
        assert!(check("https://scontent.cdninstagram.com/v/img.jpg").is_ok());
        assert!(check("https://scontent-lga3-1.xx.fbcdn.net/v/img.jpg").is_ok());
        assert!(check("https://cdninstagram.com/img.jpg").is_ok());
    }

    #[test]
    fn suffix_requires_label_boundary() {
        assert_eq!(
            check("https://evilcdninstagram.com/img.jpg"),
            Err(DenyReason::NotAllowlisted)
        );
    }

    #[test]
    fn platform_media_paths_only() {
        assert!(check("https://www.instagram.com/p/abc123/media").is_ok());
        assert!(check("https://instagram.com/reel/xyz").is_ok());
        assert!(check("https://www.instagram.com/tv/xyz").is_ok());
        assert_eq!(
            check("https://www.instagram.com/accounts/login"),
            Err(DenyReason::NonMediaPath)
        );
    }

    #[test]
    fn private_hosts_denied() {
        for raw in [
            "http://127.0.0.1/x.jpg",
            "http://localhost/x.jpg",
            "http://10.1.2.3/x.jpg",
            "http://192.168.0.10/x.jpg",
            "http://172.20.0.1/x.jpg",
            "http://169.254.1.1/x.jpg",
            "http://[::1]/x.jpg",
        ] {
            assert_eq!(check(raw), Err(DenyReason::PrivateHost), "{raw}");
        }
        // 172.32.x is outside the 172.16/12 private block.
        assert_eq!(
            check("http://172.32.0.1/x.jpg"),
            Err(DenyReason::NotAllowlisted)
        );
    }

    #[test]
    fn off_list_and_bad_scheme_denied() {
        assert_eq!(
            check("https://evil.com/x.jpg"),
            Err(DenyReason::NotAllowlisted)
        );
        assert_eq!(
            check("ftp://scontent.cdninstagram.com/x.jpg"),
            Err(DenyReason::BadProtocol)
        );
    }

    #[test]
    fn allow_private_override() {
        let config = AllowlistConfig {
            cdn_suffixes: vec!["127.0.0.1".to_string()],
            allow_private_hosts: true,
            ..AllowlistConfig::default()
        };
        let policy = ValidationPolicy::new(&config);
        assert!(policy
            .check(&Url::parse("http://127.0.0.1:9000/img.jpg").unwrap())
            .is_ok());
    }

    #[test]
    fn unparseable_is_none() {
        assert!(canonicalize("not a url").is_none());
        assert!(canonicalize("/relative/path.jpg").is_none());
    }

    #[test]
    fn hostless_urls_parse_but_fail_the_scheme_check() {
        let mailto = canonicalize("mailto:user@example.com").unwrap();
        assert_eq!(policy().check(&mailto.url), Err(DenyReason::BadProtocol));

        let file = canonicalize("file:///tmp/x.jpg").unwrap();
        assert_eq!(policy().check(&file.url), Err(DenyReason::BadProtocol));
    }
}
