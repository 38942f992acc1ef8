//! Request inspection.
//!
//! [`RequestContext`] is the read-only view every detector works from. It is
//! assembled once per request through a [`HeaderAccessor`], so the detectors
//! never touch the transport's own header types.

pub mod headers;
pub mod user_agent;

pub use headers::HeaderAnalyzer;
pub use user_agent::UserAgentAnalyzer;

use http::HeaderMap;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Case-insensitive header lookup over any request representation.
///
/// Implementations return `None` for headers that are absent or cannot be
/// read as text; a broken header is never an error.
pub trait HeaderAccessor {
    /// First value of the header.
    fn header(&self, name: &str) -> Option<&str>;

    /// Every value of the header, in order.
    fn header_values(&self, name: &str) -> Vec<&str> {
        self.header(name).into_iter().collect()
    }
}

impl HeaderAccessor for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }
}

impl HeaderAccessor for HashMap<String, Vec<String>> {
    fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        if let Some(values) = self.get(name) {
            return values.iter().map(String::as_str).collect();
        }
        self.iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.iter().map(String::as_str))
            .collect()
    }
}

impl HeaderAccessor for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.get(name) {
            return Some(value.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Identity used to key per-client verdicts.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ClientKey {
    /// Address reported by a forwarding header or the transport
    Ip(String),
    /// No usable address; never cached
    Unknown,
}

impl ClientKey {
    /// Derive the key: first `x-forwarded-for` element, then
    /// `cf-connecting-ip`, then the peer address.
    ///
    /// Header values that do not parse as an address are skipped, and the key
    /// always holds the address in canonical text form.
    pub fn from_headers(headers: &impl HeaderAccessor, peer: Option<IpAddr>) -> Self {
        let forwarded = headers
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(parse_ip);

        forwarded
            .or_else(|| headers.header("cf-connecting-ip").and_then(parse_ip))
            .or(peer)
            .map_or(ClientKey::Unknown, |ip| ClientKey::Ip(ip.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ClientKey::Ip(ip) => ip,
            ClientKey::Unknown => "unknown",
        }
    }

    /// Parsed address, when the key is a well-formed IP.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            ClientKey::Ip(ip) => ip.parse().ok(),
            ClientKey::Unknown => None,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only per-request view used by every classifier function.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// User-Agent, empty when missing
    pub user_agent: String,
    /// HTTP method, uppercase
    pub method: String,
    /// Path plus query string
    pub path: String,
    /// Client identity
    pub client: ClientKey,
    /// Referer, when present
    pub referer: Option<String>,
    /// Hostname the request was addressed to
    pub host: Option<String>,
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    /// Structured client hint (`sec-ch-ua`)
    pub client_hints: Option<String>,
    pub sec_fetch_site: Option<String>,
    pub sec_fetch_dest: Option<String>,
    /// Prefetch/prerender purpose hint from any of the purpose headers
    pub purpose: Option<String>,
    /// All cookie header values joined with `; `
    pub cookie: Option<String>,
}

impl RequestContext {
    /// Assemble the context from a transport's headers.
    pub fn from_headers(
        headers: &impl HeaderAccessor,
        method: &str,
        path: &str,
        peer: Option<IpAddr>,
    ) -> Self {
        let get = |name: &str| {
            headers
                .header(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let purpose = ["purpose", "sec-purpose", "x-purpose", "x-moz"]
            .iter()
            .find_map(|name| get(*name));

        let cookies = headers.header_values("cookie");
        let cookie = if cookies.is_empty() {
            None
        } else {
            Some(cookies.join("; "))
        };

        let referer = get("referer").or_else(|| get("referrer"));
        let host = get("x-forwarded-host")
            .or_else(|| get("host"))
            .and_then(|h| hostname_of(&format!("http://{h}")))
            .or_else(|| referer.as_deref().and_then(hostname_of));

        Self {
            user_agent: headers.header("user-agent").unwrap_or_default().to_string(),
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            client: ClientKey::from_headers(headers, peer),
            referer,
            host,
            accept: get("accept"),
            accept_language: get("accept-language"),
            client_hints: get("sec-ch-ua"),
            sec_fetch_site: get("sec-fetch-site"),
            sec_fetch_dest: get("sec-fetch-dest"),
            purpose,
            cookie,
        }
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

fn hostname_of(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
