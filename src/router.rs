//! Virtual-host routing.
//!
//! Each server block's `server_name` is compiled once at load into a
//! [`HostPattern`]; requests are matched against the blocks in declared
//! order and the first match wins. Within a block, the longest matching
//! `location` prefix selects the upstream.

use regex::Regex;
use tracing::debug;

use crate::config::{Config, LocationConfig};
use crate::error::ConfigError;

/// Compiled `server_name` matcher.
///
/// Three pattern classes are supported, mirroring the config grammar:
/// `~<regex>` (full regex with anchors, alternation and character classes),
/// `*.suffix` wildcards, and exact names. Exact and wildcard matching is
/// case-insensitive; hostnames are normalized to lowercase before matching.
#[derive(Debug, Clone)]
pub enum HostPattern {
    Exact(String),
    /// Stored as the suffix including the leading dot, e.g. `.example.com`.
    Wildcard(String),
    Regex(Regex),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if let Some(expr) = pattern.strip_prefix('~') {
            let regex = Regex::new(expr).map_err(|source| ConfigError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
            Ok(HostPattern::Regex(regex))
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            Ok(HostPattern::Wildcard(format!(".{}", suffix.to_lowercase())))
        } else {
            Ok(HostPattern::Exact(pattern.to_lowercase()))
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(name) => host == name,
            HostPattern::Wildcard(suffix) => host.ends_with(suffix.as_str()),
            HostPattern::Regex(regex) => regex.is_match(host),
        }
    }
}

/// One compiled server block: its hostname matcher plus its locations with
/// the longest prefixes first, so the first prefix hit is the best one.
#[derive(Debug, Clone)]
pub struct VirtualHost {
    pattern: HostPattern,
    locations: Vec<LocationConfig>,
}

/// The routing decision handed to the forwarder.
#[derive(Debug)]
pub struct RouteTarget<'a> {
    pub upstream: &'a str,
    pub set_headers: &'a [(String, String)],
}

#[derive(Debug, Clone)]
pub struct Router {
    hosts: Vec<VirtualHost>,
}

impl Router {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut hosts = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let pattern = HostPattern::parse(&server.server_name)?;
            let mut locations = server.locations.clone();
            locations.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
            hosts.push(VirtualHost { pattern, locations });
        }
        Ok(Router { hosts })
    }

    /// Index of the first server block whose pattern matches `host`, if any.
    /// Used by the TLS terminator to pick a certificate from the SNI value.
    pub fn match_host(&self, host: &str) -> Option<usize> {
        let host = normalize_host(host);
        self.hosts.iter().position(|vh| vh.pattern.matches(&host))
    }

    /// Routes a request. First matching server block wins; within it the
    /// longest `location` prefix that covers `path` selects the upstream.
    pub fn route(&self, host: &str, path: &str) -> Option<RouteTarget<'_>> {
        let host = normalize_host(host);
        for (i, vh) in self.hosts.iter().enumerate() {
            if !vh.pattern.matches(&host) {
                continue;
            }
            for location in &vh.locations {
                if path.starts_with(location.prefix.as_str()) {
                    debug!(
                        host = %host,
                        path = %path,
                        upstream = %location.upstream,
                        server = i,
                        "route matched"
                    );
                    return Some(RouteTarget {
                        upstream: &location.upstream,
                        set_headers: &location.set_headers,
                    });
                }
            }
            // Host matched but no location covers the path. First match
            // wins at the host level, so stop here.
            return None;
        }
        None
    }
}

/// Lowercases the host and strips a trailing `:port`, keeping IPv6 literal
/// brackets intact.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let stripped = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    stripped.to_lowercase()
}
