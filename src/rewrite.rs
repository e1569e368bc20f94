//! Forwarding-header rewrites applied before a request goes upstream.
//!
//! The defaults implement the usual proxy contract: `X-Forwarded-For`
//! appends the client address to whatever the request already carried,
//! `X-Real-IP` is the immediate peer, and `Host` is left exactly as the
//! client sent it. Configured `proxy_set_header` directives run after the
//! defaults and may override them; their values go through the same
//! variable expansion the original directives use.

use std::net::SocketAddr;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Variables accepted in `proxy_set_header` values.
const VARIABLES: &[&str] = &[
    "$remote_addr",
    "$http_host",
    "$host",
    "$proxy_add_x_forwarded_for",
];

/// Hop-by-hop headers are meaningful for one transport link only and are
/// stripped before forwarding.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request context for variable expansion.
pub struct RewriteContext<'a> {
    pub client: SocketAddr,
    /// The client-supplied Host header value, already extracted.
    pub host: &'a str,
}

/// Applies the default forwarding headers and then the configured
/// `proxy_set_header` directives.
pub fn apply(
    headers: &mut HeaderMap,
    ctx: &RewriteContext<'_>,
    set_headers: &[(String, String)],
) {
    // Computed against the incoming value, once, so a configured
    // $proxy_add_x_forwarded_for does not append the client a second time.
    let xff = proxy_add_x_forwarded_for(headers, ctx.client);
    set(headers, X_FORWARDED_FOR, &xff);
    set(headers, X_REAL_IP, &ctx.client.ip().to_string());

    for (name, template) in set_headers {
        let value = expand(template, ctx, &xff);
        set(headers, name, &value);
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// `$proxy_add_x_forwarded_for` semantics: existing value `A` plus client
/// `B` yields `A, B`; absent value yields just `B`.
fn proxy_add_x_forwarded_for(headers: &HeaderMap, client: SocketAddr) -> String {
    let client_ip = client.ip().to_string();
    match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip,
    }
}

/// Returns the first unknown `$variable` in a `proxy_set_header` value
/// template (a bare `$` counts as one). Config validation calls this so a
/// bad template fails at load instead of silently dropping at request time.
pub fn unknown_variable(template: &str) -> Option<&str> {
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos..];
        let var_len = rest[1..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let (var, tail) = rest.split_at(var_len);
        if !VARIABLES.contains(&var) {
            return Some(var);
        }
        rest = tail;
    }
    None
}

fn expand(template: &str, ctx: &RewriteContext<'_>, xff: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let var_len = rest[1..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let (var, tail) = rest.split_at(var_len);
        match var {
            "$remote_addr" => out.push_str(&ctx.client.ip().to_string()),
            "$http_host" | "$host" => out.push_str(ctx.host),
            "$proxy_add_x_forwarded_for" => out.push_str(xff),
            unknown => {
                warn!("unknown variable {unknown} in proxy_set_header value");
            }
        }
        rest = tail;
    }
    out.push_str(rest);
    out
}

fn set(headers: &mut HeaderMap, name: &str, value: &str) {
    let Ok(name) = HeaderName::try_from(name) else {
        warn!("skipping invalid header name {name:?}");
        return;
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!("skipping invalid value for header {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(client: &str, host: &str) -> (SocketAddr, String) {
        (client.parse().unwrap(), host.to_string())
    }

    #[test]
    fn forwarded_for_appends_to_existing_value() {
        let (client, host) = ctx("203.0.113.9:51000", "osu.ppy.sh");
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "198.51.100.1".parse().unwrap());

        apply(&mut headers, &RewriteContext { client, host: &host }, &[]);

        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "198.51.100.1, 203.0.113.9"
        );
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "203.0.113.9");
    }

    #[test]
    fn forwarded_for_starts_fresh_when_absent() {
        let (client, host) = ctx("203.0.113.9:51000", "osu.ppy.sh");
        let mut headers = HeaderMap::new();

        apply(&mut headers, &RewriteContext { client, host: &host }, &[]);

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.9");
    }

    #[test]
    fn configured_directives_expand_variables() {
        let (client, host) = ctx("203.0.113.9:51000", "osu.ppy.sh");
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "10.0.0.1".parse().unwrap());

        let directives = vec![
            ("Host".to_string(), "$http_host".to_string()),
            ("X-Real-IP".to_string(), "$remote_addr".to_string()),
            (
                "X-Forwarded-For".to_string(),
                "$proxy_add_x_forwarded_for".to_string(),
            ),
        ];
        apply(
            &mut headers,
            &RewriteContext { client, host: &host },
            &directives,
        );

        assert_eq!(headers.get("host").unwrap(), "osu.ppy.sh");
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "203.0.113.9");
        // The client must appear exactly once even though both the default
        // pass and the directive touch the header.
        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "10.0.0.1, 203.0.113.9"
        );
    }

    #[test]
    fn unknown_variables_are_reported() {
        assert_eq!(unknown_variable("$remote_addr"), None);
        assert_eq!(unknown_variable("$proxy_add_x_forwarded_for"), None);
        assert_eq!(unknown_variable("prefix $host suffix"), None);
        assert_eq!(unknown_variable("$scheme://$host"), Some("$scheme"));
        assert_eq!(unknown_variable("price: 5$"), Some("$"));
        assert_eq!(unknown_variable("no variables here"), None);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("upgrade").is_none());
        assert!(headers.get("content-type").is_some());
    }
}
