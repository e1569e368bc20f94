//! Declarative block-syntax configuration.
//!
//! The file format mirrors the classic reverse-proxy directive grammar:
//!
//! ```text
//! upstream handler {
//!     server unix:/tmp/handler.sock fail_timeout=0;
//! }
//! server {
//!     listen 443 ssl;
//!     server_name ~^(?:c[4-6]?|osu|a)\.example\.com$;
//!     ssl_certificate /etc/certs/example.crt;
//!     ssl_certificate_key /etc/certs/example.key;
//!     location / {
//!         proxy_pass http://handler;
//!         proxy_set_header X-Real-IP $remote_addr;
//!         proxy_redirect off;
//!     }
//! }
//! ```
//!
//! Parsing happens once at startup (or on reload); the resulting [`Config`]
//! is immutable. Patterns containing `{`, `}` or `;` must be quoted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{ConfigError, StartupError};
use crate::rewrite;

/// Default window a failed target stays out of rotation, matching the
/// conventional `fail_timeout` default of ten seconds.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub upstreams: Vec<UpstreamConfig>,
    pub servers: Vec<ServerBlock>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub addr: TargetAddr,
    /// Zero disables unavailability marking for this target.
    pub fail_timeout: Duration,
}

/// Backend transport: a TCP socket address or a local domain socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Tcp(addr) => write!(f, "{addr}"),
            TargetAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenSpec {
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct ServerBlock {
    pub listens: Vec<ListenSpec>,
    /// Raw `server_name` pattern; compiled by the router at snapshot build.
    pub server_name: String,
    pub ssl_certificate: Option<PathBuf>,
    pub ssl_certificate_key: Option<PathBuf>,
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub prefix: String,
    pub upstream: String,
    /// `proxy_set_header` directives in declared order. Values may contain
    /// `$remote_addr`, `$http_host`, `$host` and `$proxy_add_x_forwarded_for`.
    pub set_headers: Vec<(String, String)>,
    pub redirect_off: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let text = std::fs::read_to_string(path).map_err(|source| StartupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        debug!(
            upstreams = config.upstreams.len(),
            servers = config.servers.len(),
            "loaded configuration from {}",
            path.display()
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let directives = parse_directives(text)?;
        let mut upstreams = Vec::new();
        let mut servers = Vec::new();

        for directive in &directives {
            match directive.name.as_str() {
                "upstream" => upstreams.push(parse_upstream(directive)?),
                "server" => servers.push(parse_server(directive)?),
                other => {
                    return Err(ConfigError::Directive {
                        line: directive.line,
                        name: other.to_string(),
                        msg: "is not valid at top level".to_string(),
                    });
                }
            }
        }

        let config = Config { upstreams, servers };
        config.validate()?;
        Ok(config)
    }

    /// Distinct `{port, tls}` pairs across all server blocks, in first-seen
    /// order. One listening socket is bound per entry.
    pub fn listen_specs(&self) -> Vec<ListenSpec> {
        let mut seen = Vec::new();
        for server in &self.servers {
            for listen in &server.listens {
                if !seen.contains(listen) {
                    seen.push(*listen);
                }
            }
        }
        seen
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let mut names = HashMap::new();
        for upstream in &self.upstreams {
            if upstream.targets.is_empty() {
                return Err(ConfigError::EmptyUpstream(upstream.name.clone()));
            }
            if names.insert(upstream.name.as_str(), ()).is_some() {
                return Err(ConfigError::DuplicateUpstream(upstream.name.clone()));
            }
        }

        let mut port_tls: HashMap<u16, bool> = HashMap::new();
        for server in &self.servers {
            for listen in &server.listens {
                match port_tls.insert(listen.port, listen.tls) {
                    Some(tls) if tls != listen.tls => {
                        return Err(ConfigError::ListenConflict(listen.port));
                    }
                    _ => {}
                }
            }
            let wants_tls = server.listens.iter().any(|l| l.tls);
            if wants_tls
                && (server.ssl_certificate.is_none() || server.ssl_certificate_key.is_none())
            {
                return Err(ConfigError::MissingCertificate);
            }
            for location in &server.locations {
                if !names.contains_key(location.upstream.as_str()) {
                    return Err(ConfigError::UnknownUpstream(location.upstream.clone()));
                }
            }
        }
        Ok(())
    }
}

// Raw directive tree, shared by all block parsers.

#[derive(Debug)]
struct Directive {
    name: String,
    args: Vec<String>,
    children: Option<Vec<Directive>>,
    line: usize,
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    OpenBrace,
    CloseBrace,
    Semi,
}

fn lex(text: &str) -> Result<Vec<(usize, Token)>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                chars.next();
                tokens.push((line, Token::OpenBrace));
            }
            '}' => {
                chars.next();
                tokens.push((line, Token::CloseBrace));
            }
            ';' => {
                chars.next();
                tokens.push((line, Token::Semi));
            }
            '"' => {
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\n') | None => {
                            return Err(ConfigError::Parse {
                                line,
                                msg: "unterminated quoted string".to_string(),
                            });
                        }
                        Some(c) => word.push(c),
                    }
                }
                tokens.push((line, Token::Word(word)));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '#' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((line, Token::Word(word)));
            }
        }
    }
    Ok(tokens)
}

fn parse_directives(text: &str) -> Result<Vec<Directive>, ConfigError> {
    let tokens = lex(text)?;
    let mut pos = 0;
    let directives = parse_block(&tokens, &mut pos, 0)?;
    if pos != tokens.len() {
        let (line, _) = tokens[pos];
        return Err(ConfigError::Parse {
            line,
            msg: "unexpected `}`".to_string(),
        });
    }
    Ok(directives)
}

fn parse_block(
    tokens: &[(usize, Token)],
    pos: &mut usize,
    depth: usize,
) -> Result<Vec<Directive>, ConfigError> {
    let mut directives = Vec::new();

    while *pos < tokens.len() {
        let (line, token) = &tokens[*pos];
        match token {
            Token::CloseBrace => {
                return Ok(directives);
            }
            Token::Word(name) => {
                let name = name.clone();
                let line = *line;
                *pos += 1;
                let mut args = Vec::new();
                loop {
                    match tokens.get(*pos) {
                        Some((_, Token::Word(arg))) => {
                            args.push(arg.clone());
                            *pos += 1;
                        }
                        Some((_, Token::Semi)) => {
                            *pos += 1;
                            directives.push(Directive {
                                name,
                                args,
                                children: None,
                                line,
                            });
                            break;
                        }
                        Some((_, Token::OpenBrace)) => {
                            *pos += 1;
                            let children = parse_block(tokens, pos, depth + 1)?;
                            match tokens.get(*pos) {
                                Some((_, Token::CloseBrace)) => *pos += 1,
                                _ => {
                                    return Err(ConfigError::Parse {
                                        line,
                                        msg: format!("block `{name}` is never closed"),
                                    });
                                }
                            }
                            directives.push(Directive {
                                name,
                                args,
                                children: Some(children),
                                line,
                            });
                            break;
                        }
                        _ => {
                            return Err(ConfigError::Parse {
                                line,
                                msg: format!("directive `{name}` missing `;` or `{{`"),
                            });
                        }
                    }
                }
            }
            _ => {
                return Err(ConfigError::Parse {
                    line: *line,
                    msg: "expected directive name".to_string(),
                });
            }
        }
    }

    if depth != 0 {
        let line = tokens.last().map(|(l, _)| *l).unwrap_or(0);
        return Err(ConfigError::Parse {
            line,
            msg: "unexpected end of file inside block".to_string(),
        });
    }
    Ok(directives)
}

fn parse_upstream(directive: &Directive) -> Result<UpstreamConfig, ConfigError> {
    let name = directive
        .args
        .first()
        .cloned()
        .ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "upstream".to_string(),
            msg: "requires a name".to_string(),
        })?;
    let children = directive
        .children
        .as_deref()
        .ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "upstream".to_string(),
            msg: "requires a block".to_string(),
        })?;

    let mut targets = Vec::new();
    for child in children {
        if child.name != "server" {
            return Err(ConfigError::Directive {
                line: child.line,
                name: child.name.clone(),
                msg: "is not valid inside upstream".to_string(),
            });
        }
        targets.push(parse_target(child)?);
    }
    Ok(UpstreamConfig { name, targets })
}

fn parse_target(directive: &Directive) -> Result<TargetConfig, ConfigError> {
    let raw = directive
        .args
        .first()
        .ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "server".to_string(),
            msg: "requires a target address".to_string(),
        })?;

    let addr = if let Some(path) = raw.strip_prefix("unix:") {
        TargetAddr::Unix(PathBuf::from(path))
    } else {
        let socket = raw.parse().map_err(|_| ConfigError::Directive {
            line: directive.line,
            name: "server".to_string(),
            msg: format!("target {raw:?} is neither unix:<path> nor host:port"),
        })?;
        TargetAddr::Tcp(socket)
    };

    let mut fail_timeout = DEFAULT_FAIL_TIMEOUT;
    for arg in &directive.args[1..] {
        if let Some(value) = arg.strip_prefix("fail_timeout=") {
            let seconds: u64 = value.parse().map_err(|_| ConfigError::Directive {
                line: directive.line,
                name: "server".to_string(),
                msg: format!("fail_timeout value {value:?} is not a number of seconds"),
            })?;
            fail_timeout = Duration::from_secs(seconds);
        } else {
            return Err(ConfigError::Directive {
                line: directive.line,
                name: "server".to_string(),
                msg: format!("unknown parameter {arg:?}"),
            });
        }
    }
    Ok(TargetConfig { addr, fail_timeout })
}

fn parse_server(directive: &Directive) -> Result<ServerBlock, ConfigError> {
    let children = directive
        .children
        .as_deref()
        .ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "server".to_string(),
            msg: "requires a block".to_string(),
        })?;

    let mut listens = Vec::new();
    let mut server_name = None;
    let mut ssl_certificate = None;
    let mut ssl_certificate_key = None;
    let mut locations = Vec::new();

    for child in children {
        match child.name.as_str() {
            "listen" => {
                let port_arg = child.args.first().ok_or_else(|| ConfigError::Directive {
                    line: child.line,
                    name: "listen".to_string(),
                    msg: "requires a port".to_string(),
                })?;
                let port = port_arg.parse().map_err(|_| ConfigError::Directive {
                    line: child.line,
                    name: "listen".to_string(),
                    msg: format!("port {port_arg:?} is not a number"),
                })?;
                let tls = match child.args.get(1).map(String::as_str) {
                    None => false,
                    Some("ssl") => true,
                    Some(other) => {
                        return Err(ConfigError::Directive {
                            line: child.line,
                            name: "listen".to_string(),
                            msg: format!("unknown parameter {other:?}"),
                        });
                    }
                };
                listens.push(ListenSpec { port, tls });
            }
            "server_name" => {
                server_name = Some(one_arg(child)?);
            }
            "ssl_certificate" => {
                ssl_certificate = Some(PathBuf::from(one_arg(child)?));
            }
            "ssl_certificate_key" => {
                ssl_certificate_key = Some(PathBuf::from(one_arg(child)?));
            }
            "location" => {
                locations.push(parse_location(child)?);
            }
            other => {
                return Err(ConfigError::Directive {
                    line: child.line,
                    name: other.to_string(),
                    msg: "is not valid inside server".to_string(),
                });
            }
        }
    }

    Ok(ServerBlock {
        listens,
        server_name: server_name.ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "server".to_string(),
            msg: "block has no server_name".to_string(),
        })?,
        ssl_certificate,
        ssl_certificate_key,
        locations,
    })
}

fn parse_location(directive: &Directive) -> Result<LocationConfig, ConfigError> {
    let prefix = directive
        .args
        .first()
        .cloned()
        .ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "location".to_string(),
            msg: "requires a path prefix".to_string(),
        })?;
    let children = directive
        .children
        .as_deref()
        .ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "location".to_string(),
            msg: "requires a block".to_string(),
        })?;

    let mut upstream = None;
    let mut set_headers = Vec::new();
    let mut redirect_off = false;

    for child in children {
        match child.name.as_str() {
            "proxy_pass" => {
                let raw = one_arg(child)?;
                let name = raw
                    .strip_prefix("http://")
                    .ok_or_else(|| ConfigError::Directive {
                        line: child.line,
                        name: "proxy_pass".to_string(),
                        msg: format!("expected http://<upstream>, got {raw:?}"),
                    })?;
                upstream = Some(name.trim_end_matches('/').to_string());
            }
            "proxy_set_header" => {
                if child.args.len() != 2 {
                    return Err(ConfigError::Directive {
                        line: child.line,
                        name: "proxy_set_header".to_string(),
                        msg: "requires a name and a value".to_string(),
                    });
                }
                if let Some(var) = rewrite::unknown_variable(&child.args[1]) {
                    return Err(ConfigError::Directive {
                        line: child.line,
                        name: "proxy_set_header".to_string(),
                        msg: format!("value references unknown variable {var:?}"),
                    });
                }
                set_headers.push((child.args[0].clone(), child.args[1].clone()));
            }
            "proxy_redirect" => {
                if child.args.first().map(String::as_str) != Some("off") {
                    return Err(ConfigError::Directive {
                        line: child.line,
                        name: "proxy_redirect".to_string(),
                        msg: "only `off` is supported".to_string(),
                    });
                }
                redirect_off = true;
            }
            other => {
                return Err(ConfigError::Directive {
                    line: child.line,
                    name: other.to_string(),
                    msg: "is not valid inside location".to_string(),
                });
            }
        }
    }

    Ok(LocationConfig {
        prefix,
        upstream: upstream.ok_or_else(|| ConfigError::Directive {
            line: directive.line,
            name: "location".to_string(),
            msg: "has no proxy_pass".to_string(),
        })?,
        set_headers,
        redirect_off,
    })
}

fn one_arg(directive: &Directive) -> Result<String, ConfigError> {
    if directive.args.len() != 1 {
        return Err(ConfigError::Directive {
            line: directive.line,
            name: directive.name.clone(),
            msg: "requires exactly one argument".to_string(),
        });
    }
    Ok(directive.args[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        upstream handler {
            server unix:/tmp/handler.sock fail_timeout=0;
        }
        upstream web {
            server 127.0.0.1:8080;
            server 127.0.0.1:8081 fail_timeout=30;
        }
        server {
            listen 80;
            listen 443 ssl;
            server_name ~^(?:c[4-6]?|osu|a)\.ppy\.sh$;
            ssl_certificate /etc/certs/wildcard.crt;
            ssl_certificate_key /etc/certs/wildcard.key;
            location / {
                proxy_pass http://handler;
                proxy_set_header X-Real-IP $remote_addr;
                proxy_set_header Host $http_host;
                proxy_redirect off;
            }
        }
        server {
            listen 80;
            server_name assets.ppy.sh; # comment after directive
            location /static {
                proxy_pass http://web;
            }
        }
    "#;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.servers.len(), 2);

        let handler = &config.upstreams[0];
        assert_eq!(handler.name, "handler");
        assert_eq!(
            handler.targets[0].addr,
            TargetAddr::Unix(PathBuf::from("/tmp/handler.sock"))
        );
        assert_eq!(handler.targets[0].fail_timeout, Duration::ZERO);

        let web = &config.upstreams[1];
        assert_eq!(web.targets[0].fail_timeout, DEFAULT_FAIL_TIMEOUT);
        assert_eq!(web.targets[1].fail_timeout, Duration::from_secs(30));

        let main = &config.servers[0];
        assert_eq!(
            main.listens,
            vec![
                ListenSpec {
                    port: 80,
                    tls: false
                },
                ListenSpec {
                    port: 443,
                    tls: true
                }
            ]
        );
        assert_eq!(main.server_name, r"~^(?:c[4-6]?|osu|a)\.ppy\.sh$");
        assert_eq!(main.locations[0].upstream, "handler");
        assert!(main.locations[0].redirect_off);
        assert_eq!(
            main.locations[0].set_headers,
            vec![
                ("X-Real-IP".to_string(), "$remote_addr".to_string()),
                ("Host".to_string(), "$http_host".to_string()),
            ]
        );
    }

    #[test]
    fn listen_specs_are_deduplicated() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(
            config.listen_specs(),
            vec![
                ListenSpec {
                    port: 80,
                    tls: false
                },
                ListenSpec {
                    port: 443,
                    tls: true
                }
            ]
        );
    }

    #[test]
    fn rejects_unknown_upstream_reference() {
        let text = r#"
            server {
                listen 80;
                server_name example.com;
                location / { proxy_pass http://nowhere; }
            }
        "#;
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownUpstream(name) if name == "nowhere"));
    }

    #[test]
    fn rejects_tls_listen_without_certificate() {
        let text = r#"
            upstream u { server 127.0.0.1:9000; }
            server {
                listen 443 ssl;
                server_name example.com;
                location / { proxy_pass http://u; }
            }
        "#;
        assert!(matches!(
            Config::parse(text).unwrap_err(),
            ConfigError::MissingCertificate
        ));
    }

    #[test]
    fn rejects_listen_tls_conflict() {
        let text = r#"
            upstream u { server 127.0.0.1:9000; }
            server {
                listen 8080;
                server_name a.example.com;
                location / { proxy_pass http://u; }
            }
            server {
                listen 8080 ssl;
                server_name b.example.com;
                ssl_certificate /c.crt;
                ssl_certificate_key /c.key;
                location / { proxy_pass http://u; }
            }
        "#;
        assert!(matches!(
            Config::parse(text).unwrap_err(),
            ConfigError::ListenConflict(8080)
        ));
    }

    #[test]
    fn reports_line_numbers_on_parse_errors() {
        let text = "upstream u {\n    server 127.0.0.1:9000\n}\n";
        match Config::parse(text).unwrap_err() {
            ConfigError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn quoted_patterns_keep_braces() {
        let text = r#"
            upstream u { server 127.0.0.1:9000; }
            server {
                listen 80;
                server_name "~^c[0-9]{1,2}\.example\.com$";
                location / { proxy_pass http://u; }
            }
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(
            config.servers[0].server_name,
            r"~^c[0-9]{1,2}\.example\.com$"
        );
    }

    #[test]
    fn rejects_unknown_variable_in_set_header() {
        let text = r#"
            upstream u { server 127.0.0.1:9000; }
            server {
                listen 80;
                server_name example.com;
                location / {
                    proxy_pass http://u;
                    proxy_set_header X-Scheme $scheme;
                }
            }
        "#;
        match Config::parse(text).unwrap_err() {
            ConfigError::Directive { name, msg, .. } => {
                assert_eq!(name, "proxy_set_header");
                assert!(msg.contains("$scheme"), "{msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_garbage_target() {
        let text = r#"
            upstream u { server not-an-address; }
            server {
                listen 80;
                server_name example.com;
                location / { proxy_pass http://u; }
            }
        "#;
        assert!(matches!(
            Config::parse(text).unwrap_err(),
            ConfigError::Directive { .. }
        ));
    }
}
