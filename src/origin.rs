//! Upstream origin parsing
//!
//! The origin is the single HTTP service every request is forwarded to. It is
//! given as a URL; only the scheme, host, port and base path are used.

use std::fmt;
use thiserror::Error;
use url::{Host, Url};

/// Host used to reach an origin written without one, such as `http://:3000`
const LOCAL_HOST: &str = "localhost";

/// Errors produced while parsing an origin URL
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("invalid origin URL '{input}': {source}")]
    Parse {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("origin URL '{0}' has no host")]
    MissingHost(String),
    #[error("unable to determine port for origin '{0}', please specify one explicitly")]
    UnknownPort(String),
    #[error("origin URL '{0}' has port 0, port must be greater than zero")]
    PortOutOfRange(String),
}

/// The upstream service requests are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    url: Url,
    host: String,
    explicit_port: Option<u16>,
    port: u16,
}

impl OriginTarget {
    /// An origin without a host (`http://:3000`) targets the local machine and
    /// reports an empty [`host`](OriginTarget::host).
    pub fn parse(input: &str) -> Result<Self, OriginError> {
        let parse_err = |source| OriginError::Parse {
            input: input.to_string(),
            source,
        };

        let (url, local) = match Url::parse(input.trim()) {
            Ok(url) => (url, false),
            Err(url::ParseError::EmptyHost) => {
                let url = with_local_host(input.trim())
                    .ok_or(url::ParseError::EmptyHost)
                    .and_then(|local| Url::parse(&local))
                    .map_err(parse_err)?;
                (url, true)
            }
            Err(source) => return Err(parse_err(source)),
        };

        let host = match url.host() {
            _ if local => String::new(),
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(OriginError::MissingHost(input.to_string())),
        };

        // `Url::port` hides ports equal to the scheme default, so fall back to it
        let explicit_port = url.port();
        let port = explicit_port
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| OriginError::UnknownPort(input.to_string()))?;

        if port == 0 {
            return Err(OriginError::PortOutOfRange(input.to_string()));
        }

        Ok(Self {
            url,
            host,
            explicit_port,
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host name or IP literal, without IPv6 brackets. Empty for the local
    /// machine.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port as written in the URL, if any
    pub fn explicit_port(&self) -> Option<u16> {
        self.explicit_port
    }

    /// Port after applying the scheme default
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.is_empty() {
            format!("{}:{}", LOCAL_HOST, self.port)
        } else if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Build the upstream URI for an inbound request path and query.
    ///
    /// The origin's base path is joined to the request path with exactly one
    /// slash between them; both queries are kept.
    pub fn uri_for(&self, path: &str, query: Option<&str>) -> String {
        let path = single_joining_slash(self.url.path(), path);
        let query = match (self.url.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(extra)) => format!("?{}&{}", base, extra),
            (Some(q), None) | (None, Some(q)) => format!("?{}", q),
            (None, None) => String::new(),
        };
        format!("{}://{}{}{}", self.scheme(), self.authority(), path, query)
    }
}

impl fmt::Display for OriginTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// `scheme://:port/...` with the local host filled in
fn with_local_host(input: &str) -> Option<String> {
    let (scheme, rest) = input.split_once("://")?;
    rest.starts_with(':')
        .then(|| format!("{}://{}{}", scheme, LOCAL_HOST, rest))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn single_joining_slash(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_explicit_port() {
        let origin = OriginTarget::parse("http://localhost:3000").unwrap();
        assert_eq!(origin.scheme(), "http");
        assert_eq!(origin.host(), "localhost");
        assert_eq!(origin.explicit_port(), Some(3000));
        assert_eq!(origin.port(), 3000);
        assert_eq!(origin.authority(), "localhost:3000");
    }

    #[test]
    fn test_default_ports() {
        let http = OriginTarget::parse("http://example.com").unwrap();
        assert_eq!(http.explicit_port(), None);
        assert_eq!(http.port(), 80);

        let https = OriginTarget::parse("https://example.com").unwrap();
        assert_eq!(https.port(), 443);

        // An explicit default port is still resolved
        let explicit = OriginTarget::parse("http://example.com:80").unwrap();
        assert_eq!(explicit.port(), 80);
    }

    #[test]
    fn test_unknown_scheme_requires_port() {
        let err = OriginTarget::parse("ftp://example.com").unwrap_err();
        assert!(matches!(err, OriginError::UnknownPort(_)));

        let origin = OriginTarget::parse("ftp://example.com:2121").unwrap();
        assert_eq!(origin.port(), 2121);
    }

    #[test]
    fn test_malformed_origin() {
        assert!(matches!(
            OriginTarget::parse("://bad").unwrap_err(),
            OriginError::Parse { .. }
        ));
        assert!(OriginTarget::parse("").is_err());
        assert!(OriginTarget::parse("http://localhost:99999").is_err());
    }

    #[test]
    fn test_empty_host_targets_local_machine() {
        let origin = OriginTarget::parse("http://:3000/api").unwrap();
        assert_eq!(origin.host(), "");
        assert_eq!(origin.port(), 3000);
        assert_eq!(origin.authority(), "localhost:3000");
        assert_eq!(origin.uri_for("/users", None), "http://localhost:3000/api/users");

        let default_port = OriginTarget::parse("http://:80").unwrap();
        assert_eq!(default_port.host(), "");
        assert_eq!(default_port.port(), 80);

        assert!(matches!(
            OriginTarget::parse("http://:nope").unwrap_err(),
            OriginError::Parse { .. }
        ));
    }

    #[test]
    fn test_port_zero_rejected() {
        let err = OriginTarget::parse("http://localhost:0").unwrap_err();
        assert!(matches!(err, OriginError::PortOutOfRange(_)));
    }

    #[test]
    fn test_ipv6_authority() {
        let origin = OriginTarget::parse("http://[::1]:8000").unwrap();
        assert_eq!(origin.host(), "::1");
        assert_eq!(origin.authority(), "[::1]:8000");
    }

    #[test]
    fn test_uri_for_joins_paths() {
        let origin = OriginTarget::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(origin.uri_for("/hello", None), "http://127.0.0.1:3000/hello");
        assert_eq!(
            origin.uri_for("/search", Some("q=rust")),
            "http://127.0.0.1:3000/search?q=rust"
        );

        let prefixed = OriginTarget::parse("http://127.0.0.1:3000/api/").unwrap();
        assert_eq!(prefixed.uri_for("/users", None), "http://127.0.0.1:3000/api/users");

        let no_slash = OriginTarget::parse("http://127.0.0.1:3000/api").unwrap();
        assert_eq!(no_slash.uri_for("/users", None), "http://127.0.0.1:3000/api/users");
    }

    #[test]
    fn test_uri_for_merges_queries() {
        let origin = OriginTarget::parse("http://127.0.0.1:3000/?token=abc").unwrap();
        assert_eq!(
            origin.uri_for("/data", Some("page=2")),
            "http://127.0.0.1:3000/data?token=abc&page=2"
        );
    }

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/a/", "/b"), "/a/b");
        assert_eq!(single_joining_slash("/a", "b"), "/a/b");
        assert_eq!(single_joining_slash("/a", "/b"), "/a/b");
        assert_eq!(single_joining_slash("/a/", "b"), "/a/b");
    }
}
