//! RFC 3986 URI parsing, percent-encoding, and the query multimap.
//!
//! Mirrors `examples/original_source/server-cpp/src/uri.cc`: the same
//! appendix-B regular expression, the same authority-splitting rules, and
//! the same `"localhost"` fallback for `authority()`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ServerError;

// https://www.rfc-editor.org/rfc/rfc3986#appendix-B
//             12            3  4          5       6  7        8 9
static URI_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(([^:/?#]+):)?(//([^/?#]*))?([^?#]*)(\?([^#]*))?(#(.*))?$").unwrap()
});

/// A parsed URI, with `port` kept as a string to preserve its original form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub userinfo: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub fragment: String,
}

impl Uri {
    pub fn parse(s: &str) -> Result<Self, ServerError> {
        let caps = URI_RX
            .captures(s)
            .ok_or_else(|| ServerError::InvalidUri(s.to_string()))?;

        let scheme = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
        let authority = caps.get(4).map(|m| m.as_str()).unwrap_or("");
        let path = caps.get(5).map(|m| m.as_str()).unwrap_or("").to_string();
        let query_str = caps.get(7).map(|m| m.as_str()).unwrap_or("");
        let fragment = caps.get(9).map(|m| m.as_str()).unwrap_or("").to_string();

        let mut userinfo = String::new();
        let mut host = String::new();
        let mut port = String::new();
        if !authority.is_empty() {
            let (userinfo_part, rest) = match authority.find('@') {
                Some(n) => (&authority[..n], &authority[n + 1..]),
                None => ("", authority),
            };
            userinfo = userinfo_part.to_string();
            match rest.find(':') {
                Some(n) => {
                    host = rest[..n].to_string();
                    port = rest[n + 1..].to_string();
                }
                None => host = rest.to_string(),
            }
        }

        Ok(Uri {
            scheme,
            userinfo,
            host,
            port,
            path,
            query: parse_query_string(query_str),
            fragment,
        })
    }

    pub fn authority(&self) -> String {
        let mut out = String::new();
        if !self.userinfo.is_empty() {
            out.push_str(&self.userinfo);
            out.push('@');
        }
        if self.host.is_empty() {
            if !self.port.is_empty() || !self.userinfo.is_empty() {
                out.push_str("localhost");
            }
        } else {
            out.push_str(&self.host);
        }
        if !self.port.is_empty() {
            out.push(':');
            out.push_str(&self.port);
        }
        out
    }

    pub fn query_str(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port.to_string();
    }

    pub fn to_string_checked(&self, no_check: bool) -> Result<String, ServerError> {
        let mut out = String::new();
        if !self.scheme.is_empty() {
            out.push_str(&self.scheme);
            out.push(':');
        }
        let auth = self.authority();
        if !auth.is_empty() {
            out.push_str("//");
            out.push_str(&auth);
        }
        out.push_str(&self.path);
        if !self.query.is_empty() {
            out.push('?');
            out.push_str(&self.query_str());
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&self.fragment);
        }
        if !no_check && !URI_RX.is_match(&out) {
            return Err(ServerError::InvalidUri(out));
        }
        Ok(out)
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_checked(true).unwrap_or_default())
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9\-_.~]`.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Reverses `encode`; `+` decodes to space. Rejects truncated/invalid escapes.
pub fn decode(s: &str) -> Result<String, ServerError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(ServerError::request(
                        "bad string to decode (%-encoding truncated)",
                    ));
                }
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .map_err(|_| ServerError::request("bad %-encoding"))?;
                let code = u32::from_str_radix(hex, 16)
                    .map_err(|_| ServerError::request("bad %-encoding"))?;
                if code > 0xff {
                    return Err(ServerError::request(
                        "could not url-decode large code (extended set?)",
                    ));
                }
                out.push(code as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|e| ServerError::request(e.to_string()))
}

fn parse_query_string(s: &str) -> Vec<(String, String)> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split('&')
        .map(|entry| match entry.find('=') {
            Some(n) => (entry[..n].to_string(), entry[n + 1..].to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_basic() {
        let s = "http://user@example.com:8080/a/b?x=1&y=2#frag";
        let u = Uri::parse(s).unwrap();
        assert_eq!(u.scheme, "http");
        assert_eq!(u.userinfo, "user");
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, "8080");
        assert_eq!(u.path, "/a/b");
        assert_eq!(u.query, vec![("x".into(), "1".into()), ("y".into(), "2".into())]);
        assert_eq!(u.fragment, "frag");
        assert_eq!(u.to_string_checked(false).unwrap(), s);
    }

    #[test]
    fn authority_localhost_fallback() {
        let mut u = Uri::default();
        u.port = "80".into();
        assert_eq!(u.authority(), "localhost:80");
    }

    #[test]
    fn authority_empty_when_nothing_set() {
        let u = Uri::default();
        assert_eq!(u.authority(), "");
    }

    #[test]
    fn percent_encoding_is_an_involution() {
        for s in ["hello world", "a/b?c=d&e=f#g", "日本語", "plain-ok_."] {
            assert_eq!(decode(&encode(s)).unwrap(), s);
        }
    }

    #[test]
    fn decode_truncated_escape_errors() {
        assert!(decode("abc%2").is_err());
    }

    #[test]
    fn path_only_round_trip() {
        let u = Uri::parse("/api/proc/w-1/").unwrap();
        assert_eq!(u.path, "/api/proc/w-1/");
        assert_eq!(u.to_string_checked(false).unwrap(), "/api/proc/w-1/");
    }
}
