//! Pieces pertaining to the HTTP message protocol.

pub(crate) mod environ;
pub(crate) mod h1;

use bytes::Bytes;

use crate::error::Parse;

/// How the request body boundary is determined.
///
/// Exactly one framing decision is reached per accepted message; requests
/// that would admit more than one are rejected during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body follows the header section.
    None,
    /// A body of exactly this many bytes.
    Length(u64),
    /// A chunked transfer-coded body.
    Chunked,
}

/// A parsed request-target, kept alongside the raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RequestTarget {
    pub(crate) raw: String,
    pub(crate) scheme: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) fragment: String,
}

impl RequestTarget {
    /// Split a request-target into its components.
    ///
    /// Handles the four RFC 7230 forms: origin (`/path?q`), absolute
    /// (`http://host/path`), authority (`host:port`, CONNECT only), and
    /// asterisk (`*`).
    pub(crate) fn parse(raw: &[u8]) -> Result<RequestTarget, Parse> {
        if raw.is_empty() {
            return Err(Parse::InvalidRequestLine);
        }
        // the request line was already checked for spaces; control and
        // non-ASCII bytes are what is left to refuse
        if raw.iter().any(|&b| b < 0x21 || b > 0x7e) {
            return Err(Parse::InvalidRequestLine);
        }
        let raw = std::str::from_utf8(raw).map_err(|_| Parse::InvalidRequestLine)?;

        let mut target = RequestTarget {
            raw: raw.to_owned(),
            ..RequestTarget::default()
        };

        if raw == "*" {
            target.path = "*".to_owned();
            return Ok(target);
        }

        let mut rest = raw;
        if let Some(idx) = rest.find('#') {
            target.fragment = rest[idx + 1..].to_owned();
            rest = &rest[..idx];
        }
        if let Some(idx) = rest.find('?') {
            target.query = rest[idx + 1..].to_owned();
            rest = &rest[..idx];
        }

        if rest.starts_with('/') {
            target.path = rest.to_owned();
        } else if let Some(idx) = rest.find("://") {
            target.scheme = Some(rest[..idx].to_ascii_lowercase());
            let after = &rest[idx + 3..];
            match after.find('/') {
                Some(slash) => {
                    target.host = Some(after[..slash].to_owned());
                    target.path = after[slash..].to_owned();
                }
                None => {
                    if after.is_empty() {
                        return Err(Parse::InvalidRequestLine);
                    }
                    target.host = Some(after.to_owned());
                    target.path = "/".to_owned();
                }
            }
        } else {
            // authority-form, only meaningful for CONNECT
            target.host = Some(rest.to_owned());
        }
        Ok(target)
    }
}

/// A parsed request head: everything before the body.
#[derive(Debug)]
pub(crate) struct RequestHead {
    /// The method token, exactly as received (unless casefolding is on).
    pub(crate) method: String,
    pub(crate) target: RequestTarget,
    pub(crate) version: (u8, u8),
    /// Header fields in first-occurrence order.
    pub(crate) headers: Vec<(String, Bytes)>,
    pub(crate) framing: Framing,
}

impl RequestHead {
    /// First value of the named header, matched case-insensitively.
    pub(crate) fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Whether the client asked for (or defaulted to) a persistent connection.
    pub(crate) fn keep_alive(&self) -> bool {
        let conn = self
            .header("connection")
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("");
        let has_token = |token: &str| {
            conn.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        match self.version {
            (1, 1) => !has_token("close"),
            (1, 0) => has_token("keep-alive"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_origin_form() {
        let t = RequestTarget::parse(b"/echo?a=1&b=2#frag").unwrap();
        assert_eq!(t.path, "/echo");
        assert_eq!(t.query, "a=1&b=2");
        assert_eq!(t.fragment, "frag");
        assert_eq!(t.scheme, None);
        assert_eq!(t.raw, "/echo?a=1&b=2#frag");
    }

    #[test]
    fn test_target_absolute_form() {
        let t = RequestTarget::parse(b"HTTP://example.com:8080/p?q").unwrap();
        assert_eq!(t.scheme.as_deref(), Some("http"));
        assert_eq!(t.host.as_deref(), Some("example.com:8080"));
        assert_eq!(t.path, "/p");
        assert_eq!(t.query, "q");
    }

    #[test]
    fn test_target_authority_and_asterisk() {
        let t = RequestTarget::parse(b"example.com:443").unwrap();
        assert_eq!(t.host.as_deref(), Some("example.com:443"));
        assert_eq!(RequestTarget::parse(b"*").unwrap().path, "*");
    }

    #[test]
    fn test_target_rejects_controls() {
        RequestTarget::parse(b"/a\x00b").unwrap_err();
        RequestTarget::parse(b"/a\x7fb").unwrap_err();
        RequestTarget::parse(b"").unwrap_err();
    }

    #[test]
    fn test_keep_alive_defaults() {
        let mut head = RequestHead {
            method: "GET".into(),
            target: RequestTarget::parse(b"/").unwrap(),
            version: (1, 1),
            headers: vec![],
            framing: Framing::None,
        };
        assert!(head.keep_alive());
        head.version = (1, 0);
        assert!(!head.keep_alive());
        head.headers
            .push(("Connection".into(), Bytes::from_static(b"Keep-Alive")));
        assert!(head.keep_alive());
        head.version = (1, 1);
        head.headers[0].1 = Bytes::from_static(b"close");
        assert!(!head.keep_alive());
    }
}
