//! Header-to-environ mapping.
//!
//! Turning header fields into `HTTP_*` CGI variables is lossy: `-` becomes
//! `_`, so `X-Forwarded-For` and `X_Forwarded_For` land on the same key.
//! Proxies filter by header name and miss the underscore spelling, which
//! makes the collision a request-smuggling vector. The `header_map` policy
//! decides what happens to names that cannot be mapped unambiguously.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

use crate::config::{Config, HeaderMapPolicy};
use crate::error::Parse;
use crate::proto::RequestHead;

/// Connection facts the environ needs beyond the parsed head.
#[derive(Debug)]
pub(crate) struct EnvironContext<'a> {
    pub(crate) cfg: &'a Config,
    /// `None` for connections arriving over a UNIX socket.
    pub(crate) peer_ip: Option<IpAddr>,
    pub(crate) remote_addr: String,
    pub(crate) remote_port: String,
    pub(crate) server_name: String,
    pub(crate) server_port: String,
}

impl<'a> EnvironContext<'a> {
    /// A peer is trusted when it arrives over a UNIX socket or its address
    /// is listed in `forwarded_allow_ips` (`*` trusts everyone).
    pub(crate) fn peer_trusted(&self) -> bool {
        match self.peer_ip {
            None => true,
            Some(ip) => {
                let ip = ip.to_string();
                self.cfg
                    .forwarded_allow_ips
                    .iter()
                    .any(|allowed| allowed == "*" || *allowed == ip)
            }
        }
    }
}

/// Build the CGI variable map for one request.
pub(crate) fn build_vars(
    head: &RequestHead,
    ctx: &EnvironContext<'_>,
) -> Result<HashMap<String, String>, Parse> {
    let trusted = ctx.peer_trusted();
    let scheme = url_scheme(head, ctx, trusted)?;

    let mut vars = HashMap::with_capacity(head.headers.len() + 16);
    vars.insert("REQUEST_METHOD".to_owned(), head.method.clone());
    vars.insert("SCRIPT_NAME".to_owned(), String::new());
    vars.insert("PATH_INFO".to_owned(), percent_decode(&head.target.path));
    vars.insert("QUERY_STRING".to_owned(), head.target.query.clone());
    vars.insert("RAW_URI".to_owned(), head.target.raw.clone());
    vars.insert(
        "SERVER_PROTOCOL".to_owned(),
        format!("HTTP/{}.{}", head.version.0, head.version.1),
    );
    vars.insert(
        "SERVER_SOFTWARE".to_owned(),
        crate::util::SERVER_SOFTWARE.to_owned(),
    );
    vars.insert("SERVER_NAME".to_owned(), ctx.server_name.clone());
    vars.insert("SERVER_PORT".to_owned(), ctx.server_port.clone());
    vars.insert("REMOTE_ADDR".to_owned(), ctx.remote_addr.clone());
    vars.insert("REMOTE_PORT".to_owned(), ctx.remote_port.clone());
    vars.insert("url_scheme".to_owned(), scheme);

    // key -> raw header name that first claimed it, for collision detection
    let mut claimed: HashMap<String, String> = HashMap::new();

    for (name, value) in &head.headers {
        let value = String::from_utf8_lossy(value).into_owned();
        let normalized = name.to_ascii_uppercase().replace('-', "_");

        if trusted
            && ctx
                .cfg
                .forwarder_headers
                .iter()
                .any(|f| f.eq_ignore_ascii_case(&normalized))
        {
            // a trusted proxy owns these keys outright
            vars.insert(normalized, value);
            continue;
        }

        let key = match normalized.as_str() {
            "CONTENT_TYPE" | "CONTENT_LENGTH" => normalized.clone(),
            _ => format!("HTTP_{}", normalized),
        };

        let lower = name.to_ascii_lowercase();
        let repeated_header = claimed.get(&key).map(|first| *first == lower);
        // an underscore name can only shadow a reserved variable (the
        // unprefixed CONTENT_* keys) through this same rule, so one check
        // covers both halves of the policy
        let ambiguous = name.contains('_') || repeated_header == Some(false);

        if ambiguous {
            match ctx.cfg.header_map {
                HeaderMapPolicy::Drop => {
                    debug!("dropping ambiguous header: {:?}", name);
                    continue;
                }
                HeaderMapPolicy::Refuse => {
                    debug!("refusing ambiguous header: {:?}", name);
                    return Err(Parse::InvalidHeaderName);
                }
                HeaderMapPolicy::Dangerous => {}
            }
        }

        if claimed.contains_key(&key) {
            // repeated field (or, under `dangerous`, a colliding one):
            // join values the CGI way
            let existing = vars.get_mut(&key).expect("claimed key is present");
            existing.push_str(", ");
            existing.push_str(&value);
        } else {
            vars.insert(key.clone(), value);
            claimed.insert(key, lower);
        }
    }

    Ok(vars)
}

/// Decide the request scheme from the configured secure-scheme headers.
///
/// Only trusted peers get a vote. Matching entries vote `https`; an entry
/// that is present with a different value votes `http`; a split vote is a
/// spoofing attempt and rejects the request.
fn url_scheme(
    head: &RequestHead,
    ctx: &EnvironContext<'_>,
    trusted: bool,
) -> Result<String, Parse> {
    if !trusted {
        return Ok("http".to_owned());
    }
    let mut secure = false;
    let mut insecure = false;
    for (name, expected) in &ctx.cfg.secure_scheme_headers {
        if let Some(value) = head.header(name) {
            if value == expected.as_bytes() {
                secure = true;
            } else {
                insecure = true;
            }
        }
    }
    if secure && insecure {
        debug!("secure scheme headers disagree");
        return Err(Parse::InvalidSchemeHeaders);
    }
    Ok(if secure { "https" } else { "http" }.to_owned())
}

/// Percent-decode a path the way CGI expects `PATH_INFO`.
fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &bytes[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    // decoded bytes are treated as latin-1, like the CGI world does
    out.into_iter().map(|b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Framing, RequestHead, RequestTarget};
    use bytes::Bytes;

    fn head_with(headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: "GET".into(),
            target: RequestTarget::parse(b"/p?q=1").unwrap(),
            version: (1, 1),
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_owned(), Bytes::copy_from_slice(v.as_bytes())))
                .collect(),
            framing: Framing::None,
        }
    }

    fn ctx(cfg: &Config) -> EnvironContext<'_> {
        EnvironContext {
            cfg,
            peer_ip: Some("127.0.0.1".parse().unwrap()),
            remote_addr: "127.0.0.1".into(),
            remote_port: "40000".into(),
            server_name: "127.0.0.1".into(),
            server_port: "8000".into(),
        }
    }

    #[test]
    fn test_basic_cgi_vars() {
        let cfg = Config::default();
        let head = head_with(&[("Host", "x"), ("User-Agent", "test")]);
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["REQUEST_METHOD"], "GET");
        assert_eq!(vars["PATH_INFO"], "/p");
        assert_eq!(vars["QUERY_STRING"], "q=1");
        assert_eq!(vars["RAW_URI"], "/p?q=1");
        assert_eq!(vars["SERVER_PROTOCOL"], "HTTP/1.1");
        assert_eq!(vars["HTTP_HOST"], "x");
        assert_eq!(vars["HTTP_USER_AGENT"], "test");
        assert_eq!(vars["url_scheme"], "http");
    }

    #[test]
    fn test_path_decoding() {
        let cfg = Config::default();
        let mut head = head_with(&[]);
        head.target = RequestTarget::parse(b"/a%20b%2Fc").unwrap();
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["PATH_INFO"], "/a b/c");
    }

    #[test]
    fn test_content_headers_unprefixed() {
        let cfg = Config::default();
        let head = head_with(&[("Content-Type", "text/plain"), ("Content-Length", "5")]);
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["CONTENT_TYPE"], "text/plain");
        assert_eq!(vars["CONTENT_LENGTH"], "5");
        assert!(!vars.contains_key("HTTP_CONTENT_TYPE"));
    }

    #[test]
    fn test_repeated_header_joined() {
        let cfg = Config::default();
        let head = head_with(&[("Cookie", "a=1"), ("Cookie", "b=2")]);
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["HTTP_COOKIE"], "a=1, b=2");
    }

    #[test]
    fn test_underscore_dropped_by_default() {
        let cfg = Config::default();
        let head = head_with(&[("X_Forwarded_For", "6.6.6.6"), ("X-Forwarded-For", "1.1.1.1")]);
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["HTTP_X_FORWARDED_FOR"], "1.1.1.1");
    }

    #[test]
    fn test_collision_policies() {
        let headers = [("X-Key", "good"), ("X_Key", "evil")];

        let cfg = Config::default();
        let vars = build_vars(&head_with(&headers), &ctx(&cfg)).unwrap();
        assert_eq!(vars["HTTP_X_KEY"], "good");

        let mut cfg = Config::default();
        cfg.header_map = HeaderMapPolicy::Refuse;
        assert_eq!(
            build_vars(&head_with(&headers), &ctx(&cfg)).unwrap_err(),
            Parse::InvalidHeaderName
        );

        let mut cfg = Config::default();
        cfg.header_map = HeaderMapPolicy::Dangerous;
        let vars = build_vars(&head_with(&headers), &ctx(&cfg)).unwrap();
        assert_eq!(vars["HTTP_X_KEY"], "good, evil");
    }

    #[test]
    fn test_forwarder_headers_bypass() {
        let mut cfg = Config::default();
        cfg.forwarder_headers = vec!["SCRIPT_NAME".into(), "PATH_INFO".into()];
        let head = head_with(&[("Script_Name", "/app")]);

        // trusted peer: mapped verbatim despite the underscore
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["SCRIPT_NAME"], "/app");

        // untrusted peer: the underscore name is dropped
        let mut untrusted = ctx(&cfg);
        untrusted.peer_ip = Some("203.0.113.9".parse().unwrap());
        let vars = build_vars(&head, &untrusted).unwrap();
        assert_eq!(vars["SCRIPT_NAME"], "");
    }

    #[test]
    fn test_secure_scheme_detection() {
        let cfg = Config::default();

        let head = head_with(&[("X-Forwarded-Proto", "https")]);
        let vars = build_vars(&head, &ctx(&cfg)).unwrap();
        assert_eq!(vars["url_scheme"], "https");

        // untrusted peers cannot vote
        let head = head_with(&[("X-Forwarded-Proto", "https")]);
        let mut untrusted = ctx(&cfg);
        untrusted.peer_ip = Some("203.0.113.9".parse().unwrap());
        let vars = build_vars(&head, &untrusted).unwrap();
        assert_eq!(vars["url_scheme"], "http");

        // disagreement is rejected
        let head = head_with(&[("X-Forwarded-Proto", "https"), ("X-Forwarded-Ssl", "off")]);
        assert_eq!(
            build_vars(&head, &ctx(&cfg)).unwrap_err(),
            Parse::InvalidSchemeHeaders
        );
    }

    #[test]
    fn test_unix_peer_is_trusted() {
        let cfg = Config::default();
        let head = head_with(&[("X-Forwarded-Proto", "https")]);
        let mut c = ctx(&cfg);
        c.peer_ip = None;
        let vars = build_vars(&head, &c).unwrap();
        assert_eq!(vars["url_scheme"], "https");
    }
}
