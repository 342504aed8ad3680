//! Server configuration.
//!
//! A [`Config`] is a plain struct of settings with defaults matching the
//! documented CLI. Layers apply in increasing precedence: built-in defaults,
//! a TOML configuration file, the `BANTAM_CMD_ARGS` environment variable,
//! and finally command-line flags (the last two are merged by the `bantam`
//! binary before the file layer is applied here).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::proto::h1::ParseOptions;

/// What to do with a header whose environ mapping is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMapPolicy {
    /// Silently drop the header (the default).
    Drop,
    /// Reject the whole request.
    Refuse,
    /// Merge colliding values with comma joining, as legacy CGI did.
    Dangerous,
}

impl FromStr for HeaderMapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<HeaderMapPolicy, String> {
        match s {
            "drop" => Ok(HeaderMapPolicy::Drop),
            "refuse" => Ok(HeaderMapPolicy::Refuse),
            "dangerous" => Ok(HeaderMapPolicy::Dangerous),
            other => Err(format!("unknown header_map policy: {:?}", other)),
        }
    }
}

/// The full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Addresses to bind: `host:port`, `unix:/path`, or `fd://N`.
    pub bind: Vec<String>,
    /// Kernel listen backlog.
    pub backlog: i32,
    /// Number of worker processes.
    pub workers: usize,
    /// Worker class; only `"sync"` is supported.
    pub worker_class: String,
    /// Threads per worker; accepted for compatibility, ignored by `sync`.
    pub threads: usize,
    /// Seconds of worker silence before the arbiter kills it. 0 disables.
    pub timeout: u64,
    /// Seconds a stopping worker gets to finish its request.
    pub graceful_timeout: u64,
    /// Seconds to hold an idle keep-alive connection open. 0 disables
    /// keep-alive entirely.
    pub keepalive: u64,
    /// Requests a worker handles before it is recycled. 0 disables.
    pub max_requests: usize,
    /// Random extra requests added to `max_requests` per worker, to spread
    /// restarts out.
    pub max_requests_jitter: usize,
    /// Load the application in the arbiter, before forking.
    pub preload_app: bool,
    /// Restart workers when the binary or a watched file changes.
    pub reload: bool,
    /// Extra files watched by `reload`.
    pub reload_extra_files: Vec<PathBuf>,
    /// Detach from the controlling terminal.
    pub daemon: bool,
    /// Change into this directory before loading the application.
    pub chdir: Option<PathBuf>,
    /// Write the arbiter pid here.
    pub pidfile: Option<PathBuf>,
    /// Directory for worker heartbeat files; pick a RAM-backed filesystem
    /// if the default tmp dir can stall on metadata writes.
    pub worker_tmp_dir: Option<PathBuf>,
    /// Switch worker processes to this user.
    pub user: Option<String>,
    /// Switch worker processes to this group.
    pub group: Option<String>,
    /// File mode creation mask for the arbiter (octal).
    pub umask: u32,
    /// Set `SO_REUSEPORT` on TCP listeners.
    pub reuse_port: bool,
    /// Use `sendfile(2)` for file-backed response bodies.
    pub sendfile: bool,
    /// Peers allowed to set forwarded/secure-scheme headers. `*` trusts all.
    pub forwarded_allow_ips: Vec<String>,
    /// Environ keys a trusted proxy may set verbatim via same-named headers.
    pub forwarder_headers: Vec<String>,
    /// Policy for headers with an ambiguous environ mapping.
    pub header_map: HeaderMapPolicy,
    /// Header name/value pairs that mark a request as `https`.
    pub secure_scheme_headers: Vec<(String, String)>,
    /// Max request-line bytes. 0 is unlimited.
    pub limit_request_line: usize,
    /// Max number of header fields.
    pub limit_request_fields: usize,
    /// Max bytes in a single header field.
    pub limit_request_field_size: usize,
    /// Accept any RFC 7230 token as a method.
    pub permit_unconventional_http_method: bool,
    /// Accept versions other than 1.0 and 1.1.
    pub permit_unconventional_http_version: bool,
    /// Uppercase method tokens before validation.
    pub casefold_http_method: bool,
    /// Strip whitespace between a header name and its colon.
    pub strip_header_spaces: bool,
    /// Join obsolete folded continuation lines instead of rejecting them.
    pub permit_obsolete_folding: bool,
    /// Let Transfer-Encoding win over a conflicting Content-Length.
    pub tolerate_dangerous_framing: bool,
    /// Extra environment variables exported to workers.
    pub raw_env: Vec<(String, String)>,
    /// Lifecycle hooks.
    pub hooks: Hooks,
    /// Where the file layer was loaded from, if anywhere.
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind: vec!["127.0.0.1:8000".to_owned()],
            backlog: 2048,
            workers: 1,
            worker_class: "sync".to_owned(),
            threads: 1,
            timeout: 30,
            graceful_timeout: 30,
            keepalive: 2,
            max_requests: 0,
            max_requests_jitter: 0,
            preload_app: false,
            reload: false,
            reload_extra_files: Vec::new(),
            daemon: false,
            chdir: None,
            pidfile: None,
            worker_tmp_dir: None,
            user: None,
            group: None,
            umask: 0,
            reuse_port: false,
            sendfile: true,
            forwarded_allow_ips: vec!["127.0.0.1".to_owned(), "::1".to_owned()],
            forwarder_headers: vec!["SCRIPT_NAME".to_owned(), "PATH_INFO".to_owned()],
            header_map: HeaderMapPolicy::Drop,
            secure_scheme_headers: vec![
                ("X-FORWARDED-PROTOCOL".to_owned(), "ssl".to_owned()),
                ("X-FORWARDED-PROTO".to_owned(), "https".to_owned()),
                ("X-FORWARDED-SSL".to_owned(), "on".to_owned()),
            ],
            limit_request_line: 4094,
            limit_request_fields: 100,
            limit_request_field_size: 8190,
            permit_unconventional_http_method: false,
            permit_unconventional_http_version: false,
            casefold_http_method: false,
            strip_header_spaces: false,
            permit_obsolete_folding: false,
            tolerate_dangerous_framing: false,
            raw_env: Vec::new(),
            hooks: Hooks::default(),
            config_file: None,
        }
    }
}

impl Config {
    /// Apply the TOML file layer on top of the current values.
    pub fn load_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::new_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|e| {
            Error::new_config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        self.apply_file(file);
        self.config_file = Some(path);
        Ok(())
    }

    fn apply_file(&mut self, file: FileConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = file.$field {
                    self.$field = value;
                })*
            };
        }
        take!(
            bind,
            backlog,
            workers,
            worker_class,
            threads,
            timeout,
            graceful_timeout,
            keepalive,
            max_requests,
            max_requests_jitter,
            preload_app,
            reload,
            reload_extra_files,
            daemon,
            reuse_port,
            sendfile,
            forwarded_allow_ips,
            forwarder_headers,
            header_map,
            limit_request_line,
            limit_request_fields,
            limit_request_field_size,
            permit_unconventional_http_method,
            permit_unconventional_http_version,
            casefold_http_method,
            strip_header_spaces,
            permit_obsolete_folding,
            tolerate_dangerous_framing,
        );
        if let Some(chdir) = file.chdir {
            self.chdir = Some(chdir);
        }
        if let Some(pidfile) = file.pidfile {
            self.pidfile = Some(pidfile);
        }
        if let Some(dir) = file.worker_tmp_dir {
            self.worker_tmp_dir = Some(dir);
        }
        if let Some(user) = file.user {
            self.user = Some(user);
        }
        if let Some(group) = file.group {
            self.group = Some(group);
        }
        if let Some(umask) = file.umask {
            self.umask = umask;
        }
        if let Some(map) = file.secure_scheme_headers {
            self.secure_scheme_headers = map.into_iter().collect();
        }
        if let Some(env) = file.raw_env {
            self.raw_env = env
                .into_iter()
                .filter_map(|pair| {
                    let mut split = pair.splitn(2, '=');
                    match (split.next(), split.next()) {
                        (Some(k), Some(v)) => Some((k.to_owned(), v.to_owned())),
                        _ => {
                            warn!("ignoring malformed raw_env entry: {:?}", pair);
                            None
                        }
                    }
                })
                .collect();
        }
    }

    /// Check the merged configuration; classifies failures by exit code.
    pub fn validate(&self) -> Result<()> {
        if self.worker_class != "sync" {
            return Err(Error::new_worker_class(format!(
                "unknown worker class: {:?}",
                self.worker_class
            )));
        }
        if self.workers == 0 {
            return Err(Error::new_config("workers must be at least 1"));
        }
        if self.bind.is_empty() {
            return Err(Error::new_config("at least one bind address is required"));
        }
        for spec in &self.bind {
            crate::sock::parse_bind(spec)?;
        }
        if self.limit_request_fields > 32768 {
            return Err(Error::new_config(
                "limit_request_fields larger than 32768",
            ));
        }
        if self.threads > 1 {
            warn!("the sync worker ignores threads > 1");
        }
        Ok(())
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            limit_request_line: self.limit_request_line,
            limit_request_fields: self.limit_request_fields,
            limit_request_field_size: self.limit_request_field_size,
            permit_unconventional_http_method: self.permit_unconventional_http_method,
            permit_unconventional_http_version: self.permit_unconventional_http_version,
            casefold_http_method: self.casefold_http_method,
            strip_header_spaces: self.strip_header_spaces,
            permit_obsolete_folding: self.permit_obsolete_folding,
            tolerate_dangerous_framing: self.tolerate_dangerous_framing,
        }
    }

    /// Trailer names a request may never carry.
    pub(crate) fn forbidden_trailers(&self) -> Vec<String> {
        let mut names = vec![
            "content-length".to_owned(),
            "transfer-encoding".to_owned(),
            "host".to_owned(),
        ];
        for (name, _) in &self.secure_scheme_headers {
            names.push(name.to_ascii_lowercase());
        }
        names
    }
}

/// The TOML mirror of [`Config`]: every field optional, unknown keys refused.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<Vec<String>>,
    backlog: Option<i32>,
    workers: Option<usize>,
    worker_class: Option<String>,
    threads: Option<usize>,
    timeout: Option<u64>,
    graceful_timeout: Option<u64>,
    keepalive: Option<u64>,
    max_requests: Option<usize>,
    max_requests_jitter: Option<usize>,
    preload_app: Option<bool>,
    reload: Option<bool>,
    reload_extra_files: Option<Vec<PathBuf>>,
    daemon: Option<bool>,
    chdir: Option<PathBuf>,
    pidfile: Option<PathBuf>,
    worker_tmp_dir: Option<PathBuf>,
    user: Option<String>,
    group: Option<String>,
    umask: Option<u32>,
    reuse_port: Option<bool>,
    sendfile: Option<bool>,
    forwarded_allow_ips: Option<Vec<String>>,
    forwarder_headers: Option<Vec<String>>,
    header_map: Option<HeaderMapPolicy>,
    secure_scheme_headers: Option<BTreeMap<String, String>>,
    limit_request_line: Option<usize>,
    limit_request_fields: Option<usize>,
    limit_request_field_size: Option<usize>,
    permit_unconventional_http_method: Option<bool>,
    permit_unconventional_http_version: Option<bool>,
    casefold_http_method: Option<bool>,
    strip_header_spaces: Option<bool>,
    permit_obsolete_folding: Option<bool>,
    tolerate_dangerous_framing: Option<bool>,
    raw_env: Option<Vec<String>>,
}

impl fmt::Display for HeaderMapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeaderMapPolicy::Drop => "drop",
            HeaderMapPolicy::Refuse => "refuse",
            HeaderMapPolicy::Dangerous => "dangerous",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_validation_exit_codes() {
        let mut cfg = Config::default();
        cfg.worker_class = "gevent".to_owned();
        assert_eq!(cfg.validate().unwrap_err().exit_code(), 3);

        let mut cfg = Config::default();
        cfg.workers = 0;
        assert_eq!(cfg.validate().unwrap_err().exit_code(), 1);

        let mut cfg = Config::default();
        cfg.bind = vec!["not an address".to_owned()];
        assert_eq!(cfg.validate().unwrap_err().exit_code(), 1);
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
workers = 4
timeout = 60
bind = ["127.0.0.1:9000"]
header_map = "refuse"
raw_env = ["FOO=bar", "broken"]

[secure_scheme_headers]
X-CUSTOM-SSL = "yes"
"#
        )
        .unwrap();

        let mut cfg = Config::default();
        cfg.load_file(file.path()).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.timeout, 60);
        assert_eq!(cfg.bind, ["127.0.0.1:9000"]);
        assert_eq!(cfg.header_map, HeaderMapPolicy::Refuse);
        assert_eq!(cfg.raw_env, [("FOO".to_owned(), "bar".to_owned())]);
        assert_eq!(
            cfg.secure_scheme_headers,
            [("X-CUSTOM-SSL".to_owned(), "yes".to_owned())]
        );
        // untouched settings keep their defaults
        assert_eq!(cfg.keepalive, 2);
        assert_eq!(cfg.config_file.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_file_layer_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "wrokers = 4\n").unwrap();
        let mut cfg = Config::default();
        let err = cfg.load_file(file.path()).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_forbidden_trailers_include_scheme_headers() {
        let cfg = Config::default();
        let forbidden = cfg.forbidden_trailers();
        assert!(forbidden.contains(&"content-length".to_owned()));
        assert!(forbidden.contains(&"x-forwarded-proto".to_owned()));
    }
}
