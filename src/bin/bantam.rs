//! The `bantam` command-line entry point.
//!
//! Real deployments embed the library and pass their own application; this
//! binary wires the full flag surface to [`bantam::Config`] and serves a
//! small demo application, which is plenty for smoke tests and for driving
//! the arbiter from the shell.

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use bantam::{Application, Arbiter, BoxError, Config, Environ, HeaderMapPolicy, Response};

/// Extra command line words, applied between the config file and the
/// actual command line.
const CMD_ARGS_ENV: &str = "BANTAM_CMD_ARGS";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bantam",
    version,
    about = "A pre-fork HTTP/1.x server for UNIX systems"
)]
struct Args {
    /// Address to bind: host:port, unix:/path, or fd://N. Repeatable.
    #[arg(short = 'b', long = "bind")]
    bind: Vec<String>,

    /// Number of worker processes.
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Worker class (only "sync" is supported).
    #[arg(short = 'k', long = "worker-class")]
    worker_class: Option<String>,

    /// Threads per worker; ignored by the sync class.
    #[arg(long)]
    threads: Option<usize>,

    /// Seconds of worker silence before it is killed and respawned.
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Seconds a stopping worker may spend finishing its request.
    #[arg(long = "graceful-timeout")]
    graceful_timeout: Option<u64>,

    /// Seconds to wait for the next request on a keep-alive connection.
    #[arg(long = "keep-alive")]
    keep_alive: Option<u64>,

    /// Recycle a worker after this many requests (0 disables).
    #[arg(long = "max-requests")]
    max_requests: Option<usize>,

    /// Random extra requests added to --max-requests.
    #[arg(long = "max-requests-jitter")]
    max_requests_jitter: Option<usize>,

    /// Load the application before forking workers.
    #[arg(long)]
    preload: bool,

    /// Restart workers when the binary or watched files change.
    #[arg(long)]
    reload: bool,

    /// Pidfile path.
    #[arg(long)]
    pid: Option<PathBuf>,

    /// Directory for worker heartbeat files.
    #[arg(long = "worker-tmp-dir")]
    worker_tmp_dir: Option<PathBuf>,

    /// Switch workers to this user.
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Switch workers to this group.
    #[arg(short = 'g', long)]
    group: Option<String>,

    /// File mode creation mask, octal.
    #[arg(short = 'm', long)]
    umask: Option<String>,

    /// Detach from the terminal.
    #[arg(short = 'D', long)]
    daemon: bool,

    /// Change into this directory before serving.
    #[arg(long)]
    chdir: Option<PathBuf>,

    /// Kernel listen backlog.
    #[arg(long)]
    backlog: Option<i32>,

    /// Set SO_REUSEPORT on TCP listeners.
    #[arg(long = "reuse-port")]
    reuse_port: bool,

    /// Disable the sendfile(2) fast path.
    #[arg(long = "no-sendfile")]
    no_sendfile: bool,

    /// Comma-separated peers allowed to set forwarded headers; * for all.
    #[arg(long = "forwarded-allow-ips")]
    forwarded_allow_ips: Option<String>,

    /// Comma-separated environ keys a trusted proxy may set verbatim.
    #[arg(long = "forwarder-headers")]
    forwarder_headers: Option<String>,

    /// Policy for ambiguous header names: drop, refuse, or dangerous.
    #[arg(long = "header-map")]
    header_map: Option<String>,

    /// Max request-line bytes (0 = unlimited).
    #[arg(long = "limit-request-line")]
    limit_request_line: Option<usize>,

    /// Max number of header fields.
    #[arg(long = "limit-request-fields")]
    limit_request_fields: Option<usize>,

    /// Max bytes in one header field.
    #[arg(long = "limit-request-field-size")]
    limit_request_field_size: Option<usize>,

    /// Default log level when RUST_LOG is not set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// TOML configuration file.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// KEY=VALUE exported to workers. Repeatable.
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,
}

fn main() {
    let args = Args::parse_from(argv_with_env_words());
    init_tracing(&args.log_level);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bantam: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let factory = Arc::new(|| -> bantam::Result<Arc<dyn Application>> {
        Ok(Arc::new(demo_app))
    });
    let reload_args = args.clone();
    let arbiter = match Arbiter::new(config, factory) {
        Ok(arbiter) => arbiter.with_config_loader(move || build_config(&reload_args)),
        Err(e) => {
            eprintln!("bantam: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    match arbiter.run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("bantam: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// argv with `BANTAM_CMD_ARGS` words spliced in after the program name, so
/// the real command line keeps the last word.
fn argv_with_env_words() -> Vec<OsString> {
    let mut argv: Vec<OsString> = std::env::args_os().collect();
    if let Ok(extra) = std::env::var(CMD_ARGS_ENV) {
        let words: Vec<OsString> = extra.split_whitespace().map(OsString::from).collect();
        argv.splice(1..1, words);
    }
    argv
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_owned()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(args: &Args) -> bantam::Result<Config> {
    let mut cfg = Config::default();
    if let Some(path) = &args.config {
        cfg.load_file(path.clone())?;
    }

    if !args.bind.is_empty() {
        cfg.bind = args.bind.clone();
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    if let Some(class) = &args.worker_class {
        cfg.worker_class = class.clone();
    }
    if let Some(threads) = args.threads {
        cfg.threads = threads;
    }
    if let Some(timeout) = args.timeout {
        cfg.timeout = timeout;
    }
    if let Some(graceful) = args.graceful_timeout {
        cfg.graceful_timeout = graceful;
    }
    if let Some(keepalive) = args.keep_alive {
        cfg.keepalive = keepalive;
    }
    if let Some(max_requests) = args.max_requests {
        cfg.max_requests = max_requests;
    }
    if let Some(jitter) = args.max_requests_jitter {
        cfg.max_requests_jitter = jitter;
    }
    if args.preload {
        cfg.preload_app = true;
    }
    if args.reload {
        cfg.reload = true;
    }
    if let Some(pid) = &args.pid {
        cfg.pidfile = Some(pid.clone());
    }
    if let Some(dir) = &args.worker_tmp_dir {
        cfg.worker_tmp_dir = Some(dir.clone());
    }
    if let Some(user) = &args.user {
        cfg.user = Some(user.clone());
    }
    if let Some(group) = &args.group {
        cfg.group = Some(group.clone());
    }
    if let Some(umask) = &args.umask {
        cfg.umask = parse_octal(umask)?;
    }
    if args.daemon {
        cfg.daemon = true;
    }
    if let Some(dir) = &args.chdir {
        cfg.chdir = Some(dir.clone());
    }
    if let Some(backlog) = args.backlog {
        cfg.backlog = backlog;
    }
    if args.reuse_port {
        cfg.reuse_port = true;
    }
    if args.no_sendfile {
        cfg.sendfile = false;
    }
    if let Some(ips) = &args.forwarded_allow_ips {
        cfg.forwarded_allow_ips = split_csv(ips);
    }
    if let Some(headers) = &args.forwarder_headers {
        cfg.forwarder_headers = split_csv(headers);
    }
    if let Some(policy) = &args.header_map {
        cfg.header_map = policy
            .parse::<HeaderMapPolicy>()
            .map_err(bantam::Error::config)?;
    }
    if let Some(limit) = args.limit_request_line {
        cfg.limit_request_line = limit;
    }
    if let Some(limit) = args.limit_request_fields {
        cfg.limit_request_fields = limit;
    }
    if let Some(limit) = args.limit_request_field_size {
        cfg.limit_request_field_size = limit;
    }
    for pair in &args.env {
        match pair.split_once('=') {
            Some((key, value)) => cfg.raw_env.push((key.to_owned(), value.to_owned())),
            None => {
                return Err(bantam::Error::config(format!(
                    "malformed --env entry (want KEY=VALUE): {:?}",
                    pair
                )))
            }
        }
    }

    Ok(cfg)
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_octal(raw: &str) -> bantam::Result<u32> {
    let digits = raw.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|_| bantam::Error::config(format!("bad umask: {:?}", raw)))
}

/// The built-in demo application.
fn demo_app(environ: &mut Environ) -> Result<Response, BoxError> {
    match (environ.method(), environ.path()) {
        (_, "/") => Ok(Response::text(200, "Hello, World!\n")),
        ("POST", "/echo") => {
            let mut body = Vec::new();
            environ.body().read_to_end(&mut body)?;
            Ok(Response::new(200)
                .with_header("Content-Type", "application/octet-stream")
                .with_body(body))
        }
        _ => Ok(Response::text(404, "Not Found\n")),
    }
}
