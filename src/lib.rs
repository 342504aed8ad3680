//! # bantam
//!
//! A pre-fork HTTP/1.x server for UNIX-like systems.
//!
//! bantam runs a master process (the *arbiter*) that binds the listening
//! sockets, forks a fleet of worker processes, and supervises them: workers
//! report liveness through the mtime of a per-worker temporary file, and the
//! arbiter kills and replaces any worker that goes silent for longer than the
//! configured timeout. Workers accept connections, parse requests with a
//! strict incremental HTTP/1.x engine, and hand each request to a
//! user-supplied [`Application`].
//!
//! The arbiter is driven entirely by OS signals: `TTIN`/`TTOU` scale the
//! worker count, `HUP` reloads with a fresh worker cohort, and `USR2`
//! re-executes the server binary in place without dropping the listening
//! sockets.
//!
//! bantam is designed to sit behind a buffering reverse proxy; it does not
//! speak TLS and serves exactly one request at a time per worker process.
//!
//! ```no_run
//! use bantam::{BoxError, Config, Environ, Response};
//!
//! fn hello(_environ: &mut Environ) -> Result<Response, BoxError> {
//!     Ok(Response::text(200, "Hello, World!\n"))
//! }
//!
//! let mut config = Config::default();
//! config.bind = vec!["127.0.0.1:8000".into()];
//! config.workers = 2;
//! std::process::exit(bantam::run(hello, config));
//! ```

#![deny(missing_debug_implementations)]

use std::sync::Arc;

pub mod app;
pub mod arbiter;
pub mod config;
mod error;
pub mod hooks;
mod pidfile;
mod proto;
mod reloader;
mod sock;
mod util;
pub mod worker;

pub use crate::app::{AppFactory, Application, BoxError, Environ, FileBody, Response, ResponseBody};
pub use crate::arbiter::Arbiter;
pub use crate::config::{Config, HeaderMapPolicy};
pub use crate::error::{Error, Parse, Result};
pub use crate::hooks::Hooks;

/// Run the server until shutdown, returning the process exit code.
///
/// This is the whole-crate entry point: it builds an [`Arbiter`] from the
/// configuration, forks the initial worker cohort, and supervises it until a
/// terminating signal arrives. The returned code follows the documented
/// contract (0 clean, 1 configuration, 3 worker class, 4 bind failure) and is
/// meant to be passed straight to [`std::process::exit`].
pub fn run<A>(app: A, config: Config) -> i32
where
    A: Application + 'static,
{
    let app = Arc::new(app);
    let factory = move || -> Result<Arc<dyn Application>> { Ok(app.clone()) };
    match Arbiter::new(config, Arc::new(factory)) {
        Ok(arbiter) => match arbiter.run() {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("arbiter error: {}", e);
                e.exit_code()
            }
        },
        Err(e) => {
            tracing::error!("startup error: {}", e);
            e.exit_code()
        }
    }
}
