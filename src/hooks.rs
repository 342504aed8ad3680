//! Lifecycle hooks.
//!
//! A fixed set of callback points, each an optional plain function pointer
//! with an arity fixed by its name. Dispatch is synchronous and happens in
//! whichever process owns the lifecycle point: arbiter hooks run in the
//! master, worker hooks in the child.

use std::fmt;

use crate::app::{Environ, Response};
use crate::arbiter::{Arbiter, WorkerInfo};
use crate::worker::Worker;

/// User callbacks for server lifecycle points. All default to unset.
#[derive(Clone, Copy, Default)]
pub struct Hooks {
    /// Arbiter start, before sockets are bound.
    pub on_starting: Option<fn(&Arbiter)>,
    /// A `HUP` reload is about to happen.
    pub on_reload: Option<fn(&Arbiter)>,
    /// Initial workers are booted and the arbiter enters its loop.
    pub when_ready: Option<fn(&Arbiter)>,
    /// In the arbiter, just before forking a worker.
    pub pre_fork: Option<fn(&Arbiter, &WorkerInfo)>,
    /// In the freshly forked worker, before it initializes.
    pub post_fork: Option<fn(&Worker)>,
    /// In the worker, after the application is loaded.
    pub post_worker_init: Option<fn(&Worker)>,
    /// In the worker, on an interrupt (QUIT/INT) stop.
    pub worker_int: Option<fn(&Worker)>,
    /// In the worker, when the arbiter aborts it for a timeout.
    pub worker_abort: Option<fn(&Worker)>,
    /// In the arbiter, just before re-executing the binary (USR2).
    pub pre_exec: Option<fn(&Arbiter)>,
    /// In the worker, before the application is called.
    pub pre_request: Option<fn(&Worker, &Environ)>,
    /// In the worker, after the response has been written.
    pub post_request: Option<fn(&Worker, &Environ, &Response)>,
    /// In the arbiter, after reaping an exited worker.
    pub child_exit: Option<fn(&Arbiter, &WorkerInfo)>,
    /// In the worker, as its process exits.
    pub worker_exit: Option<fn(&Worker)>,
    /// In the arbiter, when the target worker count changes.
    /// Arguments are (arbiter, new count, old count).
    pub nworkers_changed: Option<fn(&Arbiter, usize, usize)>,
    /// In the arbiter, on final shutdown.
    pub on_exit: Option<fn(&Arbiter)>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = Vec::new();
        macro_rules! record {
            ($($name:ident),* $(,)?) => {
                $(if self.$name.is_some() {
                    set.push(stringify!($name));
                })*
            };
        }
        record!(
            on_starting,
            on_reload,
            when_ready,
            pre_fork,
            post_fork,
            post_worker_init,
            worker_int,
            worker_abort,
            pre_exec,
            pre_request,
            post_request,
            child_exit,
            worker_exit,
            nworkers_changed,
            on_exit,
        );
        f.debug_struct("Hooks").field("set", &set).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unset() {
        let hooks = Hooks::default();
        assert!(hooks.on_starting.is_none());
        assert!(hooks.when_ready.is_none());
        assert_eq!(format!("{:?}", hooks), "Hooks { set: [] }");
    }

    #[test]
    fn test_debug_lists_set_hooks() {
        fn noop(_: &Arbiter) {}
        let hooks = Hooks {
            on_starting: Some(noop),
            ..Hooks::default()
        };
        assert_eq!(format!("{:?}", hooks), "Hooks { set: [\"on_starting\"] }");
    }
}
