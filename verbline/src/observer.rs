//! Injected logging.
//!
//! The send and receive paths never log through a process-wide logger. Each
//! stream holds an [`Observer`] handed in at construction; the default
//! [`TracingObserver`] forwards to `tracing`.

use std::fmt;
use std::rc::Rc;

/// Severity of an observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
}

/// Receives diagnostic messages from streams and readers.
pub trait Observer {
    fn log(&self, level: Level, message: fmt::Arguments<'_>);

    fn debug(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Debug, message);
    }

    fn info(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Info, message);
    }

    fn warning(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Warning, message);
    }
}

/// Forwards messages to the `tracing` crate under the `verbline` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        match level {
            Level::Debug => tracing::debug!(target: "verbline", "{}", message),
            Level::Info => tracing::info!(target: "verbline", "{}", message),
            Level::Warning => tracing::warn!(target: "verbline", "{}", message),
        }
    }
}

/// Shared handle to the default observer.
pub fn tracing() -> Rc<dyn Observer> {
    Rc::new(TracingObserver)
}
