// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process logging: a console backend for the `log` facade.
//!
//! The library logs exclusively through `log::debug!` and friends. This
//! module supplies the process side: a stderr backend, a runtime level
//! threshold held in an atomic, and a thread-local tag ("worker #3",
//! "app echo") prefixed to every record. The tag and the threshold are
//! the only process-wide mutable state in the server.

use std::cell::RefCell;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Runtime level threshold, mirrored from `log::max_level()` so hot
/// paths can pre-filter with a single relaxed load.
static MAX_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

thread_local! {
    /// Thread tag installed at thread start; empty during the
    /// single-threaded startup phase.
    static THREAD_TAG: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Install this thread's log tag. Called once at the top of every
/// spawned worker and app thread.
pub fn set_thread_tag(tag: impl Into<String>) {
    THREAD_TAG.with(|t| *t.borrow_mut() = tag.into());
}

fn with_thread_tag<R>(f: impl FnOnce(&str) -> R) -> R {
    THREAD_TAG.with(|t| f(t.borrow().as_str()))
}

/// Stderr logger with level threshold and thread tags.
pub struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() as usize <= MAX_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        with_thread_tag(|tag| {
            let mut err = std::io::stderr().lock();
            if tag.is_empty() {
                let _ = writeln!(err, "[{}] {}", level, record.args());
            } else {
                let _ = writeln!(err, "[{}] {}: {}", level, tag, record.args());
            }
        });
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the console logger with the given threshold.
///
/// Safe to call more than once; later calls only adjust the threshold.
pub fn init(level: LevelFilter) {
    MAX_LEVEL.store(level as usize, Ordering::Relaxed);
    log::set_max_level(level);
    // set_logger fails if a logger is already installed; that is fine.
    let _ = log::set_logger(&LOGGER);
}

/// Adjust the runtime threshold without reinstalling the logger.
pub fn set_level(level: LevelFilter) {
    MAX_LEVEL.store(level as usize, Ordering::Relaxed);
    log::set_max_level(level);
}
