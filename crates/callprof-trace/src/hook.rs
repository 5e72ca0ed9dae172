//! Process termination hooks.
//!
//! A session installs a callback that flushes its last snapshot while the
//! process is going down. The callback runs at most once.

use crate::notify::lock;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callback run when the process terminates
pub type TerminationCallback = Box<dyn FnOnce() + Send>;

/// Something that can run a callback at process termination
pub trait TerminationHook {
    /// Arrange for `callback` to run once at termination.
    ///
    /// Returns false if the hook could not be registered.
    fn install(&self, callback: TerminationCallback) -> bool;
}

static EXIT_CALLBACK: Mutex<Option<TerminationCallback>> = Mutex::new(None);
static EXIT_REGISTERED: AtomicBool = AtomicBool::new(false);

extern "C" fn run_exit_callback() {
    let callback = lock(&EXIT_CALLBACK).take();
    if let Some(callback) = callback {
        // Unwinding out of an extern "C" fn aborts the process
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
    }
}

/// Runs the callback from `atexit`, i.e. on return from `main` or
/// `std::process::exit`.
///
/// There is a single process-wide slot; installing again replaces the
/// pending callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtExitHook;

impl TerminationHook for AtExitHook {
    fn install(&self, callback: TerminationCallback) -> bool {
        *lock(&EXIT_CALLBACK) = Some(callback);

        if EXIT_REGISTERED.swap(true, Ordering::SeqCst) {
            return true;
        }
        // SAFETY: run_exit_callback is a plain extern "C" fn with no arguments
        let registered = unsafe { libc::atexit(run_exit_callback) } == 0;
        if !registered {
            EXIT_REGISTERED.store(false, Ordering::SeqCst);
            lock(&EXIT_CALLBACK).take();
        }
        registered
    }
}

/// Hook fired explicitly by the embedding code, e.g. from its own shutdown path
#[derive(Default)]
pub struct ManualHook {
    callback: Mutex<Option<TerminationCallback>>,
}

impl ManualHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the installed callback, if it has not run yet.
    ///
    /// Returns whether a callback ran.
    pub fn fire(&self) -> bool {
        let callback = lock(&self.callback).take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl TerminationHook for ManualHook {
    fn install(&self, callback: TerminationCallback) -> bool {
        *lock(&self.callback) = Some(callback);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_manual_hook_fires_once() {
        let hook = ManualHook::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        assert!(hook.install(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(hook.fire());
        assert!(!hook.fire());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_hook_without_callback() {
        assert!(!ManualHook::new().fire());
    }
}
