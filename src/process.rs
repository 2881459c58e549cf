//! The per-process runtime context.
//!
//! One `Process` exists per embedding. It is created before generated code
//! runs and carries everything that used to be ambient: the ownership hooks
//! registered by the code generator, the thread-spawn gate for the constant
//! evaluation phase, the live-worker count the shutdown sequence waits on,
//! and the sticky ignored-error flag fed by pipeline drains.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{ErrorObj, NO_ERROR, SILENT_FAIL};
use crate::text;
use crate::value::{ErrorRef, OwnershipHooks, Value};
use crate::worker::{self, WorkerContext};

/// How often the shutdown sequence re-checks the live-worker count.
const SHUTDOWN_POLL_MS: u64 = 100;

pub struct Process {
    hooks: Box<dyn OwnershipHooks>,
    threads_enabled: AtomicBool,
    /// The main thread counts as one; workers add and remove themselves.
    live_workers: AtomicU64,
    ignored_errors: AtomicBool,
}

impl Process {
    /// Creates the process context and the main thread's worker context.
    ///
    /// The hooks are fixed for the lifetime of the process; every duplicate
    /// or relinquished logical reference the runtime produces afterwards is
    /// reported through them.
    pub fn new<H: OwnershipHooks + 'static>(hooks: H) -> (Arc<Self>, WorkerContext) {
        let process = Arc::new(Self {
            hooks: Box::new(hooks),
            threads_enabled: AtomicBool::new(false),
            live_workers: AtomicU64::new(1),
            ignored_errors: AtomicBool::new(false),
        });
        (process, WorkerContext::new())
    }

    pub fn hooks(&self) -> &dyn OwnershipHooks {
        &*self.hooks
    }

    /// Opens the thread-spawn gate once constant evaluation is over.
    pub fn enable_threads(&self) {
        self.threads_enabled.store(true, Ordering::Release);
    }

    pub fn threads_enabled(&self) -> bool {
        self.threads_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn worker_started(&self) {
        self.live_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_finished(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn live_workers(&self) -> u64 {
        self.live_workers.load(Ordering::Acquire)
    }

    pub(crate) fn note_ignored_error(&self) {
        self.ignored_errors.store(true, Ordering::Release);
    }

    /// Whether any pipeline drain discarded an error nobody consumed.
    pub fn ignored_errors(&self) -> bool {
        self.ignored_errors.load(Ordering::Acquire)
    }

    /// Gives up one handle to an error record. When it was the last one, the
    /// payload the record carried is released through the hooks; the record
    /// and its message go away with the handle.
    pub fn release_error(&self, record: ErrorRef, ctx: &mut WorkerContext, flag: bool) {
        if let Some(record) = Arc::into_inner(record) {
            self.hooks.release(record.payload(), ctx, flag);
        }
    }

    /// Runs the shutdown sequence with the program's final result.
    ///
    /// An error-kind result is reported (unless its id asks for silence) and
    /// released; then the call blocks until every worker has finished, so no
    /// thread outlives the runtime. Returns `true` when the process should
    /// exit with a failure status: a real error result, or errors discarded
    /// unobserved along the way.
    pub fn finish(self: &Arc<Self>, result: Value, mut ctx: WorkerContext) -> bool {
        let mut failed = false;
        match result {
            Value::Error(record) => {
                if record.id() != NO_ERROR {
                    failed = true;
                    if record.id() != SILENT_FAIL {
                        text::println_as_error(record.message());
                    }
                }
                self.release_error(record, &mut ctx, false);
            }
            other => self.hooks.release(&other, &mut ctx, false),
        }
        while self.live_workers() != 1 {
            worker::sleep(SHUTDOWN_POLL_MS);
        }
        failed || self.ignored_errors()
    }
}

/// Reports an unrecoverable runtime fault and terminates the process.
pub fn fatal(message: &str) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::value::NoopHooks;

    struct CountingHooks {
        releases: AtomicU64,
    }

    impl OwnershipHooks for CountingHooks {
        fn retain(&self, _value: &Value, _ctx: &mut WorkerContext, _flag: bool) {}

        fn release(&self, _value: &Value, _ctx: &mut WorkerContext, _flag: bool) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn finish_with_plain_value_succeeds() {
        let (process, ctx) = Process::new(NoopHooks);
        assert!(!process.finish(Value::Int(0), ctx));
    }

    #[test]
    fn finish_with_no_error_id_succeeds() {
        let (process, ctx) = Process::new(NoopHooks);
        let result = ErrorObj::with_message(NO_ERROR, Value::Nothing, "all good");
        let Value::Error(record) = result else {
            unreachable!()
        };
        assert!(!process.finish(Value::Error(record), ctx));
    }

    #[test]
    fn finish_with_real_error_fails() {
        let (process, ctx) = Process::new(NoopHooks);
        let result = ErrorObj::with_message(77, Value::Nothing, "broke");
        assert!(process.finish(result, ctx));
    }

    #[test]
    fn finish_with_silent_fail_fails_quietly() {
        let (process, ctx) = Process::new(NoopHooks);
        let result = ErrorObj::with_message(SILENT_FAIL, Value::Nothing, "never shown");
        assert!(process.finish(result, ctx));
    }

    #[test]
    fn ignored_errors_force_a_failing_finish() {
        let (process, ctx) = Process::new(NoopHooks);
        process.note_ignored_error();
        assert!(process.finish(Value::Nothing, ctx));
    }

    #[test]
    fn finish_releases_the_result() {
        let hooks = Arc::new(CountingHooks {
            releases: AtomicU64::new(0),
        });
        let (process, ctx) = Process::new(Arc::clone(&hooks));
        assert!(!process.finish(Value::str("result"), ctx));
        assert_eq!(hooks.releases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn release_error_spares_the_payload_while_shared() {
        let hooks = Arc::new(CountingHooks {
            releases: AtomicU64::new(0),
        });
        let (process, mut ctx) = Process::new(Arc::clone(&hooks));
        let error = ErrorObj::with_message(1, Value::Int(9), "shared");
        let record = error.as_error().unwrap();
        let extra_handle = Arc::clone(record);
        process.release_error(Arc::clone(record), &mut ctx, false);
        // Two handles remain, so the payload must not be touched yet.
        assert_eq!(hooks.releases.load(Ordering::Relaxed), 0);
        drop(error);
        process.release_error(extra_handle, &mut ctx, false);
        assert_eq!(hooks.releases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn thread_gate_starts_closed() {
        let (process, _ctx) = Process::new(NoopHooks);
        assert!(!process.threads_enabled());
        process.enable_threads();
        assert!(process.threads_enabled());
    }
}
