//! Worker threads and their per-thread execution contexts.
//!
//! A worker is a plain OS thread running a supplied function over an input
//! and an output pipeline. Spawning acquires both pipelines for the worker's
//! lifetime; the thread pushes the function's result onto the output, then
//! releases both, so a worker's failure can only surface through its output
//! pipeline (or through the drain-time safety net in [`crate::pipeline`]).
//!
//! Each worker owns a [`WorkerContext`]: an id, three independent
//! linear-congruential streams for cheap randomness, and a cache of OS
//! entropy for cryptographic randomness. Contexts are never shared between
//! threads, which keeps both generators free of data races.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::pipeline::PipelineRef;
use crate::process::{Process, fatal};
use crate::value::Value;

/// Words of OS entropy cached per context.
const CRYPTO_WORDS: usize = 64;

/// The function a worker runs. The trailing bool is an opaque pass-through
/// parameter owned by the code generator; `spawn` forwards `true`.
pub type WorkerFn =
    Box<dyn FnOnce(PipelineRef, PipelineRef, &mut WorkerContext, bool) -> Value + Send + 'static>;

/// Per-thread execution state, created before the worker function runs and
/// dropped when it returns. Exclusive to its thread.
pub struct WorkerContext {
    id: u64,
    rng: [u64; 3],
    crypto: [u64; CRYPTO_WORDS],
    crypto_index: usize,
}

impl WorkerContext {
    pub(crate) fn new() -> Self {
        let mut ctx = Self {
            id: std::process::id() as u64,
            rng: [0; 3],
            crypto: [0; CRYPTO_WORDS],
            crypto_index: CRYPTO_WORDS,
        };
        ctx.rng = [
            ctx.crypto_random(),
            ctx.crypto_random(),
            ctx.crypto_random(),
        ];
        ctx
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// A fast 64-bit random number.
    ///
    /// Three LCG streams with distinct multipliers advance independently; the
    /// result packs a 15-bit, a 32-bit and a 17-bit window of their
    /// pre-advance states, low to high.
    pub fn random(&mut self) -> u64 {
        let low = (self.rng[0] >> 16) & 0x7fff;
        let mid = (self.rng[1] >> 32) & 0xffff_ffff;
        let high = (self.rng[2] >> 16) & 0x1_ffff;
        self.rng[0] = self.rng[0].wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.rng[1] = self.rng[1]
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        self.rng[2] = self.rng[2].wrapping_mul(25_214_903_917).wrapping_add(11);
        low | (mid << 14) | (high << 46)
    }

    /// One 64-bit word from the cached OS entropy. Refills the cache when it
    /// runs out; an unavailable entropy source is fatal.
    pub fn crypto_random(&mut self) -> u64 {
        if self.crypto_index == CRYPTO_WORDS {
            let mut bytes = [0u8; CRYPTO_WORDS * 8];
            if getrandom::getrandom(&mut bytes).is_err() {
                fatal("can't read from the OS entropy source");
            }
            for (word, chunk) in self.crypto.iter_mut().zip(bytes.chunks_exact(8)) {
                *word = u64::from_ne_bytes(chunk.try_into().unwrap());
            }
            self.crypto_index = 0;
        }
        let word = self.crypto[self.crypto_index];
        self.crypto_index += 1;
        word
    }
}

/// Starts a worker thread over an input and an output pipeline.
///
/// Spawning before [`Process::enable_threads`] aborts the process: the
/// compile-time constant evaluation phase must stay single-threaded. Both
/// pipelines are acquired on behalf of the worker and released when it
/// finishes; the live-worker counter keeps [`Process::finish`] honest.
pub fn spawn(process: &Arc<Process>, function: WorkerFn, input: PipelineRef, output: PipelineRef) {
    if !process.threads_enabled() {
        fatal("threads are forbidden while compile-time constants are being evaluated");
    }
    input.acquire();
    output.acquire();
    process.worker_started();
    let process = Arc::clone(process);
    let spawned = thread::Builder::new()
        .name("sable-worker".into())
        .spawn(move || {
            let mut ctx = WorkerContext::new();
            let result = function(Arc::clone(&input), Arc::clone(&output), &mut ctx, true);
            output.push(result);
            input.release(&process, &mut ctx);
            output.release(&process, &mut ctx);
            process.worker_finished();
        });
    if spawned.is_err() {
        fatal("failed to start a worker thread");
    }
}

pub fn yield_now() {
    thread::yield_now();
}

/// Sleeps for at least the given number of milliseconds. Signal
/// interruptions are retried internally; this never returns early because of
/// them.
pub fn sleep(milliseconds: u64) {
    thread::sleep(Duration::from_millis(milliseconds));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::value::NoopHooks;

    #[test]
    fn random_packs_the_three_windows() {
        let mut ctx = WorkerContext::new();
        ctx.rng = [u64::MAX, u64::MAX, u64::MAX];
        // 15 + 32 + 17 bits, all set: every bit below 63.
        assert_eq!(ctx.random(), 0x7fff_ffff_ffff_ffff);
        // All three streams advanced.
        assert_ne!(ctx.rng[0], u64::MAX);
        assert_ne!(ctx.rng[1], u64::MAX);
        assert_ne!(ctx.rng[2], u64::MAX);
    }

    #[test]
    fn random_uses_the_pre_advance_state() {
        let mut ctx = WorkerContext::new();
        ctx.rng = [0x0001_0000, 0, 0];
        // Stream 0 contributes bit 16 of its old state as result bit 0.
        assert_eq!(ctx.random(), 1);
    }

    #[test]
    fn crypto_cache_refills_after_sixty_four_words() {
        let mut ctx = WorkerContext::new();
        let first: Vec<u64> = (0..CRYPTO_WORDS).map(|_| ctx.crypto_random()).collect();
        let second: Vec<u64> = (0..CRYPTO_WORDS).map(|_| ctx.crypto_random()).collect();
        // 64 fresh words from the entropy source; a repeat of the whole
        // cache would mean the refill never happened.
        assert_ne!(first, second);
    }

    #[test]
    fn contexts_are_seeded_independently() {
        let a = WorkerContext::new();
        let b = WorkerContext::new();
        assert_ne!(a.rng, b.rng);
    }

    #[test]
    fn worker_runs_and_releases_its_pipelines() {
        let (process, mut ctx) = Process::new(NoopHooks);
        process.enable_threads();
        let input = Pipeline::new();
        let output = Pipeline::new();

        // The worker blocks until an item shows up, so the holder counts can
        // be observed while it is alive.
        spawn(
            &process,
            Box::new(|input, _output, _ctx, _flag| {
                loop {
                    let item = input.pop();
                    if !item.is_nothing() {
                        return item;
                    }
                    sleep(1);
                }
            }),
            Arc::clone(&input),
            Arc::clone(&output),
        );
        assert_eq!(input.holders(), Some(2));
        assert_eq!(output.holders(), Some(2));
        assert_eq!(process.live_workers(), 2);

        input.push(Value::Int(7));
        let result = loop {
            let item = output.pop();
            if !item.is_nothing() {
                break item;
            }
            sleep(1);
        };
        assert_eq!(result.as_int(), Some(7));

        while process.live_workers() != 1 {
            sleep(1);
        }
        assert_eq!(input.holders(), Some(1));
        assert_eq!(output.holders(), Some(1));

        input.release(&process, &mut ctx);
        output.release(&process, &mut ctx);
        assert!(!process.ignored_errors());
    }
}
