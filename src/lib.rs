//! Native runtime substrate for compiled programs.
//!
//! Generated code links against this crate for everything it cannot express
//! itself: the universal tagged [`Value`], shared string buffers, error
//! records, the pipeline queues workers communicate through, worker threads
//! with their per-thread random generators, and the recursive filesystem
//! copy engine.
//!
//! An embedding creates one [`Process`] with its [`OwnershipHooks`], runs
//! generated code against it, and hands the final value to
//! [`Process::finish`] for the shutdown sequence.

pub mod error;
pub mod fs_copy;
pub mod pipeline;
pub mod process;
pub mod text;
pub mod value;
pub mod worker;

pub use error::{ErrorObj, NO_ERROR, SILENT_FAIL};
pub use pipeline::{Pipeline, PipelineRef};
pub use process::{Process, fatal};
pub use text::StrBuf;
pub use value::{ErrorRef, Kind, NoopHooks, OwnershipHooks, StrRef, Value};
pub use worker::{WorkerContext, WorkerFn};
