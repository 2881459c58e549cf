//! Reference-counted error records carried by error-kind values.
//!
//! An error owns three things: a numeric id, an arbitrary payload value and a
//! managed string message. The record structure itself is managed here; the
//! payload it merely carries is released through the ownership hooks when the
//! record goes away (see [`crate::process::Process::release_error`]).

use std::sync::Arc;

use crate::process::Process;
use crate::text::{self, StrBuf};
use crate::value::{ErrorRef, StrRef, Value};
use crate::worker::WorkerContext;

/// Reserved id treated as success; its message is never printed.
pub const NO_ERROR: u64 = 2;

/// Reserved id treated as failure whose message is suppressed.
pub const SILENT_FAIL: u64 = 3;

#[derive(Clone, Debug)]
pub struct ErrorObj {
    id: u64,
    data: Value,
    message: StrRef,
}

impl ErrorObj {
    pub fn create(id: u64, data: Value, message: StrRef) -> Value {
        Value::Error(Arc::new(Self { id, data, message }))
    }

    /// Builds an error from a host-side message string.
    pub fn with_message(id: u64, data: Value, message: &str) -> Value {
        let message = if message.is_empty() {
            text::empty()
        } else {
            Arc::new(StrBuf::from_str(message))
        };
        Self::create(id, data, message)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn message(&self) -> &StrBuf {
        &self.message
    }

    /// The message as a string value sharing this record's buffer.
    pub fn message_value(&self) -> Value {
        Value::Str(Arc::clone(&self.message))
    }

    pub(crate) fn payload(&self) -> &Value {
        &self.data
    }

    /// Returns a duplicate reference to the payload. The duplication is
    /// reported through `retain` so the host's collection scheme stays
    /// balanced.
    pub fn data(&self, process: &Process, ctx: &mut WorkerContext, flag: bool) -> Value {
        let copy = self.data.clone();
        process.hooks().retain(&copy, ctx, flag);
        copy
    }

    /// Appends text to the message, copy-on-write when the buffer is shared.
    pub fn append_message(this: &mut ErrorRef, suffix: &StrBuf) {
        if suffix.is_empty() {
            return;
        }
        let record = Arc::make_mut(this);
        text::append(&mut record.message, suffix);
    }
}
