//! The tagged runtime value and the externally supplied ownership hooks.
//!
//! `Value` is the universal datum generated code passes across every runtime
//! boundary: pipeline slots, worker results, error payloads and the copy
//! engine's solver protocol all speak `Value`. Scalar kinds travel by value;
//! string and error kinds carry a shared handle to their heap record, and the
//! *logical* ownership of those records belongs to whatever collection scheme
//! the compiler emits, signalled through the [`OwnershipHooks`] registered at
//! startup.

use std::sync::Arc;

use crate::error::ErrorObj;
use crate::text::StrBuf;
use crate::worker::WorkerContext;

pub type StrRef = Arc<StrBuf>;
pub type ErrorRef = Arc<ErrorObj>;

/// Kind tags, numbered the way generated code was built against them.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Nothing = 0,
    Error = 1,
    Bool = 2,
    Int = 3,
    Str = 4,
}

/// The universal runtime datum.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nothing,
    Error(ErrorRef),
    Bool(bool),
    Int(i64),
    Str(StrRef),
}

impl Value {
    pub fn str(text: &str) -> Self {
        crate::text::str_value(text)
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Nothing => Kind::Nothing,
            Value::Error(_) => Kind::Error,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Str(_) => Kind::Str,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&StrRef> {
        match self {
            Value::Str(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorRef> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// Retain/release callbacks supplied by the code generator, registered once
/// on the process context before any other runtime call.
///
/// `retain` is invoked whenever the runtime creates a duplicate logical
/// reference to a heap-backed value, `release` whenever it relinquishes one.
/// Both must be safe to call for every kind (no-op for scalars is fine), may
/// run on any worker thread, and must therefore be reentrant. The trailing
/// bool is threaded through from the call site unchanged; the runtime assigns
/// it no meaning of its own.
pub trait OwnershipHooks: Send + Sync {
    fn retain(&self, value: &Value, ctx: &mut WorkerContext, flag: bool);
    fn release(&self, value: &Value, ctx: &mut WorkerContext, flag: bool);
}

impl<H: OwnershipHooks + ?Sized> OwnershipHooks for Arc<H> {
    fn retain(&self, value: &Value, ctx: &mut WorkerContext, flag: bool) {
        (**self).retain(value, ctx, flag);
    }

    fn release(&self, value: &Value, ctx: &mut WorkerContext, flag: bool) {
        (**self).release(value, ctx, flag);
    }
}

/// Hooks for hosts whose collection scheme needs no external signals.
pub struct NoopHooks;

impl OwnershipHooks for NoopHooks {
    fn retain(&self, _value: &Value, _ctx: &mut WorkerContext, _flag: bool) {}
    fn release(&self, _value: &Value, _ctx: &mut WorkerContext, _flag: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_numbering_is_stable() {
        assert_eq!(Value::Nothing.kind() as u32, 0);
        assert_eq!(Value::str("x").kind() as u32, 4);
        assert_eq!(Value::Int(-3).kind(), Kind::Int);
        assert_eq!(Value::Bool(true).kind(), Kind::Bool);
    }

    #[test]
    fn default_is_nothing() {
        assert!(Value::default().is_nothing());
    }

    #[test]
    fn scalar_accessors() {
        assert_eq!(Value::Int(41).as_int(), Some(41));
        assert_eq!(Value::Bool(false).as_bool(), Some(false));
        assert!(Value::Int(41).as_bool().is_none());
        assert_eq!(Value::str("hi").as_str().unwrap().len(), 2);
    }
}
