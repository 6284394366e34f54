// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Per-call context slots: typed scratch space for subsystems riding the
//! call (security, tracing, stats). Values are dropped at call teardown.

// Standard library imports
use std::any::Any;
use std::sync::Arc;

// Third-party crates
use parking_lot::Mutex;

/// The subsystems that may attach context to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ContextKind {
    Security = 0,
    Tracing = 1,
    Stats = 2,
}

impl ContextKind {
    pub const COUNT: usize = 3;
}

/// A context value; `Drop` is the destructor.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub(crate) struct ContextSlots {
    slots: Mutex<[Option<ContextValue>; ContextKind::COUNT]>,
}

impl ContextSlots {
    pub(crate) fn new() -> Self {
        ContextSlots::default()
    }

    /// Install a value, dropping any previous one for the same kind.
    pub(crate) fn set(&self, kind: ContextKind, value: ContextValue) {
        self.slots.lock()[kind as usize] = Some(value);
    }

    pub(crate) fn get(&self, kind: ContextKind) -> Option<ContextValue> {
        self.slots.lock()[kind as usize].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_replace() {
        let slots = ContextSlots::new();
        assert!(slots.get(ContextKind::Tracing).is_none());

        slots.set(ContextKind::Tracing, Arc::new("trace-a".to_string()));
        let v = slots.get(ContextKind::Tracing).unwrap();
        assert_eq!(v.downcast_ref::<String>().unwrap(), "trace-a");

        slots.set(ContextKind::Tracing, Arc::new("trace-b".to_string()));
        let v = slots.get(ContextKind::Tracing).unwrap();
        assert_eq!(v.downcast_ref::<String>().unwrap(), "trace-b");
        assert!(slots.get(ContextKind::Stats).is_none());
    }

    #[test]
    fn test_drop_on_replace() {
        let slots = ContextSlots::new();
        let value: ContextValue = Arc::new(42u32);
        let weak = Arc::downgrade(&value);
        slots.set(ContextKind::Security, value);
        slots.set(ContextKind::Security, Arc::new(43u32));
        assert!(weak.upgrade().is_none());
    }
}
