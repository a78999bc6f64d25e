//! Slot module: symbolic slot and frame identifiers and the accessors that
//! expose slot values to compiled code.

use crate::types::{copy_value, Value};
use parking_lot::RwLock;

/// Identifier of a slot, resolved at compile time to an accessor.
pub type SlotId = u64;
/// Identifier of a local-bind frame.
pub type FrameId = u64;

macro_rules! id_generators {
    ($( $(#[$meta:meta])* $name:ident => $id:ty ),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default)]
            pub struct $name {
                next: $id,
            }

            impl $name {
                pub fn new() -> Self {
                    Self::default()
                }

                /// Generator whose first id is `first`.
                pub fn starting_at(first: $id) -> Self {
                    Self { next: first }
                }

                pub fn generate(&mut self) -> $id {
                    let id = self.next;
                    self.next += 1;
                    id
                }
            }
        )*
    };
}

id_generators! {
    /// Hands out unique [`SlotId`]s.
    SlotIdGenerator => SlotId,
    /// Hands out unique [`FrameId`]s.
    FrameIdGenerator => FrameId,
}

/// Read access to the value bound to a slot.
///
/// Row sources implement this for their field values; the VM reads through
/// it and never mutates the underlying storage except via
/// [`copy_or_move_value`](SlotAccessor::copy_or_move_value).
pub trait SlotAccessor: Send + Sync {
    /// A non-owning view of the current value.
    fn get_view_of_value(&self) -> Value;

    /// An owned value: moved out if the accessor owns it, copied otherwise.
    /// Always returns `true` as the ownership flag of the result.
    fn copy_or_move_value(&self) -> (bool, Value);
}

/// Accessor holding its own value together with an ownership flag.
#[derive(Debug, Default)]
pub struct OwnedValueAccessor {
    slot: RwLock<(bool, Value)>,
}

impl OwnedValueAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(owned: bool, value: Value) -> Self {
        Self { slot: RwLock::new((owned, value)) }
    }

    /// Replaces the held value, releasing the previous one if it was owned.
    pub fn reset(&self, owned: bool, value: Value) {
        *self.slot.write() = (owned, value);
    }

    pub fn is_owned(&self) -> bool {
        self.slot.read().0
    }
}

impl SlotAccessor for OwnedValueAccessor {
    fn get_view_of_value(&self) -> Value {
        self.slot.read().1.clone()
    }

    fn copy_or_move_value(&self) -> (bool, Value) {
        let mut slot = self.slot.write();
        if slot.0 {
            // Ownership leaves the slot; it holds Nothing until the next reset.
            slot.0 = false;
            (true, std::mem::take(&mut slot.1))
        } else {
            (true, copy_value(&slot.1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_generators_are_monotonic() {
        let mut slots = SlotIdGenerator::new();
        assert_eq!(slots.generate(), 0);
        assert_eq!(slots.generate(), 1);
        let mut frames = FrameIdGenerator::starting_at(100);
        assert_eq!(frames.generate(), 100);
        assert_eq!(frames.generate(), 101);
    }

    #[test]
    fn test_owned_accessor_moves_once() {
        let value = Value::string("a long string held by the slot");
        let acc = OwnedValueAccessor::with_value(true, value.clone());
        let (owned, moved) = acc.copy_or_move_value();
        assert!(owned);
        assert_eq!(moved, value);
        assert!(!acc.is_owned());
        assert!(acc.get_view_of_value().is_nothing());
        // Nothing is left behind to move a second time.
        let (owned, again) = acc.copy_or_move_value();
        assert!(owned);
        assert!(again.is_nothing());
    }

    #[test]
    fn test_move_hands_over_storage() {
        let items = Arc::new(vec![Value::Int32(1)]);
        let acc = OwnedValueAccessor::with_value(true, Value::Array(items.clone()));
        let ptr = Arc::as_ptr(&items);
        drop(items);
        match acc.copy_or_move_value() {
            (true, Value::Array(moved)) => {
                assert_eq!(Arc::as_ptr(&moved), ptr);
                assert_eq!(Arc::strong_count(&moved), 1);
            }
            other => panic!("expected moved array, got {other:?}"),
        }
    }

    #[test]
    fn test_unowned_accessor_copies() {
        let acc = OwnedValueAccessor::with_value(false, Value::string("a long string held by the slot"));
        let (owned, copied) = acc.copy_or_move_value();
        assert!(owned);
        match (&acc.get_view_of_value(), &copied) {
            (Value::StringBig(a), Value::StringBig(b)) => assert!(!Arc::ptr_eq(a, b)),
            _ => panic!("expected big strings"),
        }
    }

    #[test]
    fn test_reset_replaces_value() {
        let acc = OwnedValueAccessor::new();
        assert!(acc.get_view_of_value().is_nothing());
        acc.reset(false, Value::Int32(9));
        assert_eq!(acc.get_view_of_value(), Value::Int32(9));
    }
}
