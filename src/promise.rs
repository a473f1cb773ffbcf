//! Deferred integer values resolved after machine-code layout.
//!
//! A [`Promise`] stands for an integer that is not known while the event
//! graph is being built: an offset inside the emitted code, the address of
//! a constant-pool entry, or the absolute address of a logical-instruction
//! boundary. Promises are immutable after construction and have a single
//! resolution point: code layout completion. Reading an unresolved promise
//! is a programmer error and aborts.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::CompileError;

/// Shared record of the final code image, filled in by `compile()` and
/// `write_to()`. Pool and code promises derive absolute addresses from it.
pub struct CodeLayout {
    machine_code: Cell<Option<u64>>,
    machine_code_size: Cell<u32>,
    word_size: u32,
}

impl CodeLayout {
    pub(crate) fn new(word_size: u32) -> Rc<Self> {
        Rc::new(Self {
            machine_code: Cell::new(None),
            machine_code_size: Cell::new(0),
            word_size,
        })
    }

    pub(crate) fn set_base(&self, base: u64) {
        self.machine_code.set(Some(base));
    }

    pub(crate) fn set_code_size(&self, size: u32) {
        self.machine_code_size.set(size);
    }

    pub(crate) fn word_size(&self) -> u32 {
        self.word_size
    }

    fn base(&self) -> Option<u64> {
        self.machine_code.get()
    }

    /// Code size rounded up to the next word boundary; the constant pool
    /// starts here.
    pub(crate) fn padded_code_size(&self) -> u32 {
        let size = self.machine_code_size.get();
        let word = self.word_size;
        (size + word - 1) & !(word - 1)
    }
}

/// An offset within the emitted code, resolved by the assembler once block
/// layout is final.
pub struct OffsetSlot {
    value: Cell<Option<i64>>,
}

impl OffsetSlot {
    pub fn unresolved() -> Rc<Self> {
        Rc::new(Self {
            value: Cell::new(None),
        })
    }

    pub fn resolved(value: i64) -> Rc<Self> {
        Rc::new(Self {
            value: Cell::new(Some(value)),
        })
    }

    pub fn resolve(&self, value: i64) {
        self.value.set(Some(value));
    }

    pub fn get(&self) -> Option<i64> {
        self.value.get()
    }
}

/// A late-bound promise: empty until the compile pass records the offset
/// it should forward to.
pub struct PromiseCell {
    inner: RefCell<Option<Promise>>,
}

impl PromiseCell {
    pub fn empty() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(None),
        })
    }

    pub fn holding(promise: Promise) -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Some(promise)),
        })
    }

    pub fn fill(&self, promise: Promise) {
        *self.inner.borrow_mut() = Some(promise);
    }

    pub fn is_filled(&self) -> bool {
        self.inner.borrow().is_some()
    }

    pub fn get(&self) -> Option<Promise> {
        self.inner.borrow().clone()
    }
}

/// A lazily resolvable integer.
#[derive(Clone)]
pub enum Promise {
    /// A literal, known from construction.
    Resolved(i64),
    /// An offset within the emitted code, owned by the assembler.
    Offset(Rc<OffsetSlot>),
    /// The absolute address of entry `key` in the post-code constant pool.
    Pool { layout: Rc<CodeLayout>, key: u32 },
    /// The absolute address of an assembler offset.
    Code {
        layout: Rc<CodeLayout>,
        offset: Rc<PromiseCell>,
    },
    /// The absolute address of a logical-instruction boundary.
    Ip {
        layout: Rc<CodeLayout>,
        slot: Rc<PromiseCell>,
    },
}

impl Promise {
    pub fn resolved(&self) -> bool {
        match self {
            Promise::Resolved(_) => true,
            Promise::Offset(slot) => slot.get().is_some(),
            Promise::Pool { layout, .. } => layout.base().is_some(),
            Promise::Code { layout, offset } | Promise::Ip { layout, slot: offset } => {
                layout.base().is_some()
                    && offset.get().map(|p| p.resolved()).unwrap_or(false)
            }
        }
    }

    /// The promised value. Aborts if called before resolution.
    pub fn value(&self) -> i64 {
        match self {
            Promise::Resolved(value) => *value,
            Promise::Offset(slot) => match slot.get() {
                Some(value) => value,
                None => panic!("{}", CompileError::Unresolved),
            },
            Promise::Pool { layout, key } => match layout.base() {
                Some(base) => {
                    base as i64
                        + layout.padded_code_size() as i64
                        + (*key as i64) * layout.word_size() as i64
                }
                None => panic!("{}", CompileError::Unresolved),
            },
            Promise::Code { layout, offset } | Promise::Ip { layout, slot: offset } => {
                let base = match layout.base() {
                    Some(base) => base,
                    None => panic!("{}", CompileError::Unresolved),
                };
                let inner = match offset.get() {
                    Some(inner) => inner,
                    None => panic!("{}", CompileError::Unresolved),
                };
                base as i64 + inner.value()
            }
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resolved() {
            write!(f, "promise {}", self.value())
        } else {
            match self {
                Promise::Resolved(_) => unreachable!(),
                Promise::Offset(_) => write!(f, "promise <offset>"),
                Promise::Pool { key, .. } => write!(f, "promise <pool {}>", key),
                Promise::Code { .. } => write!(f, "promise <code>"),
                Promise::Ip { .. } => write!(f, "promise <ip>"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_promise() {
        let p = Promise::Resolved(42);
        assert!(p.resolved());
        assert_eq!(p.value(), 42);
    }

    #[test]
    fn test_offset_promise_resolution() {
        let slot = OffsetSlot::unresolved();
        let p = Promise::Offset(slot.clone());
        assert!(!p.resolved());
        slot.resolve(16);
        assert!(p.resolved());
        assert_eq!(p.value(), 16);
    }

    #[test]
    #[should_panic(expected = "promise read before resolution")]
    fn test_unresolved_value_aborts() {
        let p = Promise::Offset(OffsetSlot::unresolved());
        p.value();
    }

    #[test]
    fn test_pool_promise_address() {
        let layout = CodeLayout::new(8);
        let p = Promise::Pool {
            layout: layout.clone(),
            key: 2,
        };
        assert!(!p.resolved());

        layout.set_code_size(13); // pads to 16
        layout.set_base(0x1000);
        assert!(p.resolved());
        assert_eq!(p.value(), 0x1000 + 16 + 2 * 8);
    }

    #[test]
    fn test_code_promise_late_binding() {
        let layout = CodeLayout::new(8);
        let cell = PromiseCell::empty();
        let p = Promise::Code {
            layout: layout.clone(),
            offset: cell.clone(),
        };
        layout.set_base(0x2000);
        assert!(!p.resolved());

        cell.fill(Promise::Resolved(24));
        assert!(p.resolved());
        assert_eq!(p.value(), 0x2000 + 24);
    }
}
