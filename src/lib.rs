//! Cinder - a read-driven JIT back-end code generator.
//!
//! Cinder is the back end of a just-in-time compiler: it ingests a stream
//! of architecture-neutral operations describing one procedure, chooses
//! where every value lives (register, frame slot, constant pool or
//! immediate), linearises control flow into machine blocks, and emits
//! code by driving a lower-level assembler. Instruction encoding, the
//! dispatch loop, and language front-ends are external collaborators.
//!
//! # Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use cinder::Compiler;
//!
//! let arena = Bump::new();
//! let mut c = Compiler::new(&arena, &arch, assembler, &client);
//! c.init(logical_code_length, parameters, locals, aligned_frame_size);
//!
//! c.start_logical_ip(0);
//! let three = c.constant(3);
//! let four = c.constant(4);
//! let sum = c.add(4, three, four);
//! c.return_(4, sum);
//!
//! let code_size = c.compile();
//! let mut image = vec![0u8; code_size as usize + c.pool_size() as usize];
//! c.write_to(&mut image);
//! ```
//!
//! # Architecture
//!
//! - [`compiler`] - the builder façade driven by front-ends
//! - [`core`] - event graph, value/site tracking, allocation, driver
//! - [`asm`] - the contract consumed from the assembler layer
//! - [`promise`] - deferred integers resolved after layout

pub mod asm;
pub mod error;
pub mod promise;
pub mod test_utils;

mod compiler;
mod core;

pub use crate::compiler::{Compiler, StackElement, State};
pub use crate::core::context::CompileStats;
pub use crate::core::value::Value;
pub use crate::error::{CompileError, CompileResult};
pub use crate::promise::{CodeLayout, OffsetSlot, Promise, PromiseCell};
