//! The builder façade.
//!
//! A front-end drives compilation in two passes. During the scan pass it
//! calls the operations below; each appends one event to the current
//! logical instruction and updates the per-procedure stack and locals.
//! `compile` then walks the event graph, chooses a concrete site for every
//! read, reconciles layouts across control-flow edges, and drives the
//! assembler; `write_to` materialises the code image and constant pool.

use std::cell::Cell;

use bumpalo::Bump;

use crate::asm::{
    Architecture, Assembler, BinaryOperation, Client, TernaryOperation, TraceHandler,
    UnaryOperation,
};
use crate::core::compile;
use crate::core::context::{CompileStats, Context, ForkId, LogicalInstruction};
use crate::core::event::{
    append_bounds_check, append_branch, append_combine, append_compare, append_frame_site,
    append_call, append_memory, append_move, append_return, append_translate, maybe_buddy,
    pop_value, push_value, LinkData,
};
use crate::core::frame::{frame_index, push_stack, words, LocalSlot, StackNode};
use crate::core::junction;
use crate::core::site::{address_site, constant_site, frame_site, register_site};
use crate::core::value::{new_value, Value};
use crate::promise::Promise;

/// Opaque fork snapshot returned by [`Compiler::save_state`].
#[derive(Clone, Copy)]
pub struct State(ForkId);

/// Opaque handle to one operand-stack entry.
#[derive(Clone, Copy)]
pub struct StackElement<'a>(&'a StackNode<'a>);

/// The back-end code generator for one procedure.
pub struct Compiler<'a, A: Assembler> {
    pub(crate) ctx: Context<'a, A>,
}

impl<'a, A: Assembler> Compiler<'a, A> {
    pub fn new(
        arena: &'a Bump,
        arch: &'a dyn Architecture,
        assembler: A,
        client: &'a dyn Client,
    ) -> Self {
        assert!(arch.register_count() <= 32, "too many registers");
        Self {
            ctx: Context::new(arena, arch, assembler, client),
        }
    }

    /// Sizes the per-procedure tables. Must be called before any other
    /// operation.
    pub fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        self.ctx.init(
            logical_code_length,
            parameter_footprint,
            local_footprint,
            aligned_frame_size,
        );
    }

    /// Snapshots the scan state ahead of a fork.
    pub fn save_state(&mut self) -> State {
        State(junction::save_state(&mut self.ctx))
    }

    /// Reinstates a fork snapshot so another branch can be scanned.
    pub fn restore_state(&mut self, state: State) {
        junction::restore_state(&mut self.ctx, state.0);
    }

    /// Records a control-flow edge from the current tail to an already
    /// scanned logical instruction, installing stub reads for every live
    /// frame value.
    pub fn visit_logical_ip(&mut self, logical_ip: u32) {
        let c = &mut self.ctx;
        assert!((logical_ip as usize) < c.logical_code.len());

        let e = c
            .instruction(logical_ip)
            .first_event
            .expect("visited instruction has no events");

        if let Some(p) = c.predecessor {
            c.event_mut(p).stack_after = c.stack;
            c.event_mut(p).locals_after = Some(c.locals);

            let link = c.alloc_link(LinkData {
                predecessor: p,
                next_predecessor: c.event(e).predecessors,
                successor: e,
                next_successor: c.event(p).successors,
                fork_state: c.fork_state,
                junction_state: None,
            });
            c.event_mut(e).predecessors = Some(link);
            c.event_mut(p).successors = Some(link);

            let tail = c.last_event.expect("visit with no events");
            c.event_mut(tail).visit_links.push(link);

            log::debug!("populate junction reads into {}", logical_ip);
            junction::populate_junction_reads(c, link);
        }

        c.fork_state = None;
    }

    /// Opens a new logical instruction at `logical_ip`.
    pub fn start_logical_ip(&mut self, logical_ip: u32) {
        let c = &mut self.ctx;
        assert!((logical_ip as usize) < c.logical_code.len());
        assert!(
            c.logical_code[logical_ip as usize].is_none(),
            "logical instruction started twice"
        );

        if let Some(current) = c.logical_ip {
            if c.instruction(current).last_event.is_none() {
                crate::core::event::append_dummy(c);
            }
        }

        if let Some(p) = c.predecessor {
            c.event_mut(p).stack_after = c.stack;
            c.event_mut(p).locals_after = Some(c.locals);
        }

        c.logical_code[logical_ip as usize] = Some(LogicalInstruction {
            index: logical_ip,
            first_event: None,
            last_event: None,
            stack: c.stack,
            locals: c.locals,
            machine_offset: None,
        });
        c.logical_ip = Some(logical_ip);
    }

    /// The machine address of a logical-instruction boundary.
    pub fn machine_ip(&mut self, logical_ip: u32) -> Promise {
        let c = &self.ctx;
        Promise::Ip {
            layout: c.layout.clone(),
            slot: c.ip_slots[logical_ip as usize].clone(),
        }
    }

    /// Appends a resolved constant to the constant pool; the promise
    /// yields the entry's final address.
    pub fn pool_append(&mut self, value: i64) -> Promise {
        self.pool_append_promise(Promise::Resolved(value))
    }

    pub fn pool_append_promise(&mut self, value: Promise) -> Promise {
        let c = &mut self.ctx;
        let key = c.constants.len() as u32;
        c.constants.push(value);
        Promise::Pool {
            layout: c.layout.clone(),
            key,
        }
    }

    pub fn constant(&mut self, value: i64) -> Value {
        self.promise_constant(Promise::Resolved(value))
    }

    pub fn promise_constant(&mut self, value: Promise) -> Value {
        let site = constant_site(&mut self.ctx, value);
        new_value(&mut self.ctx, Some(site), None)
    }

    pub fn address(&mut self, address: Promise) -> Value {
        let site = address_site(&mut self.ctx, address);
        new_value(&mut self.ctx, Some(site), None)
    }

    /// A value living at `base + displacement + index * scale`.
    pub fn memory(
        &mut self,
        base: Value,
        displacement: i32,
        index: Option<Value>,
        scale: u32,
    ) -> Value {
        let result = new_value(&mut self.ctx, None, None);
        append_memory(&mut self.ctx, base, displacement, index, scale, result);
        result
    }

    pub fn stack(&mut self) -> Value {
        let number = self.ctx.arch.stack();
        let site = register_site(&mut self.ctx, number, None);
        new_value(&mut self.ctx, Some(site), Some(site))
    }

    pub fn thread(&mut self) -> Value {
        let number = self.ctx.arch.thread();
        let site = register_site(&mut self.ctx, number, None);
        new_value(&mut self.ctx, Some(site), Some(site))
    }

    /// The frame slot holding the top of the operand stack.
    pub fn stack_top(&mut self) -> Value {
        let c = &mut self.ctx;
        let node = c.stack.expect("stack_top on an empty stack");
        let fi = frame_index(c, node.index + c.local_footprint, node.size_in_words);
        let site = frame_site(c, fi);
        new_value(c, Some(site), Some(site))
    }

    /// Pushes a fresh anonymous value.
    pub fn push(&mut self, size_in_bytes: u32) {
        let c = &mut self.ctx;
        let size_in_words = words(size_in_bytes, c.arch.word_size());
        debug_assert!(size_in_words > 0);
        let v = new_value(c, None, None);
        c.stack = Some(push_stack(c.arena, v, size_in_words, c.stack));
    }

    /// Pushes a value, splitting off a buddy when it already backs a
    /// local.
    pub fn push_value(&mut self, size_in_bytes: u32, value: Value) {
        let v = maybe_buddy(&mut self.ctx, value, size_in_bytes);
        push_value(&mut self.ctx, size_in_bytes, v);
    }

    pub fn pop(&mut self, size_in_bytes: u32) -> Value {
        pop_value(&mut self.ctx, size_in_bytes)
    }

    /// Notes that the runtime pushed one word onto the stack out of band.
    pub fn pushed(&mut self) {
        let c = &mut self.ctx;
        let word = c.arch.word_size();
        let v = new_value(c, None, None);
        let index = c.stack.map(|s| s.index).unwrap_or(0) + c.local_footprint;
        let fi = frame_index(c, index, 1);
        append_frame_site(c, v, word, fi);
        c.stack = Some(push_stack(c.arena, v, 1, c.stack));
    }

    /// Notes that the runtime popped the top entry out of band.
    pub fn popped(&mut self) {
        let c = &mut self.ctx;
        c.stack = c.stack.expect("popped on an empty stack").next;
    }

    pub fn top(&self) -> StackElement<'a> {
        StackElement(self.ctx.stack.expect("top of an empty stack"))
    }

    pub fn size(&self, element: StackElement<'a>) -> u32 {
        element.0.size_in_words
    }

    pub fn padding(&self, element: StackElement<'a>) -> u32 {
        element.0.padding_in_words.get()
    }

    /// The value `index` words below the top of the stack.
    pub fn peek(&self, size_in_bytes: u32, index: u32) -> Value {
        let c = &self.ctx;
        let mut node = c.stack.expect("peek on an empty stack");
        let mut i = index as i64;
        while i > 0 {
            i -= node.size_in_words as i64;
            node = node.next.expect("peek past the bottom of the stack");
        }
        debug_assert_eq!(
            node.size_in_words,
            words(size_in_bytes, c.arch.word_size())
        );
        node.value
    }

    /// Calls `address` with explicit `(size, value)` argument pairs.
    pub fn call(
        &mut self,
        address: Value,
        flags: u32,
        trace: Option<&'a dyn TraceHandler>,
        result_size: u32,
        arguments: &[(u32, Value)],
    ) -> Value {
        let c = &mut self.ctx;
        let old_stack = c.stack;
        for &(size, value) in arguments.iter().rev() {
            push_value(c, size, value);
        }
        let argument_stack = c.stack;
        c.stack = old_stack;

        let result = new_value(c, None, None);
        append_call(
            c,
            address,
            flags,
            trace,
            result,
            result_size,
            argument_stack,
            arguments.len() as u32,
            0,
        );
        result
    }

    /// Calls `address` taking the top `argument_footprint` words of the
    /// operand stack as arguments.
    pub fn stack_call(
        &mut self,
        address: Value,
        flags: u32,
        trace: Option<&'a dyn TraceHandler>,
        result_size: u32,
        argument_footprint: u32,
    ) -> Value {
        let c = &mut self.ctx;
        let result = new_value(c, None, None);
        let stack = c.stack;
        append_call(
            c,
            address,
            flags,
            trace,
            result,
            result_size,
            stack,
            0,
            argument_footprint,
        );
        result
    }

    pub fn return_(&mut self, size: u32, value: Value) {
        append_return(&mut self.ctx, size, Some(value));
    }

    /// Binds local slot `index` to a fresh value homed at its frame slot.
    pub fn init_local(&mut self, size_in_bytes: u32, index: u32) {
        let c = &mut self.ctx;
        assert!(index < c.local_footprint);

        let v = new_value(c, None, None);
        let fi = frame_index(c, index, words(size_in_bytes, c.arch.word_size()));
        log::trace!("init local {:?} of size {} at {}", v, size_in_bytes, index);
        append_frame_site(c, v, size_in_bytes, fi);

        c.locals[index as usize].set(LocalSlot {
            value: Some(v),
            size_in_bytes,
        });
    }

    /// Rebinds every local to match the locals layout at the entry of
    /// `logical_ip`.
    pub fn init_locals_from_logical_ip(&mut self, logical_ip: u32) {
        let c = &mut self.ctx;
        assert!((logical_ip as usize) < c.logical_code.len());

        let footprint = c.local_footprint as usize;
        c.locals = c
            .arena
            .alloc_slice_fill_with(footprint, |_| Cell::new(LocalSlot::default()));

        let e = c
            .instruction(logical_ip)
            .first_event
            .expect("instruction has no events");
        let source = c.event(e).locals_before;
        for index in 0..footprint {
            let slot = source[index].get();
            if slot.value.is_some() {
                self.init_local(slot.size_in_bytes, index as u32);
            }
        }
    }

    /// Stores a value into local slot `index`. The locals array is cloned
    /// so earlier snapshots keep the old binding.
    pub fn store_local(&mut self, size_in_bytes: u32, src: Value, index: u32) {
        let c = &mut self.ctx;
        assert!(index < c.local_footprint);

        if let Some(old) = c.locals[index as usize].get().value {
            c.value_mut(old).local = false;
        }

        let old_locals = c.locals;
        c.locals = c
            .arena
            .alloc_slice_fill_with(old_locals.len(), |i| Cell::new(old_locals[i].get()));

        let v = maybe_buddy(c, src, size_in_bytes);
        c.value_mut(v).local = true;
        c.locals[index as usize].set(LocalSlot {
            value: Some(v),
            size_in_bytes,
        });
    }

    pub fn load_local(&mut self, size_in_bytes: u32, index: u32) -> Value {
        let c = &self.ctx;
        assert!(index < c.local_footprint);
        let slot = c.locals[index as usize].get();
        let v = slot.value.expect("load of an uninitialised local");
        debug_assert_eq!(
            words(slot.size_in_bytes, c.arch.word_size()),
            words(size_in_bytes, c.arch.word_size())
        );
        v
    }

    /// Emits an array bounds check: compare against the length word at
    /// `length_offset`, branching to `handler` when out of range.
    pub fn check_bounds(&mut self, object: Value, length_offset: u32, index: Value, handler: i64) {
        append_bounds_check(&mut self.ctx, object, length_offset, index, handler);
    }

    pub fn store(&mut self, size: u32, src: Value, dst: Value) {
        append_move(&mut self.ctx, BinaryOperation::Move, size, src, size, dst);
    }

    pub fn load(&mut self, size: u32, src: Value) -> Value {
        let dst = new_value(&mut self.ctx, None, None);
        append_move(&mut self.ctx, BinaryOperation::Move, size, src, size, dst);
        dst
    }

    pub fn loadz(&mut self, size: u32, src: Value) -> Value {
        let dst = new_value(&mut self.ctx, None, None);
        append_move(&mut self.ctx, BinaryOperation::MoveZ, size, src, size, dst);
        dst
    }

    pub fn load4_to_8(&mut self, src: Value) -> Value {
        let dst = new_value(&mut self.ctx, None, None);
        append_move(&mut self.ctx, BinaryOperation::Move, 4, src, 8, dst);
        dst
    }

    pub fn lcmp(&mut self, a: Value, b: Value) -> Value {
        let result = new_value(&mut self.ctx, None, None);
        append_combine(
            &mut self.ctx,
            TernaryOperation::LongCompare,
            8,
            a,
            8,
            b,
            8,
            result,
        );
        result
    }

    pub fn cmp(&mut self, size: u32, a: Value, b: Value) {
        append_compare(&mut self.ctx, size, a, b);
    }

    pub fn jl(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfLess, address);
    }

    pub fn jg(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfGreater, address);
    }

    pub fn jle(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfLessOrEqual, address);
    }

    pub fn jge(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfGreaterOrEqual, address);
    }

    pub fn je(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfEqual, address);
    }

    pub fn jne(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfNotEqual, address);
    }

    pub fn jmp(&mut self, address: Value) {
        append_branch(&mut self.ctx, UnaryOperation::Jump, address);
    }

    pub fn add(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Add, size, a, b)
    }

    pub fn sub(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Subtract, size, a, b)
    }

    pub fn mul(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Multiply, size, a, b)
    }

    pub fn div(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Divide, size, a, b)
    }

    pub fn rem(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Remainder, size, a, b)
    }

    pub fn shl(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.shift(TernaryOperation::ShiftLeft, size, a, b)
    }

    pub fn shr(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.shift(TernaryOperation::ShiftRight, size, a, b)
    }

    pub fn ushr(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.shift(TernaryOperation::UnsignedShiftRight, size, a, b)
    }

    pub fn and_(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::And, size, a, b)
    }

    pub fn or_(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Or, size, a, b)
    }

    pub fn xor_(&mut self, size: u32, a: Value, b: Value) -> Value {
        self.combine(TernaryOperation::Xor, size, a, b)
    }

    pub fn neg(&mut self, size: u32, a: Value) -> Value {
        let result = new_value(&mut self.ctx, None, None);
        append_translate(&mut self.ctx, BinaryOperation::Negate, size, a, result);
        result
    }

    fn combine(&mut self, op: TernaryOperation, size: u32, a: Value, b: Value) -> Value {
        let result = new_value(&mut self.ctx, None, None);
        append_combine(&mut self.ctx, op, size, a, size, b, size, result);
        result
    }

    /// Shift counts are always word-sized.
    fn shift(&mut self, op: TernaryOperation, size: u32, a: Value, b: Value) -> Value {
        let word = self.ctx.arch.word_size();
        let result = new_value(&mut self.ctx, None, None);
        append_combine(&mut self.ctx, op, word, a, size, b, size, result);
        result
    }

    /// Runs the compile pass and returns the machine-code size in bytes.
    pub fn compile(&mut self) -> u32 {
        let size = compile::run(&mut self.ctx);
        self.ctx.machine_code_size = size;
        self.ctx.layout.set_code_size(size);
        size
    }

    /// Constant pool size in bytes.
    pub fn pool_size(&self) -> u32 {
        self.ctx.constants.len() as u32 * self.ctx.arch.word_size()
    }

    /// Writes the code image followed by the word-aligned constant pool
    /// into `dst`, resolving every promise against the final addresses.
    pub fn write_to(&mut self, dst: &mut [u8]) {
        let c = &mut self.ctx;
        debug_assert!(dst.len() as u32 >= c.machine_code_size);
        c.layout.set_base(dst.as_ptr() as u64);
        c.asm.write_to(dst);

        let word = c.arch.word_size() as usize;
        let mut offset = c.layout.padded_code_size() as usize;
        for constant in &c.constants {
            let bytes = constant.value().to_le_bytes();
            dst[offset..offset + word].copy_from_slice(&bytes[..word]);
            offset += word;
        }
    }

    pub fn stats(&self) -> CompileStats {
        self.ctx.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use bumpalo::Bump;

    use super::*;
    use crate::asm::{OperandKind, Operation};
    use crate::core::event::EventKind;
    use crate::core::frame::{same_locals, same_stack};
    use crate::core::read::{FrameIndex, ReadKind};
    use crate::test_utils::{
        constant_value, register_low, EmittedOp, RecordingAssembler, TestArchitecture,
        TestClient, TestTraceHandler, ARGUMENT_REGISTERS, OP_SIZE, RETURN_LOW,
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_single_constant_return() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(1, 0, 0, 1);

        c.start_logical_ip(0);
        let k = c.constant(42);
        c.return_(8, k);
        let size = c.compile();

        let ops = log.borrow();
        assert_eq!(ops.len(), 4);
        assert_eq!(size, ops.len() as u32 * OP_SIZE);
        assert!(matches!(ops[0], EmittedOp::AllocateFrame(1)));
        match &ops[1] {
            EmittedOp::Binary {
                op: BinaryOperation::Move,
                src,
                dst,
                ..
            } => {
                assert_eq!(constant_value(src), Some(42));
                assert_eq!(register_low(dst), Some(RETURN_LOW));
            }
            other => panic!("expected a move into the return register, got {:?}", other),
        }
        assert!(matches!(ops[2], EmittedOp::PopFrame));
        assert!(matches!(ops[3], EmittedOp::Nullary(Operation::Return)));
    }

    #[test]
    fn test_add_two_constants() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(1, 0, 0, 1);

        c.start_logical_ip(0);
        let three = c.constant(3);
        let four = c.constant(4);
        let sum = c.add(4, three, four);
        c.return_(4, sum);
        let _size = c.compile();

        assert_eq!(c.pool_size(), 0);
        assert_eq!(c.stats().frozen_picks, 0);

        let ops = log.borrow();
        let add = ops
            .iter()
            .position(|op| {
                matches!(
                    op,
                    EmittedOp::Ternary {
                        op: TernaryOperation::Add,
                        ..
                    }
                )
            })
            .expect("no add emitted");
        match &ops[add] {
            EmittedOp::Ternary {
                first,
                second,
                result,
                ..
            } => {
                assert_eq!(constant_value(first), Some(3));
                assert!(register_low(second).is_some());
                assert!(register_low(result).is_some());
            }
            _ => unreachable!(),
        }

        // The result lands in the return register before the frame pops.
        let moved_to_return = ops.iter().skip(add).any(|op| {
            matches!(op, EmittedOp::Binary { op: BinaryOperation::Move, dst, .. }
                if register_low(dst) == Some(RETURN_LOW))
        });
        assert!(moved_to_return);
        assert!(matches!(ops[ops.len() - 1], EmittedOp::Nullary(Operation::Return)));
    }

    #[test]
    fn test_constant_compare_folds_branch() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(3, 0, 0, 1);

        c.start_logical_ip(0);
        let one = c.constant(1);
        let two = c.constant(2);
        c.cmp(4, one, two);
        let target = c.machine_ip(2);
        let target = c.promise_constant(target);
        c.jl(target);

        c.start_logical_ip(1);
        let ten = c.constant(10);
        c.return_(4, ten);

        c.start_logical_ip(2);
        let twenty = c.constant(20);
        c.return_(4, twenty);

        let size = c.compile();
        let pool = c.pool_size();
        assert_eq!(pool, 0);

        let mut image = vec![0u8; (size + pool) as usize];
        c.write_to(&mut image);

        let ops = log.borrow();
        assert!(!ops
            .iter()
            .any(|op| matches!(op, EmittedOp::Binary { op: BinaryOperation::Compare, .. })));
        let jumps: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                EmittedOp::Unary { op, operand, .. } => Some((*op, operand.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(jumps.len(), 1);
        assert_eq!(jumps[0].0, UnaryOperation::Jump);
        assert_eq!(c.stats().constant_folded_branches, 1);

        // The jump lands on logical ip 2: allocate-frame, jump, then the
        // dead instruction's move/pop/return before it.
        let expected = image.as_ptr() as i64 + 5 * OP_SIZE as i64;
        assert_eq!(constant_value(&jumps[0].1), Some(expected));
    }

    #[test]
    fn test_condensed_addressing_reuses_second_operand() {
        init_logging();
        let arena = Bump::new();
        let mut arch = TestArchitecture::new();
        arch.condensed = true;
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(1, 0, 0, 1);

        c.start_logical_ip(0);
        let three = c.constant(3);
        let four = c.constant(4);
        let sum = c.add(8, three, four);
        c.return_(8, sum);
        c.compile();

        let ops = log.borrow();
        let add = ops
            .iter()
            .find_map(|op| match op {
                EmittedOp::Ternary {
                    op: TernaryOperation::Add,
                    second,
                    result,
                    ..
                } => Some((second.clone(), result.clone())),
                _ => None,
            })
            .expect("no add emitted");
        assert_eq!(register_low(&add.0), register_low(&add.1));
        assert!(register_low(&add.0).is_some());
    }

    #[test]
    fn test_thunk_substitution_calls_runtime_helper() {
        init_logging();
        let arena = Bump::new();
        let mut arch = TestArchitecture::new();
        arch.thunk_ops.push(TernaryOperation::Multiply);
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(1, 0, 0, 2);

        c.start_logical_ip(0);
        let three = c.constant(3);
        let four = c.constant(4);
        let product = c.mul(8, three, four);
        c.return_(8, product);
        c.compile();

        assert_eq!(
            client.thunks.borrow().as_slice(),
            &[(TernaryOperation::Multiply, 8)]
        );

        let ops = log.borrow();
        let call = ops
            .iter()
            .find_map(|op| match op {
                EmittedOp::Unary {
                    op: UnaryOperation::Call,
                    operand,
                    ..
                } => constant_value(operand),
                _ => None,
            })
            .expect("no thunk call emitted");
        assert_eq!(call, 0x7000_0001);

        // Both operands travel through the argument registers.
        let mut argument_moves: Vec<(i64, u8)> = ops
            .iter()
            .filter_map(|op| match op {
                EmittedOp::Binary {
                    op: BinaryOperation::Move,
                    src,
                    dst,
                    ..
                } => constant_value(src).zip(register_low(dst)),
                _ => None,
            })
            .collect();
        argument_moves.sort_unstable();
        assert_eq!(
            argument_moves,
            vec![(3, ARGUMENT_REGISTERS[0]), (4, ARGUMENT_REGISTERS[1])]
        );
    }

    #[test]
    fn test_call_reports_trace_point() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let trace = TestTraceHandler::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(1, 0, 0, 2);

        c.start_logical_ip(0);
        let callee = c.constant(0x5000);
        let argument = c.constant(9);
        let result = c.call(callee, 0, Some(&trace), 8, &[(8, argument)]);
        c.return_(8, result);
        let size = c.compile();

        let mut image = vec![0u8; size as usize];
        c.write_to(&mut image);

        let traces = trace.traces.borrow();
        assert_eq!(traces.len(), 1);

        let ops = log.borrow();
        let call = ops
            .iter()
            .position(|op| matches!(op, EmittedOp::Unary { op: UnaryOperation::Call, .. }))
            .expect("no call emitted");
        let return_address = image.as_ptr() as i64 + (call as i64 + 1) * OP_SIZE as i64;
        assert_eq!(traces[0].value(), return_address);
    }

    #[test]
    fn test_excess_arguments_spill_to_increasing_frame_slots() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
        c.init(1, 0, 0, 6);

        c.start_logical_ip(0);
        let callee = c.constant(0x5000);
        let a = c.constant(1);
        let b = c.constant(2);
        let d = c.constant(3);
        let e = c.constant(4);
        c.call(callee, 0, None, 0, &[(8, a), (8, b), (8, d), (8, e)]);

        let call = c.ctx.last_event.expect("no call event");
        let mut memory_slots = Vec::new();
        let mut fixed_register_reads = 0;
        let mut cursor = c.ctx.event(call).reads;
        while let Some(r) = cursor {
            if let ReadKind::Single {
                type_mask,
                frame_index,
                ..
            } = &c.ctx.read(r).kind
            {
                if *type_mask == OperandKind::Memory.mask() {
                    match frame_index {
                        FrameIndex::At(index) => memory_slots.push(*index),
                        other => panic!("memory read without a slot: {:?}", other),
                    }
                } else if *type_mask == OperandKind::Register.mask() {
                    fixed_register_reads += 1;
                }
            }
            cursor = c.ctx.read(r).event_next;
        }

        // Event reads are linked most-recent-first.
        memory_slots.reverse();
        assert_eq!(memory_slots, vec![0, 1]);
        assert_eq!(fixed_register_reads, ARGUMENT_REGISTERS.len());
    }

    #[test]
    fn test_store_local_of_live_local_splits_a_buddy() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
        c.init(1, 0, 2, 4);

        c.start_logical_ip(0);
        let seven = c.constant(7);
        c.store_local(8, seven, 0);
        let x = c.load_local(8, 0);
        c.store_local(8, x, 1);

        let last = c.ctx.last_event.expect("no events");
        match c.ctx.event(last).kind {
            EventKind::Buddy { original, buddy } => {
                assert_eq!(original, x);
                assert_ne!(buddy, x);
                assert_eq!(c.ctx.locals[1].get().value, Some(buddy));
            }
            _ => panic!("expected a buddy event"),
        }
    }

    #[test]
    fn test_save_restore_round_trip() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
        c.init(2, 0, 1, 2);

        c.start_logical_ip(0);
        let one = c.constant(1);
        let _loaded = c.load(8, one);

        let stack = c.ctx.stack;
        let locals = c.ctx.locals;
        let predecessor = c.ctx.predecessor;
        let logical_ip = c.ctx.logical_ip;

        let state = c.save_state();
        c.push(8);
        let two = c.constant(2);
        c.store_local(8, two, 0);
        let _branch_event = c.load(8, two);
        assert!(!same_locals(c.ctx.locals, locals));
        assert_ne!(c.ctx.predecessor, predecessor);

        c.restore_state(state);
        assert!(same_stack(c.ctx.stack, stack));
        assert!(same_locals(c.ctx.locals, locals));
        assert_eq!(c.ctx.predecessor, predecessor);
        assert_eq!(c.ctx.logical_ip, logical_ip);
    }

    #[test]
    fn test_merge_predecessors_share_one_junction_table() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(4, 0, 1, 2);

        c.start_logical_ip(0);
        c.init_local(8, 0);
        let a = c.load_local(8, 0);
        let five = c.constant(5);
        c.cmp(8, a, five);
        let taken = c.machine_ip(2);
        let taken = c.promise_constant(taken);
        c.jge(taken);
        let fork = c.save_state();

        // Taken branch: ip 2 stores local 0 and falls into the merge.
        c.start_logical_ip(2);
        let two = c.constant(2);
        let t = c.load(8, two);
        c.store_local(8, t, 0);
        c.start_logical_ip(3);
        let merged = c.load_local(8, 0);
        c.return_(8, merged);

        // Fall-through branch: ip 1 stores local 0 and jumps to the merge.
        c.restore_state(fork);
        c.start_logical_ip(1);
        let one = c.constant(1);
        let u = c.load(8, one);
        c.store_local(8, u, 0);
        let merge = c.machine_ip(3);
        let merge = c.promise_constant(merge);
        c.jmp(merge);
        c.visit_logical_ip(3);

        c.compile();

        let merge_event = c.ctx.instruction(3).first_event.expect("merge not compiled");
        let head = c.ctx.event(merge_event).predecessors.expect("no predecessors");
        let tail = c.ctx.link(head).next_predecessor.expect("merge has one edge");
        assert!(c.ctx.link(tail).next_predecessor.is_none());

        let p1 = c.ctx.link(head).predecessor;
        let p2 = c.ctx.link(tail).predecessor;
        let t1 = c.ctx.event(p1).junction_sites.clone().expect("no table");
        let t2 = c.ctx.event(p2).junction_sites.clone().expect("no table");
        assert!(Rc::ptr_eq(&t1, &t2));

        // Both branches park their constant in the same junction register.
        let ops = log.borrow();
        let mut ones = Vec::new();
        let mut twos = Vec::new();
        for op in ops.iter() {
            if let EmittedOp::Binary {
                op: BinaryOperation::Move,
                src,
                dst,
                ..
            } = op
            {
                if let (Some(value), Some(register)) = (constant_value(src), register_low(dst)) {
                    match value {
                        1 => ones.push(register),
                        2 => twos.push(register),
                        _ => {}
                    }
                }
            }
        }
        assert!(ones.iter().any(|r| twos.contains(r)));
    }

    #[test]
    fn test_bounds_check_emits_compare_and_handler_call() {
        init_logging();
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let asm = RecordingAssembler::new();
        let log = asm.log();
        let mut c = Compiler::new(&arena, &arch, asm, &client);
        c.init(1, 0, 0, 2);

        c.start_logical_ip(0);
        let base = c.constant(0x100);
        let object = c.load(8, base);
        let index = c.constant(3);
        c.check_bounds(object, 16, index, 0xdead);
        let zero = c.constant(0);
        c.return_(8, zero);
        c.compile();

        let ops = log.borrow();
        let compare = ops.iter().find_map(|op| match op {
            EmittedOp::Binary {
                op: BinaryOperation::Compare,
                src,
                dst,
                ..
            } => Some((src.clone(), dst.clone())),
            _ => None,
        });
        let (src, dst) = compare.expect("no length compare emitted");
        assert_eq!(constant_value(&src), Some(3));
        match dst {
            crate::asm::AsmOperand::Memory(memory) => assert_eq!(memory.offset, 16),
            other => panic!("length is not a memory operand: {:?}", other),
        }

        assert!(ops
            .iter()
            .any(|op| matches!(op, EmittedOp::Unary { op: UnaryOperation::JumpIfGreater, .. })));
        let handler = ops.iter().find_map(|op| match op {
            EmittedOp::Unary {
                op: UnaryOperation::Call,
                operand,
                ..
            } => constant_value(operand),
            _ => None,
        });
        assert_eq!(handler, Some(0xdead));
    }
}
