//! Test doubles for exercising the code generator without an encoder.
//!
//! `RecordingAssembler` logs every applied operation at four bytes apiece
//! instead of encoding machine code, and `TestArchitecture` is a small
//! eight-register target with two argument registers. Tests assert on the
//! recorded operation stream.

use std::cell::RefCell;
use std::rc::Rc;

use crate::asm::{
    Architecture, AsmOperand, Assembler, BinaryOperation, BinaryPlan, Block, Client,
    OperandKind, OperandMask, Operation, TernaryOperation, TernaryPlan, TraceHandler,
    UnaryOperation, ANY_REGISTER,
};
use crate::promise::{OffsetSlot, Promise};

pub const STACK_REGISTER: u8 = 6;
pub const THREAD_REGISTER: u8 = 7;
pub const RETURN_LOW: u8 = 0;
pub const RETURN_HIGH: u8 = 1;
pub const ARGUMENT_REGISTERS: [u8; 2] = [1, 2];

/// Bytes recorded per applied operation.
pub const OP_SIZE: u32 = 4;

pub struct TestArchitecture {
    pub condensed: bool,
    /// Ternary operations reported as needing a runtime thunk.
    pub thunk_ops: Vec<TernaryOperation>,
}

impl TestArchitecture {
    pub fn new() -> Self {
        Self {
            condensed: false,
            thunk_ops: Vec::new(),
        }
    }
}

impl Default for TestArchitecture {
    fn default() -> Self {
        Self::new()
    }
}

impl Architecture for TestArchitecture {
    fn register_count(&self) -> usize {
        8
    }

    fn reserved(&self, register: u8) -> bool {
        register == STACK_REGISTER || register == THREAD_REGISTER
    }

    fn word_size(&self) -> u32 {
        8
    }

    fn argument_register_count(&self) -> usize {
        ARGUMENT_REGISTERS.len()
    }

    fn argument_register(&self, index: usize) -> u8 {
        ARGUMENT_REGISTERS[index]
    }

    fn stack(&self) -> u8 {
        STACK_REGISTER
    }

    fn thread(&self) -> u8 {
        THREAD_REGISTER
    }

    fn return_low(&self) -> u8 {
        RETURN_LOW
    }

    fn return_high(&self) -> u8 {
        RETURN_HIGH
    }

    fn frame_header_size(&self) -> u32 {
        1
    }

    fn frame_footer_size(&self) -> u32 {
        1
    }

    fn condensed_addressing(&self) -> bool {
        self.condensed
    }

    fn plan_binary(&self, op: BinaryOperation, _src_size: u32, _dst_size: u32) -> BinaryPlan {
        let register = OperandKind::Register.mask();
        let memory = OperandKind::Memory.mask();
        let constant = OperandKind::Constant.mask();
        let address = OperandKind::Address.mask();

        let mask = |type_mask: u8| OperandMask {
            type_mask,
            register_mask: ANY_REGISTER,
        };

        match op {
            BinaryOperation::Move | BinaryOperation::MoveZ => BinaryPlan {
                src: mask(constant | address | register | memory),
                dst: mask(register | memory),
                thunk: false,
            },
            BinaryOperation::Compare => BinaryPlan {
                src: mask(constant | register),
                dst: mask(constant | register | memory),
                thunk: false,
            },
            BinaryOperation::Negate | BinaryOperation::Swap => BinaryPlan {
                src: mask(register),
                dst: mask(register),
                thunk: false,
            },
        }
    }

    fn plan_ternary(
        &self,
        op: TernaryOperation,
        _first_size: u32,
        _second_size: u32,
        _result_size: u32,
    ) -> TernaryPlan {
        let register = OperandKind::Register.mask();
        let memory = OperandKind::Memory.mask();
        let constant = OperandKind::Constant.mask();

        TernaryPlan {
            first: OperandMask {
                type_mask: constant | register,
                register_mask: ANY_REGISTER,
            },
            second: OperandMask {
                type_mask: register | memory,
                register_mask: ANY_REGISTER,
            },
            result: OperandMask {
                type_mask: register,
                register_mask: ANY_REGISTER,
            },
            thunk: self.thunk_ops.contains(&op),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EmittedOp {
    AllocateFrame(u32),
    PopFrame,
    Nullary(Operation),
    Unary {
        op: UnaryOperation,
        size: u32,
        operand: AsmOperand,
    },
    Binary {
        op: BinaryOperation,
        src_size: u32,
        src: AsmOperand,
        dst_size: u32,
        dst: AsmOperand,
    },
    Ternary {
        op: TernaryOperation,
        first_size: u32,
        first: AsmOperand,
        second_size: u32,
        second: AsmOperand,
        result_size: u32,
        result: AsmOperand,
    },
}

pub type OpLog = Rc<RefCell<Vec<EmittedOp>>>;

/// One recorded block; resolve places it at `start` and reports where it
/// ends. Recorded operand offsets are emission offsets, which match final
/// offsets whenever emission order equals layout order.
pub struct TestBlock {
    size: u32,
}

impl Block for TestBlock {
    fn resolve(&mut self, start: u32, _next: Option<&mut Self>) -> u32 {
        start + self.size
    }
}

/// Appends four bytes per operation and keeps the applied stream for
/// inspection.
pub struct RecordingAssembler {
    ops: OpLog,
    offset: u32,
    block_start: u32,
}

impl RecordingAssembler {
    pub fn new() -> Self {
        Self {
            ops: Rc::new(RefCell::new(Vec::new())),
            offset: 0,
            block_start: 0,
        }
    }

    /// A shared handle to the recorded stream, usable after the compiler
    /// takes ownership of the assembler.
    pub fn log(&self) -> OpLog {
        self.ops.clone()
    }

    fn record(&mut self, op: EmittedOp) {
        self.ops.borrow_mut().push(op);
        self.offset += OP_SIZE;
    }
}

impl Default for RecordingAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler for RecordingAssembler {
    type Block = TestBlock;

    fn offset(&mut self) -> Promise {
        Promise::Offset(OffsetSlot::resolved(self.offset as i64))
    }

    fn apply(&mut self, op: Operation) {
        self.record(EmittedOp::Nullary(op));
    }

    fn apply_unary(&mut self, op: UnaryOperation, size: u32, operand: &AsmOperand) {
        self.record(EmittedOp::Unary {
            op,
            size,
            operand: operand.clone(),
        });
    }

    fn apply_binary(
        &mut self,
        op: BinaryOperation,
        src_size: u32,
        src: &AsmOperand,
        dst_size: u32,
        dst: &AsmOperand,
    ) {
        self.record(EmittedOp::Binary {
            op,
            src_size,
            src: src.clone(),
            dst_size,
            dst: dst.clone(),
        });
    }

    fn apply_ternary(
        &mut self,
        op: TernaryOperation,
        first_size: u32,
        first: &AsmOperand,
        second_size: u32,
        second: &AsmOperand,
        result_size: u32,
        result: &AsmOperand,
    ) {
        self.record(EmittedOp::Ternary {
            op,
            first_size,
            first: first.clone(),
            second_size,
            second: second.clone(),
            result_size,
            result: result.clone(),
        });
    }

    fn allocate_frame(&mut self, size_in_words: u32) {
        self.record(EmittedOp::AllocateFrame(size_in_words));
    }

    fn pop_frame(&mut self) {
        self.record(EmittedOp::PopFrame);
    }

    fn end_block(&mut self, _has_next: bool) -> TestBlock {
        let size = self.offset - self.block_start;
        self.block_start = self.offset;
        TestBlock { size }
    }

    fn write_to(&mut self, dst: &mut [u8]) {
        for byte in dst.iter_mut().take(self.offset as usize) {
            *byte = 0x90;
        }
    }
}

/// Records thunk requests and hands out distinct fake helper addresses.
pub struct TestClient {
    pub thunks: RefCell<Vec<(TernaryOperation, u32)>>,
}

impl TestClient {
    pub fn new() -> Self {
        Self {
            thunks: RefCell::new(Vec::new()),
        }
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Client for TestClient {
    fn thunk(&self, op: TernaryOperation, result_size: u32) -> Promise {
        let mut thunks = self.thunks.borrow_mut();
        thunks.push((op, result_size));
        Promise::Resolved(0x7000_0000 + thunks.len() as i64)
    }
}

/// Collects the trace promises reported at call sites.
pub struct TestTraceHandler {
    pub traces: RefCell<Vec<Promise>>,
}

impl TestTraceHandler {
    pub fn new() -> Self {
        Self {
            traces: RefCell::new(Vec::new()),
        }
    }
}

impl Default for TestTraceHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceHandler for TestTraceHandler {
    fn handle_trace(&self, return_address: Promise) {
        self.traces.borrow_mut().push(return_address);
    }
}

/// The resolved value of a constant operand, if it is one.
pub fn constant_value(operand: &AsmOperand) -> Option<i64> {
    match operand {
        AsmOperand::Constant(promise) if promise.resolved() => Some(promise.value()),
        _ => None,
    }
}

/// The low physical register of a register operand, if it is one.
pub fn register_low(operand: &AsmOperand) -> Option<u8> {
    match operand {
        AsmOperand::Register(pair) => Some(pair.low),
        _ => None,
    }
}
