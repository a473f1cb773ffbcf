//! End-to-end scenarios through the public builder interface, checked
//! against the recording assembler's operation stream.

use bumpalo::Bump;

use cinder::asm::{AsmOperand, BinaryOperation, Operation, UnaryOperation};
use cinder::test_utils::{
    constant_value, register_low, EmittedOp, RecordingAssembler, TestArchitecture, TestClient,
    OP_SIZE, RETURN_LOW, STACK_REGISTER,
};
use cinder::Compiler;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_return_constant_emits_move_pop_return() {
    init_logging();
    let arena = Bump::new();
    let arch = TestArchitecture::new();
    let client = TestClient::new();
    let asm = RecordingAssembler::new();
    let log = asm.log();
    let mut c = Compiler::new(&arena, &arch, asm, &client);
    c.init(1, 0, 0, 1);

    c.start_logical_ip(0);
    let value = c.constant(7);
    c.return_(8, value);
    let size = c.compile();
    assert_eq!(c.pool_size(), 0);

    let ops = log.borrow();
    assert_eq!(size, ops.len() as u32 * OP_SIZE);
    assert!(matches!(ops[0], EmittedOp::AllocateFrame(1)));
    match &ops[1] {
        EmittedOp::Binary {
            op: BinaryOperation::Move,
            src,
            dst,
            ..
        } => {
            assert_eq!(constant_value(src), Some(7));
            assert_eq!(register_low(dst), Some(RETURN_LOW));
        }
        other => panic!("unexpected operation {:?}", other),
    }
    assert!(matches!(ops[2], EmittedOp::PopFrame));
    assert!(matches!(ops[3], EmittedOp::Nullary(Operation::Return)));
}

#[test]
fn test_constant_pool_layout() {
    init_logging();
    let arena = Bump::new();
    let arch = TestArchitecture::new();
    let client = TestClient::new();
    let asm = RecordingAssembler::new();
    let mut c = Compiler::new(&arena, &arch, asm, &client);
    c.init(1, 0, 0, 1);

    let seven = c.pool_append(7);
    let nine = c.pool_append_promise(cinder::Promise::Resolved(9));
    assert_eq!(c.pool_size(), 16);

    c.start_logical_ip(0);
    let value = c.constant(1);
    c.return_(8, value);
    let size = c.compile();

    let mut image = vec![0u8; (size + c.pool_size()) as usize];
    c.write_to(&mut image);

    // Code is word-aligned already: four 4-byte operations.
    assert_eq!(size, 16);
    assert_eq!(
        u64::from_le_bytes(image[16..24].try_into().unwrap()),
        7
    );
    assert_eq!(
        u64::from_le_bytes(image[24..32].try_into().unwrap()),
        9
    );

    // Pool promises resolve to the entries' absolute addresses.
    assert_eq!(seven.value(), image.as_ptr() as i64 + 16);
    assert_eq!(nine.value(), image.as_ptr() as i64 + 24);
}

#[test]
fn test_machine_ip_resolves_to_block_start() {
    init_logging();
    let arena = Bump::new();
    let arch = TestArchitecture::new();
    let client = TestClient::new();
    let asm = RecordingAssembler::new();
    let mut c = Compiler::new(&arena, &arch, asm, &client);
    c.init(2, 0, 0, 1);

    c.start_logical_ip(0);
    let one = c.constant(1);
    let widened = c.load4_to_8(one);

    c.start_logical_ip(1);
    c.return_(8, widened);

    let second = c.machine_ip(1);
    let size = c.compile();
    let mut image = vec![0u8; size as usize];
    c.write_to(&mut image);

    // ip 1 starts after the frame allocation and the widening move.
    assert_eq!(second.value(), image.as_ptr() as i64 + 2 * OP_SIZE as i64);
}

#[test]
fn test_stack_call_places_arguments_in_callee_slots() {
    init_logging();
    let arena = Bump::new();
    let arch = TestArchitecture::new();
    let client = TestClient::new();
    let asm = RecordingAssembler::new();
    let log = asm.log();
    let mut c = Compiler::new(&arena, &arch, asm, &client);
    c.init(1, 0, 0, 4);

    c.start_logical_ip(0);
    let first = c.constant(11);
    let second = c.constant(12);
    c.push_value(8, first);
    c.push_value(8, second);
    let callee = c.constant(0x5000);
    let result = c.stack_call(callee, 0, None, 8, 2);
    c.popped();
    c.popped();
    c.return_(8, result);
    c.compile();

    let ops = log.borrow();
    let mut slots = Vec::new();
    for op in ops.iter() {
        if let EmittedOp::Binary {
            op: BinaryOperation::Move,
            src,
            dst: AsmOperand::Memory(memory),
            ..
        } = op
        {
            assert_eq!(memory.base, STACK_REGISTER);
            slots.push((constant_value(src), memory.offset));
        }
    }
    slots.sort_unstable();

    // The top of the stack becomes argument slot 0, one word above the
    // frame footer; the next entry lands one word higher.
    assert_eq!(slots, vec![(Some(11), 16), (Some(12), 8)]);
    assert!(ops
        .iter()
        .any(|op| matches!(op, EmittedOp::Unary { op: UnaryOperation::Call, .. })));
}

#[test]
fn test_memory_operand_folds_constant_index() {
    init_logging();
    let arena = Bump::new();
    let arch = TestArchitecture::new();
    let client = TestClient::new();
    let asm = RecordingAssembler::new();
    let log = asm.log();
    let mut c = Compiler::new(&arena, &arch, asm, &client);
    c.init(1, 0, 0, 2);

    c.start_logical_ip(0);
    let address = c.constant(0x2000);
    let base = c.load(8, address);
    let index = c.constant(2);
    let slot = c.memory(base, 8, Some(index), 4);
    let stored = c.constant(77);
    c.store(8, stored, slot);
    let zero = c.constant(0);
    c.return_(8, zero);
    c.compile();

    let ops = log.borrow();
    let store = ops.iter().find_map(|op| match op {
        EmittedOp::Binary {
            op: BinaryOperation::Move,
            src,
            dst: AsmOperand::Memory(memory),
            ..
        } => constant_value(src).map(|value| (value, *memory)),
        _ => None,
    });
    let (value, memory) = store.expect("no store to the computed address");
    assert_eq!(value, 77);
    assert_eq!(memory.offset, 8 + 2 * 4);
    assert!(memory.index.is_none());
    assert_eq!(memory.scale, 1);
}
