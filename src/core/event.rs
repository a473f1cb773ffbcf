//! Events: the nodes of the code-generation graph.
//!
//! The scan pass appends one event per builder operation. Each event
//! captures the stack/locals snapshot in force when it was appended,
//! carries the reads it will consume, and knows how to emit itself during
//! the compile pass. Predecessor/successor links connect events across
//! branches and merges.

use std::rc::Rc;

use crate::asm::{
    AsmOperand, Assembler, BinaryOperation, Operation, TernaryOperation, UnaryOperation,
    OperandKind, TraceHandler, CALL_ALIGNED,
};
use crate::core::context::{
    ConstantCompare, Context, EventId, ForkId, LinkId,
};
use crate::core::frame::{
    frame_index, push_stack, same_locals, same_stack, words, FrameIterator, Locals, StackRef,
};
use crate::core::junction::{JunctionReads, JunctionSites};
use crate::core::read::{
    add_read, any_register_read, fixed_register_read, memory_read, read_allocate_site,
    read_intersect, read_next, register_or_constant_read, single_read, Constraint, FrameIndex,
    ReadId,
};
use crate::core::site::{
    apply_binary, apply_nullary, apply_ternary, apply_unary, constant_site, copy_cost,
    free_register_site, frame_site, memory_site, memory_view, register_site, site_acquire,
    site_match, site_register_number, site_release, SiteId, SiteKind,
};
use crate::core::value::{
    add_site, find_constant_site, live, live_next, new_value, next_read, remove_site,
    target_or_register, target_or_register_for_read, Value,
};
use crate::promise::{Promise, PromiseCell};

/// A predecessor→successor edge.
pub(crate) struct LinkData {
    pub predecessor: EventId,
    pub next_predecessor: Option<LinkId>,
    pub successor: EventId,
    pub next_successor: Option<LinkId>,
    pub fork_state: Option<ForkId>,
    pub junction_state: Option<JunctionReads>,
}

#[derive(Clone, Copy)]
pub(crate) enum EventKind<'a> {
    Call {
        address: Value,
        flags: u32,
        trace: Option<&'a dyn TraceHandler>,
        result: Value,
        result_size: u32,
        pop_index: u32,
    },
    Return {
        size: u32,
        value: Option<Value>,
    },
    Move {
        op: BinaryOperation,
        src_size: u32,
        src: Value,
        dst_size: u32,
        dst: Value,
        dst_read: ReadId,
    },
    Compare {
        size: u32,
        first: Value,
        second: Value,
    },
    Combine {
        op: TernaryOperation,
        first_size: u32,
        first: Value,
        second_size: u32,
        second: Value,
        result_size: u32,
        result: Value,
        result_read: ReadId,
    },
    Translate {
        op: BinaryOperation,
        size: u32,
        value: Value,
        result: Value,
        result_read: ReadId,
    },
    Memory {
        base: Value,
        displacement: i32,
        index: Option<Value>,
        scale: u32,
        result: Value,
    },
    Branch {
        op: UnaryOperation,
        address: Value,
    },
    BoundsCheck {
        object: Value,
        length_offset: u32,
        index: Value,
        handler: i64,
    },
    FrameSite {
        value: Value,
        size: u32,
        index: u32,
    },
    Buddy {
        original: Value,
        buddy: Value,
    },
    Dummy,
}

pub(crate) struct EventData<'a> {
    pub kind: EventKind<'a>,
    pub next: Option<EventId>,
    pub stack_before: StackRef<'a>,
    pub locals_before: Locals<'a>,
    pub stack_after: StackRef<'a>,
    pub locals_after: Option<Locals<'a>>,
    /// Code promises resolved to this event's emission offset.
    pub promises: Vec<Rc<PromiseCell>>,
    /// Head of this event's input reads, linked through `event_next`.
    pub reads: Option<ReadId>,
    pub read_count: u32,
    pub junction_sites: Option<JunctionSites>,
    pub saved_sites: Option<Box<[Option<SiteId>]>>,
    pub predecessors: Option<LinkId>,
    pub successors: Option<LinkId>,
    /// Forward links replayed after this event emits.
    pub visit_links: Vec<LinkId>,
    pub block: Option<u32>,
    pub logical_instruction: u32,
}

pub(crate) fn event_name(kind: &EventKind<'_>) -> &'static str {
    match kind {
        EventKind::Call { .. } => "CallEvent",
        EventKind::Return { .. } => "ReturnEvent",
        EventKind::Move { .. } => "MoveEvent",
        EventKind::Compare { .. } => "CompareEvent",
        EventKind::Combine { .. } => "CombineEvent",
        EventKind::Translate { .. } => "TranslateEvent",
        EventKind::Memory { .. } => "MemoryEvent",
        EventKind::Branch { .. } => "BranchEvent",
        EventKind::BoundsCheck { .. } => "BoundsCheckEvent",
        EventKind::FrameSite { .. } => "FrameSiteEvent",
        EventKind::Buddy { .. } => "BuddyEvent",
        EventKind::Dummy => "DummyEvent",
    }
}

pub(crate) fn is_branch(kind: &EventKind<'_>) -> bool {
    matches!(kind, EventKind::Branch { .. })
}

fn new_event<'a, A: Assembler>(c: &mut Context<'a, A>, kind: EventKind<'a>) -> EventId {
    let ip = c.logical_ip.expect("event appended outside a logical instruction");
    c.alloc_event(EventData {
        kind,
        next: None,
        stack_before: c.stack,
        locals_before: c.locals,
        stack_after: None,
        locals_after: None,
        promises: Vec::new(),
        reads: None,
        read_count: 0,
        junction_sites: None,
        saved_sites: None,
        predecessors: None,
        successors: None,
        visit_links: Vec::new(),
        block: None,
        logical_instruction: ip,
    })
}

/// Appends an event to the graph: keeps the logical instruction's snapshot
/// in lock-step (inserting a dummy when the stack or locals moved), links
/// the event to the scan predecessor, and advances the scan cursor.
pub(crate) fn append<'a, A: Assembler>(c: &mut Context<'a, A>, e: EventId) {
    let ip = c.logical_ip.expect("event appended outside a logical instruction");

    let (snapshot_stack, snapshot_locals) = {
        let i = c.instruction(ip);
        (i.stack, i.locals)
    };
    if !same_stack(c.stack, snapshot_stack) || !same_locals(c.locals, snapshot_locals) {
        append_dummy(c);
    }

    log::debug!("append {} at {}", event_name(&c.event(e).kind), ip);

    match c.last_event {
        Some(last) => c.event_mut(last).next = Some(e),
        None => c.first_event = Some(e),
    }
    c.last_event = Some(e);

    if let Some(p) = c.predecessor {
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
    }
    c.fork_state = None;
    c.predecessor = Some(e);

    let i = c.instruction_mut(ip);
    if i.first_event.is_none() {
        i.first_event = Some(e);
    }
    i.last_event = Some(e);
}

/// A no-op event pinning the logical instruction's snapshot to the graph.
pub(crate) fn append_dummy<A: Assembler>(c: &mut Context<'_, A>) {
    let saved_stack = c.stack;
    let saved_locals = c.locals;

    let ip = c.logical_ip.expect("dummy appended outside a logical instruction");
    let (snapshot_stack, snapshot_locals) = {
        let i = c.instruction(ip);
        (i.stack, i.locals)
    };
    c.stack = snapshot_stack;
    c.locals = snapshot_locals;

    let e = new_event(c, EventKind::Dummy);
    append(c, e);

    c.stack = saved_stack;
    c.locals = saved_locals;
}

/// Marks a value as stack-resident and pushes it.
pub(crate) fn push_value<'a, A: Assembler>(c: &mut Context<'a, A>, size_in_bytes: u32, v: Value) {
    let size_in_words = words(size_in_bytes, c.arch.word_size());
    debug_assert!(size_in_words > 0);
    c.value_mut(v).local = true;
    c.stack = Some(push_stack(c.arena, v, size_in_words, c.stack));
}

pub(crate) fn pop_value<A: Assembler>(c: &mut Context<'_, A>, size_in_bytes: u32) -> Value {
    let node = c.stack.expect("pop from an empty stack");
    debug_assert_eq!(words(size_in_bytes, c.arch.word_size()), node.size_in_words);
    c.stack = node.next;
    c.value_mut(node.value).local = false;
    node.value
}

/// Splits a stack-resident value into a fresh buddy so the storage can be
/// shared without aliasing the handle.
pub(crate) fn maybe_buddy<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
    size_in_bytes: u32,
) -> Value {
    if c.value(v).local {
        let n = new_value(c, None, None);
        append_buddy(c, v, n, size_in_bytes);
        n
    } else {
        v
    }
}

pub(crate) fn append_move<A: Assembler>(
    c: &mut Context<'_, A>,
    op: BinaryOperation,
    src_size: u32,
    src: Value,
    dst_size: u32,
    dst: Value,
) {
    let plan = c.arch.plan_binary(op, src_size, dst_size);
    assert!(
        !plan.thunk,
        "{}",
        crate::error::CompileError::UnsupportedThunk {
            op: format!("{:?}", op)
        }
    );

    let src_read = single_read(
        c,
        src_size,
        plan.src.type_mask,
        plan.src.register_mask,
        FrameIndex::Any,
    );
    let dst_read = single_read(
        c,
        dst_size,
        plan.dst.type_mask,
        plan.dst.register_mask,
        FrameIndex::Any,
    );

    let e = new_event(
        c,
        EventKind::Move {
            op,
            src_size,
            src,
            dst_size,
            dst,
            dst_read,
        },
    );
    add_read(c, Some(e), src, src_read);
    append(c, e);
}

pub(crate) fn append_compare<A: Assembler>(
    c: &mut Context<'_, A>,
    size: u32,
    first: Value,
    second: Value,
) {
    let plan = c.arch.plan_binary(BinaryOperation::Compare, size, size);
    assert!(
        !plan.thunk,
        "{}",
        crate::error::CompileError::UnsupportedThunk {
            op: "Compare".to_string()
        }
    );

    let first_read = single_read(
        c,
        size,
        plan.src.type_mask,
        plan.src.register_mask,
        FrameIndex::Any,
    );
    let second_read = single_read(
        c,
        size,
        plan.dst.type_mask,
        plan.dst.register_mask,
        FrameIndex::Any,
    );

    let e = new_event(c, EventKind::Compare { size, first, second });
    add_read(c, Some(e), first, first_read);
    add_read(c, Some(e), second, second_read);
    append(c, e);
}

pub(crate) fn append_combine<A: Assembler>(
    c: &mut Context<'_, A>,
    op: TernaryOperation,
    first_size: u32,
    first: Value,
    second_size: u32,
    second: Value,
    result_size: u32,
    result: Value,
) {
    let plan = c.arch.plan_ternary(op, first_size, second_size, result_size);

    if plan.thunk {
        // The ISA cannot express the operation; call the runtime helper
        // with both operands as ordinary call arguments.
        let old_stack = c.stack;
        push_value(c, second_size, second);
        push_value(c, first_size, first);
        let argument_stack = c.stack;
        c.stack = old_stack;

        let thunk = c.client.thunk(op, result_size);
        let thunk_site = constant_site(c, thunk);
        let address = new_value(c, Some(thunk_site), None);
        append_call(c, address, 0, None, result, result_size, argument_stack, 2, 0);
        return;
    }

    let result_read = single_read(
        c,
        result_size,
        plan.result.type_mask,
        plan.result.register_mask,
        FrameIndex::Any,
    );
    let second_read = if c.arch.condensed_addressing() {
        result_read
    } else {
        single_read(
            c,
            second_size,
            plan.second.type_mask,
            plan.second.register_mask,
            FrameIndex::Any,
        )
    };
    let first_read = single_read(
        c,
        first_size,
        plan.first.type_mask,
        plan.first.register_mask,
        FrameIndex::Any,
    );

    let e = new_event(
        c,
        EventKind::Combine {
            op,
            first_size,
            first,
            second_size,
            second,
            result_size,
            result,
            result_read,
        },
    );
    add_read(c, Some(e), first, first_read);
    add_read(c, Some(e), second, second_read);
    append(c, e);
}

pub(crate) fn append_translate<A: Assembler>(
    c: &mut Context<'_, A>,
    op: BinaryOperation,
    size: u32,
    value: Value,
    result: Value,
) {
    let plan = c.arch.plan_binary(op, size, size);
    assert!(
        !plan.thunk,
        "{}",
        crate::error::CompileError::UnsupportedThunk {
            op: format!("{:?}", op)
        }
    );

    let result_read = single_read(
        c,
        size,
        plan.dst.type_mask,
        plan.dst.register_mask,
        FrameIndex::Any,
    );
    let first_read = if c.arch.condensed_addressing() {
        result_read
    } else {
        single_read(
            c,
            size,
            plan.src.type_mask,
            plan.src.register_mask,
            FrameIndex::Any,
        )
    };

    let e = new_event(
        c,
        EventKind::Translate {
            op,
            size,
            value,
            result,
            result_read,
        },
    );
    add_read(c, Some(e), value, first_read);
    append(c, e);
}

pub(crate) fn append_memory<A: Assembler>(
    c: &mut Context<'_, A>,
    base: Value,
    displacement: i32,
    index: Option<Value>,
    scale: u32,
    result: Value,
) {
    let word = c.arch.word_size();
    let e = new_event(
        c,
        EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        },
    );
    let base_read = any_register_read(c, word);
    add_read(c, Some(e), base, base_read);
    if let Some(index) = index {
        let index_read = register_or_constant_read(c, word);
        add_read(c, Some(e), index, index_read);
    }
    append(c, e);
}

pub(crate) fn append_branch<A: Assembler>(
    c: &mut Context<'_, A>,
    op: UnaryOperation,
    address: Value,
) {
    let word = c.arch.word_size();
    let e = new_event(c, EventKind::Branch { op, address });
    let address_read = single_read(
        c,
        word,
        crate::asm::ANY_OPERAND,
        crate::asm::ANY_REGISTER,
        FrameIndex::Any,
    );
    add_read(c, Some(e), address, address_read);
    append(c, e);
}

pub(crate) fn append_bounds_check<A: Assembler>(
    c: &mut Context<'_, A>,
    object: Value,
    length_offset: u32,
    index: Value,
    handler: i64,
) {
    let word = c.arch.word_size();
    let e = new_event(
        c,
        EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        },
    );
    let object_read = any_register_read(c, word);
    add_read(c, Some(e), object, object_read);
    let index_read = register_or_constant_read(c, word);
    add_read(c, Some(e), index, index_read);
    append(c, e);
}

pub(crate) fn append_frame_site<A: Assembler>(
    c: &mut Context<'_, A>,
    value: Value,
    size: u32,
    index: u32,
) {
    let e = new_event(c, EventKind::FrameSite { value, size, index });
    append(c, e);
}

pub(crate) fn append_buddy<A: Assembler>(
    c: &mut Context<'_, A>,
    original: Value,
    buddy: Value,
    size: u32,
) {
    let e = new_event(c, EventKind::Buddy { original, buddy });
    let read = single_read(
        c,
        size,
        crate::asm::ANY_OPERAND,
        crate::asm::ANY_REGISTER,
        FrameIndex::Any,
    );
    add_read(c, Some(e), original, read);
    append(c, e);
}

/// Appends a call. Argument values receive fixed-register reads while
/// argument registers last, then memory reads at consecutive
/// stack-argument slots; every live stack and locals entry gains a
/// preservation read at a frame slot the callee's argument area cannot
/// alias.
#[allow(clippy::too_many_arguments)]
pub(crate) fn append_call<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    address: Value,
    flags: u32,
    trace: Option<&'a dyn TraceHandler>,
    result: Value,
    result_size: u32,
    argument_stack: StackRef<'a>,
    argument_count: u32,
    stack_argument_footprint: u32,
) {
    let word = c.arch.word_size();
    let e = new_event(
        c,
        EventKind::Call {
            address,
            flags,
            trace,
            result,
            result_size,
            pop_index: 0,
        },
    );

    let mut mask: u32 = !0;
    let mut node = argument_stack;
    let mut index: u32 = 0;
    let mut arg_frame_index: u32 = 0;
    for _ in 0..argument_count {
        let s = node.expect("argument stack underflow");
        let target = if (index as usize) < c.arch.argument_register_count() {
            let r = c.arch.argument_register(index as usize);
            mask &= !(1u32 << r);
            fixed_register_read(c, s.size_in_words * word, r, None)
        } else {
            let read = memory_read(c, s.size_in_words * word, arg_frame_index);
            arg_frame_index += s.size_in_words;
            read
        };
        add_read(c, Some(e), s.value, target);
        index += s.size_in_words;
        node = s.next;
    }

    let address_read = single_read(
        c,
        word,
        crate::asm::ANY_OPERAND,
        ((mask as u64) << 32) | mask as u64,
        FrameIndex::Any,
    );
    add_read(c, Some(e), address, address_read);

    let mut footprint = stack_argument_footprint as i64;
    let mut pop_index: u32 = 0;
    let mut node = c.event(e).stack_before;
    while let Some(s) = node {
        if footprint > 0 {
            let read = memory_read(c, s.size_in_words * word, arg_frame_index);
            add_read(c, Some(e), s.value, read);
        } else {
            let home = frame_index(c, s.index + c.local_footprint, s.size_in_words);
            if footprint == 0 {
                debug_assert!(home >= arg_frame_index);
                s.padding_in_words.set(home - arg_frame_index);
                pop_index = home;
            }
            let read = memory_read(c, s.size_in_words * word, home);
            add_read(c, Some(e), s.value, read);
        }
        arg_frame_index += s.size_in_words;
        footprint -= s.size_in_words as i64;
        node = s.next;
    }

    let locals_before = c.event(e).locals_before;
    for li in 0..locals_before.len() {
        let slot = locals_before[li].get();
        if let Some(v) = slot.value {
            let fi = frame_index(c, li as u32, words(slot.size_in_bytes, word));
            let read = memory_read(c, slot.size_in_bytes, fi);
            add_read(c, Some(e), v, read);
        }
    }

    if let EventKind::Call { pop_index: p, .. } = &mut c.event_mut(e).kind {
        *p = pop_index;
    }
    append(c, e);
}

pub(crate) fn append_return<A: Assembler>(c: &mut Context<'_, A>, size: u32, value: Option<Value>) {
    let word = c.arch.word_size();
    let e = new_event(c, EventKind::Return { size, value });
    if let Some(v) = value {
        let high = if size > word {
            Some(c.arch.return_high())
        } else {
            None
        };
        let read = fixed_register_read(c, size, c.arch.return_low(), high);
        add_read(c, Some(e), v, read);
    }
    append(c, e);
}

/// Spills a value's sole site to a fresh home before the site is reused.
fn preserve<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    size: u32,
    v: Value,
    s: SiteId,
    read: Option<ReadId>,
) {
    debug_assert_eq!(c.value(v).sites, Some(s));
    let read = read.expect("preserve without a pending read");
    let target = target_or_register_for_read(c, v, read);
    crate::core::site::move_value(c, stack, locals, size, v, s, target);
}

fn maybe_preserve<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    size: u32,
    v: Value,
    s: SiteId,
) {
    let sole_site = c
        .value(v)
        .sites
        .map(|h| c.site(h).next.is_none())
        .unwrap_or(false);
    if live_next(c, v) && sole_site {
        let first = c.value(v).reads.expect("live value without reads");
        let next = read_next(c, first);
        preserve(c, stack, locals, size, v, s, next);
    }
}

/// Removes sites invalidated by a call: everything except memory sites at
/// or above the call's pop index survives the callee.
fn clean_value<A: Assembler>(c: &mut Context<'_, A>, v: Value, pop_index: u32) {
    let mut prev: Option<SiteId> = None;
    let mut cursor = c.value(v).sites;
    while let Some(s) = cursor {
        let next = c.site(s).next;
        let keep = match &c.site(s).kind {
            SiteKind::Memory { .. } => {
                let view = memory_view(c, s);
                crate::core::frame::offset_to_frame_index(c, view.offset as u32) >= pop_index
            }
            _ => false,
        };
        if keep {
            prev = Some(s);
        } else {
            log::trace!("clean site {:?} from {:?}", s, v);
            match prev {
                Some(p) => c.site_mut(p).next = next,
                None => c.value_mut(v).sites = next,
            }
            site_release(c, s);
        }
        cursor = next;
    }
}

fn clean_after_call<A: Assembler>(c: &mut Context<'_, A>, e: EventId, pop_index: u32) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;

    let mut elements = Vec::new();
    let mut it = FrameIterator::new(c, stack_before, locals_before);
    while it.has_more() {
        elements.push(it.next().value);
    }
    for v in elements {
        clean_value(c, v, pop_index);
    }

    let mut cursor = c.event(e).reads;
    while let Some(r) = cursor {
        let v = c.read(r).value.expect("event read without a value");
        cursor = c.read(r).event_next;
        next_read(c, Some(e), v);
    }
}

pub(crate) fn compile_event<A: Assembler>(c: &mut Context<'_, A>, e: EventId) {
    let kind = c.event(e).kind;
    match kind {
        EventKind::Call {
            address,
            flags,
            trace,
            result,
            result_size,
            pop_index,
        } => compile_call(c, e, address, flags, trace, result, result_size, pop_index),
        EventKind::Return { size, value } => compile_return(c, e, size, value),
        EventKind::Move {
            op,
            src_size,
            src,
            dst_size,
            dst,
            dst_read,
        } => compile_move(c, e, op, src_size, src, dst_size, dst, dst_read),
        EventKind::Compare {
            size,
            first,
            second,
        } => compile_compare(c, e, size, first, second),
        EventKind::Combine {
            op,
            first_size,
            first,
            second_size,
            second,
            result_size,
            result,
            result_read,
        } => compile_combine(
            c, e, op, first_size, first, second_size, second, result_size, result, result_read,
        ),
        EventKind::Translate {
            op,
            size,
            value,
            result,
            result_read,
        } => compile_translate(c, e, op, size, value, result, result_read),
        EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        } => compile_memory(c, e, base, displacement, index, scale, result),
        EventKind::Branch { op, address } => compile_branch(c, e, op, address),
        EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        } => compile_bounds_check(c, e, object, length_offset, index, handler),
        EventKind::FrameSite { value, size, index } => {
            compile_frame_site(c, e, value, size, index)
        }
        EventKind::Buddy { original, buddy } => compile_buddy(c, e, original, buddy),
        EventKind::Dummy => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_call<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    address: Value,
    flags: u32,
    trace: Option<&dyn TraceHandler>,
    result: Value,
    result_size: u32,
    pop_index: u32,
) {
    let word = c.arch.word_size();
    let op = if flags & CALL_ALIGNED != 0 {
        UnaryOperation::AlignedCall
    } else {
        UnaryOperation::Call
    };
    let source = c.value(address).source.expect("call address without a source");
    apply_unary(c, op, word, source);

    if let Some(trace) = trace {
        let offset = c.asm.offset();
        trace.handle_trace(Promise::Code {
            layout: c.layout.clone(),
            offset: PromiseCell::holding(offset),
        });
    }

    clean_after_call(c, e, pop_index);

    if result_size > 0 && live(c, result) {
        let high = if result_size > word {
            Some(c.arch.return_high())
        } else {
            None
        };
        let site = register_site(c, c.arch.return_low(), high);
        add_site(c, None, &[], result_size, result, site);
    }
}

fn compile_return<A: Assembler>(c: &mut Context<'_, A>, e: EventId, _size: u32, value: Option<Value>) {
    if let Some(v) = value {
        next_read(c, Some(e), v);
    }
    c.asm.pop_frame();
    apply_nullary(c, Operation::Return);
}

#[allow(clippy::too_many_arguments)]
fn compile_move<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    op: BinaryOperation,
    src_size: u32,
    src: Value,
    dst_size: u32,
    dst: Value,
    dst_read: ReadId,
) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;

    let is_store = !live(c, dst);

    let mut target = target_or_register(c, dst);
    let source = c.value(src).source.expect("move without a source");
    let cost = copy_cost(c, source, Some(target));
    if cost == 0 {
        target = source;
    }

    if target == source {
        maybe_preserve(c, stack_before, locals_before, src_size, src, target);
        remove_site(c, src, target);
    }

    if !is_store {
        add_site(c, stack_before, locals_before, dst_size, dst, target);
    }

    if cost != 0 || op != BinaryOperation::Move {
        let mut con = Constraint::any();
        read_intersect(c, dst_read, &mut con);

        let memory_to_memory = matches!(c.site(target).kind, SiteKind::Memory { .. })
            && matches!(c.site(source).kind, SiteKind::Memory { .. });

        if site_match(c, target, con.type_mask, con.register_mask, con.frame_index)
            && !memory_to_memory
        {
            apply_binary(c, op, src_size, source, dst_size, target);
        } else {
            debug_assert!(con.type_mask & OperandKind::Register.mask() != 0);

            let tmp = free_register_site(c, con.register_mask);
            add_site(c, stack_before, locals_before, dst_size, dst, tmp);
            apply_binary(c, op, src_size, source, dst_size, tmp);

            if is_store {
                remove_site(c, dst, tmp);
            }
            if memory_to_memory || is_store {
                apply_binary(c, BinaryOperation::Move, dst_size, tmp, dst_size, target);
            } else {
                remove_site(c, dst, target);
            }
        }
    }

    if is_store {
        remove_site(c, dst, target);
    }

    next_read(c, Some(e), src);
}

fn compile_compare<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    size: u32,
    first: Value,
    second: Value,
) {
    let first_constant = find_constant_site(c, first);
    let second_constant = find_constant_site(c, second);

    if let (Some(a), Some(b)) = (first_constant, second_constant) {
        let a = match &c.site(a).kind {
            SiteKind::Constant { value } => value.value(),
            _ => unreachable!(),
        };
        let b = match &c.site(b).kind {
            SiteKind::Constant { value } => value.value(),
            _ => unreachable!(),
        };
        c.constant_compare = match a - b {
            d if d < 0 => ConstantCompare::Less,
            d if d > 0 => ConstantCompare::Greater,
            _ => ConstantCompare::Equal,
        };
    } else {
        c.constant_compare = ConstantCompare::None;
        let first_source = c.value(first).source.expect("compare without a source");
        let second_source = c.value(second).source.expect("compare without a source");
        apply_binary(
            c,
            BinaryOperation::Compare,
            size,
            first_source,
            size,
            second_source,
        );
    }

    next_read(c, Some(e), first);
    next_read(c, Some(e), second);
}

#[allow(clippy::too_many_arguments)]
fn compile_combine<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    op: TernaryOperation,
    first_size: u32,
    first: Value,
    second_size: u32,
    second: Value,
    result_size: u32,
    result: Value,
    result_read: ReadId,
) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;
    let condensed = c.arch.condensed_addressing();

    let target = if condensed {
        let second_source = c.value(second).source.expect("combine without a source");
        maybe_preserve(c, stack_before, locals_before, second_size, second, second_source);
        remove_site(c, second, second_source);
        second_source
    } else {
        let target = read_allocate_site(c, result_read).expect("no admissible result site");
        add_site(c, stack_before, locals_before, result_size, result, target);
        target
    };

    let first_source = c.value(first).source.expect("combine without a source");
    let second_source = c.value(second).source.expect("combine without a source");
    apply_ternary(
        c,
        op,
        first_size,
        first_source,
        second_size,
        second_source,
        result_size,
        target,
    );

    next_read(c, Some(e), first);
    next_read(c, Some(e), second);

    if condensed && live(c, result) {
        add_site(c, None, &[], result_size, result, target);
    }
}

fn compile_translate<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    op: BinaryOperation,
    size: u32,
    value: Value,
    result: Value,
    result_read: ReadId,
) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;
    let condensed = c.arch.condensed_addressing();

    let target = if condensed {
        let source = c.value(value).source.expect("translate without a source");
        maybe_preserve(c, stack_before, locals_before, size, value, source);
        remove_site(c, value, source);
        source
    } else {
        let target = read_allocate_site(c, result_read).expect("no admissible result site");
        add_site(c, stack_before, locals_before, size, result, target);
        target
    };

    let source = c.value(value).source.expect("translate without a source");
    apply_binary(c, op, size, source, size, target);

    next_read(c, Some(e), value);

    if condensed && live(c, result) {
        add_site(c, None, &[], size, result, target);
    }
}

fn compile_memory<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    base: Value,
    displacement: i32,
    index: Option<Value>,
    scale: u32,
    result: Value,
) {
    let word = c.arch.word_size();
    let mut displacement = displacement;
    let mut scale = scale;

    let index_register = match index {
        Some(index_value) => match find_constant_site(c, index_value) {
            Some(constant) => {
                let k = match &c.site(constant).kind {
                    SiteKind::Constant { value } => value.value(),
                    _ => unreachable!(),
                };
                displacement += (k * scale as i64) as i32;
                scale = 1;
                None
            }
            None => {
                let source = c.value(index_value).source.expect("index without a source");
                Some(site_register_number(c, source))
            }
        },
        None => None,
    };

    let base_source = c.value(base).source.expect("base without a source");
    let base_register = site_register_number(c, base_source);

    next_read(c, Some(e), base);
    if let Some(index_value) = index {
        if word == 8 && index_register.is_some() {
            let source = c.value(index_value).source.expect("index without a source");
            apply_binary(c, BinaryOperation::Move, 4, source, 8, source);
        }
        next_read(c, Some(e), index_value);
    }

    let site = memory_site(c, base_register, displacement, index_register, scale);
    c.value_mut(result).target = Some(site);
    add_site(c, None, &[], 0, result, site);
}

fn compile_branch<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    op: UnaryOperation,
    address: Value,
) {
    use UnaryOperation::*;

    let word = c.arch.word_size();
    let mut op = op;
    let jump = if op == Jump {
        true
    } else {
        let folded = match c.constant_compare {
            ConstantCompare::Less => Some(matches!(op, JumpIfLess | JumpIfLessOrEqual | JumpIfNotEqual)),
            ConstantCompare::Greater => {
                Some(matches!(op, JumpIfGreater | JumpIfGreaterOrEqual | JumpIfNotEqual))
            }
            ConstantCompare::Equal => {
                Some(matches!(op, JumpIfEqual | JumpIfLessOrEqual | JumpIfGreaterOrEqual))
            }
            ConstantCompare::None => None,
        };
        match folded {
            Some(taken) => {
                c.stats.constant_folded_branches += 1;
                if taken {
                    op = Jump;
                }
                taken
            }
            None => true,
        }
    };

    if jump {
        let source = c.value(address).source.expect("branch without a source");
        apply_unary(c, op, word, source);
    }

    next_read(c, Some(e), address);
}

fn compile_bounds_check<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    object: Value,
    length_offset: u32,
    index: Value,
    handler: i64,
) {
    let word = c.arch.word_size();
    let constant = find_constant_site(c, index);
    let next_cell = PromiseCell::empty();

    let out_of_bounds = match constant {
        Some(constant) => {
            let k = match &c.site(constant).kind {
                SiteKind::Constant { value } => value.value(),
                _ => unreachable!(),
            };
            assert!(k >= 0, "negative constant array index");
            None
        }
        None => {
            let cell = PromiseCell::empty();
            let zero = constant_site(c, Promise::Resolved(0));
            let index_source = c.value(index).source.expect("index without a source");
            apply_binary(c, BinaryOperation::Compare, 4, zero, 4, index_source);

            let operand = AsmOperand::Constant(Promise::Code {
                layout: c.layout.clone(),
                offset: cell.clone(),
            });
            c.asm.apply_unary(UnaryOperation::JumpIfLess, word, &operand);
            Some(cell)
        }
    };

    let object_source = c.value(object).source.expect("object without a source");
    let base = site_register_number(c, object_source);
    let length = memory_site(c, base, length_offset as i32, None, 1);
    site_acquire(c, None, &[], 0, None, length);

    let index_source = c.value(index).source.expect("index without a source");
    apply_binary(c, BinaryOperation::Compare, 4, index_source, 4, length);
    site_release(c, length);

    let next_operand = AsmOperand::Constant(Promise::Code {
        layout: c.layout.clone(),
        offset: next_cell.clone(),
    });
    c.asm
        .apply_unary(UnaryOperation::JumpIfGreater, word, &next_operand);

    if let Some(cell) = out_of_bounds {
        let offset = c.asm.offset();
        cell.fill(offset);
    }

    let handler_operand = AsmOperand::Constant(Promise::Resolved(handler));
    c.asm.apply_unary(UnaryOperation::Call, word, &handler_operand);

    let offset = c.asm.offset();
    next_cell.fill(offset);

    next_read(c, Some(e), object);
    next_read(c, Some(e), index);
}

fn compile_frame_site<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    value: Value,
    size: u32,
    index: u32,
) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;
    let site = frame_site(c, index);
    add_site(c, stack_before, locals_before, size, value, site);
}

fn compile_buddy<A: Assembler>(c: &mut Context<'_, A>, e: EventId, original: Value, buddy: Value) {
    c.value_mut(buddy).buddy = original;
    let mut p = original;
    while c.value(p).buddy != original {
        p = c.value(p).buddy;
    }
    c.value_mut(p).buddy = buddy;
    log::trace!("buddies {:?} and {:?}", original, buddy);

    next_read(c, Some(e), original);
}
