//! Sites: concrete homes for values.
//!
//! A site is one place a value currently lives: a constant, an absolute
//! address, one or two registers, or a memory operand. When a memory
//! site's base is the stack pointer the site is a frame slot owned by a
//! frame resource. Copy costs order the variants from cheapest to most
//! expensive to move out of.

use crate::asm::{
    AsmOperand, Assembler, BinaryOperation, MemoryOperand, OperandKind, RegisterPair,
    TernaryOperation, UnaryOperation,
};
use crate::core::context::{Context, RegId};
use crate::core::frame::{frame_index_to_offset, offset_to_frame_index, Locals, StackRef};
use crate::core::read::FrameIndex;
use crate::core::regalloc;
use crate::core::value::{add_site, Value};
use crate::promise::Promise;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SiteId(pub(crate) u32);

pub(crate) enum SiteKind {
    Constant {
        value: Promise,
    },
    Address {
        address: Promise,
    },
    Register {
        /// Admissible registers: low register bits 0..32, high register
        /// bits 32..64.
        mask: u64,
        low: Option<RegId>,
        high: Option<RegId>,
    },
    Memory {
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u32,
        base_reg: Option<RegId>,
        index_reg: Option<RegId>,
    },
}

pub(crate) struct SiteData {
    pub kind: SiteKind,
    pub next: Option<SiteId>,
}

pub(crate) fn constant_site<A: Assembler>(c: &mut Context<'_, A>, value: Promise) -> SiteId {
    c.alloc_site(SiteKind::Constant { value })
}

pub(crate) fn address_site<A: Assembler>(c: &mut Context<'_, A>, address: Promise) -> SiteId {
    c.alloc_site(SiteKind::Address { address })
}

/// A register site pinned to specific physical registers.
pub(crate) fn register_site<A: Assembler>(
    c: &mut Context<'_, A>,
    low: u8,
    high: Option<u8>,
) -> SiteId {
    debug_assert!((low as usize) < c.arch.register_count());
    let low = c.register_by_number(low);
    let high = high.map(|h| c.register_by_number(h));
    c.alloc_site(SiteKind::Register {
        mask: crate::asm::ANY_REGISTER,
        low: Some(low),
        high,
    })
}

/// An unacquired register site; a register is chosen from `mask` when the
/// site is attached to a value.
pub(crate) fn free_register_site<A: Assembler>(c: &mut Context<'_, A>, mask: u64) -> SiteId {
    c.alloc_site(SiteKind::Register {
        mask,
        low: None,
        high: None,
    })
}

pub(crate) fn memory_site<A: Assembler>(
    c: &mut Context<'_, A>,
    base: u8,
    offset: i32,
    index: Option<u8>,
    scale: u32,
) -> SiteId {
    c.alloc_site(SiteKind::Memory {
        base,
        offset,
        index,
        scale,
        base_reg: None,
        index_reg: None,
    })
}

/// The frame slot at `frame_index`, addressed off the stack pointer.
pub(crate) fn frame_site<A: Assembler>(c: &mut Context<'_, A>, frame_index: u32) -> SiteId {
    let base = c.arch.stack();
    let offset = frame_index_to_offset(c, frame_index) as i32;
    memory_site(c, base, offset, None, 1)
}

pub(crate) fn site_operand_kind<A: Assembler>(c: &Context<'_, A>, s: SiteId) -> OperandKind {
    match &c.site(s).kind {
        SiteKind::Constant { .. } => OperandKind::Constant,
        SiteKind::Address { .. } => OperandKind::Address,
        SiteKind::Register { .. } => OperandKind::Register,
        SiteKind::Memory { .. } => OperandKind::Memory,
    }
}

/// Current physical numbers of an acquired register site. Registers can
/// swap physical slots, so numbers are always re-derived from the handles.
pub(crate) fn register_view<A: Assembler>(c: &Context<'_, A>, s: SiteId) -> (u8, Option<u8>) {
    match &c.site(s).kind {
        SiteKind::Register { low, high, .. } => {
            let low = low.expect("register site not acquired");
            (
                c.register(low).number,
                high.map(|h| c.register(h).number),
            )
        }
        _ => panic!("register view of a non-register site"),
    }
}

/// The low physical register of an acquired register site.
pub(crate) fn site_register_number<A: Assembler>(c: &Context<'_, A>, s: SiteId) -> u8 {
    register_view(c, s).0
}

/// Memory operand parts with register numbers re-synced from any acquired
/// handles.
pub(crate) fn memory_view<A: Assembler>(c: &Context<'_, A>, s: SiteId) -> MemoryOperand {
    match &c.site(s).kind {
        SiteKind::Memory {
            base,
            offset,
            index,
            scale,
            base_reg,
            index_reg,
        } => MemoryOperand {
            base: base_reg.map(|r| c.register(r).number).unwrap_or(*base),
            offset: *offset,
            index: index_reg.map(|r| Some(c.register(r).number)).unwrap_or(*index),
            scale: *scale,
        },
        _ => panic!("memory view of a non-memory site"),
    }
}

/// Cost of copying a value out of `s` into `target` (or into an unknown
/// place when `target` is `None`). Zero means no copy is needed.
pub(crate) fn copy_cost<A: Assembler>(
    c: &Context<'_, A>,
    s: SiteId,
    target: Option<SiteId>,
) -> u32 {
    if target == Some(s) {
        return 0;
    }
    match &c.site(s).kind {
        SiteKind::Constant { .. } => 1,
        SiteKind::Address { .. } => 3,
        SiteKind::Register { .. } => {
            let (low, high) = register_view(c, s);
            if let Some(t) = target {
                if let SiteKind::Register { mask, .. } = &c.site(t).kind {
                    let low_ok = mask & (1u64 << low) != 0;
                    let high_ok = match high {
                        Some(high) => mask & (1u64 << (high as u32 + 32)) != 0,
                        None => true,
                    };
                    if low_ok && high_ok {
                        return 0;
                    }
                }
            }
            2
        }
        SiteKind::Memory { .. } => {
            let mine = memory_view(c, s);
            if let Some(t) = target {
                if matches!(c.site(t).kind, SiteKind::Memory { .. })
                    && memory_view(c, t) == mine
                {
                    return 0;
                }
            }
            4
        }
    }
}

/// Whether the site satisfies a read constraint.
pub(crate) fn site_match<A: Assembler>(
    c: &Context<'_, A>,
    s: SiteId,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> bool {
    match &c.site(s).kind {
        SiteKind::Constant { .. } => type_mask & OperandKind::Constant.mask() != 0,
        SiteKind::Address { .. } => type_mask & OperandKind::Address.mask() != 0,
        SiteKind::Register { low, .. } => {
            if type_mask & OperandKind::Register.mask() == 0 || low.is_none() {
                return false;
            }
            let (low, high) = register_view(c, s);
            register_mask & (1u64 << low) != 0
                && match high {
                    Some(high) => register_mask & (1u64 << (high as u32 + 32)) != 0,
                    None => true,
                }
        }
        SiteKind::Memory { .. } => {
            if type_mask & OperandKind::Memory.mask() == 0 {
                return false;
            }
            let view = memory_view(c, s);
            if view.base == c.arch.stack() {
                debug_assert!(view.index.is_none());
                match frame_index {
                    FrameIndex::Any => true,
                    FrameIndex::No => false,
                    FrameIndex::At(fi) => frame_index_to_offset(c, fi) as i32 == view.offset,
                }
            } else {
                true
            }
        }
    }
}

/// Claims the site's underlying resources for `v`: registers are acquired
/// (possibly displacing an incumbent), memory bases and indexes gain a
/// reference, frame slots are reserved.
pub(crate) fn site_acquire<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    size: u32,
    v: Option<Value>,
    s: SiteId,
) {
    enum Plan {
        Register { mask: u64, low: Option<RegId>, high: Option<RegId> },
        Memory { base: u8, offset: i32, index: Option<u8> },
        Nothing,
    }

    let plan = match &c.site(s).kind {
        SiteKind::Register { mask, low, high } => Plan::Register {
            mask: *mask,
            low: *low,
            high: *high,
        },
        SiteKind::Memory {
            base,
            offset,
            index,
            ..
        } => Plan::Memory {
            base: *base,
            offset: *offset,
            index: *index,
        },
        _ => Plan::Nothing,
    };

    match plan {
        Plan::Register { mask, low, high } => {
            let v = v.expect("register site acquired without a value");
            let word = c.arch.word_size();
            let new_low = regalloc::validate_register(
                c,
                mask as u32,
                stack,
                locals,
                size,
                v,
                s,
                low,
            );
            let mut new_high = high;
            if size > word {
                regalloc::freeze_register(c, new_low);
                new_high = Some(regalloc::validate_register(
                    c,
                    (mask >> 32) as u32,
                    stack,
                    locals,
                    size,
                    v,
                    s,
                    high,
                ));
                regalloc::thaw_register(c, new_low);
            }
            if let SiteKind::Register { low, high, .. } = &mut c.site_mut(s).kind {
                *low = Some(new_low);
                *high = new_high;
            }
        }
        Plan::Memory {
            base,
            offset,
            index,
        } => {
            let base_reg = regalloc::increment(c, base);
            let index_reg = index.map(|i| regalloc::increment(c, i));
            if let SiteKind::Memory {
                base_reg: b,
                index_reg: i,
                ..
            } = &mut c.site_mut(s).kind
            {
                *b = Some(base_reg);
                *i = index_reg;
            }
            if base == c.arch.stack() {
                debug_assert!(index.is_none());
                let fi = offset_to_frame_index(c, offset as u32);
                regalloc::acquire_frame_index(c, fi, stack, locals, size, v, s, true);
            }
        }
        Plan::Nothing => {}
    }
}

pub(crate) fn site_release<A: Assembler>(c: &mut Context<'_, A>, s: SiteId) {
    enum Plan {
        Register(RegId, Option<RegId>),
        Memory {
            base: u8,
            offset: i32,
            base_reg: RegId,
            index_reg: Option<RegId>,
        },
        Nothing,
    }

    let plan = match &c.site(s).kind {
        SiteKind::Register { low, high, .. } => {
            Plan::Register(low.expect("releasing unacquired register site"), *high)
        }
        SiteKind::Memory {
            base,
            offset,
            base_reg,
            index_reg,
            ..
        } => Plan::Memory {
            base: *base,
            offset: *offset,
            base_reg: base_reg.expect("releasing unacquired memory site"),
            index_reg: *index_reg,
        },
        _ => Plan::Nothing,
    };

    match plan {
        Plan::Register(low, high) => {
            regalloc::release_register_entry(c, low);
            if let Some(high) = high {
                regalloc::release_register_entry(c, high);
            }
        }
        Plan::Memory {
            base,
            offset,
            base_reg,
            index_reg,
        } => {
            if base == c.arch.stack() {
                let fi = offset_to_frame_index(c, offset as u32);
                regalloc::release_frame_index(c, fi, true);
            }
            regalloc::decrement(c, base_reg);
            if let Some(index_reg) = index_reg {
                regalloc::decrement(c, index_reg);
            }
        }
        Plan::Nothing => {}
    }
}

/// Pins the site's registers against eviction while an event consumes it.
pub(crate) fn site_freeze<A: Assembler>(c: &mut Context<'_, A>, s: SiteId) {
    if let SiteKind::Register { low, high, .. } = &c.site(s).kind {
        let low = low.expect("freezing unacquired register site");
        let high = *high;
        regalloc::freeze_register(c, low);
        if let Some(high) = high {
            regalloc::freeze_register(c, high);
        }
    }
}

pub(crate) fn site_thaw<A: Assembler>(c: &mut Context<'_, A>, s: SiteId) {
    if let SiteKind::Register { low, high, .. } = &c.site(s).kind {
        let low = low.expect("thawing unacquired register site");
        let high = *high;
        regalloc::thaw_register(c, low);
        if let Some(high) = high {
            regalloc::thaw_register(c, high);
        }
    }
}

pub(crate) fn site_uses_register<A: Assembler>(c: &Context<'_, A>, s: SiteId, number: u8) -> bool {
    match &c.site(s).kind {
        SiteKind::Register { low, .. } => {
            if low.is_none() {
                return false;
            }
            let (low, high) = register_view(c, s);
            low == number || high == Some(number)
        }
        SiteKind::Memory { .. } => {
            let view = memory_view(c, s);
            view.base == number || view.index == Some(number)
        }
        _ => false,
    }
}

/// Structural clone. An acquired register site copies to a free site
/// whose mask names its current registers; memory sites copy their synced
/// operand parts.
pub(crate) fn site_copy<A: Assembler>(c: &mut Context<'_, A>, s: SiteId) -> SiteId {
    let kind = match &c.site(s).kind {
        SiteKind::Constant { value } => SiteKind::Constant {
            value: value.clone(),
        },
        SiteKind::Address { address } => SiteKind::Address {
            address: address.clone(),
        },
        SiteKind::Register { mask, low, .. } => {
            let mask = if low.is_some() {
                let (low, high) = register_view(c, s);
                let mut m = 1u64 << low;
                if let Some(high) = high {
                    m |= 1u64 << high;
                }
                m
            } else {
                *mask
            };
            SiteKind::Register {
                mask,
                low: None,
                high: None,
            }
        }
        SiteKind::Memory { .. } => {
            let view = memory_view(c, s);
            SiteKind::Memory {
                base: view.base,
                offset: view.offset,
                index: view.index,
                scale: view.scale,
                base_reg: None,
                index_reg: None,
            }
        }
    };
    c.alloc_site(kind)
}

/// Clone a whole site chain, preserving order.
pub(crate) fn copy_chain<A: Assembler>(
    c: &mut Context<'_, A>,
    mut s: Option<SiteId>,
) -> Option<SiteId> {
    let mut head = None;
    let mut tail: Option<SiteId> = None;
    while let Some(site) = s {
        let next = c.site(site).next;
        let copied = site_copy(c, site);
        match tail {
            Some(t) => c.site_mut(t).next = Some(copied),
            None => head = Some(copied),
        }
        tail = Some(copied);
        s = next;
    }
    head
}

/// Operand view handed to the assembler.
pub(crate) fn as_operand<A: Assembler>(c: &Context<'_, A>, s: SiteId) -> AsmOperand {
    match &c.site(s).kind {
        SiteKind::Constant { value } => AsmOperand::Constant(value.clone()),
        SiteKind::Address { address } => AsmOperand::Address(address.clone()),
        SiteKind::Register { .. } => {
            let (low, high) = register_view(c, s);
            AsmOperand::Register(RegisterPair { low, high })
        }
        SiteKind::Memory { .. } => AsmOperand::Memory(memory_view(c, s)),
    }
}

pub(crate) fn describe_site<A: Assembler>(c: &Context<'_, A>, s: SiteId) -> String {
    match &c.site(s).kind {
        SiteKind::Constant { value } => format!("constant {:?}", value),
        SiteKind::Address { address } => format!("address {:?}", address),
        SiteKind::Register { low, .. } => {
            if low.is_some() {
                let (low, high) = register_view(c, s);
                format!("register {} {:?}", low, high)
            } else {
                "register unacquired".to_string()
            }
        }
        SiteKind::Memory { .. } => {
            let view = memory_view(c, s);
            format!(
                "memory {} {} {:?} {}",
                view.base, view.offset, view.index, view.scale
            )
        }
    }
}

/// Fabricates a site for a constraint: a free register when registers are
/// admissible, else the requested frame slot, else nothing.
pub(crate) fn allocate_site<A: Assembler>(
    c: &mut Context<'_, A>,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> Option<SiteId> {
    if type_mask & OperandKind::Register.mask() != 0 && register_mask != 0 {
        Some(free_register_site(c, register_mask))
    } else {
        frame_index.index().map(|fi| frame_site(c, fi))
    }
}

pub(crate) fn apply_nullary<A: Assembler>(c: &mut Context<'_, A>, op: crate::asm::Operation) {
    c.asm.apply(op);
}

pub(crate) fn apply_unary<A: Assembler>(
    c: &mut Context<'_, A>,
    op: UnaryOperation,
    size: u32,
    s: SiteId,
) {
    let operand = as_operand(c, s);
    c.asm.apply_unary(op, size, &operand);
}

pub(crate) fn apply_binary<A: Assembler>(
    c: &mut Context<'_, A>,
    op: BinaryOperation,
    src_size: u32,
    src: SiteId,
    dst_size: u32,
    dst: SiteId,
) {
    let src_operand = as_operand(c, src);
    let dst_operand = as_operand(c, dst);
    c.asm
        .apply_binary(op, src_size, &src_operand, dst_size, &dst_operand);
}

pub(crate) fn apply_ternary<A: Assembler>(
    c: &mut Context<'_, A>,
    op: TernaryOperation,
    first_size: u32,
    first: SiteId,
    second_size: u32,
    second: SiteId,
    result_size: u32,
    result: SiteId,
) {
    let first_operand = as_operand(c, first);
    let second_operand = as_operand(c, second);
    let result_operand = as_operand(c, result);
    c.asm.apply_ternary(
        op,
        first_size,
        &first_operand,
        second_size,
        &second_operand,
        result_size,
        &result_operand,
    );
}

/// Copies a value from `src` into `dst`, attaching `dst` to the value.
/// Memory-to-memory and address-to-memory shapes bounce through a fresh
/// register.
pub(crate) fn move_value<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    size: u32,
    v: Value,
    src: SiteId,
    dst: SiteId,
) {
    let mut src = src;
    let dst_kind = site_operand_kind(c, dst);
    let src_kind = site_operand_kind(c, src);
    if dst_kind == OperandKind::Memory
        && (src_kind == OperandKind::Memory || src_kind == OperandKind::Address)
    {
        let tmp = free_register_site(c, crate::asm::ANY_REGISTER);
        add_site(c, stack, locals, size, v, tmp);
        log::trace!(
            "move {} to {} for {:?}",
            describe_site(c, src),
            describe_site(c, tmp),
            v
        );
        apply_binary(c, BinaryOperation::Move, size, src, size, tmp);
        src = tmp;
    }

    add_site(c, stack, locals, size, v, dst);
    log::trace!(
        "move {} to {} for {:?}",
        describe_site(c, src),
        describe_site(c, dst),
        v
    );
    apply_binary(c, BinaryOperation::Move, size, src, size, dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::test_utils::{RecordingAssembler, TestArchitecture, TestClient};
    use bumpalo::Bump;

    fn with_context<F: FnOnce(&mut Context<'_, RecordingAssembler>)>(f: F) {
        let arena = Bump::new();
        let arch = TestArchitecture::new();
        let client = TestClient::new();
        let mut c = Context::new(&arena, &arch, RecordingAssembler::new(), &client);
        c.init(4, 0, 2, 4);
        f(&mut c);
    }

    #[test]
    fn test_copy_cost_ordering() {
        with_context(|c| {
            let constant = constant_site(c, Promise::Resolved(1));
            let address = address_site(c, Promise::Resolved(2));
            let register = register_site(c, 3, None);
            let memory = memory_site(c, 3, 16, None, 1);

            assert_eq!(copy_cost(c, constant, None), 1);
            assert_eq!(copy_cost(c, register, None), 2);
            assert_eq!(copy_cost(c, address, None), 3);
            assert_eq!(copy_cost(c, memory, None), 4);
            assert_eq!(copy_cost(c, constant, Some(constant)), 0);
            assert_eq!(copy_cost(c, memory, Some(memory)), 0);
        });
    }

    #[test]
    fn test_frame_site_matches_its_slot_only() {
        with_context(|c| {
            let s = frame_site(c, 2);
            let memory = OperandKind::Memory.mask();
            assert!(site_match(c, s, memory, 0, FrameIndex::At(2)));
            assert!(site_match(c, s, memory, 0, FrameIndex::Any));
            assert!(!site_match(c, s, memory, 0, FrameIndex::At(3)));
            assert!(!site_match(c, s, memory, 0, FrameIndex::No));
            assert!(!site_match(
                c,
                s,
                OperandKind::Register.mask(),
                0,
                FrameIndex::Any
            ));
        });
    }

    #[test]
    fn test_register_site_respects_register_mask() {
        with_context(|c| {
            let s = register_site(c, 3, None);
            let register = OperandKind::Register.mask();
            assert!(site_match(c, s, register, 1 << 3, FrameIndex::No));
            assert!(!site_match(c, s, register, 1 << 4, FrameIndex::No));
        });
    }

    #[test]
    fn test_copied_register_site_remembers_its_registers() {
        with_context(|c| {
            let s = register_site(c, 3, None);
            let copy = site_copy(c, s);
            match &c.site(copy).kind {
                SiteKind::Register { mask, low, high } => {
                    assert_eq!(*mask, 1 << 3);
                    assert!(low.is_none());
                    assert!(high.is_none());
                }
                _ => panic!("copy changed the site kind"),
            }
        });
    }

    #[test]
    fn test_uses_register_sees_bases_and_indexes() {
        with_context(|c| {
            let register = register_site(c, 3, None);
            assert!(site_uses_register(c, register, 3));
            assert!(!site_uses_register(c, register, 4));

            let memory = memory_site(c, 2, 8, Some(4), 1);
            assert!(site_uses_register(c, memory, 2));
            assert!(site_uses_register(c, memory, 4));
            assert!(!site_uses_register(c, memory, 3));

            let constant = constant_site(c, Promise::Resolved(1));
            assert!(!site_uses_register(c, constant, 3));
        });
    }

    #[test]
    fn test_allocate_site_prefers_registers() {
        with_context(|c| {
            let register = OperandKind::Register.mask();
            let memory = OperandKind::Memory.mask();

            let s = allocate_site(c, register | memory, !0, FrameIndex::At(1)).unwrap();
            assert!(matches!(c.site(s).kind, SiteKind::Register { .. }));

            let s = allocate_site(c, memory, 0, FrameIndex::At(1)).unwrap();
            assert!(matches!(c.site(s).kind, SiteKind::Memory { .. }));

            assert!(allocate_site(c, memory, 0, FrameIndex::No).is_none());
        });
    }
}
