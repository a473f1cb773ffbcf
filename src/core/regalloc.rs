//! Read-driven register and frame-slot allocation.
//!
//! Registers are scored on demand: eviction prefers registers that hold
//! nothing, then registers whose value lives elsewhere too, and never
//! touches reserved or frozen registers. A register with outstanding
//! memory-site references is replaced rather than stolen: a sibling is
//! acquired, the contents are physically swapped, and the register table
//! is updated so existing memory bases keep resolving.

use crate::asm::{AsmOperand, Assembler, BinaryOperation, RegisterPair};
use crate::core::context::{Context, RegId};
use crate::core::frame::{frame_index, words, Locals, StackRef};
use crate::core::read::{read_intersect, Constraint};
use crate::core::site::{frame_site, move_value, SiteId, SiteKind};
use crate::core::value::{find_site, live, remove_site, Value};
use crate::error::{CompileError, CompileResult};

pub(crate) fn freeze_register<A: Assembler>(c: &mut Context<'_, A>, r: RegId) {
    debug_assert!(c.available_register_count > 0);
    let reg = c.register_mut(r);
    reg.freeze_count += 1;
    log::trace!("freeze {} to {}", reg.number, reg.freeze_count);
    c.available_register_count -= 1;
}

pub(crate) fn thaw_register<A: Assembler>(c: &mut Context<'_, A>, r: RegId) {
    let reg = c.register_mut(r);
    debug_assert!(reg.freeze_count > 0);
    reg.freeze_count -= 1;
    log::trace!("thaw {} to {}", reg.number, reg.freeze_count);
    c.available_register_count += 1;
}

/// Adds a memory-site reference to the register in physical slot `number`.
pub(crate) fn increment<A: Assembler>(c: &mut Context<'_, A>, number: u8) -> RegId {
    let r = c.register_by_number(number);
    let reg = c.register_mut(r);
    reg.ref_count += 1;
    log::trace!("increment {} to {}", reg.number, reg.ref_count);
    r
}

pub(crate) fn decrement<A: Assembler>(c: &mut Context<'_, A>, r: RegId) {
    let reg = c.register_mut(r);
    debug_assert!(reg.ref_count > 0);
    reg.ref_count -= 1;
    log::trace!("decrement {} to {}", reg.number, reg.ref_count);
}

fn used<A: Assembler>(c: &Context<'_, A>, r: RegId) -> bool {
    match (c.register(r).value, c.register(r).site) {
        (Some(v), Some(site)) => find_site(c, v, site),
        _ => false,
    }
}

fn used_exclusively<A: Assembler>(c: &Context<'_, A>, r: RegId) -> bool {
    if !used(c, r) {
        return false;
    }
    let v = c.register(r).value.expect("used register without value");
    let head = c.value(v).sites.expect("used register without sites");
    c.site(head).next.is_none()
}

fn register_cost<A: Assembler>(c: &Context<'_, A>, r: RegId) -> u32 {
    let reg = c.register(r);
    if reg.reserved || reg.freeze_count > 0 {
        return 6;
    }

    let mut cost = 0;
    if used(c, r) {
        cost += 1;
        if used_exclusively(c, r) {
            cost += 2;
        }
    }
    if reg.ref_count > 0 {
        cost += 2;
    }
    cost
}

/// The cheapest evictable register admitted by `mask`; ties prefer
/// higher-numbered registers. A singleton mask returns its register
/// unconditionally, frozen or not.
pub(crate) fn pick_register<A: Assembler>(c: &mut Context<'_, A>, mask: u32) -> RegId {
    let mut best = None;
    let mut best_cost = 5;
    for number in (0..c.arch.register_count()).rev() {
        if mask & (1u32 << number) == 0 {
            continue;
        }
        let r = c.register_by_number(number as u8);
        if (1u32 << number) == mask {
            if c.register(r).freeze_count > 0 {
                c.stats.frozen_picks += 1;
            }
            return r;
        }
        let cost = register_cost(c, r);
        if cost < best_cost {
            best = Some(r);
            best_cost = cost;
        }
    }

    match best {
        Some(r) => r,
        None => panic!("{}", CompileError::NoRegister { mask }),
    }
}

/// Exchanges the contents and physical slots of two registers.
fn swap_registers<A: Assembler>(c: &mut Context<'_, A>, a: RegId, b: RegId) {
    debug_assert_ne!(a, b);
    let word = c.arch.word_size();
    let ar = AsmOperand::Register(RegisterPair {
        low: c.register(a).number,
        high: None,
    });
    let br = AsmOperand::Register(RegisterPair {
        low: c.register(b).number,
        high: None,
    });
    c.asm.apply_binary(BinaryOperation::Swap, word, &ar, word, &br);
    c.swap_numbers(a, b);
}

/// Moves a register's contents to a sibling so its physical slot can be
/// reassigned while memory sites keep using it as a base.
fn replace_register<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    r: RegId,
) -> RegId {
    let mask = if c.register(r).freeze_count > 0 {
        match &c.site(c.register(r).site.expect("frozen register without site")).kind {
            SiteKind::Register { mask, .. } => *mask as u32,
            _ => panic!("register occupied by a non-register site"),
        }
    } else {
        !0u32
    };

    let size = c.register(r).size;
    let value = c.register(r).value.expect("replacing an empty register");
    let site = c.register(r).site.expect("replacing an empty register");

    freeze_register(c, r);
    let s = acquire_register(c, mask, stack, locals, size, value, site);
    thaw_register(c, r);

    log::debug!(
        "replace {} with {}",
        c.register(r).number,
        c.register(s).number
    );
    swap_registers(c, r, s);
    s
}

pub(crate) fn acquire_register<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    mask: u32,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    new_size: u32,
    new_value: Value,
    new_site: SiteId,
) -> RegId {
    let mut r = pick_register(c, mask);

    if c.register(r).reserved {
        return r;
    }

    log::trace!(
        "acquire {} for {:?} freeze {} refs {}",
        c.register(r).number,
        new_value,
        c.register(r).freeze_count,
        c.register(r).ref_count
    );
    c.stats.registers_acquired += 1;

    if c.register(r).ref_count > 0 {
        r = replace_register(c, stack, locals, r);
    } else if let Some(old_value) = c.register(r).value {
        let old_site = c.register(r).site;
        if old_value != new_value
            && old_site.map(|s| find_site(c, old_value, s)).unwrap_or(false)
            && try_steal_register(c, r, stack, locals).is_err()
        {
            r = replace_register(c, stack, locals, r);
        }
    }

    let reg = c.register_mut(r);
    reg.size = new_size;
    reg.value = Some(new_value);
    reg.site = Some(new_site);
    r
}

pub(crate) fn release_register_entry<A: Assembler>(c: &mut Context<'_, A>, r: RegId) {
    let reg = c.register_mut(r);
    log::trace!("release {}", reg.number);
    reg.size = 0;
    reg.value = None;
    reg.site = None;
}

/// Lands a value in a register admitted by `mask`, preferring `current` if
/// it still qualifies; emits a move when the incumbent register changes.
pub(crate) fn validate_register<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    mask: u32,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    size: u32,
    value: Value,
    site: SiteId,
    current: Option<RegId>,
) -> RegId {
    if let Some(cur) = current {
        let number = c.register(cur).number;
        if mask & (1u32 << number) != 0 {
            if c.register(cur).reserved || c.register(cur).value == Some(value) {
                return cur;
            }
            if c.register(cur).value.is_none() {
                let reg = c.register_mut(cur);
                reg.size = size;
                reg.value = Some(value);
                reg.site = Some(site);
                return cur;
            }
        }
    }

    let r = acquire_register(c, mask, stack, locals, size, value, site);

    if let Some(cur) = current {
        if cur != r {
            release_register_entry(c, cur);
            let word = c.arch.word_size();
            let src = AsmOperand::Register(RegisterPair {
                low: c.register(cur).number,
                high: None,
            });
            let dst = AsmOperand::Register(RegisterPair {
                low: c.register(r).number,
                high: None,
            });
            c.asm
                .apply_binary(BinaryOperation::Move, word, &src, word, &dst);
        }
    }

    r
}

/// Demotes a value out of `site` by moving it to its canonical save slot:
/// the frame slot of the local it backs, or the stack slot it occupies.
/// Fails if the value has no other site and no save slot exists.
pub(crate) fn try_steal_site<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    site: SiteId,
    v: Value,
    size: u32,
    stack: StackRef<'a>,
    locals: Locals<'a>,
) -> CompileResult<()> {
    let head = c.value(v).sites;
    let sole_site = head.map(|h| c.site(h).next.is_none()).unwrap_or(false);

    if sole_site {
        let word = c.arch.word_size();
        let mut save: Option<SiteId> = None;

        for li in 0..locals.len() {
            let slot = locals[li].get();
            if slot.value == Some(v) {
                let fi = frame_index(c, li as u32, words(slot.size_in_bytes, word));
                save = Some(frame_site(c, fi));
                break;
            }
        }

        if save.is_none() {
            let mut node = stack;
            while let Some(s) = node {
                if s.value == v {
                    let mut con = Constraint::any();
                    if let Some(first) = c.value(v).reads {
                        read_intersect(c, first, &mut con);
                    }
                    let fi = match con.frame_index.index() {
                        Some(fi) => fi,
                        None => frame_index(c, s.index + c.local_footprint, s.size_in_words),
                    };
                    save = Some(frame_site(c, fi));
                    break;
                }
                node = s.next;
            }
        }

        match save {
            Some(dst) => {
                c.stats.spills += 1;
                move_value(c, stack, locals, size, v, site, dst);
            }
            None => {
                log::debug!("unable to steal {:?} from {:?}", site, v);
                return Err(CompileError::NoSaveSite);
            }
        }
    }

    remove_site(c, v, site);
    Ok(())
}

pub(crate) fn try_steal_register<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    r: RegId,
    stack: StackRef<'a>,
    locals: Locals<'a>,
) -> CompileResult<()> {
    debug_assert_eq!(c.register(r).ref_count, 0);
    let v = c.register(r).value.expect("stealing an empty register");
    debug_assert!(live(c, v));
    let site = c.register(r).site.expect("stealing an empty register");
    log::trace!("try steal {} from {:?}", c.register(r).number, v);
    try_steal_site(c, site, v, c.register(r).size, stack, locals)
}

fn try_steal_frame<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    index: u32,
    stack: StackRef<'a>,
    locals: Locals<'a>,
) -> CompileResult<()> {
    let resource = &c.frame_resources[index as usize];
    let v = resource.value.expect("stealing an empty frame slot");
    let site = resource.site.expect("stealing an empty frame slot");
    let size = resource.size;
    log::trace!("try steal frame index {} from {:?}", index, v);
    try_steal_site(c, site, v, size, stack, locals)
}

/// Reserves the frame slot at `index` for a value; wide values also take
/// the following slot. Aborts when the incumbent cannot be displaced,
/// which is unreachable if the front-end respects the frame capacity.
pub(crate) fn acquire_frame_index<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    index: u32,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    new_size: u32,
    new_value: Option<Value>,
    new_site: SiteId,
    recurse: bool,
) {
    debug_assert!(index < c.aligned_frame_size + c.parameter_footprint);
    log::trace!("acquire frame index {} for {:?}", index, new_value);

    if recurse && new_size > c.arch.word_size() {
        acquire_frame_index(c, index + 1, stack, locals, new_size, new_value, new_site, false);
    }

    let resource = &c.frame_resources[index as usize];
    if let Some(old_value) = resource.value {
        let old_site = resource.site;
        if Some(old_value) != new_value
            && old_site.map(|s| find_site(c, old_value, s)).unwrap_or(false)
            && try_steal_frame(c, index, stack, locals).is_err()
        {
            panic!("{}", CompileError::FrameSlotConflict { index });
        }
    }

    let resource = &mut c.frame_resources[index as usize];
    resource.size = new_size;
    resource.value = new_value;
    resource.site = Some(new_site);
}

pub(crate) fn release_frame_index<A: Assembler>(c: &mut Context<'_, A>, index: u32, recurse: bool) {
    debug_assert!(index < c.aligned_frame_size + c.parameter_footprint);
    log::trace!("release frame index {}", index);

    if recurse && c.frame_resources[index as usize].size > c.arch.word_size() {
        release_frame_index(c, index + 1, false);
    }

    let resource = &mut c.frame_resources[index as usize];
    resource.size = 0;
    resource.value = None;
    resource.site = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::site::free_register_site;
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
    fn test_pick_skips_reserved_and_frozen() {
        with_context(|c| {
            let r5 = c.register_by_number(5);
            freeze_register(c, r5);
            let picked = pick_register(c, !0);
            assert_eq!(c.register(picked).number, 4);
            thaw_register(c, r5);
            let picked = pick_register(c, !0);
            assert_eq!(c.register(picked).number, 5);
        });
    }

    #[test]
    fn test_singleton_mask_overrides_freeze() {
        with_context(|c| {
            let r3 = c.register_by_number(3);
            freeze_register(c, r3);
            let picked = pick_register(c, 1 << 3);
            assert_eq!(picked, r3);
            assert_eq!(c.stats.frozen_picks, 1);
            thaw_register(c, r3);
        });
    }

    #[test]
    #[should_panic(expected = "no register satisfies")]
    fn test_empty_mask_aborts() {
        with_context(|c| {
            pick_register(c, 0);
        });
    }

    #[test]
    fn test_acquire_avoids_occupied_registers() {
        with_context(|c| {
            let v = c.alloc_value(None, None);
            let s = free_register_site(c, crate::asm::ANY_REGISTER);
            let r = acquire_register(c, !0, None, &[], 8, v, s);
            assert_eq!(c.register(r).number, 5);
            assert_eq!(c.register(r).value, Some(v));
            c.value_mut(v).sites = Some(s);

            let w = c.alloc_value(None, None);
            let s2 = free_register_site(c, crate::asm::ANY_REGISTER);
            let r2 = acquire_register(c, !0, None, &[], 8, w, s2);
            assert_eq!(c.register(r2).number, 4);
        });
    }

    #[test]
    fn test_frame_index_acquisition_is_recursive_for_wide_values() {
        with_context(|c| {
            let v = c.alloc_value(None, None);
            let s = crate::core::site::frame_site(c, 1);
            acquire_frame_index(c, 1, None, &[], 16, Some(v), s, true);
            assert_eq!(c.frame_resources[1].value, Some(v));
            assert_eq!(c.frame_resources[2].value, Some(v));
            release_frame_index(c, 1, true);
            assert!(c.frame_resources[1].value.is_none());
            assert!(c.frame_resources[2].value.is_none());
        });
    }
}
