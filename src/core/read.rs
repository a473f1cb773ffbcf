//! Reads: demands placed on values by events.
//!
//! A read publishes the sites a value may occupy when its event compiles,
//! as a `(type mask, register mask, frame index)` triple. Three kinds
//! exist: a `Single` read with a fixed constraint, a `Multi` read that
//! collects the per-branch constraints downstream of a fork, and a `Stub`
//! read inserted at a junction predecessor before the successor's real
//! reads are known.

use crate::asm::Assembler;
use crate::core::context::{Context, EventId};
use crate::core::site::{allocate_site, SiteId};
use crate::core::value::{pick_site, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ReadId(pub(crate) u32);

/// Frame-slot component of a read constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIndex {
    /// Any frame slot is acceptable.
    Any,
    /// No frame slot is acceptable.
    No,
    /// Exactly this frame slot.
    At(u32),
}

impl FrameIndex {
    /// `No` is absorbing, `Any` is identity, equal concrete indexes
    /// combine to themselves, unequal ones are unsatisfiable.
    pub fn intersect(self, other: FrameIndex) -> FrameIndex {
        match (self, other) {
            (FrameIndex::No, _) | (_, FrameIndex::No) => FrameIndex::No,
            (FrameIndex::Any, x) | (x, FrameIndex::Any) => x,
            (FrameIndex::At(a), FrameIndex::At(b)) if a == b => FrameIndex::At(a),
            _ => FrameIndex::No,
        }
    }

    pub fn index(self) -> Option<u32> {
        match self {
            FrameIndex::At(index) => Some(index),
            _ => None,
        }
    }
}

/// A full read constraint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Constraint {
    pub type_mask: u8,
    pub register_mask: u64,
    pub frame_index: FrameIndex,
}

impl Constraint {
    pub fn any() -> Self {
        Self {
            type_mask: crate::asm::ANY_OPERAND,
            register_mask: crate::asm::ANY_REGISTER,
            frame_index: FrameIndex::Any,
        }
    }
}

pub(crate) enum ReadKind {
    Single {
        type_mask: u8,
        register_mask: u64,
        frame_index: FrameIndex,
        next: Option<ReadId>,
    },
    Multi {
        members: Vec<ReadId>,
        targets: Vec<Option<ReadId>>,
        next_target: usize,
        visited: bool,
    },
    Stub {
        next: Option<ReadId>,
        bound: Option<ReadId>,
        visited: bool,
    },
}

pub(crate) struct ReadData {
    pub value: Option<Value>,
    pub event: Option<EventId>,
    pub event_next: Option<ReadId>,
    pub size: u32,
    pub kind: ReadKind,
}

pub(crate) fn single_read<A: Assembler>(
    c: &mut Context<'_, A>,
    size: u32,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> ReadId {
    debug_assert!(
        type_mask != crate::asm::OperandKind::Memory.mask()
            || matches!(frame_index, FrameIndex::At(_)),
        "memory-only read needs a concrete frame slot"
    );
    c.alloc_read(ReadData {
        value: None,
        event: None,
        event_next: None,
        size,
        kind: ReadKind::Single {
            type_mask,
            register_mask,
            frame_index,
            next: None,
        },
    })
}

pub(crate) fn any_register_read<A: Assembler>(c: &mut Context<'_, A>, size: u32) -> ReadId {
    single_read(
        c,
        size,
        crate::asm::OperandKind::Register.mask(),
        crate::asm::ANY_REGISTER,
        FrameIndex::No,
    )
}

pub(crate) fn register_or_constant_read<A: Assembler>(
    c: &mut Context<'_, A>,
    size: u32,
) -> ReadId {
    single_read(
        c,
        size,
        crate::asm::OperandKind::Register.mask() | crate::asm::OperandKind::Constant.mask(),
        crate::asm::ANY_REGISTER,
        FrameIndex::No,
    )
}

/// A read demanding one specific register, or a specific pair for wide
/// values. With no high register the high half of the mask is left open.
pub(crate) fn fixed_register_read<A: Assembler>(
    c: &mut Context<'_, A>,
    size: u32,
    low: u8,
    high: Option<u8>,
) -> ReadId {
    let mask = match high {
        Some(high) => (1u64 << (high as u32 + 32)) | (1u64 << low),
        None => (!0u64 << 32) | (1u64 << low),
    };
    single_read(
        c,
        size,
        crate::asm::OperandKind::Register.mask(),
        mask,
        FrameIndex::No,
    )
}

pub(crate) fn memory_read<A: Assembler>(
    c: &mut Context<'_, A>,
    size: u32,
    frame_index: u32,
) -> ReadId {
    single_read(
        c,
        size,
        crate::asm::OperandKind::Memory.mask(),
        0,
        FrameIndex::At(frame_index),
    )
}

pub(crate) fn multi_read<A: Assembler>(c: &mut Context<'_, A>, size: u32) -> ReadId {
    c.alloc_read(ReadData {
        value: None,
        event: None,
        event_next: None,
        size,
        kind: ReadKind::Multi {
            members: Vec::new(),
            targets: Vec::new(),
            next_target: 0,
            visited: false,
        },
    })
}

pub(crate) fn stub_read<A: Assembler>(c: &mut Context<'_, A>, size: u32) -> ReadId {
    c.alloc_read(ReadData {
        value: None,
        event: None,
        event_next: None,
        size,
        kind: ReadKind::Stub {
            next: None,
            bound: None,
            visited: false,
        },
    })
}

/// Narrows `con` by this read's constraint. Returns whether the read is
/// still satisfiable; unsatisfiable multi members and stub bindings are
/// pruned as a side effect.
pub(crate) fn read_intersect<A: Assembler>(
    c: &mut Context<'_, A>,
    r: ReadId,
    con: &mut Constraint,
) -> bool {
    enum Plan {
        Done(bool),
        Multi(Vec<ReadId>),
        Stub(ReadId),
    }

    let plan = match &mut c.read_mut(r).kind {
        ReadKind::Single {
            type_mask,
            register_mask,
            frame_index,
            ..
        } => {
            con.type_mask &= *type_mask;
            con.register_mask &= *register_mask;
            con.frame_index = con.frame_index.intersect(*frame_index);
            Plan::Done(true)
        }
        ReadKind::Multi {
            visited, members, ..
        } => {
            if *visited {
                Plan::Done(false)
            } else {
                *visited = true;
                Plan::Multi(members.clone())
            }
        }
        ReadKind::Stub { visited, bound, .. } => {
            if *visited {
                Plan::Done(true)
            } else if let Some(bound) = *bound {
                *visited = true;
                Plan::Stub(bound)
            } else {
                Plan::Done(true)
            }
        }
    };

    match plan {
        Plan::Done(result) => result,
        Plan::Multi(snapshot) => {
            let mut result = false;
            let mut kept = Vec::with_capacity(snapshot.len());
            for member in snapshot {
                if read_intersect(c, member, con) {
                    result = true;
                    kept.push(member);
                }
            }
            if let ReadKind::Multi {
                visited, members, ..
            } = &mut c.read_mut(r).kind
            {
                *members = kept;
                *visited = false;
            }
            result
        }
        Plan::Stub(bound) => {
            let still_valid = read_intersect(c, bound, con);
            if let ReadKind::Stub { visited, bound, .. } = &mut c.read_mut(r).kind {
                if !still_valid {
                    *bound = None;
                }
                *visited = false;
            }
            true
        }
    }
}

/// Whether the read still demands its value. Prunes dead multi members.
pub(crate) fn read_valid<A: Assembler>(c: &mut Context<'_, A>, r: ReadId) -> bool {
    enum Plan {
        Done(bool),
        Multi(Vec<ReadId>),
    }

    let plan = match &mut c.read_mut(r).kind {
        ReadKind::Single { .. } | ReadKind::Stub { .. } => Plan::Done(true),
        ReadKind::Multi {
            visited, members, ..
        } => {
            if *visited {
                Plan::Done(false)
            } else {
                *visited = true;
                Plan::Multi(members.clone())
            }
        }
    };

    match plan {
        Plan::Done(result) => result,
        Plan::Multi(snapshot) => {
            let mut result = false;
            let mut kept = Vec::with_capacity(snapshot.len());
            for member in snapshot {
                if read_valid(c, member) {
                    result = true;
                    kept.push(member);
                }
            }
            if let ReadKind::Multi {
                visited, members, ..
            } = &mut c.read_mut(r).kind
            {
                *members = kept;
                *visited = false;
            }
            result
        }
    }
}

pub(crate) fn valid<A: Assembler>(c: &mut Context<'_, A>, r: Option<ReadId>) -> bool {
    match r {
        Some(r) => read_valid(c, r),
        None => false,
    }
}

/// The effective constraint of this read, after multi/stub flattening.
pub(crate) fn read_constraint<A: Assembler>(c: &mut Context<'_, A>, r: ReadId) -> Constraint {
    let mut con = Constraint::any();
    read_intersect(c, r, &mut con);
    con
}

/// The cheapest live site satisfying this read, if any.
pub(crate) fn read_pick_site<A: Assembler>(
    c: &mut Context<'_, A>,
    r: ReadId,
    v: Value,
) -> Option<SiteId> {
    let con = read_constraint(c, r);
    pick_site(c, v, con.type_mask, con.register_mask, con.frame_index)
}

/// A fresh site satisfying this read, if one can be fabricated.
pub(crate) fn read_allocate_site<A: Assembler>(
    c: &mut Context<'_, A>,
    r: ReadId,
) -> Option<SiteId> {
    let con = read_constraint(c, r);
    allocate_site(c, con.type_mask, con.register_mask, con.frame_index)
}

/// Chains `r` after `tail` in a value's read order.
pub(crate) fn read_append<A: Assembler>(c: &mut Context<'_, A>, tail: ReadId, r: ReadId) {
    match &mut c.read_mut(tail).kind {
        ReadKind::Single { next, .. } | ReadKind::Stub { next, .. } => {
            debug_assert!(next.is_none());
            *next = Some(r);
        }
        ReadKind::Multi {
            members, targets, ..
        } => {
            members.push(r);
            let slot = targets
                .last_mut()
                .expect("multi read append without an allocated target");
            *slot = Some(r);
        }
    }
}

/// The read after this one in the value's chain. Multi reads have no
/// single successor; advancing one is a programmer error.
pub(crate) fn read_next<A: Assembler>(c: &Context<'_, A>, r: ReadId) -> Option<ReadId> {
    match &c.read(r).kind {
        ReadKind::Single { next, .. } | ReadKind::Stub { next, .. } => *next,
        ReadKind::Multi { .. } => panic!("multi read has no linear successor"),
    }
}

/// Reserves one more per-branch successor slot on a multi read.
pub(crate) fn multi_allocate_target<A: Assembler>(c: &mut Context<'_, A>, r: ReadId) {
    match &mut c.read_mut(r).kind {
        ReadKind::Multi { targets, .. } => targets.push(None),
        _ => panic!("allocate_target on a non-multi read"),
    }
}

/// Pops the next per-branch successor recorded on a multi read.
pub(crate) fn multi_next_target<A: Assembler>(
    c: &mut Context<'_, A>,
    r: ReadId,
) -> Option<ReadId> {
    match &mut c.read_mut(r).kind {
        ReadKind::Multi {
            targets,
            next_target,
            ..
        } => {
            let slot = targets[*next_target];
            *next_target += 1;
            slot
        }
        _ => panic!("next_target on a non-multi read"),
    }
}

/// Binds a stub read to the successor's first read once it is known.
pub(crate) fn stub_bind<A: Assembler>(c: &mut Context<'_, A>, r: ReadId, target: Option<ReadId>) {
    if let ReadKind::Stub { bound, .. } = &mut c.read_mut(r).kind {
        if bound.is_none() {
            *bound = target;
        }
    }
}

/// Appends `r` to `v`'s read chain and, when `event` is given, to that
/// event's input list.
pub(crate) fn add_read<A: Assembler>(
    c: &mut Context<'_, A>,
    event: Option<EventId>,
    v: Value,
    r: ReadId,
) {
    log::trace!("add read {:?} to {:?}", r, v);

    c.read_mut(r).value = Some(v);
    if let Some(event) = event {
        let head = c.event(event).reads;
        let read = c.read_mut(r);
        read.event = Some(event);
        read.event_next = head;
        let e = c.event_mut(event);
        e.reads = Some(r);
        e.read_count += 1;
    }

    match c.value(v).last_read {
        Some(last) => read_append(c, last, r),
        None => c.value_mut(v).reads = Some(r),
    }
    c.value_mut(v).last_read = Some(r);
}

#[cfg(test)]
mod tests {
    use super::FrameIndex::{Any, At, No};

    #[test]
    fn test_frame_index_intersection() {
        assert_eq!(No.intersect(Any), No);
        assert_eq!(Any.intersect(No), No);
        assert_eq!(No.intersect(At(3)), No);
        assert_eq!(Any.intersect(Any), Any);
        assert_eq!(Any.intersect(At(3)), At(3));
        assert_eq!(At(3).intersect(Any), At(3));
        assert_eq!(At(3).intersect(At(3)), At(3));
        assert_eq!(At(3).intersect(At(4)), No);
    }
}
