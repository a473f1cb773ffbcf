//! Values: virtual operands and their live site sets.
//!
//! A value owns a list of equivalent live sites plus an ordered chain of
//! reads. Values forced to share storage are spliced into a circular buddy
//! ring; a value is live while any ring member still has a valid read, and
//! site lookup walks the whole ring.

use smallvec::SmallVec;

use crate::asm::Assembler;
use crate::core::context::Context;
use crate::core::frame::{Locals, StackRef};
use crate::core::read::{
    self, read_allocate_site, read_next, FrameIndex, ReadId,
};
use crate::core::site::{
    copy_cost, describe_site, free_register_site, site_acquire, site_match, site_release, SiteId,
};
use crate::core::context::EventId;

/// A virtual operand handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(pub(crate) u32);

pub(crate) struct ValueData {
    pub reads: Option<ReadId>,
    pub last_read: Option<ReadId>,
    pub sites: Option<SiteId>,
    /// Site chosen for the event currently compiling.
    pub source: Option<SiteId>,
    /// Optional placement hint.
    pub target: Option<SiteId>,
    /// Next member of the circular buddy ring; self when alone.
    pub buddy: Value,
    /// Whether the value is referenced from the locals array or stack.
    pub local: bool,
}

pub(crate) fn new_value<A: Assembler>(
    c: &mut Context<'_, A>,
    site: Option<SiteId>,
    target: Option<SiteId>,
) -> Value {
    c.alloc_value(site, target)
}

/// All ring members starting at `v`.
pub(crate) fn ring<A: Assembler>(c: &Context<'_, A>, v: Value) -> SmallVec<[Value; 4]> {
    let mut members = SmallVec::new();
    members.push(v);
    let mut p = c.value(v).buddy;
    while p != v {
        members.push(p);
        p = c.value(p).buddy;
    }
    members
}

/// Every live site across the buddy ring, with the ring member owning it.
pub(crate) fn all_sites<A: Assembler>(
    c: &Context<'_, A>,
    v: Value,
) -> SmallVec<[(Value, SiteId); 8]> {
    let mut sites = SmallVec::new();
    for member in ring(c, v) {
        let mut s = c.value(member).sites;
        while let Some(site) = s {
            sites.push((member, site));
            s = c.site(site).next;
        }
    }
    sites
}

/// Membership test against `v`'s own site list only.
pub(crate) fn find_site<A: Assembler>(c: &Context<'_, A>, v: Value, s: SiteId) -> bool {
    let mut cursor = c.value(v).sites;
    while let Some(site) = cursor {
        if site == s {
            return true;
        }
        cursor = c.site(site).next;
    }
    false
}

/// Attaches a site to a value, acquiring its resources. Inserting a site
/// already present is impossible; the membership filter enforces it.
pub(crate) fn add_site<'a, A: Assembler>(
    c: &mut Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
    size: u32,
    v: Value,
    s: SiteId,
) {
    if !find_site(c, v, s) {
        log::trace!("add site {} to {:?}", describe_site(c, s), v);
        site_acquire(c, stack, locals, size, Some(v), s);
        debug_assert!(!find_site(c, v, s));
        let head = c.value(v).sites;
        c.site_mut(s).next = head;
        c.value_mut(v).sites = Some(s);
    }
}

/// Detaches a site, searching the whole buddy ring, and releases it.
pub(crate) fn remove_site<A: Assembler>(c: &mut Context<'_, A>, v: Value, s: SiteId) {
    for member in ring(c, v) {
        let mut prev: Option<SiteId> = None;
        let mut cursor = c.value(member).sites;
        while let Some(site) = cursor {
            let next = c.site(site).next;
            if site == s {
                log::trace!("remove site {} from {:?}", describe_site(c, s), v);
                match prev {
                    Some(p) => c.site_mut(p).next = next,
                    None => c.value_mut(member).sites = next,
                }
                site_release(c, s);
                return;
            }
            prev = Some(site);
            cursor = next;
        }
    }
}

/// Releases and drops every site on `v`'s own list.
pub(crate) fn clear_sites<A: Assembler>(c: &mut Context<'_, A>, v: Value) {
    log::trace!("clear sites for {:?}", v);
    let mut cursor = c.value(v).sites;
    while let Some(site) = cursor {
        cursor = c.site(site).next;
        site_release(c, site);
    }
    c.value_mut(v).sites = None;
}

/// Whether any ring member still has a valid read.
pub(crate) fn live<A: Assembler>(c: &mut Context<'_, A>, v: Value) -> bool {
    let first = c.value(v).reads;
    if read::valid(c, first) {
        return true;
    }
    let mut p = c.value(v).buddy;
    while p != v {
        let reads = c.value(p).reads;
        if read::valid(c, reads) {
            return true;
        }
        p = c.value(p).buddy;
    }
    false
}

/// Whether the value stays live once its current read is consumed.
pub(crate) fn live_next<A: Assembler>(c: &mut Context<'_, A>, v: Value) -> bool {
    let first = c.value(v).reads.expect("live_next on a value with no reads");
    let next = read_next(c, first);
    if read::valid(c, next) {
        return true;
    }
    let mut p = c.value(v).buddy;
    while p != v {
        let reads = c.value(p).reads;
        if read::valid(c, reads) {
            return true;
        }
        p = c.value(p).buddy;
    }
    false
}

/// Consumes the value's current read; a value with no live reads left in
/// its ring loses all sites.
pub(crate) fn next_read<A: Assembler>(c: &mut Context<'_, A>, e: Option<EventId>, v: Value) {
    let first = c.value(v).reads.expect("next_read on a value with no reads");
    debug_assert_eq!(c.read(first).event, e);
    log::trace!("pop read {:?} from {:?}", first, v);

    let next = read_next(c, first);
    c.value_mut(v).reads = next;
    if !live(c, v) {
        clear_sites(c, v);
    }
}

/// Splices `v` out of its buddy ring, leaving it alone.
pub(crate) fn remove_buddy<A: Assembler>(c: &mut Context<'_, A>, v: Value) {
    let next = c.value(v).buddy;
    if next != v {
        log::trace!("remove {:?} from its buddy ring", v);
        c.value_mut(v).buddy = v;
        let mut p = next;
        while c.value(p).buddy != v {
            p = c.value(p).buddy;
        }
        c.value_mut(p).buddy = next;
    }
}

/// The cheapest live site matching a constraint, walking the buddy ring.
pub(crate) fn pick_site<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> Option<SiteId> {
    let mut best = None;
    let mut best_cost = u32::MAX;
    for (_, s) in all_sites(c, v) {
        if site_match(c, s, type_mask, register_mask, frame_index) {
            let cost = copy_cost(c, s, None);
            if cost < best_cost {
                best = Some(s);
                best_cost = cost;
            }
        }
    }
    best
}

/// The live site cheapest to copy into `target`, with its cost.
pub(crate) fn pick<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
    target: Option<SiteId>,
) -> (Option<SiteId>, u32) {
    let mut best = None;
    let mut best_cost = u32::MAX;
    for (_, s) in all_sites(c, v) {
        let cost = copy_cost(c, s, target);
        if cost < best_cost {
            best = Some(s);
            best_cost = cost;
        }
    }
    (best, best_cost)
}

/// The value's placement hint, or a site fabricated from the given read.
pub(crate) fn target_or_null_for_read<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
    r: ReadId,
) -> Option<SiteId> {
    match c.value(v).target {
        Some(target) => Some(target),
        None => read_allocate_site(c, r),
    }
}

/// The value's placement hint, or a site fabricated from its next read.
pub(crate) fn target_or_null<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
) -> Option<SiteId> {
    if let Some(target) = c.value(v).target {
        return Some(target);
    }
    if live(c, v) {
        let first = c.value(v).reads.expect("live value with no reads");
        return read_allocate_site(c, first);
    }
    None
}

pub(crate) fn target_or_register<A: Assembler>(c: &mut Context<'_, A>, v: Value) -> SiteId {
    match target_or_null(c, v) {
        Some(s) => s,
        None => free_register_site(c, crate::asm::ANY_REGISTER),
    }
}

pub(crate) fn target_or_register_for_read<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
    r: ReadId,
) -> SiteId {
    match target_or_null_for_read(c, v, r) {
        Some(s) => s,
        None => free_register_site(c, crate::asm::ANY_REGISTER),
    }
}

/// The first constant site on the value's own list, if any.
pub(crate) fn find_constant_site<A: Assembler>(
    c: &Context<'_, A>,
    v: Value,
) -> Option<SiteId> {
    let mut cursor = c.value(v).sites;
    while let Some(site) = cursor {
        if matches!(
            c.site(site).kind,
            crate::core::site::SiteKind::Constant { .. }
        ) {
            return Some(site);
        }
        cursor = c.site(site).next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::read::single_read;
    use crate::core::site::constant_site;
    use crate::promise::Promise;
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

    fn splice(c: &mut Context<'_, RecordingAssembler>, original: Value, buddy: Value) {
        c.value_mut(buddy).buddy = original;
        let mut p = original;
        while c.value(p).buddy != original {
            p = c.value(p).buddy;
        }
        c.value_mut(p).buddy = buddy;
    }

    fn any_read(c: &mut Context<'_, RecordingAssembler>) -> crate::core::read::ReadId {
        single_read(
            c,
            8,
            crate::asm::ANY_OPERAND,
            crate::asm::ANY_REGISTER,
            crate::core::read::FrameIndex::Any,
        )
    }

    #[test]
    fn test_liveness_follows_reads() {
        with_context(|c| {
            let v = c.alloc_value(None, None);
            assert!(!live(c, v));

            let r = any_read(c);
            crate::core::read::add_read(c, None, v, r);
            assert!(live(c, v));

            let site = constant_site(c, Promise::Resolved(7));
            add_site(c, None, &[], 8, v, site);
            assert!(c.value(v).sites.is_some());

            next_read(c, None, v);
            assert!(!live(c, v));
            assert!(c.value(v).sites.is_none());
        });
    }

    #[test]
    fn test_buddy_ring_shares_liveness_and_sites() {
        with_context(|c| {
            let a = c.alloc_value(None, None);
            let b = c.alloc_value(None, None);
            splice(c, a, b);
            assert_eq!(ring(c, a).len(), 2);

            let r = any_read(c);
            crate::core::read::add_read(c, None, b, r);
            assert!(live(c, a));

            let site = constant_site(c, Promise::Resolved(7));
            add_site(c, None, &[], 8, b, site);
            assert_eq!(
                pick_site(
                    c,
                    a,
                    crate::asm::ANY_OPERAND,
                    crate::asm::ANY_REGISTER,
                    crate::core::read::FrameIndex::Any
                ),
                Some(site)
            );
        });
    }

    #[test]
    fn test_remove_buddy_leaves_singletons() {
        with_context(|c| {
            let a = c.alloc_value(None, None);
            let b = c.alloc_value(None, None);
            let d = c.alloc_value(None, None);
            splice(c, a, b);
            splice(c, a, d);
            assert_eq!(ring(c, a).len(), 3);

            remove_buddy(c, d);
            assert_eq!(ring(c, a).len(), 2);
            assert_eq!(ring(c, d).len(), 1);

            remove_buddy(c, b);
            assert_eq!(ring(c, a).len(), 1);
            assert_eq!(ring(c, b).len(), 1);
        });
    }

    #[test]
    fn test_add_site_is_idempotent() {
        with_context(|c| {
            let v = c.alloc_value(None, None);
            let site = constant_site(c, Promise::Resolved(7));
            add_site(c, None, &[], 8, v, site);
            add_site(c, None, &[], 8, v, site);
            assert_eq!(all_sites(c, v).len(), 1);
            remove_site(c, v, site);
            assert!(c.value(v).sites.is_none());
        });
    }
}
