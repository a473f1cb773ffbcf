// Reconciliation across control-flow merges and forks. At a merge, every
// live frame value must occupy the same site on every incoming edge; the
// first predecessor compiled picks the layout and the shared table is
// propagated so later predecessors emit compatible code. At a fork, the
// current site layout is captured so every branch starts from it.

//! Junction and fork state.

use std::cell::RefCell;
use std::rc::Rc;

use crate::asm::{Assembler, OperandKind};
use crate::core::context::{Context, EventId, ForkId, LinkId};
use crate::core::event::append_dummy;
use crate::core::frame::{
    element_frame_index, frame_footprint, FrameElement, FrameIterator, Locals, StackRef,
};
use crate::core::read::{
    add_read, multi_allocate_target, multi_next_target, multi_read, read_allocate_site,
    read_pick_site, stub_bind, stub_read, FrameIndex, ReadId,
};
use crate::core::site::{
    copy_chain, frame_site, free_register_site, move_value, site_copy, site_freeze, site_match,
    site_thaw, SiteId,
};
use crate::core::value::{
    add_site, clear_sites, live, next_read, pick, remove_buddy, Value,
};

/// The junction site layout shared by every predecessor of one merge:
/// one site per frame slot. Sharing is by identity.
pub(crate) type JunctionSites = Rc<RefCell<Box<[Option<SiteId>]>>>;

#[derive(Clone, Copy)]
pub(crate) struct StubReadPair {
    pub value: Value,
    pub read: ReadId,
}

/// Stub reads installed on a junction predecessor, rebound once the
/// successor's real reads are known.
pub(crate) struct JunctionReads {
    pub reads: Vec<StubReadPair>,
}

#[derive(Clone, Copy)]
pub(crate) struct MultiReadPair {
    pub value: Value,
    pub read: ReadId,
}

/// Snapshot of the scan state at a fork, with one multi read per live
/// frame value so each branch's reads can be replayed in the second pass.
pub(crate) struct ForkData<'a> {
    pub stack: StackRef<'a>,
    pub locals: Locals<'a>,
    pub predecessor: Option<EventId>,
    pub logical_ip: Option<u32>,
    pub reads: Vec<MultiReadPair>,
}

fn frame_elements<'a, A: Assembler>(
    c: &Context<'a, A>,
    stack: StackRef<'a>,
    locals: Locals<'a>,
) -> Vec<FrameElement> {
    let mut elements = Vec::new();
    let mut it = FrameIterator::new(c, stack, locals);
    while it.has_more() {
        elements.push(it.next());
    }
    elements
}

fn allocate_targets<A: Assembler>(c: &mut Context<'_, A>, f: ForkId) {
    let pairs = c.fork(f).reads.clone();
    for pair in pairs {
        c.value_mut(pair.value).last_read = Some(pair.read);
        multi_allocate_target(c, pair.read);
    }
}

/// Snapshots the scan state and installs a multi read on every live frame
/// value; one target slot is reserved for the branch about to be scanned.
pub(crate) fn save_state<A: Assembler>(c: &mut Context<'_, A>) -> ForkId {
    let f = c.alloc_fork(ForkData {
        stack: c.stack,
        locals: c.locals,
        predecessor: c.predecessor,
        logical_ip: c.logical_ip,
        reads: Vec::new(),
    });

    if c.predecessor.is_some() {
        c.fork_state = Some(f);

        let mut pairs = Vec::new();
        for element in frame_elements(c, c.stack, c.locals) {
            let read = multi_read(c, element.size_in_bytes);
            log::trace!("add multi read {:?} to {:?}", read, element.value);
            add_read(c, None, element.value, read);
            pairs.push(MultiReadPair {
                value: element.value,
                read,
            });
        }
        c.fork_mut(f).reads = pairs;

        allocate_targets(c, f);
    }

    f
}

/// Reinstates a fork snapshot; the next branch scanned merges into the
/// same multi-read lists.
pub(crate) fn restore_state<A: Assembler>(c: &mut Context<'_, A>, f: ForkId) {
    if let Some(ip) = c.logical_ip {
        if c.instruction(ip).last_event.is_none() {
            append_dummy(c);
        }
    }

    let (stack, locals, predecessor, logical_ip) = {
        let fork = c.fork(f);
        (fork.stack, fork.locals, fork.predecessor, fork.logical_ip)
    };
    c.stack = stack;
    c.locals = locals;
    c.predecessor = predecessor;
    c.logical_ip = logical_ip;

    if c.predecessor.is_some() {
        c.fork_state = Some(f);
        allocate_targets(c, f);
    }
}

/// Installs a stub read for every live frame value on a just-created
/// junction edge.
pub(crate) fn populate_junction_reads<A: Assembler>(c: &mut Context<'_, A>, link: LinkId) {
    let mut pairs = Vec::new();
    for element in frame_elements(c, c.stack, c.locals) {
        let read = stub_read(c, element.size_in_bytes);
        log::trace!("add stub read {:?} to {:?}", read, element.value);
        add_read(c, None, element.value, read);
        pairs.push(StubReadPair {
            value: element.value,
            read,
        });
    }
    c.link_mut(link).junction_state = Some(JunctionReads { reads: pairs });
}

/// Binds every unbound stub read on the edge to its value's current first
/// read, so the compile pass sees one coherent chain.
pub(crate) fn update_junction_reads<A: Assembler>(c: &mut Context<'_, A>, link: LinkId) {
    let pairs = match &c.link(link).junction_state {
        Some(state) => state.reads.clone(),
        None => return,
    };
    for pair in pairs {
        let target = c.value(pair.value).reads;
        stub_bind(c, pair.read, target);
    }
}

/// Replays the state changes recorded on an edge: fork multi reads advance
/// to the next per-branch successor and junction stub reads are consumed.
pub(crate) fn visit_link<A: Assembler>(c: &mut Context<'_, A>, link: LinkId) {
    if let Some(f) = c.link(link).fork_state {
        let pairs = c.fork(f).reads.clone();
        for pair in pairs {
            let next = multi_next_target(c, pair.read);
            c.value_mut(pair.value).reads = next;
            if !live(c, pair.value) {
                clear_sites(c, pair.value);
            }
        }
    }

    if c.link(link).junction_state.is_some() {
        let pairs = c
            .link(link)
            .junction_state
            .as_ref()
            .map(|state| state.reads.clone())
            .unwrap_or_default();
        for pair in pairs {
            debug_assert_eq!(c.value(pair.value).reads, Some(pair.read));
            next_read(c, None, pair.value);
        }
    }
}

/// Chooses the site every incoming edge will leave this value in: a site
/// the value already occupies where possible, else a fresh register while
/// registers remain, else the frame slot itself.
fn pick_junction_site<A: Assembler>(
    c: &mut Context<'_, A>,
    v: Value,
    r: ReadId,
    frame_index: u32,
) -> SiteId {
    if c.available_register_count > 1 {
        let mut site = read_pick_site(c, r, v);
        if site.is_none() {
            site = pick(c, v, None).0;
        }
        if let Some(s) = site {
            if site_match(
                c,
                s,
                OperandKind::Memory.mask() | OperandKind::Register.mask(),
                crate::asm::ANY_REGISTER,
                FrameIndex::Any,
            ) {
                return s;
            }
        }
        if let Some(s) = read_allocate_site(c, r) {
            return s;
        }
        free_register_site(c, crate::asm::ANY_REGISTER)
    } else {
        frame_site(c, frame_index)
    }
}

/// Lands `v` in the junction site for its frame slot, fixing the slot's
/// layout if this predecessor is the first to resolve it.
fn resolve_junction_site<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    v: Value,
    site_index: usize,
    frame_index: u32,
    frozen: &mut Vec<SiteId>,
) {
    debug_assert!(
        site_index < frame_footprint(c, c.event(e).stack_after) as usize,
        "junction slot out of frame"
    );

    if !live(c, v) {
        return;
    }
    debug_assert!(c.value(v).sites.is_some());

    let table = c
        .event(e)
        .junction_sites
        .clone()
        .expect("junction resolution without a table");
    let original = table.borrow()[site_index];

    let r = c.value(v).reads.expect("live value without reads");
    let mut target = match original {
        Some(site) => site,
        None => pick_junction_site(c, v, r, frame_index),
    };

    let size = c.read(r).size;
    let (site, cost) = pick(c, v, Some(target));
    if cost != 0 {
        let stack_after = c.event(e).stack_after;
        let locals_after = c.event(e).locals_after.expect("junction before boundary");
        let site = site.expect("live value with no sites");
        move_value(c, stack_after, locals_after, size, v, site, target);
    } else {
        target = site.expect("live value with no sites");
    }

    if original.is_none() {
        frozen.push(target);
        site_freeze(c, target);
        let copy = site_copy(c, target);
        table.borrow_mut()[site_index] = Some(copy);
        log::trace!("resolved junction site {} for {:?}", frame_index, v);
    }
}

/// Shares one junction table across every predecessor of a merge,
/// recursively through the predecessors' other successors.
pub(crate) fn propagate_junction_sites<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    sites: &JunctionSites,
) {
    let mut pl = c.event(e).predecessors;
    while let Some(link) = pl {
        let p = c.link(link).predecessor;
        if c.event(p).junction_sites.is_none() {
            c.event_mut(p).junction_sites = Some(sites.clone());
            let mut sl = c.event(p).successors;
            while let Some(slink) = sl {
                let s = c.link(slink).successor;
                propagate_junction_sites(c, s, sites);
                sl = c.link(slink).next_successor;
            }
        }
        pl = c.link(link).next_predecessor;
    }
}

/// Populates the event's junction and saved site tables. Junction slots
/// already fixed by an earlier predecessor are honoured first; fresh slots
/// are chosen, frozen for the duration, and copied into the shared table.
pub(crate) fn populate_site_tables<A: Assembler>(c: &mut Context<'_, A>, e: EventId) {
    let footprint = frame_footprint(c, c.event(e).stack_after) as usize;

    let mut frozen: Vec<SiteId> = Vec::new();

    if c.event(e).junction_sites.is_none() {
        let mut sl = c.event(e).successors;
        while let Some(link) = sl {
            let s = c.link(link).successor;
            let merging = c
                .event(s)
                .predecessors
                .map(|l| c.link(l).next_predecessor.is_some())
                .unwrap_or(false);
            if merging {
                let sites: JunctionSites =
                    Rc::new(RefCell::new(vec![None; footprint].into_boxed_slice()));
                propagate_junction_sites(c, s, &sites);
                break;
            }
            sl = c.link(link).next_successor;
        }
    } else {
        let table = c.event(e).junction_sites.clone().unwrap();
        for element in after_elements(c, e) {
            let site_index = element.local_index as usize;
            if table.borrow()[site_index].is_some() {
                let fi = element_frame_index(c, &element);
                resolve_junction_site(c, e, element.value, site_index, fi, &mut frozen);
            }
        }
    }

    if let Some(table) = c.event(e).junction_sites.clone() {
        for element in after_elements(c, e) {
            let site_index = element.local_index as usize;
            if table.borrow()[site_index].is_none() {
                let fi = element_frame_index(c, &element);
                resolve_junction_site(c, e, element.value, site_index, fi, &mut frozen);
            }
        }

        log::debug!(
            "resolved junction sites at {}",
            c.event(e).logical_instruction
        );

        for element in after_elements(c, e) {
            remove_buddy(c, element.value);
        }
    }

    while let Some(s) = frozen.pop() {
        site_thaw(c, s);
    }

    let forking = c
        .event(e)
        .successors
        .map(|l| c.link(l).next_successor.is_some())
        .unwrap_or(false);
    if forking {
        let mut saved: Vec<Option<SiteId>> = vec![None; footprint];
        for element in after_elements(c, e) {
            let chain = c.value(element.value).sites;
            saved[element.local_index as usize] = copy_chain(c, chain);
        }
        c.event_mut(e).saved_sites = Some(saved.into_boxed_slice());
        log::debug!(
            "captured saved sites at {}",
            c.event(e).logical_instruction
        );
    }
}

fn after_elements<A: Assembler>(c: &Context<'_, A>, e: EventId) -> Vec<FrameElement> {
    let stack_after = c.event(e).stack_after;
    let locals_after = c
        .event(e)
        .locals_after
        .expect("site tables before an instruction boundary");
    frame_elements(c, stack_after, locals_after)
}

/// Replaces the live sites of every frame value at a merge entry with the
/// layout committed by the first predecessor.
pub(crate) fn set_sites<A: Assembler>(c: &mut Context<'_, A>, e: EventId, sites: &[Option<SiteId>]) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;
    let elements = frame_elements(c, stack_before, locals_before);

    for element in &elements {
        clear_sites(c, element.value);
    }

    for element in elements {
        if let Some(chain) = sites[element.local_index as usize] {
            if live(c, element.value) {
                set_value_sites(c, e, element.value, Some(chain));
            }
        }
    }
}

fn set_value_sites<A: Assembler>(
    c: &mut Context<'_, A>,
    e: EventId,
    v: Value,
    mut chain: Option<SiteId>,
) {
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;
    while let Some(s) = chain {
        chain = c.site(s).next;
        let size = {
            let first = c.value(v).reads.expect("live value without reads");
            c.read(first).size
        };
        let copy = site_copy(c, s);
        add_site(c, stack_before, locals_before, size, v, copy);
    }
}
