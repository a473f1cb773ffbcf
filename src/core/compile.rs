//! The compile pass: walks the event graph in scan order, resolves every
//! read to a concrete source site, reconciles site layouts at forks and
//! merges, and drives the assembler. Machine blocks are laid out as events
//! emit and resolved to final offsets in a forward fixup walk.

use smallvec::SmallVec;

use crate::asm::{Assembler, Block};
use crate::core::context::{Context, EventId};
use crate::core::event::{append_dummy, compile_event, event_name, is_branch};
use crate::core::junction::{
    populate_site_tables, set_sites, update_junction_reads, visit_link,
};
use crate::core::read::{read_allocate_site, read_pick_site, ReadId};
use crate::core::site::{move_value, site_freeze, site_thaw, SiteId};
use crate::core::value::{pick, Value};

struct BlockData<B> {
    next_instruction: Option<u32>,
    assembler_block: Option<B>,
    start: u32,
}

/// Chooses the source site for one read, emitting a move from the best
/// existing site when nothing live satisfies the constraint.
fn read_source<A: Assembler>(c: &mut Context<'_, A>, e: EventId, r: ReadId, v: Value) -> SiteId {
    log::trace!("read source for {:?}", v);

    if let Some(site) = read_pick_site(c, r, v) {
        return site;
    }

    let target = read_allocate_site(c, r).expect("no admissible site for read");
    let (site, cost) = pick(c, v, Some(target));
    debug_assert!(cost > 0);
    let site = site.expect("read of a value with no live sites");
    let size = c.read(r).size;
    let stack_before = c.event(e).stack_before;
    let locals_before = c.event(e).locals_before;
    move_value(c, stack_before, locals_before, size, v, site, target);
    target
}

/// Resolves a source for every read of the event. Each resolved source is
/// frozen until the whole read set is resolved, so resolving one read
/// cannot evict another's source.
fn populate_sources<A: Assembler>(c: &mut Context<'_, A>, e: EventId) {
    let mut frozen: SmallVec<[SiteId; 8]> =
        SmallVec::with_capacity(c.event(e).read_count as usize);

    let mut cursor = c.event(e).reads;
    while let Some(r) = cursor {
        let v = c.read(r).value.expect("event read without a value");
        let source = read_source(c, e, r, v);
        c.value_mut(v).source = Some(source);
        frozen.push(source);
        site_freeze(c, source);
        cursor = c.read(r).event_next;
    }

    while let Some(s) = frozen.pop() {
        site_thaw(c, s);
    }
}

fn next_logical_instruction<A: Assembler>(c: &Context<'_, A>, index: u32) -> Option<u32> {
    for n in (index + 1) as usize..c.logical_code.len() {
        if let Some(instruction) = &c.logical_code[n] {
            return Some(instruction.index);
        }
    }
    None
}

fn last_predecessor<A: Assembler>(
    c: &Context<'_, A>,
    mut link: crate::core::context::LinkId,
) -> crate::core::context::LinkId {
    while let Some(next) = c.link(link).next_predecessor {
        link = next;
    }
    link
}

/// Runs the second pass over the whole event graph and returns the total
/// machine-code size.
pub(crate) fn run<A: Assembler>(c: &mut Context<'_, A>) -> u32 {
    if let Some(ip) = c.logical_ip {
        if c.instruction(ip).last_event.is_none() {
            append_dummy(c);
        }
    }

    let first_event = match c.first_event {
        Some(e) => e,
        None => return 0,
    };

    let mut blocks: Vec<BlockData<A::Block>> = vec![BlockData {
        next_instruction: None,
        assembler_block: None,
        start: 0,
    }];
    let mut current_block: u32 = 0;

    c.asm.allocate_frame(c.aligned_frame_size);

    let mut cursor = Some(first_event);
    while let Some(e) = cursor {
        log::debug!(
            "compile {} at {}",
            event_name(&c.event(e).kind),
            c.event(e).logical_instruction
        );
        c.stats.events_compiled += 1;
        c.event_mut(e).block = Some(current_block);

        c.stack = c.event(e).stack_before;
        c.locals = c.event(e).locals_before;

        let ip = c.event(e).logical_instruction;
        if c.instruction(ip).machine_offset.is_none() {
            let offset = c.asm.offset();
            c.instruction_mut(ip).machine_offset = Some(offset.clone());
            c.ip_slots[ip as usize].fill(offset);
        }

        if let Some(head) = c.event(e).predecessors {
            visit_link(c, last_predecessor(c, head));

            let first = c.link(head).predecessor;
            if c.link(head).next_predecessor.is_some() {
                let mut pl = Some(head);
                while let Some(link) = pl {
                    let next = c.link(link).next_predecessor;
                    if next.is_some() {
                        update_junction_reads(c, link);
                    }
                    pl = next;
                }

                let table = c
                    .event(first)
                    .junction_sites
                    .clone()
                    .expect("merge predecessor without junction sites");
                let snapshot: Vec<Option<SiteId>> = table.borrow().to_vec();
                log::debug!("set sites from junction tables at {}", ip);
                set_sites(c, e, &snapshot);
            } else {
                let forked = c
                    .event(first)
                    .successors
                    .map(|l| c.link(l).next_successor.is_some())
                    .unwrap_or(false);
                if forked {
                    let saved: Vec<Option<SiteId>> = c
                        .event(first)
                        .saved_sites
                        .as_ref()
                        .expect("fork predecessor without saved sites")
                        .to_vec();
                    log::debug!("set sites from saved sites at {}", ip);
                    set_sites(c, e, &saved);
                }
            }
        }

        populate_sources(c, e);

        let branch = is_branch(&c.event(e).kind);
        if branch && c.event(e).successors.is_some() {
            populate_site_tables(c, e);
        }

        compile_event(c, e);

        if !branch && c.event(e).successors.is_some() {
            populate_site_tables(c, e);
        }

        let visit_links = std::mem::take(&mut c.event_mut(e).visit_links);
        for link in visit_links {
            visit_link(c, link);
        }

        let promises = std::mem::take(&mut c.event_mut(e).promises);
        for promise in promises {
            let offset = c.asm.offset();
            promise.fill(offset);
        }

        let next_event = c.event(e).next;
        let next_instruction = next_logical_instruction(c, ip);
        let close_block = match next_event {
            None => true,
            Some(n) => {
                let next_ip = c.event(n).logical_instruction;
                next_ip != ip
                    && (c.instruction(ip).last_event == Some(e)
                        || Some(next_ip) != next_instruction)
            }
        };
        if close_block {
            let block = &mut blocks[current_block as usize];
            block.next_instruction = next_instruction;
            block.assembler_block = Some(c.asm.end_block(next_event.is_some()));
            if next_event.is_some() {
                blocks.push(BlockData {
                    next_instruction: None,
                    assembler_block: None,
                    start: 0,
                });
                current_block += 1;
            }
        }

        cursor = next_event;
    }

    // Forward fixup walk in logical order: each resolve fixes a block's
    // start offset and yields its successor's. Scan order and layout
    // order differ when branches were scanned through fork snapshots.
    let mut index = 0usize;
    loop {
        match blocks[index].next_instruction {
            Some(ip) => {
                let head = c
                    .instruction(ip)
                    .first_event
                    .expect("instruction with no events");
                let next_index = c.event(head).block.expect("event with no block") as usize;
                debug_assert_ne!(next_index, index);

                let start = blocks[index].start;
                let mut current = blocks[index]
                    .assembler_block
                    .take()
                    .expect("unresolved block");
                let end = current.resolve(start, blocks[next_index].assembler_block.as_mut());
                blocks[index].assembler_block = Some(current);
                blocks[next_index].start = end;
                index = next_index;
            }
            None => {
                let start = blocks[index].start;
                let mut current = blocks[index]
                    .assembler_block
                    .take()
                    .expect("unresolved block");
                let end = current.resolve(start, None);
                blocks[index].assembler_block = Some(current);
                return end;
            }
        }
    }
}
