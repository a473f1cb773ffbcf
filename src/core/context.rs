// Per-compilation state hub. Every node of the event graph lives in one of
// the typed stores below and is addressed by a small id, so the cyclic
// structures (buddy rings, predecessor/successor links) need no ownership
// story beyond "the context owns everything". The arena holds the
// stack/locals snapshots whose sharing the algorithm relies on.

//! The compilation context.

use std::fmt;
use std::rc::Rc;

use bumpalo::Bump;

use crate::asm::{Architecture, Assembler, Client};
use crate::core::event::{EventData, LinkData};
use crate::core::frame::{LocalSlot, Locals, StackRef};
use crate::core::junction::ForkData;
use crate::core::read::{ReadData, ReadId};
use crate::core::site::{SiteData, SiteId, SiteKind};
use crate::core::value::{Value, ValueData};
use crate::promise::{CodeLayout, Promise, PromiseCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EventId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LinkId(pub(crate) u32);

/// Stable identity of an architectural register. Identities survive the
/// physical swaps the allocator performs; the current physical number is
/// `RegisterData::number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RegId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ForkId(pub(crate) u32);

/// One architectural register.
pub(crate) struct RegisterData {
    pub value: Option<Value>,
    pub site: Option<SiteId>,
    pub number: u8,
    pub size: u32,
    /// Memory sites using this register as base or index.
    pub ref_count: u32,
    /// Pins against eviction while a source is being consumed.
    pub freeze_count: u32,
    pub reserved: bool,
}

/// One word-sized frame slot.
#[derive(Default)]
pub(crate) struct FrameResourceData {
    pub value: Option<Value>,
    pub site: Option<SiteId>,
    pub size: u32,
}

/// Result of folding a compare whose operands are both constants, consumed
/// by the next branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstantCompare {
    None,
    Less,
    Greater,
    Equal,
}

/// One logical-instruction boundary.
pub(crate) struct LogicalInstruction<'a> {
    pub index: u32,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub stack: StackRef<'a>,
    pub locals: Locals<'a>,
    pub machine_offset: Option<Promise>,
}

/// Compilation counters, in the spirit of a session statistics block.
#[derive(Debug, Default, Clone)]
pub struct CompileStats {
    pub events_compiled: u32,
    pub registers_acquired: u32,
    /// Values demoted to their frame save slot to free a register.
    pub spills: u32,
    /// Times a frozen register was handed out by a singleton-mask pick.
    pub frozen_picks: u32,
    pub constant_folded_branches: u32,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation statistics:")?;
        writeln!(f, "  Events compiled: {}", self.events_compiled)?;
        writeln!(f, "  Registers acquired: {}", self.registers_acquired)?;
        writeln!(f, "  Spills: {}", self.spills)?;
        writeln!(f, "  Frozen picks: {}", self.frozen_picks)?;
        writeln!(
            f,
            "  Constant-folded branches: {}",
            self.constant_folded_branches
        )
    }
}

pub(crate) struct Context<'a, A: Assembler> {
    pub arena: &'a Bump,
    pub arch: &'a dyn Architecture,
    pub asm: A,
    pub client: &'a dyn Client,
    pub layout: Rc<CodeLayout>,

    values: Vec<ValueData>,
    sites: Vec<SiteData>,
    reads: Vec<ReadData>,
    events: Vec<EventData<'a>>,
    links: Vec<LinkData>,
    forks: Vec<ForkData<'a>>,

    registers: Vec<RegisterData>,
    by_number: Vec<RegId>,
    pub frame_resources: Vec<FrameResourceData>,

    pub stack: StackRef<'a>,
    pub locals: Locals<'a>,
    pub predecessor: Option<EventId>,
    pub logical_code: Vec<Option<LogicalInstruction<'a>>>,
    pub ip_slots: Vec<Rc<PromiseCell>>,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub fork_state: Option<ForkId>,
    pub logical_ip: Option<u32>,

    pub constants: Vec<Promise>,
    pub machine_code_size: u32,
    pub parameter_footprint: u32,
    pub local_footprint: u32,
    pub aligned_frame_size: u32,
    pub available_register_count: u32,
    pub constant_compare: ConstantCompare,
    pub stats: CompileStats,
}

impl<'a, A: Assembler> Context<'a, A> {
    pub fn new(
        arena: &'a Bump,
        arch: &'a dyn Architecture,
        asm: A,
        client: &'a dyn Client,
    ) -> Self {
        let count = arch.register_count();
        let mut registers = Vec::with_capacity(count);
        let mut by_number = Vec::with_capacity(count);
        let mut available = count as u32;
        for number in 0..count {
            let reserved = arch.reserved(number as u8);
            if reserved {
                available -= 1;
            }
            registers.push(RegisterData {
                value: None,
                site: None,
                number: number as u8,
                size: 0,
                ref_count: 0,
                freeze_count: 0,
                reserved,
            });
            by_number.push(RegId(number as u32));
        }

        Self {
            arena,
            arch,
            asm,
            client,
            layout: CodeLayout::new(arch.word_size()),
            values: Vec::new(),
            sites: Vec::new(),
            reads: Vec::new(),
            events: Vec::new(),
            links: Vec::new(),
            forks: Vec::new(),
            registers,
            by_number,
            frame_resources: Vec::new(),
            stack: None,
            locals: &[],
            predecessor: None,
            logical_code: Vec::new(),
            ip_slots: Vec::new(),
            first_event: None,
            last_event: None,
            fork_state: None,
            logical_ip: None,
            constants: Vec::new(),
            machine_code_size: 0,
            parameter_footprint: 0,
            local_footprint: 0,
            aligned_frame_size: 0,
            available_register_count: available,
            constant_compare: ConstantCompare::None,
            stats: CompileStats::default(),
        }
    }

    /// Sizes the per-procedure tables. Must run before any event is
    /// appended.
    pub fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        self.parameter_footprint = parameter_footprint;
        self.local_footprint = local_footprint;
        self.aligned_frame_size = aligned_frame_size;

        let slots = (aligned_frame_size + parameter_footprint) as usize;
        self.frame_resources = std::iter::repeat_with(FrameResourceData::default)
            .take(slots)
            .collect();

        self.logical_code = std::iter::repeat_with(|| None)
            .take(logical_code_length as usize)
            .collect();
        self.ip_slots = std::iter::repeat_with(PromiseCell::empty)
            .take(logical_code_length as usize)
            .collect();

        self.locals = self
            .arena
            .alloc_slice_fill_with(local_footprint as usize, |_| {
                std::cell::Cell::new(LocalSlot::default())
            });
    }

    pub fn alloc_value(&mut self, site: Option<SiteId>, target: Option<SiteId>) -> Value {
        let v = Value(self.values.len() as u32);
        self.values.push(ValueData {
            reads: None,
            last_read: None,
            sites: site,
            source: None,
            target,
            buddy: v,
            local: false,
        });
        v
    }

    pub fn alloc_site(&mut self, kind: SiteKind) -> SiteId {
        let s = SiteId(self.sites.len() as u32);
        self.sites.push(SiteData { kind, next: None });
        s
    }

    pub fn alloc_read(&mut self, data: ReadData) -> ReadId {
        let r = ReadId(self.reads.len() as u32);
        self.reads.push(data);
        r
    }

    pub fn alloc_event(&mut self, data: EventData<'a>) -> EventId {
        let e = EventId(self.events.len() as u32);
        self.events.push(data);
        e
    }

    pub fn alloc_link(&mut self, data: LinkData) -> LinkId {
        let l = LinkId(self.links.len() as u32);
        self.links.push(data);
        l
    }

    pub fn alloc_fork(&mut self, data: ForkData<'a>) -> ForkId {
        let f = ForkId(self.forks.len() as u32);
        self.forks.push(data);
        f
    }

    pub fn value(&self, v: Value) -> &ValueData {
        &self.values[v.0 as usize]
    }

    pub fn value_mut(&mut self, v: Value) -> &mut ValueData {
        &mut self.values[v.0 as usize]
    }

    pub fn site(&self, s: SiteId) -> &SiteData {
        &self.sites[s.0 as usize]
    }

    pub fn site_mut(&mut self, s: SiteId) -> &mut SiteData {
        &mut self.sites[s.0 as usize]
    }

    pub fn read(&self, r: ReadId) -> &ReadData {
        &self.reads[r.0 as usize]
    }

    pub fn read_mut(&mut self, r: ReadId) -> &mut ReadData {
        &mut self.reads[r.0 as usize]
    }

    pub fn event(&self, e: EventId) -> &EventData<'a> {
        &self.events[e.0 as usize]
    }

    pub fn event_mut(&mut self, e: EventId) -> &mut EventData<'a> {
        &mut self.events[e.0 as usize]
    }

    pub fn link(&self, l: LinkId) -> &LinkData {
        &self.links[l.0 as usize]
    }

    pub fn link_mut(&mut self, l: LinkId) -> &mut LinkData {
        &mut self.links[l.0 as usize]
    }

    pub fn fork(&self, f: ForkId) -> &ForkData<'a> {
        &self.forks[f.0 as usize]
    }

    pub fn fork_mut(&mut self, f: ForkId) -> &mut ForkData<'a> {
        &mut self.forks[f.0 as usize]
    }

    pub fn register(&self, r: RegId) -> &RegisterData {
        &self.registers[r.0 as usize]
    }

    pub fn register_mut(&mut self, r: RegId) -> &mut RegisterData {
        &mut self.registers[r.0 as usize]
    }

    /// The register currently occupying physical slot `number`.
    pub fn register_by_number(&self, number: u8) -> RegId {
        self.by_number[number as usize]
    }

    /// Exchanges the physical slots of two registers.
    pub fn swap_numbers(&mut self, a: RegId, b: RegId) {
        let an = self.registers[a.0 as usize].number;
        let bn = self.registers[b.0 as usize].number;
        self.registers[a.0 as usize].number = bn;
        self.registers[b.0 as usize].number = an;
        self.by_number[an as usize] = b;
        self.by_number[bn as usize] = a;
    }

    pub fn instruction(&self, ip: u32) -> &LogicalInstruction<'a> {
        self.logical_code[ip as usize]
            .as_ref()
            .expect("logical instruction not started")
    }

    pub fn instruction_mut(&mut self, ip: u32) -> &mut LogicalInstruction<'a> {
        self.logical_code[ip as usize]
            .as_mut()
            .expect("logical instruction not started")
    }
}
