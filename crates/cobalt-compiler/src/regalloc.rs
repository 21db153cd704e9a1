//! Linear-scan register allocation with farthest-next-use spilling.
//!
//! The allocator is the single source of truth for the register file:
//! `regs` maps each physical register to the value it holds, and
//! `values` maps each value to its registers, spill slot, and the
//! sorted list of its upcoming uses (built by a backward pass over the
//! linearized instruction stream before emission starts).
//!
//! Fifteen registers (`r0..r14`) are allocatable; `r15` is the VM's
//! last-result register and doubles as the emitter's scratch. When no
//! register is free, the victim is the unpinned register whose held
//! value has the farthest next use — ties break toward the lowest
//! register index, so allocation is deterministic.

use std::collections::{HashMap, VecDeque};

use cobalt_ir::ValueId;

use crate::emit::{emit_load_slot, emit_mov, emit_store_slot};

/// Registers the allocator may hand out.
pub const ALLOCATABLE: u8 = 15;

/// Per-value location and upcoming-use state.
#[derive(Debug, Default, Clone)]
struct ValueState {
    reg: Option<u8>,
    spill_slot: Option<u16>,
    /// Positions (linearized instruction indices) of upcoming uses,
    /// front first.
    uses: VecDeque<u32>,
}

#[derive(Debug)]
pub struct Allocator {
    regs: [Option<ValueId>; ALLOCATABLE as usize],
    values: HashMap<ValueId, ValueState>,
    next_spill_slot: u16,
}

impl Allocator {
    /// `spill_base` is the first frame slot free for spills (after
    /// stack-passed arguments, allocas, and cross-block homes).
    pub fn new(spill_base: u16) -> Self {
        Self {
            regs: [None; ALLOCATABLE as usize],
            values: HashMap::new(),
            next_spill_slot: spill_base,
        }
    }

    pub fn spill_slots_used(&self) -> u16 {
        self.next_spill_slot
    }

    /// Records the upcoming uses of `value`, front-to-back sorted.
    pub fn set_uses(&mut self, value: ValueId, uses: VecDeque<u32>) {
        self.values.entry(value).or_default().uses = uses;
    }

    /// Pins a value to a register without emitting anything (entry
    /// parameters arrive pre-placed by the call convention).
    pub fn assign_initial(&mut self, value: ValueId, reg: u8) {
        self.regs[reg as usize] = Some(value);
        self.values.entry(value).or_default().reg = Some(reg);
    }

    /// Gives a value a frame slot as its canonical home (cross-block
    /// values and stack-passed parameters).
    pub fn assign_home(&mut self, value: ValueId, slot: u16) {
        self.values.entry(value).or_default().spill_slot = Some(slot);
    }

    pub fn home_of(&self, value: ValueId) -> Option<u16> {
        self.values.get(&value).and_then(|s| s.spill_slot)
    }

    pub fn reg_of(&self, value: ValueId) -> Option<u8> {
        self.values.get(&value).and_then(|s| s.reg)
    }

    /// Forgets the register file at a block boundary. Values keep
    /// their spill slots; anything live across the edge must have a
    /// home slot (the emitter guarantees this for cross-block values).
    pub fn clear_regs(&mut self) {
        self.regs = [None; ALLOCATABLE as usize];
        for state in self.values.values_mut() {
            state.reg = None;
        }
    }

    /// Ensures `value` is in some register, reloading from its spill
    /// slot if needed. `pinned` registers are never evicted.
    pub fn use_reg(&mut self, code: &mut Vec<u8>, value: ValueId, pinned: &[u8]) -> u8 {
        if let Some(reg) = self.reg_of(value) {
            return reg;
        }
        let reg = self.take_reg(code, pinned);
        let state = self.values.entry(value).or_default();
        let slot = state
            .spill_slot
            .expect("value is neither in a register nor spilled");
        state.reg = Some(reg);
        self.regs[reg as usize] = Some(value);
        emit_load_slot(code, reg, slot);
        reg
    }

    /// Allocates a register for a value being defined right now.
    pub fn def_reg(&mut self, code: &mut Vec<u8>, value: ValueId, pinned: &[u8]) -> u8 {
        let reg = self.take_reg(code, pinned);
        let state = self.values.entry(value).or_default();
        state.reg = Some(reg);
        self.regs[reg as usize] = Some(value);
        reg
    }

    /// Places `value` into exactly `target` (call argument marshaling),
    /// spilling the current occupant if it is still needed. The caller
    /// marshals left to right, so the target is never a register that
    /// was already placed.
    pub fn force_into(&mut self, code: &mut Vec<u8>, value: ValueId, target: u8) {
        if self.reg_of(value) == Some(target) {
            return;
        }
        self.evict(code, target);
        if let Some(src) = self.reg_of(value) {
            emit_mov(code, target, src);
            // The old register still physically holds the value, but
            // the allocator tracks a single location per value.
            self.regs[src as usize] = None;
        } else {
            let slot = self
                .values
                .get(&value)
                .and_then(|s| s.spill_slot)
                .expect("marshaled value has no location");
            emit_load_slot(code, target, slot);
        }
        self.regs[target as usize] = Some(value);
        self.values.entry(value).or_default().reg = Some(target);
    }

    /// Consumes one use of `value`; with no uses left its register is
    /// freed.
    pub fn advance(&mut self, value: ValueId) {
        let Some(state) = self.values.get_mut(&value) else {
            return;
        };
        state.uses.pop_front();
        if state.uses.is_empty() {
            if let Some(reg) = state.reg.take() {
                self.regs[reg as usize] = None;
            }
        }
    }

    /// Drops a value from the register file without touching its home
    /// slot (used after stores that invalidate the cached register).
    pub fn forget_reg(&mut self, value: ValueId) {
        if let Some(state) = self.values.get_mut(&value) {
            if let Some(reg) = state.reg.take() {
                self.regs[reg as usize] = None;
            }
        }
    }

    /// A free register, or the farthest-next-use victim.
    fn take_reg(&mut self, code: &mut Vec<u8>, pinned: &[u8]) -> u8 {
        for reg in 0..ALLOCATABLE {
            if self.regs[reg as usize].is_none() && !pinned.contains(&reg) {
                return reg;
            }
        }

        let mut victim: Option<(u8, u32)> = None;
        for reg in 0..ALLOCATABLE {
            if pinned.contains(&reg) {
                continue;
            }
            let value = self.regs[reg as usize].expect("full register file");
            let next_use = self
                .values
                .get(&value)
                .and_then(|s| s.uses.front().copied())
                .unwrap_or(u32::MAX);
            match victim {
                Some((_, best)) if next_use <= best => {}
                _ => victim = Some((reg, next_use)),
            }
        }
        let (reg, _) = victim.expect("at least one unpinned register");
        self.evict(code, reg);
        reg
    }

    /// Writes the occupant of `reg` to its spill slot (allocating one
    /// on first spill) unless it has no upcoming uses or already has a
    /// valid home.
    fn evict(&mut self, code: &mut Vec<u8>, reg: u8) {
        let Some(value) = self.regs[reg as usize] else {
            return;
        };
        let state = self.values.entry(value).or_default();
        if !state.uses.is_empty() && state.spill_slot.is_none() {
            let slot = self.next_spill_slot;
            self.next_spill_slot += 1;
            state.spill_slot = Some(slot);
            emit_store_slot(code, reg, slot);
        }
        state.reg = None;
        self.regs[reg as usize] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uses(positions: &[u32]) -> VecDeque<u32> {
        positions.iter().copied().collect()
    }

    #[test]
    fn hands_out_free_registers_in_order() {
        let mut alloc = Allocator::new(0);
        let mut code = Vec::new();
        let a = ValueId(0);
        let b = ValueId(1);
        alloc.set_uses(a, uses(&[5]));
        alloc.set_uses(b, uses(&[6]));
        assert_eq!(alloc.def_reg(&mut code, a, &[]), 0);
        assert_eq!(alloc.def_reg(&mut code, b, &[]), 1);
        assert!(code.is_empty());
    }

    #[test]
    fn spills_the_farthest_next_use() {
        let mut alloc = Allocator::new(0);
        let mut code = Vec::new();
        // Fill all registers; the value with the farthest use is v3.
        for i in 0..ALLOCATABLE as u32 {
            let v = ValueId(i);
            let next = if i == 3 { 1000 } else { 10 + i };
            alloc.set_uses(v, uses(&[next]));
            alloc.def_reg(&mut code, v, &[]);
        }
        assert!(code.is_empty());

        let newcomer = ValueId(99);
        alloc.set_uses(newcomer, uses(&[11]));
        let reg = alloc.def_reg(&mut code, newcomer, &[]);
        assert_eq!(reg, 3, "victim must be the farthest next use");
        // The victim had upcoming uses, so a spill store was emitted.
        assert!(!code.is_empty());
        assert_eq!(alloc.home_of(ValueId(3)), Some(0));
        assert_eq!(alloc.reg_of(ValueId(3)), None);
    }

    #[test]
    fn values_without_upcoming_uses_are_free_victims() {
        let mut alloc = Allocator::new(0);
        let mut code = Vec::new();
        for i in 0..ALLOCATABLE as u32 {
            let v = ValueId(i);
            alloc.set_uses(v, uses(&[10 + i]));
            alloc.def_reg(&mut code, v, &[]);
        }
        // Consume every use of v4: it becomes dead and its register is
        // reusable without a spill.
        alloc.advance(ValueId(4));
        let mut spill_code = Vec::new();
        let reg = alloc.def_reg(&mut spill_code, ValueId(50), &[]);
        assert_eq!(reg, 4);
        assert!(spill_code.is_empty(), "dead values spill nothing");
    }

    #[test]
    fn pinned_registers_are_never_victims() {
        let mut alloc = Allocator::new(0);
        let mut code = Vec::new();
        for i in 0..ALLOCATABLE as u32 {
            let v = ValueId(i);
            // v0 has the farthest use but is pinned.
            let next = if i == 0 { 1000 } else { 10 + i };
            alloc.set_uses(v, uses(&[next]));
            alloc.def_reg(&mut code, v, &[]);
        }
        let reg = alloc.def_reg(&mut code, ValueId(99), &[0]);
        assert_ne!(reg, 0);
    }

    #[test]
    fn reload_comes_from_the_spill_slot() {
        let mut alloc = Allocator::new(7);
        let mut code = Vec::new();
        let v = ValueId(0);
        alloc.set_uses(v, uses(&[4, 9]));
        alloc.assign_home(v, 7);
        let reg = alloc.use_reg(&mut code, v, &[]);
        assert_eq!(alloc.reg_of(v), Some(reg));
        assert!(!code.is_empty(), "a reload was emitted");
    }

    #[test]
    fn force_into_moves_between_registers() {
        let mut alloc = Allocator::new(0);
        let mut code = Vec::new();
        let v = ValueId(0);
        alloc.set_uses(v, uses(&[3, 8]));
        let reg = alloc.def_reg(&mut code, v, &[]);
        assert_eq!(reg, 0);
        alloc.force_into(&mut code, v, 5);
        assert_eq!(alloc.reg_of(v), Some(5));
    }

    #[test]
    fn clear_regs_keeps_homes() {
        let mut alloc = Allocator::new(0);
        let mut code = Vec::new();
        let v = ValueId(0);
        alloc.set_uses(v, uses(&[3, 8]));
        alloc.def_reg(&mut code, v, &[]);
        alloc.assign_home(v, 2);
        alloc.clear_regs();
        assert_eq!(alloc.reg_of(v), None);
        assert_eq!(alloc.home_of(v), Some(2));
    }
}
