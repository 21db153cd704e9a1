//! IR to bytecode emission.
//!
//! Per function: phi nodes are eliminated into explicit copies at the
//! predecessors (critical edges split first), the instruction stream
//! is linearized and a backward pass builds per-value use lists, then
//! a forward pass emits opcodes while the linear-scan allocator
//! assigns the sixteen registers (`r15` stays reserved for call
//! results and scratch). Forward jumps go through a pending-fixup
//! table keyed by block and are patched once offsets are known;
//! anything still unresolved at the end is an internal compiler error
//! with the IR attached.
//!
//! Value locations: mutable locals live in `alloca` frame slots;
//! values live across block boundaries get a home slot written at the
//! definition; everything else stays in registers with
//! farthest-next-use spilling under pressure.
//!
//! Reference counting: a heap value is retained when it escapes its
//! defining scope (stored into a local slot or global, stored into a
//! collection, or returned) and released when its owning slot dies at
//! return or is overwritten. Call results arrive borrowed in the
//! last-result register; the extra reference a `Ret` hands over is
//! consumed when the VM replaces the last result. Composite
//! constructors (`StructNew`, `VariantNew`, `MakeClosure`) retain
//! their operands inside the runtime.

use std::collections::{HashMap, HashSet, VecDeque};

use cobalt_bytecode::opcodes::{pack_regs, Op};
use cobalt_bytecode::{
    Const, Export, Image, LineRecord, Routine, RESULT_REG, ROUTINE_FLAG_CAN_THROW,
};
use cobalt_ir::types::{self, TypeDesc};
use cobalt_ir::{BlockId, Callee, FloatCC, Function, Inst, IntCC, Module, Terminator, ValueId};

use crate::regalloc::Allocator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitError {
    pub message: String,
}

impl EmitError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn ice(func: &Function, message: impl Into<String>) -> Self {
        Self {
            message: format!("{} in `{}`", message.into(), func.name),
        }
    }
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "internal compiler error: {}", self.message)
    }
}

impl std::error::Error for EmitError {}

// Byte-level helpers shared with the allocator's spill/reload code.

pub(crate) fn emit_mov(code: &mut Vec<u8>, dst: u8, src: u8) {
    code.push(Op::Mov as u8);
    pack_regs(code, &[dst, src]);
}

pub(crate) fn emit_load_slot(code: &mut Vec<u8>, dst: u8, slot: u16) {
    code.push(Op::LoadSlot as u8);
    pack_regs(code, &[dst]);
    code.extend_from_slice(&slot.to_le_bytes());
}

pub(crate) fn emit_store_slot(code: &mut Vec<u8>, src: u8, slot: u16) {
    code.push(Op::StoreSlot as u8);
    pack_regs(code, &[src]);
    code.extend_from_slice(&slot.to_le_bytes());
}

/// Emits the whole IR module as a bytecode image.
pub fn emit_module(ir: &Module) -> Result<Image, EmitError> {
    let mut image = Image::new();

    for func in &ir.functions {
        let routine = FnEmitter::new(ir, &mut image, func)?.run()?;
        let name = routine.name;
        let routine_idx = image.routines.len() as u32;
        let is_exported = func.is_exported;
        image.routines.push(routine);
        if is_exported {
            image.exports.push(Export {
                name,
                routine: routine_idx,
            });
        }
    }

    cobalt_bytecode::verify_image(&image)
        .map_err(|e| EmitError::new(format!("emitted image failed verification: {}", e.message)))?;
    Ok(image)
}

struct Fixup {
    /// Offset of the rel field inside the routine body.
    at: usize,
    /// Offset of the first byte after the full instruction.
    next: usize,
    target: BlockId,
    wide: bool,
}

struct FnEmitter<'m> {
    ir: &'m Module,
    image: &'m mut Image,
    func: Function,
    code: Vec<u8>,
    alloc: Allocator,
    /// Alloca dst -> frame slot. These values never live in registers.
    allocas: HashMap<ValueId, u16>,
    /// Heap-typed alloca slots, released on every return.
    heap_slots: Vec<u16>,
    block_offsets: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    debug: Vec<(usize, u32)>,
    can_throw: bool,
    local_slots: u16,
}

impl<'m> FnEmitter<'m> {
    fn new(ir: &'m Module, image: &'m mut Image, func: &Function) -> Result<Self, EmitError> {
        let mut func = func.clone();
        eliminate_phis(&mut func);

        let block_count = func.blocks.len();
        Ok(Self {
            ir,
            image,
            func,
            code: Vec::new(),
            alloc: Allocator::new(0),
            allocas: HashMap::new(),
            heap_slots: Vec::new(),
            block_offsets: vec![None; block_count],
            fixups: Vec::new(),
            debug: Vec::new(),
            can_throw: false,
            local_slots: 0,
        })
    }

    fn run(mut self) -> Result<Routine, EmitError> {
        self.prepare_frame()?;

        if self.func.line != 0 {
            self.debug.push((0, self.func.line));
        }

        for idx in 0..self.func.blocks.len() {
            let block_id = BlockId(idx as u32);
            self.block_offsets[idx] = Some(self.code.len());
            if idx != 0 {
                self.alloc.clear_regs();
            }

            let block = self.func.blocks[idx].clone();
            for inst in &block.instrs {
                self.emit_inst(inst)?;
            }
            self.emit_terminator(block_id, &block.terminator)?;
        }

        self.resolve_fixups()?;

        let local_count = self
            .local_slots
            .max(self.alloc.spill_slots_used());
        let arg_count: u8 = self
            .func
            .params
            .len()
            .try_into()
            .map_err(|_| EmitError::ice(&self.func, "too many parameters"))?;

        let name = self.image.intern_ident(&self.func.name);
        let code_offset = self.image.code.len() as u32;
        let code_len = self.code.len() as u32;
        self.image.code.extend_from_slice(&self.code);
        for (offset, line) in &self.debug {
            self.image.debug_lines.push(LineRecord {
                code_offset: code_offset + *offset as u32,
                line: *line,
            });
        }

        Ok(Routine {
            name,
            code_offset,
            code_len,
            local_count,
            arg_count,
            flags: if self.can_throw {
                ROUTINE_FLAG_CAN_THROW
            } else {
                0
            },
        })
    }

    /// Assigns frame slots (stack-passed args, allocas, cross-block
    /// homes), builds per-value use lists, and places parameters.
    fn prepare_frame(&mut self) -> Result<(), EmitError> {
        let reg_params = self.func.params.len().min(15);
        let stack_params = self.func.params.len() - reg_params;
        let mut next_slot = stack_params as u16;

        // Allocas claim slots in definition order.
        for block in &self.func.blocks {
            for inst in &block.instrs {
                if let Inst::Alloca { dst, ty } = inst {
                    self.allocas.insert(*dst, next_slot);
                    if self.ir.types.is_heap(*ty) {
                        self.heap_slots.push(next_slot);
                    }
                    next_slot += 1;
                }
            }
        }

        // Linearize: positions, definition blocks, and use lists.
        let mut pos = 0u32;
        let mut def_block: HashMap<ValueId, BlockId> = HashMap::new();
        let mut copy_dsts: HashSet<ValueId> = HashSet::new();
        let mut uses: HashMap<ValueId, VecDeque<u32>> = HashMap::new();
        let mut cross_block: HashSet<ValueId> = HashSet::new();

        for &param in &self.func.params {
            def_block.insert(param, BlockId(0));
        }
        for (bidx, block) in self.func.blocks.iter().enumerate() {
            let here = BlockId(bidx as u32);
            for inst in &block.instrs {
                if let Inst::Copy { dst, .. } = inst {
                    copy_dsts.insert(*dst);
                } else if let Some(dst) = inst.dst() {
                    def_block.insert(dst, here);
                }
                inst.visit_uses(|v| {
                    uses.entry(v).or_default().push_back(pos);
                    if def_block.get(&v) != Some(&here) {
                        cross_block.insert(v);
                    }
                });
                pos += 1;
            }
            block.terminator.visit_uses(|v| {
                uses.entry(v).or_default().push_back(pos);
                if def_block.get(&v) != Some(&here) {
                    cross_block.insert(v);
                }
            });
            pos += 1;
        }

        // Copy destinations are written on multiple edges and read in
        // the join; they always live in their home slot.
        cross_block.extend(copy_dsts.iter().copied());

        // Deterministic home assignment: ascending value id.
        let mut homed: Vec<ValueId> = cross_block
            .iter()
            .copied()
            .filter(|v| !self.allocas.contains_key(v))
            .collect();
        homed.sort();
        let mut homes: HashMap<ValueId, u16> = HashMap::new();
        for v in &homed {
            // Stack-passed parameters already own their arrival slot.
            let param_index = self.func.params.iter().position(|p| p == v);
            if let Some(i) = param_index {
                if i >= reg_params {
                    homes.insert(*v, (i - reg_params) as u16);
                    continue;
                }
            }
            homes.insert(*v, next_slot);
            next_slot += 1;
        }
        self.local_slots = next_slot;

        self.alloc = Allocator::new(next_slot);
        let mut sorted_uses: Vec<(ValueId, VecDeque<u32>)> = uses.into_iter().collect();
        sorted_uses.sort_by_key(|(v, _)| *v);
        for (v, list) in sorted_uses {
            self.alloc.set_uses(v, list);
        }
        for (v, slot) in &homes {
            self.alloc.assign_home(*v, *slot);
        }

        // Register parameters arrive in r0..; spill the ones that
        // outlive the entry block to their homes.
        for (i, &param) in self.func.params.iter().enumerate().take(reg_params) {
            self.alloc.assign_initial(param, i as u8);
            if let Some(&slot) = homes.get(&param) {
                emit_store_slot(&mut self.code, i as u8, slot);
            }
        }
        Ok(())
    }

    // ----- operand helpers -----

    fn use1(&mut self, a: ValueId) -> u8 {
        self.alloc.use_reg(&mut self.code, a, &[])
    }

    fn store_home(&mut self, dst: ValueId, reg: u8) {
        if let Some(slot) = self.alloc.home_of(dst) {
            emit_store_slot(&mut self.code, reg, slot);
        }
    }

    fn def(&mut self, dst: ValueId) -> u8 {
        self.alloc.def_reg(&mut self.code, dst, &[])
    }

    /// Finishes a value definition: writes the cross-block home if the
    /// value has one.
    fn done_def(&mut self, dst: ValueId, reg: u8) {
        self.store_home(dst, reg);
    }

    /// Consumes one recorded use of an operand.
    fn consume(&mut self, v: ValueId, _reg: u8) {
        self.alloc.advance(v);
    }

    fn op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    fn regs(&mut self, regs: &[u8]) {
        pack_regs(&mut self.code, regs);
    }

    fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn i16_imm(&mut self, v: i16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn is_heap(&self, v: ValueId) -> bool {
        self.ir.types.is_heap(self.func.value_type(v))
    }

    fn is_decimal(&self, v: ValueId) -> bool {
        self.func.value_type(v) == types::DECIMAL
    }

    /// Field-slot count when the element is a by-value user struct;
    /// collection stores then box through the struct-aware opcodes.
    fn struct_slots(&self, v: ValueId) -> Option<u8> {
        match self.ir.types.get(self.func.value_type(v)) {
            TypeDesc::Struct { fields, .. } => Some(fields.len().min(255) as u8),
            _ => None,
        }
    }

    // ----- instruction emission -----

    fn emit_inst(&mut self, inst: &Inst) -> Result<(), EmitError> {
        match inst {
            Inst::DebugLine { line } => {
                self.debug.push((self.code.len(), *line));
            }
            Inst::Alloca { .. } => {}

            Inst::Copy { dst, src } => {
                let rs = self.use1(*src);
                self.consume(*src, rs);
                let slot = self
                    .alloc
                    .home_of(*dst)
                    .ok_or_else(|| EmitError::ice(&self.func, "copy destination has no home"))?;
                emit_store_slot(&mut self.code, rs, slot);
                // Any cached register for the old value is stale now.
                self.alloc.forget_reg(*dst);
            }

            Inst::IConst { dst, value } => {
                let rd = self.def(*dst);
                if let Ok(imm) = i16::try_from(*value) {
                    self.op(Op::LoadSmallInt);
                    self.regs(&[rd]);
                    self.i16_imm(imm);
                } else {
                    let idx = self.image.intern_const(Const::I64(*value));
                    self.op(Op::LoadConst);
                    self.regs(&[rd]);
                    self.u32(idx);
                }
                self.done_def(*dst, rd);
            }
            Inst::FConst { dst, value } => {
                let idx = self.image.intern_const(Const::F64(*value));
                let rd = self.def(*dst);
                self.op(Op::LoadConst);
                self.regs(&[rd]);
                self.u32(idx);
                self.done_def(*dst, rd);
            }
            Inst::SConst { dst, string } => {
                let text = self.pool_string(*string)?;
                let idx = self.image.intern_const(Const::Str(text));
                let rd = self.def(*dst);
                self.op(Op::LoadConst);
                self.regs(&[rd]);
                self.u32(idx);
                self.done_def(*dst, rd);
            }
            Inst::DConst { dst, string } => {
                let text = self.pool_string(*string)?;
                let idx = self.image.intern_const(Const::Decimal(text));
                let rd = self.def(*dst);
                self.op(Op::LoadConst);
                self.regs(&[rd]);
                self.u32(idx);
                self.done_def(*dst, rd);
            }
            Inst::BConst { dst, value } => {
                let rd = self.def(*dst);
                self.op(if *value { Op::LoadTrue } else { Op::LoadFalse });
                self.regs(&[rd]);
                self.done_def(*dst, rd);
            }
            Inst::NullConst { dst } => {
                let rd = self.def(*dst);
                self.op(Op::LoadNull);
                self.regs(&[rd]);
                self.done_def(*dst, rd);
            }

            // Binary arithmetic, bitwise, logical.
            Inst::IAdd { dst, a, b }
            | Inst::ISub { dst, a, b }
            | Inst::IMul { dst, a, b }
            | Inst::SDiv { dst, a, b }
            | Inst::UDiv { dst, a, b }
            | Inst::SRem { dst, a, b }
            | Inst::URem { dst, a, b }
            | Inst::FAdd { dst, a, b }
            | Inst::FSub { dst, a, b }
            | Inst::FMul { dst, a, b }
            | Inst::FDiv { dst, a, b }
            | Inst::FRem { dst, a, b }
            | Inst::BAnd { dst, a, b }
            | Inst::BOr { dst, a, b }
            | Inst::BXor { dst, a, b }
            | Inst::Shl { dst, a, b }
            | Inst::AShr { dst, a, b }
            | Inst::LShr { dst, a, b }
            | Inst::LogAnd { dst, a, b }
            | Inst::LogOr { dst, a, b }
            | Inst::StrConcat { dst, a, b }
            | Inst::StrCompare { dst, a, b } => {
                let op = self.binary_op(inst);
                let ra = self.use1(*a);
                let rb = self.alloc.use_reg(&mut self.code, *b, &[ra]);
                self.consume(*a, ra);
                self.consume(*b, rb);
                let rd = self.def(*dst);
                self.op(op);
                self.regs(&[rd, ra, rb]);
                self.done_def(*dst, rd);
            }

            Inst::INeg { dst, src }
            | Inst::FNeg { dst, src }
            | Inst::BNot { dst, src }
            | Inst::LogNot { dst, src }
            | Inst::StrLen { dst, src }
            | Inst::SliceLen { dst, src }
            | Inst::WrapOptional { dst, src }
            | Inst::UnwrapOptional { dst, src }
            | Inst::IsNull { dst, src } => {
                let op = self.unary_op(inst);
                let rs = self.use1(*src);
                self.consume(*src, rs);
                let rd = self.def(*dst);
                self.op(op);
                self.regs(&[rd, rs]);
                self.done_def(*dst, rd);
            }

            Inst::Icmp { dst, cc, a, b } => {
                if self.is_decimal(*a) {
                    self.emit_decimal_cmp(*dst, *cc, *a, *b)?;
                } else {
                    let op = int_cmp_op(*cc);
                    let ra = self.use1(*a);
                    let rb = self.alloc.use_reg(&mut self.code, *b, &[ra]);
                    self.consume(*a, ra);
                    self.consume(*b, rb);
                    let rd = self.def(*dst);
                    self.op(op);
                    self.regs(&[rd, ra, rb]);
                    self.done_def(*dst, rd);
                }
            }
            Inst::Fcmp { dst, cc, a, b } => {
                let op = match cc {
                    FloatCC::Eq => Op::FEq,
                    FloatCC::Ne => Op::FNe,
                    FloatCC::Lt => Op::FLt,
                    FloatCC::Le => Op::FLe,
                    FloatCC::Gt => Op::FGt,
                    FloatCC::Ge => Op::FGe,
                };
                let ra = self.use1(*a);
                let rb = self.alloc.use_reg(&mut self.code, *b, &[ra]);
                self.consume(*a, ra);
                self.consume(*b, rb);
                let rd = self.def(*dst);
                self.op(op);
                self.regs(&[rd, ra, rb]);
                self.done_def(*dst, rd);
            }

            Inst::Load { dst, ptr } => {
                if let Some(&slot) = self.allocas.get(ptr) {
                    self.alloc.advance(*ptr);
                    let rd = self.def(*dst);
                    emit_load_slot(&mut self.code, rd, slot);
                    self.done_def(*dst, rd);
                } else {
                    let rp = self.use1(*ptr);
                    self.consume(*ptr, rp);
                    let rd = self.def(*dst);
                    self.op(Op::PtrLoad);
                    self.regs(&[rd, rp]);
                    self.done_def(*dst, rd);
                }
            }
            Inst::Store { ptr, value } => {
                let rv = self.use1(*value);
                if let Some(&slot) = self.allocas.get(ptr) {
                    if self.is_heap(*value) {
                        // Retain the incoming value, release whatever
                        // the slot held.
                        self.op(Op::Retain);
                        self.regs(&[rv]);
                        emit_load_slot(&mut self.code, RESULT_REG, slot);
                        self.op(Op::Release);
                        self.regs(&[RESULT_REG]);
                    }
                    emit_store_slot(&mut self.code, rv, slot);
                    self.alloc.advance(*ptr);
                    self.consume(*value, rv);
                } else {
                    let rp = self.alloc.use_reg(&mut self.code, *ptr, &[rv]);
                    if self.is_heap(*value) {
                        self.op(Op::Retain);
                        self.regs(&[rv]);
                    }
                    self.op(Op::PtrStore);
                    self.regs(&[rp, rv]);
                    self.consume(*ptr, rp);
                    self.consume(*value, rv);
                }
            }
            Inst::FieldPtr { dst, base, field } => {
                let rb = self.use1(*base);
                self.consume(*base, rb);
                let rd = self.def(*dst);
                self.op(Op::FieldPtr);
                self.regs(&[rd, rb]);
                self.u8(u8::try_from(*field).unwrap_or(u8::MAX));
                self.done_def(*dst, rd);
            }
            Inst::IndexPtr { dst, base, index } => {
                let rb = self.use1(*base);
                let ri = self.alloc.use_reg(&mut self.code, *index, &[rb]);
                self.consume(*base, rb);
                self.consume(*index, ri);
                let rd = self.def(*dst);
                self.op(Op::IndexPtr);
                self.regs(&[rd, rb, ri]);
                self.done_def(*dst, rd);
            }
            Inst::GlobalLoad { dst, global } => {
                let rd = self.def(*dst);
                self.op(Op::GlobalLoad);
                self.regs(&[rd]);
                self.u16(u16::try_from(*global).unwrap_or(u16::MAX));
                self.done_def(*dst, rd);
            }
            Inst::GlobalStore { global, value } => {
                let rv = self.use1(*value);
                if self.is_heap(*value) {
                    self.op(Op::Retain);
                    self.regs(&[rv]);
                    self.op(Op::GlobalLoad);
                    self.regs(&[RESULT_REG]);
                    self.u16(u16::try_from(*global).unwrap_or(u16::MAX));
                    self.op(Op::Release);
                    self.regs(&[RESULT_REG]);
                }
                self.op(Op::GlobalStore);
                self.regs(&[rv]);
                self.u16(u16::try_from(*global).unwrap_or(u16::MAX));
                self.consume(*value, rv);
            }

            Inst::Call { dst, callee, args } => self.emit_call(*dst, callee, args)?,

            Inst::Bitcast { dst, src, .. } => {
                let rs = self.use1(*src);
                self.consume(*src, rs);
                let rd = self.def(*dst);
                self.op(Op::Bitcast);
                self.regs(&[rd, rs]);
                self.done_def(*dst, rd);
            }
            Inst::Sext { dst, src, ty } | Inst::Uext { dst, src, ty } | Inst::Trunc { dst, src, ty } => {
                let op = match inst {
                    Inst::Sext { .. } => Op::Sext,
                    Inst::Uext { .. } => Op::Uext,
                    _ => Op::Trunc,
                };
                let width = self.ir.types.width(*ty).unwrap_or(64);
                let rs = self.use1(*src);
                self.consume(*src, rs);
                let rd = self.def(*dst);
                self.op(op);
                self.regs(&[rd, rs]);
                self.u8(width);
                self.done_def(*dst, rd);
            }
            Inst::IntToFloat { dst, src, .. } => {
                let rs = self.use1(*src);
                self.consume(*src, rs);
                let rd = self.def(*dst);
                self.op(Op::IntToFloat);
                self.regs(&[rd, rs]);
                self.done_def(*dst, rd);
            }
            Inst::FloatToInt { dst, src, .. } => {
                let rs = self.use1(*src);
                self.consume(*src, rs);
                let rd = self.def(*dst);
                self.op(Op::FloatToInt);
                self.regs(&[rd, rs]);
                self.done_def(*dst, rd);
            }

            Inst::StrIndex { dst, src, index } => {
                let rs = self.use1(*src);
                let ri = self.alloc.use_reg(&mut self.code, *index, &[rs]);
                self.consume(*src, rs);
                self.consume(*index, ri);
                let rd = self.def(*dst);
                self.op(Op::StrIndex);
                self.regs(&[rd, rs, ri]);
                self.done_def(*dst, rd);
            }
            Inst::StrSlice {
                dst,
                src,
                start,
                end,
            } => {
                let rs = self.use1(*src);
                let r1 = self.alloc.use_reg(&mut self.code, *start, &[rs]);
                let r2 = self.alloc.use_reg(&mut self.code, *end, &[rs, r1]);
                self.consume(*src, rs);
                self.consume(*start, r1);
                self.consume(*end, r2);
                let rd = self.def(*dst);
                self.op(Op::StrSlice);
                self.regs(&[rd, rs, r1, r2]);
                self.u8(0);
                self.done_def(*dst, rd);
            }

            Inst::ArrayNew { dst, len, .. } => {
                let rd = self.def(*dst);
                self.op(Op::ArrayNew);
                self.regs(&[rd]);
                self.u16(u16::try_from(*len).unwrap_or(u16::MAX));
                self.done_def(*dst, rd);
            }
            Inst::ArrayLoad { dst, array, index } => {
                let ra = self.use1(*array);
                let ri = self.alloc.use_reg(&mut self.code, *index, &[ra]);
                self.consume(*array, ra);
                self.consume(*index, ri);
                let rd = self.def(*dst);
                self.op(Op::ArrayLoad);
                self.regs(&[rd, ra, ri]);
                self.done_def(*dst, rd);
            }
            Inst::ArrayStore {
                array,
                index,
                value,
            } => {
                let ra = self.use1(*array);
                let ri = self.alloc.use_reg(&mut self.code, *index, &[ra]);
                let rv = self.alloc.use_reg(&mut self.code, *value, &[ra, ri]);
                if self.is_heap(*value) {
                    self.op(Op::Retain);
                    self.regs(&[rv]);
                }
                self.op(Op::ArrayStore);
                self.regs(&[ra, ri, rv]);
                self.consume(*array, ra);
                self.consume(*index, ri);
                self.consume(*value, rv);
            }
            Inst::ArrayLen { dst, array } => {
                let ra = self.use1(*array);
                self.consume(*array, ra);
                let rd = self.def(*dst);
                self.op(Op::ArrayLen);
                self.regs(&[rd, ra]);
                self.done_def(*dst, rd);
            }
            Inst::SliceNew {
                dst,
                base,
                start,
                end,
            } => {
                let rb = self.use1(*base);
                let r1 = self.alloc.use_reg(&mut self.code, *start, &[rb]);
                let r2 = self.alloc.use_reg(&mut self.code, *end, &[rb, r1]);
                self.consume(*base, rb);
                self.consume(*start, r1);
                self.consume(*end, r2);
                let rd = self.def(*dst);
                self.op(Op::SliceNew);
                self.regs(&[rd, rb, r1, r2]);
                self.u8(0);
                self.done_def(*dst, rd);
            }

            Inst::ListNew { dst, .. } => {
                let rd = self.def(*dst);
                self.op(Op::ListNew);
                self.regs(&[rd]);
                self.done_def(*dst, rd);
            }
            Inst::ListPush { list, value } => {
                let rl = self.use1(*list);
                let rv = self.alloc.use_reg(&mut self.code, *value, &[rl]);
                if self.is_heap(*value) {
                    self.op(Op::Retain);
                    self.regs(&[rv]);
                }
                match self.struct_slots(*value) {
                    Some(slots) => {
                        self.op(Op::ListPushStruct);
                        self.regs(&[rl, rv]);
                        self.u8(slots);
                    }
                    None => {
                        self.op(Op::ListPush);
                        self.regs(&[rl, rv]);
                    }
                }
                self.consume(*list, rl);
                self.consume(*value, rv);
            }
            Inst::ListPop { dst, list } => {
                let rl = self.use1(*list);
                self.consume(*list, rl);
                let rd = self.def(*dst);
                self.op(Op::ListPop);
                self.regs(&[rd, rl]);
                self.done_def(*dst, rd);
            }
            Inst::ListGet { dst, list, index } => {
                let rl = self.use1(*list);
                let ri = self.alloc.use_reg(&mut self.code, *index, &[rl]);
                self.consume(*list, rl);
                self.consume(*index, ri);
                let rd = self.def(*dst);
                match self.struct_slots(*dst) {
                    Some(slots) => {
                        self.op(Op::ListGetStruct);
                        self.regs(&[rd, rl, ri]);
                        self.u8(slots);
                    }
                    None => {
                        self.op(Op::ListGet);
                        self.regs(&[rd, rl, ri]);
                    }
                }
                self.done_def(*dst, rd);
            }
            Inst::ListSet { list, index, value } => {
                let rl = self.use1(*list);
                let ri = self.alloc.use_reg(&mut self.code, *index, &[rl]);
                let rv = self.alloc.use_reg(&mut self.code, *value, &[rl, ri]);
                if self.is_heap(*value) {
                    self.op(Op::Retain);
                    self.regs(&[rv]);
                }
                match self.struct_slots(*value) {
                    Some(slots) => {
                        self.op(Op::ListSetStruct);
                        self.regs(&[rl, ri, rv]);
                        self.u8(slots);
                    }
                    None => {
                        self.op(Op::ListSet);
                        self.regs(&[rl, ri, rv]);
                    }
                }
                self.consume(*list, rl);
                self.consume(*index, ri);
                self.consume(*value, rv);
            }
            Inst::ListLen { dst, list } => {
                let rl = self.use1(*list);
                self.consume(*list, rl);
                let rd = self.def(*dst);
                self.op(Op::ListLen);
                self.regs(&[rd, rl]);
                self.done_def(*dst, rd);
            }

            Inst::MapNew { dst, .. } => {
                let rd = self.def(*dst);
                self.op(Op::MapNew);
                self.regs(&[rd]);
                self.done_def(*dst, rd);
            }
            Inst::MapSet { map, key, value } => {
                let rm = self.use1(*map);
                let rk = self.alloc.use_reg(&mut self.code, *key, &[rm]);
                let rv = self.alloc.use_reg(&mut self.code, *value, &[rm, rk]);
                // The map holds on to both its key and its value.
                if self.is_heap(*key) {
                    self.op(Op::Retain);
                    self.regs(&[rk]);
                }
                if self.is_heap(*value) {
                    self.op(Op::Retain);
                    self.regs(&[rv]);
                }
                match self.struct_slots(*value) {
                    Some(slots) => {
                        self.op(Op::MapSetStruct);
                        self.regs(&[rm, rk, rv]);
                        self.u8(slots);
                    }
                    None => {
                        self.op(Op::MapSet);
                        self.regs(&[rm, rk, rv]);
                    }
                }
                self.consume(*map, rm);
                self.consume(*key, rk);
                self.consume(*value, rv);
            }
            Inst::MapGet { dst, map, key } => {
                let rm = self.use1(*map);
                let rk = self.alloc.use_reg(&mut self.code, *key, &[rm]);
                self.consume(*map, rm);
                self.consume(*key, rk);
                let rd = self.def(*dst);
                match self.struct_slots(*dst) {
                    Some(slots) => {
                        self.op(Op::MapGetStruct);
                        self.regs(&[rd, rm, rk]);
                        self.u8(slots);
                    }
                    None => {
                        self.op(Op::MapGet);
                        self.regs(&[rd, rm, rk]);
                    }
                }
                self.done_def(*dst, rd);
            }
            Inst::MapHas { dst, map, key } => {
                let rm = self.use1(*map);
                let rk = self.alloc.use_reg(&mut self.code, *key, &[rm]);
                self.consume(*map, rm);
                self.consume(*key, rk);
                let rd = self.def(*dst);
                self.op(Op::MapHas);
                self.regs(&[rd, rm, rk]);
                self.done_def(*dst, rd);
            }
            Inst::MapDelete { map, key } => {
                let rm = self.use1(*map);
                let rk = self.alloc.use_reg(&mut self.code, *key, &[rm]);
                self.op(Op::MapDelete);
                self.regs(&[rm, rk]);
                self.consume(*map, rm);
                self.consume(*key, rk);
            }
            Inst::MapLen { dst, map } => {
                let rm = self.use1(*map);
                self.consume(*map, rm);
                let rd = self.def(*dst);
                self.op(Op::MapLen);
                self.regs(&[rd, rm]);
                self.done_def(*dst, rd);
            }

            Inst::RecordNew { dst, ty, fields } => {
                for f in fields {
                    let rf = self.use1(*f);
                    self.op(Op::PushArg);
                    self.regs(&[rf]);
                    self.consume(*f, rf);
                }
                let type_name = self.ir.types.display(*ty);
                let name_idx = self.image.intern_ident(&type_name);
                let name_u16 = u16::try_from(name_idx)
                    .map_err(|_| EmitError::ice(&self.func, "constant pool overflow"))?;
                let rd = self.def(*dst);
                self.op(Op::StructNew);
                self.regs(&[rd]);
                self.u16(name_u16);
                self.u8(fields.len().min(255) as u8);
                self.done_def(*dst, rd);
            }
            Inst::RecordGet { dst, record, field } => {
                let rr = self.use1(*record);
                self.consume(*record, rr);
                let rd = self.def(*dst);
                self.op(Op::StructGet);
                self.regs(&[rd, rr]);
                self.u8(u8::try_from(*field).unwrap_or(u8::MAX));
                self.done_def(*dst, rd);
            }
            Inst::RecordSet {
                record,
                field,
                value,
            } => {
                let rr = self.use1(*record);
                let rv = self.alloc.use_reg(&mut self.code, *value, &[rr]);
                if self.is_heap(*value) {
                    self.op(Op::Retain);
                    self.regs(&[rv]);
                }
                self.op(Op::StructSet);
                self.regs(&[rr, rv]);
                self.u8(u8::try_from(*field).unwrap_or(u8::MAX));
                self.consume(*record, rr);
                self.consume(*value, rv);
            }

            Inst::VariantConstruct {
                dst, tag, payload, ..
            } => {
                for p in payload {
                    let rp = self.use1(*p);
                    self.op(Op::PushArg);
                    self.regs(&[rp]);
                    self.consume(*p, rp);
                }
                let tag = u8::try_from(*tag)
                    .map_err(|_| EmitError::ice(&self.func, "variant tag exceeds 255"))?;
                let rd = self.def(*dst);
                self.op(Op::VariantNew);
                self.regs(&[rd]);
                self.u8(tag);
                self.u8(payload.len().min(255) as u8);
                self.done_def(*dst, rd);
            }
            Inst::VariantTag { dst, variant } => {
                let rv = self.use1(*variant);
                self.consume(*variant, rv);
                let rd = self.def(*dst);
                self.op(Op::VariantTag);
                self.regs(&[rd, rv]);
                self.done_def(*dst, rd);
            }
            Inst::VariantPayload {
                dst,
                variant,
                index,
            } => {
                let rv = self.use1(*variant);
                self.consume(*variant, rv);
                let rd = self.def(*dst);
                self.op(Op::VariantPayload);
                self.regs(&[rd, rv]);
                self.u8(u8::try_from(*index).unwrap_or(u8::MAX));
                self.done_def(*dst, rd);
            }

            Inst::RangeNew {
                dst,
                lo,
                hi,
                inclusive,
            } => {
                let rl = self.use1(*lo);
                let rh = self.alloc.use_reg(&mut self.code, *hi, &[rl]);
                self.consume(*lo, rl);
                self.consume(*hi, rh);
                let rd = self.def(*dst);
                self.op(Op::RangeNew);
                self.regs(&[rd, rl, rh]);
                self.u8(u8::from(*inclusive));
                self.done_def(*dst, rd);
            }

            Inst::MakeClosure { dst, func, env } => {
                for v in env {
                    let rv = self.use1(*v);
                    self.op(Op::PushArg);
                    self.regs(&[rv]);
                    self.consume(*v, rv);
                }
                let idx = u16::try_from(func.0)
                    .map_err(|_| EmitError::ice(&self.func, "routine index exceeds u16"))?;
                let rd = self.def(*dst);
                self.op(Op::MakeClosure);
                self.regs(&[rd]);
                self.u16(idx);
                self.u8(env.len().min(255) as u8);
                self.done_def(*dst, rd);
            }

            Inst::SetHandler { target } => {
                self.can_throw = true;
                self.op(Op::SetHandlerLong);
                let at = self.code.len();
                self.u32(0);
                self.fixups.push(Fixup {
                    at,
                    next: self.code.len(),
                    target: *target,
                    wide: true,
                });
            }
            Inst::ClearHandler => {
                self.op(Op::ClearHandler);
            }
            Inst::CaughtValue { dst } => {
                let rd = self.def(*dst);
                emit_mov(&mut self.code, rd, RESULT_REG);
                self.done_def(*dst, rd);
            }

            Inst::Phi { .. } => {
                return Err(EmitError::ice(&self.func, "phi survived elimination"));
            }
        }
        Ok(())
    }

    fn pool_string(&self, idx: u32) -> Result<String, EmitError> {
        self.ir
            .strings
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| EmitError::ice(&self.func, "string pool index out of range"))
    }

    fn binary_op(&self, inst: &Inst) -> Op {
        // Decimal values share the integer instruction shapes; the
        // opcode is picked by operand type.
        let decimal = inst
            .dst()
            .is_some_and(|d| self.func.value_type(d) == types::DECIMAL);
        match inst {
            Inst::IAdd { .. } if decimal => Op::DAdd,
            Inst::ISub { .. } if decimal => Op::DSub,
            Inst::IMul { .. } if decimal => Op::DMul,
            Inst::SDiv { .. } if decimal => Op::DDiv,
            Inst::IAdd { .. } => Op::IAdd,
            Inst::ISub { .. } => Op::ISub,
            Inst::IMul { .. } => Op::IMul,
            Inst::SDiv { .. } => Op::SDiv,
            Inst::UDiv { .. } => Op::UDiv,
            Inst::SRem { .. } => Op::SRem,
            Inst::URem { .. } => Op::URem,
            Inst::FAdd { .. } => Op::FAdd,
            Inst::FSub { .. } => Op::FSub,
            Inst::FMul { .. } => Op::FMul,
            Inst::FDiv { .. } => Op::FDiv,
            Inst::FRem { .. } => Op::FRem,
            Inst::BAnd { .. } => Op::BAnd,
            Inst::BOr { .. } => Op::BOr,
            Inst::BXor { .. } => Op::BXor,
            Inst::Shl { .. } => Op::Shl,
            Inst::AShr { .. } => Op::AShr,
            Inst::LShr { .. } => Op::LShr,
            Inst::LogAnd { .. } => Op::LogAnd,
            Inst::LogOr { .. } => Op::LogOr,
            Inst::StrConcat { .. } => Op::StrConcat,
            Inst::StrCompare { .. } => Op::StrCmp,
            _ => unreachable!("not a binary instruction"),
        }
    }

    fn unary_op(&self, inst: &Inst) -> Op {
        match inst {
            Inst::INeg { dst, .. } if self.func.value_type(*dst) == types::DECIMAL => Op::DNeg,
            Inst::INeg { .. } => Op::INeg,
            Inst::FNeg { .. } => Op::FNeg,
            Inst::BNot { .. } => Op::BNot,
            Inst::LogNot { .. } => Op::LogNot,
            Inst::StrLen { .. } => Op::StrLen,
            Inst::SliceLen { .. } => Op::SliceLen,
            Inst::WrapOptional { .. } => Op::WrapOptional,
            Inst::UnwrapOptional { .. } => Op::UnwrapOptional,
            Inst::IsNull { .. } => Op::IsNull,
            _ => unreachable!("not a unary instruction"),
        }
    }

    fn emit_decimal_cmp(
        &mut self,
        dst: ValueId,
        cc: IntCC,
        a: ValueId,
        b: ValueId,
    ) -> Result<(), EmitError> {
        let ra = self.use1(a);
        let rb = self.alloc.use_reg(&mut self.code, b, &[ra]);
        self.consume(a, ra);
        self.consume(b, rb);
        // DCmp leaves -1/0/1 in the scratch register; fold it to a
        // bool against small immediates.
        self.op(Op::DCmp);
        self.regs(&[RESULT_REG, ra, rb]);
        let rd = self.def(dst);
        match cc {
            IntCC::Eq => {
                self.op(Op::IEqImm);
                self.regs(&[rd, RESULT_REG]);
                self.i16_imm(0);
            }
            IntCC::Ne => {
                self.op(Op::IEqImm);
                self.regs(&[rd, RESULT_REG]);
                self.i16_imm(0);
                self.op(Op::LogNot);
                self.regs(&[rd, rd]);
            }
            IntCC::Slt | IntCC::Ult => {
                self.op(Op::ILtImm);
                self.regs(&[rd, RESULT_REG]);
                self.i16_imm(0);
            }
            IntCC::Sle | IntCC::Ule => {
                self.op(Op::ILtImm);
                self.regs(&[rd, RESULT_REG]);
                self.i16_imm(1);
            }
            IntCC::Sgt | IntCC::Ugt => {
                self.op(Op::ILtImm);
                self.regs(&[rd, RESULT_REG]);
                self.i16_imm(1);
                self.op(Op::LogNot);
                self.regs(&[rd, rd]);
            }
            IntCC::Sge | IntCC::Uge => {
                self.op(Op::ILtImm);
                self.regs(&[rd, RESULT_REG]);
                self.i16_imm(0);
                self.op(Op::LogNot);
                self.regs(&[rd, rd]);
            }
        }
        self.done_def(dst, rd);
        Ok(())
    }

    fn emit_call(
        &mut self,
        dst: Option<ValueId>,
        callee: &Callee,
        args: &[ValueId],
    ) -> Result<(), EmitError> {
        let reg_argc = args.len().min(15);
        let stack_argc = args.len() - reg_argc;
        if stack_argc > 15 {
            return Err(EmitError::ice(&self.func, "call exceeds 30 arguments"));
        }

        // Stack-passed arguments go first, in order.
        for arg in &args[reg_argc..] {
            let r = self.use1(*arg);
            self.op(Op::PushArg);
            self.regs(&[r]);
        }

        // Register arguments marshal into r0.. left to right.
        for (i, arg) in args[..reg_argc].iter().enumerate() {
            self.alloc.force_into(&mut self.code, *arg, i as u8);
        }
        for arg in args {
            self.alloc.advance(*arg);
        }

        match callee {
            Callee::Func(id) => {
                let target = self
                    .ir
                    .functions
                    .get(id.0 as usize)
                    .ok_or_else(|| EmitError::ice(&self.func, "call to unknown routine"))?;
                if target.params.len() != args.len() {
                    return Err(EmitError::ice(
                        &self.func,
                        format!(
                            "call to `{}` passes {} arguments for arity {}",
                            target.name,
                            args.len(),
                            target.params.len()
                        ),
                    ));
                }
                let idx = u16::try_from(id.0)
                    .map_err(|_| EmitError::ice(&self.func, "routine index exceeds u16"))?;
                self.op(Op::Call);
                self.u16(idx);
                self.u8(((reg_argc as u8) << 4) | stack_argc as u8);
            }
            Callee::Native(name) => {
                let name_idx = self.image.intern_ident(name);
                let idx = u16::try_from(name_idx)
                    .map_err(|_| EmitError::ice(&self.func, "constant pool overflow"))?;
                self.op(Op::NativeCall);
                self.u16(idx);
                self.u8(args.len().min(255) as u8);
            }
            Callee::Closure(closure) => {
                let pinned: Vec<u8> = (0..reg_argc as u8).collect();
                let rc = self.alloc.use_reg(&mut self.code, *closure, &pinned);
                self.op(Op::CallClosure);
                self.regs(&[rc]);
                self.u8(((reg_argc as u8) << 4) | stack_argc as u8);
                self.consume(*closure, rc);
            }
        }
        self.can_throw = true;

        if let Some(dst) = dst {
            let rd = self.def(dst);
            emit_mov(&mut self.code, rd, RESULT_REG);
            self.done_def(dst, rd);
        }
        Ok(())
    }

    // ----- terminators -----

    fn emit_terminator(&mut self, block: BlockId, term: &Terminator) -> Result<(), EmitError> {
        match term {
            Terminator::Unterminated => {
                return Err(EmitError::ice(&self.func, "unterminated block reached emission"));
            }
            Terminator::Jump { target } => {
                self.emit_jump(block, *target);
            }
            Terminator::BrIf {
                cond,
                then_target,
                else_target,
            } => {
                let rc = self.use1(*cond);
                self.consume(*cond, rc);
                self.op(Op::BrIf);
                self.regs(&[rc]);
                let at = self.code.len();
                self.i16_imm(0);
                self.fixups.push(Fixup {
                    at,
                    next: self.code.len(),
                    target: *then_target,
                    wide: false,
                });
                self.emit_jump(block, *else_target);
            }
            Terminator::BrTable {
                value,
                targets,
                default,
            } => {
                let rv = self.use1(*value);
                self.consume(*value, rv);
                let count = targets.len() + 1;
                let count = u16::try_from(count)
                    .map_err(|_| EmitError::ice(&self.func, "branch table exceeds u16 cases"))?;
                self.op(Op::BrTable);
                self.regs(&[rv]);
                self.u16(count);
                // The target list follows the fixed prefix; the final
                // entry is the default. Offsets are relative to the
                // end of the whole instruction.
                let list_at = self.code.len();
                let next = list_at + count as usize * 2;
                for (i, t) in targets.iter().chain(std::iter::once(default)).enumerate() {
                    self.fixups.push(Fixup {
                        at: list_at + i * 2,
                        next,
                        target: *t,
                        wide: false,
                    });
                    self.code.extend_from_slice(&0i16.to_le_bytes());
                }
            }
            Terminator::Ret { value } => {
                match value {
                    Some(v) => {
                        let rv = self.use1(*v);
                        if self.is_heap(*v) {
                            // Returning transfers a reference to the
                            // caller.
                            self.op(Op::Retain);
                            self.regs(&[rv]);
                        }
                        self.alloc.advance(*v);
                        self.release_heap_slots();
                        self.op(Op::Ret);
                        self.regs(&[rv]);
                    }
                    None => {
                        self.release_heap_slots();
                        self.op(Op::RetVoid);
                    }
                }
            }
            Terminator::Throw { value } => {
                self.can_throw = true;
                let rv = self.use1(*value);
                self.consume(*value, rv);
                self.op(Op::Throw);
                self.regs(&[rv]);
            }
        }
        Ok(())
    }

    /// Scope-exit releases for heap-typed locals. Slots are zeroed by
    /// frame setup, and the runtime treats releasing null as a no-op.
    fn release_heap_slots(&mut self) {
        let slots = self.heap_slots.clone();
        for slot in slots {
            emit_load_slot(&mut self.code, RESULT_REG, slot);
            self.op(Op::Release);
            self.regs(&[RESULT_REG]);
        }
    }

    /// Emits an unconditional transfer to `target`; falls through when
    /// the target is the next block in layout, uses the short form for
    /// in-range backward jumps, and the long form otherwise.
    fn emit_jump(&mut self, from: BlockId, target: BlockId) {
        if target.0 == from.0 + 1 {
            return;
        }
        if let Some(Some(offset)) = self.block_offsets.get(target.0 as usize).copied() {
            let next_short = self.code.len() + 3;
            let rel = offset as i64 - next_short as i64;
            if let Ok(rel) = i16::try_from(rel) {
                self.op(Op::Jmp);
                self.i16_imm(rel);
                return;
            }
        }
        self.op(Op::JmpLong);
        let at = self.code.len();
        self.u32(0);
        self.fixups.push(Fixup {
            at,
            next: self.code.len(),
            target,
            wide: true,
        });
    }

    fn resolve_fixups(&mut self) -> Result<(), EmitError> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in fixups {
            let Some(Some(offset)) = self.block_offsets.get(fixup.target.0 as usize).copied()
            else {
                return Err(EmitError::ice(
                    &self.func,
                    format!("unresolved jump to block b{}", fixup.target.0),
                ));
            };
            let rel = offset as i64 - fixup.next as i64;
            if fixup.wide {
                let rel = i32::try_from(rel)
                    .map_err(|_| EmitError::ice(&self.func, "jump offset exceeds i32"))?;
                self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
            } else {
                let rel = i16::try_from(rel).map_err(|_| {
                    EmitError::ice(&self.func, "short jump offset exceeds i16; IR dump follows")
                })?;
                self.code[fixup.at..fixup.at + 2].copy_from_slice(&rel.to_le_bytes());
            }
        }
        Ok(())
    }
}

fn int_cmp_op(cc: IntCC) -> Op {
    match cc {
        IntCC::Eq => Op::IEq,
        IntCC::Ne => Op::INe,
        IntCC::Slt => Op::ILt,
        IntCC::Sle => Op::ILe,
        IntCC::Sgt => Op::IGt,
        IntCC::Sge => Op::IGe,
        IntCC::Ult => Op::ULt,
        IntCC::Ule => Op::ULe,
        IntCC::Ugt => Op::UGt,
        IntCC::Uge => Op::UGe,
    }
}

/// Rewrites phis into explicit copies at the predecessors. Critical
/// edges (predecessor with several successors into a block with
/// several predecessors) are split with a trampoline block first, so
/// each copy runs on exactly one edge. When a copy source is itself a
/// phi of the same block, the whole group routes through fresh
/// temporaries to keep the parallel-move semantics.
fn eliminate_phis(func: &mut Function) {
    func.recompute_preds();

    // Split critical edges.
    let block_count = func.blocks.len();
    for b in 0..block_count {
        let has_phis = func.blocks[b]
            .instrs
            .iter()
            .any(|i| matches!(i, Inst::Phi { .. }));
        if !has_phis || func.blocks[b].preds.len() < 2 {
            continue;
        }
        let preds = func.blocks[b].preds.clone();
        for p in preds {
            let succs = func.blocks[p.0 as usize].terminator.successors();
            if succs.len() < 2 {
                continue;
            }
            let edge = func.add_block();
            func.block_mut(edge).terminator = Terminator::Jump {
                target: BlockId(b as u32),
            };
            retarget(&mut func.block_mut(p).terminator, BlockId(b as u32), edge);
            // The phi arguments move to the new edge block.
            for inst in &mut func.block_mut(BlockId(b as u32)).instrs {
                if let Inst::Phi { args, .. } = inst {
                    for (pred, _) in args.iter_mut() {
                        if *pred == p {
                            *pred = edge;
                        }
                    }
                }
            }
        }
    }
    func.recompute_preds();

    // Collect and strip phis, then insert copies at predecessors.
    for b in 0..func.blocks.len() {
        let mut phis = Vec::new();
        func.blocks[b].instrs.retain(|inst| {
            if let Inst::Phi { dst, args } = inst {
                phis.push((*dst, args.clone()));
                false
            } else {
                true
            }
        });
        if phis.is_empty() {
            continue;
        }

        let phi_dsts: Vec<ValueId> = phis.iter().map(|(d, _)| *d).collect();
        let preds = func.blocks[b].preds.clone();
        for p in preds {
            // Gather this edge's moves.
            let mut moves: Vec<(ValueId, ValueId)> = Vec::new();
            for (dst, args) in &phis {
                if let Some((_, src)) = args.iter().find(|(pred, _)| *pred == p) {
                    // A self-referencing phi (loop-invariant bound)
                    // needs no copy on its back edge.
                    if src != dst {
                        moves.push((*dst, *src));
                    }
                }
            }
            let overlap = moves.iter().any(|(_, src)| phi_dsts.contains(src));
            if overlap {
                // Parallel-move hazard: read every source into a fresh
                // temporary before writing any destination.
                let mut temp_ids = Vec::new();
                for (_, src) in &moves {
                    let ty = func.value_types[src.0 as usize];
                    let tmp = func.new_value(ty);
                    func.block_mut(p)
                        .instrs
                        .push(Inst::Copy { dst: tmp, src: *src });
                    temp_ids.push(tmp);
                }
                for ((dst, _), tmp) in moves.iter().zip(temp_ids) {
                    func.block_mut(p)
                        .instrs
                        .push(Inst::Copy { dst: *dst, src: tmp });
                }
            } else {
                let instrs = &mut func.block_mut(p).instrs;
                for (dst, src) in moves {
                    instrs.push(Inst::Copy { dst, src });
                }
            }
        }
    }
    func.recompute_preds();
}

fn retarget(term: &mut Terminator, from: BlockId, to: BlockId) {
    match term {
        Terminator::Jump { target } => {
            if *target == from {
                *target = to;
            }
        }
        Terminator::BrIf {
            then_target,
            else_target,
            ..
        } => {
            if *then_target == from {
                *then_target = to;
            }
            if *else_target == from {
                *else_target = to;
            }
        }
        Terminator::BrTable {
            targets, default, ..
        } => {
            for t in targets {
                if *t == from {
                    *t = to;
                }
            }
            if *default == from {
                *default = to;
            }
        }
        _ => {}
    }
}
