#![forbid(unsafe_code)]

//! The Cobalt SSA intermediate representation.
//!
//! The IR is the narrow waist of the pipeline: the bytecode emitter
//! and any native backend consume the same module. Each value is
//! defined exactly once; joins are expressed with phi instructions at
//! block entry; every block ends in exactly one terminator.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod opt;
pub mod print;
pub mod types;
pub mod verify;

pub use types::{TypeDesc, TypeId, TypeRegistry};
pub use verify::{verify_module, VerifyError};

/// An SSA value id, unique within its function, assigned monotonically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValueId(pub u32);

/// A basic-block index within a function; block 0 is the entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockId(pub u32);

/// A function index within a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FuncId(pub u32);

/// A module-level global variable.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Global {
    pub name: String,
    pub ty: TypeId,
}

/// An IR module: functions, globals, the string pool, and the type
/// registry the annotations refer to.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    /// Interned string data referenced by `SConst`/`DConst`.
    pub strings: Vec<String>,
    pub types: TypeRegistry,
}

impl Module {
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            functions: Vec::new(),
            globals: Vec::new(),
            strings: Vec::new(),
            types,
        }
    }

    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.strings.iter().position(|x| x == s) {
            return idx as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    pub fn function_id(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }
}

/// An IR function body.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Function {
    pub name: String,
    /// Parameter values; these are the first value ids of the function
    /// and are defined by the entry block.
    pub params: Vec<ValueId>,
    pub ret: TypeId,
    /// Blocks in emission order; `blocks[0]` is the entry block.
    pub blocks: Vec<Block>,
    /// Type of every value, indexed by `ValueId`. Doubles as the value
    /// counter: ids are handed out monotonically and never reused.
    pub value_types: Vec<TypeId>,
    /// Whether the routine appears in the image's export table.
    pub is_exported: bool,
    /// Source line of the function header, for debug info.
    pub line: u32,
}

impl Function {
    pub fn new(name: String, ret: TypeId) -> Self {
        Self {
            name,
            params: Vec::new(),
            ret,
            blocks: Vec::new(),
            value_types: Vec::new(),
            is_exported: false,
            line: 0,
        }
    }

    pub fn new_value(&mut self, ty: TypeId) -> ValueId {
        let id = ValueId(self.value_types.len() as u32);
        self.value_types.push(ty);
        id
    }

    pub fn value_type(&self, v: ValueId) -> TypeId {
        self.value_types[v.0 as usize]
    }

    pub fn entry_block(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new());
        id
    }

    /// Recomputes every block's predecessor list from the terminators.
    pub fn recompute_preds(&mut self) {
        for block in &mut self.blocks {
            block.preds.clear();
        }
        for idx in 0..self.blocks.len() {
            let from = BlockId(idx as u32);
            for succ in self.blocks[idx].terminator.successors() {
                let preds = &mut self.blocks[succ.0 as usize].preds;
                if !preds.contains(&from) {
                    preds.push(from);
                }
            }
        }
    }
}

/// A basic block: phis and straight-line instructions, then exactly
/// one terminator.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Block {
    pub instrs: Vec<Inst>,
    pub preds: Vec<BlockId>,
    pub terminator: Terminator,
}

impl Block {
    pub fn new() -> Self {
        Self {
            instrs: Vec::new(),
            preds: Vec::new(),
            terminator: Terminator::Unterminated,
        }
    }

    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, Terminator::Unterminated)
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer comparison condition codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntCC {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// Float comparison condition codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FloatCC {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// What a call targets.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Callee {
    /// A module function by index.
    Func(FuncId),
    /// A runtime/native function by name (`println`, `read_file`, …).
    Native(String),
    /// An indirect call through a closure value.
    Closure(ValueId),
}

/// An IR instruction. Terminators live on the block, not here.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Inst {
    /// Register-level copy. Not produced by the lowerer; phi
    /// elimination in the emitter introduces these, at which point the
    /// function is no longer strict SSA.
    Copy { dst: ValueId, src: ValueId },

    // Constants.
    IConst { dst: ValueId, value: i64 },
    FConst { dst: ValueId, value: f64 },
    /// String constant via the module string pool.
    SConst { dst: ValueId, string: u32 },
    BConst { dst: ValueId, value: bool },
    /// Decimal constant, canonical text form in the string pool.
    DConst { dst: ValueId, string: u32 },
    NullConst { dst: ValueId },

    // Integer arithmetic (wrapping).
    IAdd { dst: ValueId, a: ValueId, b: ValueId },
    ISub { dst: ValueId, a: ValueId, b: ValueId },
    IMul { dst: ValueId, a: ValueId, b: ValueId },
    SDiv { dst: ValueId, a: ValueId, b: ValueId },
    UDiv { dst: ValueId, a: ValueId, b: ValueId },
    SRem { dst: ValueId, a: ValueId, b: ValueId },
    URem { dst: ValueId, a: ValueId, b: ValueId },
    INeg { dst: ValueId, src: ValueId },

    // Float arithmetic.
    FAdd { dst: ValueId, a: ValueId, b: ValueId },
    FSub { dst: ValueId, a: ValueId, b: ValueId },
    FMul { dst: ValueId, a: ValueId, b: ValueId },
    FDiv { dst: ValueId, a: ValueId, b: ValueId },
    FRem { dst: ValueId, a: ValueId, b: ValueId },
    FNeg { dst: ValueId, src: ValueId },

    // Bitwise and shifts.
    BAnd { dst: ValueId, a: ValueId, b: ValueId },
    BOr { dst: ValueId, a: ValueId, b: ValueId },
    BXor { dst: ValueId, a: ValueId, b: ValueId },
    BNot { dst: ValueId, src: ValueId },
    Shl { dst: ValueId, a: ValueId, b: ValueId },
    AShr { dst: ValueId, a: ValueId, b: ValueId },
    LShr { dst: ValueId, a: ValueId, b: ValueId },

    // Comparisons.
    Icmp { dst: ValueId, cc: IntCC, a: ValueId, b: ValueId },
    Fcmp { dst: ValueId, cc: FloatCC, a: ValueId, b: ValueId },

    // Logical (operands already evaluated; short-circuit shape is
    // expressed in the CFG by the lowerer).
    LogAnd { dst: ValueId, a: ValueId, b: ValueId },
    LogOr { dst: ValueId, a: ValueId, b: ValueId },
    LogNot { dst: ValueId, src: ValueId },

    // Memory. All stack storage is explicit.
    Alloca { dst: ValueId, ty: TypeId },
    Load { dst: ValueId, ptr: ValueId },
    Store { ptr: ValueId, value: ValueId },
    FieldPtr { dst: ValueId, base: ValueId, field: u32 },
    IndexPtr { dst: ValueId, base: ValueId, index: ValueId },
    GlobalLoad { dst: ValueId, global: u32 },
    GlobalStore { global: u32, value: ValueId },

    // Calls.
    Call { dst: Option<ValueId>, callee: Callee, args: Vec<ValueId> },

    // Conversions. `ty` is the target type.
    Bitcast { dst: ValueId, src: ValueId, ty: TypeId },
    Sext { dst: ValueId, src: ValueId, ty: TypeId },
    Uext { dst: ValueId, src: ValueId, ty: TypeId },
    Trunc { dst: ValueId, src: ValueId, ty: TypeId },
    IntToFloat { dst: ValueId, src: ValueId, ty: TypeId },
    FloatToInt { dst: ValueId, src: ValueId, ty: TypeId },

    // Strings.
    StrConcat { dst: ValueId, a: ValueId, b: ValueId },
    StrLen { dst: ValueId, src: ValueId },
    StrCompare { dst: ValueId, a: ValueId, b: ValueId },
    /// Byte value at an index; out-of-range reads produce 0.
    StrIndex { dst: ValueId, src: ValueId, index: ValueId },
    StrSlice { dst: ValueId, src: ValueId, start: ValueId, end: ValueId },

    // Optionals.
    WrapOptional { dst: ValueId, src: ValueId },
    UnwrapOptional { dst: ValueId, src: ValueId },
    IsNull { dst: ValueId, src: ValueId },

    // Arrays and slices.
    ArrayNew { dst: ValueId, elem: TypeId, len: u32 },
    ArrayLoad { dst: ValueId, array: ValueId, index: ValueId },
    ArrayStore { array: ValueId, index: ValueId, value: ValueId },
    ArrayLen { dst: ValueId, array: ValueId },
    SliceNew { dst: ValueId, base: ValueId, start: ValueId, end: ValueId },
    SliceLen { dst: ValueId, src: ValueId },

    // Collection builtins.
    ListNew { dst: ValueId, elem: TypeId },
    ListPush { list: ValueId, value: ValueId },
    ListPop { dst: ValueId, list: ValueId },
    ListGet { dst: ValueId, list: ValueId, index: ValueId },
    ListSet { list: ValueId, index: ValueId, value: ValueId },
    ListLen { dst: ValueId, list: ValueId },
    MapNew { dst: ValueId, key: TypeId, value: TypeId },
    MapSet { map: ValueId, key: ValueId, value: ValueId },
    MapGet { dst: ValueId, map: ValueId, key: ValueId },
    MapHas { dst: ValueId, map: ValueId, key: ValueId },
    MapDelete { map: ValueId, key: ValueId },
    MapLen { dst: ValueId, map: ValueId },

    // User structs (heap records).
    RecordNew { dst: ValueId, ty: TypeId, fields: Vec<ValueId> },
    RecordGet { dst: ValueId, record: ValueId, field: u32 },
    RecordSet { record: ValueId, field: u32, value: ValueId },

    // Enum variants.
    VariantConstruct { dst: ValueId, ty: TypeId, tag: u32, payload: Vec<ValueId> },
    VariantTag { dst: ValueId, variant: ValueId },
    VariantPayload { dst: ValueId, variant: ValueId, index: u32 },

    // Ranges.
    RangeNew { dst: ValueId, lo: ValueId, hi: ValueId, inclusive: bool },

    // Closures.
    MakeClosure { dst: ValueId, func: FuncId, env: Vec<ValueId> },

    // Error handling. `SetHandler` arms the innermost handler; a
    // `Throw` terminator (or a throwing callee) transfers to it.
    SetHandler { target: BlockId },
    ClearHandler,
    /// Binds the in-flight thrown value at the entry of a handler
    /// block (the VM delivers it through the last-result register).
    CaughtValue { dst: ValueId },

    // SSA join. One argument per predecessor, in predecessor order.
    Phi { dst: ValueId, args: Vec<(BlockId, ValueId)> },

    // Source-line marker consumed by the emitter's debug-line table.
    DebugLine { line: u32 },
}

impl Inst {
    /// The value this instruction defines, if any.
    pub fn dst(&self) -> Option<ValueId> {
        use Inst::*;
        match self {
            IConst { dst, .. } | FConst { dst, .. } | SConst { dst, .. } | BConst { dst, .. }
            | DConst { dst, .. } | NullConst { dst } | IAdd { dst, .. } | ISub { dst, .. }
            | IMul { dst, .. } | SDiv { dst, .. } | UDiv { dst, .. } | SRem { dst, .. }
            | URem { dst, .. } | INeg { dst, .. } | FAdd { dst, .. } | FSub { dst, .. }
            | FMul { dst, .. } | FDiv { dst, .. } | FRem { dst, .. } | FNeg { dst, .. }
            | BAnd { dst, .. } | BOr { dst, .. } | BXor { dst, .. } | BNot { dst, .. }
            | Shl { dst, .. } | AShr { dst, .. } | LShr { dst, .. } | Icmp { dst, .. }
            | Fcmp { dst, .. } | LogAnd { dst, .. } | LogOr { dst, .. } | LogNot { dst, .. }
            | Alloca { dst, .. } | Load { dst, .. } | FieldPtr { dst, .. }
            | IndexPtr { dst, .. } | GlobalLoad { dst, .. } | Bitcast { dst, .. }
            | Sext { dst, .. } | Uext { dst, .. } | Trunc { dst, .. } | IntToFloat { dst, .. }
            | FloatToInt { dst, .. } | StrConcat { dst, .. } | StrLen { dst, .. }
            | StrCompare { dst, .. } | StrIndex { dst, .. } | StrSlice { dst, .. }
            | WrapOptional { dst, .. } | UnwrapOptional { dst, .. } | IsNull { dst, .. }
            | ArrayNew { dst, .. } | ArrayLoad { dst, .. } | ArrayLen { dst, .. }
            | SliceNew { dst, .. } | SliceLen { dst, .. } | ListNew { dst, .. }
            | ListPop { dst, .. } | ListGet { dst, .. } | ListLen { dst, .. }
            | MapNew { dst, .. } | MapGet { dst, .. } | MapHas { dst, .. }
            | MapLen { dst, .. } | RecordNew { dst, .. } | RecordGet { dst, .. }
            | VariantConstruct { dst, .. } | VariantTag { dst, .. }
            | VariantPayload { dst, .. } | RangeNew { dst, .. } | MakeClosure { dst, .. }
            | Copy { dst, .. } | CaughtValue { dst } | Phi { dst, .. } => Some(*dst),
            Call { dst, .. } => *dst,
            Store { .. } | GlobalStore { .. } | ArrayStore { .. } | ListPush { .. }
            | ListSet { .. } | MapSet { .. } | MapDelete { .. } | RecordSet { .. }
            | SetHandler { .. } | ClearHandler | DebugLine { .. } => None,
        }
    }

    /// Invokes `visit` for every value this instruction reads. Phi
    /// arguments are reported too; callers that need per-edge handling
    /// match on `Phi` directly.
    pub fn visit_uses(&self, mut visit: impl FnMut(ValueId)) {
        use Inst::*;
        match self {
            IConst { .. } | FConst { .. } | SConst { .. } | BConst { .. } | DConst { .. }
            | NullConst { .. } | Alloca { .. } | GlobalLoad { .. } | ArrayNew { .. }
            | ListNew { .. } | MapNew { .. } | SetHandler { .. } | ClearHandler
            | CaughtValue { .. } | DebugLine { .. } => {}

            Copy { src, .. } => visit(*src),

            INeg { src, .. } | FNeg { src, .. } | BNot { src, .. } | LogNot { src, .. }
            | Load { ptr: src, .. } | Bitcast { src, .. } | Sext { src, .. }
            | Uext { src, .. } | Trunc { src, .. } | IntToFloat { src, .. }
            | FloatToInt { src, .. } | StrLen { src, .. } | WrapOptional { src, .. }
            | UnwrapOptional { src, .. } | IsNull { src, .. } | SliceLen { src, .. } => {
                visit(*src)
            }

            IAdd { a, b, .. } | ISub { a, b, .. } | IMul { a, b, .. } | SDiv { a, b, .. }
            | UDiv { a, b, .. } | SRem { a, b, .. } | URem { a, b, .. } | FAdd { a, b, .. }
            | FSub { a, b, .. } | FMul { a, b, .. } | FDiv { a, b, .. } | FRem { a, b, .. }
            | BAnd { a, b, .. } | BOr { a, b, .. } | BXor { a, b, .. } | Shl { a, b, .. }
            | AShr { a, b, .. } | LShr { a, b, .. } | Icmp { a, b, .. } | Fcmp { a, b, .. }
            | LogAnd { a, b, .. } | LogOr { a, b, .. } | StrConcat { a, b, .. }
            | StrCompare { a, b, .. } => {
                visit(*a);
                visit(*b);
            }

            Store { ptr, value } => {
                visit(*ptr);
                visit(*value);
            }
            FieldPtr { base, .. } => visit(*base),
            IndexPtr { base, index, .. } => {
                visit(*base);
                visit(*index);
            }
            GlobalStore { value, .. } => visit(*value),

            Call { callee, args, .. } => {
                if let Callee::Closure(v) = callee {
                    visit(*v);
                }
                for a in args {
                    visit(*a);
                }
            }

            StrIndex { src, index, .. } => {
                visit(*src);
                visit(*index);
            }
            StrSlice {
                src, start, end, ..
            } => {
                visit(*src);
                visit(*start);
                visit(*end);
            }

            ArrayLoad { array, index, .. } => {
                visit(*array);
                visit(*index);
            }
            ArrayStore {
                array,
                index,
                value,
            } => {
                visit(*array);
                visit(*index);
                visit(*value);
            }
            ArrayLen { array, .. } => visit(*array),
            SliceNew {
                base, start, end, ..
            } => {
                visit(*base);
                visit(*start);
                visit(*end);
            }

            ListPush { list, value } => {
                visit(*list);
                visit(*value);
            }
            ListPop { list, .. } | ListLen { list, .. } => visit(*list),
            ListGet { list, index, .. } => {
                visit(*list);
                visit(*index);
            }
            ListSet { list, index, value } => {
                visit(*list);
                visit(*index);
                visit(*value);
            }
            MapSet { map, key, value } => {
                visit(*map);
                visit(*key);
                visit(*value);
            }
            MapGet { map, key, .. } | MapHas { map, key, .. } => {
                visit(*map);
                visit(*key);
            }
            MapDelete { map, key } => {
                visit(*map);
                visit(*key);
            }
            MapLen { map, .. } => visit(*map),

            RecordNew { fields, .. } => {
                for f in fields {
                    visit(*f);
                }
            }
            RecordGet { record, .. } => visit(*record),
            RecordSet { record, value, .. } => {
                visit(*record);
                visit(*value);
            }

            VariantConstruct { payload, .. } => {
                for p in payload {
                    visit(*p);
                }
            }
            VariantTag { variant, .. } => visit(*variant),
            VariantPayload { variant, .. } => visit(*variant),

            RangeNew { lo, hi, .. } => {
                visit(*lo);
                visit(*hi);
            }

            MakeClosure { env, .. } => {
                for v in env {
                    visit(*v);
                }
            }

            Phi { args, .. } => {
                for (_, v) in args {
                    visit(*v);
                }
            }
        }
    }

    /// True for instructions with no side effects whose result can be
    /// dropped when unused.
    pub fn is_pure(&self) -> bool {
        use Inst::*;
        match self {
            IConst { .. } | FConst { .. } | SConst { .. } | BConst { .. } | DConst { .. }
            | NullConst { .. } | IAdd { .. } | ISub { .. } | IMul { .. } | INeg { .. }
            | FAdd { .. } | FSub { .. } | FMul { .. } | FNeg { .. } | BAnd { .. } | BOr { .. }
            | BXor { .. } | BNot { .. } | Shl { .. } | AShr { .. } | LShr { .. }
            | Icmp { .. } | Fcmp { .. } | LogAnd { .. } | LogOr { .. } | LogNot { .. }
            | Bitcast { .. } | Sext { .. } | Uext { .. } | Trunc { .. } | IntToFloat { .. }
            | StrConcat { .. } | StrLen { .. } | StrCompare { .. } | StrIndex { .. }
            | StrSlice { .. } | WrapOptional { .. } | IsNull { .. } | FieldPtr { .. }
            | IndexPtr { .. } | RangeNew { .. } | Copy { .. } | Phi { .. } => true,
            // Division and remainder can trap; everything else reads
            // or writes state, allocates, or transfers control.
            _ => false,
        }
    }
}

/// A block terminator.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Terminator {
    /// Placeholder while a block is under construction; never valid in
    /// a finished module.
    Unterminated,
    Jump { target: BlockId },
    BrIf { cond: ValueId, then_target: BlockId, else_target: BlockId },
    /// Dense dispatch on a small non-negative integer (enum tags).
    BrTable { value: ValueId, targets: Vec<BlockId>, default: BlockId },
    Ret { value: Option<ValueId> },
    Throw { value: ValueId },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Unterminated | Terminator::Ret { .. } | Terminator::Throw { .. } => {
                Vec::new()
            }
            Terminator::Jump { target } => vec![*target],
            Terminator::BrIf {
                then_target,
                else_target,
                ..
            } => vec![*then_target, *else_target],
            Terminator::BrTable {
                targets, default, ..
            } => {
                let mut out = targets.clone();
                out.push(*default);
                out
            }
        }
    }

    pub fn visit_uses(&self, mut visit: impl FnMut(ValueId)) {
        match self {
            Terminator::Unterminated | Terminator::Jump { .. } => {}
            Terminator::BrIf { cond, .. } => visit(*cond),
            Terminator::BrTable { value, .. } => visit(*value),
            Terminator::Ret { value } => {
                if let Some(v) = value {
                    visit(*v);
                }
            }
            Terminator::Throw { value } => visit(*value),
        }
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}
