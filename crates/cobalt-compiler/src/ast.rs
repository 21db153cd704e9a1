//! The AST: three per-kind arenas (expressions, statements, type
//! references) owned by the parser, with `u32` ids as stable handles.
//! Ids stay valid until the whole [`Ast`] is dropped; non-optional
//! children are always valid ids, never sentinels.

use crate::pos::Pos;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeRefId(pub u32);

/// Arena storage for one compilation's AST.
#[derive(Debug, Default)]
pub struct Ast {
    exprs: Vec<Expr>,
    stmts: Vec<Stmt>,
    type_refs: Vec<TypeRef>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_expr(&mut self, kind: ExprKind, pos: Pos) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr { kind, pos });
        id
    }

    pub fn alloc_stmt(&mut self, kind: StmtKind, pos: Pos) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt { kind, pos });
        id
    }

    pub fn alloc_type_ref(&mut self, kind: TypeRefKind, pos: Pos) -> TypeRefId {
        let id = TypeRefId(self.type_refs.len() as u32);
        self.type_refs.push(TypeRef { kind, pos });
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn type_ref(&self, id: TypeRefId) -> &TypeRef {
        &self.type_refs[id.0 as usize]
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    pub fn type_ref_count(&self) -> usize {
        self.type_refs.len()
    }
}

/// A parsed file: its top-level items plus the arenas every id points
/// into.
#[derive(Debug)]
pub struct Program {
    pub items: Vec<Item>,
    pub ast: Ast,
}

#[derive(Clone, Debug)]
pub enum Item {
    Function(FnDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Impl(ImplBlock),
    Trait(TraitDecl),
    Union(UnionDecl),
    TypeAlias(AliasDecl),
    Test(TestDecl),
    Import(ImportDecl),
    Comptime(ComptimeBlock),
    Global(GlobalDecl),
}

#[derive(Clone, Debug)]
pub struct FnDecl {
    pub name: String,
    pub is_pub: bool,
    pub params: Vec<ParamDecl>,
    /// `None` means no declared result (`void`).
    pub ret: Option<TypeRefId>,
    /// Always a `StmtKind::Block`.
    pub body: StmtId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeRefId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct StructDecl {
    pub name: String,
    pub is_pub: bool,
    pub fields: Vec<FieldDecl>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRefId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct EnumDecl {
    pub name: String,
    pub is_pub: bool,
    pub variants: Vec<VariantDecl>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct VariantDecl {
    pub name: String,
    pub payload: VariantPayload,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub enum VariantPayload {
    Unit,
    /// `Name(T1, T2)`
    Tuple(Vec<TypeRefId>),
    /// `Name { field: T }`
    Struct(Vec<FieldDecl>),
}

#[derive(Clone, Debug)]
pub struct ImplBlock {
    /// Present for `impl Trait for Type`.
    pub trait_name: Option<String>,
    pub type_name: String,
    pub methods: Vec<FnDecl>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct TraitDecl {
    pub name: String,
    pub methods: Vec<TraitMethod>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct TraitMethod {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub ret: Option<TypeRefId>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct UnionDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct AliasDecl {
    pub name: String,
    pub ty: TypeRefId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct TestDecl {
    pub name: String,
    pub body: StmtId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct ImportDecl {
    pub path: String,
    pub alias: Option<String>,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct ComptimeBlock {
    pub body: StmtId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct GlobalDecl {
    pub name: String,
    pub is_mutable: bool,
    pub ty: Option<TypeRefId>,
    pub init: ExprId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    BoolLit(bool),
    NullLit,
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: ExprId,
    },
    Binary {
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
    },
    /// `cond ? a : b`
    Ternary {
        cond: ExprId,
        then_expr: ExprId,
        else_expr: ExprId,
    },
    /// `a ?: b` — `a` unless it is null.
    Elvis {
        value: ExprId,
        fallback: ExprId,
    },
    Assign {
        target: ExprId,
        value: ExprId,
    },
    Call {
        callee: ExprId,
        args: Vec<ExprId>,
    },
    MethodCall {
        recv: ExprId,
        method: String,
        args: Vec<ExprId>,
    },
    Field {
        base: ExprId,
        name: String,
    },
    OptionalField {
        base: ExprId,
        name: String,
    },
    Index {
        base: ExprId,
        index: ExprId,
    },
    OptionalIndex {
        base: ExprId,
        index: ExprId,
    },
    Slice {
        base: ExprId,
        start: ExprId,
        end: ExprId,
    },
    Range {
        lo: ExprId,
        hi: ExprId,
        inclusive: bool,
    },
    Cast {
        expr: ExprId,
        ty: TypeRefId,
    },
    /// `e is T`
    TypeTest {
        expr: ExprId,
        ty: TypeRefId,
    },
    /// `Foo{ .a = 1 }` (stack) or `new Foo{ .a = 1 }` / `new List<T>`
    /// (heap).
    StructInit {
        ty: TypeRefId,
        fields: Vec<(String, ExprId)>,
        heap: bool,
    },
    ArrayInit {
        items: Vec<ExprId>,
    },
    Lambda {
        params: Vec<LambdaParam>,
        ret: Option<TypeRefId>,
        body: StmtId,
    },
    /// Interpolated string: literal pieces and embedded expressions,
    /// in source order.
    InterpString {
        parts: Vec<InterpPart>,
    },
}

#[derive(Clone, Debug)]
pub enum InterpPart {
    Text(String),
    Expr(ExprId),
}

#[derive(Clone, Debug)]
pub struct LambdaParam {
    pub name: String,
    pub ty: Option<TypeRefId>,
    pub pos: Pos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    /// `var x = e` / `const x: T = e`.
    Var {
        name: String,
        is_mutable: bool,
        ty: Option<TypeRefId>,
        init: Option<ExprId>,
    },
    Expr(ExprId),
    Return(Option<ExprId>),
    If {
        cond: ExprId,
        then_block: StmtId,
        else_block: Option<StmtId>,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    /// `for x in iter { }` over a range or a collection; the checker
    /// decides which.
    For {
        binding: String,
        iter: ExprId,
        body: StmtId,
    },
    Block(Vec<StmtId>),
    Switch {
        scrutinee: ExprId,
        arms: Vec<SwitchArm>,
    },
    Loop {
        body: StmtId,
    },
    Defer(ExprId),
    TryCatch {
        try_block: StmtId,
        catch_name: String,
        catch_block: StmtId,
    },
    Throw(ExprId),
    Break,
    Continue,
}

#[derive(Clone, Debug)]
pub struct SwitchArm {
    pub pattern: Pattern,
    /// Always a `StmtKind::Block`.
    pub body: StmtId,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub enum Pattern {
    /// `_`
    Wildcard,
    /// An integer, string, or bool literal.
    Literal(ExprId),
    /// `Color.Red` or `Shape.Circle(r)` with payload bindings.
    Variant {
        enum_name: Option<String>,
        variant: String,
        bindings: Vec<String>,
    },
}

#[derive(Clone, Debug)]
pub struct TypeRef {
    pub kind: TypeRefKind,
    pub pos: Pos,
}

#[derive(Clone, Debug)]
pub enum TypeRefKind {
    /// A primitive or user type name.
    Named(String),
    Ptr(TypeRefId),
    Optional(TypeRefId),
    Array {
        len: u32,
        elem: TypeRefId,
    },
    Slice(TypeRefId),
    Function {
        params: Vec<TypeRefId>,
        ret: Option<TypeRefId>,
    },
    /// `List<T>`, `Map<K, V>`, or a user generic instance.
    Generic {
        name: String,
        args: Vec<TypeRefId>,
    },
}
