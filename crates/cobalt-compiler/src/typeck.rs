//! The type checker.
//!
//! Two passes: *collect* registers every top-level type and function
//! signature so forward references resolve, then *check bodies*
//! descends into each function with a scope stack. Every expression
//! gets a resolved type id in a side table parallel to the expression
//! arena; name and method resolutions are recorded for the lowerer.
//!
//! One diagnostic per distinct error; expressions that already failed
//! are poisoned with the error sentinel so cascades stay quiet.

use std::collections::HashMap;

use cobalt_ir::types::{self, TypeDesc, TypeId, TypeRegistry};
use cobalt_ir::types::EnumVariant;

use crate::ast::*;
use crate::diag::{DiagKind, Diagnostic};
use crate::pos::Pos;

/// A unique id per declared local binding (params, `var`/`const`,
/// `for` bindings, `catch` bindings, switch-arm payload bindings,
/// lambda params). The lowerer keys its storage on these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocalId(pub u32);

#[derive(Clone, Debug)]
pub struct LocalDecl {
    pub name: String,
    pub ty: TypeId,
    pub is_mutable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentTarget {
    Local(LocalId),
    Global(u32),
    /// A module function referenced as a value.
    Func(String),
    /// An enum type name, awaiting `.Variant`.
    EnumType(TypeId),
    /// An import alias; qualified access resolves into the shared
    /// namespace.
    Module,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallTarget {
    /// Direct call of a module function (or impl method by mangled
    /// name).
    Func(String),
    /// Runtime-provided function behind the native-call opcode.
    Native(String),
    /// A call through a closure-typed value.
    Closure,
    /// Enum variant construction.
    VariantCtor { enum_ty: TypeId, tag: u32 },
    /// A builtin collection/string method.
    Builtin(BuiltinCall),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinCall {
    ListPush,
    ListPop,
    ListGet,
    ListSet,
    ListLen,
    MapSet,
    MapGet,
    MapHas,
    MapDelete,
    MapLen,
    StrLen,
    SeqLen,
}

#[derive(Clone, Debug)]
pub struct FnSig {
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub is_pub: bool,
}

#[derive(Clone, Debug)]
pub struct GlobalSig {
    pub name: String,
    pub ty: TypeId,
    pub is_mutable: bool,
    pub init: ExprId,
}

#[derive(Clone, Debug, Default)]
pub struct ArmInfo {
    /// Variant tag for enum arms; `None` for literal/wildcard arms.
    pub tag: Option<u32>,
    pub bindings: Vec<LocalId>,
}

/// Everything the lowerer needs from type checking.
#[derive(Debug, Default)]
pub struct Typed {
    pub expr_types: Vec<TypeId>,
    pub idents: HashMap<ExprId, IdentTarget>,
    pub calls: HashMap<ExprId, CallTarget>,
    pub fields: HashMap<ExprId, u32>,
    /// Unit-variant references (`Color.Red` as a field expression).
    pub variant_refs: HashMap<ExprId, (TypeId, u32)>,
    /// Resolved target types of `is` tests.
    pub type_tests: HashMap<ExprId, TypeId>,
    pub locals: Vec<LocalDecl>,
    pub var_locals: HashMap<StmtId, LocalId>,
    pub for_locals: HashMap<StmtId, LocalId>,
    pub catch_locals: HashMap<StmtId, LocalId>,
    pub lambda_params: HashMap<ExprId, Vec<LocalId>>,
    pub lambda_names: HashMap<ExprId, String>,
    pub lambda_rets: HashMap<ExprId, TypeId>,
    pub fn_params: HashMap<String, Vec<LocalId>>,
    pub arm_info: HashMap<(StmtId, u32), ArmInfo>,
    pub fns: HashMap<String, FnSig>,
    /// Function names in declaration order; routine ids follow it.
    pub fn_order: Vec<String>,
    pub globals: Vec<GlobalSig>,
}

impl Typed {
    pub fn expr_type(&self, id: ExprId) -> TypeId {
        self.expr_types[id.0 as usize]
    }
}

#[derive(Clone, Debug)]
enum ScopeEntry {
    Local(LocalId),
    Global(u32),
    Func,
    EnumType(TypeId),
    Module,
}

/// Runs both passes over a merged item list (single- or multi-file).
pub fn check(
    items: &[Item],
    ast: &Ast,
    reg: &mut TypeRegistry,
) -> (Typed, Vec<Diagnostic>) {
    let mut checker = Checker::new(ast, reg);
    checker.collect(items);
    checker.check_bodies(items);
    let mut typed = checker.typed;
    typed.fns = checker.fns;
    (typed, checker.diags)
}

struct Checker<'a> {
    ast: &'a Ast,
    reg: &'a mut TypeRegistry,
    diags: Vec<Diagnostic>,
    typed: Typed,
    scopes: Vec<HashMap<String, ScopeEntry>>,
    fns: HashMap<String, FnSig>,
    methods: HashMap<(String, String), FnSig>,
    traits: HashMap<String, Vec<TraitMethod>>,
    aliases: HashMap<String, TypeId>,
    list_def: TypeId,
    map_def: TypeId,
    /// Receiver type while checking an impl body (`self`).
    self_ty: Option<TypeId>,
    current_ret: TypeId,
    loop_depth: u32,
}

impl<'a> Checker<'a> {
    fn new(ast: &'a Ast, reg: &'a mut TypeRegistry) -> Self {
        let list_def = reg.declare(TypeDesc::GenericDef {
            name: "List".to_string(),
            params: vec!["T".to_string()],
        });
        let map_def = reg.declare(TypeDesc::GenericDef {
            name: "Map".to_string(),
            params: vec!["K".to_string(), "V".to_string()],
        });
        let mut typed = Typed::default();
        typed.expr_types = vec![types::ERROR; ast.expr_count()];
        Self {
            ast,
            reg,
            diags: Vec::new(),
            typed,
            scopes: vec![HashMap::new()],
            fns: HashMap::new(),
            methods: HashMap::new(),
            traits: HashMap::new(),
            aliases: HashMap::new(),
            list_def,
            map_def,
            self_ty: None,
            current_ret: types::VOID,
            loop_depth: 0,
        }
    }

    fn error(&mut self, message: impl Into<String>, pos: Pos) {
        self.diags
            .push(Diagnostic::new(DiagKind::Semantic, message, pos));
    }

    // ----- collect pass -----

    fn collect(&mut self, items: &[Item]) {
        // Declare named types first so member types can refer to them
        // in any order.
        for item in items {
            match item {
                Item::Struct(s) => {
                    let id = self.reg.declare(TypeDesc::Struct {
                        name: s.name.clone(),
                        fields: Vec::new(),
                    });
                    self.declare_type_name(&s.name, id, s.pos);
                }
                Item::Union(u) => {
                    let id = self.reg.declare(TypeDesc::Struct {
                        name: u.name.clone(),
                        fields: Vec::new(),
                    });
                    self.declare_type_name(&u.name, id, u.pos);
                }
                Item::Enum(e) => {
                    let id = self.reg.declare(TypeDesc::Enum {
                        name: e.name.clone(),
                        variants: Vec::new(),
                    });
                    self.declare_type_name(&e.name, id, e.pos);
                    self.scopes[0].insert(e.name.clone(), ScopeEntry::EnumType(id));
                }
                Item::Trait(t) => {
                    if self.traits.insert(t.name.clone(), t.methods.clone()).is_some() {
                        self.error(format!("duplicate definition of trait `{}`", t.name), t.pos);
                    }
                }
                _ => {}
            }
        }

        // Aliases next (they may name the types above).
        for item in items {
            if let Item::TypeAlias(a) = item {
                let ty = self.resolve_type(a.ty);
                if self.aliases.insert(a.name.clone(), ty).is_some() {
                    self.error(format!("duplicate definition of type `{}`", a.name), a.pos);
                }
            }
        }

        // Fill in member types.
        for item in items {
            match item {
                Item::Struct(s) => {
                    let fields = self.resolve_fields(&s.fields);
                    let id = self.reg.lookup_named(&s.name).expect("declared above");
                    self.reg.define(
                        id,
                        TypeDesc::Struct {
                            name: s.name.clone(),
                            fields,
                        },
                    );
                }
                Item::Union(u) => {
                    let fields = self.resolve_fields(&u.fields);
                    let id = self.reg.lookup_named(&u.name).expect("declared above");
                    self.reg.define(
                        id,
                        TypeDesc::Struct {
                            name: u.name.clone(),
                            fields,
                        },
                    );
                }
                Item::Enum(e) => {
                    let mut variants = Vec::new();
                    for v in &e.variants {
                        let (payload, field_names) = match &v.payload {
                            VariantPayload::Unit => (Vec::new(), Vec::new()),
                            VariantPayload::Tuple(tys) => (
                                tys.iter().map(|t| self.resolve_type(*t)).collect(),
                                Vec::new(),
                            ),
                            VariantPayload::Struct(fields) => (
                                fields.iter().map(|f| self.resolve_type(f.ty)).collect(),
                                fields.iter().map(|f| f.name.clone()).collect(),
                            ),
                        };
                        variants.push(EnumVariant {
                            name: v.name.clone(),
                            payload,
                            field_names,
                        });
                    }
                    let id = self.reg.lookup_named(&e.name).expect("declared above");
                    self.reg.define(
                        id,
                        TypeDesc::Enum {
                            name: e.name.clone(),
                            variants,
                        },
                    );
                }
                _ => {}
            }
        }

        // Function and method signatures; globals.
        for item in items {
            match item {
                Item::Function(f) => self.collect_fn(f, None),
                Item::Impl(imp) => {
                    let self_ty = match self.reg.lookup_named(&imp.type_name) {
                        Some(id) => id,
                        None => {
                            self.error(
                                format!("unknown type `{}` in impl", imp.type_name),
                                imp.pos,
                            );
                            types::ERROR
                        }
                    };
                    for m in &imp.methods {
                        self.collect_method(&imp.type_name, self_ty, m);
                    }
                    if let Some(trait_name) = &imp.trait_name {
                        self.check_trait_conformance(trait_name, &imp.type_name, self_ty, imp);
                    }
                }
                Item::Test(t) => {
                    let name = format!("test${}", t.name);
                    self.typed.fn_order.push(name.clone());
                    self.fns.insert(
                        name,
                        FnSig {
                            params: Vec::new(),
                            ret: types::VOID,
                            is_pub: false,
                        },
                    );
                }
                Item::Global(g) => self.collect_global(g),
                _ => {}
            }
        }
    }

    fn declare_type_name(&mut self, name: &str, id: TypeId, pos: Pos) {
        let existing = self.reg.lookup_named(name);
        if existing != Some(id) {
            self.error(format!("duplicate definition of type `{name}`"), pos);
        }
    }

    fn collect_fn(&mut self, f: &FnDecl, mangled: Option<String>) {
        let name = mangled.unwrap_or_else(|| f.name.clone());
        let mut params = Vec::new();
        for p in &f.params {
            params.push(self.resolve_type(p.ty));
        }
        let ret = f.ret.map(|t| self.resolve_type(t)).unwrap_or(types::VOID);
        if self.fns.contains_key(&name) {
            self.error(format!("duplicate definition of `{name}`"), f.pos);
            return;
        }
        self.typed.fn_order.push(name.clone());
        self.fns.insert(
            name,
            FnSig {
                params,
                ret,
                is_pub: f.is_pub,
            },
        );
    }

    fn collect_method(&mut self, type_name: &str, self_ty: TypeId, m: &FnDecl) {
        let mangled = format!("{type_name}::{}", m.name);
        let mut params = Vec::new();
        for p in &m.params {
            if p.name == "self" {
                params.push(self_ty);
            } else {
                params.push(self.resolve_type(p.ty));
            }
        }
        let ret = m.ret.map(|t| self.resolve_type(t)).unwrap_or(types::VOID);
        let sig = FnSig {
            params,
            ret,
            is_pub: m.is_pub,
        };
        if self
            .methods
            .insert((type_name.to_string(), m.name.clone()), sig.clone())
            .is_some()
        {
            self.error(
                format!("duplicate method `{}` for `{type_name}`", m.name),
                m.pos,
            );
            return;
        }
        self.typed.fn_order.push(mangled.clone());
        self.fns.insert(mangled, sig);
    }

    fn check_trait_conformance(
        &mut self,
        trait_name: &str,
        type_name: &str,
        self_ty: TypeId,
        imp: &ImplBlock,
    ) {
        let Some(trait_methods) = self.traits.get(trait_name).cloned() else {
            self.error(format!("unknown trait `{trait_name}`"), imp.pos);
            return;
        };
        for tm in &trait_methods {
            let Some(sig) = self
                .methods
                .get(&(type_name.to_string(), tm.name.clone()))
                .cloned()
            else {
                self.error(
                    format!(
                        "`{type_name}` does not implement `{}` required by trait `{trait_name}`",
                        tm.name
                    ),
                    imp.pos,
                );
                continue;
            };
            let mut want: Vec<TypeId> = Vec::new();
            for p in &tm.params {
                if p.name == "self" {
                    want.push(self_ty);
                } else {
                    want.push(self.resolve_type(p.ty));
                }
            }
            let want_ret = tm.ret.map(|t| self.resolve_type(t)).unwrap_or(types::VOID);
            if sig.params != want || sig.ret != want_ret {
                self.error(
                    format!(
                        "method `{}` on `{type_name}` does not match trait `{trait_name}`",
                        tm.name
                    ),
                    imp.pos,
                );
            }
        }
    }

    fn collect_global(&mut self, g: &GlobalDecl) {
        let ty = match g.ty {
            Some(t) => self.resolve_type(t),
            // Unannotated globals are typed when their initializer is
            // checked, in declaration order.
            None => types::ERROR,
        };
        let idx = self.typed.globals.len() as u32;
        if self.scopes[0].contains_key(&g.name) {
            self.error(format!("duplicate definition of `{}`", g.name), g.pos);
            return;
        }
        self.typed.globals.push(GlobalSig {
            name: g.name.clone(),
            ty,
            is_mutable: g.is_mutable,
            init: g.init,
        });
        self.scopes[0].insert(g.name.clone(), ScopeEntry::Global(idx));
    }

    // ----- body pass -----

    fn check_bodies(&mut self, items: &[Item]) {
        // Make functions visible as scope entries for value position.
        let names: Vec<String> = self.fns.keys().cloned().collect();
        for name in names {
            if !name.contains("::") {
                self.scopes[0].insert(name.clone(), ScopeEntry::Func);
            }
        }

        // Globals: infer missing types from initializers, in order.
        for idx in 0..self.typed.globals.len() {
            let g = self.typed.globals[idx].clone();
            let init_ty = self.check_expr(g.init);
            if g.ty == types::ERROR {
                self.typed.globals[idx].ty = init_ty;
            } else if !self.assignable(init_ty, g.ty) {
                let pos = self.ast.expr(g.init).pos;
                let found = self.reg.display(init_ty);
                let want = self.reg.display(g.ty);
                self.error(
                    format!("cannot initialize `{}` ({want}) from {found}", g.name),
                    pos,
                );
            }
        }

        for item in items {
            match item {
                Item::Function(f) => self.check_fn_body(f, f.name.clone(), None),
                Item::Impl(imp) => {
                    let self_ty = self.reg.lookup_named(&imp.type_name);
                    for m in &imp.methods {
                        let mangled = format!("{}::{}", imp.type_name, m.name);
                        self.check_fn_body(m, mangled, self_ty);
                    }
                }
                Item::Test(t) => {
                    self.current_ret = types::VOID;
                    self.push_scope();
                    self.typed
                        .fn_params
                        .insert(format!("test${}", t.name), Vec::new());
                    self.check_stmt(t.body);
                    self.pop_scope();
                }
                Item::Comptime(c) => {
                    self.current_ret = types::VOID;
                    self.push_scope();
                    self.check_stmt(c.body);
                    self.pop_scope();
                }
                Item::Import(i) => {
                    if let Some(alias) = &i.alias {
                        self.scopes[0].insert(alias.clone(), ScopeEntry::Module);
                    }
                }
                _ => {}
            }
        }
    }

    fn check_fn_body(&mut self, f: &FnDecl, name: String, self_ty: Option<TypeId>) {
        let Some(sig) = self.fns.get(&name).cloned() else {
            return;
        };
        self.current_ret = sig.ret;
        self.self_ty = self_ty;
        self.push_scope();
        let mut param_locals = Vec::new();
        for (p, ty) in f.params.iter().zip(sig.params.iter()) {
            let local = self.new_local(p.name.clone(), *ty, false);
            self.bind(p.name.clone(), ScopeEntry::Local(local));
            param_locals.push(local);
        }
        self.typed.fn_params.insert(name, param_locals);
        self.check_stmt(f.body);
        self.pop_scope();
        self.self_ty = None;
    }

    // ----- scopes and locals -----

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: String, entry: ScopeEntry) {
        self.scopes.last_mut().expect("scope stack").insert(name, entry);
    }

    fn lookup(&self, name: &str) -> Option<&ScopeEntry> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn new_local(&mut self, name: String, ty: TypeId, is_mutable: bool) -> LocalId {
        let id = LocalId(self.typed.locals.len() as u32);
        self.typed.locals.push(LocalDecl {
            name,
            ty,
            is_mutable,
        });
        id
    }

    // ----- type references -----

    fn resolve_fields(&mut self, fields: &[FieldDecl]) -> Vec<(String, TypeId)> {
        fields
            .iter()
            .map(|f| (f.name.clone(), self.resolve_type(f.ty)))
            .collect()
    }

    fn resolve_type(&mut self, id: TypeRefId) -> TypeId {
        let tr = self.ast.type_ref(id).clone();
        match tr.kind {
            TypeRefKind::Named(name) => self.resolve_named_type(&name, tr.pos),
            TypeRefKind::Ptr(inner) => {
                let inner = self.resolve_type(inner);
                self.reg.ptr(inner)
            }
            TypeRefKind::Optional(inner) => {
                let inner = self.resolve_type(inner);
                self.reg.optional(inner)
            }
            TypeRefKind::Array { len, elem } => {
                let elem = self.resolve_type(elem);
                self.reg.array(elem, len)
            }
            TypeRefKind::Slice(inner) => {
                let inner = self.resolve_type(inner);
                self.reg.slice(inner)
            }
            TypeRefKind::Function { params, ret } => {
                let params: Vec<TypeId> = params.iter().map(|p| self.resolve_type(*p)).collect();
                let ret = ret.map(|r| self.resolve_type(r)).unwrap_or(types::VOID);
                self.reg.function(params, ret)
            }
            TypeRefKind::Generic { name, args } => {
                let args: Vec<TypeId> = args.iter().map(|a| self.resolve_type(*a)).collect();
                let base = match name.as_str() {
                    "List" => self.list_def,
                    "Map" => self.map_def,
                    other => match self.reg.lookup_named(other) {
                        Some(id) if matches!(self.reg.get(id), TypeDesc::GenericDef { .. }) => id,
                        _ => {
                            self.error(
                                format!("unknown generic type `{other}`"),
                                tr.pos,
                            );
                            return types::ERROR;
                        }
                    },
                };
                let want = match self.reg.get(base) {
                    TypeDesc::GenericDef { params, .. } => params.len(),
                    _ => 0,
                };
                if args.len() != want {
                    self.error(
                        format!("`{name}` expects {want} type arguments, got {}", args.len()),
                        tr.pos,
                    );
                    return types::ERROR;
                }
                self.reg.generic_inst(base, args)
            }
        }
    }

    fn resolve_named_type(&mut self, name: &str, pos: Pos) -> TypeId {
        match name {
            "void" => types::VOID,
            "bool" => types::BOOL,
            "i8" => types::I8,
            "i16" => types::I16,
            "i32" => types::I32,
            "i64" => types::I64,
            "u8" => types::U8,
            "u16" => types::U16,
            "u32" => types::U32,
            "u64" => types::U64,
            "f32" => types::F32,
            "f64" => types::F64,
            "string" => types::STR,
            "decimal" => types::DECIMAL,
            "Self" => self.self_ty.unwrap_or_else(|| {
                // `self` outside an impl body.
                types::ERROR
            }),
            other => {
                if let Some(&ty) = self.aliases.get(other) {
                    return ty;
                }
                if let Some(id) = self.reg.lookup_named(other) {
                    return id;
                }
                self.error(format!("unknown type `{other}`"), pos);
                types::ERROR
            }
        }
    }

    // ----- assignability and promotion -----

    fn assignable(&mut self, from: TypeId, to: TypeId) -> bool {
        if from == to || from == types::ERROR || to == types::ERROR {
            return true;
        }
        match (self.reg.get(from).clone(), self.reg.get(to).clone()) {
            // Integer widening within the same signedness.
            _ if self.reg.is_integer(from) && self.reg.is_integer(to) => {
                self.reg.is_signed(from) == self.reg.is_signed(to)
                    && self.reg.width(from) <= self.reg.width(to)
            }
            (TypeDesc::F32, TypeDesc::F64) => true,
            // Wrapping into an optional, and null into any optional.
            (_, TypeDesc::Optional(inner)) => from == inner || self.is_null_type(from),
            // An optional pointer is usable where the pointer is
            // expected; the unwrap traps on null at runtime.
            (TypeDesc::Optional(inner), TypeDesc::Ptr(_)) => inner == to,
            // Empty array literals become any slice.
            (TypeDesc::Array(_, 0), TypeDesc::Slice(_)) => true,
            (TypeDesc::Array(e1, _), TypeDesc::Slice(e2)) => e1 == e2,
            _ => false,
        }
    }

    fn is_null_type(&self, ty: TypeId) -> bool {
        // The null literal is typed as `?void`.
        matches!(self.reg.get(ty), TypeDesc::Optional(inner) if *inner == types::VOID)
    }

    fn promote_numeric(&mut self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if a == types::ERROR || b == types::ERROR {
            return Some(types::ERROR);
        }
        if a == types::DECIMAL && b == types::DECIMAL {
            return Some(types::DECIMAL);
        }
        if self.reg.is_float(a) || self.reg.is_float(b) {
            if !self.reg.is_numeric(a) || !self.reg.is_numeric(b) {
                return None;
            }
            let w = self.reg.width(a).unwrap_or(64).max(self.reg.width(b).unwrap_or(64));
            return Some(if w <= 32 && self.reg.is_float(a) && self.reg.is_float(b) {
                types::F32
            } else {
                types::F64
            });
        }
        if self.reg.is_integer(a) && self.reg.is_integer(b) {
            let w = self.reg.width(a).unwrap().max(self.reg.width(b).unwrap());
            let signed = self.reg.is_signed(a) || self.reg.is_signed(b);
            return Some(match (signed, w) {
                (true, 8) => types::I8,
                (true, 16) => types::I16,
                (true, 32) => types::I32,
                (true, _) => types::I64,
                (false, 8) => types::U8,
                (false, 16) => types::U16,
                (false, 32) => types::U32,
                (false, _) => types::U64,
            });
        }
        None
    }

    // ----- statements -----

    fn check_stmt(&mut self, id: StmtId) {
        let stmt = self.ast.stmt(id).clone();
        match stmt.kind {
            StmtKind::Block(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.check_stmt(s);
                }
                self.pop_scope();
            }
            StmtKind::Var {
                name,
                is_mutable,
                ty,
                init,
            } => {
                let declared = ty.map(|t| self.resolve_type(t));
                let init_ty = init.map(|e| self.check_expr(e));
                let ty = match (declared, init_ty) {
                    (Some(want), Some(found)) => {
                        if !self.assignable(found, want) {
                            let found_s = self.reg.display(found);
                            let want_s = self.reg.display(want);
                            self.error(
                                format!("cannot initialize `{name}` ({want_s}) from {found_s}"),
                                stmt.pos,
                            );
                        }
                        want
                    }
                    (Some(want), None) => want,
                    (None, Some(found)) => {
                        if self.is_null_type(found) {
                            self.error(
                                format!("cannot infer a type for `{name}` from `null`"),
                                stmt.pos,
                            );
                            types::ERROR
                        } else {
                            found
                        }
                    }
                    (None, None) => {
                        self.error(
                            format!("`{name}` needs a type annotation or an initializer"),
                            stmt.pos,
                        );
                        types::ERROR
                    }
                };
                let local = self.new_local(name.clone(), ty, is_mutable);
                self.bind(name, ScopeEntry::Local(local));
                self.typed.var_locals.insert(id, local);
            }
            StmtKind::Expr(e) => {
                self.check_expr(e);
            }
            StmtKind::Return(value) => {
                let found = value.map(|e| self.check_expr(e)).unwrap_or(types::VOID);
                let want = self.current_ret;
                if !self.assignable(found, want) {
                    let found_s = self.reg.display(found);
                    let want_s = self.reg.display(want);
                    self.error(
                        format!("return type mismatch: expected {want_s}, found {found_s}"),
                        stmt.pos,
                    );
                }
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.check_bool_cond(cond);
                self.check_stmt(then_block);
                if let Some(e) = else_block {
                    self.check_stmt(e);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_bool_cond(cond);
                self.loop_depth += 1;
                self.check_stmt(body);
                self.loop_depth -= 1;
            }
            StmtKind::For {
                binding,
                iter,
                body,
            } => {
                let iter_ty = self.check_expr(iter);
                let elem = self.for_element_type(iter_ty, self.ast.expr(iter).pos);
                self.push_scope();
                let local = self.new_local(binding.clone(), elem, false);
                self.bind(binding, ScopeEntry::Local(local));
                self.typed.for_locals.insert(id, local);
                self.loop_depth += 1;
                self.check_stmt(body);
                self.loop_depth -= 1;
                self.pop_scope();
            }
            StmtKind::Loop { body } => {
                self.loop_depth += 1;
                self.check_stmt(body);
                self.loop_depth -= 1;
            }
            StmtKind::Switch { scrutinee, arms } => {
                self.check_switch(id, scrutinee, &arms);
            }
            StmtKind::Defer(e) => {
                self.check_expr(e);
            }
            StmtKind::TryCatch {
                try_block,
                catch_name,
                catch_block,
            } => {
                self.check_stmt(try_block);
                self.push_scope();
                // Thrown values travel as i64 error payloads unless a
                // richer error type is thrown; the catch binding sees
                // the dynamic payload as i64.
                let local = self.new_local(catch_name.clone(), types::I64, false);
                self.bind(catch_name, ScopeEntry::Local(local));
                self.typed.catch_locals.insert(id, local);
                self.check_stmt(catch_block);
                self.pop_scope();
            }
            StmtKind::Throw(e) => {
                let ty = self.check_expr(e);
                if ty != types::ERROR && !self.reg.is_integer(ty) && ty != types::STR {
                    let ty_s = self.reg.display(ty);
                    self.error(
                        format!("cannot throw a value of type {ty_s}"),
                        stmt.pos,
                    );
                }
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    self.error("`break`/`continue` outside of a loop", stmt.pos);
                }
            }
        }
    }

    fn check_bool_cond(&mut self, cond: ExprId) {
        let ty = self.check_expr(cond);
        if ty != types::BOOL && ty != types::ERROR {
            let pos = self.ast.expr(cond).pos;
            let ty_s = self.reg.display(ty);
            self.error(format!("condition must be bool, found {ty_s}"), pos);
        }
    }

    fn for_element_type(&mut self, iter_ty: TypeId, pos: Pos) -> TypeId {
        match self.reg.get(iter_ty).clone() {
            TypeDesc::Range { .. } => types::I64,
            TypeDesc::Array(elem, _) | TypeDesc::Slice(elem) => elem,
            TypeDesc::GenericInst { base, args } if base == self.list_def => args[0],
            TypeDesc::Str => types::I64,
            TypeDesc::Error => types::ERROR,
            other => {
                let _ = other;
                let ty_s = self.reg.display(iter_ty);
                self.error(format!("cannot iterate over {ty_s}"), pos);
                types::ERROR
            }
        }
    }

    fn check_switch(&mut self, id: StmtId, scrutinee: ExprId, arms: &[SwitchArm]) {
        let scrut_ty = self.check_expr(scrutinee);
        let enum_variants = match self.reg.get(scrut_ty).clone() {
            TypeDesc::Enum { variants, .. } => Some(variants),
            _ => None,
        };

        let mut covered: Vec<u32> = Vec::new();
        let mut has_wildcard = false;

        for (idx, arm) in arms.iter().enumerate() {
            let mut info = ArmInfo::default();
            match &arm.pattern {
                Pattern::Wildcard => {
                    has_wildcard = true;
                    self.check_stmt(arm.body);
                }
                Pattern::Literal(e) => {
                    let lit_ty = self.check_expr(*e);
                    if !self.assignable(lit_ty, scrut_ty) && !self.assignable(scrut_ty, lit_ty) {
                        let lit_s = self.reg.display(lit_ty);
                        let scrut_s = self.reg.display(scrut_ty);
                        self.error(
                            format!("pattern type {lit_s} does not match switch value {scrut_s}"),
                            arm.pos,
                        );
                    }
                    self.check_stmt(arm.body);
                }
                Pattern::Variant {
                    enum_name,
                    variant,
                    bindings,
                } => {
                    let Some(variants) = &enum_variants else {
                        if scrut_ty != types::ERROR {
                            let scrut_s = self.reg.display(scrut_ty);
                            self.error(
                                format!("variant pattern on non-enum value ({scrut_s})"),
                                arm.pos,
                            );
                        }
                        self.check_stmt(arm.body);
                        self.typed.arm_info.insert((id, idx as u32), info);
                        continue;
                    };
                    if let Some(en) = enum_name {
                        let named = self.reg.lookup_named(en);
                        if named != Some(scrut_ty) {
                            self.error(
                                format!("pattern names `{en}`, but the switch value is a different enum"),
                                arm.pos,
                            );
                        }
                    }
                    let Some(tag) = variants.iter().position(|v| &v.name == variant) else {
                        self.error(format!("unknown variant `{variant}`"), arm.pos);
                        self.check_stmt(arm.body);
                        self.typed.arm_info.insert((id, idx as u32), info);
                        continue;
                    };
                    let payload = variants[tag].payload.clone();
                    if bindings.len() != payload.len() {
                        self.error(
                            format!(
                                "variant `{variant}` has {} payload values, pattern binds {}",
                                payload.len(),
                                bindings.len()
                            ),
                            arm.pos,
                        );
                    }
                    covered.push(tag as u32);
                    info.tag = Some(tag as u32);
                    self.push_scope();
                    for (bname, bty) in bindings.iter().zip(payload.iter()) {
                        let local = self.new_local(bname.clone(), *bty, false);
                        self.bind(bname.clone(), ScopeEntry::Local(local));
                        info.bindings.push(local);
                    }
                    self.check_stmt(arm.body);
                    self.pop_scope();
                }
            }
            self.typed.arm_info.insert((id, idx as u32), info);
        }

        if let Some(variants) = &enum_variants {
            if !has_wildcard {
                let missing: Vec<&str> = variants
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !covered.contains(&(*i as u32)))
                    .map(|(_, v)| v.name.as_str())
                    .collect();
                if !missing.is_empty() {
                    let pos = self.ast.stmt(id).pos;
                    self.error(
                        format!(
                            "non-exhaustive switch: missing {} (or add a `_` arm)",
                            missing.join(", ")
                        ),
                        pos,
                    );
                }
            }
        }
    }

    // ----- expressions -----

    fn set_type(&mut self, id: ExprId, ty: TypeId) -> TypeId {
        self.typed.expr_types[id.0 as usize] = ty;
        ty
    }

    fn check_expr(&mut self, id: ExprId) -> TypeId {
        let expr = self.ast.expr(id).clone();
        let ty = self.check_expr_kind(id, &expr.kind, expr.pos);
        self.set_type(id, ty)
    }

    fn check_expr_kind(&mut self, id: ExprId, kind: &ExprKind, pos: Pos) -> TypeId {
        match kind {
            ExprKind::IntLit(_) => types::I64,
            ExprKind::FloatLit(_) => types::F64,
            ExprKind::StrLit(_) => types::STR,
            ExprKind::BoolLit(_) => types::BOOL,
            ExprKind::NullLit => self.reg.optional(types::VOID),
            ExprKind::Ident(name) => self.check_ident(id, name, pos),
            ExprKind::Unary { op, expr } => {
                let ty = self.check_expr(*expr);
                match op {
                    UnaryOp::Neg => {
                        if ty != types::ERROR && !self.reg.is_numeric(ty) {
                            let ty_s = self.reg.display(ty);
                            self.error(format!("cannot negate {ty_s}"), pos);
                            return types::ERROR;
                        }
                        ty
                    }
                    UnaryOp::Not => {
                        if ty != types::BOOL && ty != types::ERROR {
                            let ty_s = self.reg.display(ty);
                            self.error(format!("`!` needs bool, found {ty_s}"), pos);
                            return types::ERROR;
                        }
                        types::BOOL
                    }
                    UnaryOp::BitNot => {
                        if ty != types::ERROR && !self.reg.is_integer(ty) {
                            let ty_s = self.reg.display(ty);
                            self.error(format!("`~` needs an integer, found {ty_s}"), pos);
                            return types::ERROR;
                        }
                        ty
                    }
                }
            }
            ExprKind::Binary { op, left, right } => self.check_binary(*op, *left, *right, pos),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.check_bool_cond(*cond);
                let t = self.check_expr(*then_expr);
                let e = self.check_expr(*else_expr);
                if self.assignable(e, t) {
                    t
                } else if self.assignable(t, e) {
                    e
                } else {
                    let t_s = self.reg.display(t);
                    let e_s = self.reg.display(e);
                    self.error(format!("ternary branches disagree: {t_s} vs {e_s}"), pos);
                    types::ERROR
                }
            }
            ExprKind::Elvis { value, fallback } => {
                let v = self.check_expr(*value);
                let f = self.check_expr(*fallback);
                match self.reg.get(v).clone() {
                    TypeDesc::Optional(inner) => {
                        if !self.assignable(f, inner) {
                            let f_s = self.reg.display(f);
                            let i_s = self.reg.display(inner);
                            self.error(
                                format!("`?:` fallback ({f_s}) does not match {i_s}"),
                                pos,
                            );
                        }
                        inner
                    }
                    TypeDesc::Error => types::ERROR,
                    _ => {
                        let v_s = self.reg.display(v);
                        self.error(format!("`?:` needs an optional, found {v_s}"), pos);
                        types::ERROR
                    }
                }
            }
            ExprKind::Assign { target, value } => {
                let target_ty = self.check_expr(*target);
                let value_ty = self.check_expr(*value);
                self.check_lvalue(*target);
                if !self.assignable(value_ty, target_ty) {
                    let v_s = self.reg.display(value_ty);
                    let t_s = self.reg.display(target_ty);
                    self.error(format!("cannot assign {v_s} to {t_s}"), pos);
                }
                types::VOID
            }
            ExprKind::Call { callee, args } => self.check_call(id, *callee, args, pos),
            ExprKind::MethodCall { recv, method, args } => {
                self.check_method_call(id, *recv, method, args, pos)
            }
            ExprKind::Field { base, name } => self.check_field(id, *base, name, pos, false),
            ExprKind::OptionalField { base, name } => {
                self.check_field(id, *base, name, pos, true)
            }
            ExprKind::Index { base, index } => self.check_index(*base, *index, pos, false),
            ExprKind::OptionalIndex { base, index } => {
                self.check_index(*base, *index, pos, true)
            }
            ExprKind::Slice { base, start, end } => {
                let base_ty = self.check_expr(*base);
                let start_ty = self.check_expr(*start);
                let end_ty = self.check_expr(*end);
                for (ty, e) in [(start_ty, *start), (end_ty, *end)] {
                    if ty != types::ERROR && !self.reg.is_integer(ty) {
                        let pos = self.ast.expr(e).pos;
                        let ty_s = self.reg.display(ty);
                        self.error(format!("slice bound must be an integer, found {ty_s}"), pos);
                    }
                }
                match self.reg.get(base_ty).clone() {
                    TypeDesc::Str => types::STR,
                    TypeDesc::Array(elem, _) | TypeDesc::Slice(elem) => self.reg.slice(elem),
                    TypeDesc::Error => types::ERROR,
                    _ => {
                        let ty_s = self.reg.display(base_ty);
                        self.error(format!("cannot slice {ty_s}"), pos);
                        types::ERROR
                    }
                }
            }
            ExprKind::Range { lo, hi, inclusive } => {
                let lo_ty = self.check_expr(*lo);
                let hi_ty = self.check_expr(*hi);
                for (ty, e) in [(lo_ty, *lo), (hi_ty, *hi)] {
                    if ty != types::ERROR && !self.reg.is_integer(ty) {
                        let pos = self.ast.expr(e).pos;
                        let ty_s = self.reg.display(ty);
                        self.error(format!("range bound must be an integer, found {ty_s}"), pos);
                    }
                }
                self.reg.range(*inclusive)
            }
            ExprKind::Cast { expr, ty } => {
                let from = self.check_expr(*expr);
                let to = self.resolve_type(*ty);
                self.check_cast(from, to, pos);
                to
            }
            ExprKind::TypeTest { expr, ty } => {
                self.check_expr(*expr);
                let target = self.resolve_type(*ty);
                self.typed.type_tests.insert(id, target);
                types::BOOL
            }
            ExprKind::StructInit { ty, fields, heap } => {
                self.check_struct_init(*ty, fields, *heap, pos)
            }
            ExprKind::ArrayInit { items } => {
                let mut elem = None;
                for item in items {
                    let ty = self.check_expr(*item);
                    match elem {
                        None => elem = Some(ty),
                        Some(prev) => {
                            if !self.assignable(ty, prev) {
                                let pos = self.ast.expr(*item).pos;
                                let prev_s = self.reg.display(prev);
                                let ty_s = self.reg.display(ty);
                                self.error(
                                    format!("array element {ty_s} does not match {prev_s}"),
                                    pos,
                                );
                            }
                        }
                    }
                }
                let elem = elem.unwrap_or(types::VOID);
                self.reg.array(elem, items.len() as u32)
            }
            ExprKind::Lambda { params, ret, body } => {
                self.check_lambda(id, params, *ret, *body)
            }
            ExprKind::InterpString { parts } => {
                for part in parts {
                    if let InterpPart::Expr(e) = part {
                        let ty = self.check_expr(*e);
                        if ty != types::ERROR
                            && ty != types::STR
                            && !self.reg.is_numeric(ty)
                            && ty != types::BOOL
                        {
                            let pos = self.ast.expr(*e).pos;
                            let ty_s = self.reg.display(ty);
                            self.error(
                                format!("cannot interpolate a value of type {ty_s}"),
                                pos,
                            );
                        }
                    }
                }
                types::STR
            }
        }
    }

    fn check_ident(&mut self, id: ExprId, name: &str, pos: Pos) -> TypeId {
        if name == "self" {
            if let Some(entry) = self.lookup("self").cloned() {
                if let ScopeEntry::Local(local) = entry {
                    self.typed.idents.insert(id, IdentTarget::Local(local));
                    return self.typed.locals[local.0 as usize].ty;
                }
            }
            if self.self_ty.is_none() {
                self.error("`self` outside of a method", pos);
                return types::ERROR;
            }
        }
        match self.lookup(name).cloned() {
            Some(ScopeEntry::Local(local)) => {
                self.typed.idents.insert(id, IdentTarget::Local(local));
                self.typed.locals[local.0 as usize].ty
            }
            Some(ScopeEntry::Global(idx)) => {
                self.typed.idents.insert(id, IdentTarget::Global(idx));
                self.typed.globals[idx as usize].ty
            }
            Some(ScopeEntry::Func) => {
                self.typed
                    .idents
                    .insert(id, IdentTarget::Func(name.to_string()));
                let sig = &self.fns[name];
                let (params, ret) = (sig.params.clone(), sig.ret);
                self.reg.function(params, ret)
            }
            Some(ScopeEntry::EnumType(ty)) => {
                self.typed.idents.insert(id, IdentTarget::EnumType(ty));
                // Not a value by itself; `.Variant` must follow.
                ty
            }
            Some(ScopeEntry::Module) => {
                self.typed.idents.insert(id, IdentTarget::Module);
                types::VOID
            }
            None => {
                self.error(format!("undefined identifier `{name}`"), pos);
                types::ERROR
            }
        }
    }

    fn check_binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId, pos: Pos) -> TypeId {
        let l = self.check_expr(left);
        let r = self.check_expr(right);
        if l == types::ERROR || r == types::ERROR {
            return types::ERROR;
        }
        match op {
            BinaryOp::Add if l == types::STR && r == types::STR => types::STR,
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Rem => match self.promote_numeric(l, r) {
                Some(ty) => ty,
                None => {
                    let l_s = self.reg.display(l);
                    let r_s = self.reg.display(r);
                    self.error(format!("invalid operands {l_s} and {r_s}"), pos);
                    types::ERROR
                }
            },
            BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::Shl
            | BinaryOp::Shr => {
                if !self.reg.is_integer(l) || !self.reg.is_integer(r) {
                    let l_s = self.reg.display(l);
                    let r_s = self.reg.display(r);
                    self.error(format!("bitwise operands must be integers, found {l_s} and {r_s}"), pos);
                    return types::ERROR;
                }
                if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
                    l
                } else {
                    self.promote_numeric(l, r).unwrap_or(types::ERROR)
                }
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let comparable = self.assignable(l, r)
                    || self.assignable(r, l)
                    || self.promote_numeric(l, r).is_some();
                if !comparable {
                    let l_s = self.reg.display(l);
                    let r_s = self.reg.display(r);
                    self.error(format!("cannot compare {l_s} with {r_s}"), pos);
                }
                types::BOOL
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ok = (l == types::STR && r == types::STR)
                    || self.promote_numeric(l, r).is_some();
                if !ok {
                    let l_s = self.reg.display(l);
                    let r_s = self.reg.display(r);
                    self.error(format!("cannot order {l_s} with {r_s}"), pos);
                }
                types::BOOL
            }
            BinaryOp::And | BinaryOp::Or => {
                for (ty, e) in [(l, left), (r, right)] {
                    if ty != types::BOOL {
                        let pos = self.ast.expr(e).pos;
                        let ty_s = self.reg.display(ty);
                        self.error(format!("logical operand must be bool, found {ty_s}"), pos);
                    }
                }
                types::BOOL
            }
        }
    }

    fn check_lvalue(&mut self, target: ExprId) {
        let expr = self.ast.expr(target).clone();
        match &expr.kind {
            ExprKind::Ident(name) => {
                if let Some(ScopeEntry::Local(local)) = self.lookup(name).cloned() {
                    if !self.typed.locals[local.0 as usize].is_mutable {
                        self.error(format!("cannot assign to immutable `{name}`"), expr.pos);
                    }
                } else if let Some(ScopeEntry::Global(idx)) = self.lookup(name).cloned() {
                    if !self.typed.globals[idx as usize].is_mutable {
                        self.error(format!("cannot assign to constant `{name}`"), expr.pos);
                    }
                }
            }
            ExprKind::Field { .. } | ExprKind::Index { .. } => {}
            _ => {
                self.error("invalid assignment target", expr.pos);
            }
        }
    }

    fn check_call(&mut self, id: ExprId, callee: ExprId, args: &[ExprId], pos: Pos) -> TypeId {
        let arg_types: Vec<TypeId> = args.iter().map(|a| self.check_expr(*a)).collect();
        let callee_expr = self.ast.expr(callee).clone();

        match &callee_expr.kind {
            // Direct calls by name: module functions, natives, and
            // explicit conversions.
            ExprKind::Ident(name) => {
                if let Some(sig) = self.fns.get(name).cloned() {
                    let fn_ty = {
                        let params = sig.params.clone();
                        self.reg.function(params, sig.ret)
                    };
                    self.set_type(callee, fn_ty);
                    self.typed.calls.insert(id, CallTarget::Func(name.clone()));
                    self.check_args(name, &sig.params, &arg_types, args, pos);
                    return sig.ret;
                }
                if let Some(ret) = self.check_native_call(id, name, &arg_types, args, pos) {
                    self.set_type(callee, types::VOID);
                    return ret;
                }
                // A local/global holding a closure.
                let callee_ty = self.check_expr(callee);
                return self.check_closure_call(id, callee_ty, &arg_types, pos);
            }
            // `Enum.Variant(payload)` and `alias.func(args)`.
            ExprKind::Field { base, name } => {
                let base_expr = self.ast.expr(*base).clone();
                if let ExprKind::Ident(base_name) = &base_expr.kind {
                    match self.lookup(base_name).cloned() {
                        Some(ScopeEntry::EnumType(enum_ty)) => {
                            self.set_type(*base, enum_ty);
                            self.set_type(callee, enum_ty);
                            return self.check_variant_ctor(
                                id, enum_ty, name, &arg_types, pos,
                            );
                        }
                        Some(ScopeEntry::Module) => {
                            self.set_type(*base, types::VOID);
                            if let Some(sig) = self.fns.get(name).cloned() {
                                let fn_ty = {
                                    let params = sig.params.clone();
                                    self.reg.function(params, sig.ret)
                                };
                                self.set_type(callee, fn_ty);
                                self.typed
                                    .calls
                                    .insert(id, CallTarget::Func(name.clone()));
                                self.check_args(name, &sig.params, &arg_types, args, pos);
                                return sig.ret;
                            }
                            self.error(format!("undefined function `{name}`"), pos);
                            return types::ERROR;
                        }
                        _ => {}
                    }
                }
                let callee_ty = self.check_expr(callee);
                self.check_closure_call(id, callee_ty, &arg_types, pos)
            }
            _ => {
                let callee_ty = self.check_expr(callee);
                self.check_closure_call(id, callee_ty, &arg_types, pos)
            }
        }
    }

    fn check_args(
        &mut self,
        name: &str,
        params: &[TypeId],
        arg_types: &[TypeId],
        args: &[ExprId],
        pos: Pos,
    ) {
        if params.len() != arg_types.len() {
            self.error(
                format!(
                    "`{name}` expects {} arguments, got {}",
                    params.len(),
                    arg_types.len()
                ),
                pos,
            );
            return;
        }
        for ((want, found), arg) in params.iter().zip(arg_types).zip(args) {
            if !self.assignable(*found, *want) {
                let apos = self.ast.expr(*arg).pos;
                let found_s = self.reg.display(*found);
                let want_s = self.reg.display(*want);
                self.error(
                    format!("argument type mismatch: expected {want_s}, found {found_s}"),
                    apos,
                );
            }
        }
    }

    /// Runtime functions reachable through the native-call opcode.
    fn check_native_call(
        &mut self,
        id: ExprId,
        name: &str,
        arg_types: &[TypeId],
        args: &[ExprId],
        pos: Pos,
    ) -> Option<TypeId> {
        let scalar_ok = |reg: &TypeRegistry, ty: TypeId| {
            reg.is_numeric(ty) || ty == types::BOOL || ty == types::STR || ty == types::ERROR
        };
        let ret = match name {
            "println" | "print" | "eprintln" => {
                self.expect_args(name, 1, arg_types.len(), pos);
                if let Some(&ty) = arg_types.first() {
                    if ty != types::STR && ty != types::ERROR {
                        let ty_s = self.reg.display(ty);
                        self.error(format!("`{name}` takes a string, found {ty_s}"), pos);
                    }
                }
                types::VOID
            }
            // Explicit conversions (`int <-> string` only via calls).
            "string" => {
                self.expect_args(name, 1, arg_types.len(), pos);
                if let Some(&ty) = arg_types.first() {
                    if !scalar_ok(self.reg, ty) {
                        let ty_s = self.reg.display(ty);
                        self.error(format!("`string` cannot convert {ty_s}"), pos);
                    }
                }
                types::STR
            }
            "int" => {
                self.expect_args(name, 1, arg_types.len(), pos);
                if let Some(&ty) = arg_types.first() {
                    if ty != types::STR && ty != types::ERROR {
                        let ty_s = self.reg.display(ty);
                        self.error(format!("`int` parses a string, found {ty_s}"), pos);
                    }
                }
                types::I64
            }
            "float" => {
                self.expect_args(name, 1, arg_types.len(), pos);
                types::F64
            }
            "panic" => {
                self.expect_args(name, 1, arg_types.len(), pos);
                types::VOID
            }
            "process_args" => {
                self.expect_args(name, 0, arg_types.len(), pos);
                self.reg.slice(types::STR)
            }
            "read_file" => {
                self.expect_args(name, 1, arg_types.len(), pos);
                types::STR
            }
            "write_file" => {
                self.expect_args(name, 2, arg_types.len(), pos);
                types::VOID
            }
            _ => return None,
        };
        let _ = args;
        self.typed
            .calls
            .insert(id, CallTarget::Native(name.to_string()));
        Some(ret)
    }

    fn expect_args(&mut self, name: &str, want: usize, got: usize, pos: Pos) {
        if want != got {
            self.error(format!("`{name}` expects {want} arguments, got {got}"), pos);
        }
    }

    fn check_closure_call(
        &mut self,
        id: ExprId,
        callee_ty: TypeId,
        arg_types: &[TypeId],
        pos: Pos,
    ) -> TypeId {
        match self.reg.get(callee_ty).clone() {
            TypeDesc::Function { params, ret } => {
                self.typed.calls.insert(id, CallTarget::Closure);
                if params.len() != arg_types.len() {
                    self.error(
                        format!(
                            "call expects {} arguments, got {}",
                            params.len(),
                            arg_types.len()
                        ),
                        pos,
                    );
                } else {
                    for (want, found) in params.iter().zip(arg_types) {
                        if !self.assignable(*found, *want) {
                            let found_s = self.reg.display(*found);
                            let want_s = self.reg.display(*want);
                            self.error(
                                format!(
                                    "argument type mismatch: expected {want_s}, found {found_s}"
                                ),
                                pos,
                            );
                        }
                    }
                }
                ret
            }
            TypeDesc::Error => types::ERROR,
            _ => {
                let ty_s = self.reg.display(callee_ty);
                self.error(format!("cannot call a value of type {ty_s}"), pos);
                types::ERROR
            }
        }
    }

    fn check_variant_ctor(
        &mut self,
        id: ExprId,
        enum_ty: TypeId,
        variant: &str,
        arg_types: &[TypeId],
        pos: Pos,
    ) -> TypeId {
        let TypeDesc::Enum { variants, .. } = self.reg.get(enum_ty).clone() else {
            return types::ERROR;
        };
        let Some(tag) = variants.iter().position(|v| v.name == variant) else {
            self.error(format!("unknown variant `{variant}`"), pos);
            return types::ERROR;
        };
        let payload = &variants[tag].payload;
        if payload.len() != arg_types.len() {
            self.error(
                format!(
                    "variant `{variant}` takes {} values, got {}",
                    payload.len(),
                    arg_types.len()
                ),
                pos,
            );
        } else {
            for (want, found) in payload.iter().zip(arg_types) {
                if !self.assignable(*found, *want) {
                    let found_s = self.reg.display(*found);
                    let want_s = self.reg.display(*want);
                    self.error(
                        format!("payload type mismatch: expected {want_s}, found {found_s}"),
                        pos,
                    );
                }
            }
        }
        self.typed.calls.insert(
            id,
            CallTarget::VariantCtor {
                enum_ty,
                tag: tag as u32,
            },
        );
        enum_ty
    }

    fn check_method_call(
        &mut self,
        id: ExprId,
        recv: ExprId,
        method: &str,
        args: &[ExprId],
        pos: Pos,
    ) -> TypeId {
        // `alias.func(args)` routes through the shared namespace.
        if let ExprKind::Ident(base_name) = &self.ast.expr(recv).kind.clone() {
            if matches!(self.lookup(base_name), Some(ScopeEntry::Module)) {
                self.set_type(recv, types::VOID);
                let arg_types: Vec<TypeId> = args.iter().map(|a| self.check_expr(*a)).collect();
                if let Some(sig) = self.fns.get(method).cloned() {
                    self.typed
                        .calls
                        .insert(id, CallTarget::Func(method.to_string()));
                    self.check_args(method, &sig.params, &arg_types, args, pos);
                    return sig.ret;
                }
                self.error(format!("undefined function `{method}`"), pos);
                return types::ERROR;
            }
            if let Some(ScopeEntry::EnumType(enum_ty)) = self.lookup(base_name).cloned() {
                // `Enum.Variant(payload)` parsed as a method call.
                self.set_type(recv, enum_ty);
                let arg_types: Vec<TypeId> = args.iter().map(|a| self.check_expr(*a)).collect();
                return self.check_variant_ctor(id, enum_ty, method, &arg_types, pos);
            }
        }

        let recv_ty = self.check_expr(recv);
        let arg_types: Vec<TypeId> = args.iter().map(|a| self.check_expr(*a)).collect();
        if recv_ty == types::ERROR {
            return types::ERROR;
        }

        // Builtin collection and string methods, with generic
        // substitution from the receiver's instance arguments.
        if let Some(ret) = self.check_builtin_method(id, recv_ty, method, &arg_types, pos) {
            return ret;
        }

        // User methods by receiver base type (auto-deref one pointer
        // level).
        let base_ty = match self.reg.get(recv_ty).clone() {
            TypeDesc::Ptr(inner) => inner,
            _ => recv_ty,
        };
        let type_name = match self.reg.get(base_ty).clone() {
            TypeDesc::Struct { name, .. } | TypeDesc::Enum { name, .. } => name,
            _ => {
                let ty_s = self.reg.display(recv_ty);
                self.error(format!("no method `{method}` on {ty_s}"), pos);
                return types::ERROR;
            }
        };
        let Some(sig) = self.methods.get(&(type_name.clone(), method.to_string())).cloned()
        else {
            self.error(format!("no method `{method}` on `{type_name}`"), pos);
            return types::ERROR;
        };

        let mangled = format!("{type_name}::{method}");
        self.typed.calls.insert(id, CallTarget::Func(mangled));
        // First parameter is the receiver.
        let expected: Vec<TypeId> = sig.params.iter().skip(1).copied().collect();
        self.check_args(method, &expected, &arg_types, args, pos);
        sig.ret
    }

    fn check_builtin_method(
        &mut self,
        id: ExprId,
        recv_ty: TypeId,
        method: &str,
        arg_types: &[TypeId],
        pos: Pos,
    ) -> Option<TypeId> {
        let desc = self.reg.get(recv_ty).clone();
        let builtin = match desc {
            TypeDesc::GenericInst { base, ref args } if base == self.list_def => {
                let elem = args[0];
                match method {
                    "push" => {
                        self.expect_args("push", 1, arg_types.len(), pos);
                        if let Some(&found) = arg_types.first() {
                            if !self.assignable(found, elem) {
                                let found_s = self.reg.display(found);
                                let elem_s = self.reg.display(elem);
                                self.error(
                                    format!("cannot push {found_s} into a list of {elem_s}"),
                                    pos,
                                );
                            }
                        }
                        Some((BuiltinCall::ListPush, types::VOID))
                    }
                    "pop" => {
                        self.expect_args("pop", 0, arg_types.len(), pos);
                        Some((BuiltinCall::ListPop, elem))
                    }
                    "get" => {
                        self.expect_args("get", 1, arg_types.len(), pos);
                        self.expect_integer_arg(arg_types.first(), pos);
                        Some((BuiltinCall::ListGet, elem))
                    }
                    "set" => {
                        self.expect_args("set", 2, arg_types.len(), pos);
                        self.expect_integer_arg(arg_types.first(), pos);
                        Some((BuiltinCall::ListSet, types::VOID))
                    }
                    "len" => {
                        self.expect_args("len", 0, arg_types.len(), pos);
                        Some((BuiltinCall::ListLen, types::I64))
                    }
                    _ => None,
                }
            }
            TypeDesc::GenericInst { base, ref args } if base == self.map_def => {
                let (key, value) = (args[0], args[1]);
                match method {
                    "set" => {
                        self.expect_args("set", 2, arg_types.len(), pos);
                        if let Some(&found) = arg_types.first() {
                            if !self.assignable(found, key) {
                                let found_s = self.reg.display(found);
                                let key_s = self.reg.display(key);
                                self.error(
                                    format!("map key mismatch: expected {key_s}, found {found_s}"),
                                    pos,
                                );
                            }
                        }
                        Some((BuiltinCall::MapSet, types::VOID))
                    }
                    "get" => {
                        self.expect_args("get", 1, arg_types.len(), pos);
                        Some((BuiltinCall::MapGet, value))
                    }
                    "has" => {
                        self.expect_args("has", 1, arg_types.len(), pos);
                        Some((BuiltinCall::MapHas, types::BOOL))
                    }
                    "delete" => {
                        self.expect_args("delete", 1, arg_types.len(), pos);
                        Some((BuiltinCall::MapDelete, types::VOID))
                    }
                    "len" => {
                        self.expect_args("len", 0, arg_types.len(), pos);
                        Some((BuiltinCall::MapLen, types::I64))
                    }
                    _ => None,
                }
            }
            TypeDesc::Str if method == "len" => {
                self.expect_args("len", 0, arg_types.len(), pos);
                Some((BuiltinCall::StrLen, types::I64))
            }
            TypeDesc::Array(..) | TypeDesc::Slice(_) if method == "len" => {
                self.expect_args("len", 0, arg_types.len(), pos);
                Some((BuiltinCall::SeqLen, types::I64))
            }
            _ => None,
        };
        let (builtin, ret) = builtin?;
        self.typed.calls.insert(id, CallTarget::Builtin(builtin));
        Some(ret)
    }

    fn expect_integer_arg(&mut self, ty: Option<&TypeId>, pos: Pos) {
        if let Some(&ty) = ty {
            if ty != types::ERROR && !self.reg.is_integer(ty) {
                let ty_s = self.reg.display(ty);
                self.error(format!("index must be an integer, found {ty_s}"), pos);
            }
        }
    }

    fn check_field(
        &mut self,
        id: ExprId,
        base: ExprId,
        name: &str,
        pos: Pos,
        optional: bool,
    ) -> TypeId {
        // Enum unit-variant reference: `Color.Red`.
        if let ExprKind::Ident(base_name) = &self.ast.expr(base).kind.clone() {
            if let Some(ScopeEntry::EnumType(enum_ty)) = self.lookup(base_name).cloned() {
                self.set_type(base, enum_ty);
                let TypeDesc::Enum { variants, .. } = self.reg.get(enum_ty).clone() else {
                    return types::ERROR;
                };
                let Some(tag) = variants.iter().position(|v| v.name == name) else {
                    self.error(format!("unknown variant `{name}`"), pos);
                    return types::ERROR;
                };
                if !variants[tag].payload.is_empty() {
                    self.error(
                        format!("variant `{name}` carries a payload; construct it with arguments"),
                        pos,
                    );
                }
                self.typed
                    .variant_refs
                    .insert(id, (enum_ty, tag as u32));
                return enum_ty;
            }
        }

        let base_ty = self.check_expr(base);
        if base_ty == types::ERROR {
            return types::ERROR;
        }

        // Receiver may be a struct, a pointer to one (auto-deref one
        // level), or — for `?.` — an optional of either.
        let mut ty = base_ty;
        if optional {
            if let TypeDesc::Optional(inner) = self.reg.get(ty).clone() {
                ty = inner;
            }
        }
        if let TypeDesc::Ptr(inner) = self.reg.get(ty).clone() {
            ty = inner;
        }
        let TypeDesc::Struct { name: sname, fields } = self.reg.get(ty).clone() else {
            let ty_s = self.reg.display(base_ty);
            self.error(format!("no field `{name}` on {ty_s}"), pos);
            return types::ERROR;
        };
        let Some(idx) = fields.iter().position(|(fname, _)| fname == name) else {
            self.error(format!("no field `{name}` on `{sname}`"), pos);
            return types::ERROR;
        };
        self.typed.fields.insert(id, idx as u32);
        let field_ty = fields[idx].1;
        if optional {
            self.reg.optional(field_ty)
        } else {
            field_ty
        }
    }

    fn check_index(&mut self, base: ExprId, index: ExprId, pos: Pos, optional: bool) -> TypeId {
        let base_ty = self.check_expr(base);
        let index_ty = self.check_expr(index);
        if index_ty != types::ERROR && !self.reg.is_integer(index_ty) {
            let ipos = self.ast.expr(index).pos;
            let ty_s = self.reg.display(index_ty);
            self.error(format!("index must be an integer, found {ty_s}"), ipos);
        }
        let mut ty = base_ty;
        if optional {
            if let TypeDesc::Optional(inner) = self.reg.get(ty).clone() {
                ty = inner;
            }
        }
        let elem = match self.reg.get(ty).clone() {
            TypeDesc::Array(elem, _) | TypeDesc::Slice(elem) => elem,
            // String indexing yields the byte value.
            TypeDesc::Str => types::I64,
            TypeDesc::Error => types::ERROR,
            _ => {
                let ty_s = self.reg.display(base_ty);
                self.error(format!("cannot index {ty_s}"), pos);
                return types::ERROR;
            }
        };
        if optional {
            self.reg.optional(elem)
        } else {
            elem
        }
    }

    fn check_cast(&mut self, from: TypeId, to: TypeId, pos: Pos) {
        if from == types::ERROR || to == types::ERROR {
            return;
        }
        let ok = (self.reg.is_numeric(from) && self.reg.is_numeric(to))
            || matches!(
                (self.reg.get(from), self.reg.get(to)),
                (TypeDesc::Ptr(_), TypeDesc::Ptr(_))
            )
            // `?*T as *T` is the sanctioned post-null-check unwrap.
            || matches!(
                (self.reg.get(from).clone(), self.reg.get(to)),
                (TypeDesc::Optional(inner), TypeDesc::Ptr(_)) if *self.reg.get(inner) == *self.reg.get(to)
            )
            || from == to;
        if !ok {
            let from_s = self.reg.display(from);
            let to_s = self.reg.display(to);
            // int <-> string conversions go through explicit calls.
            let hint = if (from == types::STR) != (to == types::STR) {
                " (use `string(..)`/`int(..)`)"
            } else {
                ""
            };
            self.error(format!("invalid cast from {from_s} to {to_s}{hint}"), pos);
        }
    }

    fn check_struct_init(
        &mut self,
        ty: TypeRefId,
        fields: &[(String, ExprId)],
        heap: bool,
        pos: Pos,
    ) -> TypeId {
        let resolved = self.resolve_type(ty);
        if resolved == types::ERROR {
            for (_, e) in fields {
                self.check_expr(*e);
            }
            return types::ERROR;
        }
        match self.reg.get(resolved).clone() {
            TypeDesc::Struct {
                name,
                fields: decl_fields,
            } => {
                let mut seen = vec![false; decl_fields.len()];
                for (fname, fexpr) in fields {
                    let found = self.check_expr(*fexpr);
                    let Some(idx) = decl_fields.iter().position(|(n, _)| n == fname) else {
                        let fpos = self.ast.expr(*fexpr).pos;
                        self.error(format!("no field `{fname}` on `{name}`"), fpos);
                        continue;
                    };
                    if seen[idx] {
                        let fpos = self.ast.expr(*fexpr).pos;
                        self.error(format!("field `{fname}` set twice"), fpos);
                    }
                    seen[idx] = true;
                    let want = decl_fields[idx].1;
                    if !self.assignable(found, want) {
                        let fpos = self.ast.expr(*fexpr).pos;
                        let found_s = self.reg.display(found);
                        let want_s = self.reg.display(want);
                        self.error(
                            format!("field `{fname}` expects {want_s}, found {found_s}"),
                            fpos,
                        );
                    }
                }
                for (idx, was_set) in seen.iter().enumerate() {
                    if !was_set {
                        self.error(
                            format!("missing field `{}` in `{name}` literal", decl_fields[idx].0),
                            pos,
                        );
                    }
                }
                if heap {
                    self.reg.ptr(resolved)
                } else {
                    resolved
                }
            }
            TypeDesc::GenericInst { .. } if heap && fields.is_empty() => resolved,
            _ => {
                let ty_s = self.reg.display(resolved);
                self.error(format!("cannot construct a value of type {ty_s}"), pos);
                types::ERROR
            }
        }
    }

    fn check_lambda(
        &mut self,
        id: ExprId,
        params: &[LambdaParam],
        ret: Option<TypeRefId>,
        body: StmtId,
    ) -> TypeId {
        let ret_ty = ret.map(|t| self.resolve_type(t)).unwrap_or(types::VOID);
        let mut param_tys = Vec::new();
        let mut param_locals = Vec::new();
        self.push_scope();
        for p in params {
            let ty = match p.ty {
                Some(t) => self.resolve_type(t),
                None => {
                    self.error(
                        format!("lambda parameter `{}` needs a type annotation", p.name),
                        p.pos,
                    );
                    types::ERROR
                }
            };
            let local = self.new_local(p.name.clone(), ty, false);
            self.bind(p.name.clone(), ScopeEntry::Local(local));
            param_tys.push(ty);
            param_locals.push(local);
        }

        let saved_ret = self.current_ret;
        let saved_loop = self.loop_depth;
        self.current_ret = ret_ty;
        self.loop_depth = 0;
        self.check_stmt(body);
        self.current_ret = saved_ret;
        self.loop_depth = saved_loop;
        self.pop_scope();

        let name = format!("lambda${}", self.typed.lambda_names.len());
        self.typed.lambda_params.insert(id, param_locals);
        self.typed.lambda_names.insert(id, name);
        self.typed.lambda_rets.insert(id, ret_ty);
        self.reg.function(param_tys, ret_ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::pos::FileId;

    fn check_src(src: &str) -> (Typed, Vec<Diagnostic>, TypeRegistry) {
        let (program, parse_diags) = parse(tokenize(src, FileId(0)));
        assert!(parse_diags.is_empty(), "parse failed: {parse_diags:?}");
        let mut reg = TypeRegistry::new();
        let (typed, diags) = check(&program.items, &program.ast, &mut reg);
        (typed, diags, reg)
    }

    fn check_ok(src: &str) -> Typed {
        let (typed, diags, _) = check_src(src);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        typed
    }

    fn first_message(src: &str) -> String {
        let (_, diags, _) = check_src(src);
        assert!(!diags.is_empty(), "expected a diagnostic");
        diags[0].message.clone()
    }

    #[test]
    fn checks_constant_return() {
        let typed = check_ok("fn main() i64 { return 42 }");
        assert_eq!(typed.fn_order, vec!["main".to_string()]);
        assert_eq!(typed.fns["main"].ret, types::I64);
    }

    #[test]
    fn undefined_identifier_is_reported() {
        let msg = first_message("fn f() i64 { return x }");
        assert!(msg.contains("undefined identifier"), "{msg}");
    }

    #[test]
    fn arithmetic_promotes_and_string_concat_is_add() {
        check_ok("fn f(a: i32, b: i64) i64 { return a + b }");
        check_ok("fn f(a: string, b: string) string { return a + b }");
        let msg = first_message("fn f(a: string, b: i64) string { return a + b }");
        assert!(msg.contains("invalid operands"), "{msg}");
    }

    #[test]
    fn comparison_yields_bool() {
        check_ok("fn f(n: i64) bool { return n <= 1 }");
        let msg = first_message("fn f(n: i64) i64 { return n <= 1 }");
        assert!(msg.contains("return type mismatch"), "{msg}");
    }

    #[test]
    fn assignment_requires_mutable_lvalue() {
        check_ok("fn f() { var x = 1\n x = 2 }");
        let msg = first_message("fn f() { const x = 1\n x = 2 }");
        assert!(msg.contains("immutable"), "{msg}");
        let msg = first_message("fn f() { 1 = 2 }");
        assert!(msg.contains("assignment target"), "{msg}");
    }

    #[test]
    fn call_arity_and_types_are_checked() {
        let msg = first_message("fn g(a: i64) i64 { return a }\nfn f() i64 { return g() }");
        assert!(msg.contains("expects 1 arguments"), "{msg}");
        let msg =
            first_message("fn g(a: i64) i64 { return a }\nfn f() i64 { return g(\"s\") }");
        assert!(msg.contains("argument type mismatch"), "{msg}");
    }

    #[test]
    fn struct_fields_resolve_with_indices() {
        let typed = check_ok(
            "struct Foo { name: string, field_name: string }\n\
             fn f(x: Foo) string { return x.field_name }",
        );
        assert!(typed.fields.values().any(|&idx| idx == 1));
    }

    #[test]
    fn unknown_field_is_reported() {
        let msg = first_message(
            "struct Foo { name: string }\nfn f(x: Foo) string { return x.nme }",
        );
        assert!(msg.contains("no field `nme`"), "{msg}");
    }

    #[test]
    fn method_lookup_substitutes_list_element() {
        let typed = check_ok(
            "struct Item { value: i64 }\n\
             fn main() i64 { var items = new List<*Item>\n var r = items.get(0)\n return r.value }",
        );
        // items.get(0) resolves to the builtin with the element type.
        assert!(typed
            .calls
            .values()
            .any(|c| matches!(c, CallTarget::Builtin(BuiltinCall::ListGet))));
    }

    #[test]
    fn switch_on_enum_requires_exhaustiveness() {
        let msg = first_message(
            "enum Color { Red, Green, Blue }\n\
             fn f(c: Color) i64 { switch c { Color.Red => 1, Color.Green => 2 } return 0 }",
        );
        assert!(msg.contains("non-exhaustive"), "{msg}");
    }

    #[test]
    fn switch_with_wildcard_is_exhaustive() {
        check_ok(
            "enum Color { Red, Green, Blue }\n\
             fn f(c: Color) i64 { switch c { Color.Red => 1, _ => 0 } return 0 }",
        );
    }

    #[test]
    fn variant_payload_bindings_are_typed() {
        check_ok(
            "enum Shape { Point, Circle(f64) }\n\
             fn f(s: Shape) f64 { switch s { Shape.Circle(r) => { return r } _ => { } } return 0.0 }",
        );
    }

    #[test]
    fn trait_conformance_is_verified() {
        let msg = first_message(
            "trait Printable { fn print(self) }\n\
             struct Foo { x: i64 }\n\
             impl Printable for Foo { }",
        );
        assert!(msg.contains("does not implement"), "{msg}");
    }

    #[test]
    fn impl_methods_are_callable() {
        check_ok(
            "struct Counter { n: i64 }\n\
             impl Counter { fn get(self) i64 { return self.n } }\n\
             fn f(c: Counter) i64 { return c.get() }",
        );
    }

    #[test]
    fn null_coerces_to_optionals_only() {
        check_ok("fn f() ?i64 { return null }");
        let msg = first_message("fn f() i64 { return null }");
        assert!(msg.contains("return type mismatch"), "{msg}");
    }

    #[test]
    fn optional_pointer_usable_as_pointer() {
        check_ok(
            "struct Foo { x: i64 }\n\
             fn f(p: ?*Foo) i64 { if (!(p == null)) { return g(p) } return 0 }\n\
             fn g(p: *Foo) i64 { return p.x }",
        );
    }

    #[test]
    fn cast_rules_allow_numeric_and_reject_int_string() {
        check_ok("fn f(a: i64) f64 { return a as f64 }");
        let msg = first_message("fn f(a: i64) string { return a as string }");
        assert!(msg.contains("use `string(..)`"), "{msg}");
    }

    #[test]
    fn error_poisoning_suppresses_cascades() {
        let (_, diags, _) = check_src("fn f() i64 { return x + 1 }");
        assert_eq!(diags.len(), 1, "{diags:?}");
    }

    #[test]
    fn interpolated_strings_type_as_string() {
        check_ok("fn f(x: i64) string { return \"v=${x}\" }");
    }

    #[test]
    fn string_index_yields_byte_value() {
        check_ok("fn f(s: string) i64 { return s[0] }");
    }

    #[test]
    fn lambda_requires_param_annotations_and_types_as_function() {
        check_ok("fn f() i64 { var add = |a: i64, b: i64| i64 { return a + b }\n return add(1, 2) }");
        let msg = first_message("fn f() { var g = |a| { } }");
        assert!(msg.contains("needs a type annotation"), "{msg}");
    }

    #[test]
    fn globals_infer_from_initializers() {
        let typed = check_ok("const LIMIT = 10\nfn f() i64 { return LIMIT }");
        assert_eq!(typed.globals[0].ty, types::I64);
    }
}
