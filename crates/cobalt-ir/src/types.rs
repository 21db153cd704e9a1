//! The type registry: `TypeId`-indexed descriptors shared by the type
//! checker, the lowerer, and the emitter (debug info).
//!
//! Type identity is by id. Structural types (pointers, optionals,
//! arrays, slices, functions, ranges, generic instances) are interned
//! so equal structure means equal id. Named types (structs, enums,
//! generic definitions) are interned by name and may have their bodies
//! filled in after declaration, which is how forward references
//! resolve.

use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A stable identifier for a type within one [`TypeRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeId(pub u32);

// Primitives occupy fixed ids so the pipeline can name them without a
// registry lookup.
pub const VOID: TypeId = TypeId(0);
pub const BOOL: TypeId = TypeId(1);
pub const I8: TypeId = TypeId(2);
pub const I16: TypeId = TypeId(3);
pub const I32: TypeId = TypeId(4);
pub const I64: TypeId = TypeId(5);
pub const U8: TypeId = TypeId(6);
pub const U16: TypeId = TypeId(7);
pub const U32: TypeId = TypeId(8);
pub const U64: TypeId = TypeId(9);
pub const F32: TypeId = TypeId(10);
pub const F64: TypeId = TypeId(11);
pub const STR: TypeId = TypeId(12);
pub const DECIMAL: TypeId = TypeId(13);
/// The poisoned sentinel assigned to expressions that already produced
/// a diagnostic; it is assignable to and from everything so one error
/// does not cascade.
pub const ERROR: TypeId = TypeId(14);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnumVariant {
    pub name: String,
    pub payload: Vec<TypeId>,
    /// Field names for struct-like payloads (`Name { field: T }`);
    /// empty for tuple payloads.
    pub field_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeDesc {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    Decimal,
    Error,
    Ptr(TypeId),
    Optional(TypeId),
    Array(TypeId, u32),
    Slice(TypeId),
    Function {
        params: Vec<TypeId>,
        ret: TypeId,
    },
    Struct {
        name: String,
        fields: Vec<(String, TypeId)>,
    },
    Enum {
        name: String,
        variants: Vec<EnumVariant>,
    },
    GenericDef {
        name: String,
        params: Vec<String>,
    },
    GenericInst {
        base: TypeId,
        args: Vec<TypeId>,
    },
    Range {
        inclusive: bool,
    },
}

#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeRegistry {
    descs: Vec<TypeDesc>,
    /// Structural dedup: pointers, optionals, arrays, slices,
    /// functions, ranges, generic instances.
    #[cfg_attr(feature = "serde", serde(skip))]
    interned: HashMap<TypeDesc, TypeId>,
    /// Named types by name (structs, enums, generic definitions).
    #[cfg_attr(feature = "serde", serde(skip))]
    named: HashMap<String, TypeId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            descs: Vec::new(),
            interned: HashMap::new(),
            named: HashMap::new(),
        };
        // Order must match the fixed-id constants above.
        for desc in [
            TypeDesc::Void,
            TypeDesc::Bool,
            TypeDesc::I8,
            TypeDesc::I16,
            TypeDesc::I32,
            TypeDesc::I64,
            TypeDesc::U8,
            TypeDesc::U16,
            TypeDesc::U32,
            TypeDesc::U64,
            TypeDesc::F32,
            TypeDesc::F64,
            TypeDesc::Str,
            TypeDesc::Decimal,
            TypeDesc::Error,
        ] {
            reg.descs.push(desc);
        }
        reg
    }

    pub fn get(&self, id: TypeId) -> &TypeDesc {
        &self.descs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Interns a structural descriptor, returning the existing id when
    /// an equal one was seen before.
    pub fn intern(&mut self, desc: TypeDesc) -> TypeId {
        debug_assert!(
            !matches!(
                desc,
                TypeDesc::Struct { .. } | TypeDesc::Enum { .. } | TypeDesc::GenericDef { .. }
            ),
            "named types go through declare_*"
        );
        if let Some(&id) = self.interned.get(&desc) {
            return id;
        }
        let id = TypeId(self.descs.len() as u32);
        self.interned.insert(desc.clone(), id);
        self.descs.push(desc);
        id
    }

    pub fn ptr(&mut self, to: TypeId) -> TypeId {
        self.intern(TypeDesc::Ptr(to))
    }

    pub fn optional(&mut self, of: TypeId) -> TypeId {
        self.intern(TypeDesc::Optional(of))
    }

    pub fn array(&mut self, elem: TypeId, len: u32) -> TypeId {
        self.intern(TypeDesc::Array(elem, len))
    }

    pub fn slice(&mut self, elem: TypeId) -> TypeId {
        self.intern(TypeDesc::Slice(elem))
    }

    pub fn function(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        self.intern(TypeDesc::Function { params, ret })
    }

    pub fn range(&mut self, inclusive: bool) -> TypeId {
        self.intern(TypeDesc::Range { inclusive })
    }

    /// Interns a generic instance, deduplicated by `(base, args)`.
    pub fn generic_inst(&mut self, base: TypeId, args: Vec<TypeId>) -> TypeId {
        self.intern(TypeDesc::GenericInst { base, args })
    }

    /// Declares a named type, returning its id. Re-declaring the same
    /// name returns the original id (the caller reports the duplicate).
    pub fn declare(&mut self, desc: TypeDesc) -> TypeId {
        let name = match &desc {
            TypeDesc::Struct { name, .. }
            | TypeDesc::Enum { name, .. }
            | TypeDesc::GenericDef { name, .. } => name.clone(),
            _ => panic!("declare requires a named type"),
        };
        if let Some(&id) = self.named.get(&name) {
            return id;
        }
        let id = TypeId(self.descs.len() as u32);
        self.named.insert(name, id);
        self.descs.push(desc);
        id
    }

    pub fn lookup_named(&self, name: &str) -> Option<TypeId> {
        self.named.get(name).copied()
    }

    /// Replaces a named type's body once its members are known.
    pub fn define(&mut self, id: TypeId, desc: TypeDesc) {
        self.descs[id.0 as usize] = desc;
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            TypeDesc::I8
                | TypeDesc::I16
                | TypeDesc::I32
                | TypeDesc::I64
                | TypeDesc::U8
                | TypeDesc::U16
                | TypeDesc::U32
                | TypeDesc::U64
        )
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            TypeDesc::I8 | TypeDesc::I16 | TypeDesc::I32 | TypeDesc::I64
        )
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(self.get(id), TypeDesc::F32 | TypeDesc::F64)
    }

    pub fn is_numeric(&self, id: TypeId) -> bool {
        self.is_integer(id) || self.is_float(id) || id == DECIMAL
    }

    /// Bit width of an integer or float type.
    pub fn width(&self, id: TypeId) -> Option<u8> {
        Some(match self.get(id) {
            TypeDesc::I8 | TypeDesc::U8 => 8,
            TypeDesc::I16 | TypeDesc::U16 => 16,
            TypeDesc::I32 | TypeDesc::U32 | TypeDesc::F32 => 32,
            TypeDesc::I64 | TypeDesc::U64 | TypeDesc::F64 => 64,
            _ => return None,
        })
    }

    /// Whether values of this type live on the VM heap and carry a
    /// refcount.
    pub fn is_heap(&self, id: TypeId) -> bool {
        match self.get(id) {
            TypeDesc::Str
            | TypeDesc::Slice(_)
            | TypeDesc::Struct { .. }
            | TypeDesc::Function { .. }
            | TypeDesc::GenericInst { .. } => true,
            TypeDesc::Ptr(_) => true,
            TypeDesc::Enum { variants, .. } => variants.iter().any(|v| !v.payload.is_empty()),
            TypeDesc::Optional(inner) => self.is_heap(*inner),
            _ => false,
        }
    }

    /// Renders a type for diagnostics.
    pub fn display(&self, id: TypeId) -> String {
        match self.get(id) {
            TypeDesc::Void => "void".to_string(),
            TypeDesc::Bool => "bool".to_string(),
            TypeDesc::I8 => "i8".to_string(),
            TypeDesc::I16 => "i16".to_string(),
            TypeDesc::I32 => "i32".to_string(),
            TypeDesc::I64 => "i64".to_string(),
            TypeDesc::U8 => "u8".to_string(),
            TypeDesc::U16 => "u16".to_string(),
            TypeDesc::U32 => "u32".to_string(),
            TypeDesc::U64 => "u64".to_string(),
            TypeDesc::F32 => "f32".to_string(),
            TypeDesc::F64 => "f64".to_string(),
            TypeDesc::Str => "string".to_string(),
            TypeDesc::Decimal => "decimal".to_string(),
            TypeDesc::Error => "<error>".to_string(),
            TypeDesc::Ptr(to) => format!("*{}", self.display(*to)),
            TypeDesc::Optional(of) => format!("?{}", self.display(*of)),
            TypeDesc::Array(elem, len) => format!("[{}]{}", len, self.display(*elem)),
            TypeDesc::Slice(elem) => format!("[]{}", self.display(*elem)),
            TypeDesc::Function { params, ret } => {
                let params: Vec<String> = params.iter().map(|p| self.display(*p)).collect();
                format!("fn({}) {}", params.join(", "), self.display(*ret))
            }
            TypeDesc::Struct { name, .. }
            | TypeDesc::Enum { name, .. }
            | TypeDesc::GenericDef { name, .. } => name.clone(),
            TypeDesc::GenericInst { base, args } => {
                let args: Vec<String> = args.iter().map(|a| self.display(*a)).collect();
                format!("{}<{}>", self.display(*base), args.join(", "))
            }
            TypeDesc::Range { inclusive } => {
                if *inclusive {
                    "range_inclusive".to_string()
                } else {
                    "range".to_string()
                }
            }
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_have_fixed_ids() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.get(VOID), &TypeDesc::Void);
        assert_eq!(reg.get(I64), &TypeDesc::I64);
        assert_eq!(reg.get(STR), &TypeDesc::Str);
        assert_eq!(reg.get(ERROR), &TypeDesc::Error);
    }

    #[test]
    fn structural_types_are_deduplicated() {
        let mut reg = TypeRegistry::new();
        let a = reg.ptr(I64);
        let b = reg.ptr(I64);
        assert_eq!(a, b);
        let c = reg.ptr(I32);
        assert_ne!(a, c);
    }

    #[test]
    fn generic_instances_dedup_by_base_and_args() {
        let mut reg = TypeRegistry::new();
        let list = reg.declare(TypeDesc::GenericDef {
            name: "List".to_string(),
            params: vec!["T".to_string()],
        });
        let a = reg.generic_inst(list, vec![I64]);
        let b = reg.generic_inst(list, vec![I64]);
        let c = reg.generic_inst(list, vec![STR]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn named_types_resolve_forward() {
        let mut reg = TypeRegistry::new();
        let id = reg.declare(TypeDesc::Struct {
            name: "Foo".to_string(),
            fields: Vec::new(),
        });
        assert_eq!(reg.lookup_named("Foo"), Some(id));
        reg.define(
            id,
            TypeDesc::Struct {
                name: "Foo".to_string(),
                fields: vec![("x".to_string(), I64)],
            },
        );
        match reg.get(id) {
            TypeDesc::Struct { fields, .. } => assert_eq!(fields.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn heap_classification_follows_descriptors() {
        let mut reg = TypeRegistry::new();
        assert!(reg.is_heap(STR));
        assert!(!reg.is_heap(I64));
        let opt_str = reg.optional(STR);
        assert!(reg.is_heap(opt_str));
        let opt_int = reg.optional(I64);
        assert!(!reg.is_heap(opt_int));
    }

    #[test]
    fn display_renders_nested_types() {
        let mut reg = TypeRegistry::new();
        let inner = reg.ptr(I64);
        let opt = reg.optional(inner);
        assert_eq!(reg.display(opt), "?*i64");
        let f = reg.function(vec![I64, STR], BOOL);
        assert_eq!(reg.display(f), "fn(i64, string) bool");
    }
}
