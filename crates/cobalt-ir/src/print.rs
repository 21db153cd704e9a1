//! Textual rendering of IR modules, used by internal-compiler-error
//! dumps and by tests that assert on lowered shapes.

use std::fmt;

use crate::{Callee, Function, Inst, Module, Terminator};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for func in &self.functions {
            write_function(f, self, func)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

fn write_function(f: &mut fmt::Formatter<'_>, module: &Module, func: &Function) -> fmt::Result {
    let params: Vec<String> = func
        .params
        .iter()
        .map(|p| format!("{p}: {}", module.types.display(func.value_type(*p))))
        .collect();
    writeln!(
        f,
        "fn {}({}) {} {{",
        func.name,
        params.join(", "),
        module.types.display(func.ret)
    )?;
    for (idx, block) in func.blocks.iter().enumerate() {
        let preds: Vec<String> = block.preds.iter().map(|p| p.to_string()).collect();
        if preds.is_empty() {
            writeln!(f, "b{idx}:")?;
        } else {
            writeln!(f, "b{idx}: ; preds: {}", preds.join(", "))?;
        }
        for inst in &block.instrs {
            writeln!(f, "  {}", render_inst(module, inst))?;
        }
        writeln!(f, "  {}", render_terminator(&block.terminator))?;
    }
    writeln!(f, "}}")
}

fn render_inst(module: &Module, inst: &Inst) -> String {
    use Inst::*;
    match inst {
        IConst { dst, value } => format!("{dst} = iconst {value}"),
        FConst { dst, value } => format!("{dst} = fconst {value}"),
        SConst { dst, string } => format!(
            "{dst} = sconst {:?}",
            module.strings.get(*string as usize).map(String::as_str).unwrap_or("<bad>")
        ),
        BConst { dst, value } => format!("{dst} = bconst {value}"),
        DConst { dst, string } => format!(
            "{dst} = dconst {}",
            module.strings.get(*string as usize).map(String::as_str).unwrap_or("<bad>")
        ),
        NullConst { dst } => format!("{dst} = null"),
        Icmp { dst, cc, a, b } => format!("{dst} = icmp {cc:?} {a}, {b}"),
        Fcmp { dst, cc, a, b } => format!("{dst} = fcmp {cc:?} {a}, {b}"),
        Alloca { dst, ty } => format!("{dst} = alloca {}", module.types.display(*ty)),
        FieldPtr { dst, base, field } => format!("{dst} = field_ptr {base}, {field}"),
        GlobalLoad { dst, global } => format!("{dst} = global_load g{global}"),
        GlobalStore { global, value } => format!("global_store g{global}, {value}"),
        Call { dst, callee, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            let callee = match callee {
                Callee::Func(id) => format!("f{}", id.0),
                Callee::Native(name) => format!("native {name}"),
                Callee::Closure(v) => format!("closure {v}"),
            };
            match dst {
                Some(dst) => format!("{dst} = call {callee}({})", args.join(", ")),
                None => format!("call {callee}({})", args.join(", ")),
            }
        }
        RecordNew { dst, ty, fields } => {
            let fields: Vec<String> = fields.iter().map(|v| v.to_string()).collect();
            format!(
                "{dst} = record_new {} {{{}}}",
                module.types.display(*ty),
                fields.join(", ")
            )
        }
        VariantConstruct {
            dst, tag, payload, ..
        } => {
            let payload: Vec<String> = payload.iter().map(|v| v.to_string()).collect();
            format!("{dst} = variant #{tag}({})", payload.join(", "))
        }
        Phi { dst, args } => {
            let args: Vec<String> = args.iter().map(|(b, v)| format!("[{b}: {v}]")).collect();
            format!("{dst} = phi {}", args.join(", "))
        }
        SetHandler { target } => format!("set_handler {target}"),
        ClearHandler => "clear_handler".to_string(),
        DebugLine { line } => format!("debug_line {line}"),
        MakeClosure { dst, func, env } => {
            let env: Vec<String> = env.iter().map(|v| v.to_string()).collect();
            format!("{dst} = make_closure f{}, [{}]", func.0, env.join(", "))
        }
        other => {
            // Generic form: `dst = mnemonic uses...`.
            let mut uses = Vec::new();
            other.visit_uses(|v| uses.push(v.to_string()));
            match other.dst() {
                Some(dst) => format!("{dst} = {} {}", mnemonic(other), uses.join(", ")),
                None => format!("{} {}", mnemonic(other), uses.join(", ")),
            }
        }
    }
}

fn mnemonic(inst: &Inst) -> &'static str {
    use Inst::*;
    match inst {
        Copy { .. } => "copy",
        CaughtValue { .. } => "caught_value",
        IConst { .. } => "iconst",
        FConst { .. } => "fconst",
        SConst { .. } => "sconst",
        BConst { .. } => "bconst",
        DConst { .. } => "dconst",
        NullConst { .. } => "null",
        IAdd { .. } => "iadd",
        ISub { .. } => "isub",
        IMul { .. } => "imul",
        SDiv { .. } => "sdiv",
        UDiv { .. } => "udiv",
        SRem { .. } => "srem",
        URem { .. } => "urem",
        INeg { .. } => "ineg",
        FAdd { .. } => "fadd",
        FSub { .. } => "fsub",
        FMul { .. } => "fmul",
        FDiv { .. } => "fdiv",
        FRem { .. } => "frem",
        FNeg { .. } => "fneg",
        BAnd { .. } => "band",
        BOr { .. } => "bor",
        BXor { .. } => "bxor",
        BNot { .. } => "bnot",
        Shl { .. } => "shl",
        AShr { .. } => "ashr",
        LShr { .. } => "lshr",
        Icmp { .. } => "icmp",
        Fcmp { .. } => "fcmp",
        LogAnd { .. } => "log_and",
        LogOr { .. } => "log_or",
        LogNot { .. } => "log_not",
        Alloca { .. } => "alloca",
        Load { .. } => "load",
        Store { .. } => "store",
        FieldPtr { .. } => "field_ptr",
        IndexPtr { .. } => "index_ptr",
        GlobalLoad { .. } => "global_load",
        GlobalStore { .. } => "global_store",
        Call { .. } => "call",
        Bitcast { .. } => "bitcast",
        Sext { .. } => "sext",
        Uext { .. } => "uext",
        Trunc { .. } => "trunc",
        IntToFloat { .. } => "int_to_float",
        FloatToInt { .. } => "float_to_int",
        StrConcat { .. } => "str_concat",
        StrLen { .. } => "str_len",
        StrCompare { .. } => "str_compare",
        StrIndex { .. } => "str_index",
        StrSlice { .. } => "str_slice",
        WrapOptional { .. } => "wrap_optional",
        UnwrapOptional { .. } => "unwrap_optional",
        IsNull { .. } => "is_null",
        ArrayNew { .. } => "array_new",
        ArrayLoad { .. } => "array_load",
        ArrayStore { .. } => "array_store",
        ArrayLen { .. } => "array_len",
        SliceNew { .. } => "slice_new",
        SliceLen { .. } => "slice_len",
        ListNew { .. } => "list_new",
        ListPush { .. } => "list_push",
        ListPop { .. } => "list_pop",
        ListGet { .. } => "list_get",
        ListSet { .. } => "list_set",
        ListLen { .. } => "list_len",
        MapNew { .. } => "map_new",
        MapSet { .. } => "map_set",
        MapGet { .. } => "map_get",
        MapHas { .. } => "map_has",
        MapDelete { .. } => "map_delete",
        MapLen { .. } => "map_len",
        RecordNew { .. } => "record_new",
        RecordGet { .. } => "record_get",
        RecordSet { .. } => "record_set",
        VariantConstruct { .. } => "variant_construct",
        VariantTag { .. } => "variant_get_tag",
        VariantPayload { .. } => "variant_get_payload",
        RangeNew { .. } => "range_new",
        MakeClosure { .. } => "make_closure",
        SetHandler { .. } => "set_handler",
        ClearHandler => "clear_handler",
        Phi { .. } => "phi",
        DebugLine { .. } => "debug_line",
    }
}

fn render_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Unterminated => "<unterminated>".to_string(),
        Terminator::Jump { target } => format!("jump {target}"),
        Terminator::BrIf {
            cond,
            then_target,
            else_target,
        } => format!("br_if {cond}, {then_target}, {else_target}"),
        Terminator::BrTable {
            value,
            targets,
            default,
        } => {
            let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
            format!("br_table {value}, [{}], default {default}", targets.join(", "))
        }
        Terminator::Ret { value } => match value {
            Some(v) => format!("ret {v}"),
            None => "ret".to_string(),
        },
        Terminator::Throw { value } => format!("throw {value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{self, TypeRegistry};

    #[test]
    fn prints_a_small_function() {
        let mut module = Module::new(TypeRegistry::new());
        let mut func = Function::new("main".to_string(), types::I64);
        let entry = func.add_block();
        let v = func.new_value(types::I64);
        func.block_mut(entry)
            .instrs
            .push(Inst::IConst { dst: v, value: 42 });
        func.block_mut(entry).terminator = Terminator::Ret { value: Some(v) };
        module.functions.push(func);

        let text = module.to_string();
        assert!(text.contains("fn main() i64 {"), "{text}");
        assert!(text.contains("v0 = iconst 42"), "{text}");
        assert!(text.contains("ret v0"), "{text}");
    }
}
