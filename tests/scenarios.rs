//! End-to-end scenarios: each source compiles through the full
//! pipeline and the emitted image is checked structurally (constants,
//! routine shapes, opcode usage). Execution-level outcomes belong to
//! the VM, which consumes these images.

mod common;

use cobalt_bytecode::opcodes::Op;
use cobalt_bytecode::Const;
use common::{compile, has_op, ops_of, small_int_imms, str_consts};

#[test]
fn constant_return() {
    let image = compile("fn main() i64 { return 42 }");
    assert!(image.routine_by_name("main").is_some());
    // `main` is exported.
    let main_idx = image.routine_by_name("main").unwrap();
    assert!(image.exports.iter().any(|e| e.routine == main_idx));
    assert_eq!(small_int_imms(&image, "main"), vec![42]);
    assert!(has_op(&image, "main", Op::Ret));
}

#[test]
fn arithmetic_folds_by_precedence() {
    // 1 + 2 * 3 folds to 7 at compile time.
    let image = compile("fn main() i64 { return 1 + 2 * 3 }");
    assert_eq!(small_int_imms(&image, "main"), vec![7]);
    assert!(!has_op(&image, "main", Op::IAdd));
    assert!(!has_op(&image, "main", Op::IMul));
}

#[test]
fn recursion_emits_calls_and_preserves_results() {
    let image = compile(
        "fn fib(n: i64) i64 { if (n <= 1) { return n } return fib(n - 1) + fib(n - 2) }\n\
         fn main() i64 { return fib(10) }",
    );
    let fib_ops = ops_of(&image, "fib");
    let calls = fib_ops.iter().filter(|&&op| op == Op::Call).count();
    assert_eq!(calls, 2, "{fib_ops:?}");
    // The first call's result must be moved out of the result register
    // before the second call can clobber it.
    let first_call = fib_ops.iter().position(|&op| op == Op::Call).unwrap();
    let second_call = fib_ops.iter().rposition(|&op| op == Op::Call).unwrap();
    assert!(
        fib_ops[first_call + 1..second_call].contains(&Op::Mov),
        "{fib_ops:?}"
    );
    assert!(fib_ops.contains(&Op::IAdd));
    assert!(has_op(&image, "main", Op::Call));
}

#[test]
fn struct_with_two_string_fields() {
    let image = compile(
        "struct Foo { name: string, field_name: string }\n\
         fn main() i64 { var f = Foo{ .name = \"n\", .field_name = \"fn\" }\n\
         println(f.name); println(f.field_name); return 0 }",
    );
    let ops = ops_of(&image, "main");
    assert!(ops.contains(&Op::StructNew), "{ops:?}");
    let gets = ops.iter().filter(|&&op| op == Op::StructGet).count();
    assert_eq!(gets, 2, "{ops:?}");
    let natives = ops.iter().filter(|&&op| op == Op::NativeCall).count();
    assert_eq!(natives, 2, "{ops:?}");
    let strs = str_consts(&image);
    assert!(strs.contains(&"n") && strs.contains(&"fn"), "{strs:?}");
    // Field slots are disambiguated: both field indices appear.
    let body = common::routine_body(&image, "main");
    let mut field_indices = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let op = Op::from_byte(body[pos]).unwrap();
        let mut size = op.fixed_size();
        if op.has_target_list() {
            let count = u16::from_le_bytes([body[pos + size - 2], body[pos + size - 1]]) as usize;
            size += count * 2;
        }
        if op == Op::StructGet {
            field_indices.push(body[pos + size - 1]);
        }
        pos += size;
    }
    field_indices.sort_unstable();
    assert_eq!(field_indices, vec![0, 1]);
}

#[test]
fn string_slice() {
    let image = compile("fn main() i64 { var s = \"hello\"\n println(s[0..1]); return 0 }");
    assert!(has_op(&image, "main", Op::StrSlice));
    assert!(str_consts(&image).contains(&"hello"));
}

#[test]
fn list_of_struct_pointers_preserves_pointer_element_ops() {
    let image = compile(
        "struct Item { name: string, value: i64 }\n\
         fn main() i64 { var items = new List<*Item>\n\
         items.push(new Item{ .name = \"first\", .value = 1 })\n\
         var r = items.get(0)\n\
         println(r.name)\n println(string(r.value))\n return 0 }",
    );
    let ops = ops_of(&image, "main");
    assert!(ops.contains(&Op::ListNew), "{ops:?}");
    // Pointer elements travel through the plain list opcodes, not the
    // struct-boxing variants.
    assert!(ops.contains(&Op::ListPush), "{ops:?}");
    assert!(ops.contains(&Op::ListGet), "{ops:?}");
    assert!(!ops.contains(&Op::ListPushStruct), "{ops:?}");
    assert!(!ops.contains(&Op::ListGetStruct), "{ops:?}");
    assert!(ops.contains(&Op::StructGet), "{ops:?}");
    assert!(str_consts(&image).contains(&"first"));
}

#[test]
fn struct_values_in_lists_use_boxing_opcodes() {
    let image = compile(
        "struct P { x: i64, y: i64 }\n\
         fn main() i64 { var ps = new List<P>\n\
         ps.push(P{ .x = 1, .y = 2 })\n\
         var p = ps.get(0)\n return p.x }",
    );
    let ops = ops_of(&image, "main");
    assert!(ops.contains(&Op::ListPushStruct), "{ops:?}");
    assert!(ops.contains(&Op::ListGetStruct), "{ops:?}");
}

#[test]
fn enum_switch_emits_branch_table_and_payload_extraction() {
    let image = compile(
        "enum Shape { Point, Circle(f64) }\n\
         fn area(s: Shape) f64 { switch s { Shape.Circle(r) => { return r } _ => { } } return 0.0 }\n\
         fn main() i64 { return 0 }",
    );
    let ops = ops_of(&image, "area");
    assert!(ops.contains(&Op::VariantTag), "{ops:?}");
    assert!(ops.contains(&Op::BrTable), "{ops:?}");
    assert!(ops.contains(&Op::VariantPayload), "{ops:?}");
}

#[test]
fn try_catch_and_throw_use_handler_opcodes() {
    let image = compile(
        "fn risky() i64 { throw 3 }\n\
         fn main() i64 { try { return risky() } catch (e) { return e } }",
    );
    assert!(has_op(&image, "risky", Op::Throw));
    let ops = ops_of(&image, "main");
    assert!(ops.contains(&Op::SetHandlerLong), "{ops:?}");
    // The routine carries the can-throw flag.
    let idx = image.routine_by_name("main").unwrap();
    assert_ne!(image.routines[idx as usize].flags & 1, 0);
}

#[test]
fn defers_emit_on_the_return_path() {
    let image = compile(
        "fn main() i64 { defer println(\"bye\")\n println(\"hi\")\n return 0 }",
    );
    let strs = str_consts(&image);
    assert!(strs.contains(&"bye") && strs.contains(&"hi"));
    let natives = ops_of(&image, "main")
        .iter()
        .filter(|&&op| op == Op::NativeCall)
        .count();
    assert_eq!(natives, 2);
}

#[test]
fn heap_locals_get_retain_release_discipline() {
    let image = compile(
        "fn main() i64 { var s = \"owned\"\n s = \"replaced\"\n return 0 }",
    );
    let ops = ops_of(&image, "main");
    let retains = ops.iter().filter(|&&op| op == Op::Retain).count();
    let releases = ops.iter().filter(|&&op| op == Op::Release).count();
    // Each store retains the incoming value and releases the previous
    // slot contents (null on the first store, a runtime no-op); the
    // scope exit releases the surviving value.
    assert_eq!(retains, 2, "{ops:?}");
    assert_eq!(releases, 3, "{ops:?}");
}

#[test]
fn map_stores_retain_both_key_and_value() {
    let image = compile(
        "fn main() i64 { var m = new Map<string, string>\n m.set(\"k\", \"v\")\n return 0 }",
    );
    let ops = ops_of(&image, "main");
    assert!(ops.contains(&Op::MapSet), "{ops:?}");
    let retains = ops.iter().filter(|&&op| op == Op::Retain).count();
    let releases = ops.iter().filter(|&&op| op == Op::Release).count();
    // Storing the map into its slot retains once; the map entry
    // retains its heap key and its heap value. The slot store releases
    // the previous (null) contents and the scope exit releases the
    // map.
    assert_eq!(retains, 3, "{ops:?}");
    assert_eq!(releases, 2, "{ops:?}");
}

#[test]
fn interpolated_strings_concatenate() {
    let image = compile("fn greet(n: i64) string { return \"n=${n}!\" }\nfn main() i64 { return 0 }");
    let ops = ops_of(&image, "greet");
    assert!(ops.contains(&Op::StrConcat), "{ops:?}");
    assert!(ops.contains(&Op::NativeCall), "{ops:?}");
}

#[test]
fn lambdas_compile_to_closure_routines() {
    let image = compile(
        "fn main() i64 { var base = 10\n const add = |n: i64| i64 { return base + n }\n return add(5) }",
    );
    assert!(has_op(&image, "main", Op::MakeClosure));
    assert!(has_op(&image, "main", Op::CallClosure));
    // The lambda body landed as its own routine.
    let lambda = image.consts.iter().any(
        |c| matches!(c, Const::Ident(name) if name.starts_with("lambda$")),
    );
    assert!(lambda);
}

#[test]
fn loops_compile_with_backward_jumps() {
    let image = compile(
        "fn main() i64 { var t = 0\n for i in 0..10 { t = t + i }\n return t }",
    );
    let ops = ops_of(&image, "main");
    assert!(
        ops.contains(&Op::Jmp) || ops.contains(&Op::JmpLong),
        "{ops:?}"
    );
    assert!(ops.contains(&Op::BrIf) || ops.contains(&Op::BrIfNot), "{ops:?}");
}
