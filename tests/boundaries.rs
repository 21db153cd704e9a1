//! Boundary behaviors and format-level properties of emitted images.

mod common;

use cobalt_bytecode::opcodes::Op;
use common::{compile, has_op, ops_of};

#[test]
fn empty_source_emits_header_only_image() {
    let image = compile("");
    assert!(image.routines.is_empty());
    assert!(image.consts.is_empty());
    assert!(image.code.is_empty());
    assert!(image.exports.is_empty());
}

#[test]
fn image_bytes_start_with_magic_and_version() {
    let bytes = cobalt::compile_source("t.cb", "fn main() i64 { return 1 }").expect("compile");
    assert_eq!(&bytes[0..4], b"CBO1");
    assert_eq!(bytes[4], 1); // major
    assert_eq!(bytes[5], 0); // minor
}

#[test]
fn compiling_the_same_source_is_byte_identical() {
    let src = "struct Foo { a: i64, b: string }\n\
               fn helper(x: i64) i64 { return x * 2 }\n\
               fn main() i64 { var f = Foo{ .a = helper(3), .b = \"s\" }\n return f.a }";
    let a = cobalt::compile_source("t.cb", src).expect("compile");
    let b = cobalt::compile_source("t.cb", src).expect("compile");
    assert_eq!(a, b);
}

#[test]
fn more_than_fifteen_arguments_use_the_stack_opcodes() {
    let params: Vec<String> = (0..18).map(|i| format!("a{i}: i64")).collect();
    let args: Vec<String> = (0..18).map(|i| i.to_string()).collect();
    let src = format!(
        "fn wide({}) i64 {{ return a0 + a17 }}\n\
         fn main() i64 {{ return wide({}) }}",
        params.join(", "),
        args.join(", ")
    );
    let image = compile(&src);
    assert!(has_op(&image, "main", Op::PushArg));
    let idx = image.routine_by_name("wide").unwrap();
    assert_eq!(image.routines[idx as usize].arg_count, 18);
}

#[test]
fn string_index_compiles_without_bounds_guard() {
    // Out-of-range reads are defined to produce 0 at runtime, so no
    // compile-time rejection and no guard code.
    let image = compile("fn main() i64 { var s = \"ab\"\n return s[99] }");
    assert!(has_op(&image, "main", Op::StrIndex));
}

#[test]
fn division_by_non_constant_zero_compiles_to_a_runtime_trap() {
    let image = compile("fn main() i64 { var d = 0\n return 7 / d }");
    assert!(has_op(&image, "main", Op::SDiv));
}

#[test]
fn division_by_constant_zero_is_not_folded_away() {
    let image = compile("fn main() i64 { return 7 / 0 }");
    assert!(has_op(&image, "main", Op::SDiv));
}

#[test]
fn debug_line_table_is_sorted_and_in_range() {
    let image = compile(
        "fn first() i64 {\n return 1\n}\n\nfn main() i64 {\n return first()\n}",
    );
    assert!(!image.debug_lines.is_empty());
    let mut last = 0;
    for record in &image.debug_lines {
        assert!(record.code_offset >= last);
        assert!((record.code_offset as usize) <= image.code.len());
        last = record.code_offset;
    }
}

#[test]
fn globals_compile_into_an_init_routine() {
    let image = compile("const GREETING = \"hi\"\nfn main() i64 { println(GREETING)\n return 0 }");
    assert!(image.routine_by_name("$init").is_some());
    assert!(has_op(&image, "$init", Op::GlobalStore));
    assert!(has_op(&image, "main", Op::GlobalLoad));
}

#[test]
fn tests_become_exported_routines() {
    let image = compile("test \"adds\" { println(\"ok\") }\nfn main() i64 { return 0 }");
    let idx = image.routine_by_name("test$adds").expect("test routine");
    assert!(image.exports.iter().any(|e| e.routine == idx));
}

#[test]
fn every_routine_body_ends_in_a_terminator() {
    let image = compile(
        "fn a() { }\nfn b(x: bool) i64 { if (x) { return 1 } return 2 }\n\
         fn main() i64 { a()\n return b(true) }",
    );
    for routine in &image.routines {
        let name = match &image.consts[routine.name as usize] {
            cobalt_bytecode::Const::Ident(n) => n.clone(),
            other => panic!("routine name is {other:?}"),
        };
        let ops = ops_of(&image, &name);
        let last = ops.last().copied().expect("nonempty body");
        assert!(last.is_terminator(), "{name}: {ops:?}");
    }
}
