//! Shared helpers for the end-to-end suites: compile source text,
//! decode the image, and walk a routine's opcode stream.
#![allow(dead_code)]

use cobalt::Image;
use cobalt_bytecode::opcodes::Op;
use cobalt_bytecode::Const;

pub fn compile(src: &str) -> Image {
    let bytes = cobalt::compile_source("test.cb", src).unwrap_or_else(|diags| {
        let rendered =
            cobalt::render_diagnostics(&[cobalt::SourceFile::new("test.cb", src)], &diags);
        panic!("compilation failed:\n{}", rendered.join("\n"));
    });
    cobalt::from_bytes(&bytes).expect("emitted image decodes")
}

pub fn routine_body<'i>(image: &'i Image, name: &str) -> &'i [u8] {
    let idx = image
        .routine_by_name(name)
        .unwrap_or_else(|| panic!("routine `{name}` not in image"));
    let routine = &image.routines[idx as usize];
    &image.code[routine.code_offset as usize..(routine.code_offset + routine.code_len) as usize]
}

/// Decodes the opcode at each instruction boundary of a routine body.
pub fn ops_of(image: &Image, name: &str) -> Vec<Op> {
    let body = routine_body(image, name);
    let mut ops = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let op = Op::from_byte(body[pos]).expect("verified stream decodes");
        let mut size = op.fixed_size();
        if op.has_target_list() {
            let count = u16::from_le_bytes([body[pos + size - 2], body[pos + size - 1]]) as usize;
            size += count * 2;
        }
        ops.push(op);
        pos += size;
    }
    ops
}

pub fn has_op(image: &Image, name: &str, op: Op) -> bool {
    ops_of(image, name).contains(&op)
}

/// Every `LoadSmallInt` immediate in a routine, in order.
pub fn small_int_imms(image: &Image, name: &str) -> Vec<i16> {
    let body = routine_body(image, name);
    let mut imms = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let op = Op::from_byte(body[pos]).expect("verified stream decodes");
        let mut size = op.fixed_size();
        if op.has_target_list() {
            let count = u16::from_le_bytes([body[pos + size - 2], body[pos + size - 1]]) as usize;
            size += count * 2;
        }
        if op == Op::LoadSmallInt {
            imms.push(i16::from_le_bytes([body[pos + 2], body[pos + 3]]));
        }
        pos += size;
    }
    imms
}

pub fn str_consts(image: &Image) -> Vec<&str> {
    image
        .consts
        .iter()
        .filter_map(|c| match c {
            Const::Str(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}
