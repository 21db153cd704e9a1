#![forbid(unsafe_code)]

//! The Cobalt compiler pipeline: lexer, parser, type checker, SSA
//! lowering, and bytecode emission.
//!
//! Each phase produces an immutable artifact consumed by the next, and
//! a phase that reports errors stops the pipeline after it completes,
//! so one run surfaces as many diagnostics as practical. The type
//! registry and string interner are owned values threaded through the
//! pipeline (the IR module owns the registry from lowering onward);
//! nothing here is ambient, so compilations are isolated.

pub mod ast;
pub mod diag;
pub mod emit;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod pos;
pub mod regalloc;
pub mod token;
pub mod typeck;

use std::collections::HashMap;

use tracing::debug;

use crate::ast::{Ast, Item};
use crate::diag::{DiagKind, Diagnostic};
use crate::pos::{FileId, Pos};

/// One input file: a display name (used in diagnostics) and its text.
#[derive(Clone, Debug)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Compiles a single source buffer to bytecode image bytes.
pub fn compile_source(name: &str, text: &str) -> Result<Vec<u8>, Vec<Diagnostic>> {
    compile_files(&[SourceFile::new(name, text)])
}

/// Compiles a set of files to bytecode image bytes.
///
/// Files are processed in dependency order (topological sort of their
/// `import`s; cycles are an error). Declarations land in one shared
/// namespace; an import alias only adds a qualified way to reach it.
pub fn compile_files(files: &[SourceFile]) -> Result<Vec<u8>, Vec<Diagnostic>> {
    let mut diags: Vec<Diagnostic> = Vec::new();
    let mut ast = Ast::new();
    let mut per_file_items: Vec<Vec<Item>> = Vec::new();

    debug!(files = files.len(), "compiling");
    for (idx, file) in files.iter().enumerate() {
        let tokens = lexer::tokenize(&file.text, FileId(idx as u16));
        debug!(file = %file.name, tokens = tokens.len(), "lexed");
        let (items, next_ast, file_diags) = parser::parse_file(tokens, ast);
        ast = next_ast;
        diags.extend(file_diags);
        per_file_items.push(items);
    }

    let order = match sort_by_imports(files, &per_file_items, &mut diags) {
        Some(order) => order,
        None => Vec::new(),
    };

    // Lexical or syntactic errors stop the pipeline here; every file
    // was still fully scanned and parsed.
    if !diags.is_empty() {
        return Err(diags);
    }

    let mut items: Vec<Item> = Vec::new();
    for idx in order {
        items.extend(per_file_items[idx].clone());
    }

    let mut registry = cobalt_ir::TypeRegistry::new();
    let (typed, check_diags) = typeck::check(&items, &ast, &mut registry);
    debug!(
        functions = typed.fn_order.len(),
        diagnostics = check_diags.len(),
        "type checked"
    );
    if !check_diags.is_empty() {
        return Err(check_diags);
    }

    let (mut module, lower_diags) = lower::lower(&items, &ast, &typed, registry);
    debug!(functions = module.functions.len(), "lowered to ir");
    if !lower_diags.is_empty() {
        return Err(lower_diags);
    }

    cobalt_ir::opt::optimize_module(&mut module);
    if let Err(e) = cobalt_ir::verify_module(&module) {
        return Err(vec![internal_error(format!("{e}\n{module}"))]);
    }

    let image = match emit::emit_module(&module) {
        Ok(image) => image,
        Err(e) => return Err(vec![internal_error(format!("{e}\n{module}"))]),
    };
    debug!(
        routines = image.routines.len(),
        consts = image.consts.len(),
        code_bytes = image.code.len(),
        "emitted"
    );

    cobalt_bytecode::to_bytes(&image).map_err(|e| vec![internal_error(e.to_string())])
}

/// Renders diagnostics in `path:line:col: kind: message` form, mapping
/// each position's file id back to its input name.
pub fn render_diagnostics(files: &[SourceFile], diags: &[Diagnostic]) -> Vec<String> {
    diags
        .iter()
        .map(|d| {
            let path = files
                .get(d.pos.file.0 as usize)
                .map(|f| f.name.as_str())
                .unwrap_or("<unknown>");
            d.render(path)
        })
        .collect()
}

fn internal_error(message: String) -> Diagnostic {
    Diagnostic::new(DiagKind::Internal, message, Pos::default())
}

/// Topological order of file indices by their imports. `None` leaves
/// a cycle diagnostic behind.
fn sort_by_imports(
    files: &[SourceFile],
    per_file_items: &[Vec<Item>],
    diags: &mut Vec<Diagnostic>,
) -> Option<Vec<usize>> {
    let stems: HashMap<String, usize> = files
        .iter()
        .enumerate()
        .map(|(idx, f)| (stem(&f.name).to_string(), idx))
        .collect();

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); files.len()];
    for (idx, items) in per_file_items.iter().enumerate() {
        for item in items {
            if let Item::Import(import) = item {
                match stems.get(stem(&import.path)) {
                    Some(&dep) => edges[idx].push(dep),
                    None => diags.push(Diagnostic::new(
                        DiagKind::Semantic,
                        format!("import `{}` does not name an input file", import.path),
                        import.pos,
                    )),
                }
            }
        }
    }

    // Depth-first postorder; a gray node on the stack is a cycle.
    let mut state = vec![0u8; files.len()]; // 0 white, 1 gray, 2 black
    let mut order = Vec::new();
    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        state: &mut [u8],
        order: &mut Vec<usize>,
    ) -> bool {
        match state[node] {
            1 => return false,
            2 => return true,
            _ => {}
        }
        state[node] = 1;
        for &dep in &edges[node] {
            if !visit(dep, edges, state, order) {
                return false;
            }
        }
        state[node] = 2;
        order.push(node);
        true
    }
    for idx in 0..files.len() {
        if !visit(idx, &edges, &mut state, &mut order) {
            diags.push(Diagnostic::new(
                DiagKind::Semantic,
                format!("import cycle involving `{}`", files[idx].name),
                Pos::new(FileId(idx as u16), 1, 1),
            ));
            return None;
        }
    }
    Some(order)
}

fn stem(path: &str) -> &str {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    base.strip_suffix(".cb").unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_empty_source_to_header_only_image() {
        let bytes = compile_source("empty.cb", "").expect("compile");
        let image = cobalt_bytecode::from_bytes(&bytes).expect("decode");
        assert!(image.routines.is_empty());
    }

    #[test]
    fn reports_syntax_errors_with_positions() {
        let err = compile_source("bad.cb", "fn f( {").unwrap_err();
        assert!(!err.is_empty());
        let rendered = render_diagnostics(&[SourceFile::new("bad.cb", "fn f( {")], &err);
        assert!(rendered[0].starts_with("bad.cb:1:"), "{rendered:?}");
    }

    #[test]
    fn skips_type_checking_after_parse_errors() {
        // `undefined_name` would be a semantic error, but the broken
        // first function stops the pipeline at the parser.
        let err = compile_source("bad.cb", "fn f( { }\nfn g() { undefined_name() }").unwrap_err();
        assert!(err.iter().all(|d| d.kind == DiagKind::Syntax
            || d.kind == DiagKind::Lexical));
    }

    #[test]
    fn multi_file_imports_resolve_in_dependency_order() {
        let files = [
            SourceFile::new(
                "main.cb",
                "import \"lib\"\nfn main() i64 { return helper() }",
            ),
            SourceFile::new("lib.cb", "fn helper() i64 { return 7 }"),
        ];
        compile_files(&files).expect("compile");
    }

    #[test]
    fn import_cycles_are_an_error() {
        let files = [
            SourceFile::new("a.cb", "import \"b\"\n"),
            SourceFile::new("b.cb", "import \"a\"\n"),
        ];
        let err = compile_files(&files).unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("cycle")), "{err:?}");
    }

    #[test]
    fn unknown_import_is_reported() {
        let err = compile_source("main.cb", "import \"nope\"\n").unwrap_err();
        assert!(
            err.iter().any(|d| d.message.contains("does not name")),
            "{err:?}"
        );
    }

    #[test]
    fn compiling_twice_is_byte_identical() {
        let src = "fn fib(n: i64) i64 { if (n <= 1) { return n } return fib(n - 1) + fib(n - 2) }\n\
                   fn main() i64 { return fib(10) }";
        let a = compile_source("fib.cb", src).expect("compile");
        let b = compile_source("fib.cb", src).expect("compile");
        assert_eq!(a, b);
    }
}
