#![forbid(unsafe_code)]

//! The Cobalt language compiler.
//!
//! This crate is the public face of the workspace: it re-exports the
//! pipeline (`cobalt-compiler`), the SSA IR (`cobalt-ir`), and the
//! bytecode image model (`cobalt-bytecode`). The `cobaltc` binary is a
//! thin driver over [`compile_files`].

pub use cobalt_bytecode::{from_bytes, to_bytes, Image};
pub use cobalt_compiler::{
    compile_files, compile_source, render_diagnostics, SourceFile,
};
pub use cobalt_compiler::diag::{DiagKind, Diagnostic};
pub use cobalt_ir::{verify_module, Module, TypeRegistry};
