//! Diagnostics surfaced to the embedding host for the non-runtime error
//! classes. Runtime exceptions are script values and never appear here.

use thiserror::Error;

/// A parse error with its source position. Parsing keeps going after the
/// first error, so a single evaluation can report several of these.
#[derive(Debug, Clone, Error)]
#[error("File {file} [line:{line}]: {message}")]
pub struct SyntaxError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

/// An error detected while lowering the AST to bytecode (locals overflow,
/// break outside a loop, super outside a subclass method, ...).
#[derive(Debug, Clone, Error)]
#[error("File {file} [line:{line}]: {message}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub message: String,
}
