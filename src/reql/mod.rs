//! ReQL wire vocabulary.
//!
//! - **Terms** (`terms.rs`): numeric term type codes
//! - **AST** (`ast.rs`): the term tree sent inside START queries
//! - **Types** (`types.rs`): query kinds, response kinds, notes and error codes
//! - **Options** (`options.rs`): per-query run options

pub mod ast;
pub mod options;
pub mod terms;
pub mod types;

pub use ast::Term;
pub use options::{Durability, ReadMode, RunOptions};
pub use terms::TermType;
pub use types::*;
