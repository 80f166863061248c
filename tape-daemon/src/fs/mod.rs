//! Filesystem-facing modules: backup sources and tree enumeration.

pub mod scanner;
pub mod source;
