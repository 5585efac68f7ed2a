//! CLI subcommand implementations.

pub mod echo;
pub mod fetch;
pub mod linecount;
