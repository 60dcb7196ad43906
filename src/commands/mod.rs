//! CLI subcommand implementations

pub mod explore;
pub mod predict;
pub mod replay;
