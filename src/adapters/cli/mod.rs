//! CLI Adapter
//!
//! Command-line interface for the DLMM keeper.
//! Uses clap derive macros for argument parsing.

mod commands;

pub use commands::{
    build_paper_ports, execute, factory_settings, start_stored_instances, AddCmd, CliApp, Command,
    RemoveCmd, RunCmd, VerifyCmd,
};
