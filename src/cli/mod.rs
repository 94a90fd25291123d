//! Command-line interface

pub mod commands;

pub use commands::{
    cmd_demo, cmd_dump, cmd_get, cmd_info, cmd_init, load_config, CliResult,
};
