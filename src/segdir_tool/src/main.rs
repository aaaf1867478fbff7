mod segdir_tool;

use log::error;
use segdir_mgr::DEFAULT_SEGDIR_CONFIG_PATH;
use std::env;
use std::path::PathBuf;

use crate::segdir_tool::{run_segdir_tool, ToolCommand, ToolOptions};

fn usage() -> String {
    format!(
        "usage: segdir_tool [--config <path>] <command> [args]\n\
         commands:\n\
         clusters\n\
         create-cluster <cluster>\n\
         remove-cluster <cluster>\n\
         dirs <cluster>\n\
         create-dir <cluster> <dir>\n\
         remove-dir <cluster> <dir>\n\
         ls <cluster> <dir>\n\
         put <cluster> <dir> <local-file> [name]\n\
         get <cluster> <dir> <name> <out-file>\n\
         defaults:\n\
         --config {}",
        DEFAULT_SEGDIR_CONFIG_PATH
    )
}

fn parse_args_from(args: Vec<String>) -> Result<ToolOptions, String> {
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut config_path = PathBuf::from(DEFAULT_SEGDIR_CONFIG_PATH);
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
            _ => break,
        }
        i += 1;
    }

    let command =
        ToolCommand::parse(&args[i..]).map_err(|msg| format!("{}\n{}", msg, usage()))?;
    Ok(ToolOptions {
        config_path,
        command,
    })
}

fn parse_args() -> Result<ToolOptions, String> {
    parse_args_from(env::args().skip(1).collect::<Vec<String>>())
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_segdir_tool(options) {
        error!("segdir_tool failed: {}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod segdir_tool_tests;
