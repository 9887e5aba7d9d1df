mod shell;

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use tally_config::TallyConfig;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("sandbox");

    let result = match cmd {
        "sandbox" => match load_config(args.get(2).map(String::as_str)) {
            Ok(config) => shell::run(config).await,
            Err(e) => Err(e),
        },
        "config" => {
            print!("{}", TallyConfig::generate_sample());
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        _ => {
            println!("Unknown command: {}", cmd);
            println!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<TallyConfig> {
    match path {
        Some(path) => TallyConfig::load_from(Path::new(path))
            .with_context(|| format!("failed to load config from {path}")),
        None => TallyConfig::load(),
    }
}

fn print_usage() {
    println!("Tally - private sum aggregation sandbox");
    println!();
    println!("USAGE:");
    println!("  tally <command> [args]");
    println!();
    println!("COMMANDS:");
    println!("  sandbox [config.toml]     Run asker, operators and participants on a local ledger");
    println!("  config                    Print a sample configuration");
    println!("  help                      Show this message");
    println!();
    println!("Config lookup: $TALLY_CONFIG, ./tally.toml, ~/.tally/config.toml");
}
