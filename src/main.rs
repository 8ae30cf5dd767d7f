mod config;
mod console;
mod daemon;
mod engine;
mod input;
mod ipfilter;
mod model;
mod monitor;
mod pump;
mod recovery;
mod render;
mod rpc;
mod settings;
mod terminal;
mod view;

use std::{fs::File, path::Path, process};

use anyhow::{Context, Result};
use config::{build_config, Cli};
use env_logger::{Env, Target};
use log::LevelFilter;
use settings::{setting_lines, SettingsPack};

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn try_main() -> Result<()> {
    view::capture_local_offset();
    let cli = Cli::parse_args();
    if cli.list_settings {
        for line in setting_lines() {
            println!("{line}");
        }
        return Ok(());
    }

    let mut settings = SettingsPack::default();
    for (name, value) in &cli.settings {
        settings.set(name, value)?;
    }

    let config = build_config(&cli)?;
    init_logging(config.log_level, config.log_file.as_deref())?;
    console::run(config, settings)
}

fn init_logging(level: LevelFilter, file: Option<&Path>) -> Result<()> {
    let env = Env::default().default_filter_or(level.to_string());
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp(None).format_target(false);
    if let Some(path) = file {
        let file = File::create(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }
    let _ = builder.try_init();
    Ok(())
}
