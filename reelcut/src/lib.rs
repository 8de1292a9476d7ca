//! reelcut: a command line front end for the timeline editing engine.
//!
//! Builds sequences out of `--clip` arguments, dumps their packets or frames, encodes them, and
//! assembles random edits out of a directory of sources.

pub mod cli;
pub mod commands;
pub mod config;
pub mod splice;

use anyhow::Result;
use cli::{Cli, Command};
use config::Settings;
use std::io;

/// Log lines look like `[12:30:01 INFO sequence.rs 42] message`.
pub fn init_logger() {
    use std::io::Write;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            let ts = chrono::Local::now().format("%H:%M:%S");

            writeln!(
                buf,
                "[{} {style}{}{style:#} {} {}] {}",
                ts,
                record.level(),
                record
                    .file()
                    .unwrap_or("None")
                    .split('/')
                    .next_back()
                    .unwrap_or("None"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

pub fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let mut stdout = io::stdout().lock();
    match &cli.command {
        Command::Probe { files } => {
            let backend = commands::open_backend(files)?;
            commands::probe(&backend, files, &mut stdout)?;
        }
        Command::Packets(args) => {
            let backend = commands::open_backend(&clip_paths(args))?;
            let mut seq = commands::build_sequence(&backend, &settings, args)?;
            let count = commands::dump_packets(&mut seq, &mut stdout)?;
            log::info!("{count} packets");
        }
        Command::Frames(args) => {
            let backend = commands::open_backend(&clip_paths(args))?;
            let mut seq = commands::build_sequence(&backend, &settings, args)?;
            let count = commands::dump_frames(&mut seq, &mut stdout)?;
            log::info!("{count} frames");
        }
        Command::Encode(args) => {
            let backend = commands::open_backend(&clip_paths(&args.sequence))?;
            commands::encode(&backend, &settings, args)?;
        }
        Command::Splice(args) => commands::run_splice(&settings, args)?,
    }
    Ok(())
}

fn clip_paths(args: &cli::SequenceArgs) -> Vec<std::path::PathBuf> {
    args.clips.iter().map(|spec| spec.path.clone()).collect()
}
