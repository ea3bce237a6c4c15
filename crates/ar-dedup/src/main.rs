// crates/ar-dedup/src/main.rs
mod policy;
mod repack;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use policy::{plan_drops, CandidateSet};
use repack::{Archiver, NativeArchiver, RepackError, Staging, SystemAr};

#[derive(Parser, Debug)]
#[command(author, version, about = "Remove duplicated object members from a static library", long_about = None)]
#[command(override_usage = "ar-dedup [OPTIONS] <INPUT> <OUTPUT>")]
struct Args {
    /// Input archive followed by output archive
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Member name to deduplicate (repeatable; replaces the ggml defaults)
    #[arg(short, long = "candidate", value_name = "NAME")]
    candidates: Vec<String>,

    /// Archiver used to rebuild the library
    #[arg(long, value_name = "PROGRAM", default_value = "ar")]
    ar: String,

    /// Write the archive directly instead of running an archiver (no symbol index)
    #[arg(long, default_value_t = false)]
    native: bool,

    /// More log output on stderr
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn candidate_set(&self) -> CandidateSet {
        if self.candidates.is_empty() {
            CandidateSet::default()
        } else {
            CandidateSet::new("candidate", self.candidates.iter().cloned())
        }
    }

    fn archiver(&self) -> Box<dyn Archiver> {
        if self.native {
            Box::new(NativeArchiver)
        } else {
            Box::new(SystemAr::new(&self.ar))
        }
    }
}

fn usage() -> ! {
    println!("{}", Args::command().render_usage());
    std::process::exit(1);
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(_) => usage(),
    };
    let [input, output] = args.paths.as_slice() else {
        usage();
    };

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&args, input, output) {
        eprintln!("ar-dedup: {:#}", e);
        let code = e.downcast_ref::<RepackError>().map_or(1, RepackError::exit_code);
        std::process::exit(code);
    }
}

fn run(args: &Args, input: &Path, output: &Path) -> Result<()> {
    let members = ar_format::read_archive(input)
        .with_context(|| format!("Failed to parse archive: {:?}", input))?;
    log::info!("read {} members from {:?}", members.len(), input);

    let candidates = args.candidate_set();
    if candidates.is_empty() {
        log::warn!("no candidate names configured, nothing can be dropped");
    }
    log::debug!("candidates: {:?}", candidates.iter().collect::<Vec<_>>());
    let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
    let drops = plan_drops(&names, &candidates);

    if drops.is_empty() {
        println!("No duplicate {} objects found, copying as-is", candidates.label());
        repack::copy_verbatim(input, output)?;
        return Ok(());
    }

    println!("Removing {} {} objects:", drops.len(), candidates.label());
    for (index, name) in drops.report(&names) {
        println!("  [{}] {}", index, name);
    }

    let mut staging = Staging::new_for(output)
        .with_context(|| format!("Failed to create staging directory for {:?}", output))?;
    for member in members.into_iter().filter(|m| !drops.contains(m.index)) {
        staging.stage(member)?;
    }

    println!("Repacking {} objects into {}", staging.len(), output.display());
    staging.finish(args.archiver().as_ref(), output)?;

    println!("Done!");
    Ok(())
}
