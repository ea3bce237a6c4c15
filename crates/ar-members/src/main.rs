use anyhow::{Context, Result};
use ar_format::{read_archive, ArchiveMember};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "List members of an ar archive", long_about = None)]
struct Args {
    input: PathBuf,

    /// Only show members whose name occurs more than once
    #[arg(short, long, default_value_t = false)]
    duplicates: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let members = read_archive(&args.input)
        .with_context(|| format!("Failed to parse archive: {:?}", args.input))?;
    log::info!("{} members in {:?}", members.len(), args.input);

    for m in select(&members, args.duplicates) {
        println!("[{}] {} ({} bytes)", m.index, m.name, m.data.len());
    }
    Ok(())
}

fn select(members: &[ArchiveMember], duplicates_only: bool) -> Vec<&ArchiveMember> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for m in members {
        *counts.entry(m.name.as_str()).or_default() += 1;
    }
    members
        .iter()
        .filter(|m| !duplicates_only || counts[m.name.as_str()] > 1)
        .collect()
}
