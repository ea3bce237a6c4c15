// crates/ar-dedup/src/repack.rs
//! Writes the surviving members back out as an archive.
//!
//! Members are staged as files in a temporary directory next to the output,
//! an archiver assembles them, and the result is renamed over the
//! destination. The destination is left alone until the archiver succeeds.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use ar_format::{ArError, ArchiveBuilder, ArchiveMember};
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepackError {
    #[error("failed to launch archiver `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("archiver `{program}` failed with {status}")]
    Failed { program: String, status: ExitStatus },
    #[error("failed to stage member [{index}] {name}: {source}")]
    Stage { index: usize, name: String, source: io::Error },
    #[error(transparent)]
    Format(#[from] ArError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RepackError {
    /// Process exit status to report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RepackError::Failed { status, .. } => status.code().filter(|&c| c != 0).unwrap_or(1),
            _ => 1,
        }
    }
}

// ==================== Archivers ====================
/// Builds an archive at `output` from `inputs`, in order. Each member is
/// named after its input's file name.
pub trait Archiver {
    fn create(&self, output: &Path, inputs: &[PathBuf]) -> Result<(), RepackError>;
}

/// Runs a system `ar`: `qc` appends without replacing members that share a
/// name, then `s` writes a fresh symbol index.
#[derive(Debug, Clone)]
pub struct SystemAr {
    program: OsString,
}

impl SystemAr {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, mut cmd: Command) -> Result<(), RepackError> {
        let program = self.program.to_string_lossy().into_owned();
        log::debug!("running {:?}", cmd);
        let status = cmd.status().map_err(|source| RepackError::Spawn {
            program: program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(RepackError::Failed { program, status });
        }
        Ok(())
    }
}

impl Archiver for SystemAr {
    fn create(&self, output: &Path, inputs: &[PathBuf]) -> Result<(), RepackError> {
        let mut append = Command::new(&self.program);
        append.arg("qc").arg(output).args(inputs);
        self.run(append)?;

        let mut index = Command::new(&self.program);
        index.arg("s").arg(output);
        self.run(index)
    }
}

/// Serializes the archive in-process. No symbol index is written, so the
/// result needs `ranlib` before most linkers accept it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeArchiver;

impl Archiver for NativeArchiver {
    fn create(&self, output: &Path, inputs: &[PathBuf]) -> Result<(), RepackError> {
        let mut builder = ArchiveBuilder::new();
        for input in inputs {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            builder.add_member(&name, &fs::read(input)?);
        }
        fs::write(output, builder.build()?)?;
        Ok(())
    }
}

// ==================== Staging ====================
/// Scoped directory of staged member payloads. Everything in it is removed
/// when the value is dropped, whether or not the rebuild succeeded.
pub struct Staging {
    dir: TempDir,
    staged: Vec<PathBuf>,
}

impl Staging {
    /// Creates the staging directory in the same directory as `output`.
    pub fn new_for(output: &Path) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".ar-dedup-")
            .tempdir_in(parent_dir(output))?;
        let staging = Self { dir, staged: Vec::new() };
        log::info!("staging members in {}", staging.path().display());
        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Writes the member to `<dir>/<index>/<name>` and returns the path.
    pub fn stage(&mut self, member: ArchiveMember) -> Result<&Path, RepackError> {
        let slot = self.dir.path().join(format!("{:05}", member.index));
        let path = slot.join(staged_file_name(&member.name));
        fs::create_dir(&slot)
            .and_then(|_| fs::write(&path, &member.data))
            .map_err(|source| RepackError::Stage {
                index: member.index,
                name: member.name,
                source,
            })?;
        self.staged.push(path);
        Ok(&self.staged[self.staged.len() - 1])
    }

    /// Runs the archiver over the staged files and moves the result to
    /// `output`.
    pub fn finish(self, archiver: &dyn Archiver, output: &Path) -> Result<(), RepackError> {
        let built = self.dir.path().join("rebuilt.a");
        archiver.create(&built, &self.staged)?;
        replace_file(&built, output)?;
        Ok(())
    }
}

/// Copies `input` to `output` byte for byte, keeping the source permissions.
pub fn copy_verbatim(input: &Path, output: &Path) -> Result<u64, RepackError> {
    let mut source = fs::File::open(input)?;
    let mut tmp = NamedTempFile::new_in(parent_dir(output))?;
    let copied = io::copy(&mut source, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), source.metadata()?.permissions())?;
    tmp.persist(output).map_err(|e| e.error)?;
    Ok(copied)
}

fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) if to.exists() => {
            fs::remove_file(to)?;
            fs::rename(from, to)
        }
        Err(e) => Err(e),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn staged_file_name(name: &str) -> String {
    match name {
        "" | "." | ".." => "member".to_string(),
        _ => name.replace(['/', '\\'], "_"),
    }
}
