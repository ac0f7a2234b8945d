//! Scratch directory for one run's artifacts.
//!
//! Nothing in the output directory changes until `promote`; a failed or killed
//! run leaves only a `.staging-*` directory, removed by the next run. A staging
//! directory still holding moved-aside outputs is never removed automatically.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::constants::STAGING_PREFIX;
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::cache;

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDigest {
    pub file: String,
    pub sha256: String,
    pub bytes: usize,
}

pub struct StagingArea {
    dir: PathBuf,
    output_dir: PathBuf,
    staged: Vec<ArtifactDigest>,
}

impl StagingArea {
    pub fn create(output_dir: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        let dir = output_dir.join(format!("{}{}", STAGING_PREFIX, run_id));
        fs::create_dir_all(&dir)?;
        debug!("Staging into {}", dir.display());
        Ok(Self {
            dir,
            output_dir: output_dir.to_path_buf(),
            staged: Vec::new(),
        })
    }

    /// Remove staging directories left behind by interrupted runs.
    pub fn clean_stale(output_dir: &Path) -> Result<usize> {
        if !output_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(output_dir)? {
            let entry = entry?;
            let stale = entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX);
            if stale && entry.file_type()?.is_dir() {
                if entry.path().join(BACKUP_DIR).exists() {
                    warn!(
                        "Keeping {}: it holds previous outputs from an interrupted promotion",
                        entry.path().display()
                    );
                    continue;
                }
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale staging director(ies)", removed);
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn staged(&self) -> &[ArtifactDigest] {
        &self.staged
    }

    pub fn write(&mut self, file: &str, bytes: &[u8]) -> Result<ArtifactDigest> {
        fs::write(self.dir.join(file), bytes)?;
        let digest = ArtifactDigest {
            file: file.to_string(),
            sha256: cache::digest(bytes),
            bytes: bytes.len(),
        };
        self.staged.push(digest.clone());
        Ok(digest)
    }

    /// Move every staged file into the output directory, then drop the scratch dir.
    ///
    /// All or nothing: existing outputs are first moved aside into the scratch dir
    /// and moved back if any rename fails. The scratch dir is removed either way,
    /// unless a rollback itself failed and it still holds previous outputs.
    pub fn promote(self) -> Result<Vec<ArtifactDigest>> {
        let backup = self.dir.join(BACKUP_DIR);
        let mut swap = Swap::default();
        if let Err(e) = self.swap_in(&backup, &mut swap) {
            if swap.roll_back(&self.output_dir, &self.dir, &backup) {
                self.discard_dir();
            } else {
                error!(
                    "Rollback incomplete; previous outputs are kept in {}",
                    backup.display()
                );
            }
            return Err(e);
        }
        self.discard_dir();
        for artifact in &self.staged {
            info!("Promoted {} ({} bytes)", artifact.file, artifact.bytes);
        }
        Ok(self.staged)
    }

    fn swap_in(&self, backup: &Path, swap: &mut Swap) -> Result<()> {
        for artifact in &self.staged {
            let target = self.output_dir.join(&artifact.file);
            if let Ok(meta) = fs::symlink_metadata(&target) {
                if meta.is_dir() {
                    return Err(PipelineError::Io(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("output target {} is a directory", target.display()),
                    )));
                }
            }
        }
        fs::create_dir_all(backup)?;
        for artifact in &self.staged {
            let target = self.output_dir.join(&artifact.file);
            if target.exists() {
                fs::rename(&target, backup.join(&artifact.file))?;
                swap.moved_aside.push(artifact.file.clone());
            }
        }
        for artifact in &self.staged {
            fs::rename(self.dir.join(&artifact.file), self.output_dir.join(&artifact.file))?;
            swap.promoted.push(artifact.file.clone());
        }
        Ok(())
    }

    pub fn discard(self) {
        self.discard_dir();
    }

    fn discard_dir(&self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!("Could not remove staging dir {}: {}", self.dir.display(), e);
        }
    }
}

const BACKUP_DIR: &str = ".previous";

/// Files moved so far during one promotion.
#[derive(Default)]
struct Swap {
    moved_aside: Vec<String>,
    promoted: Vec<String>,
}

impl Swap {
    /// Put the output directory back the way it was. `false` if any step failed.
    fn roll_back(&self, output_dir: &Path, staging_dir: &Path, backup: &Path) -> bool {
        let mut clean = true;
        for file in self.promoted.iter().rev() {
            if let Err(e) = fs::rename(output_dir.join(file), staging_dir.join(file)) {
                warn!("Could not withdraw promoted {}: {}", file, e);
                clean = false;
            }
        }
        for file in self.moved_aside.iter().rev() {
            if let Err(e) = fs::rename(backup.join(file), output_dir.join(file)) {
                warn!("Could not restore previous {}: {}", file, e);
                clean = false;
            }
        }
        if clean {
            warn!(
                "Promotion rolled back: {} promoted, {} restored",
                self.promoted.len(),
                self.moved_aside.len()
            );
        }
        clean
    }
}
