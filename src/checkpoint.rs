use crate::models::{Dataset, DoneSet, WorkItem};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Durable run state: the output dataset plus the done-set of the run.
///
/// The dataset is read from `output` when a previous run left one, else
/// from `input`. Both files are rewritten whole on every save, through a
/// temporary sibling that is fsynced and renamed into place.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    input: PathBuf,
    output: PathBuf,
    checkpoint: PathBuf,
}

impl CheckpointStore {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            checkpoint: checkpoint.into(),
        }
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self::new(&cfg.input_dataset, &cfg.output_dataset, &cfg.checkpoint_path)
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// True when a done-set file exists, i.e. a previous run was interrupted.
    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint.exists()
    }

    pub fn load(&self) -> Result<(Dataset, DoneSet)> {
        let dataset: Dataset = if self.output.exists() {
            info!("Resuming from {}", self.output.display());
            read_json(&self.output)?
        } else if self.input.exists() {
            info!("Loading {}", self.input.display());
            read_json(&self.input)?
        } else {
            Dataset::new()
        };
        let done: DoneSet = if self.checkpoint.exists() {
            let ids: Vec<String> = read_json(&self.checkpoint)?;
            ids.into_iter().collect()
        } else {
            DoneSet::new()
        };
        debug!("Loaded {} records, {} done", dataset.len(), done.len());
        Ok((dataset, done))
    }

    /// Persist both containers. The dataset goes first so a crash between the
    /// two writes can only under-report progress, never over-report it.
    pub fn save(&self, dataset: &Dataset, done: &DoneSet) -> Result<()> {
        write_json_atomic(&self.output, dataset, true)?;
        write_json_atomic(&self.checkpoint, done, false)?;
        debug!("Checkpoint saved: {} records, {} done", dataset.len(), done.len());
        Ok(())
    }

    /// Progress of `work` as recorded on disk.
    pub fn progress(&self, work: &[WorkItem]) -> Result<Progress> {
        let (dataset, done) = self.load()?;
        let done_count = work.iter().filter(|id| done.contains(*id)).count();
        Ok(Progress {
            total: work.len(),
            done: done_count,
            pending: work.len() - done_count,
            records: dataset.len(),
            interrupted_run: self.has_checkpoint(),
        })
    }

    /// Drop the done-set once the run completed. The output dataset stays.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.checkpoint) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.checkpoint.display())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub pending: usize,
    pub records: usize,
    pub interrupted_run: bool,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(f)).with_context(|| format!("parsing {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let f = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        if pretty {
            serde_json::to_writer_pretty(&mut w, value)?;
        } else {
            serde_json::to_writer(&mut w, value)?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replacing {} with {}", path.display(), tmp.display()))?;
    Ok(())
}
