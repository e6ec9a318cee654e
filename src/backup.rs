use crate::util::{sanitize_filename, timestamp};
use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where one input file was duplicated before a run.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Duplicate the input files into a timestamped archive before a run.
///
/// Destination root is `<override_root>/<task_name>` when an override is
/// configured, else `<output_dir>/backups/<task_name>`; a single timestamp
/// directory is shared by the whole batch and never reused. Missing source
/// files are skipped without failing the batch. Directory creation or a
/// copy failure is an error, so the caller can abort the run before launch.
///
/// Runs synchronously and completely before the task starts; the enabled
/// flag is the caller's concern.
pub fn backup_inputs(
    files: &[PathBuf],
    task_name: &str,
    output_dir: &Path,
    override_root: Option<&Path>,
) -> anyhow::Result<Vec<BackupRecord>> {
    let task_dir_name = sanitize_filename(task_name);
    let base = match override_root {
        Some(root) => root.join(&task_dir_name),
        None => output_dir.join("backups").join(&task_dir_name),
    };

    let batch_stamp = timestamp();
    let batch_dir = base.join(&batch_stamp);
    std::fs::create_dir_all(&batch_dir)
        .with_context(|| format!("failed to create backup directory {:?}", batch_dir))?;

    let mut records = Vec::new();
    for source in files {
        if !source.exists() {
            debug!("skipping missing input {:?}", source);
            continue;
        }
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let dest = batch_dir.join(format!("{}_{}{}", stem, batch_stamp, ext));
        std::fs::copy(source, &dest)
            .with_context(|| format!("failed to back up {:?} to {:?}", source, dest))?;
        records.push(BackupRecord {
            source: source.clone(),
            dest,
        });
    }
    Ok(records)
}
