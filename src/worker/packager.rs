use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;

/// Compress everything under `work_dir` into a zip archive at `artifact_path`.
///
/// Entry names are relative to `work_dir`, directories end in `/` and files
/// are deflated. Symbolic links are skipped without being followed. A missing
/// `work_dir` produces no archive and is not an error.
/// The archive is written beside the target and renamed into place once complete.
pub fn package(work_dir: &Path, artifact_path: &Path) -> Result<()> {
    if !work_dir.is_dir() {
        tracing::debug!(work_dir = %work_dir.display(), "Nothing to package");
        return Ok(());
    }

    let partial = partial_path(artifact_path);
    let result = write_archive(work_dir, &partial);
    match result {
        Ok(entries) => {
            fs::rename(&partial, artifact_path)?;
            tracing::debug!(
                artifact = %artifact_path.display(),
                entries,
                "Archive written"
            );
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn partial_path(artifact_path: &Path) -> PathBuf {
    let mut name = artifact_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn write_archive(work_dir: &Path, target: &Path) -> Result<usize> {
    let file = File::create(target)?;
    let mut archive = ZipWriter::new(BufWriter::new(file));
    let dir_options = SimpleFileOptions::default();
    let file_options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0;
    let mut pending = vec![work_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut children = fs::read_dir(&dir)?
            .map(|entry| entry.and_then(|e| Ok((e.path(), e.file_type()?))))
            .collect::<io::Result<Vec<_>>>()?;
        children.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, file_type) in children {
            let name = entry_name(work_dir, &path);
            if file_type.is_symlink() {
                tracing::warn!(entry = %name, "Skipping symbolic link");
                continue;
            }
            if file_type.is_dir() {
                archive.add_directory(format!("{}/", name), dir_options)?;
                pending.push(path);
            } else if file_type.is_file() {
                archive.start_file(name, file_options)?;
                let mut source = File::open(&path)?;
                io::copy(&mut source, &mut archive)?;
            } else {
                tracing::warn!(entry = %name, "Skipping special file");
                continue;
            }
            entries += 1;
        }
    }

    let mut writer = archive.finish()?;
    io::Write::flush(&mut writer)?;
    Ok(entries)
}

/// Forward-slash path of `path` relative to `root`.
fn entry_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
