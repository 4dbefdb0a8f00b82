use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use filetime::FileTime;
use url::Url;

/// A fetched body waiting to be published into the mirror.
#[derive(Debug)]
pub struct WriteJob {
    pub dest: PathBuf,
    pub bytes: Vec<u8>,
    pub mtime: Option<SystemTime>,
}

/// Map a file url into the mirror tree: a host directory (dots replaced so
/// several sites can share one output root) followed by the url path.
pub fn local_path(output: &Path, url: &Url) -> PathBuf {
    let mut path = output.to_path_buf();
    let host = url.host_str().unwrap_or_default();
    if !host.is_empty() {
        path.push(host.replace('.', "_"));
    }
    if let Some(segments) = url.path_segments() {
        for segment in segments.filter(|s| !s.is_empty()) {
            path.push(segment);
        }
    }
    path
}

/// Write the body to a `.part` sibling, stamp the remote mtime on it, then
/// rename into place. The final path never holds a partial file; on failure
/// the `.part` file is removed and the prior state is kept.
pub fn publish(job: &WriteJob) -> Result<()> {
    if let Some(parent) = job.dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Couldn't create {}", parent.display()))?;
    }
    let part = part_path(&job.dest);
    write_part(&part, job).map_err(|e| {
        fs::remove_file(&part).ok();
        e
    })
}

fn write_part(part: &Path, job: &WriteJob) -> Result<()> {
    let mut file =
        fs::File::create(part).with_context(|| format!("Couldn't create {}", part.display()))?;
    file.write_all(&job.bytes)?;
    file.sync_all()?;
    drop(file);

    if let Some(mtime) = job.mtime {
        filetime::set_file_mtime(part, FileTime::from_system_time(mtime))
            .with_context(|| format!("Couldn't set mtime on {}", part.display()))?;
    }
    fs::rename(part, &job.dest)
        .with_context(|| format!("Couldn't publish {}", job.dest.display()))?;
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
