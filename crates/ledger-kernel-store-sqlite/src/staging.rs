use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use time::OffsetDateTime;
use ulid::Ulid;

/// `path` with `suffix` appended to its final component.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

pub(crate) fn wal_path(db_path: &Path) -> PathBuf {
    sibling_path(db_path, "-wal")
}

pub(crate) fn shm_path(db_path: &Path) -> PathBuf {
    sibling_path(db_path, "-shm")
}

pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub(crate) fn sync_file(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|file| file.sync_all())
        .with_context(|| format!("failed to fsync {}", path.display()))
}

#[cfg(unix)]
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("failed to fsync directory {}", path.display()))
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Remove the `-wal` and `-shm` files that belong to `db_path`.
pub(crate) fn remove_sidecars(db_path: &Path) -> Result<()> {
    remove_if_exists(&wal_path(db_path))?;
    remove_if_exists(&shm_path(db_path))?;
    Ok(())
}

/// Copy `src` over `dest` through a fsynced temporary sibling and an atomic rename.
///
/// `dest` keeps its previous contents until the rename succeeds.
pub(crate) fn staged_copy(src: &Path, dest: &Path) -> Result<()> {
    let tmp = sibling_path(dest, &format!(".tmp-{}", Ulid::new()));
    fs::copy(src, &tmp)
        .with_context(|| format!("failed to copy {} to {}", src.display(), tmp.display()))?;
    commit_staged(&tmp, dest)
}

/// Write `bytes` to `dest` through a fsynced temporary sibling and an atomic rename.
pub(crate) fn staged_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = sibling_path(dest, &format!(".tmp-{}", Ulid::new()));
    let written = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .with_context(|| format!("failed to write {}", tmp.display()));
    if let Err(err) = written {
        discard_tmp(&tmp);
        return Err(err);
    }
    commit_staged(&tmp, dest)
}

fn commit_staged(tmp: &Path, dest: &Path) -> Result<()> {
    let renamed = sync_file(tmp).and_then(|()| {
        fs::rename(tmp, dest).with_context(|| {
            format!("failed to rename {} over {}", tmp.display(), dest.display())
        })
    });
    if let Err(err) = renamed {
        discard_tmp(tmp);
        return Err(err);
    }
    sync_dir(&parent_dir(dest))
}

fn discard_tmp(tmp: &Path) {
    if let Err(err) = remove_if_exists(tmp) {
        tracing::warn!(path = %tmp.display(), "failed to remove staged file: {err:#}");
    }
}

/// Byte-for-byte image of a store file, kept next to it for the length of one operation.
#[derive(Debug)]
pub(crate) struct FileSnapshot {
    live: PathBuf,
    image: PathBuf,
}

impl FileSnapshot {
    /// Copy the (checkpointed) live file to `<live>.<label>`.
    pub(crate) fn capture(live: &Path, label: &str) -> Result<Self> {
        let image = sibling_path(live, &format!(".{label}"));
        if live.exists() {
            staged_copy(live, &image)?;
        } else {
            staged_write(&image, &[])?;
        }
        Ok(Self { live: live.to_path_buf(), image })
    }

    pub(crate) fn image_path(&self) -> &Path {
        &self.image
    }

    /// Put the captured image back over the live file. Every connection to the live
    /// file must be closed first.
    pub(crate) fn restore(&self) -> Result<()> {
        remove_sidecars(&self.live)?;
        staged_copy(&self.image, &self.live)
    }

    pub(crate) fn discard(self) -> Result<()> {
        remove_if_exists(&self.image).map(|_| ())
    }
}

/// Move a damaged store and its sidecars aside as `<db>.corrupt-<unix millis>`.
///
/// Falls back to deleting the file when it cannot be renamed, and reports `None` then.
pub(crate) fn quarantine(db_path: &Path) -> Result<Option<PathBuf>> {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let target = sibling_path(db_path, &format!(".corrupt-{millis}"));

    if let Err(rename_err) = fs::rename(db_path, &target) {
        tracing::warn!(
            path = %db_path.display(),
            "failed to move damaged store aside ({rename_err}); deleting it instead"
        );
        fs::remove_file(db_path).map_err(|remove_err| {
            anyhow!(
                "failed to quarantine {}: rename failed ({rename_err}), remove failed ({remove_err})",
                db_path.display()
            )
        })?;
        remove_sidecars(db_path)?;
        return Ok(None);
    }

    for (sidecar, suffix) in [(wal_path(db_path), "-wal"), (shm_path(db_path), "-shm")] {
        if sidecar.exists() {
            let moved = sibling_path(&target, suffix);
            if fs::rename(&sidecar, &moved).is_err() {
                remove_if_exists(&sidecar)?;
            }
        }
    }
    sync_dir(&parent_dir(db_path))?;
    Ok(Some(target))
}
