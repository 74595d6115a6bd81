//! Crash-safe file replacement shared by settings and job records.

use std::io::Write;
use std::path::Path;

use uuid::Uuid;

/// Write `data` to a uniquely named sibling temp file, fsync it, then rename
/// it over `path`. Readers observe either the old or the new contents.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("path has no file name"))?;

    let mut last_err = None;
    for _ in 0..5 {
        let tmp_path = dir.join(format!(
            "{}.tmp-{}",
            file_name.to_string_lossy(),
            &Uuid::new_v4().simple().to_string()[..12]
        ));
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path);
        let mut file = match file {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                last_err = Some(err);
                continue;
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = file.write_all(data).and_then(|_| file.sync_all()) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
        drop(file);
        if let Err(err) = replace_file(&tmp_path, path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
        sync_parent_dir(dir)?;
        return Ok(());
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("failed to create temporary file for {}", path.display()),
        )
    }))
}

fn replace_file(temp_path: &Path, path: &Path) -> std::io::Result<()> {
    match std::fs::rename(temp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            #[cfg(target_os = "windows")]
            if err.kind() == std::io::ErrorKind::AlreadyExists
                || err.kind() == std::io::ErrorKind::PermissionDenied
            {
                if let Err(inner) = std::fs::remove_file(path) {
                    if inner.kind() != std::io::ErrorKind::NotFound {
                        return Err(inner);
                    }
                }
                return std::fs::rename(temp_path, path);
            }
            Err(err)
        }
    }
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_contents_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn missing_parent_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("file.json");
        assert!(atomic_write(&path, b"{}").is_err());
    }
}
