use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::{fs, io, io::AsyncWriteExt};

/// Replaces the contents of `path` so that readers see either the previous or the new version,
/// never a torn write. The data is written into a sibling temp file, synced and renamed over the
/// target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), io::Error> {
    let temp = temp_sibling(path);
    let mut file = fs::File::create(&temp).await?;
    let written = async {
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }
    fs::rename(&temp, path).await
}

/// Reads a whole file, mapping a missing file to `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, io::Error> {
    match fs::read(path).await {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|v| v.to_os_string())
        .unwrap_or_else(|| OsString::from("timekeep"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::{read_optional, write_atomic};

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");

        write_atomic(&path, b"first").await?;
        write_atomic(&path, b"second").await?;

        assert_eq!(read_optional(&path).await?, Some(b"second".to_vec()));
        assert!(!dir.path().join("state.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_optional_missing() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(read_optional(&dir.path().join("absent")).await?, None);
        Ok(())
    }
}
