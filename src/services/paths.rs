//! Filesystem layout under the uploads root.
//!
//! ```text
//! uploads/<identifier><ext>        committed files
//! uploads/chunks/<ip>_<uuid>/tmp   in-progress chunk sessions
//! uploads/thumbs/<identifier>.png  thumbnails
//! uploads/zips/<identifier>.zip    album archives
//! ```
//!
//! Everything that removes files goes through [`Paths::remove_scoped`] so a
//! crafted name can never reach outside the uploads root.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
    chunks: PathBuf,
    thumbs: PathBuf,
    zips: PathBuf,
}

impl Paths {
    pub fn new(uploads_root: impl Into<PathBuf>) -> Self {
        let root = uploads_root.into();
        Self {
            chunks: root.join("chunks"),
            thumbs: root.join("thumbs"),
            zips: root.join("zips"),
            root,
        }
    }

    /// Creates the uploads root and every subdirectory. Called once at
    /// startup, before the server accepts requests.
    pub fn init(&self) -> io::Result<()> {
        for dir in [&self.root, &self.chunks, &self.thumbs, &self.zips] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn uploads(&self) -> &Path {
        &self.root
    }

    /// Full path of a committed file, e.g. `uploads/abcd1234.png`.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Thumbnails are always PNG and keyed by the bare identifier.
    pub fn thumb(&self, identifier: &str) -> PathBuf {
        self.thumbs.join(format!("{identifier}.png"))
    }

    pub fn zip(&self, album_identifier: &str) -> PathBuf {
        self.zips.join(format!("{album_identifier}.zip"))
    }

    /// Directory holding one chunk session. The key is already namespaced
    /// (`<ip>_<uuid>`) and sanitized by the coordinator.
    pub fn chunk_dir(&self, session_key: &str) -> PathBuf {
        self.chunks.join(session_key)
    }

    /// Removes a single file, treating an already-missing file as success.
    /// Refuses to touch anything outside the uploads root.
    pub async fn remove_scoped(&self, path: &Path) -> io::Result<()> {
        if !path.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("refusing to remove {} outside the uploads root", path.display()),
            ));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_expected_tree() {
        let paths = Paths::new("/tmp/uploads");
        assert_eq!(paths.file("abcd.png"), PathBuf::from("/tmp/uploads/abcd.png"));
        assert_eq!(
            paths.thumb("abcd"),
            PathBuf::from("/tmp/uploads/thumbs/abcd.png")
        );
        assert_eq!(paths.zip("al01"), PathBuf::from("/tmp/uploads/zips/al01.zip"));
        assert_eq!(
            paths.chunk_dir("1.2.3.4_u1"),
            PathBuf::from("/tmp/uploads/chunks/1.2.3.4_u1")
        );
    }

    #[tokio::test]
    async fn remove_scoped_rejects_outside_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("uploads"));
        paths.init().unwrap();

        let err = paths
            .remove_scoped(Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn remove_scoped_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("uploads"));
        paths.init().unwrap();

        let target = paths.file("gone.bin");
        paths.remove_scoped(&target).await.unwrap();

        std::fs::write(&target, b"x").unwrap();
        paths.remove_scoped(&target).await.unwrap();
        assert!(!target.exists());
    }
}
