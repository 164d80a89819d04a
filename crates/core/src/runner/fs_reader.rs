//! Filesystem-backed realm reader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use url::Url;
use walkdir::WalkDir;

use super::collaborators::{FileRef, Reader, ReaderError};
use crate::paths::RealmPaths;

/// Serves a realm from a directory on disk.
///
/// Every regular file under the root is a realm resource whose url is the
/// realm url joined with the file's relative path.
#[derive(Debug)]
pub struct FsReader {
    root: PathBuf,
    root_url: Url,
    realm: RealmPaths,
}

impl FsReader {
    pub fn new(root: &Path, realm_url: &str) -> Result<Self, ReaderError> {
        let root = root
            .canonicalize()
            .map_err(|_| ReaderError::MissingRoot(root.display().to_string()))?;
        if !root.is_dir() {
            return Err(ReaderError::MissingRoot(root.display().to_string()));
        }
        let root_url = Url::from_directory_path(&root)
            .map_err(|_| ReaderError::Other(format!("cannot map {} to a url", root.display())))?;
        let realm = RealmPaths::new(realm_url)
            .map_err(|e| ReaderError::Other(format!("invalid realm url {realm_url}: {e}")))?;
        Ok(Self { root, root_url, realm })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn realm_url(&self) -> &str {
        self.realm.url()
    }

    /// Local file for a realm url, `None` for urls of other realms.
    fn path_for(&self, url: &str) -> Option<PathBuf> {
        let local = self.realm.local(url)?;
        if local.is_empty() {
            return None;
        }
        self.root_url.join(&local).ok()?.to_file_path().ok()
    }

    fn url_for(&self, relative: &Path) -> String {
        let local: Vec<_> =
            relative.components().map(|c| c.as_os_str().to_string_lossy()).collect();
        self.realm.file_url(&local.join("/"))
    }

    fn is_excluded(entry: &walkdir::DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            return name.starts_with('.')
                || matches!(name.as_ref(), "node_modules" | "target" | "dist" | "tmp");
        }
        // Ignore files are hidden but still consulted.
        name.starts_with('.') && name != ".gitignore"
    }
}

#[async_trait]
impl Reader for FsReader {
    async fn mtimes(&self) -> Result<BTreeMap<String, i64>, ReaderError> {
        let mut mtimes = BTreeMap::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !Self::is_excluded(e))
        {
            let entry = entry.map_err(|e| ReaderError::Io {
                url: self.realm.url().to_string(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let url = self.url_for(relative);
            let metadata = entry
                .metadata()
                .map_err(|e| ReaderError::Io { url: url.clone(), source: e.into() })?;
            mtimes.insert(url, unix_seconds(metadata.modified().ok()));
        }
        tracing::debug!(realm = self.realm.url(), files = mtimes.len(), "collected filesystem mtimes");
        Ok(mtimes)
    }

    async fn read_file(&self, url: &str) -> Result<Option<FileRef>, ReaderError> {
        let Some(path) = self.path_for(url) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|source| ReaderError::Io { url: url.to_string(), source })?;
        let metadata = std::fs::metadata(&path)
            .map_err(|source| ReaderError::Io { url: url.to_string(), source })?;
        let last_modified = unix_seconds(metadata.modified().ok());
        let created = metadata.created().ok().map_or(last_modified, |t| unix_seconds(Some(t)));
        Ok(Some(FileRef { content, last_modified, created }))
    }
}

fn unix_seconds(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_secs()).ok())
        .unwrap_or(0)
}
