//! # Workspace Module
//!
//! Questo modulo gestisce l'albero di lavoro per sito e le operazioni sui file.
//!
//! ## Responsabilità:
//! - Workspace esclusivo per sito: un solo job alla volta lo possiede (lease)
//! - Attesa del rilascio, usata dalla cancellazione di un sito
//! - Discovery ricorsiva dei file dell'albero con `walkdir`
//! - Classificazione dei file (pagina, stylesheet, script, immagine)
//! - Scritture che creano le directory mancanti
//!
//! ## Sicurezza operazioni:
//! - I path con `..` o assoluti vengono rifiutati
//! - Il lease si rilascia nel `Drop`, anche se la build va in panic
//!
//! ## Utilità:
//! - `format_size()`: Converte bytes in formato leggibile (KB, MB, GB)

use crate::error::OptimizeError;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::Notify;
use tracing::debug;
use walkdir::WalkDir;

/// What a workspace file is, by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Page,
    Stylesheet,
    Script,
    Image,
    Other,
}

impl FileKind {
    pub fn of(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "html" | "htm" => Self::Page,
            "css" => Self::Stylesheet,
            "js" | "mjs" => Self::Script,
            _ if crate::optimizer::images::is_image_path(path) => Self::Image,
            _ => Self::Other,
        }
    }
}

struct Inner {
    root: PathBuf,
    held: Mutex<HashSet<String>>,
    released: Notify,
}

/// Hands out exclusive per-site workspaces
#[derive(Clone)]
pub struct WorkspaceManager {
    inner: Arc<Inner>,
}

fn dir_name(site_id: &str) -> String {
    site_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl WorkspaceManager {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.to_path_buf(),
                held: Mutex::new(HashSet::new()),
                released: Notify::new(),
            }),
        }
    }

    pub fn dir_for(&self, site_id: &str) -> PathBuf {
        self.inner.root.join(dir_name(site_id))
    }

    /// Exclusive lease, `None` while another job holds the site
    pub fn try_acquire(&self, site_id: &str) -> Option<WorkspaceLease> {
        let mut held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(site_id.to_string()) {
            return None;
        }
        debug!("🔒 Workspace acquired for {}", site_id);
        Some(WorkspaceLease {
            inner: self.inner.clone(),
            site_id: site_id.to_string(),
            dir: self.dir_for(site_id),
        })
    }

    pub fn is_busy(&self, site_id: &str) -> bool {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner()).contains(site_id)
    }

    pub async fn wait_released(&self, site_id: &str) {
        loop {
            let notified = self.inner.released.notified();
            if !self.is_busy(site_id) {
                return;
            }
            notified.await;
        }
    }

    /// Delete the site's tree; callers wait for the lease first
    pub async fn remove(&self, site_id: &str) -> Result<(), OptimizeError> {
        let dir = self.dir_for(site_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OptimizeError::Workspace(format!("{}: {}", dir.display(), e))),
        }
    }
}

/// Exclusive access to one site tree, released on drop
pub struct WorkspaceLease {
    inner: Arc<Inner>,
    site_id: String,
    dir: PathBuf,
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        self.inner
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.site_id);
        self.inner.released.notify_waiters();
        debug!("🔓 Workspace released for {}", self.site_id);
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> OptimizeError {
    OptimizeError::Workspace(format!("{}: {}", path.display(), e))
}

impl WorkspaceLease {
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, site_path: &str) -> Result<PathBuf, OptimizeError> {
        let relative = Path::new(site_path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(OptimizeError::Workspace(format!("path escapes workspace: {}", site_path)));
        }
        Ok(self.dir.join(relative))
    }

    /// Empty tree, ready for a fresh crawl
    pub async fn reset(&self) -> Result<(), OptimizeError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).await.map_err(|e| unavailable(&self.dir, e))?;
        }
        fs::create_dir_all(&self.dir).await.map_err(|e| unavailable(&self.dir, e))
    }

    /// Every file in the tree as a site path, sorted
    pub fn list_files(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.dir)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .filter(|p| !p.ends_with(".tmp"))
            .collect();
        files.sort();
        files
    }

    pub fn files_of(&self, kind: FileKind) -> Vec<String> {
        self.list_files().into_iter().filter(|p| FileKind::of(p) == kind).collect()
    }

    pub fn exists(&self, site_path: &str) -> bool {
        self.resolve(site_path).map(|p| p.is_file()).unwrap_or(false)
    }

    pub async fn read(&self, site_path: &str) -> Result<Vec<u8>, OptimizeError> {
        let path = self.resolve(site_path)?;
        fs::read(&path).await.map_err(|e| unavailable(&path, e))
    }

    pub async fn read_string(&self, site_path: &str) -> Result<String, OptimizeError> {
        let bytes = self.read(site_path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn write(&self, site_path: &str, bytes: &[u8]) -> Result<(), OptimizeError> {
        let path = self.resolve(site_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| unavailable(parent, e))?;
        }
        fs::write(&path, bytes).await.map_err(|e| unavailable(&path, e))
    }

    pub async fn remove(&self, site_path: &str) -> Result<(), OptimizeError> {
        let path = self.resolve(site_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(&path, e)),
        }
    }
}

/// Get human-readable file size
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let lease = manager.try_acquire("acme").unwrap();
        assert!(manager.try_acquire("acme").is_none());
        assert!(manager.try_acquire("other").is_some());
        assert!(manager.is_busy("acme"));
        drop(lease);
        assert!(!manager.is_busy("acme"));
    }

    #[tokio::test]
    async fn test_wait_released_wakes_up() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let lease = manager.try_acquire("acme").unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_released("acme").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let lease = manager.try_acquire("acme.test").unwrap();
        lease.reset().await.unwrap();
        lease.write("css/site.css", b"a{}").await.unwrap();
        lease.write("index.html", b"<html></html>").await.unwrap();
        lease.write("img/logo.png", b"png").await.unwrap();

        assert_eq!(lease.list_files(), vec!["css/site.css", "img/logo.png", "index.html"]);
        assert_eq!(lease.files_of(FileKind::Page), vec!["index.html"]);
        assert_eq!(lease.read_string("css/site.css").await.unwrap(), "a{}");
        assert!(matches!(lease.write("../escape.txt", b"x").await, Err(OptimizeError::Workspace(_))));

        lease.remove("css/site.css").await.unwrap();
        assert!(!lease.exists("css/site.css"));
        drop(lease);
        manager.remove("acme.test").await.unwrap();
        assert!(!manager.dir_for("acme.test").exists());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
    }
}
