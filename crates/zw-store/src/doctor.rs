use anyhow::Result;
use std::path::Path;

pub fn check_storage(path: &str) -> Result<()> {
    anyhow::ensure!(!path.trim().is_empty(), "storage.path is empty");
    let p = Path::new(path);
    if p.exists() {
        anyhow::ensure!(p.is_file(), "storage.path is not a file: {}", path);
    }
    if let Some(parent) = p.parent() {
        if parent.exists() {
            anyhow::ensure!(parent.is_dir(), "storage.path parent is not a dir: {}", parent.display());
        }
    }
    Ok(())
}
