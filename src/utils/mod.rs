use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Create a directory and any missing parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
}

/// Resolve a credential directory setting against the user's home directory.
/// Absolute paths are used as-is; relative paths (the default `.qwen`) land
/// under `$HOME`.
pub fn resolve_home_dir(dir: &str) -> Result<PathBuf> {
    let path = PathBuf::from(dir);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(dirs::home_dir()
        .context("Could not determine home directory")?
        .join(path))
}

/// Replace `path` with `content` without ever exposing a partial or
/// world-readable file.
///
/// The blob is staged in a sibling temp file that is chmodded to owner-only
/// before any bytes land in it (the credential record must stay private even
/// for its first few milliseconds), synced, and renamed over the
/// destination. A crash mid-write leaves the previous file untouched, and
/// concurrent readers only ever see the old record or the new one.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to stage a temp file in {}", dir.display()))?;
    restrict_to_owner(staged.as_file());
    staged
        .write_all(content)
        .context("Failed to write staged credential blob")?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(file: &std::fs::File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &std::fs::File) {}
