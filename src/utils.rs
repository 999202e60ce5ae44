//! Utility functions for file operations and path manipulation

use crate::config::FileCollisionAction;
use crate::error::TransferError;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Longest file name derived from a remote reference
const MAX_FILE_NAME_LEN: usize = 120;

/// A destination claimed for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedPath {
    /// Where the finished file goes
    pub path: PathBuf,
    /// Whether an empty placeholder was created to hold the name
    pub created: bool,
}

/// Claim a destination path, handling collisions according to `action`
///
/// `Rename` and `Skip` create an empty placeholder with `create_new`, so two
/// concurrent callers can never be handed the same path. `Rename` may add a
/// ` (n)` suffix, `Skip` fails if the file exists, and `Overwrite` returns
/// the path unchanged without creating anything.
///
/// # Examples
///
/// ```no_run
/// use chat_export::utils::reserve_path;
/// use chat_export::config::FileCollisionAction;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), chat_export::error::TransferError> {
/// let reserved = reserve_path(Path::new("/tmp/photo.jpg"), FileCollisionAction::Rename).await?;
/// // If /tmp/photo.jpg exists, reserves /tmp/photo (1).jpg
/// println!("{}", reserved.path.display());
/// # Ok(())
/// # }
/// ```
pub async fn reserve_path(
    path: &Path,
    action: FileCollisionAction,
) -> Result<ReservedPath, TransferError> {
    match action {
        FileCollisionAction::Overwrite => Ok(ReservedPath {
            path: path.to_path_buf(),
            created: false,
        }),
        FileCollisionAction::Skip => {
            if claim(path).await.map_err(|e| TransferError::io(path, e))? {
                return Ok(ReservedPath {
                    path: path.to_path_buf(),
                    created: true,
                });
            }
            Err(TransferError::Collision {
                path: path.to_path_buf(),
            })
        }
        FileCollisionAction::Rename => {
            if claim(path).await.map_err(|e| TransferError::io(path, e))? {
                return Ok(ReservedPath {
                    path: path.to_path_buf(),
                    created: true,
                });
            }

            let invalid = || {
                TransferError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "cannot split file name"),
                )
            };
            let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(invalid)?;
            let extension = path.extension().and_then(|e| e.to_str());
            let parent = path.parent().ok_or_else(invalid)?;

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let new_name = match extension {
                    Some(ext) => format!("{} ({}).{}", stem, i, ext),
                    None => format!("{} ({})", stem, i),
                };
                let new_path = parent.join(new_name);
                if claim(&new_path)
                    .await
                    .map_err(|e| TransferError::io(&new_path, e))?
                {
                    return Ok(ReservedPath {
                        path: new_path,
                        created: true,
                    });
                }
            }

            Err(TransferError::Collision {
                path: path.to_path_buf(),
            })
        }
    }
}

/// Create `path` only if nothing exists there; `false` when it is taken
async fn claim(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Turn a remote media reference into a safe local file name
///
/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
#[must_use]
pub fn media_file_name(media_ref: &str) -> String {
    let mut name: String = media_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect();

    let trimmed = name.trim_start_matches('.');
    if trimmed.len() != name.len() {
        name = trimmed.to_string();
    }
    if name.is_empty() {
        name = "media".to_string();
    }
    name
}

/// SHA-256 of a file's contents as lowercase hex
///
/// Reads in fixed-size chunks; call from a blocking context.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer as lowercase hex
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Path of the temporary sibling used while atomically replacing `path`
fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}

/// Atomically replace `path` with `data`
///
/// Writes to a temporary sibling, flushes it to disk, then renames it over
/// the target. A crash at any point leaves either the old file or the new
/// one, never a partial write.
pub async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = temp_sibling(path);
    let write_result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if write_result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    write_result
}
