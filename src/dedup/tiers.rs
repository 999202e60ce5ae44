//! Resolution strategies tried in order by [`DedupCache::resolve`]

use super::{CacheKey, DedupCache, ResolvedMedia};
use crate::config::{FileCollisionAction, RetryConfig};
use crate::error::TransferError;
use crate::retry::with_retry;
use crate::source::{FetchedMedia, HashLookup, HashQuery, MediaFetcher};
use crate::types::{MediaDescriptor, MediaRef, ResolutionTier};
use crate::utils::{ReservedPath, hash_file, media_file_name, reserve_path};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result of one tier's attempt
#[derive(Debug)]
pub enum TierOutcome {
    /// The tier produced a local copy; resolution stops here
    Hit(ResolvedMedia),
    /// Try the next tier
    Miss,
}

/// One strategy in the dedup chain
///
/// A tier may fill in fields of the descriptor (the content hash, for
/// instance) for the benefit of later tiers.
#[async_trait]
pub trait ResolveTier: Send + Sync {
    /// Which tier this is
    fn tier(&self) -> ResolutionTier;

    /// Try to resolve the descriptor
    ///
    /// # Errors
    ///
    /// An error fails the item; a tier that merely cannot help returns
    /// [`TierOutcome::Miss`].
    async fn attempt(
        &self,
        descriptor: &mut MediaDescriptor,
        cache: &DedupCache,
    ) -> Result<TierOutcome, TransferError>;
}

/// Tier 1: ask the remote for the content hash and look it up locally
pub struct HashTier {
    query: Arc<dyn HashQuery>,
    timeout: Duration,
}

impl HashTier {
    /// Hash tier backed by the given remote capability
    pub fn new(query: Arc<dyn HashQuery>, timeout: Duration) -> Self {
        Self { query, timeout }
    }
}

#[async_trait]
impl ResolveTier for HashTier {
    fn tier(&self) -> ResolutionTier {
        ResolutionTier::Hash
    }

    async fn attempt(
        &self,
        descriptor: &mut MediaDescriptor,
        cache: &DedupCache,
    ) -> Result<TierOutcome, TransferError> {
        let hash = match descriptor.content_hash.clone() {
            Some(hash) => hash,
            None => {
                let lookup =
                    tokio::time::timeout(self.timeout, self.query.query_hash(&descriptor.remote_ref))
                        .await;
                match lookup {
                    Ok(HashLookup::Found(hash)) => hash.to_ascii_lowercase(),
                    Ok(HashLookup::Unavailable(reason)) => {
                        cache.hash_fallback(&descriptor.remote_ref, reason);
                        return Ok(TierOutcome::Miss);
                    }
                    Err(_) => {
                        cache.hash_fallback(
                            &descriptor.remote_ref,
                            format!("hash query timed out after {}ms", self.timeout.as_millis()),
                        );
                        return Ok(TierOutcome::Miss);
                    }
                }
            }
        };

        descriptor.content_hash = Some(hash.clone());
        match cache.lookup(&CacheKey::Hash(hash.clone())).await {
            Some((path, lease)) => Ok(TierOutcome::Hit(ResolvedMedia::new(
                path,
                ResolutionTier::Hash,
                0,
                Some(hash),
                lease,
            ))),
            None => Ok(TierOutcome::Miss),
        }
    }
}

/// Tier 2: look up the remote identifier
///
/// A hit also records the content hash learned by the hash tier, so later
/// copies of the same content resolve without a transfer.
#[derive(Debug, Default)]
pub struct IdTier;

#[async_trait]
impl ResolveTier for IdTier {
    fn tier(&self) -> ResolutionTier {
        ResolutionTier::Id
    }

    async fn attempt(
        &self,
        descriptor: &mut MediaDescriptor,
        cache: &DedupCache,
    ) -> Result<TierOutcome, TransferError> {
        let key = CacheKey::Id(descriptor.remote_ref.as_str().to_string());
        let alias = descriptor.content_hash.clone().map(CacheKey::Hash);
        match cache.lookup_aliased(&key, alias).await {
            Some((path, lease)) => Ok(TierOutcome::Hit(ResolvedMedia::new(
                path,
                ResolutionTier::Id,
                0,
                descriptor.content_hash.clone(),
                lease,
            ))),
            None => Ok(TierOutcome::Miss),
        }
    }
}

/// Tier 3: transfer the media and record it under both keys
pub struct DownloadTier {
    fetcher: Arc<dyn MediaFetcher>,
    media_dir: PathBuf,
    collision: FileCollisionAction,
    retry: RetryConfig,
}

impl DownloadTier {
    /// Download tier writing into `media_dir`
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        media_dir: PathBuf,
        collision: FileCollisionAction,
        retry: RetryConfig,
    ) -> Self {
        Self {
            fetcher,
            media_dir,
            collision,
            retry,
        }
    }

    async fn fetch_verified(
        &self,
        media_ref: &MediaRef,
        dest: &Path,
        expected: Option<&str>,
    ) -> Result<(FetchedMedia, String), TransferError> {
        let fetched = self.fetcher.fetch(media_ref, dest).await?;

        let actual = match &fetched.content_hash {
            Some(hash) => hash.to_ascii_lowercase(),
            None => {
                let path = dest.to_path_buf();
                tokio::task::spawn_blocking(move || hash_file(&path))
                    .await
                    .map_err(|e| TransferError::Panicked(e.to_string()))?
                    .map_err(|e| TransferError::io(dest, e))?
            }
        };

        if let Some(expected) = expected
            && !expected.eq_ignore_ascii_case(&actual)
        {
            tracing::warn!(
                media_ref = %media_ref,
                expected,
                actual = %actual,
                "Downloaded content does not match remote hash"
            );
            return Err(TransferError::HashMismatch {
                media_ref: media_ref.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        Ok((fetched, actual))
    }
}

#[async_trait]
impl ResolveTier for DownloadTier {
    fn tier(&self) -> ResolutionTier {
        ResolutionTier::Downloaded
    }

    async fn attempt(
        &self,
        descriptor: &mut MediaDescriptor,
        cache: &DedupCache,
    ) -> Result<TierOutcome, TransferError> {
        let media_ref = descriptor.remote_ref.clone();
        let _gates = cache
            .acquire_gates(&media_ref, descriptor.content_hash.as_deref())
            .await;

        // A sibling holding the gate may have finished this media while we waited
        if let Some(hash) = descriptor.content_hash.clone()
            && let Some((path, lease)) = cache.lookup(&CacheKey::Hash(hash.clone())).await
        {
            return Ok(TierOutcome::Hit(ResolvedMedia::new(
                path,
                ResolutionTier::Hash,
                0,
                Some(hash),
                lease,
            )));
        }
        let id_key = CacheKey::Id(media_ref.as_str().to_string());
        let alias = descriptor.content_hash.clone().map(CacheKey::Hash);
        if let Some((path, lease)) = cache.lookup_aliased(&id_key, alias).await {
            return Ok(TierOutcome::Hit(ResolvedMedia::new(
                path,
                ResolutionTier::Id,
                0,
                descriptor.content_hash.clone(),
                lease,
            )));
        }

        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(|e| TransferError::io(&self.media_dir, e))?;
        let target = self.media_dir.join(media_file_name(media_ref.as_str()));

        // Distinct refs can sanitize to the same name; the gate keeps two
        // overwriting transfers off one path
        let (_path_gate, collision) = match self.collision {
            FileCollisionAction::Overwrite => {
                let gate = cache.acquire_path_gate(&target).await;
                if cache.references_path(&target) {
                    tracing::debug!(
                        media_ref = %media_ref,
                        path = %target.display(),
                        "Target belongs to another cached entry, renaming instead"
                    );
                    (Some(gate), FileCollisionAction::Rename)
                } else {
                    (Some(gate), FileCollisionAction::Overwrite)
                }
            }
            other => (None, other),
        };

        let reserved = reserve_path(&target, collision).await?;
        let staged = StagedDownload::new(&self.media_dir, &reserved);

        let expected = descriptor.content_hash.clone();
        let (fetched, hash) = with_retry(&self.retry, || {
            self.fetch_verified(&media_ref, &staged.part, expected.as_deref())
        })
        .await?;

        tokio::fs::rename(&staged.part, &reserved.path)
            .await
            .map_err(|e| TransferError::io(&reserved.path, e))?;
        staged.commit();
        let dest = reserved.path;

        tracing::debug!(
            media_ref = %media_ref,
            path = %dest.display(),
            bytes = fetched.bytes,
            "Media downloaded"
        );

        descriptor.content_hash = Some(hash.clone());
        descriptor.local_path = Some(dest.clone());
        descriptor.byte_size = fetched.bytes;

        let lease = cache.insert_all(
            vec![CacheKey::Hash(hash.clone()), id_key],
            &dest,
            fetched.bytes,
        );
        Ok(TierOutcome::Hit(ResolvedMedia::new(
            dest,
            ResolutionTier::Downloaded,
            fetched.bytes,
            Some(hash),
            lease,
        )))
    }
}

/// Staging file for one transfer, removed unless committed
///
/// Also removes the reserved placeholder, so an error or a dropped future
/// leaves nothing behind in the media directory.
struct StagedDownload {
    part: PathBuf,
    placeholder: Option<PathBuf>,
    committed: bool,
}

impl StagedDownload {
    fn new(media_dir: &Path, reserved: &ReservedPath) -> Self {
        let name = reserved
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());
        Self {
            part: media_dir.join(format!(".{}.{:016x}.part", name, rand::random::<u64>())),
            placeholder: reserved.created.then(|| reserved.path.clone()),
            committed: false,
        }
    }

    /// The part file now lives at its final name
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StagedDownload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let _ = std::fs::remove_file(&self.part);
        if let Some(placeholder) = &self.placeholder {
            let _ = std::fs::remove_file(placeholder);
        }
    }
}
