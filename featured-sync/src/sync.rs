use std::fmt;

use deviant_core::{ApiError, Gallery, find_folder, recency_cutoff};
use thiserror::Error;
use time::OffsetDateTime;

/// Upper bound on `deviationids[]` per copy/remove call.
pub const MAX_DEVIATIONIDS_PER_MUTATION: usize = 24;
pub const DEFAULT_TOP_N: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    FolderLookup,
    Clear,
    Scan,
    Repopulate,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncPhase::FolderLookup => "folder lookup",
            SyncPhase::Clear => "clear",
            SyncPhase::Scan => "scan",
            SyncPhase::Repopulate => "repopulate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{phase} failed: {source}")]
    Api {
        phase: SyncPhase,
        #[source]
        source: ApiError,
    },
    #[error("{phase} rejected a batch of {size} deviations")]
    Rejected { phase: SyncPhase, size: usize },
}

impl SyncError {
    pub fn phase(&self) -> SyncPhase {
        match self {
            SyncError::Api { phase, .. } | SyncError::Rejected { phase, .. } => *phase,
        }
    }
}

trait PhaseExt<T> {
    fn during(self, phase: SyncPhase) -> Result<T, SyncError>;
}

impl<T> PhaseExt<T> for Result<T, ApiError> {
    fn during(self, phase: SyncPhase) -> Result<T, SyncError> {
        self.map_err(|source| SyncError::Api { phase, source })
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub target_folder: String,
    pub top_n: usize,
    pub per_folder_cap: Option<usize>,
    /// Compute and report the ranking without touching the gallery.
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            target_folder: "Featured".to_string(),
            top_n: DEFAULT_TOP_N,
            per_folder_cap: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub target_folderid: String,
    /// Deviations taken out of the target folder.
    pub removed: usize,
    /// Unique deviations that passed the recency cutoff.
    pub scanned: usize,
    pub ranked: Vec<(String, u64)>,
    /// Deviations copied into the target folder, in ranking order.
    pub copied: Vec<String>,
    pub dry_run: bool,
}

#[derive(Clone, Copy)]
enum Mutation {
    Remove,
    Copy,
}

impl Mutation {
    fn phase(self) -> SyncPhase {
        match self {
            Mutation::Remove => SyncPhase::Clear,
            Mutation::Copy => SyncPhase::Repopulate,
        }
    }
}

/// Rebuilds one gallery folder from the most-favourited recent deviations.
pub struct FeaturedSync {
    gallery: Gallery,
    options: SyncOptions,
}

impl FeaturedSync {
    pub fn new(gallery: Gallery, options: SyncOptions) -> Self {
        Self { gallery, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let cutoff = recency_cutoff(OffsetDateTime::now_utc().date());
        self.run_with_cutoff(cutoff).await
    }

    /// The target folder is emptied before the scan, and nothing is restored
    /// if a later step fails.
    pub async fn run_with_cutoff(&self, cutoff: OffsetDateTime) -> Result<SyncReport, SyncError> {
        let options = &self.options;
        let mut report = SyncReport {
            dry_run: options.dry_run,
            ..SyncReport::default()
        };

        tracing::info!(folder = %options.target_folder, "looking up target folder");
        let folders = self
            .gallery
            .list_folders()
            .await
            .during(SyncPhase::FolderLookup)?;
        let target = find_folder(&options.target_folder, &folders).during(SyncPhase::FolderLookup)?;
        tracing::info!(folderid = %target, folders = folders.len(), "target folder found");
        report.target_folderid = target.clone();

        let current = self
            .gallery
            .folder_deviation_ids(&target)
            .await
            .during(SyncPhase::Clear)?;
        tracing::info!(count = current.len(), "target folder snapshot taken");
        if options.dry_run {
            tracing::info!(count = current.len(), "dry run: leaving target folder as is");
        } else if !current.is_empty() {
            self.apply(Mutation::Remove, &target, &current).await?;
            report.removed = current.len();
            tracing::info!(removed = report.removed, "target folder cleared");
        }

        let folderids: Vec<String> = folders
            .into_iter()
            .map(|folder| folder.folderid)
            .filter(|folderid| !folderid.is_empty())
            .collect();
        let favourites = self
            .gallery
            .aggregate_favourites(&folderids, cutoff, options.per_folder_cap)
            .await
            .during(SyncPhase::Scan)?;
        report.scanned = favourites.len();
        report.ranked = favourites.ranked(options.top_n);
        tracing::info!(
            scanned = report.scanned,
            selected = report.ranked.len(),
            top = report.ranked.first().map(|(_, count)| *count),
            "ranking computed"
        );

        if report.ranked.is_empty() {
            tracing::info!("no deviations qualify; nothing to copy");
            return Ok(report);
        }

        let top_ids: Vec<String> = report.ranked.iter().map(|(id, _)| id.clone()).collect();
        if options.dry_run {
            for (rank, (id, count)) in report.ranked.iter().enumerate() {
                tracing::info!(rank = rank + 1, deviationid = %id, favourites = count, "dry run: would copy");
            }
            return Ok(report);
        }

        if let Err(err) = self.apply(Mutation::Copy, &target, &top_ids).await {
            tracing::error!(
                folderid = %target,
                error = %err,
                "repopulate failed after clearing; target folder is partially filled"
            );
            return Err(err);
        }
        report.copied = top_ids;
        tracing::info!(copied = report.copied.len(), "target folder repopulated");
        Ok(report)
    }

    async fn apply(
        &self,
        mutation: Mutation,
        folderid: &str,
        deviationids: &[String],
    ) -> Result<(), SyncError> {
        let phase = mutation.phase();
        let client = self.gallery.client();
        for (index, batch) in chunked(deviationids, MAX_DEVIATIONIDS_PER_MUTATION).enumerate() {
            let result = match mutation {
                Mutation::Remove => client.remove_deviations(folderid, batch).await,
                Mutation::Copy => client.copy_deviations(folderid, batch).await,
            }
            .during(phase)?;
            if !result.success {
                return Err(SyncError::Rejected {
                    phase,
                    size: batch.len(),
                });
            }
            tracing::debug!(%phase, batch = index + 1, size = batch.len(), "batch applied");
        }
        Ok(())
    }
}

/// Consecutive slices of at most `size` items; order is preserved.
pub fn chunked<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
