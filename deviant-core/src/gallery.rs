use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;

use futures_util::stream::{self, Stream, TryStreamExt};
use time::{Date, OffsetDateTime};

use crate::client::{ApiError, DeviantClient, Deviation, Folder, Page};

pub const FOLDER_PAGE_SIZE: u32 = 50;
pub const CONTENTS_PAGE_SIZE: u32 = 24;

/// Lazily walks an offset-paginated listing, starting at offset 0.
///
/// Stops after a page with `has_more == false` or without `next_offset`.
pub fn pages<T, F, Fut>(fetch: F) -> impl Stream<Item = Result<Page<T>, ApiError>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, ApiError>>,
{
    stream::try_unfold((fetch, Some(0u32)), |(mut fetch, offset)| async move {
        let Some(offset) = offset else {
            return Ok(None);
        };
        let page = fetch(offset).await?;
        let next = page.next_page_offset();
        Ok(Some((page, (fetch, next))))
    })
}

/// Read side of the gallery: folder listings, folder contents and the
/// favourites tally used for ranking.
#[derive(Clone)]
pub struct Gallery {
    client: DeviantClient,
}

impl Gallery {
    pub fn new(client: DeviantClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &DeviantClient {
        &self.client
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>, ApiError> {
        let client = &self.client;
        let mut folders = Vec::new();
        let mut listing = pin!(pages(move |offset| {
            client.list_folders_page(offset, FOLDER_PAGE_SIZE)
        }));
        while let Some(page) = listing.try_next().await? {
            folders.extend(page.results);
        }
        tracing::debug!(count = folders.len(), "listed gallery folders");
        Ok(folders)
    }

    pub fn folder_pages<'a>(
        &'a self,
        folderid: &'a str,
    ) -> impl Stream<Item = Result<Page<Deviation>, ApiError>> + 'a {
        pages(move |offset| {
            self.client
                .folder_contents_page(folderid, offset, CONTENTS_PAGE_SIZE)
        })
    }

    pub fn folder_contents<'a>(
        &'a self,
        folderid: &'a str,
    ) -> impl Stream<Item = Result<Deviation, ApiError>> + 'a {
        self.folder_pages(folderid)
            .map_ok(|page| stream::iter(page.results.into_iter().map(Ok::<_, ApiError>)))
            .try_flatten()
    }

    pub async fn folder_deviation_ids(&self, folderid: &str) -> Result<Vec<String>, ApiError> {
        let ids: Vec<String> = self
            .folder_contents(folderid)
            .try_filter_map(|deviation| async move { Ok(deviation.deviationid) })
            .try_collect()
            .await?;
        Ok(ids)
    }

    /// Highest favourites count per deviation across `folderids`, limited to
    /// items published at or after `cutoff`.
    ///
    /// Items without an id or a publish time are skipped. `per_folder_cap`
    /// bounds how many items are fetched from each folder, skipped ones
    /// included; the page that crosses the cap is still tallied.
    pub async fn aggregate_favourites(
        &self,
        folderids: &[String],
        cutoff: OffsetDateTime,
        per_folder_cap: Option<usize>,
    ) -> Result<Favourites, ApiError> {
        let cutoff = cutoff.unix_timestamp();
        let mut favourites = Favourites::default();

        for (index, folderid) in folderids.iter().enumerate() {
            let mut fetched = 0usize;
            let mut folder = pin!(self.folder_pages(folderid));
            while let Some(page) = folder.try_next().await? {
                fetched += page.results.len();
                for deviation in &page.results {
                    let (Some(id), Some(published)) =
                        (deviation.deviationid.as_deref(), deviation.published_time)
                    else {
                        continue;
                    };
                    if published < cutoff {
                        continue;
                    }
                    favourites.record(id, deviation.favourites());
                }
                if per_folder_cap.is_some_and(|cap| fetched >= cap) {
                    tracing::debug!(folderid = %folderid, fetched, "per-folder cap reached");
                    break;
                }
            }
            tracing::debug!(
                folder = index + 1,
                folders = folderids.len(),
                fetched,
                "scanned folder"
            );
        }

        Ok(favourites)
    }
}

/// Case-insensitive exact match on the folder name. A top-level folder wins
/// over a nested one with the same name; entries without an id never match.
pub fn find_folder(name: &str, folders: &[Folder]) -> Result<String, ApiError> {
    let wanted = name.trim().to_lowercase();
    let mut matches = folders
        .iter()
        .filter(|folder| !folder.folderid.is_empty())
        .filter(|folder| folder.name.trim().to_lowercase() == wanted);
    let first = matches.next();
    first
        .filter(|folder| folder.parent.is_none())
        .or_else(|| matches.find(|folder| folder.parent.is_none()))
        .or(first)
        .map(|folder| folder.folderid.clone())
        .ok_or_else(|| ApiError::FolderNotFound(name.to_string()))
}

/// Midnight (UTC) of the same calendar day one year before `today`.
/// February 29 falls back to February 28.
pub fn recency_cutoff(today: Date) -> OffsetDateTime {
    let year = today.year() - 1;
    let date = Date::from_calendar_date(year, today.month(), today.day())
        .or_else(|_| Date::from_calendar_date(year, today.month(), today.day() - 1))
        .unwrap_or(today);
    date.midnight().assume_utc()
}

/// Favourites per deviation id, remembering the order ids were first seen.
#[derive(Debug, Clone, Default)]
pub struct Favourites {
    order: Vec<String>,
    counts: HashMap<String, u64>,
}

impl Favourites {
    pub fn record(&mut self, deviationid: &str, favourites: u64) {
        match self.counts.get_mut(deviationid) {
            Some(current) => *current = (*current).max(favourites),
            None => {
                self.order.push(deviationid.to_string());
                self.counts.insert(deviationid.to_string(), favourites);
            }
        }
    }

    pub fn get(&self, deviationid: &str) -> Option<u64> {
        self.counts.get(deviationid).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Top `n` by favourites, descending. Equal counts keep first-seen order.
    pub fn ranked(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .order
            .iter()
            .filter_map(|id| self.counts.get(id).map(|count| (id.clone(), *count)))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }
}
