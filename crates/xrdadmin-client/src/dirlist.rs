//! Lazy directory listing.
//!
//! Entries are fetched page by page as the caller consumes them. A listing
//! is finite and cannot be restarted: once it has yielded its last entry or
//! an error, it only yields `None`. A listing opened with details carries
//! the status of every entry, fetched in the same page.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use xrdadmin_transport::message::{DirlistReply, DirlistRequest};
use xrdadmin_transport::{CallContext, Opcode};

use crate::error::{AdminError, Result};
use crate::resolver::{decode, encode, Freshness, LocationResolver, ResolveIntent};
use crate::types::{DirEntry, FileStatus, LogicalPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    More,
    Exhausted,
    Failed,
}

/// Child entry names of one directory.
pub struct DirListing {
    resolver: Arc<LocationResolver>,
    path: LogicalPath,
    ctx: CallContext,
    page_size: u32,
    with_stat: bool,
    buffer: VecDeque<DirEntry>,
    cursor: Option<String>,
    state: State,
}

impl DirListing {
    /// Opens a listing and fetches its first page, so a missing path or a
    /// non-directory fails here rather than on first use.
    pub(crate) async fn open(
        resolver: Arc<LocationResolver>,
        path: LogicalPath,
        page_size: u32,
        with_stat: bool,
        ctx: CallContext,
    ) -> Result<Self> {
        let mut listing = Self {
            resolver,
            path,
            ctx,
            page_size,
            with_stat,
            buffer: VecDeque::new(),
            cursor: None,
            state: State::More,
        };
        listing.fetch_page().await?;
        Ok(listing)
    }

    /// Directory being listed.
    pub fn path(&self) -> &LogicalPath {
        &self.path
    }

    /// Whether entries carry their status.
    pub fn with_stat(&self) -> bool {
        self.with_stat
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let cursor = self.cursor.clone();
        let limit = self.page_size;
        let with_stat = self.with_stat;
        let body = self
            .resolver
            .dispatch(
                &self.path,
                ResolveIntent::Lookup,
                Freshness::Cached,
                Opcode::Dirlist,
                &self.ctx,
                |location| {
                    encode(&DirlistRequest {
                        path: location.internal_path.clone(),
                        cursor: cursor.clone(),
                        limit,
                        with_stat,
                    })
                },
            )
            .await;
        let page = match body.and_then(|b| decode(&b)).and_then(|page| self.check_page(page)) {
            Ok(page) => page,
            Err(e) => {
                self.state = State::Failed;
                return Err(e);
            }
        };
        tracing::debug!(path = %self.path, entries = page.entries.len(), more = page.next_cursor.is_some(), "dirlist page");
        let mut stats = page.stats.into_iter().map(FileStatus::from);
        self.buffer.extend(page.entries.into_iter().map(|name| DirEntry {
            name,
            status: stats.next(),
        }));
        self.cursor = page.next_cursor;
        if self.cursor.is_none() {
            self.state = State::Exhausted;
        }
        Ok(())
    }

    fn check_page(&self, page: DirlistReply) -> Result<DirlistReply> {
        let expected = if self.with_stat { page.entries.len() } else { 0 };
        if page.stats.len() != expected {
            return Err(AdminError::Protocol(format!(
                "{}: dirlist page has {} entries and {} status records",
                self.path,
                page.entries.len(),
                page.stats.len()
            )));
        }
        Ok(page)
    }

    /// Next entry name, fetching another page when the buffer runs dry.
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.next_entry().await.map(|entry| entry.map(|e| e.name))
    }

    /// Next entry with its status when the listing carries details.
    pub async fn next_entry(&mut self) -> Option<Result<DirEntry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            if self.state != State::More {
                return None;
            }
            if let Err(e) = self.fetch_page().await {
                return Some(Err(e));
            }
        }
    }

    /// Drains the listing into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        while let Some(entry) = self.next().await {
            names.push(entry?);
        }
        Ok(names)
    }

    /// Drains the listing into a vector of entries.
    pub async fn collect_entries(mut self) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Turns the listing into a stream of entry names.
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> {
        stream::unfold(self, |mut listing| async move {
            listing.next().await.map(|entry| (entry, listing))
        })
    }
}

impl std::fmt::Debug for DirListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirListing")
            .field("path", &self.path)
            .field("with_stat", &self.with_stat)
            .field("buffered", &self.buffer.len())
            .field("state", &self.state)
            .finish()
    }
}
