//! Array-oriented existence and status checks.
//!
//! Every input path gets exactly one outcome, at its input position. Items
//! run concurrently up to the configured limit and fail independently; the
//! call itself fails only when no entry redirector can be reached at all.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};
use xrdadmin_transport::{CallContext, CancelReason, Opcode};

use crate::error::{AdminError, ErrorKind, Result};
use crate::metadata::MetadataOperations;
use crate::resolver::LocationResolver;
use crate::types::{BatchResult, FileStatus, LogicalPath};

/// existfiles, existdirs, isfileonline and stat_many.
#[derive(Debug, Clone)]
pub struct BatchOperations {
    resolver: Arc<LocationResolver>,
    metadata: MetadataOperations,
    concurrency: usize,
}

impl BatchOperations {
    /// Creates the service running at most `concurrency` items at once.
    pub fn new(resolver: Arc<LocationResolver>, metadata: MetadataOperations, concurrency: usize) -> Self {
        Self {
            resolver,
            metadata,
            concurrency: concurrency.max(1),
        }
    }

    /// Whether each path is an existing regular file.
    pub async fn existfiles(&self, paths: &[LogicalPath], ctx: &CallContext) -> Result<BatchResult<bool>> {
        self.check(paths, ctx, FileStatus::is_file).await
    }

    /// Whether each path is an existing directory.
    pub async fn existdirs(&self, paths: &[LogicalPath], ctx: &CallContext) -> Result<BatchResult<bool>> {
        self.check(paths, ctx, FileStatus::is_dir).await
    }

    /// Whether each path is resident and usable without staging. Missing
    /// paths report `false`.
    pub async fn isfileonline(&self, paths: &[LogicalPath], ctx: &CallContext) -> Result<BatchResult<bool>> {
        self.check(paths, ctx, FileStatus::is_online).await
    }

    async fn check(
        &self,
        paths: &[LogicalPath],
        ctx: &CallContext,
        predicate: fn(&FileStatus) -> bool,
    ) -> Result<BatchResult<bool>> {
        let stats = self.stat_many(paths, ctx).await?;
        let items = stats
            .into_iter()
            .map(|outcome| match outcome {
                Ok(status) => Ok(predicate(&status)),
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(false),
                Err(e) => Err(e),
            })
            .collect();
        Ok(BatchResult::from_items(items))
    }

    /// Stat of every path, with an explicit error per failed item.
    ///
    /// Cancelling `ctx` or reaching its deadline stops the batch: items that
    /// completed keep their outcome, the rest report `Cancelled`.
    pub async fn stat_many(&self, paths: &[LogicalPath], ctx: &CallContext) -> Result<BatchResult<FileStatus>> {
        if paths.is_empty() {
            return Ok(BatchResult::from_items(Vec::new()));
        }
        self.check_entry(ctx).await?;

        let batch_ctx = ctx.child();
        if let Some(remaining) = ctx.deadline.remaining() {
            batch_ctx.cancel.cancel_after(remaining);
        }
        debug!(items = paths.len(), concurrency = self.concurrency, "batch started");

        let mut slots: Vec<Option<Result<FileStatus>>> = (0..paths.len()).map(|_| None).collect();
        let mut outcomes = stream::iter(paths.iter().enumerate())
            .map(|(index, path)| {
                let item_ctx = batch_ctx.child();
                async move {
                    let outcome = tokio::select! {
                        biased;
                        reason = item_ctx.cancel.cancelled() => Err(AdminError::Cancelled { reason }),
                        outcome = self.metadata.stat(path, &item_ctx) => outcome,
                    };
                    (index, Self::settle(outcome, &item_ctx))
                }
            })
            .buffer_unordered(self.concurrency);

        while let Some((index, outcome)) = outcomes.next().await {
            if let Err(e) = &outcome {
                if e.kind() == ErrorKind::NotFound {
                    debug!(path = %paths[index], "batch item not found");
                } else {
                    warn!(path = %paths[index], error = %e, "batch item failed");
                }
            }
            slots[index] = Some(outcome);
        }
        drop(outcomes);
        // Stops the deadline timer task.
        batch_ctx.cancel.cancel(CancelReason::UserRequested);

        let items = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or(Err(AdminError::Cancelled {
                    reason: CancelReason::UserRequested,
                }))
            })
            .collect();
        Ok(BatchResult::from_items(items))
    }

    /// A timeout or cancellation caused by the batch context becomes
    /// `Cancelled` with the context's reason.
    fn settle<T>(outcome: Result<T>, item_ctx: &CallContext) -> Result<T> {
        match outcome {
            Err(e) if matches!(e.kind(), ErrorKind::Timeout | ErrorKind::Cancelled) => {
                if let Some(reason) = item_ctx.cancel.reason() {
                    Err(AdminError::Cancelled { reason })
                } else if item_ctx.deadline.is_expired() {
                    Err(AdminError::Cancelled {
                        reason: CancelReason::DeadlineExceeded,
                    })
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    /// Fails when no entry redirector answers a ping.
    async fn check_entry(&self, ctx: &CallContext) -> Result<()> {
        self.resolver
            .call_entry("batch", Opcode::Ping, Vec::new(), ctx)
            .await
            .map(|_| ())
    }
}
