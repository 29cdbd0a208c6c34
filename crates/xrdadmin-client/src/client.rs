//! Administrative client.
//!
//! `AdminClient` is the single entry point for applications. It owns the
//! session pool, the location resolver and the operation services, and has
//! an explicit lifecycle: construct, use, `shutdown`. There is no process
//! global state; two clients never share sessions or caches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;
use xrdadmin_transport::message::{ProtocolReply, QueryCode};
use xrdadmin_transport::{
    CallContext, CancelReason, CancelToken, Opcode, PoolStats, SessionPool, StaticCredentials,
    TcpTransport, Transport,
};

use crate::batch::BatchOperations;
use crate::checksum::ChecksumService;
use crate::config::AdminConfig;
use crate::dirlist::DirListing;
use crate::error::{AdminError, Result};
use crate::metadata::MetadataOperations;
use crate::resolver::{decode, Freshness, LocationResolver, ResolveIntent, ResolverConfig};
use crate::staging::StagingManager;
use crate::types::{
    BatchResult, ChecksumRecord, FileStatus, LocationInfo, LogicalPath, MkdirFlags, PermissionTriple,
    PhysicalLocation, PrepareFlags, PrepareReceipt, PrepareStatus, Priority, ProtocolInfo, VfsStatus,
};

/// Client for one storage cluster.
pub struct AdminClient {
    config: AdminConfig,
    resolver: Arc<LocationResolver>,
    metadata: MetadataOperations,
    batch: BatchOperations,
    staging: StagingManager,
    checksums: ChecksumService,
    shutdown: CancelToken,
}

impl AdminClient {
    /// Builds a client without contacting the cluster.
    pub fn new(config: AdminConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let entry_points = config.redirector_addrs()?;

        let mut pool = SessionPool::new(transport, config.pool_config());
        if let Some(credentials) = config.login_credentials() {
            pool = pool.with_credentials(Arc::new(StaticCredentials::new(credentials)));
        }
        let resolver = Arc::new(LocationResolver::new(
            Arc::new(pool),
            entry_points,
            ResolverConfig::from(&config),
        ));
        let metadata = MetadataOperations::new(resolver.clone(), config.dirlist_page_size);
        let batch = BatchOperations::new(resolver.clone(), metadata.clone(), config.batch_concurrency);
        let staging = StagingManager::new(resolver.clone());
        let checksums = ChecksumService::new(resolver.clone());

        info!(
            redirectors = ?config.redirectors,
            concurrency = config.batch_concurrency,
            "admin client started"
        );
        Ok(Self {
            config,
            resolver,
            metadata,
            batch,
            staging,
            checksums,
            shutdown: CancelToken::new(),
        })
    }

    /// Builds a client and checks that an entry redirector answers.
    pub async fn connect(config: AdminConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let client = Self::new(config, transport)?;
        let rtt = client.ping().await?;
        info!(rtt_us = rtt.as_micros() as u64, "connected");
        Ok(client)
    }

    /// Builds a client over TCP and checks that an entry redirector answers.
    pub async fn connect_tcp(config: AdminConfig) -> Result<Self> {
        let transport = Arc::new(TcpTransport::with_config(config.tcp_config()));
        Self::connect(config, transport).await
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    /// Resolver shared by every service.
    pub fn resolver(&self) -> &Arc<LocationResolver> {
        &self.resolver
    }

    /// Single-path operations, for callers managing their own contexts.
    pub fn metadata(&self) -> &MetadataOperations {
        &self.metadata
    }

    /// Batch operations.
    pub fn batch(&self) -> &BatchOperations {
        &self.batch
    }

    /// Staging submission and status.
    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// Checksum retrieval.
    pub fn checksums(&self) -> &ChecksumService {
        &self.checksums
    }

    /// Session pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.resolver.pool().stats()
    }

    /// Context for one operation: no deadline beyond the per-attempt
    /// timeout, cancelled when the client shuts down.
    pub fn context(&self) -> CallContext {
        CallContext::new().with_cancel(self.shutdown.child())
    }

    /// Context for one operation that must finish within `timeout`.
    pub fn context_with_timeout(&self, timeout: Duration) -> CallContext {
        CallContext::with_timeout(timeout).with_cancel(self.shutdown.child())
    }

    fn path(path: impl AsRef<str>) -> Result<LogicalPath> {
        LogicalPath::new(path)
    }

    // ------------------------------------------------------------------
    // Location
    // ------------------------------------------------------------------

    /// Data server currently responsible for `path`. Always walks the
    /// redirector chain.
    pub async fn locate(&self, path: impl AsRef<str>) -> Result<PhysicalLocation> {
        let path = Self::path(path)?;
        self.resolver
            .resolve(&path, ResolveIntent::Lookup, Freshness::Fresh, &self.context())
            .await
    }

    /// Every data server reporting `path`.
    pub async fn locate_all(&self, path: impl AsRef<str>) -> Result<Vec<LocationInfo>> {
        let path = Self::path(path)?;
        self.resolver.locate_all(&path, &self.context()).await
    }

    // ------------------------------------------------------------------
    // Single-path metadata
    // ------------------------------------------------------------------

    /// Status of `path`.
    pub async fn stat(&self, path: impl AsRef<str>) -> Result<FileStatus> {
        let path = Self::path(path)?;
        self.metadata.stat(&path, &self.context()).await
    }

    /// Sets the permission bits of `path`.
    pub async fn chmod(&self, path: impl AsRef<str>, perms: PermissionTriple) -> Result<()> {
        let path = Self::path(path)?;
        self.metadata.chmod(&path, perms, &self.context()).await
    }

    /// Creates one directory; the parent must exist.
    pub async fn mkdir(&self, path: impl AsRef<str>, perms: PermissionTriple) -> Result<()> {
        self.mkdir_with(path, perms, MkdirFlags::default()).await
    }

    /// Creates a directory with explicit options.
    pub async fn mkdir_with(
        &self,
        path: impl AsRef<str>,
        perms: PermissionTriple,
        flags: MkdirFlags,
    ) -> Result<()> {
        let path = Self::path(path)?;
        self.metadata.mkdir(&path, perms, flags, &self.context()).await
    }

    /// Removes a file.
    pub async fn rm(&self, path: impl AsRef<str>) -> Result<()> {
        let path = Self::path(path)?;
        self.metadata.rm(&path, &self.context()).await
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: impl AsRef<str>) -> Result<()> {
        let path = Self::path(path)?;
        self.metadata.rmdir(&path, &self.context()).await
    }

    /// Renames `source` to `destination`; the destination must not exist.
    pub async fn mv(&self, source: impl AsRef<str>, destination: impl AsRef<str>) -> Result<()> {
        let source = Self::path(source)?;
        let destination = Self::path(destination)?;
        self.metadata.mv(&source, &destination, &self.context()).await
    }

    /// Sets the size of a file.
    pub async fn truncate(&self, path: impl AsRef<str>, size: u64) -> Result<()> {
        let path = Self::path(path)?;
        self.metadata.truncate(&path, size, &self.context()).await
    }

    /// Lazy listing of a directory's entry names.
    pub async fn dirlist(&self, path: impl AsRef<str>) -> Result<DirListing> {
        let path = Self::path(path)?;
        self.metadata.dirlist(&path, &self.context()).await
    }

    /// Lazy listing whose entries carry their status.
    pub async fn dirlist_with_stat(&self, path: impl AsRef<str>) -> Result<DirListing> {
        let path = Self::path(path)?;
        self.metadata.dirlist_with_stat(&path, &self.context()).await
    }

    /// Free space the cluster offers for `path`.
    pub async fn stat_vfs(&self, path: impl AsRef<str>) -> Result<VfsStatus> {
        let path = Self::path(path)?;
        self.metadata.stat_vfs(&path, &self.context()).await
    }

    /// Raw answer to a server query. For file queries `arg` is a logical
    /// path.
    pub async fn query(&self, code: QueryCode, arg: &str) -> Result<String> {
        self.metadata.query(code, arg, &self.context()).await
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Whether each path is an existing file.
    pub async fn existfiles<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<bool>> {
        self.existfiles_with(paths, &self.context()).await
    }

    /// `existfiles` under a caller-supplied context.
    pub async fn existfiles_with<S: AsRef<str>>(
        &self,
        paths: &[S],
        ctx: &CallContext,
    ) -> Result<BatchResult<bool>> {
        let (valid, parsed) = parse_batch(paths);
        let result = self.batch.existfiles(&valid, ctx).await?;
        Ok(merge_batch(parsed, result))
    }

    /// Whether each path is an existing directory.
    pub async fn existdirs<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<bool>> {
        self.existdirs_with(paths, &self.context()).await
    }

    /// `existdirs` under a caller-supplied context.
    pub async fn existdirs_with<S: AsRef<str>>(
        &self,
        paths: &[S],
        ctx: &CallContext,
    ) -> Result<BatchResult<bool>> {
        let (valid, parsed) = parse_batch(paths);
        let result = self.batch.existdirs(&valid, ctx).await?;
        Ok(merge_batch(parsed, result))
    }

    /// Whether each path is a file that is online.
    pub async fn isfileonline<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<bool>> {
        self.isfileonline_with(paths, &self.context()).await
    }

    /// `isfileonline` under a caller-supplied context.
    pub async fn isfileonline_with<S: AsRef<str>>(
        &self,
        paths: &[S],
        ctx: &CallContext,
    ) -> Result<BatchResult<bool>> {
        let (valid, parsed) = parse_batch(paths);
        let result = self.batch.isfileonline(&valid, ctx).await?;
        Ok(merge_batch(parsed, result))
    }

    /// Status of each path.
    pub async fn stat_many<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<FileStatus>> {
        self.stat_many_with(paths, &self.context()).await
    }

    /// `stat_many` under a caller-supplied context.
    pub async fn stat_many_with<S: AsRef<str>>(
        &self,
        paths: &[S],
        ctx: &CallContext,
    ) -> Result<BatchResult<FileStatus>> {
        let (valid, parsed) = parse_batch(paths);
        let result = self.batch.stat_many(&valid, ctx).await?;
        Ok(merge_batch(parsed, result))
    }

    // ------------------------------------------------------------------
    // Staging and checksums
    // ------------------------------------------------------------------

    /// Queues `paths` for staging. Every path must be well formed.
    pub async fn prepare<S: AsRef<str>>(
        &self,
        paths: &[S],
        flags: PrepareFlags,
        priority: Priority,
    ) -> Result<PrepareReceipt> {
        let paths = paths
            .iter()
            .map(Self::path)
            .collect::<Result<Vec<_>>>()?;
        self.staging.prepare(&paths, flags, priority, &self.context()).await
    }

    /// Progress of an accepted staging request.
    pub async fn prepare_status(&self, receipt: &PrepareReceipt) -> Result<PrepareStatus> {
        self.staging.prepare_status(receipt, &self.context()).await
    }

    /// Checksum digest of a file.
    pub async fn getchecksum(&self, path: impl AsRef<str>) -> Result<String> {
        let path = Self::path(path)?;
        self.checksums.getchecksum(&path, &self.context()).await
    }

    /// Checksum algorithm and digest of a file.
    pub async fn checksum_record(&self, path: impl AsRef<str>) -> Result<ChecksumRecord> {
        let path = Self::path(path)?;
        self.checksums.checksum_record(&path, &self.context()).await
    }

    // ------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------

    /// Protocol version and role of the answering entry redirector.
    pub async fn protocol(&self) -> Result<ProtocolInfo> {
        let (_, body) = self
            .resolver
            .call_entry("protocol", Opcode::Protocol, Vec::new(), &self.context())
            .await?;
        let reply: ProtocolReply = decode(&body)?;
        Ok(ProtocolInfo {
            version: reply.version,
            role: reply.role.into(),
        })
    }

    /// Round trip to an entry redirector.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.resolver
            .call_entry("ping", Opcode::Ping, Vec::new(), &self.context())
            .await?;
        Ok(started.elapsed())
    }

    /// Cancels in-flight operations and closes every session. Later calls
    /// fail.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel(CancelReason::Shutdown);
        self.resolver.cache().clear();
        self.resolver.pool().shutdown();
        info!("admin client shut down");
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for AdminClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AdminClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminClient")
            .field("redirectors", &self.config.redirectors)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Splits raw batch input into well-formed paths and a per-position record
/// of which inputs were rejected.
fn parse_batch<S: AsRef<str>>(paths: &[S]) -> (Vec<LogicalPath>, Vec<Option<AdminError>>) {
    let mut valid = Vec::with_capacity(paths.len());
    let mut parsed = Vec::with_capacity(paths.len());
    for raw in paths {
        match LogicalPath::new(raw) {
            Ok(path) => {
                valid.push(path);
                parsed.push(None);
            }
            Err(e) => parsed.push(Some(e)),
        }
    }
    (valid, parsed)
}

/// Reassembles a full-length result from the outcomes of the well-formed
/// paths and the rejections recorded by `parse_batch`.
fn merge_batch<T>(parsed: Vec<Option<AdminError>>, result: BatchResult<T>) -> BatchResult<T> {
    let mut outcomes = result.into_iter();
    let items = parsed
        .into_iter()
        .map(|rejected| match rejected {
            Some(e) => Err(e),
            None => outcomes.next().unwrap_or_else(|| {
                Err(AdminError::Protocol("batch result shorter than input".to_string()))
            }),
        })
        .collect();
    BatchResult::from_items(items)
}
