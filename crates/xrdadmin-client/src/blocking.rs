//! Blocking facade over `AdminClient`.
//!
//! Each call runs to completion on a runtime owned by the client. Must not
//! be used from inside an async context.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use xrdadmin_transport::message::QueryCode;
use xrdadmin_transport::{CallContext, PoolStats, Transport};

use crate::client::AdminClient;
use crate::config::AdminConfig;
use crate::dirlist::DirListing;
use crate::error::{AdminError, Result};
use crate::types::{
    BatchResult, ChecksumRecord, FileStatus, LocationInfo, MkdirFlags, PermissionTriple,
    PhysicalLocation, PrepareFlags, PrepareReceipt, PrepareStatus, Priority, ProtocolInfo, VfsStatus,
};

/// Synchronous administrative client.
pub struct BlockingAdminClient {
    // Dropped before the runtime.
    inner: AdminClient,
    runtime: Arc<Runtime>,
}

fn build_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name("xrdadmin-io")
        .build()
        .map_err(|e| AdminError::Protocol(format!("cannot start runtime: {}", e)))
}

impl BlockingAdminClient {
    /// Builds a client and checks that an entry redirector answers.
    pub fn connect(config: AdminConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let runtime = Arc::new(build_runtime()?);
        let inner = runtime.block_on(AdminClient::connect(config, transport))?;
        Ok(Self { inner, runtime })
    }

    /// Builds a TCP client and checks that an entry redirector answers.
    pub fn connect_tcp(config: AdminConfig) -> Result<Self> {
        let runtime = Arc::new(build_runtime()?);
        let inner = runtime.block_on(AdminClient::connect_tcp(config))?;
        Ok(Self { inner, runtime })
    }

    /// The async client underneath.
    pub fn inner(&self) -> &AdminClient {
        &self.inner
    }

    /// Session pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Blocking `locate`.
    pub fn locate(&self, path: impl AsRef<str>) -> Result<PhysicalLocation> {
        self.runtime.block_on(self.inner.locate(path))
    }

    /// Blocking `locate_all`.
    pub fn locate_all(&self, path: impl AsRef<str>) -> Result<Vec<LocationInfo>> {
        self.runtime.block_on(self.inner.locate_all(path))
    }

    /// Blocking `stat`.
    pub fn stat(&self, path: impl AsRef<str>) -> Result<FileStatus> {
        self.runtime.block_on(self.inner.stat(path))
    }

    /// Blocking `chmod`.
    pub fn chmod(&self, path: impl AsRef<str>, perms: PermissionTriple) -> Result<()> {
        self.runtime.block_on(self.inner.chmod(path, perms))
    }

    /// Blocking `mkdir`.
    pub fn mkdir(&self, path: impl AsRef<str>, perms: PermissionTriple) -> Result<()> {
        self.runtime.block_on(self.inner.mkdir(path, perms))
    }

    /// Blocking `mkdir_with`.
    pub fn mkdir_with(&self, path: impl AsRef<str>, perms: PermissionTriple, flags: MkdirFlags) -> Result<()> {
        self.runtime.block_on(self.inner.mkdir_with(path, perms, flags))
    }

    /// Blocking `rm`.
    pub fn rm(&self, path: impl AsRef<str>) -> Result<()> {
        self.runtime.block_on(self.inner.rm(path))
    }

    /// Blocking `rmdir`.
    pub fn rmdir(&self, path: impl AsRef<str>) -> Result<()> {
        self.runtime.block_on(self.inner.rmdir(path))
    }

    /// Blocking `mv`.
    pub fn mv(&self, source: impl AsRef<str>, destination: impl AsRef<str>) -> Result<()> {
        self.runtime.block_on(self.inner.mv(source, destination))
    }

    /// Blocking `truncate`.
    pub fn truncate(&self, path: impl AsRef<str>, size: u64) -> Result<()> {
        self.runtime.block_on(self.inner.truncate(path, size))
    }

    /// Directory listing consumed as a blocking iterator.
    pub fn dirlist(&self, path: impl AsRef<str>) -> Result<BlockingDirListing> {
        let listing = self.runtime.block_on(self.inner.dirlist(path))?;
        Ok(BlockingDirListing {
            listing,
            runtime: self.runtime.clone(),
        })
    }

    /// Blocking `stat_vfs`.
    pub fn stat_vfs(&self, path: impl AsRef<str>) -> Result<VfsStatus> {
        self.runtime.block_on(self.inner.stat_vfs(path))
    }

    /// Blocking `query`.
    pub fn query(&self, code: QueryCode, arg: &str) -> Result<String> {
        self.runtime.block_on(self.inner.query(code, arg))
    }

    /// Blocking `existfiles`.
    pub fn existfiles<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<bool>> {
        self.runtime.block_on(self.inner.existfiles(paths))
    }

    /// Blocking `existdirs`.
    pub fn existdirs<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<bool>> {
        self.runtime.block_on(self.inner.existdirs(paths))
    }

    /// Blocking `isfileonline`.
    pub fn isfileonline<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<bool>> {
        self.runtime.block_on(self.inner.isfileonline(paths))
    }

    /// Blocking `stat_many`.
    pub fn stat_many<S: AsRef<str>>(&self, paths: &[S]) -> Result<BatchResult<FileStatus>> {
        self.runtime.block_on(self.inner.stat_many(paths))
    }

    /// `stat_many` bounded by an overall deadline; members still running
    /// when it expires report `Cancelled`.
    pub fn stat_many_within<S: AsRef<str>>(&self, paths: &[S], timeout: Duration) -> Result<BatchResult<FileStatus>> {
        let ctx: CallContext = self.inner.context_with_timeout(timeout);
        self.runtime.block_on(self.inner.stat_many_with(paths, &ctx))
    }

    /// Blocking `prepare`.
    pub fn prepare<S: AsRef<str>>(&self, paths: &[S], flags: PrepareFlags, priority: Priority) -> Result<PrepareReceipt> {
        self.runtime.block_on(self.inner.prepare(paths, flags, priority))
    }

    /// Blocking `prepare_status`.
    pub fn prepare_status(&self, receipt: &PrepareReceipt) -> Result<PrepareStatus> {
        self.runtime.block_on(self.inner.prepare_status(receipt))
    }

    /// Blocking `getchecksum`.
    pub fn getchecksum(&self, path: impl AsRef<str>) -> Result<String> {
        self.runtime.block_on(self.inner.getchecksum(path))
    }

    /// Blocking `checksum_record`.
    pub fn checksum_record(&self, path: impl AsRef<str>) -> Result<ChecksumRecord> {
        self.runtime.block_on(self.inner.checksum_record(path))
    }

    /// Blocking `protocol`.
    pub fn protocol(&self) -> Result<ProtocolInfo> {
        self.runtime.block_on(self.inner.protocol())
    }

    /// Blocking `ping`.
    pub fn ping(&self) -> Result<Duration> {
        self.runtime.block_on(self.inner.ping())
    }

    /// Cancels in-flight operations and closes every session.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for BlockingAdminClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingAdminClient")
            .field("inner", &self.inner)
            .finish()
    }
}

/// Directory entries fetched page by page on the client's runtime.
pub struct BlockingDirListing {
    listing: DirListing,
    runtime: Arc<Runtime>,
}

impl Iterator for BlockingDirListing {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.listing.next())
    }
}

impl std::fmt::Debug for BlockingDirListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingDirListing")
            .field("listing", &self.listing)
            .finish()
    }
}
