//! Single-path metadata operations.
//!
//! Each operation resolves its path, sends one request to the owning data
//! server and interprets the reply. Operations that change the namespace
//! always resolve fresh; read-only ones may use the location cache.
//! Space statistics and queries that are not about one file go to an entry
//! redirector, which answers for the whole cluster.

use std::sync::Arc;

use tracing::debug;
use xrdadmin_transport::message::{
    ChmodRequest, EmptyReply, MkdirRequest, MvRequest, PathRequest, QueryCode, QueryReply,
    QueryRequest, StatReply, StatVfsReply, TruncateRequest,
};
use xrdadmin_transport::{CallContext, Opcode};

use crate::dirlist::DirListing;
use crate::error::{AdminError, Result};
use crate::resolver::{decode, encode, Freshness, LocationResolver, ResolveIntent};
use crate::types::{FileStatus, LogicalPath, MkdirFlags, PermissionTriple, VfsStatus};

/// stat, statvfs, chmod, mkdir, rm, rmdir, mv, truncate, dirlist and query.
#[derive(Debug, Clone)]
pub struct MetadataOperations {
    resolver: Arc<LocationResolver>,
    page_size: u32,
}

impl MetadataOperations {
    /// Creates the service; `page_size` bounds each dirlist request.
    pub fn new(resolver: Arc<LocationResolver>, page_size: u32) -> Self {
        Self {
            resolver,
            page_size: page_size.max(1),
        }
    }

    /// Status snapshot of `path`.
    pub async fn stat(&self, path: &LogicalPath, ctx: &CallContext) -> Result<FileStatus> {
        let body = self
            .resolver
            .dispatch(path, ResolveIntent::Lookup, Freshness::Cached, Opcode::Stat, ctx, |loc| {
                encode(&PathRequest {
                    path: loc.internal_path.clone(),
                })
            })
            .await?;
        let reply: StatReply = decode(&body)?;
        Ok(reply.into())
    }

    /// Sets the permissions of `path`.
    pub async fn chmod(
        &self,
        path: &LogicalPath,
        perms: PermissionTriple,
        ctx: &CallContext,
    ) -> Result<()> {
        perms.validate()?;
        let mode = perms.mode();
        let body = self
            .resolver
            .dispatch(path, ResolveIntent::Lookup, Freshness::Fresh, Opcode::Chmod, ctx, |loc| {
                encode(&ChmodRequest {
                    path: loc.internal_path.clone(),
                    mode,
                })
            })
            .await?;
        decode::<EmptyReply>(&body)?;
        debug!(path = %path, mode = %format!("{:o}", mode), "chmod");
        Ok(())
    }

    /// Creates the directory `path`.
    ///
    /// Without `make_path` the parent must exist and an existing entry fails
    /// `AlreadyExists`. With it, missing parents are created and an existing
    /// directory is accepted.
    pub async fn mkdir(
        &self,
        path: &LogicalPath,
        perms: PermissionTriple,
        flags: MkdirFlags,
        ctx: &CallContext,
    ) -> Result<()> {
        perms.validate()?;
        if path.is_root() {
            if flags.make_path {
                return Ok(());
            }
            return Err(AdminError::AlreadyExists {
                path: path.to_string(),
            });
        }
        let mode = perms.mode();
        let body = self
            .resolver
            .dispatch(path, ResolveIntent::Create, Freshness::Fresh, Opcode::Mkdir, ctx, |loc| {
                encode(&MkdirRequest {
                    path: loc.internal_path.clone(),
                    mode,
                    make_path: flags.make_path,
                })
            })
            .await?;
        decode::<EmptyReply>(&body)?;
        debug!(path = %path, make_path = flags.make_path, "mkdir");
        Ok(())
    }

    /// Removes the file `path`. Directories fail `Unsupported`.
    pub async fn rm(&self, path: &LogicalPath, ctx: &CallContext) -> Result<()> {
        self.simple(path, Opcode::Rm, ctx).await?;
        self.resolver.cache().invalidate(path);
        debug!(path = %path, "rm");
        Ok(())
    }

    /// Removes the empty directory `path`.
    pub async fn rmdir(&self, path: &LogicalPath, ctx: &CallContext) -> Result<()> {
        if path.is_root() {
            return Err(AdminError::Unsupported {
                path: path.to_string(),
                message: "cannot remove the namespace root".to_string(),
            });
        }
        self.simple(path, Opcode::Rmdir, ctx).await?;
        self.resolver.cache().invalidate(path);
        debug!(path = %path, "rmdir");
        Ok(())
    }

    async fn simple(&self, path: &LogicalPath, opcode: Opcode, ctx: &CallContext) -> Result<()> {
        let body = self
            .resolver
            .dispatch(path, ResolveIntent::Lookup, Freshness::Fresh, opcode, ctx, |loc| {
                encode(&PathRequest {
                    path: loc.internal_path.clone(),
                })
            })
            .await?;
        decode::<EmptyReply>(&body)?;
        Ok(())
    }

    /// Atomically renames `source` to `destination`. An existing destination
    /// fails `AlreadyExists` and leaves both paths untouched.
    pub async fn mv(
        &self,
        source: &LogicalPath,
        destination: &LogicalPath,
        ctx: &CallContext,
    ) -> Result<()> {
        if source.is_root() {
            return Err(AdminError::Unsupported {
                path: source.to_string(),
                message: "cannot move the namespace root".to_string(),
            });
        }
        if destination != source && destination.starts_with(source) {
            return Err(AdminError::InvalidArgument(format!(
                "cannot move {} below itself to {}",
                source, destination
            )));
        }
        let body = self
            .resolver
            .dispatch(source, ResolveIntent::Lookup, Freshness::Fresh, Opcode::Mv, ctx, |loc| {
                encode(&MvRequest {
                    source: loc.internal_path.clone(),
                    destination: loc.sibling_path(source, destination),
                })
            })
            .await
            .map_err(|e| match e {
                AdminError::AlreadyExists { .. } => AdminError::AlreadyExists {
                    path: destination.to_string(),
                },
                other => other,
            })?;
        decode::<EmptyReply>(&body)?;
        self.resolver.cache().invalidate(source);
        self.resolver.cache().invalidate(destination);
        debug!(source = %source, destination = %destination, "mv");
        Ok(())
    }

    /// Truncates the file `path` to `size` bytes.
    pub async fn truncate(&self, path: &LogicalPath, size: u64, ctx: &CallContext) -> Result<()> {
        let body = self
            .resolver
            .dispatch(path, ResolveIntent::Lookup, Freshness::Fresh, Opcode::Truncate, ctx, |loc| {
                encode(&TruncateRequest {
                    path: loc.internal_path.clone(),
                    size,
                })
            })
            .await?;
        decode::<EmptyReply>(&body)?;
        Ok(())
    }

    /// Lazily lists the entries of directory `path`.
    pub async fn dirlist(&self, path: &LogicalPath, ctx: &CallContext) -> Result<DirListing> {
        DirListing::open(self.resolver.clone(), path.clone(), self.page_size, false, ctx.clone()).await
    }

    /// Like `dirlist`, with the status of every entry fetched alongside.
    pub async fn dirlist_with_stat(&self, path: &LogicalPath, ctx: &CallContext) -> Result<DirListing> {
        DirListing::open(self.resolver.clone(), path.clone(), self.page_size, true, ctx.clone()).await
    }

    /// Free space available for `path` across the cluster.
    ///
    /// Answered by the first entry redirector that responds; a redirector
    /// that delegates the path redirects and the answer comes from there.
    pub async fn stat_vfs(&self, path: &LogicalPath, ctx: &CallContext) -> Result<VfsStatus> {
        let request = encode(&PathRequest {
            path: path.to_string(),
        })?;
        let (server, body) = self
            .resolver
            .call_entry(path.as_str(), Opcode::StatVfs, request, ctx)
            .await?;
        let reply: StatVfsReply = decode(&body)?;
        debug!(path = %path, server = %server, nodes = reply.nodes_rw, free_mb = reply.free_rw_mb, "statvfs");
        Ok(reply.into())
    }

    /// Raw answer to a server query.
    ///
    /// Codes about one file treat `arg` as a logical path and ask the data
    /// server that owns it. Every other code goes to an entry redirector
    /// with `arg` passed through untouched.
    pub async fn query(&self, code: QueryCode, arg: &str, ctx: &CallContext) -> Result<String> {
        let body = if code.targets_path() {
            let path = LogicalPath::new(arg)?;
            self.resolver
                .dispatch(&path, ResolveIntent::Lookup, Freshness::Cached, Opcode::Query, ctx, |loc| {
                    encode(&QueryRequest {
                        code,
                        arg: loc.internal_path.clone(),
                    })
                })
                .await?
        } else {
            let request = encode(&QueryRequest {
                code,
                arg: arg.to_string(),
            })?;
            self.resolver.call_entry(arg, Opcode::Query, request, ctx).await?.1
        };
        let reply: QueryReply = decode(&body)?;
        debug!(?code, arg, bytes = reply.response.len(), "query");
        Ok(reply.response)
    }
}
