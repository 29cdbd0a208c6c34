//! Checksum retrieval.
//!
//! Nothing is cached here: every call asks the data server that owns the
//! file.

use std::sync::Arc;

use tracing::debug;
use xrdadmin_transport::message::{QueryCode, QueryReply, QueryRequest};
use xrdadmin_transport::{CallContext, Opcode};

use crate::error::Result;
use crate::resolver::{decode, encode, Freshness, LocationResolver, ResolveIntent};
use crate::types::{ChecksumRecord, LogicalPath};

/// Asks data servers for file checksums.
#[derive(Debug, Clone)]
pub struct ChecksumService {
    resolver: Arc<LocationResolver>,
}

impl ChecksumService {
    /// Creates the service on top of `resolver`.
    pub fn new(resolver: Arc<LocationResolver>) -> Self {
        Self { resolver }
    }

    /// Digest of `path` in the server's textual form.
    pub async fn getchecksum(&self, path: &LogicalPath, ctx: &CallContext) -> Result<String> {
        Ok(self.checksum_record(path, ctx).await?.digest)
    }

    /// Algorithm and digest of `path`. Directories fail `Unsupported`.
    pub async fn checksum_record(&self, path: &LogicalPath, ctx: &CallContext) -> Result<ChecksumRecord> {
        let body = self
            .resolver
            .dispatch(path, ResolveIntent::Lookup, Freshness::Cached, Opcode::Query, ctx, |loc| {
                encode(&QueryRequest {
                    code: QueryCode::Checksum,
                    arg: loc.internal_path.clone(),
                })
            })
            .await?;
        let reply: QueryReply = decode(&body)?;
        let record = ChecksumRecord::parse(path.clone(), &reply.response)?;
        debug!(path = %path, algorithm = %record.algorithm, "checksum");
        Ok(record)
    }
}
