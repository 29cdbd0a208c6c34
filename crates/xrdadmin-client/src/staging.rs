//! Staging ("prepare") submission.
//!
//! A prepare request names every path at once and is accepted or rejected
//! as a whole. Acceptance means the cluster queued it; residency is not
//! awaited. Members that are already online or already queued are left to
//! the cluster to skip. Progress is polled afterwards by request id.

use std::sync::Arc;

use tracing::{debug, info};
use xrdadmin_transport::message::{PrepareReply, PrepareRequest, QueryCode, QueryReply, QueryRequest};
use xrdadmin_transport::{CallContext, Opcode};

use crate::error::{AdminError, Result};
use crate::resolver::{decode, encode, LocationResolver};
use crate::types::{LogicalPath, PrepareFlags, PrepareReceipt, PrepareStatus, Priority};

/// Submits staging requests and reports on their progress.
#[derive(Debug, Clone)]
pub struct StagingManager {
    resolver: Arc<LocationResolver>,
}

impl StagingManager {
    /// Creates the service on top of `resolver`.
    pub fn new(resolver: Arc<LocationResolver>) -> Self {
        Self { resolver }
    }

    /// Submits `paths` as one staging request.
    ///
    /// Fails only when the request cannot be delivered or is refused as a
    /// whole; paths the cluster cannot stage are not reported here.
    pub async fn prepare(
        &self,
        paths: &[LogicalPath],
        flags: PrepareFlags,
        priority: Priority,
        ctx: &CallContext,
    ) -> Result<PrepareReceipt> {
        if paths.is_empty() {
            return Err(AdminError::InvalidArgument(
                "prepare needs at least one path".to_string(),
            ));
        }
        let request = PrepareRequest {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            options: flags.bits(),
            priority: priority.as_u8(),
        };
        debug!(paths = paths.len(), options = flags.bits(), ?priority, "submitting prepare");

        let subject = paths[0].to_string();
        let (server, body) = self
            .resolver
            .call_entry(&subject, Opcode::Prepare, encode(&request)?, ctx)
            .await?;
        let reply: PrepareReply = decode(&body)?;

        info!(
            request_id = %reply.request_id,
            server = %server,
            paths = paths.len(),
            ?priority,
            "prepare accepted"
        );
        Ok(PrepareReceipt {
            request_id: reply.request_id,
        })
    }

    /// Current state of every member of an accepted request.
    ///
    /// An id the cluster does not know fails `NotFound`.
    pub async fn prepare_status(&self, receipt: &PrepareReceipt, ctx: &CallContext) -> Result<PrepareStatus> {
        if receipt.request_id.is_empty() {
            return Err(AdminError::InvalidArgument(
                "prepare status needs a request id".to_string(),
            ));
        }
        let request = QueryRequest {
            code: QueryCode::Prepare,
            arg: receipt.request_id.clone(),
        };
        let (server, body) = self
            .resolver
            .call_entry(&receipt.request_id, Opcode::Query, encode(&request)?, ctx)
            .await?;
        let reply: QueryReply = decode(&body)?;
        let status = PrepareStatus::parse(receipt.request_id.clone(), &reply.response)?;
        debug!(
            request_id = %receipt.request_id,
            server = %server,
            files = status.files.len(),
            complete = status.is_complete(),
            "prepare status"
        );
        Ok(status)
    }
}
