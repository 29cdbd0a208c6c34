//! xrdadmin client subsystem: path resolution through redirectors, metadata,
//! batch, staging and checksum operations, and the `xrdadmin` CLI.

#![warn(missing_docs)]

pub mod batch;
pub mod blocking;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod dirlist;
pub mod error;
pub mod metadata;
pub mod resolver;
pub mod sim;
pub mod staging;
pub mod types;

pub use batch::BatchOperations;
pub use blocking::{BlockingAdminClient, BlockingDirListing};
pub use checksum::ChecksumService;
pub use client::AdminClient;
pub use config::{AdminConfig, CredentialSettings, RetrySettings};
pub use dirlist::DirListing;
pub use error::{AdminError, ErrorKind, Result};
pub use metadata::MetadataOperations;
pub use resolver::{Freshness, LocationCache, LocationResolver, ResolveIntent, ResolverConfig};
pub use sim::{SimCluster, SimClusterBuilder};
pub use staging::StagingManager;
pub use types::{
    BatchResult, ChecksumRecord, DirEntry, FileStatus, LocationInfo, LogicalPath, MkdirFlags,
    PermissionTriple, PhysicalLocation, PrepareFlags, PrepareReceipt, PrepareStatus, Priority,
    ProtocolInfo, Role, Server, StageState, StagedFile, StatFlags, VfsStatus,
};
pub use xrdadmin_transport::message::QueryCode;
pub use xrdadmin_transport::{CallContext, CancelReason, CancelToken, ServerAddr};
