//! Request and reply bodies carried in frame payloads.
//!
//! Bodies are serialized with bincode. Which body a payload holds is implied
//! by the frame opcode (requests) or by opcode plus reply status (responses).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

// ============================================================================
// Session (0x00xx)
// ============================================================================

/// Login request sent once when a session is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    /// Free-form client identification.
    pub client_name: String,
    /// User name supplied by the credential provider.
    pub user: Option<String>,
    /// Opaque token supplied by the credential provider.
    pub token: Option<String>,
}

/// Login reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginReply {
    /// Server-assigned session id.
    pub session_id: u64,
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Redirector / manager node.
    Manager,
    /// Data server.
    Server,
}

/// Reply to a protocol request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolReply {
    /// Protocol version spoken by the node.
    pub version: u32,
    /// Role of the node.
    pub role: NodeRole,
}

/// Reply without a body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmptyReply {}

// ============================================================================
// Location (0x0101)
// ============================================================================

/// Why a location is being requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LocateIntent {
    /// The path is expected to exist.
    Lookup,
    /// The path is about to be created; locate the server that should own it.
    Create,
}

/// Locate request sent to a redirector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocateRequest {
    /// Logical path.
    pub path: String,
    /// Lookup or create.
    pub intent: LocateIntent,
}

/// One location in a locate answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationEntry {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Manager entries must be asked again; server entries are authoritative.
    pub role: NodeRole,
    /// Whether the file is online at that location.
    pub online: bool,
    /// Whether write access is allowed there.
    pub writable: bool,
}

/// Locate answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocateReply {
    /// Server-internal path for the logical path.
    pub internal_path: String,
    /// Candidate locations, preferred first.
    pub locations: Vec<LocationEntry>,
}

// ============================================================================
// Metadata operations (0x01xx)
// ============================================================================

/// Request naming a single path (stat, rm, rmdir).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathRequest {
    /// Server-internal path.
    pub path: String,
}

/// Stat reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatReply {
    /// Opaque object identifier.
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    /// Status flag bits.
    pub flags: u32,
    /// Modification time, seconds since epoch.
    pub mod_time: u64,
}

/// Chmod request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChmodRequest {
    /// Server-internal path.
    pub path: String,
    /// 9-bit permission mode.
    pub mode: u16,
}

/// Mkdir request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MkdirRequest {
    /// Server-internal path.
    pub path: String,
    /// 9-bit permission mode.
    pub mode: u16,
    /// Create missing parents; an existing directory is not an error.
    pub make_path: bool,
}

/// Rename request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MvRequest {
    /// Existing path.
    pub source: String,
    /// New path; must not exist.
    pub destination: String,
}

/// Request for one page of directory entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirlistRequest {
    /// Server-internal directory path.
    pub path: String,
    /// Resume after this entry name; `None` starts at the beginning.
    pub cursor: Option<String>,
    /// Maximum entries in the page.
    pub limit: u32,
    /// Also return the status of every entry.
    pub with_stat: bool,
}

/// One page of directory entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirlistReply {
    /// Entry names in this page.
    pub entries: Vec<String>,
    /// Status of each entry, parallel to `entries`; empty unless requested.
    pub stats: Vec<StatReply>,
    /// Cursor for the next page; `None` when the listing is complete.
    pub next_cursor: Option<String>,
}

/// Truncate request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruncateRequest {
    /// Server-internal path.
    pub path: String,
    /// New size in bytes.
    pub size: u64,
}

/// Space summary answering a `StatVfs` request. Sizes are in MiB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatVfsReply {
    /// Nodes offering read/write space.
    pub nodes_rw: u64,
    /// Largest contiguous free read/write space.
    pub free_rw_mb: u64,
    /// Utilisation percentage of the partition behind `free_rw_mb`.
    pub utilization_rw: u8,
    /// Nodes offering staging space.
    pub nodes_staging: u64,
    /// Largest contiguous free staging space.
    pub free_staging_mb: u64,
    /// Utilisation percentage of the partition behind `free_staging_mb`.
    pub utilization_staging: u8,
}

// ============================================================================
// Staging (0x02xx) and queries (0x03xx)
// ============================================================================

/// Staging request covering a list of paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareRequest {
    /// Logical paths to stage.
    pub paths: Vec<String>,
    /// Staging option bits.
    pub options: u8,
    /// Priority, 0 (low) to 3 (urgent).
    pub priority: u8,
}

/// Staging acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareReply {
    /// Identifier of the queued request.
    pub request_id: String,
}

/// Query kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QueryCode {
    /// Server configuration values; the argument names them.
    Config,
    /// Checksum of a file.
    Checksum,
    /// Cancel a checksum computation in progress.
    ChecksumCancel,
    /// Implementation-defined query about the server.
    Opaque,
    /// Implementation-defined query about a file.
    OpaqueFile,
    /// Status of a staging request; the argument is its request id.
    Prepare,
    /// Logical space statistics of a space name.
    Space,
    /// Server statistics.
    Stats,
    /// Visa attributes of a file.
    Visa,
    /// Extended attributes of a file.
    XAttr,
}

impl QueryCode {
    /// Whether the argument is a path answered by the server owning it.
    /// Other queries are answered by the entry redirector.
    pub fn targets_path(self) -> bool {
        matches!(
            self,
            QueryCode::Checksum
                | QueryCode::ChecksumCancel
                | QueryCode::OpaqueFile
                | QueryCode::Visa
                | QueryCode::XAttr
        )
    }
}

/// Query request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    /// What to query.
    pub code: QueryCode,
    /// Query argument, usually a path.
    pub arg: String,
}

/// Query reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryReply {
    /// Textual answer; for checksums `"<algorithm> <digest>"`.
    pub response: String,
}

// ============================================================================
// Non-Ok reply bodies
// ============================================================================

/// Semantic failure codes reported by servers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Path does not exist.
    NotFound,
    /// Target already exists.
    AlreadyExists,
    /// A directory was required.
    NotADirectory,
    /// Directory still has entries.
    NotEmpty,
    /// Target is a directory where a file was required.
    IsADirectory,
    /// Caller lacks the rights.
    PermissionDenied,
    /// Operation not meaningful for the target.
    Unsupported,
    /// Malformed request.
    InvalidRequest,
    /// Server-internal failure.
    ServerError,
}

/// Body of an `Error` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReply {
    /// Failure code.
    pub code: ErrorCode,
    /// Human readable detail.
    pub message: String,
}

/// Body of a `Redirect` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedirectReply {
    /// Host to ask instead.
    pub host: String,
    /// Port to ask instead.
    pub port: u16,
}

/// Body of a `Wait` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitReply {
    /// Suggested delay before resending.
    pub millis: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_reply_serialization() {
        let reply = LocateReply {
            internal_path: "/store/run1/a.root".to_string(),
            locations: vec![LocationEntry {
                host: "data01".to_string(),
                port: 1094,
                role: NodeRole::Server,
                online: true,
                writable: false,
            }],
        };
        let bytes = serialize_message(&reply).unwrap();
        let decoded: LocateReply = deserialize_message(&bytes).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let result: Result<StatReply> = deserialize_message(&[0xFF, 0x01]);
        assert!(matches!(result, Err(TransportError::SerializationError(_))));
    }

    #[test]
    fn test_query_routing_by_code() {
        assert!(QueryCode::Checksum.targets_path());
        assert!(QueryCode::XAttr.targets_path());
        assert!(!QueryCode::Prepare.targets_path());
        assert!(!QueryCode::Space.targets_path());
        assert!(!QueryCode::Config.targets_path());
    }

    #[test]
    fn test_empty_reply_is_small() {
        let bytes = serialize_message(&EmptyReply::default()).unwrap();
        assert!(bytes.is_empty());
    }
}
