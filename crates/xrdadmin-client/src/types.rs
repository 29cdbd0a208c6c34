//! Core value types shared by every admin operation.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use xrdadmin_transport::message::{NodeRole, StatReply, StatVfsReply};
use xrdadmin_transport::ServerAddr;

use crate::error::{AdminError, Result};

/// Role of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Manager node that maps logical paths to data servers.
    Redirector,
    /// Data server holding files.
    Data,
}

impl From<NodeRole> for Role {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Manager => Role::Redirector,
            NodeRole::Server => Role::Data,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Redirector => write!(f, "redirector"),
            Role::Data => write!(f, "data"),
        }
    }
}

/// Identity of a redirector or data node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    /// Network address.
    pub addr: ServerAddr,
    /// Node role.
    pub role: Role,
}

impl Server {
    /// Creates a server identity.
    pub fn new(addr: ServerAddr, role: Role) -> Self {
        Self { addr, role }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.role)
    }
}

/// Validated, namespace-rooted path.
///
/// Relative input is anchored at the namespace root, a trailing slash is
/// dropped, and empty, `.` and `..` components are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalPath(String);

impl LogicalPath {
    /// Validates and normalizes `path`.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();
        let invalid = |reason: &str| AdminError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("empty path"));
        }
        if raw.contains('\0') {
            return Err(invalid("contains NUL"));
        }
        let trimmed = raw.trim_start_matches('/');
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(LogicalPath("/".to_string()));
        }
        for component in trimmed.split('/') {
            match component {
                "" => return Err(invalid("empty component")),
                "." | ".." => return Err(invalid("relative component")),
                _ => {}
            }
        }
        Ok(LogicalPath(format!("/{}", trimmed)))
    }

    /// The root of the namespace.
    pub fn root() -> Self {
        LogicalPath("/".to_string())
    }

    /// Path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the namespace root.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent directory; `None` for the root.
    pub fn parent(&self) -> Option<LogicalPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(LogicalPath::root()),
            Some(idx) => Some(LogicalPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Last component; `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Appends one component.
    pub fn join(&self, name: &str) -> Result<LogicalPath> {
        if self.is_root() {
            LogicalPath::new(format!("/{}", name))
        } else {
            LogicalPath::new(format!("{}/{}", self.0, name))
        }
    }

    /// Whether `self` equals `other` or lies below it.
    pub fn starts_with(&self, other: &LogicalPath) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for LogicalPath {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self> {
        LogicalPath::new(s)
    }
}

impl AsRef<str> for LogicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where a logical path lives at the time of one resolution.
///
/// Valid for a single operation; the cluster may move files at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalLocation {
    /// Authoritative data server.
    pub server: Server,
    /// Path as known to that server.
    pub internal_path: String,
}

impl PhysicalLocation {
    /// Internal path for another logical path on the same server, assuming
    /// the same export prefix as `logical`.
    pub fn sibling_path(&self, logical: &LogicalPath, other: &LogicalPath) -> String {
        match self.internal_path.strip_suffix(logical.as_str()) {
            Some(prefix) => format!("{}{}", prefix, other),
            None => other.to_string(),
        }
    }
}

impl fmt::Display for PhysicalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.server.addr, self.internal_path)
    }
}

/// One replica reported by a deep locate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    /// Data server holding the replica.
    pub server: Server,
    /// Path as known to that server.
    pub internal_path: String,
    /// Whether the replica is online.
    pub online: bool,
    /// Whether the replica accepts writes.
    pub writable: bool,
}

/// POSIX-style permissions: one octal digit per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionTriple {
    /// Owner access bits.
    pub user: u8,
    /// Group access bits.
    pub group: u8,
    /// Access bits for everyone else.
    pub other: u8,
}

impl PermissionTriple {
    /// Read access.
    pub const READ: u8 = 4;
    /// Write access.
    pub const WRITE: u8 = 2;
    /// Execute / search access.
    pub const EXEC: u8 = 1;

    /// Builds a triple, rejecting digits above 7.
    pub fn new(user: u8, group: u8, other: u8) -> Result<Self> {
        let triple = Self { user, group, other };
        triple.validate()?;
        Ok(triple)
    }

    /// Splits a 9-bit mode such as `0o755`.
    pub fn from_mode(mode: u16) -> Result<Self> {
        if mode > 0o777 {
            return Err(AdminError::InvalidArgument(format!(
                "mode {:o} has bits above 0o777",
                mode
            )));
        }
        Ok(Self {
            user: ((mode >> 6) & 7) as u8,
            group: ((mode >> 3) & 7) as u8,
            other: (mode & 7) as u8,
        })
    }

    /// Rejects digits above 7.
    pub fn validate(&self) -> Result<()> {
        for (class, digit) in [("user", self.user), ("group", self.group), ("other", self.other)] {
            if digit > 7 {
                return Err(AdminError::InvalidArgument(format!(
                    "{} permission {} is not an octal digit",
                    class, digit
                )));
            }
        }
        Ok(())
    }

    /// Packs into a 9-bit mode.
    pub fn mode(&self) -> u16 {
        (u16::from(self.user) << 6) | (u16::from(self.group) << 3) | u16::from(self.other)
    }
}

impl Default for PermissionTriple {
    fn default() -> Self {
        Self {
            user: 7,
            group: 5,
            other: 5,
        }
    }
}

impl fmt::Display for PermissionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for digit in [self.user, self.group, self.other] {
            let r = if digit & Self::READ != 0 { 'r' } else { '-' };
            let w = if digit & Self::WRITE != 0 { 'w' } else { '-' };
            let x = if digit & Self::EXEC != 0 { 'x' } else { '-' };
            write!(f, "{}{}{}", r, w, x)?;
        }
        Ok(())
    }
}

/// Status flag bits reported by stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatFlags(u32);

impl StatFlags {
    /// Executable or searchable.
    pub const XSET: StatFlags = StatFlags(1);
    /// Directory.
    pub const IS_DIR: StatFlags = StatFlags(2);
    /// Neither a file nor a directory.
    pub const OTHER: StatFlags = StatFlags(4);
    /// Not online; must be staged before use.
    pub const OFFLINE: StatFlags = StatFlags(8);
    /// Readable.
    pub const READABLE: StatFlags = StatFlags(16);
    /// Writable.
    pub const WRITABLE: StatFlags = StatFlags(32);
    /// Persist-on-successful-close pending.
    pub const POSC_PENDING: StatFlags = StatFlags(64);
    /// A backup copy exists.
    pub const BACKUP_EXISTS: StatFlags = StatFlags(128);

    /// Wraps raw bits.
    pub fn from_bits(bits: u32) -> Self {
        StatFlags(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: StatFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StatFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        StatFlags(self.0 | rhs.0)
    }
}

/// Snapshot returned by stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    /// Opaque object identifier.
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    /// Status flags.
    pub flags: StatFlags,
    /// Modification time, seconds since the epoch.
    pub mod_time: u64,
}

impl FileStatus {
    /// Directory.
    pub fn is_dir(&self) -> bool {
        self.flags.contains(StatFlags::IS_DIR)
    }

    /// Regular file: neither a directory nor "other".
    pub fn is_file(&self) -> bool {
        !self.is_dir() && !self.flags.contains(StatFlags::OTHER)
    }

    /// Resident and usable without staging.
    pub fn is_online(&self) -> bool {
        !self.flags.contains(StatFlags::OFFLINE)
    }

    /// Modification time.
    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.mod_time)
    }
}

impl From<StatReply> for FileStatus {
    fn from(reply: StatReply) -> Self {
        Self {
            id: reply.id,
            size: reply.size,
            flags: StatFlags::from_bits(reply.flags),
            mod_time: reply.mod_time,
        }
    }
}

/// Checksum of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    /// File the checksum belongs to.
    pub path: LogicalPath,
    /// Algorithm name, e.g. `adler32`.
    pub algorithm: String,
    /// Digest in the server's textual form.
    pub digest: String,
}

impl ChecksumRecord {
    /// Parses a server answer of the form `"<algorithm> <digest>"`.
    pub fn parse(path: LogicalPath, answer: &str) -> Result<Self> {
        let mut parts = answer.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(algorithm), Some(digest), None) => Ok(Self {
                path,
                algorithm: algorithm.to_string(),
                digest: digest.to_string(),
            }),
            _ => Err(AdminError::Protocol(format!(
                "malformed checksum answer '{}'",
                answer
            ))),
        }
    }
}

/// Staging option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrepareFlags(u8);

impl PrepareFlags {
    /// Cancel a previous request for the paths.
    pub const CANCEL: PrepareFlags = PrepareFlags(1);
    /// Ask for a notification on completion.
    pub const NOTIFY: PrepareFlags = PrepareFlags(2);
    /// Do not report per-path errors.
    pub const NO_ERRORS: PrepareFlags = PrepareFlags(4);
    /// Bring the files online.
    pub const STAGE: PrepareFlags = PrepareFlags(8);
    /// Files will be opened for writing.
    pub const WRITE_MODE: PrepareFlags = PrepareFlags(16);
    /// Co-locate the files on one server.
    pub const COLOCATE: PrepareFlags = PrepareFlags(32);
    /// Refresh the cluster's cached file state first.
    pub const FRESH: PrepareFlags = PrepareFlags(64);

    /// No options.
    pub fn empty() -> Self {
        PrepareFlags(0)
    }

    /// Wraps raw bits.
    pub fn from_bits(bits: u8) -> Self {
        PrepareFlags(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        PrepareFlags(self.0 | rhs.0)
    }
}

/// Staging priority. Ordering hint only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Lowest.
    #[default]
    Low,
    /// Normal.
    Normal,
    /// High.
    High,
    /// Highest.
    Urgent,
}

impl Priority {
    /// Wire value, 0..=3.
    pub fn as_u8(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = AdminError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Urgent),
            other => Err(AdminError::InvalidArgument(format!(
                "priority {} out of range 0..=3",
                other
            ))),
        }
    }
}

/// Acceptance of a staging request by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareReceipt {
    /// Identifier of the queued request.
    pub request_id: String,
}

/// Options for mkdir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MkdirFlags {
    /// Create missing parents; an existing directory is not an error.
    pub make_path: bool,
}

/// Answer to a protocol query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Protocol version spoken by the node.
    pub version: u32,
    /// Node role.
    pub role: Role,
}

/// Free space summary for a path, as answered by stat of the file system.
/// Sizes are in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VfsStatus {
    /// Nodes offering read/write space.
    pub nodes_rw: u64,
    /// Largest free read/write space on one partition.
    pub free_rw_mb: u64,
    /// Utilisation percentage of that partition.
    pub utilization_rw: u8,
    /// Nodes offering staging space.
    pub nodes_staging: u64,
    /// Largest free staging space on one partition.
    pub free_staging_mb: u64,
    /// Utilisation percentage of that partition.
    pub utilization_staging: u8,
}

impl From<StatVfsReply> for VfsStatus {
    fn from(reply: StatVfsReply) -> Self {
        Self {
            nodes_rw: reply.nodes_rw,
            free_rw_mb: reply.free_rw_mb,
            utilization_rw: reply.utilization_rw.min(100),
            nodes_staging: reply.nodes_staging,
            free_staging_mb: reply.free_staging_mb,
            utilization_staging: reply.utilization_staging.min(100),
        }
    }
}

/// Where one member of a staging request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageState {
    /// Waiting in the staging queue.
    Queued,
    /// Resident.
    Online,
    /// Still offline and no longer queued, e.g. after a cancel.
    Offline,
    /// Not in the namespace.
    Missing,
}

impl StageState {
    fn from_word(word: &str) -> Option<Self> {
        match word {
            "queued" => Some(StageState::Queued),
            "online" => Some(StageState::Online),
            "offline" => Some(StageState::Offline),
            "missing" => Some(StageState::Missing),
            _ => None,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            StageState::Queued => "queued",
            StageState::Online => "online",
            StageState::Offline => "offline",
            StageState::Missing => "missing",
        };
        f.write_str(word)
    }
}

/// One member of a staging request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    /// Member path.
    pub path: LogicalPath,
    /// Its current state.
    pub state: StageState,
}

/// Progress of a staging request, member by member in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareStatus {
    /// Request the status belongs to.
    pub request_id: String,
    /// Members.
    pub files: Vec<StagedFile>,
}

impl PrepareStatus {
    /// Parses a server answer with one `"<state> <path>"` line per member.
    pub fn parse(request_id: impl Into<String>, answer: &str) -> Result<Self> {
        let malformed = |line: &str| AdminError::Protocol(format!("malformed prepare status line '{}'", line));
        let mut files = Vec::new();
        for line in answer.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (word, path) = line.split_once(' ').ok_or_else(|| malformed(line))?;
            let state = StageState::from_word(word).ok_or_else(|| malformed(line))?;
            let path = LogicalPath::new(path.trim()).map_err(|_| malformed(line))?;
            files.push(StagedFile { path, state });
        }
        Ok(Self {
            request_id: request_id.into(),
            files,
        })
    }

    /// Whether every member is resident.
    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| f.state == StageState::Online)
    }

    /// Members in `state`.
    pub fn in_state(&self, state: StageState) -> impl Iterator<Item = &LogicalPath> {
        self.files.iter().filter(move |f| f.state == state).map(|f| &f.path)
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name within the directory.
    pub name: String,
    /// Status of the entry; `None` unless the listing asked for details.
    pub status: Option<FileStatus>,
}

/// Outcome of a batch call: one entry per input path, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult<T> {
    items: Vec<Result<T>>,
}

impl<T> BatchResult<T> {
    pub(crate) fn from_items(items: Vec<Result<T>>) -> Self {
        Self { items }
    }

    /// Number of entries; always equals the number of input paths.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch was empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Outcome for the input at `index`.
    pub fn get(&self, index: usize) -> Option<&Result<T>> {
        self.items.get(index)
    }

    /// Outcomes in input order.
    pub fn iter(&self) -> std::slice::Iter<'_, Result<T>> {
        self.items.iter()
    }

    /// Positions and errors of the failed entries.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &AdminError)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }

    /// Whether every entry succeeded.
    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|r| r.is_ok())
    }

    /// The underlying outcomes.
    pub fn into_inner(self) -> Vec<Result<T>> {
        self.items
    }
}

impl BatchResult<bool> {
    /// Plain flags, with failed entries reported as `false`.
    pub fn to_flags(&self) -> Vec<bool> {
        self.items
            .iter()
            .map(|r| matches!(r, Ok(true)))
            .collect()
    }
}

impl<T> IntoIterator for BatchResult<T> {
    type Item = Result<T>;
    type IntoIter = std::vec::IntoIter<Result<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a BatchResult<T> {
    type Item = &'a Result<T>;
    type IntoIter = std::slice::Iter<'a, Result<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_logical_path_normalization() {
        assert_eq!(LogicalPath::new("/store/a.root").unwrap().as_str(), "/store/a.root");
        assert_eq!(LogicalPath::new("pippo.root").unwrap().as_str(), "/pippo.root");
        assert_eq!(LogicalPath::new("/store/dir/").unwrap().as_str(), "/store/dir");
        assert_eq!(LogicalPath::new("/").unwrap(), LogicalPath::root());
    }

    #[test]
    fn test_logical_path_rejects_bad_input() {
        for bad in ["", "/store//a", "/store/../etc", "/./a", "/a\0b"] {
            let err = LogicalPath::new(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPath, "{:?}", bad);
        }
    }

    #[test]
    fn test_parent_and_name() {
        let p = LogicalPath::new("/store/run1/a.root").unwrap();
        assert_eq!(p.parent().unwrap().as_str(), "/store/run1");
        assert_eq!(p.file_name(), Some("a.root"));
        let top = LogicalPath::new("/store").unwrap();
        assert_eq!(top.parent().unwrap(), LogicalPath::root());
        assert!(LogicalPath::root().parent().is_none());
    }

    #[test]
    fn test_starts_with() {
        let dir = LogicalPath::new("/store").unwrap();
        assert!(LogicalPath::new("/store/a").unwrap().starts_with(&dir));
        assert!(dir.starts_with(&dir));
        assert!(!LogicalPath::new("/storeroom").unwrap().starts_with(&dir));
    }

    #[test]
    fn test_permission_triple_mode() {
        let perms = PermissionTriple::new(7, 5, 0).unwrap();
        assert_eq!(perms.mode(), 0o750);
        assert_eq!(perms.to_string(), "rwxr-x---");
        assert_eq!(PermissionTriple::from_mode(0o644).unwrap(), PermissionTriple::new(6, 4, 4).unwrap());
        assert!(PermissionTriple::new(8, 0, 0).is_err());
        assert!(PermissionTriple::from_mode(0o1777).is_err());
    }

    #[test]
    fn test_file_status_predicates() {
        let dir = FileStatus {
            id: "1".to_string(),
            size: 0,
            flags: StatFlags::IS_DIR | StatFlags::READABLE,
            mod_time: 0,
        };
        assert!(dir.is_dir());
        assert!(!dir.is_file());

        let offline = FileStatus {
            id: "2".to_string(),
            size: 10,
            flags: StatFlags::OFFLINE,
            mod_time: 0,
        };
        assert!(offline.is_file());
        assert!(!offline.is_online());
    }

    #[test]
    fn test_checksum_record_parse() {
        let path = LogicalPath::new("/a").unwrap();
        let rec = ChecksumRecord::parse(path.clone(), "adler32 0a1b2c3d").unwrap();
        assert_eq!(rec.algorithm, "adler32");
        assert_eq!(rec.digest, "0a1b2c3d");
        assert!(ChecksumRecord::parse(path, "garbage").is_err());
    }

    #[test]
    fn test_priority_order_and_wire() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Urgent);
        assert_eq!(Priority::try_from(2).unwrap(), Priority::High);
        assert!(Priority::try_from(4).is_err());
        assert_eq!(Priority::Urgent.as_u8(), 3);
    }

    #[test]
    fn test_batch_flags() {
        let batch = BatchResult::from_items(vec![
            Ok(true),
            Err(AdminError::Timeout {
                detail: "x".to_string(),
            }),
            Ok(false),
        ]);
        assert_eq!(batch.to_flags(), vec![true, false, false]);
        assert_eq!(batch.failures().map(|(i, _)| i).collect::<Vec<_>>(), vec![1]);
        assert!(!batch.all_ok());
    }

    #[test]
    fn test_file_status_modified_is_seconds_since_epoch() {
        let status = FileStatus {
            id: "3".to_string(),
            size: 1,
            flags: StatFlags::from_bits(0),
            mod_time: 1_700_000_123,
        };
        let modified = status.modified();
        assert_eq!(
            modified.duration_since(UNIX_EPOCH).unwrap(),
            Duration::from_secs(1_700_000_123)
        );
        let epoch = FileStatus { mod_time: 0, ..status };
        assert_eq!(epoch.modified(), UNIX_EPOCH);
    }

    #[test]
    fn test_prepare_status_parse() {
        let answer = "queued /store/a.root\nonline /store/b.root\n\nmissing /store/c.root\n";
        let status = PrepareStatus::parse("req-7", answer).unwrap();
        assert_eq!(status.request_id, "req-7");
        assert_eq!(status.files.len(), 3);
        assert_eq!(status.files[0].state, StageState::Queued);
        assert_eq!(status.files[2].path.as_str(), "/store/c.root");
        assert!(!status.is_complete());
        let online: Vec<_> = status.in_state(StageState::Online).map(|p| p.as_str()).collect();
        assert_eq!(online, vec!["/store/b.root"]);

        assert!(PrepareStatus::parse("req-7", "").unwrap().is_complete());
        assert!(PrepareStatus::parse("req-7", "staged /store/a.root").is_err());
        assert!(PrepareStatus::parse("req-7", "queued").is_err());
    }

    #[test]
    fn test_vfs_status_clamps_utilisation() {
        let status = VfsStatus::from(StatVfsReply {
            nodes_rw: 2,
            free_rw_mb: 512,
            utilization_rw: 250,
            nodes_staging: 0,
            free_staging_mb: 0,
            utilization_staging: 0,
        });
        assert_eq!(status.utilization_rw, 100);
        assert_eq!(status.free_rw_mb, 512);
    }

    proptest! {
        #[test]
        fn prop_valid_paths_roundtrip(components in prop::collection::vec("[a-zA-Z0-9_.-]{1,12}", 1..6)) {
            prop_assume!(components.iter().all(|c| c != "." && c != ".."));
            let raw = format!("/{}", components.join("/"));
            let path = LogicalPath::new(&raw).unwrap();
            prop_assert_eq!(path.as_str(), raw.as_str());
            prop_assert_eq!(LogicalPath::new(path.as_str()).unwrap(), path.clone());
            prop_assert_eq!(path.file_name(), components.last().map(|s| s.as_str()));
        }
    }
}
