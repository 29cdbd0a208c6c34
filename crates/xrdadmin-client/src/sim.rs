//! In-process simulated cluster.
//!
//! `SimCluster` implements `Transport`, so an `AdminClient` can run against
//! it without sockets. Managers answer locate requests from a shared
//! namespace and redirect; data servers own entries and execute metadata
//! operations on them. Faults are injected per node: down, hung, busy,
//! forced redirects and delegations, required login tokens and denied
//! prefixes. Managers also answer space statistics and cluster queries
//! aggregated over the data servers they front.
//!
//! Every node can also be served over real TCP with `serve_node`.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use xrdadmin_transport::message::{
    deserialize_message, serialize_message, ChmodRequest, DirlistReply, DirlistRequest, EmptyReply,
    ErrorCode, ErrorReply, LocateIntent, LocateReply, LocateRequest, LocationEntry, LoginReply,
    LoginRequest, MkdirRequest, MvRequest, NodeRole, PathRequest, PrepareReply, PrepareRequest,
    ProtocolReply, QueryCode, QueryReply, QueryRequest, RedirectReply, StatReply, StatVfsReply,
    TruncateRequest, WaitReply,
};
use xrdadmin_transport::{
    CancelToken, Connection, Frame, FrameHandler, FrameServer, Opcode, ReplyStatus, ServerAddr,
    Transport, TransportError,
};

use crate::error::{AdminError, Result};
use crate::types::{LogicalPath, PrepareFlags, StatFlags};

type TransportResult<T> = xrdadmin_transport::Result<T>;

/// Protocol version reported by simulated nodes.
pub const SIM_PROTOCOL_VERSION: u32 = 5;

const BUSY_WAIT_MILLIS: u64 = 1;
const DEFAULT_TOTAL_MB: u64 = 200_000;
const DEFAULT_FREE_MB: u64 = 150_000;
const EPOCH: u64 = 1_700_000_000;

#[derive(Debug, Clone)]
enum EntryKind {
    Dir,
    File { content: Vec<u8> },
}

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    kind: EntryKind,
    owner: ServerAddr,
    replicas: Vec<ServerAddr>,
    mode: u16,
    online: bool,
    mod_time: u64,
}

impl Entry {
    fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir)
    }

    fn stat(&self) -> StatReply {
        let mut flags = StatFlags::from_bits(0);
        if self.is_dir() {
            flags = flags | StatFlags::IS_DIR | StatFlags::XSET;
        }
        if !self.online {
            flags = flags | StatFlags::OFFLINE;
        }
        if self.mode & 0o444 != 0 {
            flags = flags | StatFlags::READABLE;
        }
        if self.mode & 0o222 != 0 {
            flags = flags | StatFlags::WRITABLE;
        }
        let size = match &self.kind {
            EntryKind::Dir => 4096,
            EntryKind::File { content } => content.len() as u64,
        };
        StatReply {
            id: self.id.to_string(),
            size,
            flags: flags.bits(),
            mod_time: self.mod_time,
        }
    }
}

#[derive(Debug, Clone)]
struct NodeState {
    role: NodeRole,
    export_prefix: String,
    redirect_to: Option<ServerAddr>,
    delegates: Vec<ServerAddr>,
    down: bool,
    hung: bool,
    busy: u32,
    required_token: Option<String>,
    deny_prefix: Option<String>,
    total_mb: u64,
    free_mb: u64,
    staging_space: bool,
    logins: u64,
    requests: u64,
}

impl NodeState {
    fn new(role: NodeRole, export_prefix: String) -> Self {
        Self {
            role,
            export_prefix,
            redirect_to: None,
            delegates: Vec::new(),
            down: false,
            hung: false,
            busy: 0,
            required_token: None,
            deny_prefix: None,
            total_mb: DEFAULT_TOTAL_MB,
            free_mb: DEFAULT_FREE_MB,
            staging_space: false,
            logins: 0,
            requests: 0,
        }
    }
}

/// Reply frame, or an error reply frame to send instead.
type Answer = std::result::Result<Frame, Frame>;

fn ok<T: Serialize>(request: &Frame, body: &T) -> Frame {
    request.respond(ReplyStatus::Ok, serialize_message(body).unwrap_or_default())
}

fn fail(request: &Frame, code: ErrorCode, message: impl Into<String>) -> Frame {
    let body = ErrorReply {
        code,
        message: message.into(),
    };
    request.respond(ReplyStatus::Error, serialize_message(&body).unwrap_or_default())
}

fn not_found(request: &Frame, path: &str) -> Frame {
    fail(request, ErrorCode::NotFound, format!("{}: no such file or directory", path))
}

fn redirect(request: &Frame, to: &ServerAddr) -> Frame {
    let body = RedirectReply {
        host: to.host.clone(),
        port: to.port,
    };
    request.respond(ReplyStatus::Redirect, serialize_message(&body).unwrap_or_default())
}

fn wait(request: &Frame) -> Frame {
    let body = WaitReply {
        millis: BUSY_WAIT_MILLIS,
    };
    request.respond(ReplyStatus::Wait, serialize_message(&body).unwrap_or_default())
}

fn body<T: DeserializeOwned>(request: &Frame) -> std::result::Result<T, Frame> {
    deserialize_message(&request.payload)
        .map_err(|e| fail(request, ErrorCode::InvalidRequest, e.to_string()))
}

fn normalize(path: &str) -> Option<String> {
    LogicalPath::new(path).ok().map(|p| p.as_str().to_string())
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_within(path: &str, root: &str) -> bool {
    root == "/"
        || path == root
        || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

fn utilization(total_mb: u64, free_mb: u64) -> u8 {
    if total_mb == 0 {
        return 100;
    }
    (total_mb.saturating_sub(free_mb) * 100 / total_mb).min(100) as u8
}

fn location(addr: &ServerAddr, role: NodeRole, online: bool, writable: bool) -> LocationEntry {
    LocationEntry {
        host: addr.host.clone(),
        port: addr.port,
        role,
        online,
        writable,
    }
}

struct SimState {
    nodes: BTreeMap<ServerAddr, NodeState>,
    namespace: BTreeMap<String, Entry>,
    staging: Vec<String>,
    prepares: BTreeMap<String, Vec<String>>,
    next_id: u64,
    clock: u64,
    next_session: u64,
    next_prepare: u64,
}

impl SimState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn new_entry(&mut self, kind: EntryKind, owner: ServerAddr, mode: u16, online: bool) -> Entry {
        self.next_id += 1;
        Entry {
            id: self.next_id,
            kind,
            owner,
            replicas: Vec::new(),
            mode,
            online,
            mod_time: self.tick(),
        }
    }

    fn export_prefix(&self, addr: &ServerAddr) -> String {
        self.nodes
            .get(addr)
            .map(|n| n.export_prefix.clone())
            .unwrap_or_default()
    }

    fn nearest_existing(&self, path: &str) -> Option<&Entry> {
        let mut current = Some(path);
        while let Some(p) = current {
            if let Some(entry) = self.namespace.get(p) {
                return Some(entry);
            }
            current = parent_of(p);
        }
        None
    }

    fn has_children(&self, dir: &str) -> bool {
        self.namespace.keys().any(|k| parent_of(k) == Some(dir))
    }

    /// Creates missing ancestors of `path` as directories owned by `owner`.
    fn make_parents(&mut self, path: &str, owner: &ServerAddr, mode: u16) -> std::result::Result<(), String> {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(p) = current {
            match self.namespace.get(p) {
                Some(entry) if entry.is_dir() => break,
                Some(_) => return Err(p.to_string()),
                None => missing.push(p.to_string()),
            }
            current = parent_of(p);
        }
        for dir in missing.into_iter().rev() {
            let entry = self.new_entry(EntryKind::Dir, owner.clone(), mode, true);
            self.namespace.insert(dir, entry);
        }
        Ok(())
    }

    fn handle(&mut self, addr: &ServerAddr, request: &Frame) -> Option<Frame> {
        let node = self.nodes.get(addr)?.clone();
        if node.hung {
            debug!(node = %addr, opcode = %request.opcode(), "hung node swallowed request");
            return None;
        }
        if request.opcode() == Opcode::Login {
            return Some(self.login(addr, &node, request));
        }
        if let Some(state) = self.nodes.get_mut(addr) {
            state.requests += 1;
            if state.busy > 0 {
                state.busy -= 1;
                return Some(wait(request));
            }
        }
        let answer = match node.role {
            NodeRole::Manager => self.manager(&node, request),
            NodeRole::Server => self.data(addr, &node, request),
        };
        Some(answer.unwrap_or_else(|reply| reply))
    }

    fn login(&mut self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Frame {
        let login: LoginRequest = match body(request) {
            Ok(login) => login,
            Err(reply) => return reply,
        };
        if let Some(required) = &node.required_token {
            if login.token.as_deref() != Some(required.as_str()) {
                return fail(request, ErrorCode::PermissionDenied, "invalid token");
            }
        }
        if let Some(state) = self.nodes.get_mut(addr) {
            state.logins += 1;
        }
        self.next_session += 1;
        ok(request, &LoginReply {
            session_id: self.next_session,
        })
    }

    fn protocol(node: &NodeState, request: &Frame) -> Frame {
        ok(request, &ProtocolReply {
            version: SIM_PROTOCOL_VERSION,
            role: node.role,
        })
    }

    // ------------------------------------------------------------------
    // Managers
    // ------------------------------------------------------------------

    fn manager(&mut self, node: &NodeState, request: &Frame) -> Answer {
        let opcode = request.opcode();
        if !matches!(opcode, Opcode::Ping | Opcode::Protocol) {
            if let Some(to) = &node.redirect_to {
                return Ok(redirect(request, to));
            }
        }
        match opcode {
            Opcode::Ping => Ok(ok(request, &EmptyReply::default())),
            Opcode::Protocol => Ok(Self::protocol(node, request)),
            Opcode::Locate => self.manager_locate(node, request),
            Opcode::Prepare => self.prepare(request),
            Opcode::StatVfs => {
                let _: PathRequest = body(request)?;
                Ok(ok(request, &self.cluster_space()))
            }
            Opcode::Query => self.manager_query(node, request),
            other => Err(fail(
                request,
                ErrorCode::InvalidRequest,
                format!("{} is not served by a manager", other),
            )),
        }
    }

    fn manager_locate(&self, node: &NodeState, request: &Frame) -> Answer {
        let req: LocateRequest = body(request)?;
        if !node.delegates.is_empty() {
            let locations = node
                .delegates
                .iter()
                .map(|d| location(d, NodeRole::Manager, true, true))
                .collect();
            return Ok(ok(request, &LocateReply {
                internal_path: req.path,
                locations,
            }));
        }
        let path = normalize(&req.path)
            .ok_or_else(|| fail(request, ErrorCode::InvalidRequest, "invalid path"))?;
        let entry = match req.intent {
            LocateIntent::Lookup => self.namespace.get(&path),
            LocateIntent::Create => self.nearest_existing(&path),
        }
        .ok_or_else(|| not_found(request, &path))?;

        let mut locations = vec![location(&entry.owner, NodeRole::Server, entry.online, true)];
        locations.extend(
            entry
                .replicas
                .iter()
                .map(|r| location(r, NodeRole::Server, entry.online, false)),
        );
        Ok(ok(request, &LocateReply {
            internal_path: format!("{}{}", self.export_prefix(&entry.owner), path),
            locations,
        }))
    }

    fn prepare(&mut self, request: &Frame) -> Answer {
        let req: PrepareRequest = body(request)?;
        let cancel = PrepareFlags::from_bits(req.options).contains(PrepareFlags::CANCEL);
        let mut members = Vec::new();
        for raw in &req.paths {
            let Some(path) = normalize(raw) else {
                continue;
            };
            members.push(path.clone());
            if cancel {
                self.staging.retain(|queued| queued != &path);
                continue;
            }
            match self.namespace.get(&path) {
                Some(entry) if !entry.is_dir() && !entry.online => {
                    if !self.staging.contains(&path) {
                        self.staging.push(path);
                    }
                }
                Some(_) => {}
                None => debug!(path = %path, "prepare names a missing file"),
            }
        }
        self.next_prepare += 1;
        let request_id = format!("sim-{}", self.next_prepare);
        if !cancel {
            self.prepares.insert(request_id.clone(), members);
        }
        Ok(ok(request, &PrepareReply { request_id }))
    }

    fn prepare_status(&self, request: &Frame, request_id: &str) -> Answer {
        let members = self
            .prepares
            .get(request_id)
            .ok_or_else(|| fail(request, ErrorCode::NotFound, format!("{}: unknown prepare request", request_id)))?;
        let lines: Vec<String> = members
            .iter()
            .map(|path| {
                let state = match self.namespace.get(path) {
                    None => "missing",
                    Some(entry) if entry.online => "online",
                    Some(_) if self.staging.contains(path) => "queued",
                    Some(_) => "offline",
                };
                format!("{} {}", state, path)
            })
            .collect();
        Ok(ok(request, &QueryReply {
            response: lines.join("\n"),
        }))
    }

    fn data_nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes
            .values()
            .filter(|n| n.role == NodeRole::Server && !n.down)
    }

    /// Largest free partition among reachable data servers, split by kind.
    fn cluster_space(&self) -> StatVfsReply {
        let mut reply = StatVfsReply {
            nodes_rw: 0,
            free_rw_mb: 0,
            utilization_rw: 0,
            nodes_staging: 0,
            free_staging_mb: 0,
            utilization_staging: 0,
        };
        for node in self.data_nodes() {
            if node.staging_space {
                reply.nodes_staging += 1;
                if node.free_mb >= reply.free_staging_mb {
                    reply.free_staging_mb = node.free_mb;
                    reply.utilization_staging = utilization(node.total_mb, node.free_mb);
                }
            } else {
                reply.nodes_rw += 1;
                if node.free_mb >= reply.free_rw_mb {
                    reply.free_rw_mb = node.free_mb;
                    reply.utilization_rw = utilization(node.total_mb, node.free_mb);
                }
            }
        }
        reply
    }

    fn manager_query(&self, node: &NodeState, request: &Frame) -> Answer {
        let req: QueryRequest = body(request)?;
        match req.code {
            QueryCode::Prepare => self.prepare_status(request, req.arg.trim()),
            QueryCode::Space => {
                if req.arg != "default" && !req.arg.is_empty() {
                    return Err(fail(request, ErrorCode::NotFound, format!("{}: unknown space", req.arg)));
                }
                let (total, free, largest) = self.data_nodes().fold((0u64, 0u64, 0u64), |(t, f, l), n| {
                    (t + n.total_mb, f + n.free_mb, l.max(n.free_mb))
                });
                let mib = 1024 * 1024;
                Ok(ok(request, &QueryReply {
                    response: format!(
                        "oss.cgroup=default&oss.space={}&oss.free={}&oss.maxf={}&oss.used={}&oss.quota=-1",
                        total * mib,
                        free * mib,
                        largest * mib,
                        total.saturating_sub(free) * mib
                    ),
                }))
            }
            QueryCode::Config => Ok(Self::config_query(node, request, &req.arg)),
            QueryCode::Stats => Ok(Self::stats_query(node, request)),
            code => Err(fail(
                request,
                ErrorCode::Unsupported,
                format!("{:?} query is not answered by a manager", code),
            )),
        }
    }

    /// One line per requested key; unknown keys come back as their own name.
    fn config_query(node: &NodeState, request: &Frame, keys: &str) -> Frame {
        let values: Vec<String> = keys
            .split_whitespace()
            .map(|key| match key {
                "version" => SIM_PROTOCOL_VERSION.to_string(),
                "role" => match node.role {
                    NodeRole::Manager => "manager".to_string(),
                    NodeRole::Server => "server".to_string(),
                },
                "chksum" => "0:crc32".to_string(),
                other => other.to_string(),
            })
            .collect();
        ok(request, &QueryReply {
            response: values.join("\n"),
        })
    }

    fn stats_query(node: &NodeState, request: &Frame) -> Frame {
        ok(request, &QueryReply {
            response: format!("requests={} logins={}", node.requests, node.logins),
        })
    }

    // ------------------------------------------------------------------
    // Data servers
    // ------------------------------------------------------------------

    fn local(node: &NodeState, request: &Frame, internal: &str) -> std::result::Result<String, Frame> {
        internal
            .strip_prefix(node.export_prefix.as_str())
            .filter(|rest| rest.starts_with('/'))
            .and_then(normalize)
            .ok_or_else(|| {
                fail(
                    request,
                    ErrorCode::InvalidRequest,
                    format!("{} is outside the export", internal),
                )
            })
    }

    /// Logical path of an existing entry this server owns.
    fn owned(
        &self,
        addr: &ServerAddr,
        node: &NodeState,
        request: &Frame,
        internal: &str,
    ) -> std::result::Result<String, Frame> {
        let path = Self::local(node, request, internal)?;
        match self.namespace.get(&path) {
            None => Err(not_found(request, &path)),
            Some(entry) if &entry.owner != addr => Err(redirect(request, &entry.owner)),
            Some(_) => Ok(path),
        }
    }

    fn check_allowed(node: &NodeState, request: &Frame, path: &str) -> std::result::Result<(), Frame> {
        match &node.deny_prefix {
            Some(prefix) if is_within(path, prefix) => Err(fail(
                request,
                ErrorCode::PermissionDenied,
                format!("{}: permission denied", path),
            )),
            _ => Ok(()),
        }
    }

    fn data(&mut self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Answer {
        match request.opcode() {
            Opcode::Ping => Ok(ok(request, &EmptyReply::default())),
            Opcode::Protocol => Ok(Self::protocol(node, request)),
            Opcode::Locate => self.data_locate(addr, node, request),
            Opcode::Stat => {
                let req: PathRequest = body(request)?;
                let path = self.owned(addr, node, request, &req.path)?;
                let entry = self.namespace.get(&path).ok_or_else(|| not_found(request, &path))?;
                Ok(ok(request, &entry.stat()))
            }
            Opcode::Chmod => {
                let req: ChmodRequest = body(request)?;
                let path = self.owned(addr, node, request, &req.path)?;
                Self::check_allowed(node, request, &path)?;
                let now = self.tick();
                if let Some(entry) = self.namespace.get_mut(&path) {
                    entry.mode = req.mode & 0o777;
                    entry.mod_time = now;
                }
                Ok(ok(request, &EmptyReply::default()))
            }
            Opcode::Mkdir => self.mkdir(addr, node, request),
            Opcode::Rm => {
                let req: PathRequest = body(request)?;
                let path = self.owned(addr, node, request, &req.path)?;
                Self::check_allowed(node, request, &path)?;
                if self.namespace.get(&path).is_some_and(Entry::is_dir) {
                    return Err(fail(request, ErrorCode::IsADirectory, format!("{} is a directory", path)));
                }
                self.namespace.remove(&path);
                Ok(ok(request, &EmptyReply::default()))
            }
            Opcode::Rmdir => {
                let req: PathRequest = body(request)?;
                let path = self.owned(addr, node, request, &req.path)?;
                Self::check_allowed(node, request, &path)?;
                if path == "/" {
                    return Err(fail(request, ErrorCode::Unsupported, "cannot remove the root"));
                }
                if !self.namespace.get(&path).is_some_and(Entry::is_dir) {
                    return Err(fail(request, ErrorCode::NotADirectory, format!("{} is not a directory", path)));
                }
                if self.has_children(&path) {
                    return Err(fail(request, ErrorCode::NotEmpty, format!("{} is not empty", path)));
                }
                self.namespace.remove(&path);
                Ok(ok(request, &EmptyReply::default()))
            }
            Opcode::Mv => self.mv(addr, node, request),
            Opcode::Dirlist => self.dirlist(addr, node, request),
            Opcode::Truncate => {
                let req: TruncateRequest = body(request)?;
                let path = self.owned(addr, node, request, &req.path)?;
                Self::check_allowed(node, request, &path)?;
                let now = self.tick();
                match self.namespace.get_mut(&path).map(|e| &mut e.kind) {
                    Some(EntryKind::File { content }) => {
                        content.resize(req.size as usize, 0);
                    }
                    _ => {
                        return Err(fail(request, ErrorCode::IsADirectory, format!("{} is a directory", path)))
                    }
                }
                if let Some(entry) = self.namespace.get_mut(&path) {
                    entry.mod_time = now;
                }
                Ok(ok(request, &EmptyReply::default()))
            }
            Opcode::StatVfs => {
                let _: PathRequest = body(request)?;
                let rw = !node.staging_space;
                let used = utilization(node.total_mb, node.free_mb);
                Ok(ok(request, &StatVfsReply {
                    nodes_rw: u64::from(rw),
                    free_rw_mb: if rw { node.free_mb } else { 0 },
                    utilization_rw: if rw { used } else { 0 },
                    nodes_staging: u64::from(!rw),
                    free_staging_mb: if rw { 0 } else { node.free_mb },
                    utilization_staging: if rw { 0 } else { used },
                }))
            }
            Opcode::Query => self.data_query(addr, node, request),
            other => Err(fail(
                request,
                ErrorCode::InvalidRequest,
                format!("{} is not served by a data server", other),
            )),
        }
    }

    fn data_query(&self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Answer {
        let req: QueryRequest = body(request)?;
        match req.code {
            QueryCode::Config => return Ok(Self::config_query(node, request, &req.arg)),
            QueryCode::Stats => return Ok(Self::stats_query(node, request)),
            QueryCode::Checksum | QueryCode::ChecksumCancel | QueryCode::XAttr => {}
            code => {
                return Err(fail(
                    request,
                    ErrorCode::Unsupported,
                    format!("{:?} query is not supported", code),
                ))
            }
        }
        let path = self.owned(addr, node, request, &req.arg)?;
        let entry = self.namespace.get(&path).ok_or_else(|| not_found(request, &path))?;
        let response = match (req.code, &entry.kind) {
            (QueryCode::Checksum, EntryKind::File { content }) => {
                format!("crc32 {:08x}", crc32fast::hash(content))
            }
            (QueryCode::Checksum | QueryCode::ChecksumCancel, EntryKind::Dir) => {
                return Err(fail(
                    request,
                    ErrorCode::Unsupported,
                    format!("{}: no checksum for a directory", path),
                ))
            }
            (QueryCode::XAttr, _) => format!(
                "mode={:o}\nowner={}\nonline={}",
                entry.mode,
                entry.owner,
                u8::from(entry.online)
            ),
            _ => String::new(),
        };
        Ok(ok(request, &QueryReply { response }))
    }

    fn data_locate(&self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Answer {
        let req: LocateRequest = body(request)?;
        let path = normalize(&req.path)
            .ok_or_else(|| fail(request, ErrorCode::InvalidRequest, "invalid path"))?;
        let online = match (req.intent, self.namespace.get(&path)) {
            (_, Some(entry)) if &entry.owner != addr => return Ok(redirect(request, &entry.owner)),
            (_, Some(entry)) => entry.online,
            (LocateIntent::Create, None) => true,
            (LocateIntent::Lookup, None) => return Err(not_found(request, &path)),
        };
        Ok(ok(request, &LocateReply {
            internal_path: format!("{}{}", node.export_prefix, path),
            locations: vec![location(addr, NodeRole::Server, online, true)],
        }))
    }

    fn mkdir(&mut self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Answer {
        let req: MkdirRequest = body(request)?;
        let path = Self::local(node, request, &req.path)?;
        Self::check_allowed(node, request, &path)?;
        if let Some(existing) = self.namespace.get(&path) {
            if &existing.owner != addr {
                return Err(redirect(request, &existing.owner));
            }
            if existing.is_dir() && req.make_path {
                return Ok(ok(request, &EmptyReply::default()));
            }
            return Err(fail(request, ErrorCode::AlreadyExists, format!("{} exists", path)));
        }
        let mode = req.mode & 0o777;
        if req.make_path {
            self.make_parents(&path, addr, mode).map_err(|file| {
                fail(request, ErrorCode::NotADirectory, format!("{} is not a directory", file))
            })?;
        } else {
            let parent = parent_of(&path).unwrap_or("/");
            match self.namespace.get(parent) {
                None => return Err(not_found(request, parent)),
                Some(entry) if !entry.is_dir() => {
                    return Err(fail(request, ErrorCode::NotADirectory, format!("{} is not a directory", parent)))
                }
                Some(_) => {}
            }
        }
        let entry = self.new_entry(EntryKind::Dir, addr.clone(), mode, true);
        self.namespace.insert(path, entry);
        Ok(ok(request, &EmptyReply::default()))
    }

    fn mv(&mut self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Answer {
        let req: MvRequest = body(request)?;
        let source = self.owned(addr, node, request, &req.source)?;
        let destination = Self::local(node, request, &req.destination)?;
        Self::check_allowed(node, request, &source)?;
        Self::check_allowed(node, request, &destination)?;
        if source == "/" || (destination != source && is_within(&destination, &source)) {
            return Err(fail(request, ErrorCode::InvalidRequest, "cannot move a directory below itself"));
        }
        if self.namespace.contains_key(&destination) {
            return Err(fail(request, ErrorCode::AlreadyExists, format!("{} exists", destination)));
        }
        let parent = parent_of(&destination).unwrap_or("/");
        match self.namespace.get(parent) {
            None => return Err(not_found(request, parent)),
            Some(entry) if !entry.is_dir() => {
                return Err(fail(request, ErrorCode::NotADirectory, format!("{} is not a directory", parent)))
            }
            Some(_) => {}
        }

        let moved: Vec<String> = self
            .namespace
            .keys()
            .filter(|k| is_within(k, &source))
            .cloned()
            .collect();
        let now = self.tick();
        for old in moved {
            if let Some(mut entry) = self.namespace.remove(&old) {
                let new = format!("{}{}", destination, &old[source.len()..]);
                if old == source {
                    entry.mod_time = now;
                }
                self.namespace.insert(new, entry);
            }
        }
        Ok(ok(request, &EmptyReply::default()))
    }

    fn dirlist(&self, addr: &ServerAddr, node: &NodeState, request: &Frame) -> Answer {
        let req: DirlistRequest = body(request)?;
        let path = self.owned(addr, node, request, &req.path)?;
        if !self.namespace.get(&path).is_some_and(Entry::is_dir) {
            return Err(fail(request, ErrorCode::NotADirectory, format!("{} is not a directory", path)));
        }
        let mut names = self
            .namespace
            .keys()
            .filter(|k| parent_of(k) == Some(path.as_str()))
            .filter_map(|k| k.rsplit('/').next())
            .filter(|name| req.cursor.as_deref().map_or(true, |c| *name > c));
        let limit = req.limit.max(1) as usize;
        let entries: Vec<String> = names.by_ref().take(limit).map(str::to_string).collect();
        let next_cursor = if names.next().is_some() {
            entries.last().cloned()
        } else {
            None
        };
        let stats = if req.with_stat {
            entries
                .iter()
                .filter_map(|name| {
                    let child = if path == "/" { format!("/{}", name) } else { format!("{}/{}", path, name) };
                    self.namespace.get(&child).map(Entry::stat)
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(ok(request, &DirlistReply {
            entries,
            stats,
            next_cursor,
        }))
    }
}

/// Builder for a `SimCluster`.
#[derive(Debug, Default)]
pub struct SimClusterBuilder {
    managers: Vec<ServerAddr>,
    data_servers: Vec<(ServerAddr, String)>,
}

impl SimClusterBuilder {
    /// Adds a manager (redirector) node.
    pub fn manager(mut self, addr: ServerAddr) -> Self {
        self.managers.push(addr);
        self
    }

    /// Adds a data server exporting the namespace without a prefix.
    pub fn data_server(self, addr: ServerAddr) -> Self {
        self.data_server_with_export(addr, "")
    }

    /// Adds a data server whose internal paths are `prefix` followed by the
    /// logical path.
    pub fn data_server_with_export(mut self, addr: ServerAddr, prefix: impl Into<String>) -> Self {
        self.data_servers.push((addr, prefix.into()));
        self
    }

    /// Builds the cluster. The namespace root is owned by the first data
    /// server.
    pub fn build(self) -> SimCluster {
        let mut nodes = BTreeMap::new();
        for addr in self.managers {
            nodes.insert(addr, NodeState::new(NodeRole::Manager, String::new()));
        }
        for (addr, prefix) in &self.data_servers {
            nodes.insert(addr.clone(), NodeState::new(NodeRole::Server, prefix.clone()));
        }
        let mut state = SimState {
            nodes,
            namespace: BTreeMap::new(),
            staging: Vec::new(),
            prepares: BTreeMap::new(),
            next_id: 0,
            clock: EPOCH,
            next_session: 0,
            next_prepare: 0,
        };
        if let Some((root_owner, _)) = self.data_servers.first() {
            let root = state.new_entry(EntryKind::Dir, root_owner.clone(), 0o755, true);
            state.namespace.insert("/".to_string(), root);
        }
        SimCluster {
            inner: Arc::new(Mutex::new(state)),
        }
    }
}

/// Shared handle to a simulated cluster.
#[derive(Clone)]
pub struct SimCluster {
    inner: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Starts describing a cluster.
    pub fn builder() -> SimClusterBuilder {
        SimClusterBuilder::default()
    }

    fn with_node(&self, addr: &ServerAddr, f: impl FnOnce(&mut NodeState)) {
        if let Some(node) = self.inner.lock().nodes.get_mut(addr) {
            f(node);
        }
    }

    /// Answers one request as node `addr` would; `None` when the node sends
    /// nothing back.
    pub fn handle(&self, addr: &ServerAddr, request: &Frame) -> Option<Frame> {
        self.inner.lock().handle(addr, request)
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Refuses connections and resets established ones.
    pub fn set_down(&self, addr: &ServerAddr, down: bool) {
        self.with_node(addr, |n| n.down = down);
    }

    /// Accepts requests but never answers them.
    pub fn set_hung(&self, addr: &ServerAddr, hung: bool) {
        self.with_node(addr, |n| n.hung = hung);
    }

    /// Answers the next `replies` requests with `Wait`.
    pub fn set_busy(&self, addr: &ServerAddr, replies: u32) {
        self.with_node(addr, |n| n.busy = replies);
    }

    /// Redirects every path request sent to manager `addr`.
    pub fn set_redirect(&self, addr: &ServerAddr, to: Option<ServerAddr>) {
        self.with_node(addr, |n| n.redirect_to = to);
    }

    /// Makes manager `addr` answer locate requests with `delegates` only.
    pub fn set_delegates(&self, addr: &ServerAddr, delegates: Vec<ServerAddr>) {
        self.with_node(addr, |n| n.delegates = delegates);
    }

    /// Rejects logins that do not present `token`.
    pub fn set_required_token(&self, addr: &ServerAddr, token: Option<String>) {
        self.with_node(addr, |n| n.required_token = token);
    }

    /// Denies modifications at or below `prefix` on data server `addr`.
    pub fn set_deny_prefix(&self, addr: &ServerAddr, prefix: Option<String>) {
        self.with_node(addr, |n| n.deny_prefix = prefix);
    }

    /// Sets the partition size of data server `addr`, in MiB. Staging space
    /// is reported apart from read/write space.
    pub fn set_space(&self, addr: &ServerAddr, total_mb: u64, free_mb: u64, staging: bool) {
        self.with_node(addr, |n| {
            n.total_mb = total_mb;
            n.free_mb = free_mb.min(total_mb);
            n.staging_space = staging;
        });
    }

    // ------------------------------------------------------------------
    // Namespace
    // ------------------------------------------------------------------

    fn insert(&self, path: &str, owner: &ServerAddr, kind: EntryKind, online: bool) -> Result<()> {
        let path = LogicalPath::new(path)?;
        let mut state = self.inner.lock();
        state
            .make_parents(path.as_str(), owner, 0o755)
            .map_err(|file| AdminError::NotADirectory { path: file })?;
        let mode = if matches!(kind, EntryKind::Dir) { 0o755 } else { 0o644 };
        let entry = state.new_entry(kind, owner.clone(), mode, online);
        state.namespace.insert(path.as_str().to_string(), entry);
        Ok(())
    }

    /// Adds a directory owned by `owner`, creating missing parents.
    pub fn add_dir(&self, path: &str, owner: &ServerAddr) -> Result<()> {
        self.insert(path, owner, EntryKind::Dir, true)
    }

    /// Adds a file owned by `owner`, creating missing parents.
    pub fn add_file(&self, path: &str, owner: &ServerAddr, content: &[u8], online: bool) -> Result<()> {
        let kind = EntryKind::File {
            content: content.to_vec(),
        };
        self.insert(path, owner, kind, online)
    }

    fn update(&self, path: &str, f: impl FnOnce(&mut Entry)) -> bool {
        let Some(path) = normalize(path) else {
            return false;
        };
        match self.inner.lock().namespace.get_mut(&path) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Moves ownership of `path` to another data server.
    pub fn relocate(&self, path: &str, owner: &ServerAddr) -> bool {
        self.update(path, |e| e.owner = owner.clone())
    }

    /// Lists `replica` as an additional location of `path`.
    pub fn add_replica(&self, path: &str, replica: &ServerAddr) -> bool {
        self.update(path, |e| e.replicas.push(replica.clone()))
    }

    /// Marks `path` resident or offline.
    pub fn set_online(&self, path: &str, online: bool) -> bool {
        self.update(path, |e| e.online = online)
    }

    /// Replaces the content of file `path`.
    pub fn write_file(&self, path: &str, data: &[u8]) -> bool {
        self.update(path, |e| {
            if let EntryKind::File { content } = &mut e.kind {
                *content = data.to_vec();
            }
        })
    }

    /// Whether `path` is in the namespace.
    pub fn exists(&self, path: &str) -> bool {
        normalize(path).is_some_and(|p| self.inner.lock().namespace.contains_key(&p))
    }

    /// Whether `path` is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        normalize(path).is_some_and(|p| self.inner.lock().namespace.get(&p).is_some_and(Entry::is_dir))
    }

    /// Permission bits of `path`.
    pub fn mode(&self, path: &str) -> Option<u16> {
        let path = normalize(path)?;
        self.inner.lock().namespace.get(&path).map(|e| e.mode)
    }

    /// Size of file `path`.
    pub fn file_size(&self, path: &str) -> Option<u64> {
        let path = normalize(path)?;
        match &self.inner.lock().namespace.get(&path)?.kind {
            EntryKind::File { content } => Some(content.len() as u64),
            EntryKind::Dir => None,
        }
    }

    /// Paths queued for staging, in submission order.
    pub fn staging_queue(&self) -> Vec<String> {
        self.inner.lock().staging.clone()
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Requests other than logins received by `addr`.
    pub fn requests_to(&self, addr: &ServerAddr) -> u64 {
        self.inner.lock().nodes.get(addr).map_or(0, |n| n.requests)
    }

    /// Successful logins at `addr`.
    pub fn logins_to(&self, addr: &ServerAddr) -> u64 {
        self.inner.lock().nodes.get(addr).map_or(0, |n| n.logins)
    }

    /// Requests other than logins received by every node.
    pub fn total_requests(&self) -> u64 {
        self.inner.lock().nodes.values().map(|n| n.requests).sum()
    }

    fn is_down(&self, addr: &ServerAddr) -> bool {
        self.inner.lock().nodes.get(addr).map_or(true, |n| n.down)
    }

    /// Serves node `node` over TCP until `stop` is cancelled.
    pub async fn serve_node(
        &self,
        node: ServerAddr,
        listener: tokio::net::TcpListener,
        stop: CancelToken,
    ) -> TransportResult<()> {
        let handler = Arc::new(NodeHandler {
            cluster: self.clone(),
            node,
        });
        FrameServer::serve(listener, handler, stop).await
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SimCluster")
            .field("nodes", &state.nodes.keys().collect::<Vec<_>>())
            .field("entries", &state.namespace.len())
            .finish()
    }
}

#[async_trait]
impl Transport for SimCluster {
    async fn connect(&self, addr: &str) -> TransportResult<Box<dyn Connection>> {
        let server: ServerAddr = addr.parse()?;
        if self.is_down(&server) {
            return Err(TransportError::ConnectionRefused {
                addr: addr.to_string(),
            });
        }
        Ok(Box::new(SimConnection {
            cluster: self.clone(),
            server,
            peer: addr.to_string(),
            replies: Mutex::new(VecDeque::new()),
        }))
    }
}

struct SimConnection {
    cluster: SimCluster,
    server: ServerAddr,
    peer: String,
    replies: Mutex<VecDeque<Frame>>,
}

#[async_trait]
impl Connection for SimConnection {
    async fn send_frame(&self, frame: &Frame) -> TransportResult<()> {
        if self.cluster.is_down(&self.server) {
            return Err(TransportError::ConnectionReset);
        }
        let reply = self.cluster.handle(&self.server, frame);
        if let Some(reply) = reply {
            self.replies.lock().push_back(reply);
        }
        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<Frame> {
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(frame) => Ok(frame),
            None => std::future::pending::<TransportResult<Frame>>().await,
        }
    }

    fn peer_addr(&self) -> &str {
        &self.peer
    }
}

struct NodeHandler {
    cluster: SimCluster,
    node: ServerAddr,
}

impl FrameHandler for NodeHandler {
    fn handle(&self, request: Frame) -> Pin<Box<dyn Future<Output = Option<Frame>> + Send + '_>> {
        let reply = self.cluster.handle(&self.node, &request);
        Box::pin(std::future::ready(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> ServerAddr {
        ServerAddr::new("data01", 1094)
    }

    fn cluster() -> SimCluster {
        SimCluster::builder()
            .manager(ServerAddr::new("mgr", 1094))
            .data_server_with_export(data(), "/export")
            .build()
    }

    fn request<T: Serialize>(opcode: Opcode, body: &T) -> Frame {
        Frame::request(opcode, 7, serialize_message(body).unwrap())
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b"), Some("/a"));
    }

    #[test]
    fn test_add_file_creates_parents() {
        let sim = cluster();
        sim.add_file("/store/run1/a.root", &data(), b"abc", true).unwrap();
        assert!(sim.is_dir("/store"));
        assert!(sim.is_dir("/store/run1"));
        assert_eq!(sim.file_size("/store/run1/a.root"), Some(3));
        assert!(sim.add_file("/store/run1/a.root/x", &data(), b"", true).is_err());
    }

    #[test]
    fn test_manager_locate_uses_export_prefix() {
        let sim = cluster();
        sim.add_file("/f", &data(), b"", false).unwrap();
        let frame = request(Opcode::Locate, &LocateRequest {
            path: "/f".to_string(),
            intent: LocateIntent::Lookup,
        });
        let reply = sim.handle(&ServerAddr::new("mgr", 1094), &frame).unwrap();
        assert_eq!(reply.status(), ReplyStatus::Ok);
        let answer: LocateReply = deserialize_message(&reply.payload).unwrap();
        assert_eq!(answer.internal_path, "/export/f");
        assert_eq!(answer.locations[0].role, NodeRole::Server);
        assert!(!answer.locations[0].online);
    }

    #[test]
    fn test_data_server_redirects_foreign_path() {
        let other = ServerAddr::new("data02", 1094);
        let sim = SimCluster::builder()
            .data_server(data())
            .data_server(other.clone())
            .build();
        sim.add_file("/f", &other, b"", true).unwrap();
        let frame = request(Opcode::Stat, &PathRequest { path: "/f".to_string() });
        let reply = sim.handle(&data(), &frame).unwrap();
        assert_eq!(reply.status(), ReplyStatus::Redirect);
        let to: RedirectReply = deserialize_message(&reply.payload).unwrap();
        assert_eq!(to.host, "data02");
    }

    #[test]
    fn test_dirlist_pages() {
        let sim = cluster();
        for name in ["c", "a", "b"] {
            sim.add_file(&format!("/d/{}", name), &data(), b"", true).unwrap();
        }
        let frame = request(Opcode::Dirlist, &DirlistRequest {
            path: "/export/d".to_string(),
            cursor: None,
            limit: 2,
            with_stat: false,
        });
        let reply = sim.handle(&data(), &frame).unwrap();
        let page: DirlistReply = deserialize_message(&reply.payload).unwrap();
        assert_eq!(page.entries, vec!["a", "b"]);
        assert_eq!(page.next_cursor.as_deref(), Some("b"));

        let frame = request(Opcode::Dirlist, &DirlistRequest {
            path: "/export/d".to_string(),
            cursor: page.next_cursor,
            limit: 2,
            with_stat: true,
        });
        let reply = sim.handle(&data(), &frame).unwrap();
        let page: DirlistReply = deserialize_message(&reply.payload).unwrap();
        assert_eq!(page.entries, vec!["c"]);
        assert_eq!(page.stats.len(), 1);
        assert_eq!(page.stats[0].size, 0);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_manager_space_covers_reachable_data_servers() {
        let mgr = ServerAddr::new("mgr", 1094);
        let second = ServerAddr::new("data02", 1094);
        let tape = ServerAddr::new("stage01", 1094);
        let sim = SimCluster::builder()
            .manager(mgr.clone())
            .data_server(data())
            .data_server(second.clone())
            .data_server(tape.clone())
            .build();
        sim.set_space(&data(), 1000, 250, false);
        sim.set_space(&second, 1000, 600, false);
        sim.set_space(&tape, 4000, 1000, true);

        let frame = request(Opcode::StatVfs, &PathRequest { path: "/".to_string() });
        let reply = sim.handle(&mgr, &frame).unwrap();
        let space: StatVfsReply = deserialize_message(&reply.payload).unwrap();
        assert_eq!(space.nodes_rw, 2);
        assert_eq!(space.free_rw_mb, 600);
        assert_eq!(space.utilization_rw, 40);
        assert_eq!(space.nodes_staging, 1);
        assert_eq!(space.utilization_staging, 75);

        sim.set_down(&second, true);
        let reply = sim.handle(&mgr, &frame).unwrap();
        let space: StatVfsReply = deserialize_message(&reply.payload).unwrap();
        assert_eq!(space.nodes_rw, 1);
        assert_eq!(space.free_rw_mb, 250);
    }

    #[test]
    fn test_prepare_status_tracks_members() {
        let sim = cluster();
        let mgr = ServerAddr::new("mgr", 1094);
        sim.add_file("/t/a", &data(), b"", false).unwrap();
        sim.add_file("/t/b", &data(), b"", true).unwrap();
        let frame = request(Opcode::Prepare, &PrepareRequest {
            paths: vec!["/t/a".to_string(), "/t/b".to_string(), "/t/c".to_string()],
            options: PrepareFlags::STAGE.bits(),
            priority: 0,
        });
        let receipt: PrepareReply = deserialize_message(&sim.handle(&mgr, &frame).unwrap().payload).unwrap();

        let status = request(Opcode::Query, &QueryRequest {
            code: QueryCode::Prepare,
            arg: receipt.request_id.clone(),
        });
        let reply: QueryReply = deserialize_message(&sim.handle(&mgr, &status).unwrap().payload).unwrap();
        assert_eq!(reply.response, "queued /t/a\nonline /t/b\nmissing /t/c");

        let unknown = request(Opcode::Query, &QueryRequest {
            code: QueryCode::Prepare,
            arg: "sim-999".to_string(),
        });
        assert_eq!(sim.handle(&mgr, &unknown).unwrap().status(), ReplyStatus::Error);
    }

    #[test]
    fn test_file_queries_on_data_server() {
        let sim = cluster();
        sim.add_file("/q/f", &data(), b"abc", true).unwrap();
        let xattr = request(Opcode::Query, &QueryRequest {
            code: QueryCode::XAttr,
            arg: "/export/q/f".to_string(),
        });
        let reply: QueryReply = deserialize_message(&sim.handle(&data(), &xattr).unwrap().payload).unwrap();
        assert!(reply.response.starts_with("mode=644\n"));

        let config = request(Opcode::Query, &QueryRequest {
            code: QueryCode::Config,
            arg: "role chksum bogus".to_string(),
        });
        let reply: QueryReply = deserialize_message(&sim.handle(&data(), &config).unwrap().payload).unwrap();
        assert_eq!(reply.response, "server\n0:crc32\nbogus");

        let visa = request(Opcode::Query, &QueryRequest {
            code: QueryCode::Visa,
            arg: "/export/q/f".to_string(),
        });
        assert_eq!(sim.handle(&data(), &visa).unwrap().status(), ReplyStatus::Error);
    }

    #[test]
    fn test_busy_and_hung() {
        let sim = cluster();
        let mgr = ServerAddr::new("mgr", 1094);
        let ping = request(Opcode::Ping, &EmptyReply::default());
        sim.set_busy(&mgr, 1);
        assert_eq!(sim.handle(&mgr, &ping).unwrap().status(), ReplyStatus::Wait);
        assert_eq!(sim.handle(&mgr, &ping).unwrap().status(), ReplyStatus::Ok);
        sim.set_hung(&mgr, true);
        assert!(sim.handle(&mgr, &ping).is_none());
        assert_eq!(sim.requests_to(&mgr), 2);
    }
}
