//! Logical path to physical location resolution.
//!
//! Resolution starts at an entry redirector and follows the chain of
//! redirects and manager-only locate answers until a data server is named.
//! The walk is an explicit loop bounded by `max_redirects` hops.
//!
//! Recent answers are kept in a short-lived cache keyed by parent directory.
//! The cache is a hint: a data server that rejects a cached location (it
//! redirects, reports the path missing, or does not answer) causes the entry
//! to be dropped and the operation to be retried once with a fresh walk.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use xrdadmin_transport::message::{
    deserialize_message, serialize_message, ErrorCode, LocateIntent, LocateReply, LocateRequest, NodeRole,
};
use xrdadmin_transport::{CallContext, Opcode, Reply, ServerAddr, SessionPool};

use crate::config::AdminConfig;
use crate::error::{AdminError, ErrorKind, Result};
use crate::types::{LocationInfo, LogicalPath, PhysicalLocation, Role, Server};

/// Why a path is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveIntent {
    /// The path is expected to exist.
    Lookup,
    /// The path is about to be created.
    Create,
}

impl From<ResolveIntent> for LocateIntent {
    fn from(intent: ResolveIntent) -> Self {
        match intent {
            ResolveIntent::Lookup => LocateIntent::Lookup,
            ResolveIntent::Create => LocateIntent::Create,
        }
    }
}

/// Whether a cached location may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// A cache hit is acceptable.
    Cached,
    /// Always walk the redirector chain.
    Fresh,
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum hops before failing with `RedirectLoop`.
    pub max_redirects: u32,
    /// Lifetime of a cache entry.
    pub cache_ttl: Duration,
    /// Maximum cache entries.
    pub cache_max_entries: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_redirects: 16,
            cache_ttl: Duration::from_secs(5),
            cache_max_entries: 4096,
        }
    }
}

impl From<&AdminConfig> for ResolverConfig {
    fn from(config: &AdminConfig) -> Self {
        Self {
            max_redirects: config.max_redirects,
            cache_ttl: Duration::from_millis(config.location_cache_ttl_ms),
            cache_max_entries: config.location_cache_max_entries,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedLocation {
    server: Server,
    export_prefix: String,
    stored_at: Instant,
}

/// Short-TTL map from directory to the data server answering for it.
///
/// Sharded, so lookups from concurrent batch members do not contend on one
/// lock. Expired entries are dropped when looked up. When the cache is full
/// an insert first drops every expired entry, then the oldest ones, leaving
/// room for about an eighth of the capacity before the next sweep.
#[derive(Debug)]
pub struct LocationCache {
    entries: DashMap<LogicalPath, CachedLocation>,
    ttl: Duration,
    max_entries: usize,
}

impl LocationCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    fn key(path: &LogicalPath) -> LogicalPath {
        path.parent().unwrap_or_else(LogicalPath::root)
    }

    /// Cached location of `path`, if a live entry covers it.
    pub fn get(&self, path: &LogicalPath) -> Option<PhysicalLocation> {
        let key = Self::key(path);
        let found = self.entries.get(&key).and_then(|entry| {
            (entry.stored_at.elapsed() < self.ttl).then(|| PhysicalLocation {
                server: entry.server.clone(),
                internal_path: format!("{}{}", entry.export_prefix, path),
            })
        });
        if found.is_none() {
            let ttl = self.ttl;
            self.entries.remove_if(&key, |_, e| e.stored_at.elapsed() >= ttl);
        }
        found
    }

    /// Remembers where `path` was found.
    pub fn insert(&self, path: &LogicalPath, location: &PhysicalLocation) {
        if self.max_entries == 0 {
            return;
        }
        let Some(prefix) = location.internal_path.strip_suffix(path.as_str()) else {
            return;
        };
        let key = Self::key(path);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(
            key,
            CachedLocation {
                server: location.server.clone(),
                export_prefix: prefix.to_string(),
                stored_at: Instant::now(),
            },
        );
    }

    fn make_room(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        let target = self.max_entries.saturating_sub(1 + self.max_entries / 8);
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(Instant, LogicalPath)> = self
            .entries
            .iter()
            .map(|e| (e.value().stored_at, e.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(stored_at, _)| *stored_at);
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        debug!(evicted = excess, remaining = self.entries.len(), "location cache full");
    }

    /// Drops the entry covering `path`.
    pub fn invalidate(&self, path: &LogicalPath) {
        self.entries.remove(&Self::key(path));
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encodes a request body.
pub(crate) fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    serialize_message(msg).map_err(|e| AdminError::Protocol(e.to_string()))
}

/// Decodes an `Ok` reply body.
pub(crate) fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    deserialize_message(body).map_err(|e| AdminError::Protocol(e.to_string()))
}

enum Delivery {
    Done(Vec<u8>),
    Stale,
}

/// Resolves logical paths and routes requests to the owning server.
pub struct LocationResolver {
    pool: Arc<SessionPool>,
    entry_points: Vec<ServerAddr>,
    config: ResolverConfig,
    cache: LocationCache,
}

impl LocationResolver {
    /// Creates a resolver that starts every walk at one of `entry_points`.
    pub fn new(pool: Arc<SessionPool>, entry_points: Vec<ServerAddr>, config: ResolverConfig) -> Self {
        let cache = LocationCache::new(config.cache_ttl, config.cache_max_entries);
        Self {
            pool,
            entry_points,
            config,
            cache,
        }
    }

    /// Session pool used for every request.
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Location cache.
    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    /// Configured entry redirectors.
    pub fn entry_points(&self) -> &[ServerAddr] {
        &self.entry_points
    }

    /// Resolver settings.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Entry redirectors, those not marked unreachable first.
    fn ordered_entries(&self) -> Vec<ServerAddr> {
        self.pool.reachability().prefer_reachable(&self.entry_points)
    }

    fn no_entry_points() -> AdminError {
        AdminError::Unreachable {
            server: "<none>".to_string(),
            reason: "no redirector configured".to_string(),
        }
    }

    /// Sends one request and maps transport failures.
    pub async fn send(
        &self,
        server: &ServerAddr,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<Reply> {
        self.pool
            .call(server, opcode, payload, ctx)
            .await
            .map_err(|e| AdminError::from_transport(e, server))
    }

    /// Resolves `path` to the data server that owns it (or, for `Create`,
    /// the one that should create it).
    ///
    /// Fails with `NotFound`, `Unreachable` or `RedirectLoop`. On failure no
    /// location is produced.
    pub async fn resolve(
        &self,
        path: &LogicalPath,
        intent: ResolveIntent,
        freshness: Freshness,
        ctx: &CallContext,
    ) -> Result<PhysicalLocation> {
        if freshness == Freshness::Cached {
            if let Some(hit) = self.cache.get(path) {
                debug!(path = %path, server = %hit.server.addr, "location cache hit");
                return Ok(hit);
            }
            debug!(path = %path, "location cache miss");
        }

        let mut last_error = None;
        for entry in self.ordered_entries() {
            match self.walk(&entry, path, intent, ctx).await {
                Ok(location) => {
                    self.cache.insert(path, &location);
                    return Ok(location);
                }
                Err(e) if e.kind().is_transient() => {
                    warn!(path = %path, redirector = %entry, error = %e, "redirector chain failed, trying next entry point");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(Self::no_entry_points))
    }

    async fn walk(
        &self,
        entry: &ServerAddr,
        path: &LogicalPath,
        intent: ResolveIntent,
        ctx: &CallContext,
    ) -> Result<PhysicalLocation> {
        let request = LocateRequest {
            path: path.to_string(),
            intent: intent.into(),
        };
        let payload = encode(&request)?;

        let mut current = entry.clone();
        let mut hops = 0u32;
        loop {
            let next = match self.send(&current, Opcode::Locate, payload.clone(), ctx).await? {
                Reply::Ok(body) => {
                    let answer: LocateReply = decode(&body)?;
                    if let Some(data) = answer.locations.iter().find(|l| l.role == NodeRole::Server) {
                        let location = PhysicalLocation {
                            server: Server::new(ServerAddr::new(data.host.clone(), data.port), Role::Data),
                            internal_path: answer.internal_path.clone(),
                        };
                        debug!(path = %path, server = %location.server.addr, hops, "resolved");
                        return Ok(location);
                    }
                    match answer.locations.first() {
                        Some(manager) => ServerAddr::new(manager.host.clone(), manager.port),
                        None => {
                            return Err(AdminError::NotFound {
                                path: path.to_string(),
                            })
                        }
                    }
                }
                Reply::Redirect(redirect) => ServerAddr::new(redirect.host, redirect.port),
                Reply::Error(err) => return Err(AdminError::from_reply(err, path.as_str())),
                Reply::Wait(_) => {
                    return Err(AdminError::Protocol(format!(
                        "{}: unexpected wait reply",
                        current
                    )))
                }
            };
            hops += 1;
            if hops > self.config.max_redirects {
                warn!(path = %path, hops, "redirect bound exceeded");
                return Err(AdminError::RedirectLoop {
                    path: path.to_string(),
                    hops,
                });
            }
            debug!(path = %path, from = %current, to = %next, hop = hops, "following redirect");
            current = next;
        }
    }

    /// Every data server the cluster reports for `path`, following all
    /// manager branches.
    pub async fn locate_all(&self, path: &LogicalPath, ctx: &CallContext) -> Result<Vec<LocationInfo>> {
        let mut last_error = None;
        for entry in self.ordered_entries() {
            match self.deep_walk(&entry, path, ctx).await {
                Ok(found) => return Ok(found),
                Err(e) if e.kind().is_transient() => {
                    warn!(path = %path, redirector = %entry, error = %e, "deep locate failed, trying next entry point");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(Self::no_entry_points))
    }

    async fn deep_walk(
        &self,
        entry: &ServerAddr,
        path: &LogicalPath,
        ctx: &CallContext,
    ) -> Result<Vec<LocationInfo>> {
        let payload = encode(&LocateRequest {
            path: path.to_string(),
            intent: LocateIntent::Lookup,
        })?;

        let mut queue = VecDeque::from([entry.clone()]);
        let mut visited = HashSet::new();
        let mut found: Vec<LocationInfo> = Vec::new();
        let mut first_error = None;
        let mut looped = false;
        let mut hops = 0u32;

        while let Some(server) = queue.pop_front() {
            if !visited.insert(server.clone()) {
                looped = true;
                continue;
            }
            if hops > self.config.max_redirects {
                return Err(AdminError::RedirectLoop {
                    path: path.to_string(),
                    hops,
                });
            }
            hops += 1;

            let reply = match self.send(&server, Opcode::Locate, payload.clone(), ctx).await {
                Ok(reply) => reply,
                Err(e) if &server == entry => return Err(e),
                Err(e) => {
                    warn!(path = %path, server = %server, error = %e, "skipping unreachable branch");
                    first_error = first_error.or(Some(e));
                    continue;
                }
            };
            match reply {
                Reply::Ok(body) => {
                    let answer: LocateReply = decode(&body)?;
                    for loc in answer.locations {
                        let addr = ServerAddr::new(loc.host, loc.port);
                        match loc.role {
                            NodeRole::Manager => queue.push_back(addr),
                            NodeRole::Server => {
                                if found.iter().all(|f| f.server.addr != addr) {
                                    found.push(LocationInfo {
                                        server: Server::new(addr, Role::Data),
                                        internal_path: answer.internal_path.clone(),
                                        online: loc.online,
                                        writable: loc.writable,
                                    });
                                }
                            }
                        }
                    }
                }
                Reply::Redirect(redirect) => {
                    queue.push_back(ServerAddr::new(redirect.host, redirect.port));
                }
                Reply::Error(err) => {
                    first_error = first_error.or(Some(AdminError::from_reply(err, path.as_str())));
                }
                Reply::Wait(_) => {
                    first_error = first_error.or(Some(AdminError::Protocol(format!(
                        "{}: unexpected wait reply",
                        server
                    ))));
                }
            }
        }

        if !found.is_empty() {
            return Ok(found);
        }
        if looped {
            return Err(AdminError::RedirectLoop {
                path: path.to_string(),
                hops,
            });
        }
        Err(first_error.unwrap_or_else(|| AdminError::NotFound {
            path: path.to_string(),
        }))
    }

    /// Resolves `path` and sends the request built by `build` to the owning
    /// server, returning the `Ok` reply body.
    ///
    /// Redirects from a freshly resolved server are followed within the hop
    /// bound. A cached location the server rejects is invalidated and the
    /// request is retried once with a fresh resolution.
    pub async fn dispatch<F>(
        &self,
        path: &LogicalPath,
        intent: ResolveIntent,
        freshness: Freshness,
        opcode: Opcode,
        ctx: &CallContext,
        build: F,
    ) -> Result<Vec<u8>>
    where
        F: Fn(&PhysicalLocation) -> Result<Vec<u8>>,
    {
        let mut freshness = freshness;
        loop {
            let location = self.resolve(path, intent, freshness, ctx).await?;
            let payload = build(&location)?;
            match self
                .deliver(&location, path, opcode, payload, freshness, ctx)
                .await?
            {
                Delivery::Done(body) => return Ok(body),
                Delivery::Stale => {
                    debug!(path = %path, server = %location.server.addr, "cached location rejected, re-resolving");
                    self.cache.invalidate(path);
                    freshness = Freshness::Fresh;
                }
            }
        }
    }

    async fn deliver(
        &self,
        location: &PhysicalLocation,
        path: &LogicalPath,
        opcode: Opcode,
        payload: Vec<u8>,
        freshness: Freshness,
        ctx: &CallContext,
    ) -> Result<Delivery> {
        let cached = freshness == Freshness::Cached;
        let mut target = location.server.addr.clone();
        let mut hops = 0u32;
        loop {
            let reply = match self.send(&target, opcode, payload.clone(), ctx).await {
                Ok(reply) => reply,
                Err(e) if cached && e.kind() == ErrorKind::Unreachable => return Ok(Delivery::Stale),
                Err(e) => return Err(e),
            };
            match reply {
                Reply::Ok(body) => return Ok(Delivery::Done(body)),
                Reply::Error(err) if cached && err.code == ErrorCode::NotFound => {
                    return Ok(Delivery::Stale)
                }
                Reply::Error(err) => return Err(AdminError::from_reply(err, path.as_str())),
                Reply::Redirect(_) if cached => return Ok(Delivery::Stale),
                Reply::Redirect(redirect) => {
                    hops += 1;
                    if hops > self.config.max_redirects {
                        return Err(AdminError::RedirectLoop {
                            path: path.to_string(),
                            hops,
                        });
                    }
                    let next = ServerAddr::new(redirect.host, redirect.port);
                    debug!(path = %path, from = %target, to = %next, hop = hops, "data server redirected");
                    target = next;
                }
                Reply::Wait(_) => {
                    return Err(AdminError::Protocol(format!(
                        "{}: unexpected wait reply",
                        target
                    )))
                }
            }
        }
    }

    /// Sends a request that is not tied to one path to an entry redirector,
    /// following redirects. Entry points are tried in order until one
    /// answers. Returns the answering server and the `Ok` body.
    pub async fn call_entry(
        &self,
        subject: &str,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<(ServerAddr, Vec<u8>)> {
        let mut last_error = None;
        for entry in self.ordered_entries() {
            match self.follow(&entry, subject, opcode, payload.clone(), ctx).await {
                Ok(answer) => return Ok(answer),
                Err(e) if e.kind().is_transient() => {
                    warn!(redirector = %entry, %opcode, error = %e, "entry point failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(Self::no_entry_points))
    }

    async fn follow(
        &self,
        start: &ServerAddr,
        subject: &str,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<(ServerAddr, Vec<u8>)> {
        let mut current = start.clone();
        let mut hops = 0u32;
        loop {
            match self.send(&current, opcode, payload.clone(), ctx).await? {
                Reply::Ok(body) => return Ok((current, body)),
                Reply::Error(err) => return Err(AdminError::from_reply(err, subject)),
                Reply::Redirect(redirect) => {
                    hops += 1;
                    if hops > self.config.max_redirects {
                        return Err(AdminError::RedirectLoop {
                            path: subject.to_string(),
                            hops,
                        });
                    }
                    let next = ServerAddr::new(redirect.host, redirect.port);
                    debug!(from = %current, to = %next, hop = hops, %opcode, "following redirect");
                    current = next;
                }
                Reply::Wait(_) => {
                    return Err(AdminError::Protocol(format!(
                        "{}: unexpected wait reply",
                        current
                    )))
                }
            }
        }
    }
}

impl std::fmt::Debug for LocationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationResolver")
            .field("entry_points", &self.entry_points)
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .finish()
    }
}
