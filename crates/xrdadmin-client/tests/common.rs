//! Shared fixtures for the integration tests: a simulated cluster with two
//! managers and two data servers, and a client configured for fast failure.

#![allow(dead_code)]

use std::sync::Arc;

use xrdadmin_client::{AdminClient, AdminConfig, RetrySettings, ServerAddr, SimCluster};
use xrdadmin_transport::Transport;

pub fn mgr1() -> ServerAddr {
    ServerAddr::new("mgr1.example.org", 1094)
}

pub fn mgr2() -> ServerAddr {
    ServerAddr::new("mgr2.example.org", 1094)
}

/// Owns the namespace root; exports without a prefix.
pub fn data1() -> ServerAddr {
    ServerAddr::new("data01.example.org", 1094)
}

/// Exports below `/export`.
pub fn data2() -> ServerAddr {
    ServerAddr::new("data02.example.org", 1094)
}

/// Short timeouts and backoff so failure paths finish quickly.
pub fn fast_config(redirectors: &[ServerAddr]) -> AdminConfig {
    AdminConfig {
        redirectors: redirectors.iter().map(|r| r.to_string()).collect(),
        request_timeout_ms: 200,
        connect_timeout_ms: 200,
        retry: RetrySettings {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter: false,
        },
        unreachable_ttl_ms: 1_000,
        ..AdminConfig::default()
    }
}

pub fn sim_cluster() -> SimCluster {
    SimCluster::builder()
        .manager(mgr1())
        .manager(mgr2())
        .data_server(data1())
        .data_server_with_export(data2(), "/export")
        .build()
}

/// Simulated cluster plus a client entering through `mgr1`.
pub struct TestCluster {
    pub sim: SimCluster,
    pub client: AdminClient,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(fast_config(&[mgr1()]))
    }

    pub fn with_config(config: AdminConfig) -> Self {
        let sim = sim_cluster();
        let client = client_for(&sim, config);
        Self { sim, client }
    }
}

pub fn client_for(sim: &SimCluster, config: AdminConfig) -> AdminClient {
    let transport: Arc<dyn Transport> = Arc::new(sim.clone());
    AdminClient::new(config, transport).expect("valid test config")
}
