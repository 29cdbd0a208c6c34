//! End-to-end tests of the admin client against a simulated cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client_for, data1, data2, fast_config, mgr1, mgr2, sim_cluster, TestCluster};
use futures::StreamExt;
use proptest::prelude::*;
use xrdadmin_client::sim::SIM_PROTOCOL_VERSION;
use xrdadmin_client::{
    AdminClient, AdminError, BlockingAdminClient, CallContext, CancelReason, CancelToken,
    CredentialSettings, ErrorKind, MkdirFlags, PermissionTriple, PrepareFlags, Priority, QueryCode,
    Role, StageState,
};
use xrdadmin_transport::{TcpTransport, Transport};

fn perms() -> PermissionTriple {
    PermissionTriple::default()
}

// ----------------------------------------------------------------------
// Metadata lifecycle
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_mkdir_stat_rmdir_stat() {
    let cluster = TestCluster::new();
    let client = &cluster.client;

    client.mkdir("/newdir", perms()).await.unwrap();
    let status = client.stat("/newdir").await.unwrap();
    assert!(status.is_dir());
    assert!(!status.is_file());

    client.rmdir("/newdir").await.unwrap();
    let err = client.stat("/newdir").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!cluster.sim.exists("/newdir"));
}

#[tokio::test]
async fn test_mkdir_parent_rules() {
    let cluster = TestCluster::new();
    let client = &cluster.client;

    let err = client.mkdir("/a/b/c", perms()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    client
        .mkdir_with("/a/b/c", perms(), MkdirFlags { make_path: true })
        .await
        .unwrap();
    assert!(cluster.sim.is_dir("/a/b"));
    assert!(cluster.sim.is_dir("/a/b/c"));

    let err = client.mkdir("/a/b/c", perms()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    client
        .mkdir_with("/a/b/c", perms(), MkdirFlags { make_path: true })
        .await
        .unwrap();

    let err = client.mkdir("/", perms()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn test_rm_rmdir_errors() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/d/f", &data1(), b"x", true).unwrap();
    let client = &cluster.client;

    assert_eq!(client.rmdir("/d").await.unwrap_err().kind(), ErrorKind::NotEmpty);
    assert_eq!(client.rmdir("/d/f").await.unwrap_err().kind(), ErrorKind::NotADirectory);
    assert_eq!(client.rm("/d").await.unwrap_err().kind(), ErrorKind::Unsupported);
    assert_eq!(client.rm("/missing").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(client.rmdir("/").await.unwrap_err().kind(), ErrorKind::Unsupported);

    client.rm("/d/f").await.unwrap();
    client.rmdir("/d").await.unwrap();
    assert!(!cluster.sim.exists("/d"));
}

#[tokio::test]
async fn test_chmod_and_truncate() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/f", &data1(), b"0123456789", true).unwrap();
    let client = &cluster.client;

    client.chmod("/f", PermissionTriple::new(7, 5, 0).unwrap()).await.unwrap();
    assert_eq!(cluster.sim.mode("/f"), Some(0o750));

    client.truncate("/f", 4).await.unwrap();
    assert_eq!(cluster.sim.file_size("/f"), Some(4));
    assert_eq!(client.stat("/f").await.unwrap().size, 4);

    let bad = PermissionTriple {
        user: 8,
        group: 0,
        other: 0,
    };
    let requests = cluster.sim.total_requests();
    assert_eq!(client.chmod("/f", bad).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(cluster.sim.total_requests(), requests);

    assert_eq!(client.chmod("/nope", perms()).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_chmod_resolves_past_a_warm_cache() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/dir/a", &data1(), b"a", true).unwrap();
    cluster.sim.add_file("/dir/b", &data1(), b"b", true).unwrap();
    let client = &cluster.client;

    client.stat("/dir/a").await.unwrap();
    let locates = cluster.sim.requests_to(&mgr1());
    client.stat("/dir/b").await.unwrap();
    assert_eq!(cluster.sim.requests_to(&mgr1()), locates);

    client.chmod("/dir/b", PermissionTriple::new(6, 4, 0).unwrap()).await.unwrap();
    assert!(cluster.sim.requests_to(&mgr1()) > locates);
    assert_eq!(cluster.sim.mode("/dir/b"), Some(0o640));
}

#[tokio::test]
async fn test_permission_denied_is_not_retried() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/protected/f", &data1(), b"", true).unwrap();
    cluster.sim.set_deny_prefix(&data1(), Some("/protected".to_string()));

    let before = cluster.sim.requests_to(&data1());
    let err = cluster.client.rm("/protected/f").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(cluster.sim.requests_to(&data1()), before + 1);
    assert!(cluster.sim.exists("/protected/f"));
}

#[tokio::test]
async fn test_mv_onto_existing_destination_changes_nothing() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/a", &data1(), b"AAAA", true).unwrap();
    cluster.sim.add_file("/b", &data1(), b"BB", true).unwrap();

    let err = cluster.client.mv("/a", "/b").await.unwrap_err();
    assert_eq!(err, AdminError::AlreadyExists { path: "/b".to_string() });
    assert_eq!(cluster.sim.file_size("/a"), Some(4));
    assert_eq!(cluster.sim.file_size("/b"), Some(2));
}

#[tokio::test]
async fn test_mv_moves_subtree() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/src/x/f", &data1(), b"f", true).unwrap();
    let client = &cluster.client;

    client.mv("/src", "/dst").await.unwrap();
    assert!(!cluster.sim.exists("/src"));
    assert!(cluster.sim.exists("/dst/x/f"));
    assert!(client.stat("/dst/x/f").await.unwrap().is_file());
    assert_eq!(client.stat("/src/x/f").await.unwrap_err().kind(), ErrorKind::NotFound);

    let err = client.mv("/dst", "/dst/x/inner").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(client.mv("/gone", "/new").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_dirlist_pages_lazily() {
    let config = xrdadmin_client::AdminConfig {
        dirlist_page_size: 2,
        ..fast_config(&[mgr1()])
    };
    let cluster = TestCluster::with_config(config);
    for name in ["e", "b", "d", "a", "c"] {
        cluster.sim.add_file(&format!("/run/{}", name), &data1(), b"", true).unwrap();
    }
    let client = &cluster.client;

    let mut listing = client.dirlist("/run").await.unwrap();
    let first = cluster.sim.requests_to(&data1());
    assert_eq!(listing.next().await.unwrap().unwrap(), "a");
    assert_eq!(listing.next().await.unwrap().unwrap(), "b");
    assert_eq!(cluster.sim.requests_to(&data1()), first);
    let mut rest = Vec::new();
    while let Some(entry) = listing.next().await {
        rest.push(entry.unwrap());
    }
    assert_eq!(rest, vec!["c", "d", "e"]);
    assert!(listing.next().await.is_none());

    let all = client.dirlist("/run").await.unwrap().collect_all().await.unwrap();
    assert_eq!(all.len(), 5);

    assert_eq!(client.dirlist("/run/a").await.unwrap_err().kind(), ErrorKind::NotADirectory);
    assert_eq!(client.dirlist("/none").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_dirlist_as_stream_and_with_details() {
    let config = xrdadmin_client::AdminConfig {
        dirlist_page_size: 2,
        ..fast_config(&[mgr1()])
    };
    let cluster = TestCluster::with_config(config);
    cluster.sim.add_file("/mix/big", &data1(), &[7u8; 40], true).unwrap();
    cluster.sim.add_file("/mix/cold", &data1(), b"", false).unwrap();
    cluster.sim.add_dir("/mix/sub", &data1()).unwrap();
    let client = &cluster.client;

    let names: Vec<String> = client
        .dirlist("/mix")
        .await
        .unwrap()
        .into_stream()
        .map(|entry| entry.unwrap())
        .collect()
        .await;
    assert_eq!(names, vec!["big", "cold", "sub"]);

    let listing = client.dirlist_with_stat("/mix").await.unwrap();
    assert!(listing.with_stat());
    let entries = listing.collect_entries().await.unwrap();
    assert_eq!(entries.len(), 3);
    let big = entries[0].status.as_ref().unwrap();
    assert_eq!(big.size, 40);
    assert!(big.is_file());
    assert!(!entries[1].status.as_ref().unwrap().is_online());
    assert!(entries[2].status.as_ref().unwrap().is_dir());

    let plain = client.dirlist("/mix").await.unwrap().collect_entries().await.unwrap();
    assert!(plain.iter().all(|e| e.status.is_none()));
}

// ----------------------------------------------------------------------
// Resolution
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_locate_against_unreachable_redirector() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/pippo.root", &data1(), b"", true).unwrap();
    cluster.sim.set_down(&mgr1(), true);

    let outcome = cluster.client.locate("pippo.root").await;
    match outcome {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Unreachable),
        Ok(location) => panic!("unexpected location {}", location),
    }
}

#[tokio::test]
async fn test_locate_anchors_relative_path() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/pippo.root", &data2(), b"", true).unwrap();

    let location = cluster.client.locate("pippo.root").await.unwrap();
    assert_eq!(location.server.addr, data2());
    assert_eq!(location.server.role, Role::Data);
    assert_eq!(location.internal_path, "/export/pippo.root");
}

#[tokio::test]
async fn test_fallback_entry_redirector() {
    let cluster = TestCluster::with_config(fast_config(&[mgr2(), mgr1()]));
    cluster.sim.add_file("/f", &data1(), b"", true).unwrap();
    cluster.sim.set_down(&mgr2(), true);

    assert!(cluster.client.stat("/f").await.unwrap().is_file());
    assert!(cluster.client.stat("/f").await.is_ok());
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/f", &data1(), b"", true).unwrap();
    cluster.sim.set_redirect(&mgr1(), Some(mgr2()));
    cluster.sim.set_redirect(&mgr2(), Some(mgr1()));

    let err = cluster.client.locate("/f").await.unwrap_err();
    assert!(matches!(err, AdminError::RedirectLoop { hops: 17, .. }));
}

#[tokio::test]
async fn test_delegation_loop_is_bounded() {
    let cluster = TestCluster::new();
    cluster.sim.set_delegates(&mgr1(), vec![mgr2()]);
    cluster.sim.set_delegates(&mgr2(), vec![mgr1()]);

    assert_eq!(cluster.client.locate("/f").await.unwrap_err().kind(), ErrorKind::RedirectLoop);
    assert_eq!(cluster.client.locate_all("/f").await.unwrap_err().kind(), ErrorKind::RedirectLoop);
}

#[tokio::test]
async fn test_locate_all_follows_delegates() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/f", &data1(), b"", false).unwrap();
    cluster.sim.add_replica("/f", &data2());
    cluster.sim.set_delegates(&mgr1(), vec![mgr2()]);

    let locations = cluster.client.locate_all("/f").await.unwrap();
    assert_eq!(locations.len(), 2);
    assert_eq!(locations[0].server.addr, data1());
    assert!(locations[0].writable);
    assert!(!locations[0].online);
    assert_eq!(locations[1].server.addr, data2());

    let location = cluster.client.locate("/f").await.unwrap();
    assert_eq!(location.server.addr, data1());
}

#[tokio::test]
async fn test_cached_location_revalidated_after_relocation() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/dir/a", &data1(), b"a", true).unwrap();
    cluster.sim.add_file("/dir/b", &data1(), b"b", true).unwrap();
    let client = &cluster.client;

    client.stat("/dir/a").await.unwrap();
    let locates = cluster.sim.requests_to(&mgr1());
    client.stat("/dir/b").await.unwrap();
    assert_eq!(cluster.sim.requests_to(&mgr1()), locates);

    cluster.sim.relocate("/dir/b", &data2());
    let status = client.stat("/dir/b").await.unwrap();
    assert_eq!(status.size, 1);
    assert!(cluster.sim.requests_to(&data2()) > 0);
}

#[tokio::test]
async fn test_busy_redirector_is_waited_for() {
    let cluster = TestCluster::new();
    cluster.sim.set_busy(&mgr1(), 3);
    cluster.client.ping().await.unwrap();
    assert_eq!(cluster.sim.requests_to(&mgr1()), 4);

    cluster.sim.set_busy(&mgr1(), 1_000);
    assert_eq!(cluster.client.ping().await.unwrap_err().kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_login_credentials() {
    let sim = sim_cluster();
    sim.set_required_token(&mgr1(), Some("s3cret".to_string()));

    let anonymous = client_for(&sim, fast_config(&[mgr1()]));
    let err = anonymous.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(sim.requests_to(&mgr1()), 0);

    let config = xrdadmin_client::AdminConfig {
        credentials: Some(CredentialSettings {
            user: Some("ops".to_string()),
            token: Some("s3cret".to_string()),
        }),
        ..fast_config(&[mgr1()])
    };
    let transport: Arc<dyn Transport> = Arc::new(sim.clone());
    let client = AdminClient::connect(config, transport).await.unwrap();
    client.ping().await.unwrap();
    assert_eq!(sim.logins_to(&mgr1()), 1);
}

#[tokio::test]
async fn test_protocol_and_connect() {
    let sim = sim_cluster();
    let transport: Arc<dyn Transport> = Arc::new(sim.clone());
    let client = AdminClient::connect(fast_config(&[mgr1()]), transport).await.unwrap();
    let info = client.protocol().await.unwrap();
    assert_eq!(info.version, SIM_PROTOCOL_VERSION);
    assert_eq!(info.role, Role::Redirector);

    sim.set_down(&mgr1(), true);
    let transport: Arc<dyn Transport> = Arc::new(sim.clone());
    let err = AdminClient::connect(fast_config(&[mgr1()]), transport).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/f", &data1(), b"", true).unwrap();
    cluster.client.stat("/f").await.unwrap();

    cluster.client.shutdown();
    let err = cluster.client.stat("/f").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Cancelled | ErrorKind::Unreachable));
}

// ----------------------------------------------------------------------
// Batches
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_batch_predicates() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/f", &data1(), b"", true).unwrap();
    cluster.sim.add_file("/tape", &data2(), b"", false).unwrap();
    cluster.sim.add_dir("/d", &data1()).unwrap();
    let client = &cluster.client;
    let paths = ["/f", "/tape", "/d", "/missing"];

    let files = client.existfiles(&paths).await.unwrap();
    assert_eq!(files.to_flags(), vec![true, true, false, false]);
    assert!(files.all_ok());

    let dirs = client.existdirs(&paths).await.unwrap();
    assert_eq!(dirs.to_flags(), vec![false, false, true, false]);

    let online = client.isfileonline(&paths).await.unwrap();
    assert_eq!(online.to_flags(), vec![true, false, true, false]);

    let stats = client.stat_many(&paths).await.unwrap();
    assert_eq!(stats.len(), 4);
    assert_eq!(stats.get(3).unwrap().as_ref().unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_empty_batch_does_no_io() {
    let cluster = TestCluster::new();
    let empty: [&str; 0] = [];
    assert!(cluster.client.existfiles(&empty).await.unwrap().is_empty());
    assert_eq!(cluster.sim.total_requests(), 0);
}

#[tokio::test]
async fn test_batch_isolates_unreachable_member() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/a", &data1(), b"", true).unwrap();
    cluster.sim.add_file("/b", &data2(), b"", true).unwrap();
    cluster.sim.add_file("/c", &data1(), b"", true).unwrap();
    cluster.sim.set_down(&data2(), true);

    let result = cluster.client.existfiles(&["/a", "/b", "/c"]).await.unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result.get(0).unwrap().as_ref().ok(), Some(&true));
    assert_eq!(result.get(1).unwrap().as_ref().unwrap_err().kind(), ErrorKind::Unreachable);
    assert_eq!(result.get(2).unwrap().as_ref().ok(), Some(&true));
    assert_eq!(result.failures().count(), 1);
}

#[tokio::test]
async fn test_batch_fails_when_no_redirector_answers() {
    let cluster = TestCluster::new();
    cluster.sim.set_down(&mgr1(), true);
    let err = cluster.client.existfiles(&["/a"]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[tokio::test]
async fn test_batch_deadline_cancels_pending_members() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/fast/one", &data2(), b"", true).unwrap();
    cluster.sim.add_file("/fast/two", &data2(), b"", true).unwrap();
    cluster.sim.add_file("/slow/s", &data1(), b"", true).unwrap();
    cluster.sim.set_hung(&data1(), true);

    let ctx = CallContext::with_timeout(Duration::from_millis(100));
    let result = cluster
        .client
        .stat_many_with(&["/fast/one", "/slow/s", "/fast/two"], &ctx)
        .await
        .unwrap();
    assert_eq!(result.len(), 3);
    assert!(result.get(0).unwrap().is_ok());
    assert_eq!(
        result.get(1).unwrap().as_ref().unwrap_err(),
        &AdminError::Cancelled {
            reason: CancelReason::DeadlineExceeded
        }
    );
    assert!(result.get(2).unwrap().is_ok());
}

#[tokio::test]
async fn test_batch_user_cancellation() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/fast/f", &data2(), b"", true).unwrap();
    cluster.sim.add_file("/slow/s", &data1(), b"", true).unwrap();
    cluster.sim.set_hung(&data1(), true);

    let token = CancelToken::new();
    let ctx = CallContext::new().with_cancel(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel(CancelReason::UserRequested);
    });
    let result = cluster.client.existfiles_with(&["/slow/s", "/fast/f"], &ctx).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(
        result.get(0).unwrap().as_ref().unwrap_err(),
        &AdminError::Cancelled {
            reason: CancelReason::UserRequested
        }
    );
    assert_eq!(result.get(1).unwrap().as_ref().ok(), Some(&true));
}

#[derive(Debug, Clone, Copy)]
enum Member {
    File,
    Dir,
    Missing,
    Malformed,
}

impl Member {
    fn path(self, i: usize) -> String {
        match self {
            Member::File => format!("/store/file{}", i % 3),
            Member::Dir => "/store".to_string(),
            Member::Missing => format!("/store/missing{}", i),
            Member::Malformed => format!("/store/../x{}", i),
        }
    }
}

fn member() -> impl Strategy<Value = Member> {
    prop_oneof![
        Just(Member::File),
        Just(Member::Dir),
        Just(Member::Missing),
        Just(Member::Malformed),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_existfiles_is_positionally_aligned(members in prop::collection::vec(member(), 0..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let paths: Vec<String> = members.iter().enumerate().map(|(i, p)| p.path(i)).collect();

        let result = runtime.block_on(async {
            let cluster = TestCluster::new();
            for i in 0..3 {
                let owner = if i % 2 == 0 { data1() } else { data2() };
                cluster.sim.add_file(&format!("/store/file{}", i), &owner, b"", true).unwrap();
            }
            cluster.client.existfiles(&paths).await.unwrap()
        });

        prop_assert_eq!(result.len(), members.len());
        for (member, outcome) in members.iter().zip(result.iter()) {
            match member {
                Member::File => prop_assert_eq!(outcome.as_ref().ok(), Some(&true)),
                Member::Dir | Member::Missing => prop_assert_eq!(outcome.as_ref().ok(), Some(&false)),
                Member::Malformed => prop_assert_eq!(
                    outcome.as_ref().unwrap_err().kind(),
                    ErrorKind::InvalidPath
                ),
            }
        }
    }
}

// ----------------------------------------------------------------------
// Staging and checksums
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_prepare_twice_with_overlap() {
    let cluster = TestCluster::new();
    for p in ["/tape/p1", "/tape/p2", "/tape/p3"] {
        cluster.sim.add_file(p, &data2(), b"", false).unwrap();
    }
    cluster.sim.add_file("/disk/online", &data1(), b"", true).unwrap();
    let client = &cluster.client;

    let first = client
        .prepare(&["/tape/p1", "/tape/p2"], PrepareFlags::STAGE, Priority::High)
        .await
        .unwrap();
    let second = client
        .prepare(&["/tape/p1", "/tape/p3", "/disk/online", "/tape/nope"], PrepareFlags::STAGE, Priority::High)
        .await
        .unwrap();
    assert_ne!(first.request_id, second.request_id);
    assert_eq!(cluster.sim.staging_queue(), vec!["/tape/p1", "/tape/p2", "/tape/p3"]);

    client
        .prepare(&["/tape/p2"], PrepareFlags::CANCEL, Priority::Low)
        .await
        .unwrap();
    assert_eq!(cluster.sim.staging_queue(), vec!["/tape/p1", "/tape/p3"]);
}

#[tokio::test]
async fn test_prepare_failures() {
    let cluster = TestCluster::new();
    let empty: [&str; 0] = [];
    let err = cluster
        .client
        .prepare(&empty, PrepareFlags::STAGE, Priority::Normal)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    cluster.sim.set_down(&mgr1(), true);
    let err = cluster
        .client
        .prepare(&["/a"], PrepareFlags::STAGE, Priority::Normal)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[tokio::test]
async fn test_checksum_is_stable() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/data/file.root", &data2(), b"payload", true).unwrap();
    let client = &cluster.client;

    let first = client.getchecksum("/data/file.root").await.unwrap();
    let second = client.getchecksum("/data/file.root").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, format!("{:08x}", crc32fast::hash(b"payload")));

    let record = client.checksum_record("/data/file.root").await.unwrap();
    assert_eq!(record.algorithm, "crc32");
    assert_eq!(record.digest, first);

    cluster.sim.write_file("/data/file.root", b"changed");
    assert_ne!(client.getchecksum("/data/file.root").await.unwrap(), first);

    assert_eq!(client.getchecksum("/data").await.unwrap_err().kind(), ErrorKind::Unsupported);
    assert_eq!(client.getchecksum("/data/none").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_prepare_status_follows_staging() {
    let cluster = TestCluster::new();
    for p in ["/tape/s1", "/tape/s2"] {
        cluster.sim.add_file(p, &data2(), b"", false).unwrap();
    }
    let client = &cluster.client;

    let receipt = client
        .prepare(&["/tape/s1", "/tape/s2", "/tape/gone"], PrepareFlags::STAGE, Priority::Normal)
        .await
        .unwrap();
    let status = client.prepare_status(&receipt).await.unwrap();
    assert_eq!(status.request_id, receipt.request_id);
    let states: Vec<_> = status.files.iter().map(|f| f.state).collect();
    assert_eq!(states, vec![StageState::Queued, StageState::Queued, StageState::Missing]);
    assert!(!status.is_complete());

    cluster.sim.set_online("/tape/s1", true);
    client
        .prepare(&["/tape/s2"], PrepareFlags::CANCEL, Priority::Low)
        .await
        .unwrap();
    let status = client.prepare_status(&receipt).await.unwrap();
    assert_eq!(status.files[0].state, StageState::Online);
    assert_eq!(status.files[1].state, StageState::Offline);

    let unknown = xrdadmin_client::PrepareReceipt {
        request_id: "sim-404".to_string(),
    };
    assert_eq!(client.prepare_status(&unknown).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_stat_vfs_reports_cluster_space() {
    let cluster = TestCluster::new();
    cluster.sim.set_space(&data1(), 10_000, 4_000, false);
    cluster.sim.set_space(&data2(), 10_000, 9_000, false);
    let client = &cluster.client;

    let space = client.stat_vfs("/").await.unwrap();
    assert_eq!(space.nodes_rw, 2);
    assert_eq!(space.free_rw_mb, 9_000);
    assert_eq!(space.utilization_rw, 10);
    assert_eq!(space.nodes_staging, 0);

    cluster.sim.set_down(&data2(), true);
    let space = client.stat_vfs("/store").await.unwrap();
    assert_eq!(space.nodes_rw, 1);
    assert_eq!(space.free_rw_mb, 4_000);
    assert_eq!(space.utilization_rw, 60);

    cluster.sim.set_redirect(&mgr1(), Some(mgr2()));
    let before = cluster.sim.requests_to(&mgr2());
    assert_eq!(client.stat_vfs("/").await.unwrap().nodes_rw, 1);
    assert_eq!(cluster.sim.requests_to(&mgr2()), before + 1);
}

#[tokio::test]
async fn test_query_routes_by_code() {
    let cluster = TestCluster::new();
    cluster.sim.add_file("/q/owned", &data2(), b"abc", true).unwrap();
    let client = &cluster.client;

    let config = client.query(QueryCode::Config, "role version").await.unwrap();
    assert_eq!(config, format!("manager\n{}", SIM_PROTOCOL_VERSION));

    let space = client.query(QueryCode::Space, "default").await.unwrap();
    assert!(space.starts_with("oss.cgroup=default&oss.space="));
    assert_eq!(client.query(QueryCode::Space, "scratch").await.unwrap_err().kind(), ErrorKind::NotFound);

    let stats = client.query(QueryCode::Stats, "").await.unwrap();
    assert!(stats.starts_with("requests="));

    let data_requests = cluster.sim.requests_to(&data2());
    let xattr = client.query(QueryCode::XAttr, "/q/owned").await.unwrap();
    assert!(xattr.contains(&format!("owner={}", data2())));
    assert!(cluster.sim.requests_to(&data2()) > data_requests);

    assert_eq!(client.query(QueryCode::XAttr, "/q/none").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(client.query(QueryCode::Visa, "/q/owned").await.unwrap_err().kind(), ErrorKind::Unsupported);
    assert_eq!(client.query(QueryCode::XAttr, "/q/../x").await.unwrap_err().kind(), ErrorKind::InvalidPath);
    assert_eq!(client.query(QueryCode::Opaque, "x").await.unwrap_err().kind(), ErrorKind::Unsupported);
}

// ----------------------------------------------------------------------
// Blocking facade and TCP
// ----------------------------------------------------------------------

#[test]
fn test_blocking_client() {
    let sim = sim_cluster();
    for name in ["x", "y"] {
        sim.add_file(&format!("/blk/{}", name), &data1(), b"", true).unwrap();
    }
    let transport: Arc<dyn Transport> = Arc::new(sim.clone());
    let client = BlockingAdminClient::connect(fast_config(&[mgr1()]), transport).unwrap();

    assert!(client.stat("/blk").unwrap().is_dir());
    let names: Vec<String> = client.dirlist("/blk").unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(names, vec!["x", "y"]);
    assert_eq!(client.existdirs(&["/blk", "/blk/x"]).unwrap().to_flags(), vec![true, false]);

    let result = client.stat_many_within(&["/blk/x"], Duration::from_secs(5)).unwrap();
    assert!(result.all_ok());
    client.shutdown();
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let mgr_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mgr = xrdadmin_client::ServerAddr::new("127.0.0.1", mgr_listener.local_addr().unwrap().port());
    let data = xrdadmin_client::ServerAddr::new("127.0.0.1", data_listener.local_addr().unwrap().port());

    let sim = xrdadmin_client::SimCluster::builder()
        .manager(mgr.clone())
        .data_server(data.clone())
        .build();
    sim.add_file("/tcp/file", &data, b"over the wire", true).unwrap();

    let stop = CancelToken::new();
    let servers = vec![
        tokio::spawn({
            let sim = sim.clone();
            let stop = stop.clone();
            let mgr = mgr.clone();
            async move { sim.serve_node(mgr, mgr_listener, stop).await }
        }),
        tokio::spawn({
            let sim = sim.clone();
            let stop = stop.clone();
            let data = data.clone();
            async move { sim.serve_node(data, data_listener, stop).await }
        }),
    ];

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let client = AdminClient::connect(fast_config(&[mgr.clone()]), transport).await.unwrap();

    client.mkdir("/tcp/sub", perms()).await.unwrap();
    assert!(client.stat("/tcp/sub").await.unwrap().is_dir());
    let flags = client.existfiles(&["/tcp/file", "/tcp/sub"]).await.unwrap().to_flags();
    assert_eq!(flags, vec![true, false]);
    assert_eq!(
        client.getchecksum("/tcp/file").await.unwrap(),
        format!("{:08x}", crc32fast::hash(b"over the wire"))
    );
    assert!(client.stats().metrics.sessions_opened >= 2);

    client.shutdown();
    stop.cancel(CancelReason::Shutdown);
    for server in servers {
        server.await.unwrap().unwrap();
    }
}
