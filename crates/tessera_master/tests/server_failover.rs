//! Lease expiry and region reassignment.

mod common;

use common::{wait_for, wait_for_async, MockStorageServer, CONVERGE};
use tessera_master::catalog::{ColumnSpec, TableSchema};
use tessera_master::error::MasterError;
use tessera_master::server_manager::{ServerIdentity, ServerLoad};
use tessera_master::transport::MasterClient;
use tessera_master::{start_embedded_master, EmbeddedMasterConfig};

#[tokio::test(flavor = "multi_thread")]
async fn lease_expiry_moves_regions_to_a_live_server() {
    let tmp = tempfile::tempdir().unwrap();
    let master = start_embedded_master(EmbeddedMasterConfig::fast(tmp.path().join("fs")))
        .await
        .unwrap();
    let a = MockStorageServer::start(master.address()).await.unwrap();
    let b = MockStorageServer::start(master.address()).await.unwrap();
    let client = master.client();

    wait_for_async("catalog to come online", CONVERGE, || {
        let client = client.clone();
        async move {
            client
                .cluster_status()
                .await
                .map(|status| status.root_location.is_some() && status.online_meta_regions >= 1)
                .unwrap_or(false)
        }
    })
    .await;
    client
        .create_table(TableSchema::new("orders").with_family(ColumnSpec::new("data")))
        .await
        .unwrap();
    wait_for("orders region to open", CONVERGE, || {
        a.hosts_table("orders") || b.hosts_table("orders")
    })
    .await;

    // Freeze whichever server holds the root; its lease expires and every
    // region it hosted must come back up on the survivor.
    let root = client.find_root_region().await.unwrap().unwrap();
    let (victim, survivor) = if root == a.addr() { (&a, &b) } else { (&b, &a) };
    victim.pause();

    wait_for_async("failover to the surviving server", CONVERGE, || {
        let client = client.clone();
        let survivor_addr = survivor.addr();
        async move {
            client
                .cluster_status()
                .await
                .map(|status| {
                    status.servers.len() == 1 && status.root_location == Some(survivor_addr)
                })
                .unwrap_or(false)
        }
    })
    .await;
    wait_for("survivor to serve the catalog and table", CONVERGE, || {
        survivor.hosts_root() && survivor.hosts_meta() && survivor.hosts_table("orders")
    })
    .await;

    master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn report_from_unknown_identity_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let master = start_embedded_master(EmbeddedMasterConfig::fast(tmp.path().join("fs")))
        .await
        .unwrap();
    let client = MasterClient::new(master.address());

    let ghost = ServerIdentity {
        name: "127.0.0.1:19999".to_string(),
        address: "127.0.0.1:19999".parse().unwrap(),
        start_code: 42,
    };
    let err = client
        .server_report(ghost, ServerLoad::default(), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::UnknownServer(_)), "got {err:?}");
    let status = client.cluster_status().await.unwrap();
    assert!(status.servers.is_empty());

    master.shutdown().await.unwrap();
}
