//! Catalog bootstrap across master restarts.

use tessera_master::catalog::{first_meta_region_desc, root_region_desc};
use tessera_master::dfs::LocalDfs;
use tessera_master::{start_embedded_master, EmbeddedMasterConfig};

#[tokio::test(flavor = "multi_thread")]
async fn restart_reuses_the_bootstrapped_catalog() {
    let tmp = tempfile::tempdir().unwrap();
    let root_dir = tmp.path().join("fs");

    let master = start_embedded_master(EmbeddedMasterConfig::fast(root_dir.clone()))
        .await
        .unwrap();
    master.shutdown().await.unwrap();

    let dfs = LocalDfs::new(&root_dir);
    let root_name = root_region_desc().region_name();
    let rows = dfs.load_rows(&root_name).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].descriptor().unwrap(), first_meta_region_desc());

    // A second master on the same filesystem performs no catalog-altering
    // side effects: genesis is decided by existence checks alone.
    let master = start_embedded_master(EmbeddedMasterConfig::fast(root_dir.clone()))
        .await
        .unwrap();
    master.shutdown().await.unwrap();

    let rows = dfs.load_rows(&root_name).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].descriptor().unwrap(), first_meta_region_desc());
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_filesystem_version_refuses_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let root_dir = tmp.path().join("fs");

    let master = start_embedded_master(EmbeddedMasterConfig::fast(root_dir.clone()))
        .await
        .unwrap();
    master.shutdown().await.unwrap();

    std::fs::write(
        root_dir.join("tessera.version"),
        br#"{"version":"0.0-ancient"}"#,
    )
    .unwrap();

    let err = start_embedded_master(EmbeddedMasterConfig::fast(root_dir))
        .await
        .expect_err("stale filesystem version must refuse startup");
    let message = format!("{err:#}");
    assert!(
        message.contains("exited before its listener became ready"),
        "unexpected error: {message}"
    );
}
