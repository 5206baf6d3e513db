use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use undermoon_broker::broker::{
    JsonFileStorage, JsonMetaReplicator, MemBrokerConfig, MemBrokerService, MetaPersistence,
    MetaStore, MetaStoreError, MigrationStatus, MockProxyEpochFetcher, MockSlotTransfer,
    ProxyResourcePayload, SlotTransfer, TransferOutcome,
};
use undermoon_broker::common::cluster::Role;
use undermoon_broker::common::utils::SLOT_NUM;

const CLUSTER_NAME: &str = "mycluster";

fn gen_filename() -> String {
    let filename = format!("undermoon-broker-test-{}.json", Utc::now().timestamp_nanos());
    std::env::temp_dir()
        .join(filename)
        .to_string_lossy()
        .to_string()
}

fn gen_config(meta_filename: String, auto_update_meta_file: bool) -> MemBrokerConfig {
    MemBrokerConfig {
        address: "127.0.0.1:7799".to_string(),
        failure_ttl: 60,
        failure_quorum: 1,
        migration_limit: 2,
        recover_from_meta_file: true,
        meta_filename,
        auto_update_meta_file,
        update_meta_file_interval: None,
        replica_addresses: Arc::new(ArcSwap::new(Arc::new(vec![]))),
        sync_meta_interval: None,
        proxy_sync_timeout: Duration::from_millis(500),
        debug: false,
    }
}

fn gen_transfer() -> MockSlotTransfer {
    let mut transfer = MockSlotTransfer::new();
    transfer
        .expect_transfer()
        .returning(|_| Box::pin(async { Ok(TransferOutcome::Transferred) }));
    transfer
}

// The proxies catch up with any epoch only after `synced` is set.
fn gen_fetcher(synced: Arc<AtomicBool>) -> MockProxyEpochFetcher {
    let mut fetcher = MockProxyEpochFetcher::new();
    fetcher.expect_fetch_epoch().returning(move |_| {
        if synced.load(Ordering::SeqCst) {
            Ok(u64::MAX)
        } else {
            Ok(0)
        }
    });
    fetcher
}

fn gen_service_with(
    config: MemBrokerConfig,
    synced: Arc<AtomicBool>,
    last_meta_store: Option<MetaStore>,
) -> MemBrokerService {
    let persistence = Arc::new(JsonFileStorage::new(config.meta_filename.clone()));
    let replicator = Arc::new(JsonMetaReplicator::new(
        config.replica_addresses.clone(),
        reqwest::Client::new(),
    ));
    let transfer: Arc<dyn SlotTransfer> = Arc::new(gen_transfer());
    MemBrokerService::new(
        config,
        persistence,
        replicator,
        Arc::new(gen_fetcher(synced)),
        Some(transfer),
        last_meta_store,
    )
    .unwrap()
}

fn gen_service(synced: Arc<AtomicBool>) -> MemBrokerService {
    gen_service_with(gen_config(gen_filename(), false), synced, None)
}

async fn add_proxies(service: &MemBrokerService, host_num: usize, proxy_per_host: usize) {
    for host in 1..=host_num {
        for i in 0..proxy_per_host {
            let payload = ProxyResourcePayload {
                proxy_address: format!("127.0.0.{}:70{:02}", host, i),
                nodes: [
                    format!("127.0.0.{}:60{:02}", host, i * 2),
                    format!("127.0.0.{}:60{:02}", host, i * 2 + 1),
                ],
                host: None,
            };
            service.add_proxy(payload).await.unwrap();
        }
    }
}

async fn check_balanced(service: &MemBrokerService, master_num: usize) {
    let cluster = service
        .get_cluster_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    let mut total = 0;
    let mut counts = vec![];
    for node in cluster.get_nodes() {
        if node.get_role() != Role::Master {
            continue;
        }
        let count: usize = node
            .get_slots()
            .iter()
            .map(|slot_range| slot_range.get_range_list().get_slots_num())
            .sum();
        total += count;
        if count > 0 {
            counts.push(count);
        }
    }
    assert_eq!(total, SLOT_NUM);
    assert_eq!(counts.len(), master_num);
    let max_count = *counts.iter().max().unwrap();
    let min_count = *counts.iter().min().unwrap();
    assert!(max_count - min_count <= 1);
    service.check_metadata().await.unwrap();
}

#[tokio::test]
async fn test_auto_scale_out() {
    let service = gen_service(Arc::new(AtomicBool::new(true)));
    add_proxies(&service, 4, 2).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();

    service
        .auto_scale_node_number(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();
    let status = service.wait_for_migration(CLUSTER_NAME).await;
    assert_eq!(status, Some(MigrationStatus::Done));

    let info = service
        .get_cluster_info_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.node_number, 8);
    assert_eq!(info.node_number_with_slots, 8);
    assert!(!info.is_migrating);
    check_balanced(&service, 4).await;

    // Already there.
    service
        .auto_scale_node_number(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_auto_scale_out_proxy_not_sync() {
    let synced = Arc::new(AtomicBool::new(false));
    let service = gen_service(synced.clone());
    add_proxies(&service, 4, 2).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();

    let err = service
        .auto_scale_node_number(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap_err();
    assert_eq!(err, MetaStoreError::ProxyNotSync);

    // The added nodes stay but the cluster is no longer blocked.
    let info = service
        .get_cluster_info_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.node_number, 8);
    assert_eq!(info.node_number_with_slots, 4);
    assert!(!info.is_migrating);
    service
        .change_config(CLUSTER_NAME.to_string(), Default::default())
        .await
        .unwrap();

    synced.store(true, Ordering::SeqCst);
    service
        .auto_scale_node_number(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();
    let status = service.wait_for_migration(CLUSTER_NAME).await;
    assert_eq!(status, Some(MigrationStatus::Done));
    let info = service
        .get_cluster_info_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.node_number, 8);
    assert_eq!(info.node_number_with_slots, 8);
    check_balanced(&service, 4).await;
}

#[tokio::test]
async fn test_auto_scale_in() {
    let service = gen_service(Arc::new(AtomicBool::new(true)));
    add_proxies(&service, 4, 2).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();

    service
        .auto_scale_node_number(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();
    let status = service.wait_for_migration(CLUSTER_NAME).await;
    assert_eq!(status, Some(MigrationStatus::Done));

    let info = service
        .get_cluster_info_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.node_number, 8);
    assert_eq!(info.node_number_with_slots, 4);

    service
        .auto_delete_free_nodes(CLUSTER_NAME.to_string())
        .await
        .unwrap();
    let info = service
        .get_cluster_info_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.node_number, 4);
    check_balanced(&service, 2).await;

    let check_res = service.check_resource_for_failures().await.unwrap();
    assert!(check_res.is_empty());
}

#[tokio::test]
async fn test_migration_blocks_scaling() {
    let service = gen_service(Arc::new(AtomicBool::new(true)));
    add_proxies(&service, 4, 4).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();
    service
        .migrate_slots_to_scale_down(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();

    // Either still running or already done.
    match service
        .auto_add_nodes(CLUSTER_NAME.to_string(), 4)
        .await
    {
        Ok(nodes) => assert_eq!(nodes.len(), 4),
        Err(err) => assert_eq!(err, MetaStoreError::MigrationRunning),
    }
    let status = service.wait_for_migration(CLUSTER_NAME).await;
    assert_eq!(status, Some(MigrationStatus::Done));
}

#[tokio::test]
async fn test_persist_and_recover() {
    let filename = gen_filename();
    let config = gen_config(filename.clone(), true);
    let service = gen_service_with(config, Arc::new(AtomicBool::new(true)), None);
    add_proxies(&service, 4, 2).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();
    service.trigger_update().await.unwrap();
    let epoch = service.get_epoch().await.unwrap();

    let persistence = JsonFileStorage::new(filename.clone());
    let last_meta_store = persistence.load().await.unwrap().unwrap();
    let recovered = gen_service_with(
        gen_config(filename.clone(), false),
        Arc::new(AtomicBool::new(true)),
        Some(last_meta_store),
    );
    recovered.init().await.unwrap();
    assert_eq!(recovered.get_epoch().await.unwrap(), epoch);
    let recovered_cluster = recovered.get_cluster_by_name(CLUSTER_NAME).await.unwrap();
    let cluster = service.get_cluster_by_name(CLUSTER_NAME).await.unwrap();
    assert_eq!(
        serde_json::to_value(&recovered_cluster).unwrap(),
        serde_json::to_value(&cluster).unwrap()
    );
    recovered.check_metadata().await.unwrap();

    tokio::fs::remove_file(filename).await.unwrap();
}

#[tokio::test]
async fn test_init_resets_stale_scaling_and_resumes_migration() {
    let source = gen_service(Arc::new(AtomicBool::new(true)));
    add_proxies(&source, 4, 2).await;
    source
        .add_cluster(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();
    let mut store = (*source.get_all_data().await.unwrap()).clone();
    store
        .migrate_slots_to_scale_down(CLUSTER_NAME.to_string(), 4)
        .unwrap();
    assert!(
        store
            .get_cluster_info_by_name(CLUSTER_NAME)
            .unwrap()
            .is_migrating
    );

    let service = gen_service_with(
        gen_config(gen_filename(), false),
        Arc::new(AtomicBool::new(true)),
        Some(store),
    );
    service.init().await.unwrap();
    let status = service.wait_for_migration(CLUSTER_NAME).await;
    assert_eq!(status, Some(MigrationStatus::Done));
    let info = service
        .get_cluster_info_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.node_number_with_slots, 4);
}

#[tokio::test]
async fn test_remove_cluster_drops_migration_status() {
    let service = gen_service(Arc::new(AtomicBool::new(true)));
    add_proxies(&service, 4, 2).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 8)
        .await
        .unwrap();
    service
        .migrate_slots_to_scale_down(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();
    let status = service.wait_for_migration(CLUSTER_NAME).await;
    assert_eq!(status, Some(MigrationStatus::Done));
    assert!(service.get_migration_status(CLUSTER_NAME).is_some());

    service
        .remove_cluster(CLUSTER_NAME.to_string())
        .await
        .unwrap();
    assert!(service.get_migration_status(CLUSTER_NAME).is_none());
    assert!(service.wait_for_migration(CLUSTER_NAME).await.is_none());
}

#[tokio::test]
async fn test_failover_and_recover_epoch() {
    let service = gen_service(Arc::new(AtomicBool::new(true)));
    add_proxies(&service, 4, 2).await;
    service
        .add_cluster(CLUSTER_NAME.to_string(), 4)
        .await
        .unwrap();

    let cluster = service
        .get_cluster_by_name(CLUSTER_NAME)
        .await
        .unwrap()
        .unwrap();
    let failed_address = cluster.get_nodes()[0].get_proxy_address().to_string();
    service
        .add_failure(failed_address.clone(), "coordinator1".to_string())
        .await
        .unwrap();
    assert_eq!(
        service.get_failures().await.unwrap(),
        vec![failed_address.clone()]
    );

    let proxy = service
        .replace_failed_proxy(failed_address.clone())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(proxy.get_address(), failed_address);
    assert_eq!(
        service.get_failed_proxies().await.unwrap(),
        vec![failed_address.clone()]
    );
    service.check_metadata().await.unwrap();

    let epoch = service.get_epoch().await.unwrap();
    service.force_bump_all_epoch(epoch + 10).await.unwrap();
    assert_eq!(service.get_epoch().await.unwrap(), epoch + 10);
    let err = service.force_bump_all_epoch(epoch).await.unwrap_err();
    assert_eq!(err, MetaStoreError::SmallEpoch);
}
