use super::epoch::{fetch_max_epoch, wait_for_proxy_epoch, EpochFetchResult, ProxyEpochFetcher};
use super::orchestrator::{MigrationOrchestrator, MigrationStatus, ProxyCommitWatcher, SlotTransfer};
use super::persistence::MetaPersistence;
use super::replication::MetaReplicator;
use super::resource::ResourceChecker;
use super::storage::{MemoryStorage, MetaStorage};
use super::store::{ClusterInfo, MetaStore, MetaStoreError, NODES_PER_PROXY};
use crate::common::cluster::{Cluster, ClusterName, MigrationTaskMeta, Node, Proxy};
use arc_swap::ArcSwap;
use scopeguard::ScopeGuard;
use futures::Future;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

const PROXY_EPOCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_SCALING_RETRY_TIMES: usize = 10;
const STOP_SCALING_RETRY_INTERVAL: Duration = Duration::from_millis(20);

pub type ReplicaAddresses = Arc<ArcSwap<Vec<String>>>;

#[derive(Debug, Clone)]
pub struct MemBrokerConfig {
    pub address: String,
    pub failure_ttl: u64, // in seconds
    pub failure_quorum: u64,
    pub migration_limit: u64,
    pub recover_from_meta_file: bool,
    pub meta_filename: String,
    pub auto_update_meta_file: bool,
    pub update_meta_file_interval: Option<NonZeroU64>,
    pub replica_addresses: ReplicaAddresses,
    pub sync_meta_interval: Option<NonZeroU64>,
    pub proxy_sync_timeout: Duration,
    pub debug: bool,
}

impl MemBrokerConfig {
    pub fn update(&self, config_payload: MemBrokerConfigPayload) -> Result<(), MetaStoreError> {
        let MemBrokerConfigPayload { replica_addresses } = config_payload;
        self.replica_addresses.store(Arc::new(replica_addresses));
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemBrokerConfigPayload {
    pub replica_addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyResourcePayload {
    pub proxy_address: String,
    pub nodes: [String; NODES_PER_PROXY],
    pub host: Option<String>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MemBrokerService {
    config: MemBrokerConfig,
    #[derivative(Debug = "ignore")]
    storage: Arc<dyn MetaStorage>,
    #[derivative(Debug = "ignore")]
    orchestrator: MigrationOrchestrator,
    #[derivative(Debug = "ignore")]
    epoch_fetcher: Arc<dyn ProxyEpochFetcher>,
    #[derivative(Debug = "ignore")]
    meta_persistence: Arc<dyn MetaPersistence + Send + Sync + 'static>,
    #[derivative(Debug = "ignore")]
    meta_replicator: Arc<dyn MetaReplicator + Send + Sync + 'static>,
}

impl MemBrokerService {
    // Without `slot_transfer` the workflow waits for the server proxies to commit the tasks.
    pub fn new(
        config: MemBrokerConfig,
        meta_persistence: Arc<dyn MetaPersistence + Send + Sync + 'static>,
        meta_replicator: Arc<dyn MetaReplicator + Send + Sync + 'static>,
        epoch_fetcher: Arc<dyn ProxyEpochFetcher>,
        slot_transfer: Option<Arc<dyn SlotTransfer>>,
        last_meta_store: Option<MetaStore>,
    ) -> Result<Self, MetaStoreError> {
        info!("config: {:?}", config);
        let mut meta_store = MetaStore::new();
        if let Some(last) = last_meta_store {
            info!("restore metadata");
            meta_store.restore(last)?;
        }

        let storage: Arc<dyn MetaStorage> = Arc::new(MemoryStorage::new(meta_store));
        let slot_transfer: Arc<dyn SlotTransfer> = match slot_transfer {
            Some(slot_transfer) => slot_transfer,
            None => Arc::new(ProxyCommitWatcher::new(
                storage.clone(),
                MIGRATION_POLL_INTERVAL,
            )),
        };
        let orchestrator = MigrationOrchestrator::new(
            storage.clone(),
            slot_transfer,
            config.migration_limit as usize,
        );

        let service = Self {
            config,
            storage,
            orchestrator,
            epoch_fetcher,
            meta_persistence,
            meta_replicator,
        };
        Ok(service)
    }

    // Picks up what the last process left behind.
    pub async fn init(&self) -> Result<(), MetaStoreError> {
        let reset_clusters = self.storage.reset_stale_scaling().await?;
        for cluster_name in reset_clusters.iter() {
            warn!(
                "cluster {} was left changing its node number, reset it to idle",
                cluster_name
            );
        }
        let recovered = self.orchestrator.recover_workflows().await?;
        if !recovered.is_empty() {
            warn!("recovered migration workflows: {:?}", recovered);
        }
        if !reset_clusters.is_empty() {
            self.trigger_update().await?;
        }
        Ok(())
    }

    pub fn get_config(&self) -> &MemBrokerConfig {
        &self.config
    }

    pub async fn trigger_update(&self) -> Result<(), MetaStoreError> {
        if self.config.auto_update_meta_file {
            self.update_meta_file().await?;
        }
        Ok(())
    }

    pub async fn update_meta_file(&self) -> Result<(), MetaStoreError> {
        let store = self.storage.get_all_metadata().await?;
        self.meta_persistence
            .store(store)
            .await
            .map_err(MetaStoreError::SyncError)
    }

    pub async fn sync_meta(&self) -> Result<(), MetaStoreError> {
        if self.config.replica_addresses.load().is_empty() {
            return Ok(());
        }
        let store = self.storage.get_all_metadata().await?;
        self.meta_replicator
            .sync_meta(store)
            .await
            .map_err(MetaStoreError::SyncError)
    }

    pub async fn get_all_data(&self) -> Result<Arc<MetaStore>, MetaStoreError> {
        self.storage.get_all_metadata().await
    }

    pub async fn restore_metadata(&self, meta_store: MetaStore) -> Result<(), MetaStoreError> {
        self.storage.restore_metadata(meta_store).await
    }

    pub async fn get_proxy_addresses(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, MetaStoreError> {
        self.storage.get_proxy_addresses(offset, limit).await
    }

    pub async fn get_proxy_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Proxy>, MetaStoreError> {
        self.storage.get_proxy_by_address(address).await
    }

    pub async fn get_cluster_names(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<ClusterName>, MetaStoreError> {
        self.storage.get_cluster_names(offset, limit).await
    }

    pub async fn get_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, MetaStoreError> {
        self.storage.get_cluster_by_name(name).await
    }

    pub async fn get_cluster_info_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ClusterInfo>, MetaStoreError> {
        self.storage.get_cluster_info_by_name(name).await
    }

    pub async fn add_proxy(
        &self,
        proxy_resource: ProxyResourcePayload,
    ) -> Result<(), MetaStoreError> {
        let ProxyResourcePayload {
            proxy_address,
            nodes,
            host,
        } = proxy_resource;
        self.storage.add_proxy(proxy_address, nodes, host).await
    }

    pub async fn add_cluster(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.storage.add_cluster(cluster_name, node_num).await
    }

    pub async fn remove_cluster(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.storage.remove_cluster(cluster_name.clone()).await?;
        self.orchestrator.remove_workflow(&cluster_name);
        Ok(())
    }

    pub async fn auto_add_nodes(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.storage.auto_add_nodes(cluster_name, node_num).await
    }

    pub async fn auto_scale_up_nodes(
        &self,
        cluster_name: String,
        cluster_node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.storage
            .auto_scale_up_nodes(cluster_name, cluster_node_num)
            .await
    }

    pub async fn auto_delete_free_nodes(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.storage.auto_delete_free_nodes(cluster_name).await
    }

    pub async fn change_config(
        &self,
        cluster_name: String,
        config: HashMap<String, String>,
    ) -> Result<(), MetaStoreError> {
        self.storage.change_config(cluster_name, config).await
    }

    pub async fn balance_masters(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.storage.balance_masters(cluster_name).await
    }

    pub async fn remove_proxy(&self, proxy_address: String) -> Result<(), MetaStoreError> {
        self.storage.remove_proxy(proxy_address).await
    }

    pub async fn check_resource_for_failures(&self) -> Result<Vec<String>, MetaStoreError> {
        let store = self.storage.get_all_metadata().await?;
        let checker = ResourceChecker::new(store);
        checker.check_failure_tolerance()
    }

    pub fn change_broker_config(
        &self,
        config_payload: MemBrokerConfigPayload,
    ) -> Result<(), MetaStoreError> {
        self.config.update(config_payload)?;
        Ok(())
    }

    pub fn get_broker_config(&self) -> Result<MemBrokerConfigPayload, MetaStoreError> {
        let payload = MemBrokerConfigPayload {
            replica_addresses: (*self.config.replica_addresses.load_full()).clone(),
        };
        Ok(payload)
    }

    pub async fn migrate_slots(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.orchestrator.start_expand(cluster_name).await
    }

    pub async fn migrate_slots_to_scale_down(
        &self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.orchestrator
            .start_shrink(cluster_name, new_node_num)
            .await
    }

    pub fn get_migration_status(&self, cluster_name: &str) -> Option<MigrationStatus> {
        self.orchestrator.get_migration_status(cluster_name)
    }

    pub async fn resume_migration(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.orchestrator.resume_migration(cluster_name).await
    }

    pub async fn wait_for_migration(&self, cluster_name: &str) -> Option<MigrationStatus> {
        self.orchestrator.wait_for_migration(cluster_name).await
    }

    // Growing takes two transactions. Between them the cluster is marked as changing
    // so that no other scaling or migration can start, and the new proxies get the
    // chance to pick up their new roles before any slot moves to them.
    pub async fn auto_scale_node_number(
        &self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError> {
        defer!(debug!("auto scaling of cluster {} returns", cluster_name));

        let info = self
            .storage
            .get_cluster_info_by_name(&cluster_name)
            .await?
            .ok_or(MetaStoreError::ClusterNotFound)?;
        // Nodes added by an interrupted scaling still need their slots.
        if new_node_num == info.node_number && info.node_number_with_slots == info.node_number {
            info!(
                "cluster {} already has {} nodes, skip scaling",
                cluster_name, new_node_num
            );
            return Ok(());
        }
        if new_node_num < info.node_number {
            return self
                .orchestrator
                .start_shrink(cluster_name.clone(), new_node_num)
                .await;
        }

        let (proxy_addresses, cluster_epoch) = self
            .storage
            .start_scaling_out(cluster_name.clone(), new_node_num)
            .await?;

        // Clears the flag if this request is dropped before it finishes.
        let storage = self.storage.clone();
        let name = cluster_name.clone();
        let stop_guard = scopeguard::guard((), move |()| {
            tokio::spawn(async move {
                stop_scaling(storage.as_ref(), name).await;
            });
        });

        let wait = wait_for_proxy_epoch(
            self.epoch_fetcher.as_ref(),
            proxy_addresses,
            cluster_epoch,
            PROXY_EPOCH_POLL_INTERVAL,
        );
        if tokio::time::timeout(self.config.proxy_sync_timeout, wait)
            .await
            .is_err()
        {
            error!(
                "proxies of cluster {} did not reach epoch {} in {:?}",
                cluster_name, cluster_epoch, self.config.proxy_sync_timeout
            );
            ScopeGuard::into_inner(stop_guard);
            stop_scaling(self.storage.as_ref(), cluster_name.clone()).await;
            return Err(MetaStoreError::ProxyNotSync);
        }

        let res = self
            .orchestrator
            .start_expand_after_scaling(cluster_name.clone())
            .await;
        ScopeGuard::into_inner(stop_guard);
        if let Err(err) = &res {
            error!(
                "failed to start migration after scaling out cluster {}: {}",
                cluster_name, err
            );
            stop_scaling(self.storage.as_ref(), cluster_name.clone()).await;
        }
        res
    }

    pub async fn get_failures(&self) -> Result<Vec<String>, MetaStoreError> {
        let failure_ttl = chrono::Duration::seconds(self.config.failure_ttl as i64);
        let failure_quorum = self.config.failure_quorum;
        self.storage.get_failures(failure_ttl, failure_quorum).await
    }

    pub async fn add_failure(
        &self,
        address: String,
        reporter_id: String,
    ) -> Result<(), MetaStoreError> {
        let failure_ttl = chrono::Duration::seconds(self.config.failure_ttl as i64);
        self.storage
            .add_failure(address, reporter_id, failure_ttl)
            .await
    }

    pub async fn commit_migration(&self, task: MigrationTaskMeta) -> Result<(), MetaStoreError> {
        self.storage.commit_migration(task).await
    }

    pub async fn replace_failed_proxy(
        &self,
        failed_proxy_address: String,
    ) -> Result<Option<Proxy>, MetaStoreError> {
        self.storage.replace_failed_proxy(failed_proxy_address).await
    }

    pub async fn get_failed_proxies(&self) -> Result<Vec<String>, MetaStoreError> {
        self.storage.get_failed_proxies().await
    }

    pub async fn force_bump_all_epoch(&self, new_epoch: u64) -> Result<(), MetaStoreError> {
        self.storage.force_bump_all_epoch(new_epoch).await
    }

    pub async fn get_epoch(&self) -> Result<u64, MetaStoreError> {
        self.storage.get_global_epoch().await
    }

    pub async fn recover_epoch(&self) -> Result<Vec<String>, MetaStoreError> {
        let proxy_addresses = self.storage.get_proxy_addresses(None, None).await?;
        let EpochFetchResult {
            max_epoch,
            failed_addresses,
        } = fetch_max_epoch(self.epoch_fetcher.as_ref(), proxy_addresses).await;
        info!(
            "get largest epoch {} with failed addresses: {:?}",
            max_epoch, failed_addresses
        );
        self.storage.recover_epoch(max_epoch).await?;
        Ok(failed_addresses)
    }

    pub async fn check_metadata(&self) -> Result<(), MetaStore> {
        self.storage.check_metadata().await
    }
}

async fn stop_scaling(storage: &dyn MetaStorage, cluster_name: String) {
    let res = retry_on_conflict(STOP_SCALING_RETRY_TIMES, STOP_SCALING_RETRY_INTERVAL, || {
        storage.stop_scaling(cluster_name.clone())
    })
    .await;
    match res {
        Ok(()) => info!("cluster {} is no longer changing", cluster_name),
        Err(err) => error!(
            "failed to clear the scaling state of cluster {}: {}",
            cluster_name, err
        ),
    }
}

// Reruns `f` while the commit loses to a concurrent one.
async fn retry_on_conflict<T, F, Fut>(
    times: usize,
    interval: Duration,
    mut f: F,
) -> Result<T, MetaStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MetaStoreError>>,
{
    for _ in 0..times {
        match f().await {
            Err(MetaStoreError::Retry) => tokio::time::sleep(interval).await,
            res => return res,
        }
    }
    Err(MetaStoreError::Retry)
}
