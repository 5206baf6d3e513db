use super::migrate::MetaStoreMigrate;
use super::query::MetaStoreQuery;
use super::store::{ClusterInfo, MetaStore, MetaStoreError, NODES_PER_PROXY};
use super::update::MetaStoreUpdate;
use crate::common::cluster::{Cluster, ClusterName, MigrationTaskMeta, Node, Proxy};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait MetaStorage: Send + Sync + 'static {
    async fn get_all_metadata(&self) -> Result<Arc<MetaStore>, MetaStoreError>;
    async fn restore_metadata(&self, meta_store: MetaStore) -> Result<(), MetaStoreError>;
    async fn get_cluster_names(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<ClusterName>, MetaStoreError>;
    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, MetaStoreError>;
    async fn get_proxy_addresses(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, MetaStoreError>;
    async fn get_proxy_by_address(&self, address: &str) -> Result<Option<Proxy>, MetaStoreError>;
    async fn get_failures(
        &self,
        failure_ttl: chrono::Duration,
        failure_quorum: u64,
    ) -> Result<Vec<String>, MetaStoreError>;
    async fn add_failure(
        &self,
        address: String,
        reporter_id: String,
        failure_ttl: chrono::Duration,
    ) -> Result<(), MetaStoreError>;
    async fn replace_failed_proxy(
        &self,
        failed_proxy_address: String,
    ) -> Result<Option<Proxy>, MetaStoreError>;
    async fn get_failed_proxies(&self) -> Result<Vec<String>, MetaStoreError>;
    async fn get_cluster_info_by_name(
        &self,
        cluster_name: &str,
    ) -> Result<Option<ClusterInfo>, MetaStoreError>;
    async fn add_cluster(&self, cluster_name: String, node_num: usize)
        -> Result<(), MetaStoreError>;
    async fn remove_cluster(&self, cluster_name: String) -> Result<(), MetaStoreError>;
    async fn auto_add_nodes(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError>;
    async fn auto_scale_up_nodes(
        &self,
        cluster_name: String,
        cluster_node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError>;
    async fn auto_delete_free_nodes(&self, cluster_name: String) -> Result<(), MetaStoreError>;
    async fn migrate_slots(&self, cluster_name: String) -> Result<(), MetaStoreError>;
    async fn migrate_slots_to_scale_down(
        &self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError>;
    async fn get_migration_tasks(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<MigrationTaskMeta>, MetaStoreError>;
    async fn commit_migration(&self, task: MigrationTaskMeta) -> Result<(), MetaStoreError>;
    async fn start_scaling_out(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(Vec<String>, u64), MetaStoreError>;
    async fn stop_scaling(&self, cluster_name: String) -> Result<(), MetaStoreError>;
    async fn start_expand_after_scaling(&self, cluster_name: String)
        -> Result<(), MetaStoreError>;
    async fn reset_stale_scaling(&self) -> Result<Vec<ClusterName>, MetaStoreError>;
    async fn change_config(
        &self,
        cluster_name: String,
        config: HashMap<String, String>,
    ) -> Result<(), MetaStoreError>;
    async fn balance_masters(&self, cluster_name: String) -> Result<(), MetaStoreError>;
    async fn add_proxy(
        &self,
        proxy_address: String,
        nodes: [String; NODES_PER_PROXY],
        host: Option<String>,
    ) -> Result<(), MetaStoreError>;
    async fn remove_proxy(&self, proxy_address: String) -> Result<(), MetaStoreError>;
    async fn get_global_epoch(&self) -> Result<u64, MetaStoreError>;
    async fn recover_epoch(&self, existing_largest_epoch: u64) -> Result<(), MetaStoreError>;
    async fn force_bump_all_epoch(&self, new_epoch: u64) -> Result<(), MetaStoreError>;
    async fn check_metadata(&self) -> Result<(), MetaStore>;
}

// Readers never block. Writers build the next version from the one they loaded
// and only one of the concurrent writers wins the swap.
pub struct MemoryStorage {
    store: ArcSwap<MetaStore>,
}

impl MemoryStorage {
    pub fn new(store: MetaStore) -> Self {
        Self {
            store: ArcSwap::from_pointee(store),
        }
    }

    pub fn load(&self) -> Arc<MetaStore> {
        self.store.load_full()
    }

    fn swap_with<T, F>(&self, f: F) -> Result<T, MetaStoreError>
    where
        F: FnOnce(&MetaStore) -> Result<(MetaStore, T), MetaStoreError>,
    {
        let current = self.store.load_full();
        self.swap_from(current, f)
    }

    fn swap_from<T, F>(&self, current: Arc<MetaStore>, f: F) -> Result<T, MetaStoreError>
    where
        F: FnOnce(&MetaStore) -> Result<(MetaStore, T), MetaStoreError>,
    {
        let (new_store, res) = f(&current)?;
        let prev = self.store.compare_and_swap(&current, Arc::new(new_store));
        if !Arc::ptr_eq(&*prev, &current) {
            return Err(MetaStoreError::Retry);
        }
        Ok(res)
    }

    fn update<T, F>(&self, f: F) -> Result<T, MetaStoreError>
    where
        F: FnOnce(&mut MetaStore, u64) -> Result<T, MetaStoreError>,
    {
        self.swap_with(|store| store.commit(f))
    }

    // Commits against a version loaded earlier.
    pub(crate) fn update_from<T, F>(
        &self,
        current: Arc<MetaStore>,
        f: F,
    ) -> Result<T, MetaStoreError>
    where
        F: FnOnce(&mut MetaStore, u64) -> Result<T, MetaStoreError>,
    {
        self.swap_from(current, |store| store.commit(f))
    }
}

#[async_trait]
impl MetaStorage for MemoryStorage {
    async fn get_all_metadata(&self) -> Result<Arc<MetaStore>, MetaStoreError> {
        Ok(self.load())
    }

    async fn restore_metadata(&self, meta_store: MetaStore) -> Result<(), MetaStoreError> {
        self.swap_with(|store| {
            let mut new_store = store.clone();
            new_store.restore(meta_store)?;
            Ok((new_store, ()))
        })
    }

    async fn get_cluster_names(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<ClusterName>, MetaStoreError> {
        Ok(self.load().get_cluster_names_with_pagination(offset, limit))
    }

    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, MetaStoreError> {
        Ok(self.load().get_cluster_by_name(name))
    }

    async fn get_proxy_addresses(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, MetaStoreError> {
        Ok(self.load().get_proxies_with_pagination(offset, limit))
    }

    async fn get_proxy_by_address(&self, address: &str) -> Result<Option<Proxy>, MetaStoreError> {
        Ok(self.load().get_proxy_by_address(address))
    }

    async fn get_failures(
        &self,
        failure_ttl: chrono::Duration,
        failure_quorum: u64,
    ) -> Result<Vec<String>, MetaStoreError> {
        let now = Utc::now().timestamp();
        Ok(self.load().get_failures(now, failure_ttl, failure_quorum))
    }

    async fn add_failure(
        &self,
        address: String,
        reporter_id: String,
        failure_ttl: chrono::Duration,
    ) -> Result<(), MetaStoreError> {
        let now = Utc::now().timestamp();
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).add_failure(address, reporter_id, now, failure_ttl)
        })
    }

    async fn replace_failed_proxy(
        &self,
        failed_proxy_address: String,
    ) -> Result<Option<Proxy>, MetaStoreError> {
        self.update(|store, epoch| {
            let new_proxy_address =
                MetaStoreUpdate::new(store, epoch).replace_failed_proxy(failed_proxy_address)?;
            let proxy = new_proxy_address
                .and_then(|address| MetaStoreQuery::new(store).get_proxy_by_address(&address));
            Ok(proxy)
        })
    }

    async fn get_failed_proxies(&self) -> Result<Vec<String>, MetaStoreError> {
        Ok(self.load().get_failed_proxies())
    }

    async fn get_cluster_info_by_name(
        &self,
        cluster_name: &str,
    ) -> Result<Option<ClusterInfo>, MetaStoreError> {
        Ok(self.load().get_cluster_info_by_name(cluster_name))
    }

    async fn add_cluster(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).add_cluster(cluster_name, node_num)
        })
    }

    async fn remove_cluster(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| MetaStoreUpdate::new(store, epoch).remove_cluster(cluster_name))
    }

    async fn auto_add_nodes(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).auto_add_nodes(cluster_name, node_num)
        })
    }

    async fn auto_scale_up_nodes(
        &self,
        cluster_name: String,
        cluster_node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).auto_scale_up_nodes(cluster_name, cluster_node_num)
        })
    }

    async fn auto_delete_free_nodes(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).auto_delete_free_nodes(cluster_name)
        })
    }

    async fn migrate_slots(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| MetaStoreMigrate::new(store, epoch).migrate_slots(cluster_name))
    }

    async fn migrate_slots_to_scale_down(
        &self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreMigrate::new(store, epoch).migrate_slots_to_scale_down(cluster_name, new_node_num)
        })
    }

    async fn get_migration_tasks(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<MigrationTaskMeta>, MetaStoreError> {
        Ok(self.load().get_migration_tasks(cluster_name))
    }

    async fn commit_migration(&self, task: MigrationTaskMeta) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| MetaStoreMigrate::new(store, epoch).commit_migration(task))
    }

    async fn start_scaling_out(
        &self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(Vec<String>, u64), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreMigrate::new(store, epoch).start_scaling_out(cluster_name, node_num)
        })
    }

    async fn stop_scaling(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| MetaStoreMigrate::new(store, epoch).stop_scaling(cluster_name))
    }

    async fn start_expand_after_scaling(
        &self,
        cluster_name: String,
    ) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreMigrate::new(store, epoch).start_expand_after_scaling(cluster_name)
        })
    }

    async fn reset_stale_scaling(&self) -> Result<Vec<ClusterName>, MetaStoreError> {
        let current = self.load();
        if !current.clusters.values().any(|cluster| cluster.is_changing()) {
            return Ok(vec![]);
        }
        self.update_from(current, |store, epoch| {
            MetaStoreMigrate::new(store, epoch).reset_stale_scaling()
        })
    }

    async fn change_config(
        &self,
        cluster_name: String,
        config: HashMap<String, String>,
    ) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).change_config(cluster_name, config)
        })
    }

    async fn balance_masters(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| MetaStoreUpdate::new(store, epoch).balance_masters(cluster_name))
    }

    async fn add_proxy(
        &self,
        proxy_address: String,
        nodes: [String; NODES_PER_PROXY],
        host: Option<String>,
    ) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).add_proxy(proxy_address, nodes, host)
        })
    }

    async fn remove_proxy(&self, proxy_address: String) -> Result<(), MetaStoreError> {
        self.update(|store, epoch| MetaStoreUpdate::new(store, epoch).remove_proxy(proxy_address))
    }

    async fn get_global_epoch(&self) -> Result<u64, MetaStoreError> {
        Ok(self.load().get_global_epoch())
    }

    async fn recover_epoch(&self, existing_largest_epoch: u64) -> Result<(), MetaStoreError> {
        self.swap_with(|store| {
            let mut new_store = store.clone();
            new_store.recover_epoch(existing_largest_epoch);
            Ok((new_store, ()))
        })
    }

    async fn force_bump_all_epoch(&self, new_epoch: u64) -> Result<(), MetaStoreError> {
        self.swap_with(|store| {
            let mut new_store = store.clone();
            new_store.force_bump_all_epoch(new_epoch)?;
            Ok((new_store, ()))
        })
    }

    async fn check_metadata(&self) -> Result<(), MetaStore> {
        self.load().check()
    }
}

#[cfg(test)]
mod tests {
    use super::super::utils::tests::add_testing_proxies;
    use super::*;

    const CLUSTER_NAME: &str = "testcluster";

    fn gen_storage() -> MemoryStorage {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 2);
        MemoryStorage::new(store)
    }

    #[tokio::test]
    async fn test_concurrent_commit_gets_retry() {
        let storage = gen_storage();
        let stale = storage.load();
        storage
            .add_cluster(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let epoch = storage.get_global_epoch().await.unwrap();

        let err = storage
            .update_from(stale, |store, epoch| {
                MetaStoreUpdate::new(store, epoch).add_cluster("another".to_string(), 4)
            })
            .unwrap_err();
        assert_eq!(err, MetaStoreError::Retry);
        assert_eq!(storage.get_global_epoch().await.unwrap(), epoch);
        assert!(storage
            .get_cluster_by_name("another")
            .await
            .unwrap()
            .is_none());

        // Retrying against the fresh version works.
        let current = storage.load();
        storage
            .update_from(current, |store, epoch| {
                MetaStoreUpdate::new(store, epoch).add_cluster("another".to_string(), 4)
            })
            .unwrap();
        assert_eq!(storage.get_global_epoch().await.unwrap(), epoch + 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let storage = gen_storage();
        let before = storage.load();
        let err = storage
            .add_cluster(CLUSTER_NAME.to_string(), 40)
            .await
            .unwrap_err();
        assert_eq!(err, MetaStoreError::NoAvailableResource);
        let after = storage.load();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_one_bump_per_commit() {
        let storage = gen_storage();
        let epoch = storage.get_global_epoch().await.unwrap();
        storage
            .add_cluster(CLUSTER_NAME.to_string(), 8)
            .await
            .unwrap();
        assert_eq!(storage.get_global_epoch().await.unwrap(), epoch + 1);
        let cluster = storage
            .get_cluster_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.get_epoch(), epoch + 1);
        storage.check_metadata().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_and_recover_epoch() {
        let storage = gen_storage();
        storage
            .add_cluster(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let snapshot = (*storage.get_all_metadata().await.unwrap()).clone();

        let another = MemoryStorage::new(MetaStore::new());
        another.restore_metadata(snapshot.clone()).await.unwrap();
        assert_eq!(*another.load(), snapshot);

        another.recover_epoch(100).await.unwrap();
        assert_eq!(another.get_global_epoch().await.unwrap(), 101);

        assert_eq!(
            another.force_bump_all_epoch(50).await.unwrap_err(),
            MetaStoreError::SmallEpoch
        );
        another.force_bump_all_epoch(200).await.unwrap();
        let cluster = another
            .get_cluster_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.get_epoch(), 200);
    }

    #[tokio::test]
    async fn test_restore_metadata_keeps_epoch_monotonic() {
        let storage = gen_storage();
        let old_snapshot = (*storage.get_all_metadata().await.unwrap()).clone();
        storage
            .add_cluster("foo".to_string(), 8)
            .await
            .unwrap();
        storage
            .add_cluster("bar".to_string(), 4)
            .await
            .unwrap();
        let epoch = storage.get_global_epoch().await.unwrap();

        let err = storage.restore_metadata(old_snapshot).await.unwrap_err();
        assert_eq!(err, MetaStoreError::SmallEpoch);
        assert_eq!(storage.get_global_epoch().await.unwrap(), epoch);
        assert!(storage.get_cluster_by_name("foo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replace_failed_proxy_returns_new_proxy() {
        let storage = gen_storage();
        storage
            .add_cluster(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let cluster = storage
            .get_cluster_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        let failed_address = cluster.get_nodes()[0].get_proxy_address().to_string();

        let proxy = storage
            .replace_failed_proxy(failed_address.clone())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(proxy.get_address(), failed_address);
        assert_eq!(proxy.get_nodes().len(), 2);
        assert_eq!(
            proxy.get_epoch(),
            storage.get_global_epoch().await.unwrap()
        );
        assert_eq!(
            storage.get_failed_proxies().await.unwrap(),
            vec![failed_address]
        );
    }
}
