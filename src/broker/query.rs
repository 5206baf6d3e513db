use super::store::{
    ChunkStore, ClusterInfo, ClusterStore, HostProxy, MasterPosition, MetaStore,
    MigrationState, MigrationTaskStore, ProxyResource, CHUNK_NODE_NUM, CHUNK_PARTS,
    NODES_PER_PROXY,
};
use crate::common::cluster::{
    Cluster, ClusterName, MigrationMeta, MigrationTaskMeta, Node, Proxy, ReplMeta, ReplPeer,
    Role, SlotRange, SlotRangeTag,
};
use crate::common::utils::{paginate, SLOT_NUM};
use std::collections::HashSet;
use std::convert::TryFrom;

pub struct MetaStoreQuery<'a> {
    store: &'a MetaStore,
}

impl<'a> MetaStoreQuery<'a> {
    pub fn new(store: &'a MetaStore) -> Self {
        Self { store }
    }

    pub fn get_proxies(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.store.all_proxies.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_proxies_with_pagination(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<String> {
        paginate(self.get_proxies(), offset, limit)
    }

    pub fn get_cluster_names(&self) -> Vec<ClusterName> {
        let mut names: Vec<ClusterName> = self.store.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_cluster_names_with_pagination(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<ClusterName> {
        paginate(self.get_cluster_names(), offset, limit)
    }

    fn get_cluster_store(&self, cluster_name: &str) -> Option<&ClusterStore> {
        let cluster_name = ClusterName::try_from(cluster_name).ok()?;
        self.store.clusters.get(&cluster_name)
    }

    pub fn get_cluster_by_name(&self, cluster_name: &str) -> Option<Cluster> {
        self.get_cluster_store(cluster_name)
            .map(Self::cluster_store_to_cluster)
    }

    pub fn get_cluster_info_by_name(&self, cluster_name: &str) -> Option<ClusterInfo> {
        self.get_cluster_store(cluster_name)
            .map(ClusterStore::get_info)
    }

    // The pending tasks of a migrating cluster seen from the source side.
    pub fn get_migration_tasks(&self, cluster_name: &str) -> Vec<MigrationTaskMeta> {
        let cluster_store = match self.get_cluster_store(cluster_name) {
            Some(cluster_store) => cluster_store,
            None => return vec![],
        };
        let migration = match cluster_store.migration.as_ref() {
            Some(migration) => migration,
            None => return vec![],
        };
        migration
            .tasks
            .iter()
            .filter_map(|task| {
                let meta = Self::task_to_migration_meta(cluster_store, task)?;
                Some(MigrationTaskMeta {
                    cluster_name: cluster_store.name.clone(),
                    slot_range: SlotRange {
                        range_list: task.range_list.clone(),
                        tag: SlotRangeTag::Migrating(meta),
                    },
                })
            })
            .collect()
    }

    pub fn get_proxy_by_address(&self, address: &str) -> Option<Proxy> {
        let proxy_resource = self.store.all_proxies.get(address)?;
        let cluster_store = proxy_resource
            .cluster
            .as_ref()
            .and_then(|name| self.store.clusters.get(name));

        let cluster_store = match cluster_store {
            Some(cluster_store) => cluster_store,
            None => {
                return Some(Proxy::new(
                    address.to_string(),
                    self.store.global_epoch,
                    vec![],
                    proxy_resource.node_addresses.to_vec(),
                    None,
                ));
            }
        };

        // The cluster epoch keeps this proxy from resyncing
        // when only other clusters change.
        let cluster = Self::cluster_store_to_cluster(cluster_store);
        let epoch = cluster.get_epoch();
        let config = cluster.get_config().clone();
        let nodes: Vec<Node> = cluster
            .into_nodes()
            .into_iter()
            .filter(|node| node.get_proxy_address() == address)
            .collect();

        Some(Proxy::new(
            address.to_string(),
            epoch,
            nodes,
            vec![],
            Some(config),
        ))
    }

    fn master_addresses(
        cluster_store: &ClusterStore,
        position: MasterPosition,
    ) -> Option<(String, String)> {
        let chunk = cluster_store.chunks.get(position.chunk_index)?;
        if position.part >= CHUNK_PARTS {
            return None;
        }
        let node_index = chunk.part_to_node_index(position.part);
        let node_address = chunk.node_addresses.get(node_index)?.clone();
        let proxy_address = chunk
            .proxy_addresses
            .get(node_index / NODES_PER_PROXY)?
            .clone();
        Some((proxy_address, node_address))
    }

    fn task_to_migration_meta(
        cluster_store: &ClusterStore,
        task: &MigrationTaskStore,
    ) -> Option<MigrationMeta> {
        let (src_proxy_address, src_node_address) =
            Self::master_addresses(cluster_store, task.src).or_else(|| {
                error!(
                    "invalid migration source {:?} in cluster {}",
                    task.src, cluster_store.name
                );
                None
            })?;
        let (dst_proxy_address, dst_node_address) =
            Self::master_addresses(cluster_store, task.dst).or_else(|| {
                error!(
                    "invalid migration destination {:?} in cluster {}",
                    task.dst, cluster_store.name
                );
                None
            })?;
        Some(MigrationMeta {
            epoch: task.epoch,
            src_proxy_address,
            src_node_address,
            dst_proxy_address,
            dst_node_address,
        })
    }

    fn master_slots(
        cluster_store: &ClusterStore,
        chunk: &ChunkStore,
        position: MasterPosition,
    ) -> Vec<SlotRange> {
        let mut slots = vec![];
        if let Some(stable_slots) = chunk.stable_slots.get(position.part) {
            if !stable_slots.is_empty() {
                slots.push(SlotRange {
                    range_list: stable_slots.clone(),
                    tag: SlotRangeTag::None,
                });
            }
        }

        let tasks = match cluster_store.migration.as_ref() {
            Some(migration) => migration.tasks.as_slice(),
            None => &[][..],
        };
        for task in tasks.iter() {
            if task.src != position && task.dst != position {
                continue;
            }
            let meta = match Self::task_to_migration_meta(cluster_store, task) {
                Some(meta) => meta,
                None => continue,
            };
            let tag = if task.src == position {
                SlotRangeTag::Migrating(meta)
            } else {
                SlotRangeTag::Importing(meta)
            };
            slots.push(SlotRange {
                range_list: task.range_list.clone(),
                tag,
            });
        }
        slots
    }

    pub fn cluster_store_to_cluster(cluster_store: &ClusterStore) -> Cluster {
        let mut nodes = Vec::with_capacity(cluster_store.chunks.len() * CHUNK_NODE_NUM);
        for (chunk_index, chunk) in cluster_store.chunks.iter().enumerate() {
            let master_indices = [chunk.part_to_node_index(0), chunk.part_to_node_index(1)];

            for (i, address) in chunk.node_addresses.iter().enumerate() {
                let proxy_address = chunk.proxy_addresses[i / NODES_PER_PROXY].clone();

                let part = master_indices.iter().position(|index| *index == i);
                let (role, slots) = match part {
                    Some(part) => (
                        Role::Master,
                        Self::master_slots(
                            cluster_store,
                            chunk,
                            MasterPosition::new(chunk_index, part),
                        ),
                    ),
                    None => (Role::Replica, vec![]),
                };

                // 0 <-> 3, 1 <-> 2
                let peer_index = CHUNK_NODE_NUM - 1 - i;
                let peer = ReplPeer {
                    node_address: chunk.node_addresses[peer_index].clone(),
                    proxy_address: chunk.proxy_addresses[peer_index / NODES_PER_PROXY].clone(),
                };
                let repl = ReplMeta::new(role, vec![peer]);

                nodes.push(Node::new(
                    address.clone(),
                    proxy_address,
                    cluster_store.name.clone(),
                    slots,
                    repl,
                ));
            }
        }

        Cluster::new(
            cluster_store.name.clone(),
            cluster_store.epoch,
            nodes,
            cluster_store.config.clone(),
        )
    }

    pub fn get_free_proxy_resource(&self) -> Vec<ProxyResource> {
        let failed_proxies = &self.store.failed_proxies;
        let failures = &self.store.failures;

        let mut free_proxies: Vec<ProxyResource> = self
            .store
            .all_proxies
            .values()
            .filter(|proxy_resource| proxy_resource.cluster.is_none())
            .filter(|proxy_resource| !failed_proxies.contains(&proxy_resource.proxy_address))
            .filter(|proxy_resource| !failures.contains_key(&proxy_resource.proxy_address))
            .cloned()
            .collect();
        free_proxies.sort_by(|a, b| a.proxy_address.cmp(&b.proxy_address));
        free_proxies
    }

    pub fn get_free_proxies(&self) -> Vec<HostProxy> {
        self.get_free_proxy_resource()
            .into_iter()
            .map(|proxy_resource| HostProxy {
                host: proxy_resource.host,
                proxy_address: proxy_resource.proxy_address,
            })
            .collect()
    }

    pub fn get_failures(
        &self,
        now: i64,
        failure_ttl: chrono::Duration,
        failure_quorum: u64,
    ) -> Vec<String> {
        let ttl = failure_ttl.num_seconds();
        let all_proxies = &self.store.all_proxies;
        let mut failures: Vec<String> = self
            .store
            .failures
            .iter()
            .filter(|(address, _)| all_proxies.contains_key(address.as_str()))
            .filter(|(_, reporters)| {
                let live_reports = reporters
                    .values()
                    .filter(|report_time| now - **report_time < ttl)
                    .count();
                live_reports as u64 >= failure_quorum
            })
            .map(|(address, _)| address.clone())
            .collect();
        failures.sort();
        failures
    }

    pub fn check_metadata(&self) -> bool {
        let mut data_correct = true;

        for (cluster_name, cluster) in self.store.clusters.iter() {
            if !self.check_cluster_proxies(cluster_name, cluster) {
                data_correct = false;
            }
            if !Self::check_cluster_slots(cluster) {
                data_correct = false;
            }
            if cluster.epoch > self.store.global_epoch {
                error!(
                    "cluster {} epoch {} is larger than global epoch {}",
                    cluster_name, cluster.epoch, self.store.global_epoch
                );
                data_correct = false;
            }
        }

        for (proxy_address, proxy_resource) in self.store.all_proxies.iter() {
            let cluster_name = match proxy_resource.cluster.as_ref() {
                None => continue,
                Some(cluster_name) => cluster_name,
            };
            match self.store.clusters.get(cluster_name) {
                None => {
                    error!("cannot find cluster {} {}", proxy_address, cluster_name);
                    data_correct = false;
                }
                Some(cluster) => {
                    let chunk = cluster
                        .chunks
                        .iter()
                        .find(|chunk| chunk.proxy_addresses.contains(proxy_address));
                    if chunk.is_none() {
                        error!(
                            "cannot find chunk in cluster {} {}",
                            proxy_address, cluster_name
                        );
                        data_correct = false;
                    }
                }
            }
        }

        data_correct
    }

    fn check_cluster_proxies(&self, cluster_name: &ClusterName, cluster: &ClusterStore) -> bool {
        let mut data_correct = true;
        let mut proxy_address_set = HashSet::new();
        for chunk in cluster.chunks.iter() {
            if chunk.hosts[0] == chunk.hosts[1] {
                error!(
                    "chunk of cluster {} has both proxies in host {}",
                    cluster_name, chunk.hosts[0]
                );
                data_correct = false;
            }
            for (i, proxy_address) in chunk.proxy_addresses.iter().enumerate() {
                let proxy_resource = match self.store.all_proxies.get(proxy_address) {
                    None => {
                        error!("cannot find {} in all_proxies", proxy_address);
                        data_correct = false;
                        continue;
                    }
                    Some(proxy_resource) => proxy_resource,
                };
                if proxy_resource.cluster.as_ref() != Some(cluster_name) {
                    error!(
                        "incorrect cluster name for {} {:?} != {}",
                        proxy_address, proxy_resource.cluster, cluster_name
                    );
                    data_correct = false;
                }
                if !proxy_address_set.insert(proxy_address.clone()) {
                    error!(
                        "duplicate proxy address {} in cluster {}",
                        proxy_address, cluster_name
                    );
                    data_correct = false;
                }
                if chunk.hosts[i] != proxy_resource.host {
                    error!(
                        "invalid host for {} {:?} != {:?}",
                        proxy_address, chunk.hosts[i], proxy_resource.host
                    );
                    data_correct = false;
                }
                let node_addresses = [
                    chunk.node_addresses[2 * i].clone(),
                    chunk.node_addresses[2 * i + 1].clone(),
                ];
                if node_addresses != proxy_resource.node_addresses {
                    error!(
                        "invalid node_addresses for {} {:?} != {:?}",
                        proxy_address, node_addresses, proxy_resource.node_addresses
                    );
                    data_correct = false;
                }
            }
        }
        data_correct
    }

    fn check_cluster_slots(cluster: &ClusterStore) -> bool {
        let cluster_name = &cluster.name;

        if cluster.is_migrating() && cluster.is_changing() {
            error!("cluster {} is both migrating and changing", cluster_name);
            return false;
        }
        match (cluster.migration_state, cluster.migration.as_ref()) {
            (MigrationState::Idle, None) | (MigrationState::Migrating, Some(_)) => (),
            (state, migration) => {
                error!(
                    "cluster {} has migration state {:?} with migration record {:?}",
                    cluster_name, state, migration
                );
                return false;
            }
        }

        let mut range_lists = vec![];
        for chunk in cluster.chunks.iter() {
            range_lists.extend(chunk.stable_slots.iter());
        }
        if let Some(migration) = cluster.migration.as_ref() {
            for task in migration.tasks.iter() {
                let valid_position = |position: MasterPosition| {
                    position.chunk_index < cluster.chunks.len() && position.part < CHUNK_PARTS
                };
                if !valid_position(task.src) || !valid_position(task.dst) {
                    error!(
                        "invalid migration task position in cluster {}: {:?}",
                        cluster_name, task
                    );
                    return false;
                }
                range_lists.push(&task.range_list);
            }
        }

        let mut visited = vec![false; SLOT_NUM];
        for range_list in range_lists.into_iter() {
            for range in range_list.get_ranges().iter() {
                if range.start() > range.end() || range.end() >= SLOT_NUM {
                    error!("invalid range {:?} in cluster {}", range, cluster_name);
                    return false;
                }
                for slot in range.start()..=range.end() {
                    if visited[slot] {
                        error!("slot {} is owned twice in cluster {}", slot, cluster_name);
                        return false;
                    }
                    visited[slot] = true;
                }
            }
        }
        if let Some(slot) = visited.iter().position(|v| !*v) {
            error!("slot {} is not owned in cluster {}", slot, cluster_name);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::utils::tests::add_testing_proxies;
    use super::*;

    #[test]
    fn test_cluster_view_roles_and_peers() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 2, 1);
        store.add_cluster("mydb".to_string(), 4).unwrap();

        let cluster = MetaStoreQuery::new(&store)
            .get_cluster_by_name("mydb")
            .unwrap();
        let nodes = cluster.get_nodes();
        assert_eq!(nodes.len(), 4);
        let roles: Vec<Role> = nodes.iter().map(|node| node.get_role()).collect();
        assert_eq!(
            roles,
            vec![Role::Master, Role::Replica, Role::Master, Role::Replica]
        );

        let peer = &nodes[0].get_repl_meta().get_peers()[0];
        assert_eq!(peer.node_address, nodes[3].get_address());
        assert_eq!(peer.proxy_address, nodes[3].get_proxy_address());
        let peer = &nodes[1].get_repl_meta().get_peers()[0];
        assert_eq!(peer.node_address, nodes[2].get_address());
        assert_ne!(nodes[0].get_proxy_address(), nodes[2].get_proxy_address());
    }

    #[test]
    fn test_proxy_view() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 3, 1);
        store.add_cluster("mydb".to_string(), 4).unwrap();
        store.add_cluster("otherdb".to_string(), 4).unwrap_err();

        let query = MetaStoreQuery::new(&store);
        let cluster = query.get_cluster_by_name("mydb").unwrap();
        let proxy_address = cluster.get_nodes()[0].get_proxy_address().to_string();
        let proxy = query.get_proxy_by_address(&proxy_address).unwrap();
        assert_eq!(proxy.get_epoch(), cluster.get_epoch());
        assert_eq!(proxy.get_nodes().len(), 2);
        assert!(proxy.get_free_nodes().is_empty());
        assert!(proxy.get_cluster_config().is_some());

        let free_proxy = query.get_free_proxies().pop().unwrap();
        let proxy = query
            .get_proxy_by_address(&free_proxy.proxy_address)
            .unwrap();
        assert_eq!(proxy.get_epoch(), store.global_epoch);
        assert!(proxy.get_nodes().is_empty());
        assert_eq!(proxy.get_free_nodes().len(), 2);
        assert!(proxy.get_cluster_config().is_none());

        assert!(query.get_proxy_by_address("127.0.0.9:7001").is_none());
    }

    #[test]
    fn test_pagination_sorted() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 2);
        for name in &["c", "a", "b"] {
            store.add_cluster(name.to_string(), 4).unwrap();
        }
        let query = MetaStoreQuery::new(&store);
        let names: Vec<String> = query
            .get_cluster_names_with_pagination(Some(1), Some(1))
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, vec!["b".to_string()]);

        let proxies = query.get_proxies_with_pagination(None, Some(2));
        assert_eq!(
            proxies,
            vec!["127.0.0.1:7001".to_string(), "127.0.0.1:7002".to_string()]
        );
        assert_eq!(query.get_proxies_with_pagination(Some(6), None).len(), 2);
    }

    #[test]
    fn test_check_metadata_detects_broken_slots() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 2, 1);
        store.add_cluster("mydb".to_string(), 4).unwrap();
        assert!(MetaStoreQuery::new(&store).check_metadata());

        let name = ClusterName::try_from("mydb").unwrap();
        let cluster = store.clusters.get_mut(&name).unwrap();
        cluster.chunks[0].stable_slots[1] = Default::default();
        assert!(!MetaStoreQuery::new(&store).check_metadata());
    }
}
