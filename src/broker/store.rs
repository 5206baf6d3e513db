use super::migrate::MetaStoreMigrate;
use super::persistence::MetaSyncError;
use super::query::MetaStoreQuery;
use super::update::MetaStoreUpdate;
use crate::common::cluster::{
    Cluster, ClusterName, MigrationTaskMeta, Node, Proxy, RangeList,
};
use crate::common::config::ClusterConfig;
use crate::common::version::UNDERMOON_MEM_BROKER_META_VERSION;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::cmp::max;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

pub const NODES_PER_PROXY: usize = 2;
pub const CHUNK_PARTS: usize = 2;
pub const CHUNK_HALF_NODE_NUM: usize = 2;
pub const CHUNK_NODE_NUM: usize = 4;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyResource {
    pub proxy_address: String,
    pub node_addresses: [String; NODES_PER_PROXY],
    pub host: String,
    pub cluster: Option<ClusterName>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostProxy {
    pub host: String,
    pub proxy_address: String,
}

// Which proxy of the chunk currently holds the two masters.
// `FirstChunkMaster` means the first proxy took over the masters of the second one.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub enum ChunkRolePosition {
    Normal,
    FirstChunkMaster,
    SecondChunkMaster,
}

// A chunk consists of 2 proxies on different hosts with 4 nodes:
//   proxy 0: node 0 (master of part 0), node 1 (replica of node 2)
//   proxy 1: node 2 (master of part 1), node 3 (replica of node 0)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChunkStore {
    pub role_position: ChunkRolePosition,
    pub stable_slots: [RangeList; CHUNK_PARTS],
    pub proxy_addresses: [String; CHUNK_PARTS],
    pub hosts: [String; CHUNK_PARTS],
    pub node_addresses: [String; CHUNK_NODE_NUM],
}

impl ChunkStore {
    pub fn has_stable_slots(&self) -> bool {
        self.stable_slots.iter().any(|slots| !slots.is_empty())
    }

    pub fn part_to_node_index(&self, part: usize) -> usize {
        match (part, self.role_position) {
            (0, ChunkRolePosition::SecondChunkMaster) => 3,
            (1, ChunkRolePosition::FirstChunkMaster) => 1,
            (i, _) => 2 * i,
        }
    }

    pub fn part_to_proxy_index(&self, part: usize) -> usize {
        self.part_to_node_index(part) / NODES_PER_PROXY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct MasterPosition {
    pub chunk_index: usize,
    pub part: usize,
}

impl MasterPosition {
    pub fn new(chunk_index: usize, part: usize) -> Self {
        Self { chunk_index, part }
    }

    pub fn master_index(&self) -> usize {
        self.chunk_index * CHUNK_PARTS + self.part
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    Expand,
    Shrink,
}

// The slots of `range_list` have been removed from the stable slots of `src`
// and will be merged into the stable slots of `dst` on commit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MigrationTaskStore {
    pub range_list: RangeList,
    pub src: MasterPosition,
    pub dst: MasterPosition,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MigrationStore {
    pub kind: MigrationKind,
    pub epoch: u64,
    pub target_node_number: usize,
    pub committed_task_number: usize,
    pub tasks: Vec<MigrationTaskStore>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Idle,
    Migrating,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingState {
    Idle,
    Changing,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterInfo {
    pub name: ClusterName,
    pub node_number: usize,
    pub node_number_with_slots: usize,
    pub is_migrating: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterStore {
    pub epoch: u64,
    pub name: ClusterName,
    pub chunks: Vec<ChunkStore>,
    pub config: ClusterConfig,
    pub migration_state: MigrationState,
    pub scaling_state: ScalingState,
    pub migration: Option<MigrationStore>,
}

impl ClusterStore {
    pub fn get_info(&self) -> ClusterInfo {
        ClusterInfo {
            name: self.name.clone(),
            node_number: self.get_node_number(),
            node_number_with_slots: self.get_node_number_with_slots(),
            is_migrating: self.is_migrating(),
        }
    }

    pub fn set_epoch(&mut self, new_epoch: u64) {
        self.epoch = new_epoch;
    }

    pub fn is_migrating(&self) -> bool {
        self.migration_state == MigrationState::Migrating
    }

    pub fn is_changing(&self) -> bool {
        self.scaling_state == ScalingState::Changing
    }

    // Migration and node number changing share one exclusion region.
    pub fn check_idle(&self) -> Result<(), MetaStoreError> {
        if self.is_migrating() {
            return Err(MetaStoreError::MigrationRunning);
        }
        if self.is_changing() {
            return Err(MetaStoreError::NodeNumberChanging);
        }
        Ok(())
    }

    pub fn get_proxy_addresses(&self) -> Vec<String> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.proxy_addresses.iter())
            .cloned()
            .collect()
    }

    pub fn get_node_number(&self) -> usize {
        self.chunks.len() * CHUNK_NODE_NUM
    }

    pub fn get_node_number_with_slots(&self) -> usize {
        let masters_with_slots: usize = self
            .chunks
            .iter()
            .map(|chunk| {
                chunk
                    .stable_slots
                    .iter()
                    .filter(|slots| !slots.is_empty())
                    .count()
            })
            .sum();
        masters_with_slots * CHUNK_HALF_NODE_NUM
    }

    fn is_migration_peer(&self, chunk_index: usize) -> bool {
        match self.migration.as_ref() {
            None => false,
            Some(migration) => migration.tasks.iter().any(|task| {
                task.src.chunk_index == chunk_index || task.dst.chunk_index == chunk_index
            }),
        }
    }

    // Free chunks are the ones added by `add_nodes` which own no slot
    // and are not going to receive any.
    pub fn get_free_chunk_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(i, chunk)| !chunk.has_stable_slots() && !self.is_migration_peer(*i))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn get_master_slots_num(&self, position: MasterPosition) -> usize {
        self.chunks
            .get(position.chunk_index)
            .and_then(|chunk| chunk.stable_slots.get(position.part))
            .map(|slots| slots.get_slots_num())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetaStore {
    pub version: String,
    pub global_epoch: u64,
    pub clusters: HashMap<ClusterName, ClusterStore>,
    // proxy_address => nodes and cluster_name
    pub all_proxies: HashMap<String, ProxyResource>,
    // proxy addresses
    pub failed_proxies: HashSet<String>,
    // failed_proxy_address => reporter_id => time,
    pub failures: HashMap<String, HashMap<String, i64>>,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore {
    pub fn new() -> Self {
        Self {
            version: UNDERMOON_MEM_BROKER_META_VERSION.to_string(),
            global_epoch: 0,
            clusters: HashMap::new(),
            all_proxies: HashMap::new(),
            failed_proxies: HashSet::new(),
            failures: HashMap::new(),
        }
    }

    // Runs `f` on a copy of the current store. On success the copy
    // becomes the next version with the global epoch bumped exactly once.
    // `f` gets the new epoch to stamp the clusters it touches.
    pub fn commit<T, F>(&self, f: F) -> Result<(MetaStore, T), MetaStoreError>
    where
        F: FnOnce(&mut MetaStore, u64) -> Result<T, MetaStoreError>,
    {
        let new_epoch = self.global_epoch + 1;
        let mut store = self.clone();
        let res = f(&mut store, new_epoch)?;
        store.global_epoch = new_epoch;
        Ok((store, res))
    }

    fn apply<T, F>(&mut self, f: F) -> Result<T, MetaStoreError>
    where
        F: FnOnce(&mut MetaStore, u64) -> Result<T, MetaStoreError>,
    {
        let (store, res) = self.commit(f)?;
        *self = store;
        Ok(res)
    }

    // The epoch must never go back. An equal epoch is accepted.
    pub fn restore(&mut self, other: MetaStore) -> Result<(), MetaStoreError> {
        if self.version != other.version {
            return Err(MetaStoreError::InvalidMetaVersion);
        }
        if self.global_epoch > other.global_epoch {
            return Err(MetaStoreError::SmallEpoch);
        }
        *self = other;
        Ok(())
    }

    pub fn get_global_epoch(&self) -> u64 {
        self.global_epoch
    }

    pub fn get_proxies(&self) -> Vec<String> {
        MetaStoreQuery::new(self).get_proxies()
    }

    pub fn get_proxies_with_pagination(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<String> {
        MetaStoreQuery::new(self).get_proxies_with_pagination(offset, limit)
    }

    pub fn get_proxy_by_address(&self, address: &str) -> Option<Proxy> {
        MetaStoreQuery::new(self).get_proxy_by_address(address)
    }

    pub fn get_cluster_names(&self) -> Vec<ClusterName> {
        MetaStoreQuery::new(self).get_cluster_names()
    }

    pub fn get_cluster_names_with_pagination(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<ClusterName> {
        MetaStoreQuery::new(self).get_cluster_names_with_pagination(offset, limit)
    }

    pub fn get_cluster_by_name(&self, cluster_name: &str) -> Option<Cluster> {
        MetaStoreQuery::new(self).get_cluster_by_name(cluster_name)
    }

    pub fn get_cluster_info_by_name(&self, cluster_name: &str) -> Option<ClusterInfo> {
        MetaStoreQuery::new(self).get_cluster_info_by_name(cluster_name)
    }

    pub fn get_migration_tasks(&self, cluster_name: &str) -> Vec<MigrationTaskMeta> {
        MetaStoreQuery::new(self).get_migration_tasks(cluster_name)
    }

    pub fn get_free_proxies(&self) -> Vec<HostProxy> {
        MetaStoreQuery::new(self).get_free_proxies()
    }

    pub fn get_failures(
        &self,
        now: i64,
        failure_ttl: chrono::Duration,
        failure_quorum: u64,
    ) -> Vec<String> {
        MetaStoreQuery::new(self).get_failures(now, failure_ttl, failure_quorum)
    }

    pub fn get_failed_proxies(&self) -> Vec<String> {
        let mut proxies: Vec<String> = self.failed_proxies.iter().cloned().collect();
        proxies.sort();
        proxies
    }

    pub fn add_failure(
        &mut self,
        address: String,
        reporter_id: String,
        now: i64,
        failure_ttl: chrono::Duration,
    ) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).add_failure(address, reporter_id, now, failure_ttl)
        })
    }

    pub fn add_proxy(
        &mut self,
        proxy_address: String,
        nodes: [String; NODES_PER_PROXY],
        host: Option<String>,
    ) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).add_proxy(proxy_address, nodes, host)
        })
    }

    pub fn remove_proxy(&mut self, proxy_address: String) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| MetaStoreUpdate::new(store, epoch).remove_proxy(proxy_address))
    }

    pub fn add_cluster(
        &mut self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).add_cluster(cluster_name, node_num)
        })
    }

    pub fn remove_cluster(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| MetaStoreUpdate::new(store, epoch).remove_cluster(cluster_name))
    }

    pub fn auto_add_nodes(
        &mut self,
        cluster_name: String,
        num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).auto_add_nodes(cluster_name, num)
        })
    }

    pub fn auto_scale_up_nodes(
        &mut self,
        cluster_name: String,
        cluster_node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).auto_scale_up_nodes(cluster_name, cluster_node_num)
        })
    }

    pub fn auto_delete_free_nodes(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).auto_delete_free_nodes(cluster_name)
        })
    }

    pub fn change_config(
        &mut self,
        cluster_name: String,
        config: HashMap<String, String>,
    ) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).change_config(cluster_name, config)
        })
    }

    pub fn balance_masters(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| MetaStoreUpdate::new(store, epoch).balance_masters(cluster_name))
    }

    pub fn replace_failed_proxy(
        &mut self,
        failed_proxy_address: String,
    ) -> Result<Option<String>, MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreUpdate::new(store, epoch).replace_failed_proxy(failed_proxy_address)
        })
    }

    pub fn migrate_slots(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreMigrate::new(store, epoch).migrate_slots(cluster_name)
        })
    }

    pub fn migrate_slots_to_scale_down(
        &mut self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| {
            MetaStoreMigrate::new(store, epoch).migrate_slots_to_scale_down(cluster_name, new_node_num)
        })
    }

    pub fn commit_migration(&mut self, task: MigrationTaskMeta) -> Result<(), MetaStoreError> {
        self.apply(|store, epoch| MetaStoreMigrate::new(store, epoch).commit_migration(task))
    }

    pub fn force_bump_all_epoch(&mut self, new_epoch: u64) -> Result<(), MetaStoreError> {
        if new_epoch <= self.global_epoch {
            return Err(MetaStoreError::SmallEpoch);
        }
        self.global_epoch = new_epoch;

        for cluster in self.clusters.values_mut() {
            cluster.epoch = new_epoch;
        }
        Ok(())
    }

    // The proxies may hold a larger epoch than the restored metadata.
    pub fn recover_epoch(&mut self, existing_largest_epoch: u64) {
        let new_epoch = max(existing_largest_epoch + 1, self.global_epoch + 1);
        self.global_epoch = new_epoch;

        for cluster in self.clusters.values_mut() {
            cluster.epoch = new_epoch;
        }
    }

    pub fn check(&self) -> Result<(), Self> {
        if MetaStoreQuery::new(self).check_metadata() {
            Ok(())
        } else {
            Err(self.clone())
        }
    }
}

// Rejected before reading any state, or as a result of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Internal,
}

#[derive(Debug, PartialEq)]
pub enum MetaStoreError {
    InUse,
    NoAvailableResource,
    AlreadyExisted,
    ClusterNotFound,
    FreeNodeNotFound,
    FreeNodeFound,
    ProxyNotFound,
    InvalidNodeNum,
    NodeNumAlreadyEnough,
    InvalidClusterName,
    InvalidMigrationTask,
    InvalidProxyAddress,
    MigrationTaskNotFound,
    MigrationRunning,
    InvalidConfig {
        key: String,
        value: String,
        error: String,
    },
    SyncError(MetaSyncError),
    InvalidMetaVersion,
    SmallEpoch,
    ProxyNotSync,
    NodeNumberChanging,
    Retry,
    InvalidState,
}

impl MetaStoreError {
    pub fn to_code(&self) -> &str {
        match self {
            Self::InUse => "IN_USE",
            Self::NoAvailableResource => "NO_AVAILABLE_RESOURCE",
            Self::AlreadyExisted => "ALREADY_EXISTED",
            Self::ClusterNotFound => "CLUSTER_NOT_FOUND",
            Self::FreeNodeNotFound => "FREE_NODE_NOT_FOUND",
            Self::FreeNodeFound => "FREE_NODE_FOUND",
            Self::ProxyNotFound => "PROXY_NOT_FOUND",
            Self::InvalidNodeNum => "INVALID_NODE_NUMBER",
            Self::NodeNumAlreadyEnough => "NODE_NUM_ALREADY_ENOUGH",
            Self::InvalidClusterName => "INVALID_CLUSTER_NAME",
            Self::InvalidMigrationTask => "INVALID_MIGRATION_TASK",
            Self::InvalidProxyAddress => "INVALID_PROXY_ADDRESS",
            Self::MigrationTaskNotFound => "MIGRATION_TASK_NOT_FOUND",
            Self::MigrationRunning => "MIGRATION_RUNNING",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::SyncError(err) => err.to_code(),
            Self::InvalidMetaVersion => "INVALID_META_VERSION",
            Self::SmallEpoch => "EPOCH_SMALLER_THAN_CURRENT",
            Self::ProxyNotSync => "PROXY_NOT_SYNC",
            Self::NodeNumberChanging => "NODE_NUMBER_CHANGING",
            Self::Retry => "RETRY",
            Self::InvalidState => "INVALID_STATE",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidNodeNum
            | Self::InvalidClusterName
            | Self::InvalidMigrationTask
            | Self::InvalidProxyAddress => ErrorKind::Validation,
            Self::ClusterNotFound | Self::ProxyNotFound | Self::MigrationTaskNotFound => {
                ErrorKind::NotFound
            }
            Self::SyncError(_) | Self::ProxyNotSync | Self::InvalidState => ErrorKind::Internal,
            Self::InUse
            | Self::NoAvailableResource
            | Self::AlreadyExisted
            | Self::FreeNodeNotFound
            | Self::FreeNodeFound
            | Self::NodeNumAlreadyEnough
            | Self::MigrationRunning
            | Self::InvalidConfig { .. }
            | Self::InvalidMetaVersion
            | Self::SmallEpoch
            | Self::NodeNumberChanging
            | Self::Retry => ErrorKind::Conflict,
        }
    }
}

impl fmt::Display for MetaStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_code())
    }
}

impl Error for MetaStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SyncError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MetaSyncError> for MetaStoreError {
    fn from(sync_err: MetaSyncError) -> Self {
        MetaStoreError::SyncError(sync_err)
    }
}

impl Serialize for MetaStoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let error_code = self.to_string();
        match self {
            Self::InvalidConfig { key, value, error } => {
                let mut state = serializer.serialize_struct("MetaStoreError", 4)?;
                state.serialize_field("error", &error_code)?;
                state.serialize_field("key", &key)?;
                state.serialize_field("value", &value)?;
                state.serialize_field("message", &error)?;
                state.end()
            }
            _ => {
                let mut state = serializer.serialize_struct("MetaStoreError", 1)?;
                state.serialize_field("error", &error_code)?;
                state.end()
            }
        }
    }
}
