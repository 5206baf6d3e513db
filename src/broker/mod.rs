mod api;
mod epoch;
mod migrate;
mod orchestrator;
mod persistence;
mod pool;
mod query;
mod replication;
mod resource;
mod service;
mod storage;
mod store;
mod update;


pub use self::api::{
    gen_routes, AutoAddNodesPayload, AutoScaleUpNodesPayload, ClusterNamesPayload, ClusterPayload,
    CreateClusterPayload, FailedProxiesPayload, FailuresPayload, ProxyAddressesPayload,
    ProxyPayload, RecoverEpochResult, ReplaceProxyResponse, ResourceFailureCheckPayload,
    MEM_BROKER_API_VERSION,
};
pub use self::epoch::{EpochFetchError, MockProxyEpochFetcher, ProxyEpochFetcher, RespEpochFetcher};
pub use self::orchestrator::{
    MigrationStatus, MockSlotTransfer, ProxyCommitWatcher, SlotTransfer, TransferError,
    TransferOutcome,
};
pub use self::persistence::{JsonFileStorage, MetaPersistence, MetaSyncError};
pub use self::replication::{JsonMetaReplicator, MetaReplicator};
pub use self::service::{
    MemBrokerConfig, MemBrokerConfigPayload, MemBrokerService, ProxyResourcePayload,
    ReplicaAddresses,
};
pub use self::storage::{MemoryStorage, MetaStorage};
pub use self::store::{ClusterInfo, ErrorKind, MetaStore, MetaStoreError};
