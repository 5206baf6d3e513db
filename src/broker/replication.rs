use super::api::MEM_BROKER_API_VERSION;
use super::persistence::MetaSyncError;
use super::service::ReplicaAddresses;
use super::store::MetaStore;
use futures::{future, Future};
use reqwest::header::CONTENT_TYPE;
use std::pin::Pin;
use std::sync::Arc;

pub trait MetaReplicator {
    fn sync_meta<'s>(
        &'s self,
        store: Arc<MetaStore>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MetaSyncError>> + Send + 's>>;
}

// Pushes the whole snapshot to every replica broker through `PUT /metadata`.
// A replica holding a newer epoch rejects it.
pub struct JsonMetaReplicator {
    replica_addresses: ReplicaAddresses,
    client: reqwest::Client,
}

impl JsonMetaReplicator {
    pub fn new(replica_addresses: ReplicaAddresses, client: reqwest::Client) -> Self {
        Self {
            replica_addresses,
            client,
        }
    }

    fn gen_url(address: &str) -> String {
        format!("http://{}/api/{}/metadata", address, MEM_BROKER_API_VERSION)
    }

    async fn push_snapshot(&self, replica_address: &str, data: Vec<u8>) -> Result<(), String> {
        let response = self
            .client
            .put(Self::gen_url(replica_address).as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|err| format!("<failed to read body: {}>", err));
        Err(format!("status {} body {:?}", status, body))
    }

    async fn sync_meta_impl(&self, store: Arc<MetaStore>) -> Result<(), MetaSyncError> {
        let replica_addresses = self.replica_addresses.load_full();
        if replica_addresses.is_empty() {
            return Ok(());
        }

        // Serialized once for all the replicas.
        let data = serde_json::to_vec(&*store).map_err(|err| {
            error!("failed to convert MetaStore to json {}", err);
            MetaSyncError::Json
        })?;
        let epoch = store.get_global_epoch();

        let futs = replica_addresses
            .iter()
            .map(|address| self.push_snapshot(address.as_str(), data.clone()));
        let results = future::join_all(futs).await;

        let mut failed_addresses = vec![];
        for (address, res) in replica_addresses.iter().zip(results.into_iter()) {
            if let Err(reason) = res {
                error!(
                    "failed to sync meta with epoch {} to replica {}: {}",
                    epoch, address, reason
                );
                failed_addresses.push(address.clone());
            }
        }

        if failed_addresses.is_empty() {
            Ok(())
        } else {
            Err(MetaSyncError::Replication(failed_addresses))
        }
    }
}

impl MetaReplicator for JsonMetaReplicator {
    fn sync_meta<'s>(
        &'s self,
        store: Arc<MetaStore>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MetaSyncError>> + Send + 's>> {
        Box::pin(self.sync_meta_impl(store))
    }
}
