extern crate tokio;
extern crate undermoon_broker;
#[macro_use]
extern crate log;
extern crate config;
extern crate env_logger;
#[macro_use(defer)]
extern crate scopeguard;

use arc_swap::ArcSwap;
use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use undermoon_broker::broker::{
    gen_routes, JsonFileStorage, JsonMetaReplicator, MemBrokerConfig, MemBrokerService,
    MetaPersistence, RespEpochFetcher,
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn gen_conf() -> Result<MemBrokerConfig, Box<dyn Error>> {
    let mut config_builder = config::Config::builder();
    // If config file is specified, load it.
    if let Some(conf_file_path) = env::args().nth(1) {
        config_builder = config_builder.add_source(config::File::with_name(&conf_file_path));
    }
    // e.g. UNDERMOON_ADDRESS='127.0.0.1:7799'
    let s = config_builder
        .add_source(config::Environment::with_prefix("undermoon"))
        .build()
        .map_err(|e| {
            warn!("failed to read config from file or env vars {:?}", e);
            "failed to read config"
        })?;

    let replica_addresses = if let Ok(list) = s.get::<Vec<String>>("replica_addresses") {
        list
    } else {
        // e.g. UNDERMOON_REPLICA_ADDRESSES='127.0.0.1:8899,127.0.0.1:9999'
        s.get::<String>("replica_addresses")
            .map(|addresses| {
                addresses
                    .split(',')
                    .map(|address| address.trim().to_string())
                    .filter(|address| !address.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec![])
    };

    let config = MemBrokerConfig {
        address: s
            .get::<String>("address")
            .unwrap_or_else(|_| "127.0.0.1:7799".to_string()),
        failure_ttl: s.get::<u64>("failure_ttl").unwrap_or(60),
        failure_quorum: s.get::<u64>("failure_quorum").unwrap_or(1),
        migration_limit: s.get::<u64>("migration_limit").unwrap_or(2),
        recover_from_meta_file: s.get::<bool>("recover_from_meta_file").unwrap_or(true),
        meta_filename: s
            .get::<String>("meta_filename")
            .unwrap_or_else(|_| "metadata".to_string()),
        auto_update_meta_file: s.get::<bool>("auto_update_meta_file").unwrap_or(false),
        update_meta_file_interval: s
            .get::<u64>("update_meta_file_interval")
            .ok()
            .and_then(NonZeroU64::new),
        replica_addresses: Arc::new(ArcSwap::new(Arc::new(replica_addresses))),
        sync_meta_interval: s
            .get::<u64>("sync_meta_interval")
            .ok()
            .and_then(NonZeroU64::new),
        proxy_sync_timeout: Duration::from_secs(s.get::<u64>("proxy_sync_timeout").unwrap_or(30)),
        debug: s.get::<bool>("debug").unwrap_or(false),
    };
    Ok(config)
}

async fn keep_updating_meta_file(service: Arc<MemBrokerService>, interval: Duration) {
    loop {
        defer!(debug!("updating meta file finished a round"));
        if let Err(err) = service.update_meta_file().await {
            error!("failed to update meta file: {}", err);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn keep_syncing_meta(service: Arc<MemBrokerService>, interval: Duration) {
    loop {
        defer!(debug!("syncing meta to replicas finished a round"));
        if let Err(err) = service.sync_meta().await {
            error!("failed to sync meta to replicas: {}", err);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn run(config: MemBrokerConfig) -> Result<(), Box<dyn Error>> {
    let address: SocketAddr = config.address.parse()?;

    let meta_persistence = Arc::new(JsonFileStorage::new(config.meta_filename.clone()));
    let last_meta_store = if config.recover_from_meta_file {
        let meta_store = meta_persistence.load().await?;
        if meta_store.is_none() {
            info!("no meta file found in {}", config.meta_filename);
        }
        meta_store
    } else {
        None
    };

    let meta_replicator = Arc::new(JsonMetaReplicator::new(
        config.replica_addresses.clone(),
        reqwest::Client::new(),
    ));
    let epoch_fetcher = Arc::new(RespEpochFetcher::new(Duration::from_secs(1)));

    let update_meta_file_interval = config.update_meta_file_interval;
    let sync_meta_interval = config.sync_meta_interval;

    let service = MemBrokerService::new(
        config,
        meta_persistence,
        meta_replicator,
        epoch_fetcher,
        None,
        last_meta_store,
    )?;
    let service = Arc::new(service);
    service.init().await?;

    if let Some(interval) = update_meta_file_interval {
        let interval = Duration::from_secs(interval.get());
        tokio::spawn(keep_updating_meta_file(service.clone(), interval));
    }
    if let Some(interval) = sync_meta_interval {
        let interval = Duration::from_secs(interval.get());
        tokio::spawn(keep_syncing_meta(service.clone(), interval));
    }

    info!("mem broker listening on {}", address);
    warp::serve(gen_routes(service)).run(address).await;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = gen_conf()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}
