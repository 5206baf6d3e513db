use crate::common::utils::ThreadSafe;
use async_trait::async_trait;
use futures::future;
use mockall::automock;
use std::cmp::max;
use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum EpochFetchError {
    Io(io::Error),
    Timeout,
    InvalidReply(String),
}

impl fmt::Display for EpochFetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Timeout => write!(f, "timeout"),
            Self::InvalidReply(reply) => write!(f, "invalid reply: {:?}", reply),
        }
    }
}

impl Error for EpochFetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[automock]
#[async_trait]
pub trait ProxyEpochFetcher: ThreadSafe {
    async fn fetch_epoch(&self, address: String) -> Result<u64, EpochFetchError>;
}

const GET_EPOCH_CMD: &[u8] = b"*2\r\n$5\r\nUMCTL\r\n$8\r\nGETEPOCH\r\n";

// Sends `UMCTL GETEPOCH` to the server proxy and expects an integer reply.
pub struct RespEpochFetcher {
    timeout: Duration,
}

impl RespEpochFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn fetch_epoch_impl(address: &str) -> Result<u64, EpochFetchError> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(EpochFetchError::Io)?;
        stream
            .write_all(GET_EPOCH_CMD)
            .await
            .map_err(EpochFetchError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(EpochFetchError::Io)?;

        Self::parse_reply(&line)
    }

    fn parse_reply(line: &str) -> Result<u64, EpochFetchError> {
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if !line.starts_with(':') {
            return Err(EpochFetchError::InvalidReply(line.to_string()));
        }
        btoi::btou::<u64>(line[1..].as_bytes())
            .map_err(|_| EpochFetchError::InvalidReply(line.to_string()))
    }
}

#[async_trait]
impl ProxyEpochFetcher for RespEpochFetcher {
    async fn fetch_epoch(&self, address: String) -> Result<u64, EpochFetchError> {
        match tokio::time::timeout(self.timeout, Self::fetch_epoch_impl(&address)).await {
            Ok(res) => res,
            Err(_) => Err(EpochFetchError::Timeout),
        }
    }
}

pub struct EpochFetchResult {
    pub max_epoch: u64,
    pub failed_addresses: Vec<String>,
}

pub async fn fetch_max_epoch(
    fetcher: &dyn ProxyEpochFetcher,
    proxy_addresses: Vec<String>,
) -> EpochFetchResult {
    let futs: Vec<_> = proxy_addresses
        .into_iter()
        .map(|address| async move {
            let res = fetcher.fetch_epoch(address.clone()).await;
            (address, res)
        })
        .collect();
    let results = future::join_all(futs).await;

    let mut failed_addresses = vec![];
    let mut max_epoch = 0;
    for (address, res) in results.into_iter() {
        match res {
            Ok(epoch) => {
                max_epoch = max(max_epoch, epoch);
            }
            Err(err) => {
                error!("failed to get epoch from proxy {}: {}", address, err);
                failed_addresses.push(address);
            }
        }
    }
    EpochFetchResult {
        max_epoch,
        failed_addresses,
    }
}

// Polls until every proxy reports at least `epoch`.
// Unreachable proxies are polled again. The caller bounds the total time.
pub async fn wait_for_proxy_epoch(
    fetcher: &dyn ProxyEpochFetcher,
    proxy_addresses: Vec<String>,
    epoch: u64,
    interval: Duration,
) {
    let mut pending = proxy_addresses;
    loop {
        let futs: Vec<_> = pending
            .iter()
            .map(|address| fetcher.fetch_epoch(address.clone()))
            .collect();
        let results = future::join_all(futs).await;

        pending = pending
            .into_iter()
            .zip(results.into_iter())
            .filter_map(|(address, res)| match res {
                Ok(proxy_epoch) if proxy_epoch >= epoch => None,
                Ok(_) => Some(address),
                Err(err) => {
                    warn!("failed to get epoch from proxy {}: {}", address, err);
                    Some(address)
                }
            })
            .collect();

        if pending.is_empty() {
            return;
        }
        info!("waiting for proxies {:?} to reach epoch {}", pending, epoch);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_reply() {
        assert_eq!(RespEpochFetcher::parse_reply(":233\r\n").unwrap(), 233);
        assert!(RespEpochFetcher::parse_reply("-ERR\r\n").is_err());
        assert!(RespEpochFetcher::parse_reply(":abc\r\n").is_err());
        assert!(RespEpochFetcher::parse_reply("").is_err());
    }

    #[tokio::test]
    async fn test_fetch_max_epoch() {
        let mut mock_fetcher = MockProxyEpochFetcher::new();
        mock_fetcher
            .expect_fetch_epoch()
            .returning(|address| match address.as_str() {
                "127.0.0.1:5299" => Ok(7),
                "127.0.0.1:5300" => Ok(9),
                _ => Err(EpochFetchError::Timeout),
            });

        let res = fetch_max_epoch(
            &mock_fetcher,
            vec![
                "127.0.0.1:5299".to_string(),
                "127.0.0.1:5300".to_string(),
                "127.0.0.1:5301".to_string(),
            ],
        )
        .await;
        assert_eq!(res.max_epoch, 9);
        assert_eq!(res.failed_addresses, vec!["127.0.0.1:5301".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_for_proxy_epoch() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        let mut mock_fetcher = MockProxyEpochFetcher::new();
        // The proxy catches up on the third poll.
        mock_fetcher.expect_fetch_epoch().returning(move |_| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(EpochFetchError::Timeout)
            } else {
                Ok(n + 9)
            }
        });

        wait_for_proxy_epoch(
            &mock_fetcher,
            vec!["127.0.0.1:5299".to_string()],
            11,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resp_fetcher_against_fake_proxy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0; GET_EPOCH_CMD.len()];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf.as_slice(), GET_EPOCH_CMD);
            socket.write_all(b":42\r\n").await.unwrap();
        });

        let fetcher = RespEpochFetcher::new(Duration::from_secs(1));
        assert_eq!(fetcher.fetch_epoch(address).await.unwrap(), 42);
    }
}
