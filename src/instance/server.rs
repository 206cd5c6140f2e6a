//! Client TCP Server
//!
//! Accepts client connections for one cache instance and serves get/set
//! requests until the peer disconnects, sends a malformed frame, or the
//! instance stops.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::entity::CacheInstance;
use super::protocol::{self, FrameLimits, Request};
use crate::error::Result;

/// Default concurrent client connections per instance
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Client-facing server of one instance
#[derive(Debug)]
pub struct CacheServer {
    instance: Arc<CacheInstance>,
    listener: TcpListener,
    connections: Arc<Semaphore>,
}

impl CacheServer {
    /// Bind the listener; port 0 picks a free port
    pub async fn bind(instance: Arc<CacheInstance>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            name = %instance.name(),
            addr = %listener.local_addr()?,
            "Cache server listening"
        );
        Ok(Self {
            instance,
            listener,
            connections: Arc::new(Semaphore::new(DEFAULT_MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the instance stops
    pub async fn serve(self) -> Result<()> {
        let shutdown = self.instance.shutdown_token();
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connections).acquire_owned() => permit
                    .map_err(|e| crate::error::Error::Internal(e.to_string()))?,
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let instance = Arc::clone(&self.instance);
                    tokio::spawn(async move {
                        debug!(%peer, "Accepted client");
                        if let Err(e) = handle_connection(instance, stream).await {
                            warn!(%peer, error = %e, "Closing client connection");
                        }
                        drop(permit);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }

        info!(name = %self.instance.name(), "Cache server stopped");
        Ok(())
    }
}

/// Serve one client until it disconnects or misbehaves
pub async fn handle_connection(instance: Arc<CacheInstance>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let store = &instance.config().store;
    let limits = FrameLimits {
        max_key_size: store.max_key_size,
        max_value_size: store.max_value_size,
    };
    let shutdown = instance.shutdown_token();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            request = protocol::read_request(&mut reader, limits) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };

        match request {
            Request::Get { key } => {
                let value = match instance.blocking(move |instance| instance.get(&key)).await {
                    Ok(value) => value,
                    Err(e) => {
                        error!(error = %e, "Lookup failed");
                        None
                    }
                };
                protocol::write_get_reply(&mut writer, value.as_deref()).await?;
            }
            Request::Set { key, value } => {
                let stored = match instance
                    .blocking(move |instance| instance.set(&key, &value))
                    .await
                {
                    Ok(tier) => {
                        debug!(%tier, "Stored value");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to store value");
                        false
                    }
                };
                protocol::write_set_reply(&mut writer, stored).await?;
            }
        }
    }
}

/// Minimal client for the wire protocol
#[derive(Debug)]
pub struct CacheClient {
    stream: TcpStream,
}

impl CacheClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let request = Request::Set {
            key: bytes::Bytes::copy_from_slice(key),
            value: bytes::Bytes::copy_from_slice(value),
        };
        protocol::write_request(&mut self.stream, &request).await?;
        protocol::read_set_reply(&mut self.stream).await
    }

    pub async fn get(&mut self, key: &[u8]) -> Result<Option<bytes::Bytes>> {
        let request = Request::Get {
            key: bytes::Bytes::copy_from_slice(key),
        };
        protocol::write_request(&mut self.stream, &request).await?;
        protocol::read_get_reply(&mut self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceConfig;
    use crate::store::StoreConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(dir: &tempfile::TempDir) -> (Arc<CacheInstance>, SocketAddr) {
        let instance = Arc::new(
            CacheInstance::open(InstanceConfig {
                name: "server-test".to_string(),
                store: StoreConfig {
                    slab_size: 4096,
                    max_slabs: 4,
                    ..StoreConfig::with_disk_path(dir.path())
                },
                ..Default::default()
            })
            .unwrap(),
        );
        let server = CacheServer::bind(Arc::clone(&instance), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        (instance, addr)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, addr) = start(&dir).await;
        let mut client = CacheClient::connect(addr).await.unwrap();

        assert!(client.set(b"user:1", b"alice").await.unwrap());
        assert_eq!(
            client.get(b"user:1").await.unwrap().as_deref(),
            Some(&b"alice"[..])
        );
        assert_eq!(client.get(b"user:2").await.unwrap(), None);

        let stats = instance.tick();
        assert_eq!((stats.sets, stats.hits, stats.misses), (1, 1, 1));
        instance.stop();
    }

    #[tokio::test]
    async fn test_value_larger_than_slab_is_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, addr) = start(&dir).await;
        let mut client = CacheClient::connect(addr).await.unwrap();

        let big = vec![7u8; 10_000];
        assert!(client.set(b"big", &big).await.unwrap());
        assert_eq!(instance.entity_info().disk_keys, 1);
        assert_eq!(
            client.get(b"big").await.unwrap().as_deref(),
            Some(big.as_slice())
        );
        instance.stop();
    }

    #[tokio::test]
    async fn test_oversized_key_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, addr) = start(&dir).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut frame = vec![b'g'];
        frame.extend_from_slice(&10_000u32.to_le_bytes());
        stream.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        instance.stop();
    }

    #[tokio::test]
    async fn test_unknown_opcode_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, addr) = start(&dir).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"q").await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        instance.stop();
    }
}
