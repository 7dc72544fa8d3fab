//! Connection acceptor
//!
//! Listens on TCP or a Unix socket, runs each connection's session on its
//! own task, and bounds concurrency with a semaphore: when every slot is
//! taken a new connection is refused with a temporary failure so the MTA
//! retries later. Shutdown stops accepting, drains in-flight sessions up to
//! the configured grace period, then aborts whatever is left.

use crate::{MilterCodecStream, SessionHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use zpam_common::config::{MilterConfig, MilterNetwork};
use zpam_common::{ZpamError, ZpamResult};
use zpam_filter::ScoreEngine;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

pub struct Acceptor {
    engine: Arc<ScoreEngine>,
    config: MilterConfig,
    listener: Listener,
}

impl Acceptor {
    /// Bind the configured listener. A bind failure is fatal at startup.
    pub async fn bind(engine: Arc<ScoreEngine>, config: MilterConfig) -> ZpamResult<Self> {
        let listener = match config.network {
            MilterNetwork::Tcp => {
                let listener = TcpListener::bind(&config.address)
                    .await
                    .map_err(|e| ZpamError::Bind(format!("{}: {}", config.address, e)))?;
                Listener::Tcp(listener)
            }
            MilterNetwork::Unix => {
                // A stale socket from a previous run blocks the bind.
                let _ = std::fs::remove_file(&config.address);
                let listener = UnixListener::bind(&config.address)
                    .map_err(|e| ZpamError::Bind(format!("{}: {}", config.address, e)))?;
                Listener::Unix(listener)
            }
        };
        Ok(Self {
            engine,
            config,
            listener,
        })
    }

    /// Bound address, for tests binding port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Accept until the shutdown signal flips, then drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ZpamResult<()> {
        tracing::info!(address = %self.config.address, "milter listening");
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let mut sessions: JoinSet<()> = JoinSet::new();
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs.max(1));
        let write_timeout = Duration::from_secs(self.config.write_timeout_secs.max(1));

        loop {
            // Reap finished sessions so the set stays small.
            while sessions.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        tracing::warn!(peer = %peer, "connection cap reached; refusing");
                        refuse(stream).await;
                        continue;
                    };

                    let engine = Arc::clone(&self.engine);
                    let config = self.config.clone();
                    sessions.spawn(async move {
                        let _permit = permit;
                        let mut codec = MilterCodecStream::new(stream, read_timeout, write_timeout);
                        let mut session = SessionHandler::new(engine, config);
                        if let Err(e) = session.run(&mut codec).await {
                            tracing::debug!(peer = %peer, "session ended: {}", e);
                        }
                    });
                }
            }
        }

        tracing::info!(
            in_flight = sessions.len(),
            "shutting down; draining sessions"
        );
        let grace = Duration::from_secs(self.config.graceful_shutdown_timeout_secs);
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "grace period elapsed; aborting sessions"
            );
            sessions.abort_all();
        }
        Ok(())
    }
}

/// Tell an over-cap peer to come back later, best effort.
async fn refuse(mut stream: BoxedStream) {
    let frame: [u8; 5] = [0, 0, 0, 1, b't'];
    let write = async {
        let _ = stream.write_all(&frame).await;
        let _ = stream.flush().await;
    };
    let _ = tokio::time::timeout(Duration::from_millis(250), write).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use zpam_common::config::ZpamConfig;
    use zpam_dns::{DnsCache, DnsCacheConfig, StaticResolver};

    fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        out.push(cmd);
        out.extend_from_slice(payload);
        out
    }

    fn cstr(value: &str) -> Vec<u8> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }

    async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (body[0], body.split_off(1))
    }

    async fn bound_acceptor() -> (Acceptor, watch::Sender<bool>) {
        let mut config = ZpamConfig::default();
        config.milter.address = "127.0.0.1:0".into();
        config.lists.trusted_domains.push("corp.example".into());
        let dns = DnsCache::new(
            Arc::new(StaticResolver::new().txt("corp.example", &["v=spf1 ip4:192.0.2.1 -all"])),
            DnsCacheConfig::default(),
        );
        let engine = Arc::new(ScoreEngine::new(config.clone(), dns, None));
        let acceptor = Acceptor::bind(engine, config.milter.clone()).await.unwrap();
        let (tx, _rx) = watch::channel(false);
        (acceptor, tx)
    }

    #[tokio::test]
    async fn test_end_to_end_session_over_tcp() {
        let (acceptor, shutdown_tx) = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();
        let server = tokio::spawn(acceptor.run(shutdown_tx.subscribe()));

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Negotiate.
        let mut optneg = Vec::new();
        optneg.extend_from_slice(&6u32.to_be_bytes());
        optneg.extend_from_slice(&0xffu32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());
        client.write_all(&frame(b'O', &optneg)).await.unwrap();
        let (cmd, payload) = read_frame(&mut client).await;
        assert_eq!(cmd, b'O');
        assert_eq!(&payload[0..4], &6u32.to_be_bytes());

        // Connect.
        let mut connect = cstr("mail.corp.example");
        connect.push(b'4');
        connect.extend_from_slice(&2525u16.to_be_bytes());
        connect.extend_from_slice(&cstr("192.0.2.1"));
        client.write_all(&frame(b'C', &connect)).await.unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'c');

        client
            .write_all(&frame(b'H', &cstr("mail.corp.example")))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'c');

        client
            .write_all(&frame(b'M', &cstr("<alice@corp.example>")))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'c');

        client
            .write_all(&frame(b'R', &cstr("<bob@dest.example>")))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'c');

        for (name, value) in [
            ("From", "alice@corp.example".to_string()),
            ("Subject", "Weekly notes".to_string()),
            ("Date", chrono::Utc::now().to_rfc2822()),
            ("Message-ID", "<n@corp.example>".to_string()),
        ] {
            let mut payload = cstr(name);
            payload.extend_from_slice(&cstr(&value));
            client.write_all(&frame(b'L', &payload)).await.unwrap();
            assert_eq!(read_frame(&mut client).await.0, b'c');
        }

        client.write_all(&frame(b'N', &[])).await.unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'c');

        client
            .write_all(&frame(b'B', b"Minutes attached as discussed."))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut client).await.0, b'c');

        // End of message: expect the added headers, then continue.
        client.write_all(&frame(b'E', &[])).await.unwrap();
        let mut added_headers = Vec::new();
        loop {
            let (cmd, payload) = read_frame(&mut client).await;
            match cmd {
                b'h' => {
                    let name = payload.split(|&b| b == 0).next().unwrap().to_vec();
                    added_headers.push(String::from_utf8(name).unwrap());
                }
                b'c' => break,
                other => panic!("unexpected response {:?}", other as char),
            }
        }
        assert!(added_headers.contains(&"X-ZPAM-Status".to_string()));
        assert!(added_headers.contains(&"X-ZPAM-Score".to_string()));
        assert!(added_headers.contains(&"X-ZPAM-Score-Raw".to_string()));
        assert!(added_headers.contains(&"X-ZPAM-Info".to_string()));

        client.write_all(&frame(b'Q', &[])).await.unwrap();
        drop(client);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_cap_refuses_with_tempfail() {
        let (acceptor, shutdown_tx) = {
            let mut config = ZpamConfig::default();
            config.milter.address = "127.0.0.1:0".into();
            config.milter.max_connections = 1;
            let dns = DnsCache::new(Arc::new(StaticResolver::new()), DnsCacheConfig::default());
            let engine = Arc::new(ScoreEngine::new(config.clone(), dns, None));
            let acceptor = Acceptor::bind(engine, config.milter.clone()).await.unwrap();
            let (tx, _rx) = watch::channel(false);
            (acceptor, tx)
        };
        let addr = acceptor.local_addr().unwrap();
        let server = tokio::spawn(acceptor.run(shutdown_tx.subscribe()));

        // First connection holds the only slot.
        let held = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second connection is refused with a tempfail frame.
        let mut refused = TcpStream::connect(addr).await.unwrap();
        let (cmd, _) = read_frame(&mut refused).await;
        assert_eq!(cmd, b't');

        // Close both so shutdown drains immediately.
        drop(held);
        drop(refused);
        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_stops_accepting() {
        let (acceptor, shutdown_tx) = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();
        let server = tokio::spawn(acceptor.run(shutdown_tx.subscribe()));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();

        // The listener is gone once run() returns.
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
