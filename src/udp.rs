//! UDP ASSOCIATE relay
//!
//! After an ASSOCIATE handshake the stream carries framed datagrams. Each
//! destination gets its own session: an ephemeral UDP socket plus a receive
//! task that frames replies (tagged with their real source address) back onto
//! the stream. Sessions expire after an idle window; the association ends when
//! the stream does.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::core::{Address, RelayStats, TrojanUdpPacket};
use crate::error::{Result, TrojanError};
use crate::logger::log;

const TCP_WRITE_CHANNEL_BUFFER_SIZE: usize = 256;
const CLEANUP_TIMEOUT_SECS: u64 = 5;

/// One destination's socket within an association
#[derive(Debug)]
struct UdpSession {
    id: u64,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    /// Milliseconds since the association epoch
    last_activity: AtomicU64,
}

impl UdpSession {
    fn touch(&self, now_ms: u64) {
        self.last_activity.fetch_max(now_ms, Ordering::Release);
    }

    fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_activity.load(Ordering::Acquire)))
    }
}

/// All sessions opened by one ASSOCIATE stream
pub struct UdpAssociation {
    peer: SocketAddr,
    sessions: DashMap<Address, Arc<UdpSession>>,
    idle_timeout: Duration,
    buffer_size: usize,
    next_id: AtomicU64,
    /// Encoded frames for the stream writer task
    frames: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    epoch: Instant,
    upload: AtomicU64,
    download: AtomicU64,
}

impl UdpAssociation {
    pub fn new(
        frames: mpsc::Sender<Vec<u8>>,
        config: &ConnConfig,
        peer: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            sessions: DashMap::new(),
            idle_timeout: config.udp_idle_timeout,
            buffer_size: config.udp_buffer_size,
            next_id: AtomicU64::new(0),
            frames,
            cancel: CancellationToken::new(),
            epoch: Instant::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Send one tunneled datagram to its destination, opening a session if needed
    pub async fn dispatch(self: &Arc<Self>, packet: TrojanUdpPacket) -> io::Result<()> {
        let session = self.session_for(&packet.addr).await?;
        let n = session.socket.send_to(&packet.payload, session.target).await?;
        session.touch(self.now_ms());
        self.upload.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Live session id for `addr`, opening a new session if none exists
    pub async fn session_for_id(self: &Arc<Self>, addr: &Address) -> io::Result<u64> {
        Ok(self.session_for(addr).await?.id)
    }

    async fn session_for(self: &Arc<Self>, addr: &Address) -> io::Result<Arc<UdpSession>> {
        if let Some(session) = self.sessions.get(addr) {
            // touched under the shard guard so a concurrent expiry check sees it
            session.touch(self.now_ms());
            return Ok(Arc::clone(&session));
        }

        let target = addr.to_socket_addr().await?;
        let bind_addr = if target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let session = Arc::new(UdpSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            socket: Arc::new(socket),
            target,
            last_activity: AtomicU64::new(self.now_ms()),
        });
        self.sessions.insert(addr.clone(), Arc::clone(&session));

        log::debug!(
            peer = %self.peer,
            target = %addr,
            resolved = %target,
            session = session.id,
            "UDP session opened"
        );

        tokio::spawn(run_session(Arc::clone(self), addr.clone(), Arc::clone(&session)));
        Ok(session)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Bytes moved so far
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
        }
    }

    /// Tear down every session. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.clear();
    }
}

/// Receive loop of one session; ends on idle expiry, socket error or shutdown
async fn run_session(assoc: Arc<UdpAssociation>, key: Address, session: Arc<UdpSession>) {
    let mut buf = vec![0u8; assoc.buffer_size];
    loop {
        let idle = session.idle_for(assoc.now_ms());
        if idle >= assoc.idle_timeout {
            let now = assoc.now_ms();
            let expired = assoc.sessions.remove_if(&key, |_, current| {
                current.id == session.id && current.idle_for(now) >= assoc.idle_timeout
            });
            if expired.is_some() {
                log::debug!(
                    peer = %assoc.peer,
                    target = %key,
                    session = session.id,
                    "UDP session expired"
                );
                return;
            }
            if !assoc.sessions.get(&key).is_some_and(|s| s.id == session.id) {
                return;
            }
            // touched after our check; keep going
            continue;
        }

        let remaining = assoc.idle_timeout - idle;
        let recv = tokio::time::timeout(remaining, session.socket.recv_from(&mut buf));
        tokio::select! {
            _ = assoc.cancel.cancelled() => return,
            result = recv => match result {
                // idle window elapsed, re-checked at the top of the loop
                Err(_) => continue,
                Ok(Ok((n, from))) => {
                    session.touch(assoc.now_ms());
                    let frame = match TrojanUdpPacket::encode(&Address::from(from), &buf[..n]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::debug!(
                                peer = %assoc.peer,
                                from = %from,
                                error = %e,
                                "Dropping UDP datagram"
                            );
                            continue;
                        }
                    };
                    assoc.download.fetch_add(n as u64, Ordering::Relaxed);
                    if assoc.frames.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    log::debug!(
                        peer = %assoc.peer,
                        target = %key,
                        error = %e,
                        "UDP socket recv error"
                    );
                    assoc.sessions.remove_if(&key, |_, current| current.id == session.id);
                    return;
                }
            }
        }
    }
}

/// Relay an ASSOCIATE stream until the client closes it or a frame is malformed
pub async fn relay_udp<S>(stream: S, peer: SocketAddr, config: &ConnConfig) -> Result<RelayStats>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(TCP_WRITE_CHANNEL_BUFFER_SIZE);

    let assoc = UdpAssociation::new(frames_tx, config, peer);
    let assoc = scopeguard::guard(assoc, |assoc| assoc.shutdown());

    // single writer, so frames from different sessions never interleave
    let writer_cancel = assoc.cancel.clone();
    let mut writer_task = tokio::spawn(async move {
        let mut writer = writer;
        let result = loop {
            tokio::select! {
                biased;
                frame = frames_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = writer_cancel.cancelled() => break Ok(()),
            }
        };
        // a failed stream write tears the whole association down
        writer_cancel.cancel();
        let _ = writer.shutdown().await;
        result
    });

    let read_result: io::Result<()> = loop {
        let packet = tokio::select! {
            _ = assoc.cancel.cancelled() => break Ok(()),
            packet = TrojanUdpPacket::read_from(&mut reader) => packet,
        };
        match packet {
            Ok(Some(packet)) => {
                let target = packet.addr.clone();
                if let Err(e) = assoc.dispatch(packet).await {
                    log::debug!(peer = %peer, target = %target, error = %e, "Dropping UDP frame");
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => {
                log::debug!(peer = %peer, error = %e, "Malformed UDP frame");
                break Err(e.into());
            }
        }
    };

    assoc.shutdown();
    let write_result = match tokio::time::timeout(
        Duration::from_secs(CLEANUP_TIMEOUT_SECS),
        &mut writer_task,
    )
    .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(io::Error::other(e)),
        Err(_) => {
            writer_task.abort();
            Ok(())
        }
    };

    let stats = assoc.stats();
    match read_result.and(write_result) {
        Ok(()) => Ok(stats),
        Err(source) => Err(TrojanError::Relay { stats, source }),
    }
}
