//! TCP transport
//!
//! Each session is one TCP stream. The dialer opens with an 8-byte
//! big-endian hello carrying its numeric id so the acceptor can attribute
//! the session; after that the stream carries raw frame bytes.

use crate::transport::nat::NatDetector;
use crate::transport::{EventSender, SessionId, TransportError, TransportEvent, TransportProvider};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};

/// Dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

struct TcpSession {
    net_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    depth: Arc<AtomicUsize>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    net_id: Mutex<Option<(u64, EventSender)>>,
    sessions: Mutex<HashMap<SessionId, TcpSession>>,
    next_session: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, TcpSession>> {
        match self.sessions.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn identity(&self) -> Result<(u64, EventSender), TransportError> {
        let guard = match self.net_id.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(TransportError::NotConfigured)
    }

    fn emit(&self, event: TransportEvent) {
        if let Ok((_, events)) = self.identity() {
            let _ = events.send(event);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut t) => t.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }
}

/// Transport over plain TCP streams
pub struct TcpTransport {
    shared: Arc<Shared>,
    runtime: Handle,
    upnp: bool,
}

impl TcpTransport {
    /// Must be called from within a tokio runtime
    pub fn new(upnp: bool) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NotConfigured)?;
        Ok(Self {
            shared: Arc::new(Shared::default()),
            runtime,
            upnp,
        })
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions().len()
    }
}

/// Register a fresh stream and pump it until it closes
fn start_session(shared: &Arc<Shared>, runtime: &Handle, stream: TcpStream, peer: u64, accepted: bool) {
    let session = shared.next_session.fetch_add(1, Ordering::SeqCst) + 1;
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let depth = Arc::new(AtomicUsize::new(0));

    let writer_shared = shared.clone();
    let writer_depth = depth.clone();
    let writer = runtime.spawn(async move {
        let mut writer = FramedWrite::new(write_half, BytesCodec::new());
        while let Some(chunk) = rx.recv().await {
            if writer.send(chunk).await.is_err() {
                break;
            }
            if writer_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
                writer_shared.emit(TransportEvent::SendQueueDrained { net_id: peer, session });
            }
        }
    });

    let reader_shared = shared.clone();
    let reader = runtime.spawn(async move {
        let mut reader = FramedRead::new(read_half, BytesCodec::new());
        loop {
            match reader.next().await {
                Some(Ok(chunk)) => reader_shared.emit(TransportEvent::Received {
                    net_id: peer,
                    session,
                    data: chunk.to_vec(),
                }),
                Some(Err(e)) => {
                    log::warn!("Error reading session {}: {}", session, e);
                    break;
                }
                None => {
                    log::info!("Session {} closed by remote", session);
                    break;
                }
            }
        }
        writer.abort();
        if reader_shared.sessions().remove(&session).is_some() {
            reader_shared.emit(TransportEvent::Disconnected { net_id: peer, session });
        }
    });

    shared.sessions().insert(
        session,
        TcpSession {
            net_id: peer,
            tx,
            depth,
            reader,
        },
    );
    let event = if accepted {
        TransportEvent::Accepted { net_id: peer, session }
    } else {
        TransportEvent::Connected { net_id: peer, session }
    };
    shared.emit(event);
}

impl TransportProvider for TcpTransport {
    fn configure(&self, net_id: u64, events: EventSender) -> Result<(), TransportError> {
        match self.shared.net_id.lock() {
            Ok(mut g) => *g = Some((net_id, events)),
            Err(poisoned) => *poisoned.into_inner() = Some((net_id, events)),
        }
        Ok(())
    }

    fn listen_direct(&self, ip: IpAddr, port: u16) -> Result<(), TransportError> {
        self.shared.identity()?;
        let addr = SocketAddr::new(ip, port);
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        log::info!("Transport listening on {}", addr);

        let shared = self.shared.clone();
        let runtime = self.runtime.clone();
        let accept = self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, remote)) => {
                        let shared = shared.clone();
                        let runtime = runtime.clone();
                        tokio::spawn(async move {
                            let hello = tokio::time::timeout(DIAL_TIMEOUT, stream.read_u64()).await;
                            match hello {
                                Ok(Ok(peer)) => {
                                    log::debug!("Accepted {} from {}", peer, remote);
                                    start_session(&shared, &runtime, stream, peer, true);
                                }
                                _ => log::warn!("No hello from {}, dropping", remote),
                            }
                        });
                    }
                    Err(e) => log::error!("Accept error: {}", e),
                }
            }
        });
        self.shared.track(accept);

        if self.upnp {
            let shared = self.shared.clone();
            let detect = self.runtime.spawn(async move {
                let nat = NatDetector::new(port);
                let status = nat.detect().await;
                shared.emit(TransportEvent::NatTypeChecked {
                    nat_type: status.nat_type,
                    private_ip: status.private_ip,
                    public_ip: status.public_ip,
                });
                let renewal = nat.spawn_renewal();
                let _ = renewal.await;
            });
            self.shared.track(detect);
        }
        Ok(())
    }

    fn listen_via_relay(&self, _relay_ip: IpAddr, _relay_port: u16) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("relay listening over TCP"))
    }

    fn connect(&self, net_id: u64, ip: IpAddr, port: u16) -> Result<(), TransportError> {
        let (me, _) = self.shared.identity()?;
        let shared = self.shared.clone();
        let runtime = self.runtime.clone();
        let addr = SocketAddr::new(ip, port);

        self.runtime.spawn(async move {
            let dial = async {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_u64(me).await?;
                Ok::<TcpStream, std::io::Error>(stream)
            };
            match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
                Ok(Ok(stream)) => start_session(&shared, &runtime, stream, net_id, false),
                Ok(Err(e)) => {
                    log::warn!("Failed to connect to {}: {}", addr, e);
                    shared.emit(TransportEvent::Disconnected { net_id, session: 0 });
                }
                Err(_) => {
                    log::warn!("Connect to {} timed out", addr);
                    shared.emit(TransportEvent::Disconnected { net_id, session: 0 });
                }
            }
        });
        Ok(())
    }

    fn send(&self, session: SessionId, data: &[u8]) -> Result<(), TransportError> {
        let sessions = self.shared.sessions();
        let s = sessions
            .get(&session)
            .ok_or(TransportError::UnknownSession(session))?;
        s.depth.fetch_add(1, Ordering::SeqCst);
        s.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::Closed)
    }

    fn shutdown(&self, session: SessionId) {
        let removed = self.shared.sessions().remove(&session);
        if let Some(s) = removed {
            s.reader.abort();
            self.shared.emit(TransportEvent::Disconnected {
                net_id: s.net_id,
                session,
            });
        }
    }

    fn outbound_queue_depth(&self, session: SessionId) -> usize {
        self.shared
            .sessions()
            .get(&session)
            .map(|s| s.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn close(&self) {
        let sessions: Vec<SessionId> = self.shared.sessions().keys().copied().collect();
        for session in sessions {
            self.shutdown(session);
        }
        let tasks = match self.shared.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_session_roundtrip() {
        let a = TcpTransport::new(false).unwrap();
        let b = TcpTransport::new(false).unwrap();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.configure(11, a_tx).unwrap();
        b.configure(22, b_tx).unwrap();

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        b.listen_direct(ip, port).unwrap();
        a.connect(22, ip, port).unwrap();

        let session = match next_event(&mut a_rx).await {
            TransportEvent::Connected { net_id: 22, session } => session,
            other => panic!("unexpected event {:?}", other),
        };
        let accepted = match next_event(&mut b_rx).await {
            TransportEvent::Accepted { net_id: 11, session } => session,
            other => panic!("unexpected event {:?}", other),
        };

        a.send_chunked(session, b"hello over tcp").unwrap();
        let mut got = Vec::new();
        while got.len() < 14 {
            match next_event(&mut b_rx).await {
                TransportEvent::Received { net_id: 11, data, .. } => got.extend(data),
                _ => {}
            }
        }
        assert_eq!(&got, b"hello over tcp");

        b.shutdown(accepted);
        loop {
            if let TransportEvent::Disconnected { net_id: 22, .. } = next_event(&mut a_rx).await {
                break;
            }
        }
        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_tcp_dial_failure_reports_disconnect() {
        let a = TcpTransport::new(false).unwrap();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        a.configure(1, a_tx).unwrap();

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        a.connect(9, "127.0.0.1".parse().unwrap(), port).unwrap();
        assert_eq!(
            next_event(&mut a_rx).await,
            TransportEvent::Disconnected { net_id: 9, session: 0 }
        );
    }

    #[test]
    fn test_relay_listen_unsupported() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let t = TcpTransport::new(false).unwrap();
        assert!(matches!(
            t.listen_via_relay("1.2.3.4".parse().unwrap(), 80),
            Err(TransportError::Unsupported(_))
        ));
    }
}
