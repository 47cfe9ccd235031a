//! In-process transport hub
//!
//! Every [`MemoryTransport`] created from the same [`MemoryNetwork`] can
//! dial the others by numeric id, either at their direct listen address or
//! at the relay address they registered with. Delivery is immediate and in
//! order per session.

use crate::transport::{EventSender, SessionId, TransportError, TransportEvent, TransportProvider};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

struct Endpoint {
    events: EventSender,
    relay: Option<SocketAddr>,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<u64, Endpoint>,
    direct: HashMap<SocketAddr, u64>,
    /// session -> (dialer, acceptor)
    sessions: HashMap<SessionId, (u64, u64)>,
    next_session: SessionId,
}

impl Hub {
    fn emit(&self, net_id: u64, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(&net_id) {
            let _ = endpoint.events.send(event);
        }
    }

    fn is_reachable(&self, target: u64, addr: SocketAddr) -> bool {
        if self.direct.get(&addr) == Some(&target) {
            return true;
        }
        self.endpoints
            .get(&target)
            .map(|e| e.relay == Some(addr))
            .unwrap_or(false)
    }

    fn drop_session(&mut self, session: SessionId) {
        if let Some((a, b)) = self.sessions.remove(&session) {
            self.emit(a, TransportEvent::Disconnected { net_id: b, session });
            self.emit(b, TransportEvent::Disconnected { net_id: a, session });
        }
    }
}

/// Shared simulated network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, unconfigured endpoint on this network
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.hub.clone(),
            net_id: Mutex::new(None),
        }
    }

    pub fn session_count(&self) -> usize {
        lock_hub(&self.hub).sessions.len()
    }
}

fn lock_hub(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    match hub.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One endpoint of a [`MemoryNetwork`]
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
    net_id: Mutex<Option<u64>>,
}

impl MemoryTransport {
    fn net_id(&self) -> Result<u64, TransportError> {
        let id = match self.net_id.lock() {
            Ok(id) => *id,
            Err(poisoned) => *poisoned.into_inner(),
        };
        id.ok_or(TransportError::NotConfigured)
    }
}

impl TransportProvider for MemoryTransport {
    fn configure(&self, net_id: u64, events: EventSender) -> Result<(), TransportError> {
        match self.net_id.lock() {
            Ok(mut id) => *id = Some(net_id),
            Err(poisoned) => *poisoned.into_inner() = Some(net_id),
        }
        lock_hub(&self.hub)
            .endpoints
            .insert(net_id, Endpoint { events, relay: None });
        Ok(())
    }

    fn listen_direct(&self, ip: IpAddr, port: u16) -> Result<(), TransportError> {
        let me = self.net_id()?;
        let addr = SocketAddr::new(ip, port);
        let mut hub = lock_hub(&self.hub);
        match hub.direct.get(&addr) {
            Some(owner) if *owner != me => Err(TransportError::AddressInUse(addr.to_string())),
            _ => {
                hub.direct.insert(addr, me);
                log::debug!("[memory] {} listening on {}", me, addr);
                Ok(())
            }
        }
    }

    fn listen_via_relay(&self, relay_ip: IpAddr, relay_port: u16) -> Result<(), TransportError> {
        let me = self.net_id()?;
        let mut hub = lock_hub(&self.hub);
        let endpoint = hub.endpoints.get_mut(&me).ok_or(TransportError::NotConfigured)?;
        endpoint.relay = Some(SocketAddr::new(relay_ip, relay_port));
        Ok(())
    }

    fn connect(&self, net_id: u64, ip: IpAddr, port: u16) -> Result<(), TransportError> {
        let me = self.net_id()?;
        let addr = SocketAddr::new(ip, port);
        let mut hub = lock_hub(&self.hub);

        if !hub.is_reachable(net_id, addr) {
            log::debug!("[memory] {} cannot reach {} at {}", me, net_id, addr);
            hub.emit(me, TransportEvent::Disconnected { net_id, session: 0 });
            return Ok(());
        }

        hub.next_session += 1;
        let session = hub.next_session;
        hub.sessions.insert(session, (me, net_id));
        hub.emit(me, TransportEvent::Connected { net_id, session });
        hub.emit(net_id, TransportEvent::Accepted { net_id: me, session });
        Ok(())
    }

    fn send(&self, session: SessionId, data: &[u8]) -> Result<(), TransportError> {
        let me = self.net_id()?;
        let hub = lock_hub(&self.hub);
        let (a, b) = *hub
            .sessions
            .get(&session)
            .ok_or(TransportError::UnknownSession(session))?;
        let other = if a == me { b } else { a };

        hub.emit(
            other,
            TransportEvent::Received {
                net_id: me,
                session,
                data: data.to_vec(),
            },
        );
        hub.emit(me, TransportEvent::SendQueueDrained { net_id: other, session });
        Ok(())
    }

    fn shutdown(&self, session: SessionId) {
        lock_hub(&self.hub).drop_session(session);
    }

    fn outbound_queue_depth(&self, _session: SessionId) -> usize {
        0
    }

    fn close(&self) {
        let Ok(me) = self.net_id() else {
            return;
        };
        let mut hub = lock_hub(&self.hub);
        let mine: Vec<SessionId> = hub
            .sessions
            .iter()
            .filter(|(_, (a, b))| *a == me || *b == me)
            .map(|(s, _)| *s)
            .collect();
        for session in mine {
            hub.drop_session(session);
        }
        hub.direct.retain(|_, owner| *owner != me);
        hub.endpoints.remove(&me);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn endpoint(net: &MemoryNetwork, id: u64) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let t = net.transport();
        t.configure(id, tx).unwrap();
        (t, rx)
    }

    #[test]
    fn test_direct_connect_and_send() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, 1);
        let (b, mut b_rx) = endpoint(&net, 2);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        b.listen_direct(ip, 9000).unwrap();

        a.connect(2, ip, 9000).unwrap();
        assert_eq!(
            a_rx.try_recv().unwrap(),
            TransportEvent::Connected { net_id: 2, session: 1 }
        );
        assert_eq!(
            b_rx.try_recv().unwrap(),
            TransportEvent::Accepted { net_id: 1, session: 1 }
        );

        a.send(1, b"hi").unwrap();
        assert_eq!(
            b_rx.try_recv().unwrap(),
            TransportEvent::Received { net_id: 1, session: 1, data: b"hi".to_vec() }
        );
        assert!(matches!(
            a_rx.try_recv().unwrap(),
            TransportEvent::SendQueueDrained { net_id: 2, .. }
        ));

        // either side can write on the session
        b.send(1, b"yo").unwrap();
        assert!(matches!(a_rx.try_recv().unwrap(), TransportEvent::Received { net_id: 2, .. }));
    }

    #[test]
    fn test_unreachable_dial_reports_disconnect() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, 1);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        a.connect(5, ip, 1234).unwrap();
        assert_eq!(
            a_rx.try_recv().unwrap(),
            TransportEvent::Disconnected { net_id: 5, session: 0 }
        );
    }

    #[test]
    fn test_relay_dial() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, 1);
        let (b, _b_rx) = endpoint(&net, 2);
        let relay: IpAddr = "119.23.205.254".parse().unwrap();
        b.listen_via_relay(relay, 80).unwrap();

        a.connect(2, relay, 80).unwrap();
        assert!(matches!(a_rx.try_recv().unwrap(), TransportEvent::Connected { net_id: 2, .. }));
    }

    #[test]
    fn test_shutdown_and_close() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, 1);
        let (b, mut b_rx) = endpoint(&net, 2);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        b.listen_direct(ip, 9001).unwrap();
        a.connect(2, ip, 9001).unwrap();
        a.connect(2, ip, 9001).unwrap();
        assert_eq!(net.session_count(), 2);

        a.shutdown(1);
        assert_eq!(net.session_count(), 1);
        assert!(a.send(1, b"x").is_err());

        b.close();
        assert_eq!(net.session_count(), 0);
        while let Ok(ev) = b_rx.try_recv() {
            assert!(!matches!(ev, TransportEvent::Received { .. }));
        }
        let mut disconnects = 0;
        while let Ok(ev) = a_rx.try_recv() {
            if matches!(ev, TransportEvent::Disconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 2);
    }
}
