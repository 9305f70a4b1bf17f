//! LocalNetwork - プロセス内のメッセージ配送
//!
//! Every node of the process binds its primary address here. A send looks
//! the destination up, then delivers the bytes on the io runtime after the
//! configured latency. Messages from one sender to one receiver may be
//! reordered once latency is non-zero.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::domain::EndPoint;
use crate::error::{SpindleError, SpindleResult};
use crate::impls::IoRuntime;
use crate::ports::{Inbox, Transport};

pub struct LocalNetwork {
    routes: RwLock<HashMap<EndPoint, Weak<dyn Inbox>>>,
    io: Arc<IoRuntime>,
    latency: Duration,
}

impl LocalNetwork {
    pub fn new(io: Arc<IoRuntime>) -> Self {
        Self::with_latency(io, Duration::ZERO)
    }

    pub fn with_latency(io: Arc<IoRuntime>, latency: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            io,
            latency,
        }
    }

    /// Addresses with a live inbox.
    pub fn bound_addresses(&self) -> Vec<EndPoint> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<EndPoint> = routes
            .iter()
            .filter(|(_, inbox)| inbox.strong_count() > 0)
            .map(|(address, _)| address.clone())
            .collect();
        addresses.sort();
        addresses
    }
}

impl Transport for LocalNetwork {
    fn bind(&self, address: &EndPoint, inbox: Weak<dyn Inbox>) -> SpindleResult<()> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = routes.get(address)
            && existing.strong_count() > 0
        {
            return Err(SpindleError::argument(format!("{address} is already bound")));
        }
        routes.insert(address.clone(), inbox);
        debug!(%address, "end point bound");
        Ok(())
    }

    fn unbind(&self, address: &EndPoint) {
        let removed = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if removed.is_some() {
            debug!(%address, "end point unbound");
        }
    }

    fn send(&self, from: &EndPoint, to: &EndPoint, bytes: Vec<u8>) -> SpindleResult<()> {
        let inbox = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| SpindleError::network(format!("{to} is unreachable")))?;

        trace!(%from, %to, len = bytes.len(), "message accepted");
        let latency = self.latency;
        self.io.handle().spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            inbox.on_message(bytes);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc::{self, Sender};
    use std::time::Instant;

    struct Recorder(Mutex<Sender<Vec<u8>>>);

    impl Inbox for Recorder {
        fn on_message(&self, bytes: Vec<u8>) {
            let _ = self.0.lock().unwrap().send(bytes);
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Recorder(Mutex::new(tx))), rx)
    }

    fn ep(port: u16) -> EndPoint {
        EndPoint::new("localhost", port)
    }

    fn as_weak(inbox: &Arc<Recorder>) -> Weak<dyn Inbox> {
        let inbox: Arc<dyn Inbox> = inbox.clone();
        Arc::downgrade(&inbox)
    }

    #[test]
    fn delivers_to_bound_inbox() {
        let net = LocalNetwork::new(Arc::new(IoRuntime::new(1).unwrap()));
        let (inbox, rx) = recorder();
        net.bind(&ep(1), as_weak(&inbox)).unwrap();

        net.send(&ep(2), &ep(1), b"hello".to_vec()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"hello");
    }

    #[test]
    fn unknown_destination_is_network_error() {
        let net = LocalNetwork::new(Arc::new(IoRuntime::new(1).unwrap()));
        let err = net.send(&ep(2), &ep(9), vec![1]).unwrap_err();
        assert!(matches!(err, SpindleError::Network(_)));
    }

    #[test]
    fn dropped_inbox_is_unreachable() {
        let net = LocalNetwork::new(Arc::new(IoRuntime::new(1).unwrap()));
        let (inbox, _rx) = recorder();
        net.bind(&ep(1), as_weak(&inbox)).unwrap();
        drop(inbox);

        assert!(net.send(&ep(2), &ep(1), vec![1]).is_err());
        assert!(net.bound_addresses().is_empty());
    }

    #[test]
    fn double_bind_is_rejected_until_unbound() {
        let net = LocalNetwork::new(Arc::new(IoRuntime::new(1).unwrap()));
        let (a, _ra) = recorder();
        let (b, _rb) = recorder();
        net.bind(&ep(1), as_weak(&a)).unwrap();
        assert!(matches!(
            net.bind(&ep(1), as_weak(&b)),
            Err(SpindleError::Argument(_))
        ));

        net.unbind(&ep(1));
        net.bind(&ep(1), as_weak(&b)).unwrap();
        assert_eq!(net.bound_addresses(), vec![ep(1)]);
    }

    #[test]
    fn latency_delays_delivery() {
        let net = LocalNetwork::with_latency(
            Arc::new(IoRuntime::new(1).unwrap()),
            Duration::from_millis(30),
        );
        let (inbox, rx) = recorder();
        net.bind(&ep(1), as_weak(&inbox)).unwrap();

        let started = Instant::now();
        net.send(&ep(2), &ep(1), vec![0]).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
