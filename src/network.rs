use crate::session::{Envelope, SessionEvent, SessionId};
use if_addrs::{IfAddr, get_if_addrs};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkClass {
    LocalWifi,
    Internet,
}

impl NetworkClass {
    #[must_use]
    pub const fn for_target(is_local: bool) -> Self {
        if is_local { Self::LocalWifi } else { Self::Internet }
    }
}

/// Platform seam: anything that can report whether a network class is up.
pub trait ConnectivitySource: Send + Sync {
    fn subscribe(&self, class: NetworkClass) -> watch::Receiver<bool>;
}

#[derive(Clone)]
pub struct NetworkMonitor {
    source: Arc<dyn ConnectivitySource>,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        Self { source }
    }

    #[must_use]
    pub fn observe(&self, is_local_target: bool) -> NetworkWatch {
        let class = NetworkClass::for_target(is_local_target);
        NetworkWatch {
            rx: self.source.subscribe(class),
            last: None,
        }
    }
}

/// Deduplicated view over one connectivity channel.
pub struct NetworkWatch {
    rx: watch::Receiver<bool>,
    last: Option<bool>,
}

impl NetworkWatch {
    /// Next distinct connectivity state. The first call resolves immediately
    /// with the current state. `None` once the source is gone.
    pub async fn next(&mut self) -> Option<bool> {
        loop {
            if self.last.is_none() {
                let current = *self.rx.borrow_and_update();
                self.last = Some(current);
                return Some(current);
            }
            self.rx.changed().await.ok()?;
            let current = *self.rx.borrow_and_update();
            if self.last != Some(current) {
                self.last = Some(current);
                return Some(current);
            }
        }
    }

    /// Posts every state change to `tx` tagged with `session` until the
    /// returned subscription is dropped.
    #[must_use]
    pub fn forward(
        mut self,
        session: SessionId,
        tx: mpsc::UnboundedSender<Envelope>,
    ) -> NetworkSubscription {
        let task = tokio::spawn(async move {
            while let Some(connected) = self.next().await {
                let envelope = Envelope {
                    session,
                    event: SessionEvent::Network { connected },
                };
                if tx.send(envelope).is_err() {
                    break;
                }
            }
            debug!(%session, "network watch finished");
        });
        NetworkSubscription { task }
    }
}

/// Stops delivery when dropped.
pub struct NetworkSubscription {
    task: JoinHandle<()>,
}

impl Drop for NetworkSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Polls the host's interfaces and a TCP probe target, one poller per class
/// shared by all subscribers.
pub struct InterfaceConnectivity {
    probe_addr: SocketAddr,
    interval: Duration,
    timeout: Duration,
    channels: Mutex<HashMap<NetworkClass, Arc<watch::Sender<bool>>>>,
}

impl InterfaceConnectivity {
    pub const DEFAULT_PROBE: &'static str = "1.1.1.1:443";

    #[must_use]
    pub fn new(probe_addr: SocketAddr, interval: Duration, timeout: Duration) -> Self {
        Self {
            probe_addr,
            interval,
            timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_poller(&self, class: NetworkClass, tx: Arc<watch::Sender<bool>>) {
        let probe_addr = self.probe_addr;
        let interval = self.interval;
        let timeout = self.timeout;
        tokio::spawn(async move {
            loop {
                let up = match class {
                    NetworkClass::LocalWifi => has_private_ipv4(),
                    NetworkClass::Internet => probe_tcp(probe_addr, timeout).await,
                };
                trace!(?class, up, "connectivity probe");
                tx.send_if_modified(|current| {
                    if *current == up {
                        return false;
                    }
                    *current = up;
                    true
                });
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            debug!(?class, "connectivity poller stopped");
        });
    }
}

impl ConnectivitySource for InterfaceConnectivity {
    fn subscribe(&self, class: NetworkClass) -> watch::Receiver<bool> {
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(&class)
            && !tx.is_closed()
        {
            return tx.subscribe();
        }

        // Internet reachability starts optimistic until the first probe lands.
        let initial = match class {
            NetworkClass::LocalWifi => has_private_ipv4(),
            NetworkClass::Internet => true,
        };
        let (tx, rx) = watch::channel(initial);
        let tx = Arc::new(tx);
        channels.insert(class, Arc::clone(&tx));
        drop(channels);
        self.spawn_poller(class, tx);
        rx
    }
}

fn has_private_ipv4() -> bool {
    let Ok(interfaces) = get_if_addrs() else {
        return false;
    };
    interfaces.iter().any(|iface| {
        !iface.is_loopback() && matches!(&iface.addr, IfAddr::V4(v4) if v4.ip.is_private())
    })
}

async fn probe_tcp(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
