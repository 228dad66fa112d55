use std::{sync::Arc, time::Instant};

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch};

use crate::{
    catalog::{Catalog, Role},
    config::Config,
    error::{Result, SppError},
    event::{Address, AttrHandle, ConnId, GattStatus, HandleRange, StackEvent},
    reassembly::Reassembler,
    registrar::{self, Registrar, RegistrationQueue},
    stack::RadioStack,
};

/// Transfer unit in use before the exchange completes.
pub const DEFAULT_MTU: u16 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    MtuNegotiation,
    NotificationSetup,
    Streaming,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConnection {
    pub peer: Address,
    pub conn_id: ConnId,
    pub interface: u16,
    pub mtu: u16,
}

/// What the background workers need to know about the current connection.
///
/// Published by the session whenever a catalog exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub peer: Address,
    pub conn_id: ConnId,
    pub mtu: u16,
    /// Handle of the receive characteristic.
    pub data_handle: AttrHandle,
    pub writable: bool,
    pub streaming: bool,
}

/// Where completed inbound messages are delivered.
pub type InboundSink = mpsc::UnboundedSender<Vec<u8>>;

pub struct SessionHandles {
    pub registrations: RegistrationQueue,
    pub link: watch::Receiver<Option<Link>>,
}

#[derive(Debug)]
struct InboundStats {
    messages: u64,
    bytes: u64,
    since: Instant,
}

impl InboundStats {
    fn new() -> Self {
        InboundStats {
            messages: 0,
            bytes: 0,
            since: Instant::now(),
        }
    }
}

/// Connection state of the single peer, driven by stack events.
pub struct Session {
    config: Config,
    stack: Arc<dyn RadioStack>,
    state: SessionState,
    connection: Option<PeerConnection>,
    service_range: Option<HandleRange>,
    catalog: Option<Catalog>,
    reassembler: Reassembler,
    registrar: Registrar,
    /// Characteristics whose notifications are not fully enabled yet.
    pending: Vec<AttrHandle>,
    link: watch::Sender<Option<Link>>,
    inbound: InboundSink,
    stats: InboundStats,
}

impl Session {
    pub fn new(
        config: Config,
        stack: Arc<dyn RadioStack>,
        inbound: InboundSink,
    ) -> (Self, SessionHandles) {
        let (registrar, registrations) = registrar::channel(config.registration_queue);
        let (link, link_recv) = watch::channel(None);
        let session = Session {
            config,
            stack,
            state: SessionState::Idle,
            connection: None,
            service_range: None,
            catalog: None,
            reassembler: Reassembler::new(),
            registrar,
            pending: Vec::new(),
            link,
            inbound,
            stats: InboundStats::new(),
        };
        let handles = SessionHandles {
            registrations,
            link: link_recv,
        };
        (session, handles)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> Option<&PeerConnection> {
        self.connection.as_ref()
    }

    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_ref()
    }

    /// Characteristics still waiting for their notifications to be enabled.
    pub fn pending_registrations(&self) -> &[AttrHandle] {
        &self.pending
    }

    pub fn reassembly_in_progress(&self) -> bool {
        self.reassembler.in_progress()
    }

    /// Start looking for the target peer.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Ok(());
        }
        if let Err(e) = self.stack.set_local_mtu(self.config.local_mtu) {
            error!("set local MTU failed: {e}");
        }
        self.begin_scan()
    }

    /// Ask the stack to drop the current peer.
    ///
    /// The session is reset once the stack reports the disconnect.
    pub fn disconnect(&mut self) -> Result<()> {
        let conn = self.connection.ok_or(SppError::NotConnected)?;
        self.state = SessionState::Disconnecting;
        self.stack.disconnect(conn.conn_id)
    }

    pub fn handle(&mut self, event: StackEvent) {
        let res = match event {
            StackEvent::ScanResult { peer, name, rssi } => self.on_scan_result(peer, name, rssi),
            StackEvent::Connected {
                status,
                conn_id,
                interface,
                peer,
            } => self.on_connected(status, conn_id, interface, peer),
            StackEvent::Disconnected { peer, reason } => self.on_disconnected(peer, reason),
            StackEvent::ServiceFound { uuid, range } => {
                self.on_service_found(uuid, range);
                Ok(())
            }
            StackEvent::SearchComplete { status } => self.on_search_complete(status),
            StackEvent::MtuNegotiated { status, mtu } => self.on_mtu(status, mtu),
            StackEvent::NotifyRegistered { status, handle } => {
                self.on_notify_registered(status, handle)
            }
            StackEvent::NotifyReceived {
                handle,
                value,
                is_notify,
            } => self.on_notify(handle, &value, is_notify),
            StackEvent::WriteComplete { status, handle } => {
                if status.is_ok() {
                    Ok(())
                } else {
                    Err(SppError::WriteFailure { handle, status })
                }
            }
            StackEvent::DescriptorWriteComplete { status, handle } => {
                self.on_descriptor_written(status, handle)
            }
        };

        if let Err(e) = res {
            error!("{e}");
        }
    }

    fn begin_scan(&mut self) -> Result<()> {
        self.stack.start_scan(&self.config.scan)?;
        info!("scanning for {}", self.config.target);
        self.state = SessionState::Scanning;
        Ok(())
    }

    fn abort_connection(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("error disconnecting from peer: {e}");
        }
    }

    fn on_scan_result(
        &mut self,
        peer: Address,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> Result<()> {
        debug!("scan result {peer}, name {name:?}, rssi {rssi:?}");
        if peer != self.config.target || self.state != SessionState::Scanning {
            return Ok(());
        }

        info!("found {peer}, connecting");
        self.state = SessionState::Connecting;
        if let Err(e) = self.stack.stop_scan() {
            warn!("error stopping scan: {e}");
        }
        if let Err(e) = self.stack.connect(peer, &self.config.connection) {
            self.state = SessionState::Idle;
            self.begin_scan()?;
            return Err(e);
        }
        Ok(())
    }

    fn on_connected(
        &mut self,
        status: GattStatus,
        conn_id: ConnId,
        interface: u16,
        peer: Address,
    ) -> Result<()> {
        if self.state != SessionState::Connecting {
            warn!("ignoring connect event for {peer} in state {:?}", self.state);
            return Ok(());
        }
        if !status.is_ok() {
            self.state = SessionState::Idle;
            self.begin_scan()?;
            return Err(SppError::Connection {
                op: "connect",
                status,
            });
        }

        info!("connected to {peer}, conn_id {conn_id}");
        self.connection = Some(PeerConnection {
            peer,
            conn_id,
            interface,
            mtu: DEFAULT_MTU,
        });
        self.service_range = None;
        self.stats = InboundStats::new();
        self.state = SessionState::ServiceDiscovery;

        if let Err(e) = self.stack.search_service(conn_id, self.config.service_uuid) {
            self.abort_connection();
            return Err(e);
        }
        Ok(())
    }

    fn on_service_found(&mut self, uuid: u16, range: HandleRange) {
        info!(
            "service 0x{uuid:04x}, start handle {}, end handle {}",
            range.start, range.end
        );
        if self.state == SessionState::ServiceDiscovery && uuid == self.config.service_uuid {
            self.service_range = Some(range);
        }
    }

    fn on_search_complete(&mut self, status: GattStatus) -> Result<()> {
        if self.state != SessionState::ServiceDiscovery {
            return Ok(());
        }
        let conn = self.connection.ok_or(SppError::NotConnected)?;
        if !status.is_ok() {
            self.abort_connection();
            return Err(SppError::Connection {
                op: "service search",
                status,
            });
        }
        if self.service_range.is_none() {
            return Err(SppError::ServiceNotFound(self.config.service_uuid));
        }

        self.state = SessionState::MtuNegotiation;
        if let Err(e) = self.stack.request_mtu(conn.conn_id) {
            self.abort_connection();
            return Err(e);
        }
        Ok(())
    }

    fn on_mtu(&mut self, status: GattStatus, mtu: u16) -> Result<()> {
        if self.state != SessionState::MtuNegotiation {
            return Ok(());
        }
        if !status.is_ok() {
            self.abort_connection();
            return Err(SppError::Connection {
                op: "MTU exchange",
                status,
            });
        }
        let conn = match self.connection.as_mut() {
            Some(c) => {
                c.mtu = mtu;
                *c
            }
            None => return Err(SppError::NotConnected),
        };
        info!("MTU exchanged, mtu {mtu}");
        self.state = SessionState::NotificationSetup;

        let range = self
            .service_range
            .ok_or(SppError::ServiceNotFound(self.config.service_uuid))?;
        let catalog = Catalog::build(self.stack.attribute_db(conn.conn_id, range)?)?;
        catalog.log();

        let notify = catalog.handle(Role::NotifyData);
        self.link.send_replace(Some(Link {
            peer: conn.peer,
            conn_id: conn.conn_id,
            mtu,
            data_handle: catalog.handle(Role::ReceiveData),
            writable: catalog.is_writable(Role::ReceiveData),
            streaming: false,
        }));
        self.catalog = Some(catalog);
        self.pending = vec![notify];
        self.registrar.enqueue(notify)
    }

    fn on_notify_registered(&mut self, status: GattStatus, handle: AttrHandle) -> Result<()> {
        info!("notification register, status {status}, handle {handle}");
        if !status.is_ok() {
            return Err(SppError::Connection {
                op: "register for notify",
                status,
            });
        }
        let conn = self.connection.ok_or(SppError::NotConnected)?;
        let descriptor = match self
            .catalog
            .as_ref()
            .and_then(|c| c.config_descriptor_for(handle))
        {
            Some(x) => x,
            None => {
                warn!("no configuration descriptor for handle {handle}");
                return Ok(());
            }
        };
        let value = registrar::descriptor_value(self.config.notify_mode);
        self.stack.write_descriptor(conn.conn_id, descriptor, &value)
    }

    fn on_descriptor_written(&mut self, status: GattStatus, handle: AttrHandle) -> Result<()> {
        info!("descriptor write, status {status}, handle {handle}");
        if !status.is_ok() {
            return Err(SppError::WriteFailure { handle, status });
        }
        if self.state != SessionState::NotificationSetup {
            return Ok(());
        }
        if let Some(catalog) = self.catalog.as_ref() {
            self.pending
                .retain(|c| catalog.config_descriptor_for(*c) != Some(handle));
        }
        if self.pending.is_empty() {
            let link = self.link.borrow().map(|l| Link {
                streaming: true,
                ..l
            });
            self.link.send_replace(link);
            self.state = SessionState::Streaming;
            info!("notifications enabled, streaming");
        }
        Ok(())
    }

    fn on_notify(&mut self, handle: AttrHandle, value: &[u8], is_notify: bool) -> Result<()> {
        trace!(
            "{} on handle {handle}, {} bytes: {:x?}",
            if is_notify { "notification" } else { "indication" },
            value.len(),
            value
        );
        let notify_handle = match self.catalog.as_ref() {
            Some(c) => c.handle(Role::NotifyData),
            None => {
                error!("notification on handle {handle} before discovery");
                return Ok(());
            }
        };
        if handle != notify_handle {
            info!("notification on other handle {handle}, {} bytes", value.len());
            return Ok(());
        }

        let mtu = self.connection.map(|c| c.mtu).unwrap_or(DEFAULT_MTU);
        if let Some(msg) = self.reassembler.push(value, mtu)? {
            self.deliver(msg);
        }
        Ok(())
    }

    fn deliver(&mut self, msg: Vec<u8>) {
        debug!("delivering {} bytes", msg.len());
        self.stats.messages += 1;
        self.stats.bytes += msg.len() as u64;
        if self.inbound.send(msg).is_err() {
            warn!("inbound sink closed, dropping message");
        }
    }

    fn on_disconnected(&mut self, peer: Address, reason: u8) -> Result<()> {
        info!("disconnected from {peer}, reason 0x{reason:02x}");
        if self.connection.take().is_some() {
            info!(
                "received {} messages, {} bytes in {:?}",
                self.stats.messages,
                self.stats.bytes,
                self.stats.since.elapsed()
            );
        }
        self.catalog = None;
        self.service_range = None;
        self.pending.clear();
        self.reassembler.reset();
        self.link.send_replace(None);
        self.state = SessionState::Idle;
        self.begin_scan()
    }
}

/// Feed stack events into `session` until the stack goes away.
pub async fn dispatch(session: &mut Session, events: &mut mpsc::UnboundedReceiver<StackEvent>) {
    while let Some(event) = events.recv().await {
        session.handle(event);
    }
    debug!("stack event channel closed");
}
