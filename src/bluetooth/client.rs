use std::{
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::Result;
use bluer::{
    gatt::{
        remote::{Characteristic, CharacteristicWriteRequest, Descriptor},
        CharacteristicFlags, WriteOp,
    },
    Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, Session,
};
use enumflags2::BitFlags;
use futures::{pin_mut, StreamExt};
use log::{debug, error, info, warn};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

use super::{CCCD_UUID, REMOTE_USER_TERMINATED};
use crate::{
    error::{self, SppError},
    event::{
        uuid_from_u16, uuid_to_u16, Address, AttrHandle, AttrKind, CharProp, ConnId, DbElement,
        GattStatus, HandleRange, StackEvent, WriteType,
    },
    session::DEFAULT_MTU,
    stack::{ConnParams, RadioStack, ScanParams},
};

const RESOLVE_POLL: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stack_err(e: bluer::Error) -> SppError {
    SppError::Stack(e.to_string())
}

fn status_of<T>(res: &bluer::Result<T>) -> GattStatus {
    match res {
        Ok(_) => GattStatus::OK,
        Err(_) => GattStatus::ERROR,
    }
}

fn properties(flags: &CharacteristicFlags) -> BitFlags<CharProp> {
    let mut props = BitFlags::empty();
    for (set, prop) in [
        (flags.broadcast, CharProp::Broadcast),
        (flags.read, CharProp::Read),
        (flags.write_without_response, CharProp::WriteNoRsp),
        (flags.write, CharProp::Write),
        (flags.notify, CharProp::Notify),
        (flags.indicate, CharProp::Indicate),
        (flags.authenticated_signed_writes, CharProp::Auth),
        (flags.extended_properties, CharProp::ExtProp),
    ] {
        if set {
            props |= prop;
        }
    }
    props
}

/// bluetoothd only hands out writers for write without response.
fn can_acquire_writer(props: BitFlags<CharProp>) -> bool {
    props.contains(CharProp::WriteNoRsp)
}

/// MTU reported by an acquired writer, the default if none was acquired.
fn acquired_mtu(writer_mtu: bluer::Result<usize>) -> u16 {
    match writer_mtu {
        Ok(mtu) => u16::try_from(mtu).unwrap_or(u16::MAX),
        Err(e) => {
            warn!("failed to acquire writer, assuming MTU {DEFAULT_MTU}: {e}");
            DEFAULT_MTU
        }
    }
}

enum Remote {
    Service,
    Characteristic(Characteristic),
    Descriptor(Descriptor),
    /// Client configuration descriptor handled by bluetoothd.
    Managed,
}

struct Attribute {
    element: DbElement,
    remote: Remote,
}

struct Write {
    handle: AttrHandle,
    characteristic: Characteristic,
    value: Vec<u8>,
    write_type: WriteType,
}

struct Inner {
    _session: Session,
    adapter: Adapter,
    events: mpsc::UnboundedSender<StackEvent>,
    writes: mpsc::UnboundedSender<Write>,
    scan: Mutex<Option<JoinHandle<()>>>,
    device: Mutex<Option<(ConnId, Device)>>,
    attributes: Mutex<Vec<Attribute>>,
    notify_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_conn: AtomicU16,
}

/// [`RadioStack`] on top of bluetoothd.
///
/// BlueZ offers an async api, every request is turned into a spawned task
/// which reports its outcome on the event channel.
pub struct BluezStack {
    inner: Arc<Inner>,
    writer: JoinHandle<()>,
}

impl BluezStack {
    pub async fn new(events: mpsc::UnboundedSender<StackEvent>) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;

        adapter.set_powered(true).await?;

        info!(
            "using bluetooth adapter {} with address {}",
            adapter.name(),
            adapter.address().await?
        );

        let (writes, write_recv) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            _session: session,
            adapter,
            events,
            writes,
            scan: Mutex::new(None),
            device: Mutex::new(None),
            attributes: Mutex::new(Vec::new()),
            notify_tasks: Mutex::new(Vec::new()),
            next_conn: AtomicU16::new(0),
        });
        let writer = tokio::spawn(inner.clone().write_loop(write_recv));
        Ok(BluezStack { inner, writer })
    }

    fn device_for(&self, conn_id: ConnId) -> error::Result<Device> {
        match &*lock(&self.inner.device) {
            Some((id, device)) if *id == conn_id => Ok(device.clone()),
            _ => Err(SppError::NotConnected),
        }
    }

    fn characteristic(&self, handle: AttrHandle) -> error::Result<(Characteristic, DbElement)> {
        lock(&self.inner.attributes)
            .iter()
            .find_map(|a| match &a.remote {
                Remote::Characteristic(c) if a.element.handle == handle => {
                    Some((c.clone(), a.element))
                }
                _ => None,
            })
            .ok_or_else(|| SppError::Stack(format!("no characteristic with handle {handle}")))
    }
}

impl Drop for BluezStack {
    fn drop(&mut self) {
        self.writer.abort();
        self.inner.reset();
        if let Some(scan) = lock(&self.inner.scan).take() {
            scan.abort();
        }
    }
}

impl Inner {
    fn emit(&self, event: StackEvent) {
        if self.events.send(event).is_err() {
            debug!("stack event dropped, session gone");
        }
    }

    /// Forget everything about the current peer.
    fn reset(&self) {
        lock(&self.device).take();
        lock(&self.attributes).clear();
        for task in lock(&self.notify_tasks).drain(..) {
            task.abort();
        }
    }

    async fn scan(self: Arc<Self>, report_duplicates: bool) {
        let discover = if report_duplicates {
            self.adapter.discover_devices_with_changes().await
        } else {
            self.adapter.discover_devices().await
        };
        let discover = match discover {
            Ok(x) => x,
            Err(e) => {
                error!("failed to start discovery: {e}");
                return;
            }
        };
        pin_mut!(discover);

        while let Some(evt) = discover.next().await {
            match evt {
                AdapterEvent::DeviceAdded(addr) => {
                    let device = match self.adapter.device(addr) {
                        Ok(x) => x,
                        Err(e) => {
                            warn!("discovered device {addr} went away: {e}");
                            continue;
                        }
                    };
                    let name = device.name().await.ok().flatten();
                    let rssi = device.rssi().await.ok().flatten();
                    self.emit(StackEvent::ScanResult {
                        peer: Address(addr.0),
                        name,
                        rssi,
                    });
                }
                AdapterEvent::DeviceRemoved(addr) => debug!("device removed {addr}"),
                _ => {}
            }
        }
        debug!("discovery ended");
    }

    async fn connect(self: Arc<Self>, peer: Address, device: Device) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let res = device.connect().await;
        if let Err(e) = &res {
            error!("error connecting to {peer}: {e}");
        } else {
            *lock(&self.device) = Some((conn_id, device.clone()));
            tokio::spawn(self.clone().watch(peer, device));
        }
        self.emit(StackEvent::Connected {
            status: status_of(&res),
            conn_id,
            interface: 0,
            peer,
        });
    }

    async fn watch(self: Arc<Self>, peer: Address, device: Device) {
        let events = match device.events().await {
            Ok(x) => x,
            Err(e) => {
                error!("cannot watch {peer}: {e}");
                return;
            }
        };
        pin_mut!(events);

        while let Some(evt) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = evt {
                self.reset();
                self.emit(StackEvent::Disconnected {
                    peer,
                    reason: REMOTE_USER_TERMINATED,
                });
                return;
            }
        }
    }

    /// Walk the services of `device` and cache the one with uuid `uuid`.
    ///
    /// The cache lists the service first, then its characteristics, then their
    /// descriptors, each group in handle order.
    async fn search(&self, device: Device, uuid: u16) -> bluer::Result<()> {
        while !device.is_services_resolved().await? {
            sleep(RESOLVE_POLL).await;
        }

        let target = uuid_from_u16(uuid);
        for service in device.services().await? {
            if service.uuid().await? != target {
                continue;
            }

            let mut characteristics = Vec::new();
            let mut descriptors = Vec::new();
            for chr in service.characteristics().await? {
                let props = properties(&chr.flags().await?);
                let element = DbElement {
                    kind: AttrKind::Characteristic,
                    handle: chr.id(),
                    uuid: uuid_to_u16(chr.uuid().await?).unwrap_or_default(),
                    properties: props,
                };

                let mut has_cccd = false;
                for desc in chr.descriptors().await? {
                    let desc_uuid = uuid_to_u16(desc.uuid().await?).unwrap_or_default();
                    has_cccd |= desc_uuid == CCCD_UUID;
                    descriptors.push(Attribute {
                        element: DbElement {
                            kind: AttrKind::Descriptor,
                            handle: desc.id(),
                            uuid: desc_uuid,
                            properties: BitFlags::empty(),
                        },
                        remote: Remote::Descriptor(desc),
                    });
                }
                // bluetoothd does not export the configuration descriptor
                if !has_cccd && props.intersects(CharProp::Notify | CharProp::Indicate) {
                    descriptors.push(Attribute {
                        element: DbElement {
                            kind: AttrKind::Descriptor,
                            handle: element.handle.wrapping_add(1),
                            uuid: CCCD_UUID,
                            properties: BitFlags::empty(),
                        },
                        remote: Remote::Managed,
                    });
                }
                characteristics.push(Attribute {
                    element,
                    remote: Remote::Characteristic(chr),
                });
            }
            characteristics.sort_by_key(|a| a.element.handle);
            descriptors.sort_by_key(|a| a.element.handle);

            let start = service.id();
            let end = characteristics
                .iter()
                .chain(descriptors.iter())
                .map(|a| a.element.handle)
                .max()
                .unwrap_or(start)
                .max(start);

            let mut attributes = vec![Attribute {
                element: DbElement {
                    kind: AttrKind::PrimaryService,
                    handle: start,
                    uuid,
                    properties: BitFlags::empty(),
                },
                remote: Remote::Service,
            }];
            attributes.extend(characteristics);
            attributes.extend(descriptors);
            *lock(&self.attributes) = attributes;

            self.emit(StackEvent::ServiceFound {
                uuid,
                range: HandleRange { start, end },
            });
            break;
        }
        Ok(())
    }

    async fn register(self: Arc<Self>, handle: AttrHandle, chr: Characteristic, is_notify: bool) {
        let stream = match chr.notify().await {
            Ok(x) => x,
            Err(e) => {
                error!("failed to subscribe to handle {handle}: {e}");
                self.emit(StackEvent::NotifyRegistered {
                    status: GattStatus::ERROR,
                    handle,
                });
                return;
            }
        };
        self.emit(StackEvent::NotifyRegistered {
            status: GattStatus::OK,
            handle,
        });

        pin_mut!(stream);
        while let Some(value) = stream.next().await {
            self.emit(StackEvent::NotifyReceived {
                handle,
                value,
                is_notify,
            });
        }
        debug!("notification stream for handle {handle} ended");
    }

    /// Writes are issued one at a time in queue order.
    async fn write_loop(self: Arc<Self>, mut writes: mpsc::UnboundedReceiver<Write>) {
        while let Some(w) = writes.recv().await {
            let req = CharacteristicWriteRequest {
                op_type: match w.write_type {
                    WriteType::WithResponse => WriteOp::Request,
                    WriteType::WithoutResponse => WriteOp::Command,
                },
                ..Default::default()
            };
            let res = w.characteristic.write_ext(&w.value, &req).await;
            if let Err(e) = &res {
                error!("write of {} bytes to handle {} failed: {e}", w.value.len(), w.handle);
            }
            if w.write_type == WriteType::WithResponse || res.is_err() {
                self.emit(StackEvent::WriteComplete {
                    status: status_of(&res),
                    handle: w.handle,
                });
            }
        }
    }
}

impl RadioStack for BluezStack {
    fn set_local_mtu(&self, mtu: u16) -> error::Result<()> {
        debug!("local MTU {mtu} is negotiated by bluetoothd");
        Ok(())
    }

    fn start_scan(&self, params: &ScanParams) -> error::Result<()> {
        debug!(
            "scan interval {} window {} active {} are chosen by bluetoothd",
            params.interval, params.window, params.active
        );
        let task = tokio::spawn(self.inner.clone().scan(!params.filter_duplicates));
        if let Some(old) = lock(&self.inner.scan).replace(task) {
            old.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) -> error::Result<()> {
        // dropping the discovery stream stops discovery
        if let Some(task) = lock(&self.inner.scan).take() {
            task.abort();
        }
        Ok(())
    }

    fn connect(&self, peer: Address, params: &ConnParams) -> error::Result<()> {
        debug!(
            "connection interval {}..{} latency {} timeout {} are chosen by bluetoothd",
            params.interval_min, params.interval_max, params.latency, params.supervision_timeout
        );
        let device = self
            .inner
            .adapter
            .device(bluer::Address(peer.0))
            .map_err(stack_err)?;
        tokio::spawn(self.inner.clone().connect(peer, device));
        Ok(())
    }

    fn disconnect(&self, conn_id: ConnId) -> error::Result<()> {
        let device = self.device_for(conn_id)?;
        tokio::spawn(async move {
            if let Err(e) = device.disconnect().await {
                error!("error disconnecting {}: {e}", device.address());
            }
        });
        Ok(())
    }

    fn search_service(&self, conn_id: ConnId, uuid: u16) -> error::Result<()> {
        let device = self.device_for(conn_id)?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let res = inner.search(device, uuid).await;
            if let Err(e) = &res {
                error!("service search failed: {e}");
            }
            inner.emit(StackEvent::SearchComplete {
                status: status_of(&res),
            });
        });
        Ok(())
    }

    fn request_mtu(&self, conn_id: ConnId) -> error::Result<()> {
        self.device_for(conn_id)?;
        // bluetoothd exchanges the MTU on connect, acquiring a writer reveals
        // it. Only write without response characteristics can be acquired.
        let acquirable = lock(&self.inner.attributes)
            .iter()
            .find_map(|a| match &a.remote {
                Remote::Characteristic(c) if can_acquire_writer(a.element.properties) => {
                    Some(c.clone())
                }
                _ => None,
            });
        let chr = match acquirable {
            Some(x) => x,
            None => {
                warn!("no characteristic to learn the MTU from, assuming {DEFAULT_MTU}");
                self.inner.emit(StackEvent::MtuNegotiated {
                    status: GattStatus::OK,
                    mtu: DEFAULT_MTU,
                });
                return Ok(());
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mtu = acquired_mtu(chr.write_io().await.map(|w| w.mtu()));
            inner.emit(StackEvent::MtuNegotiated {
                status: GattStatus::OK,
                mtu,
            });
        });
        Ok(())
    }

    fn attribute_db(&self, conn_id: ConnId, range: HandleRange) -> error::Result<Vec<DbElement>> {
        self.device_for(conn_id)?;
        Ok(lock(&self.inner.attributes)
            .iter()
            .map(|a| a.element)
            .filter(|e| range.contains(e.handle))
            .collect())
    }

    fn register_for_notify(&self, _peer: Address, handle: AttrHandle) -> error::Result<()> {
        let (chr, element) = self.characteristic(handle)?;
        let is_notify = element.properties.contains(CharProp::Notify);
        let task = tokio::spawn(self.inner.clone().register(handle, chr, is_notify));
        lock(&self.inner.notify_tasks).push(task);
        Ok(())
    }

    fn write_descriptor(
        &self,
        conn_id: ConnId,
        handle: AttrHandle,
        value: &[u8],
    ) -> error::Result<()> {
        self.device_for(conn_id)?;
        let remote = lock(&self.inner.attributes)
            .iter()
            .find(|a| a.element.handle == handle)
            .and_then(|a| match &a.remote {
                Remote::Descriptor(d) if a.element.uuid != CCCD_UUID => Some(Some(d.clone())),
                Remote::Descriptor(_) | Remote::Managed => Some(None),
                _ => None,
            });

        match remote {
            None => Err(SppError::Stack(format!("no descriptor with handle {handle}"))),
            // subscribing already wrote the configuration descriptor
            Some(None) => {
                debug!("descriptor {handle} {value:x?} is managed by bluetoothd");
                self.inner.emit(StackEvent::DescriptorWriteComplete {
                    status: GattStatus::OK,
                    handle,
                });
                Ok(())
            }
            Some(Some(desc)) => {
                let inner = self.inner.clone();
                let value = value.to_vec();
                tokio::spawn(async move {
                    let res = desc.write(&value).await;
                    if let Err(e) = &res {
                        error!("descriptor write to handle {handle} failed: {e}");
                    }
                    inner.emit(StackEvent::DescriptorWriteComplete {
                        status: status_of(&res),
                        handle,
                    });
                });
                Ok(())
            }
        }
    }

    fn write_characteristic(
        &self,
        conn_id: ConnId,
        handle: AttrHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> error::Result<()> {
        self.device_for(conn_id)?;
        let (characteristic, _) = self.characteristic(handle)?;
        self.inner
            .writes
            .send(Write {
                handle,
                characteristic,
                value: value.to_vec(),
                write_type,
            })
            .map_err(|_| SppError::QueueFull)
    }
}
