#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use enumflags2::BitFlags;
use spp::{
    config::Config,
    error::{Result, SppError},
    event::{
        Address, AttrHandle, AttrKind, CharProp, ConnId, DbElement, GattStatus, HandleRange,
        StackEvent, WriteType,
    },
    session::{Session, SessionHandles},
    stack::{ConnParams, RadioStack, ScanParams},
};
use tokio::sync::mpsc;

pub const PEER: Address = Address([0x98, 0xda, 0x20, 0x04, 0x43, 0xa4]);
pub const CONN_ID: ConnId = 3;
pub const SERVICE: AttrHandle = 40;
pub const NOTIFY: AttrHandle = 42;
pub const RECEIVE: AttrHandle = 44;
pub const NOTIFY_CONFIG: AttrHandle = 45;

/// Request made of the fake stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetLocalMtu(u16),
    StartScan,
    StopScan,
    Connect(Address),
    Disconnect(ConnId),
    SearchService(ConnId, u16),
    RequestMtu(ConnId),
    AttributeDb(ConnId, HandleRange),
    RegisterForNotify(Address, AttrHandle),
    WriteDescriptor(ConnId, AttrHandle, Vec<u8>),
    WriteCharacteristic(ConnId, AttrHandle, Vec<u8>, WriteType),
}

/// Radio stack that records every request and answers none of them.
///
/// Tests play the stack's part by feeding events to the session directly.
#[derive(Default)]
pub struct FakeStack {
    calls: Mutex<Vec<Call>>,
    db: Mutex<Vec<DbElement>>,
    /// Packets the controller accepts before reporting no credits.
    credits: Mutex<Option<usize>>,
    credit_polls: AtomicUsize,
    reject_connect: Mutex<bool>,
    /// Characteristic writes accepted before the rest are rejected.
    write_limit: Mutex<Option<usize>>,
}

impl FakeStack {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeStack {
            db: Mutex::new(spp_db()),
            ..Default::default()
        })
    }

    pub fn with_db(db: Vec<DbElement>) -> Arc<Self> {
        let stack = Self::new();
        *stack.db.lock().unwrap() = db;
        stack
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::WriteCharacteristic(_, _, v, _) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn set_credits(&self, credits: Option<usize>) {
        *self.credits.lock().unwrap() = credits;
    }

    pub fn credit_polls(&self) -> usize {
        self.credit_polls.load(Ordering::SeqCst)
    }

    pub fn reject_connect(&self, reject: bool) {
        *self.reject_connect.lock().unwrap() = reject;
    }

    pub fn reject_writes_after(&self, accepted: usize) {
        *self.write_limit.lock().unwrap() = Some(accepted);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RadioStack for FakeStack {
    fn set_local_mtu(&self, mtu: u16) -> Result<()> {
        self.record(Call::SetLocalMtu(mtu));
        Ok(())
    }

    fn start_scan(&self, _params: &ScanParams) -> Result<()> {
        self.record(Call::StartScan);
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    fn connect(&self, peer: Address, _params: &ConnParams) -> Result<()> {
        self.record(Call::Connect(peer));
        if *self.reject_connect.lock().unwrap() {
            return Err(SppError::Stack("connect rejected".to_string()));
        }
        Ok(())
    }

    fn disconnect(&self, conn_id: ConnId) -> Result<()> {
        self.record(Call::Disconnect(conn_id));
        Ok(())
    }

    fn search_service(&self, conn_id: ConnId, uuid: u16) -> Result<()> {
        self.record(Call::SearchService(conn_id, uuid));
        Ok(())
    }

    fn request_mtu(&self, conn_id: ConnId) -> Result<()> {
        self.record(Call::RequestMtu(conn_id));
        Ok(())
    }

    fn attribute_db(&self, conn_id: ConnId, range: HandleRange) -> Result<Vec<DbElement>> {
        self.record(Call::AttributeDb(conn_id, range));
        Ok(self
            .db
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|e| range.contains(e.handle))
            .collect())
    }

    fn register_for_notify(&self, peer: Address, handle: AttrHandle) -> Result<()> {
        self.record(Call::RegisterForNotify(peer, handle));
        Ok(())
    }

    fn write_descriptor(&self, conn_id: ConnId, handle: AttrHandle, value: &[u8]) -> Result<()> {
        self.record(Call::WriteDescriptor(conn_id, handle, value.to_vec()));
        Ok(())
    }

    fn write_characteristic(
        &self,
        conn_id: ConnId,
        handle: AttrHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        if let Some(limit) = *self.write_limit.lock().unwrap() {
            if self.writes().len() >= limit {
                return Err(SppError::Stack("write rejected".to_string()));
            }
        }
        self.record(Call::WriteCharacteristic(
            conn_id,
            handle,
            value.to_vec(),
            write_type,
        ));
        let mut credits = self.credits.lock().unwrap();
        if let Some(c) = credits.as_mut() {
            *c = c.saturating_sub(1);
        }
        Ok(())
    }

    fn sendable_packets(&self, _conn_id: ConnId) -> Option<usize> {
        self.credit_polls.fetch_add(1, Ordering::SeqCst);
        *self.credits.lock().unwrap()
    }
}

pub fn spp_db() -> Vec<DbElement> {
    vec![
        DbElement {
            kind: AttrKind::PrimaryService,
            handle: SERVICE,
            uuid: 0xffe0,
            properties: BitFlags::empty(),
        },
        DbElement {
            kind: AttrKind::Characteristic,
            handle: NOTIFY,
            uuid: 0xffe1,
            properties: CharProp::Notify | CharProp::Read,
        },
        DbElement {
            kind: AttrKind::Characteristic,
            handle: RECEIVE,
            uuid: 0xffe2,
            properties: CharProp::Write | CharProp::WriteNoRsp,
        },
        DbElement {
            kind: AttrKind::Descriptor,
            handle: NOTIFY_CONFIG,
            uuid: 0x2902,
            properties: BitFlags::empty(),
        },
    ]
}

pub struct Harness {
    pub stack: Arc<FakeStack>,
    pub session: Session,
    pub handles: SessionHandles,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Harness {
    pub fn new(stack: Arc<FakeStack>) -> Self {
        Self::with_config(stack, Config::default())
    }

    pub fn with_config(stack: Arc<FakeStack>, config: Config) -> Self {
        let (inbound_send, inbound) = mpsc::unbounded_channel();
        let (session, handles) = Session::new(config, stack.clone(), inbound_send);
        Harness {
            stack,
            session,
            handles,
            inbound,
        }
    }

    pub fn connect(&mut self) {
        self.session.start().unwrap();
        self.session.handle(StackEvent::ScanResult {
            peer: PEER,
            name: Some("SPP".to_string()),
            rssi: Some(-40),
        });
        self.session.handle(StackEvent::Connected {
            status: GattStatus::OK,
            conn_id: CONN_ID,
            interface: 1,
            peer: PEER,
        });
    }

    /// Drive the session from idle through discovery up to the MTU exchange.
    pub fn discover(&mut self, mtu: u16) {
        self.connect();
        self.session.handle(StackEvent::ServiceFound {
            uuid: 0xffe0,
            range: HandleRange { start: 40, end: 50 },
        });
        self.session.handle(StackEvent::SearchComplete {
            status: GattStatus::OK,
        });
        self.session.handle(StackEvent::MtuNegotiated {
            status: GattStatus::OK,
            mtu,
        });
    }

    /// Drive the session all the way to streaming.
    pub fn stream(&mut self, mtu: u16) {
        self.discover(mtu);
        assert_eq!(self.handles.registrations.try_recv().unwrap(), NOTIFY);
        self.session.handle(StackEvent::NotifyRegistered {
            status: GattStatus::OK,
            handle: NOTIFY,
        });
        self.session.handle(StackEvent::DescriptorWriteComplete {
            status: GattStatus::OK,
            handle: NOTIFY_CONFIG,
        });
    }

    pub fn notify(&mut self, value: &[u8]) {
        self.session.handle(StackEvent::NotifyReceived {
            handle: NOTIFY,
            value: value.to_vec(),
            is_notify: true,
        });
    }
}

/// A fragment as the peer sends it.
pub fn fragment(total: u8, sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = vec![b'#', b'#', total, sequence];
    v.extend_from_slice(payload);
    v
}
