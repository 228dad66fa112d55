use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    event::{Address, AttrHandle, ConnId, DbElement, HandleRange, WriteType},
};

/// Scan parameters, intervals in units of 0.625 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    pub active: bool,
    pub interval: u16,
    pub window: u16,
    pub filter_duplicates: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        ScanParams {
            active: true,
            interval: 0x50,
            window: 0x30,
            filter_duplicates: false,
        }
    }
}

/// Connection parameters. Intervals in 1.25 ms units, timeout in 10 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl Default for ConnParams {
    fn default() -> Self {
        ConnParams {
            interval_min: 32,
            interval_max: 32,
            latency: 0,
            supervision_timeout: 600,
        }
    }
}

/// Request side of the radio stack.
///
/// Every method only queues a request and must return without waiting on the
/// radio. Completion is reported later as a [`StackEvent`](crate::event::StackEvent)
/// on the stack's event channel. An `Err` means the request was rejected
/// outright and no event will follow.
pub trait RadioStack: Send + Sync {
    fn set_local_mtu(&self, _mtu: u16) -> Result<()> {
        Ok(())
    }

    fn start_scan(&self, params: &ScanParams) -> Result<()>;

    fn stop_scan(&self) -> Result<()>;

    fn connect(&self, peer: Address, params: &ConnParams) -> Result<()>;

    fn disconnect(&self, conn_id: ConnId) -> Result<()>;

    fn search_service(&self, conn_id: ConnId, uuid: u16) -> Result<()>;

    fn request_mtu(&self, conn_id: ConnId) -> Result<()>;

    /// Cached attribute database of the peer restricted to `range`, in handle
    /// order. Only valid after the service search completed.
    fn attribute_db(&self, conn_id: ConnId, range: HandleRange) -> Result<Vec<DbElement>>;

    fn register_for_notify(&self, peer: Address, handle: AttrHandle) -> Result<()>;

    fn write_descriptor(&self, conn_id: ConnId, handle: AttrHandle, value: &[u8]) -> Result<()>;

    fn write_characteristic(
        &self,
        conn_id: ConnId,
        handle: AttrHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Number of packets the controller can currently accept without a
    /// response, `None` if the stack does not track credits.
    fn sendable_packets(&self, _conn_id: ConnId) -> Option<usize> {
        None
    }
}
