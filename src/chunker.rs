use std::{slice::Chunks, sync::Arc, time::Duration};

use log::{debug, error, trace};
use tokio::sync::{mpsc, watch};

use crate::{
    error::{Result, SppError},
    event::WriteType,
    session::Link,
    stack::RadioStack,
};

/// ATT write header size.
const WRITE_OVERHEAD: usize = 3;
const CREDIT_POLL: Duration = Duration::from_millis(10);

/// Largest value a single characteristic write may carry.
pub fn chunk_size(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(WRITE_OVERHEAD).max(1)
}

pub fn chunks(buf: &[u8], mtu: u16) -> Chunks<'_, u8> {
    buf.chunks(chunk_size(mtu))
}

/// The link if outbound data may be written to it.
fn usable(link: &watch::Receiver<Option<Link>>) -> Option<Link> {
    match *link.borrow() {
        Some(x) if x.streaming && x.writable => Some(x),
        _ => None,
    }
}

/// Write one outbound buffer to the receive characteristic of the current
/// link.
///
/// Chunks go out as plain characteristic writes, without the fragment header
/// the peer uses in the other direction. Waiting for credits stops with
/// [`SppError::NotConnected`] once the link the buffer started on is gone.
pub async fn send(
    stack: &dyn RadioStack,
    link: &watch::Receiver<Option<Link>>,
    buf: &[u8],
    write_type: WriteType,
) -> Result<usize> {
    let live = usable(link).ok_or(SppError::NotConnected)?;
    let mut written = 0;
    for chunk in chunks(buf, live.mtu) {
        if write_type == WriteType::WithoutResponse {
            while stack.sendable_packets(live.conn_id) == Some(0) {
                tokio::time::sleep(CREDIT_POLL).await;
                if usable(link).map(|l| l.conn_id) != Some(live.conn_id) {
                    return Err(SppError::NotConnected);
                }
            }
        }
        trace!("writing {} bytes at offset {}", chunk.len(), written);
        stack.write_characteristic(live.conn_id, live.data_handle, chunk, write_type)?;
        written += chunk.len();
    }
    Ok(written)
}

/// Forward buffers from the local stream to the peer until the queue closes.
pub async fn run(
    mut outbound: mpsc::Receiver<Vec<u8>>,
    stack: Arc<dyn RadioStack>,
    link: watch::Receiver<Option<Link>>,
    write_type: WriteType,
) {
    while let Some(buf) = outbound.recv().await {
        if usable(&link).is_none() {
            debug!("dropping {} outbound bytes, link not streaming", buf.len());
            continue;
        }

        if let Err(e) = send(stack.as_ref(), &link, &buf, write_type).await {
            error!("error writing {} bytes to peer: {}", buf.len(), e);
        }
    }
    debug!("outbound queue closed");
}
