use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{
    error::{Result, SppError},
    event::AttrHandle,
    session::Link,
    stack::RadioStack,
};

/// How the peer should push values on the notify characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyMode {
    Notify,
    /// Notifications that the stack acknowledges.
    Indicate,
}

/// Value written to the client configuration descriptor.
pub fn descriptor_value(mode: NotifyMode) -> [u8; 2] {
    let v: u16 = match mode {
        NotifyMode::Notify => 0x0001,
        NotifyMode::Indicate => 0x0002,
    };
    v.to_le_bytes()
}

/// Producer side of the registration queue, held by the session.
#[derive(Debug, Clone)]
pub struct Registrar {
    send: mpsc::Sender<AttrHandle>,
}

pub type RegistrationQueue = mpsc::Receiver<AttrHandle>;

pub fn channel(capacity: usize) -> (Registrar, RegistrationQueue) {
    let (send, recv) = mpsc::channel(capacity.max(1));
    (Registrar { send }, recv)
}

impl Registrar {
    pub fn enqueue(&self, handle: AttrHandle) -> Result<()> {
        self.send.try_send(handle).map_err(|_| SppError::QueueFull)
    }
}

/// Drain the registration queue, one request every `pacing`.
///
/// Runs until every [`Registrar`] is dropped.
pub async fn run(
    mut queue: RegistrationQueue,
    stack: Arc<dyn RadioStack>,
    link: watch::Receiver<Option<Link>>,
    pacing: Duration,
) {
    loop {
        tokio::time::sleep(pacing).await;
        let handle = match queue.recv().await {
            Some(x) => x,
            None => {
                debug!("registration queue closed");
                return;
            }
        };

        let current = *link.borrow();
        match current {
            Some(link) => {
                info!("registering for notifications on handle {}", handle);
                if let Err(e) = stack.register_for_notify(link.peer, handle) {
                    error!("error registering for notify on handle {handle}: {e}");
                }
            }
            None => {
                warn!("dropping registration for handle {handle}, no peer connected");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn descriptor_values() {
        assert_eq!(descriptor_value(NotifyMode::Notify), [0x01, 0x00]);
        assert_eq!(descriptor_value(NotifyMode::Indicate), [0x02, 0x00]);
    }

    #[test]
    fn enqueue_reports_full_queue() {
        let (reg, _queue) = channel(2);
        reg.enqueue(1).unwrap();
        reg.enqueue(2).unwrap();
        assert!(matches!(reg.enqueue(3), Err(SppError::QueueFull)));
    }

    #[test]
    fn enqueue_reports_closed_queue() {
        let (reg, queue) = channel(2);
        drop(queue);
        assert!(matches!(reg.enqueue(1), Err(SppError::QueueFull)));
    }
}
