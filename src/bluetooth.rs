mod client;
pub use client::BluezStack;

/// Client characteristic configuration descriptor.
const CCCD_UUID: u16 = 0x2902;
/// Reason reported when BlueZ drops a link without telling us why.
const REMOTE_USER_TERMINATED: u8 = 0x13;
