pub mod catalog;
pub mod chunker;
pub mod config;
pub mod error;
pub mod event;
pub mod reassembly;
pub mod registrar;
pub mod serial;
pub mod session;
pub mod stack;

#[cfg(feature = "bluez")]
pub mod bluetooth;

pub use error::{Result, SppError};
