//! Firmware core for a long-range push-to-talk group voice radio.
//!
//! This crate is the hardware-independent core: frame codec, crypto session
//! layer, dial-slot/frequency state machines, audio pipeline, and the
//! `Device` composition root that wires them together. The physical radio
//! register-poking and the platform audio HAL are injected through the
//! [`link::Link`] and [`audio_driver::AudioDriver`] traits rather than
//! implemented here — only the CPAL-backed host driver and the in-process
//! loopback link are provided as the reference implementations a binary
//! entry point can use.

pub mod audio;
pub mod audio_driver;
pub mod config;
pub mod crypto;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod frequency;
pub mod identity;
pub mod ids;
pub mod link;
pub mod nvs;
pub mod protocol;
pub mod slot;

pub use device::Device;
pub use error::Error;
