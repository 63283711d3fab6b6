//! Reference entry point: brings up a `Device` against a real CPAL audio
//! driver, pumps a loopback `Link` (spec §1 treats the physical radio driver
//! as an out-of-scope collaborator, so this is the stand-in a host build
//! links against), and drives the per-slot tasks and watchdog sweep on a
//! tokio runtime.
//!
//! Grounded in the teacher's `server.rs`/`client.rs` `main` functions: build
//! the shared state, spawn the receive loop on its own thread, then block
//! the main task on a periodic sweep. Generalized from "one UDP socket" to
//! the link-trait receive loop plus the per-slot cooperative tasks `device.rs`
//! now owns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use wavetalk::audio_driver::{AudioDriver, CpalAudioDriver};
use wavetalk::config::MAX_SLOTS;
use wavetalk::device::Device;
use wavetalk::identity::NoHardwareEntropy;
use wavetalk::link::{Link, LoopbackLink};
use wavetalk::nvs::{InMemoryNvs, Nvs};

#[tokio::main]
async fn main() -> Result<()> {
    let nvs: Arc<dyn Nvs> = Arc::new(InMemoryNvs::new());
    let (link_a, _link_b) = LoopbackLink::pair();
    let link: Arc<dyn Link> = link_a;

    let device = Arc::new(
        Device::new(link.clone(), nvs.clone(), &NoHardwareEntropy, None, b"wavetalk-build-secret".to_vec())
            .context("bringing up device identity failed")?,
    );
    eprintln!("[wavetalkd] device id {}", device.identity.device_id);

    let audio = Arc::new(CpalAudioDriver::new());
    let capture_device = device.clone();
    audio
        .start_capture(Box::new(move |frame| {
            let mut block = *frame;
            capture_device.on_capture_block(&mut block);
        }))
        .context("starting audio capture failed")?;

    let playback_device = device.clone();
    audio
        .start_playback(Box::new(move |frame| {
            *frame = playback_device.on_playback_pull();
        }))
        .context("starting audio playback failed")?;

    link.start_continuous_rx().context("starting continuous RX failed")?;

    // `Link::receive_single` blocks its calling thread for up to its
    // timeout, so the receive loop runs on a dedicated OS thread rather
    // than a tokio task (spec §4.1, same shape as the teacher's socket
    // thread in server.rs).
    let rx_device = device.clone();
    let rx_link = link.clone();
    std::thread::spawn(move || loop {
        match rx_link.receive_single(Duration::from_millis(200)) {
            Ok(frame) => {
                if let Err(e) = rx_device.dispatch_inbound(&frame.bytes) {
                    eprintln!("[wavetalkd] dropped inbound frame: {e}");
                }
            }
            Err(wavetalk::Error::Timeout) => {}
            Err(e) => eprintln!("[wavetalkd] link receive error: {e}"),
        }
    });

    let watchdog_device = device.clone();
    tokio::spawn(async move {
        let connecting_since = vec![Instant::now(); MAX_SLOTS];
        loop {
            tokio::time::sleep(Device::watchdog_period()).await;
            watchdog_device.watchdog_sweep(&connecting_since);
        }
    });

    // Firmware-style main loop: never returns, periodically flushing slot
    // config to NVS (spec §4.7: "saved to NVS on mutation" — this is the
    // belt-and-suspenders sweep for a host binary with no explicit
    // per-mutation hook into the storage layer).
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        device.slots.persist_all(nvs.as_ref());
    }
}
