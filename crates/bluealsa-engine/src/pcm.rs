//! The PCM endpoint exposed to local clients.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bluealsa_core::format::PcmFormat;
use bluealsa_core::volume::Volume;

use crate::event::{Event, EventListener, PcmUpdate};

/// Stream direction, also the object-path suffix. Named after the
/// transport's role on the air: a source PCM carries audio the local
/// client plays towards the remote device, a sink PCM carries audio the
/// local client captures from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcmMode {
    /// Local client writes, the transport transmits.
    Source,
    /// The transport receives, local client reads.
    Sink,
}

impl PcmMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PcmMode::Source => "source",
            PcmMode::Sink => "sink",
        }
    }
}

/// Engine-side descriptors of an open PCM.
pub struct PcmFds {
    /// Our end of the audio pipe.
    pub audio: OwnedFd,
    /// Write end of the pipe that wakes the controller thread on
    /// teardown.
    pub controller_shutdown: OwnedFd,
}

/// Drain rendezvous between the client controller and the I/O thread.
struct Drain {
    generation: Mutex<u64>,
    complete: Condvar,
}

/// Monotonic PCM creation counter, surfaced as the `Sequence` property.
static SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// A local audio endpoint of one transport.
pub struct Pcm {
    /// Bus object path, `<transport>/source` or `<transport>/sink`.
    pub path: String,
    pub mode: PcmMode,
    pub format: PcmFormat,
    pub channels: u8,
    pub sequence: u32,
    /// Upper bound of the peer's volume range: 127 for A2DP, 15 for SCO.
    pub max_bt_volume: u8,
    sampling: AtomicU32,
    volume: AtomicU16,
    soft_volume: AtomicBool,
    delay: AtomicU16,
    fds: Mutex<Option<PcmFds>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    drain: Drain,
    listener: Arc<dyn EventListener>,
}

impl Pcm {
    pub fn new(
        transport_path: &str,
        mode: PcmMode,
        channels: u8,
        sampling: u32,
        max_bt_volume: u8,
        soft_volume: bool,
        initial_level: u8,
        listener: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        Arc::new(Pcm {
            path: format!("{transport_path}/{}", mode.as_str()),
            mode,
            format: PcmFormat::S16_2LE,
            channels,
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            max_bt_volume,
            sampling: AtomicU32::new(sampling),
            volume: AtomicU16::new(Volume::from_level(initial_level.min(max_bt_volume)).0),
            soft_volume: AtomicBool::new(soft_volume),
            delay: AtomicU16::new(0),
            fds: Mutex::new(None),
            controller: Mutex::new(None),
            drain: Drain { generation: Mutex::new(0), complete: Condvar::new() },
            listener,
        })
    }

    pub fn sampling(&self) -> u32 {
        self.sampling.load(Ordering::Relaxed)
    }

    /// Update the sampling rate, e.g. after an HFP codec switch.
    pub fn set_sampling(&self, sampling: u32) {
        self.sampling.store(sampling, Ordering::Relaxed);
    }

    pub fn volume(&self) -> Volume {
        Volume(self.volume.load(Ordering::Relaxed))
    }

    /// Set the packed volume word. Emits a property update only when the
    /// value actually changed, so repeated writes stay signal-idempotent.
    pub fn set_volume(&self, volume: Volume) -> bool {
        let previous = self.volume.swap(volume.0, Ordering::Relaxed);
        let changed = previous != volume.0;
        if changed {
            self.listener.notify(Event::PcmUpdated {
                path: self.path.clone(),
                update: PcmUpdate::Volume,
            });
        }
        changed
    }

    pub fn soft_volume(&self) -> bool {
        self.soft_volume.load(Ordering::Relaxed)
    }

    pub fn set_soft_volume(&self, enabled: bool) -> bool {
        let previous = self.soft_volume.swap(enabled, Ordering::Relaxed);
        let changed = previous != enabled;
        if changed {
            self.listener.notify(Event::PcmUpdated {
                path: self.path.clone(),
                update: PcmUpdate::SoftVolume,
            });
        }
        changed
    }

    /// Delay in 0.1 ms units, updated by the I/O thread.
    pub fn delay(&self) -> u16 {
        self.delay.load(Ordering::Relaxed)
    }

    pub fn set_delay(&self, delay: u16) {
        self.delay.store(delay, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.fds.lock().unwrap().is_some()
    }

    /// Install the engine-side descriptors of a freshly opened PCM.
    /// Fails when a client is already attached.
    pub fn install_fds(&self, fds: PcmFds, controller: JoinHandle<()>) -> Result<(), PcmFds> {
        let mut guard = self.fds.lock().unwrap();
        if guard.is_some() {
            return Err(fds);
        }
        *guard = Some(fds);
        *self.controller.lock().unwrap() = Some(controller);
        Ok(())
    }

    /// Drop the engine-side descriptors; the controller thread wakes on
    /// the closed shutdown pipe and exits on its own.
    pub fn release_fds(&self) -> bool {
        self.fds.lock().unwrap().take().is_some()
    }

    /// Run `f` with the audio descriptor, if the PCM is open.
    pub fn with_audio_fd<R>(&self, f: impl FnOnce(&OwnedFd) -> R) -> Option<R> {
        self.fds.lock().unwrap().as_ref().map(|fds| f(&fds.audio))
    }

    /// Join the controller thread of the previous open, if any.
    pub fn join_controller(&self) {
        if let Some(handle) = self.controller.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Current drain generation; capture it before posting the sync
    /// signal so a fast completion is not missed.
    pub fn drain_begin(&self) -> u64 {
        *self.drain.generation.lock().unwrap()
    }

    /// Block until the I/O thread reports drain completion past the
    /// captured generation.
    pub fn drain_wait_from(&self, generation: u64, timeout: Duration) -> bool {
        let guard = self.drain.generation.lock().unwrap();
        let (_guard, result) = self
            .drain
            .complete
            .wait_timeout_while(guard, timeout, |g| *g == generation)
            .unwrap();
        !result.timed_out()
    }

    /// Called by the I/O thread once all residual frames are out.
    pub fn signal_drain_complete(&self) {
        let mut generation = self.drain.generation.lock().unwrap();
        *generation += 1;
        self.drain.complete.notify_all();
    }
}
