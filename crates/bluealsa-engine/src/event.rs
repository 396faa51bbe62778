//! Engine → RPC event plumbing.
//!
//! Mutations are committed under the owning entity's mutex first; the
//! listener is invoked strictly after the commit and strictly before any
//! reference is given up, which is what keeps the bus signal ordering
//! honest.

use std::sync::Arc;

use crate::pcm::Pcm;
use crate::transport::Transport;

/// Which PCM property changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmUpdate {
    Volume,
    SoftVolume,
    Delay,
    Codec,
    Running,
}

/// Graph mutation notifications consumed by the RPC layer.
#[derive(Clone)]
pub enum Event {
    PcmAdded { transport: Arc<Transport>, pcm: Arc<Pcm> },
    PcmRemoved { path: String },
    PcmUpdated { path: String, update: PcmUpdate },
    RfcommUpdated { device_path: String },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::PcmAdded { pcm, .. } => write!(f, "PcmAdded({})", pcm.path),
            Event::PcmRemoved { path } => write!(f, "PcmRemoved({path})"),
            Event::PcmUpdated { path, update } => write!(f, "PcmUpdated({path}, {update:?})"),
            Event::RfcommUpdated { device_path } => write!(f, "RfcommUpdated({device_path})"),
        }
    }
}

/// Receiver of engine events; implemented by the D-Bus layer.
pub trait EventListener: Send + Sync {
    fn notify(&self, event: Event);
}

/// Listener that discards everything, for tests and headless use.
pub struct NullListener;

impl EventListener for NullListener {
    fn notify(&self, _event: Event) {}
}
