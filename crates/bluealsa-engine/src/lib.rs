//! # bluealsa-engine
//!
//! The transport engine: the adapter→device→transport→PCM object graph,
//! the per-transport real-time I/O threads, the SCO connection
//! dispatcher and the PCM client control protocol.
//!
//! Reference counting is the only lifetime discipline: every edge in the
//! graph is owner-to-owned, back references are weak, and the last drop
//! of an entity joins the threads it owned.

pub mod adapter;
pub mod ctl;
pub mod device;
pub mod event;
pub mod hci;
pub mod io;
pub mod pcm;
pub mod sys;
pub mod transport;

pub use adapter::Adapter;
pub use device::{Device, RfcommControl, Xapl};
pub use event::{Event, EventListener, PcmUpdate};
pub use pcm::{Pcm, PcmMode};
pub use transport::{LinkHandle, LinkOps, ScoState, Transport, TransportSignal};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluealsa_core::Config;

/// Engine root: owns every served adapter.
pub struct Engine {
    pub config: Arc<Config>,
    listener: Arc<dyn EventListener>,
    adapters: Mutex<HashMap<u16, Arc<Adapter>>>,
}

impl Engine {
    pub fn new(config: Arc<Config>, listener: Arc<dyn EventListener>) -> Arc<Self> {
        Arc::new(Engine { config, listener, adapters: Mutex::new(HashMap::new()) })
    }

    pub fn listener(&self) -> Arc<dyn EventListener> {
        self.listener.clone()
    }

    /// The adapter serving `dev_id`, creating it on first use.
    pub fn adapter_get_or_create(self: &Arc<Self>, dev_id: u16) -> bluealsa_core::Result<Arc<Adapter>> {
        let mut adapters = self.adapters.lock().unwrap();
        if let Some(adapter) = adapters.get(&dev_id) {
            return Ok(adapter.clone());
        }
        let adapter = Adapter::new(dev_id, self.listener.clone())?;
        adapters.insert(dev_id, adapter.clone());
        Ok(adapter)
    }

    pub fn adapter(&self, dev_id: u16) -> Option<Arc<Adapter>> {
        self.adapters.lock().unwrap().get(&dev_id).cloned()
    }

    /// Names of all served adapters, for the `Adapters` property.
    pub fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.adapters.lock().unwrap().values().map(|a| a.name.clone()).collect();
        names.sort();
        names
    }

    /// Every PCM currently surfaced, across all adapters.
    pub fn pcms(&self) -> Vec<(Arc<Transport>, Arc<Pcm>)> {
        let mut out = Vec::new();
        for adapter in self.adapters.lock().unwrap().values() {
            for device in adapter.devices() {
                for transport in device.transports() {
                    for pcm in transport.pcms() {
                        out.push((transport.clone(), pcm));
                    }
                }
            }
        }
        out
    }

    /// Drop all adapters, joining their dispatchers and transports.
    pub fn shutdown(&self) {
        self.adapters.lock().unwrap().clear();
    }
}
