//! One remote Bluetooth peer and the transports it exposes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bluealsa_core::{A2dpCodec, BdAddr, Profile, Result};

use crate::adapter::Adapter;
use crate::event::{Event, EventListener};
use crate::transport::{LinkOps, Transport};

/// Apple accessory information learned over HFP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Xapl {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
    pub features: u8,
}

/// Control handle of a device's RFCOMM worker; implemented by the
/// RFCOMM crate, owned by the device.
pub trait RfcommControl: Send {
    /// Negotiated HF feature mask.
    fn features(&self) -> u32;
    /// Queue a raw AT line towards the peer.
    fn send_at(&self, line: &str) -> Result<()>;
    /// Attach a dispatch client; returns the client end of the socket
    /// that receives unrecognised AT traffic.
    fn open_dispatch(&self) -> Result<std::os::fd::OwnedFd>;
    /// Cooperative shutdown; joins the worker thread.
    fn stop(&mut self);
}

/// A remote device seen on one adapter.
pub struct Device {
    pub address: BdAddr,
    /// Our D-Bus path, `/org/bluealsa/hciX/dev_...`.
    pub path: String,
    pub adapter: Weak<Adapter>,
    dev_id: u16,
    name: Mutex<String>,
    battery: Mutex<Option<u8>>,
    xapl: Mutex<Option<Xapl>>,
    transports: Mutex<HashMap<String, Arc<Transport>>>,
    rfcomm: Mutex<Option<Box<dyn RfcommControl>>>,
    listener: Arc<dyn EventListener>,
}

impl Device {
    pub(crate) fn new(
        adapter: &Arc<Adapter>,
        address: BdAddr,
        name: String,
        listener: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        Arc::new(Device {
            address,
            path: format!("/org/bluealsa/{}/{}", adapter.name, address.path_fragment()),
            adapter: Arc::downgrade(adapter),
            dev_id: adapter.dev_id,
            name: Mutex::new(name),
            battery: Mutex::new(None),
            xapl: Mutex::new(None),
            transports: Mutex::new(HashMap::new()),
            rfcomm: Mutex::new(None),
            listener,
        })
    }

    pub(crate) fn adapter_dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn battery(&self) -> Option<u8> {
        *self.battery.lock().unwrap()
    }

    /// Record a battery level (0-100) and surface the change.
    pub fn set_battery(&self, level: u8) {
        *self.battery.lock().unwrap() = Some(level.min(100));
        self.listener.notify(Event::RfcommUpdated { device_path: self.path.clone() });
    }

    pub fn xapl(&self) -> Option<Xapl> {
        *self.xapl.lock().unwrap()
    }

    pub fn set_xapl(&self, xapl: Xapl) {
        *self.xapl.lock().unwrap() = Some(xapl);
    }

    pub fn set_rfcomm(&self, worker: Box<dyn RfcommControl>) {
        let mut slot = self.rfcomm.lock().unwrap();
        if let Some(mut old) = slot.take() {
            old.stop();
        }
        *slot = Some(worker);
    }

    /// Run `f` against the RFCOMM worker, if one is attached.
    pub fn with_rfcomm<R>(&self, f: impl FnOnce(&dyn RfcommControl) -> R) -> Option<R> {
        self.rfcomm.lock().unwrap().as_deref().map(f)
    }

    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.transports.lock().unwrap().values().cloned().collect()
    }

    pub fn transport(&self, path: &str) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().get(path).cloned()
    }

    /// The device's SCO transport, whichever HFP/HSP profile it runs.
    pub fn sco_transport(&self) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().values().find(|t| t.profile.is_sco()).cloned()
    }

    /// Create an A2DP transport and surface its PCM.
    #[allow(clippy::too_many_arguments)]
    pub fn create_a2dp_transport(
        self: &Arc<Self>,
        profile: Profile,
        codec: A2dpCodec,
        configuration: Vec<u8>,
        link_ops: Option<Box<dyn LinkOps>>,
        soft_volume: bool,
        initial_volume: u8,
        keep_alive: Duration,
    ) -> Result<Arc<Transport>> {
        let transport = Transport::new_a2dp(
            self,
            profile,
            codec,
            configuration,
            link_ops,
            soft_volume,
            initial_volume,
            keep_alive,
            self.listener.clone(),
        )?;
        self.register(transport.clone());
        Ok(transport)
    }

    /// Create the SCO transport backing an HFP/HSP connection; surfaces
    /// both the speaker and the microphone PCM.
    pub fn create_sco_transport(
        self: &Arc<Self>,
        profile: Profile,
        soft_volume: bool,
    ) -> Result<Arc<Transport>> {
        let transport = Transport::new_sco(self, profile, soft_volume, self.listener.clone())?;
        self.register(transport.clone());
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.start_sco_dispatcher();
        }
        Ok(transport)
    }

    fn register(&self, transport: Arc<Transport>) {
        self.transports.lock().unwrap().insert(transport.path.clone(), transport.clone());
        for pcm in transport.pcms() {
            self.listener.notify(Event::PcmAdded { transport: transport.clone(), pcm });
        }
    }

    /// Tear down one transport. The removal signal goes out before the
    /// final reference is dropped.
    pub fn remove_transport(&self, path: &str) {
        let removed = self.transports.lock().unwrap().remove(path);
        if let Some(transport) = removed {
            for pcm in transport.pcms() {
                self.listener.notify(Event::PcmRemoved { path: pcm.path.clone() });
            }
            // Dropping the Arc here joins the I/O thread.
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(mut rfcomm) = self.rfcomm.lock().unwrap().take() {
            rfcomm.stop();
        }
        let transports: Vec<Arc<Transport>> =
            self.transports.lock().unwrap().drain().map(|(_, t)| t).collect();
        for transport in transports {
            for pcm in transport.pcms() {
                self.listener.notify(Event::PcmRemoved { path: pcm.path.clone() });
            }
        }
        tracing::debug!("Destroyed device: {}", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullListener;

    #[test]
    fn dbus_path_format() {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener.clone()).unwrap();
        let addr = BdAddr::from_le_bytes([0x12, 0x34, 0x56, 0x78, 0x90, 0xAB]);
        let device = Device::new(&adapter, addr, "Headset".into(), listener);
        assert_eq!(device.path, "/org/bluealsa/hci0/dev_AB_90_78_56_34_12");
        assert_eq!(device.name(), "Headset");
    }

    #[test]
    fn battery_level_is_clamped() {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener.clone()).unwrap();
        let device = Device::new(&adapter, BdAddr::ANY, String::new(), listener);
        assert_eq!(device.battery(), None);
        device.set_battery(250);
        assert_eq!(device.battery(), Some(100));
    }
}
