//! One local Bluetooth controller, its devices and its SCO dispatcher.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use bluealsa_core::{BdAddr, HfpCodec, Result, TransportCodec};

use crate::device::Device;
use crate::event::EventListener;
use crate::hci;
use crate::sys;

/// A served HCI adapter.
pub struct Adapter {
    pub dev_id: u16,
    /// Kernel name, `hciN`.
    pub name: String,
    pub address: BdAddr,
    /// Controller manufacturer, for chip quirks; 0xffff when unknown.
    pub manufacturer: u16,
    devices: Mutex<HashMap<BdAddr, Arc<Device>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_shutdown: Arc<AtomicBool>,
    listener: Arc<dyn EventListener>,
}

impl Adapter {
    /// Create the adapter object. HCI details are filled in
    /// best-effort so the object graph works without hardware.
    pub fn new(dev_id: u16, listener: Arc<dyn EventListener>) -> Result<Arc<Self>> {
        let (name, address) = match hci::info(dev_id) {
            Ok(info) => (info.name, info.address),
            Err(_) => (format!("hci{dev_id}"), BdAddr::ANY),
        };
        let manufacturer = hci::local_version_manufacturer(dev_id).unwrap_or(0xffff);
        Ok(Arc::new(Adapter {
            dev_id,
            name,
            address,
            manufacturer,
            devices: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
            dispatcher_shutdown: Arc::new(AtomicBool::new(false)),
            listener,
        }))
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn device_lookup(&self, address: BdAddr) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    /// The device for `address`, created on first sight.
    pub fn device_get_or_create(self: &Arc<Self>, address: BdAddr, name: &str) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.get(&address) {
            return device.clone();
        }
        let device = Device::new(self, address, name.to_string(), self.listener.clone());
        devices.insert(address, device.clone());
        device
    }

    pub fn remove_device(&self, address: BdAddr) {
        self.devices.lock().unwrap().remove(&address);
    }

    /// Start the SCO connection dispatcher, once. Runs the Broadcom
    /// routing probe first when the chip needs it.
    pub fn start_sco_dispatcher(self: &Arc<Self>) {
        let mut slot = self.dispatcher.lock().unwrap();
        if slot.is_some() {
            return;
        }

        if self.manufacturer == hci::COMPID_BROADCOM {
            probe_bcm_sco_routing(self.dev_id);
        }

        let weak = Arc::downgrade(self);
        let shutdown = self.dispatcher_shutdown.clone();
        let dev_id = self.dev_id;
        let name = self.name.clone();
        match std::thread::Builder::new()
            .name(format!("ba-sco-{name}"))
            .spawn(move || dispatcher_thread(weak, shutdown, dev_id, name))
        {
            Ok(handle) => *slot = Some(handle),
            Err(err) => tracing::error!("Couldn't create SCO dispatcher: {err}"),
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.dispatcher_shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.devices.lock().unwrap().clear();
        tracing::debug!("Destroyed adapter: {}", self.name);
    }
}

/// Broadcom controllers default to routing SCO via their PCM interface;
/// without the transport routing audio never reaches userspace.
fn probe_bcm_sco_routing(dev_id: u16) {
    tracing::debug!("Checking Broadcom internal SCO routing");
    match hci::bcm_read_sco_routing(dev_id) {
        Ok(params) => {
            tracing::debug!("Current SCO interface setup: {params:?}");
            if params.routing != hci::BCM_ROUTING_TRANSPORT {
                let rewritten = hci::BcmScoRouting { routing: hci::BCM_ROUTING_TRANSPORT, ..params };
                if let Err(err) = hci::bcm_write_sco_routing(dev_id, &rewritten) {
                    tracing::error!("Couldn't write SCO routing params: {err}");
                }
            }
        }
        Err(err) => tracing::error!("Couldn't read SCO routing params: {err}"),
    }
}

/// Per-adapter accept loop for incoming SCO links.
fn dispatcher_thread(
    adapter: Weak<Adapter>,
    shutdown: Arc<AtomicBool>,
    dev_id: u16,
    name: String,
) {
    let listen = match hci::sco_open(dev_id) {
        Ok(fd) => fd,
        Err(err) => {
            tracing::error!("Couldn't open SCO socket: {err}");
            return;
        }
    };
    if let Err(err) = hci::sco_defer_setup(listen.as_raw_fd()) {
        tracing::error!("Couldn't set deferred connection setup: {err}");
    }
    if unsafe { libc::listen(listen.as_raw_fd(), 10) } < 0 {
        tracing::error!("Couldn't listen on SCO socket: {}", std::io::Error::last_os_error());
        return;
    }

    tracing::debug!("Starting SCO dispatcher loop: {name}");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut fds = [sys::pollfd(listen.as_raw_fd(), libc::POLLIN)];
        match sys::poll(&mut fds, 500) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                tracing::error!("SCO dispatcher poll error: {err}");
                break;
            }
        }

        let (fd, peer) = match hci::sco_accept(listen.as_raw_fd()) {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!("Couldn't accept incoming SCO link: {err}");
                continue;
            }
        };
        tracing::debug!("New incoming SCO link: {peer}");

        let Some(adapter) = adapter.upgrade() else { break };
        let Some(device) = adapter.device_lookup(peer) else {
            tracing::error!("Couldn't lookup device: {peer}");
            continue;
        };
        let Some(transport) = device.sco_transport() else {
            tracing::error!("Couldn't lookup SCO transport: {}", device.path);
            continue;
        };

        if transport.codec() == TransportCodec::Hfp(HfpCodec::Msbc) {
            if let Err(err) = hci::sco_voice_transparent(fd.as_raw_fd()) {
                tracing::error!("Couldn't setup transparent voice: {err}");
                continue;
            }
            // Complete the deferred setup so audio starts flowing.
            let mut byte = [0u8; 1];
            if sys::read(fd.as_raw_fd(), &mut byte).is_err() {
                tracing::error!("Couldn't authorize SCO connection");
                continue;
            }
        }

        if let Err(err) = transport.install_link(fd) {
            tracing::error!("Couldn't install SCO link: {err}");
        }
    }
    tracing::debug!("SCO dispatcher cleanup: {name}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullListener;

    #[test]
    fn adapter_name_follows_dev_id() {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener.clone()).unwrap();
        assert_eq!(adapter.name, "hci0");
        let adapter = Adapter::new(5, listener).unwrap();
        assert_eq!(adapter.dev_id, 5);
        assert_eq!(adapter.name, "hci5");
    }

    #[test]
    fn device_lookup_after_create() {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener).unwrap();
        let addr: BdAddr = "AB:90:78:56:34:12".parse().unwrap();
        let device = adapter.device_get_or_create(addr, "Headphones");
        assert!(Arc::ptr_eq(&adapter.device_lookup(addr).unwrap(), &device));
        assert!(adapter.device_lookup(BdAddr::ANY).is_none());
    }

    #[test]
    fn device_create_is_idempotent() {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener).unwrap();
        let addr: BdAddr = "AB:90:78:56:34:12".parse().unwrap();
        let first = adapter.device_get_or_create(addr, "One");
        let second = adapter.device_get_or_create(addr, "Two");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(adapter.devices().len(), 1);
    }
}
