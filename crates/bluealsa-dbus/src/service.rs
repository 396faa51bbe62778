//! The `org.bluealsa` service objects and the engine event pump.

use std::collections::HashMap;
use std::sync::Arc;

use bluealsa_core::volume::Volume;
use bluealsa_core::Config;
use bluealsa_engine::{Engine, Event, EventListener, Pcm, PcmMode, PcmUpdate, Transport};
use tokio::sync::mpsc;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};
use zbus::{interface, Connection};

use crate::error::DbusError;
use crate::ROOT_PATH;

/// Engine listener feeding the asynchronous event pump.
pub struct EventBridge {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventListener for EventBridge {
    fn notify(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Handle to the exported service.
pub struct BluealsaService {
    pub connection: Connection,
}

impl BluealsaService {
    /// Create the listener half before the engine exists; the returned
    /// receiver is passed to [`BluealsaService::start`].
    pub fn listener() -> (Arc<EventBridge>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(EventBridge { tx }), rx)
    }

    /// Claim the bus name, export the manager and start the event pump.
    pub async fn start(
        engine: Arc<Engine>,
        config: Arc<Config>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) -> zbus::Result<Self> {
        let name = crate::service_name(config.service_suffix.as_deref());
        let connection = zbus::connection::Builder::system()?
            .name(name.clone())?
            .serve_at(ROOT_PATH, Manager { engine: engine.clone() })?
            .build()
            .await?;
        tracing::info!("Acquired D-Bus service name: {name}");

        let pump_connection = connection.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = dispatch_event(&pump_connection, &event).await {
                    tracing::warn!("Couldn't dispatch {event:?}: {err}");
                }
            }
        });

        Ok(BluealsaService { connection })
    }
}

/// Apply one engine event to the bus, preserving emission order.
async fn dispatch_event(connection: &Connection, event: &Event) -> zbus::Result<()> {
    let server = connection.object_server();
    match event {
        Event::PcmAdded { transport, pcm } => {
            let path = ObjectPath::try_from(pcm.path.as_str())?;
            server
                .at(path.clone(), PcmObject { transport: transport.clone(), pcm: pcm.clone() })
                .await?;
            let manager = server.interface::<_, Manager>(ROOT_PATH).await?;
            let props = pcm_properties(transport, pcm);
            Manager::pcm_added(manager.signal_emitter(), path, props).await?;
        }
        Event::PcmRemoved { path } => {
            let object = ObjectPath::try_from(path.as_str())?;
            let manager = server.interface::<_, Manager>(ROOT_PATH).await?;
            Manager::pcm_removed(manager.signal_emitter(), object.clone()).await?;
            let _ = server.remove::<PcmObject, _>(object).await;
        }
        Event::PcmUpdated { path, update } => {
            let object = ObjectPath::try_from(path.as_str())?;
            let iface = match server.interface::<_, PcmObject>(object).await {
                Ok(iface) => iface,
                // Property updates may race object removal.
                Err(_) => return Ok(()),
            };
            let emitter = iface.signal_emitter();
            let pcm = iface.get().await;
            match update {
                PcmUpdate::Volume => pcm.volume_changed(emitter).await?,
                PcmUpdate::SoftVolume => pcm.soft_volume_changed(emitter).await?,
                PcmUpdate::Delay => pcm.delay_changed(emitter).await?,
                PcmUpdate::Codec => pcm.codec_changed(emitter).await?,
                PcmUpdate::Running => {}
            }
        }
        Event::RfcommUpdated { device_path } => {
            let rfcomm_path = format!("{device_path}/rfcomm");
            let object = ObjectPath::try_from(rfcomm_path.as_str())?;
            if let Ok(iface) = server.interface::<_, RfcommObject>(object).await {
                let emitter = iface.signal_emitter();
                iface.get().await.battery_changed(emitter).await?;
            }
        }
    }
    Ok(())
}

/// Pack a plain value into an `OwnedValue`; infallible for fd-less types.
fn ov<'a>(value: impl Into<zbus::zvariant::Value<'a>>) -> OwnedValue {
    OwnedValue::try_from(value.into()).expect("value without file descriptors")
}

/// Property snapshot of one PCM, as carried by `GetPCMs` and `PCMAdded`.
fn pcm_properties(transport: &Arc<Transport>, pcm: &Arc<Pcm>) -> HashMap<String, OwnedValue> {
    let device_path = pcm
        .path
        .rsplit_once('/')
        .and_then(|(rest, _)| rest.rsplit_once('/'))
        .map(|(device, _)| device.to_string())
        .unwrap_or_else(|| ROOT_PATH.to_string());

    let mut props = HashMap::new();
    let device = ObjectPath::try_from(device_path.as_str())
        .unwrap_or_else(|_| ObjectPath::from_static_str_unchecked(ROOT_PATH));
    props.insert("Device".into(), ov(device));
    props.insert("Sequence".into(), ov(pcm.sequence));
    props.insert("Transport".into(), ov(transport.profile.transport_name()));
    props.insert("Mode".into(), ov(pcm.mode.as_str()));
    props.insert("Format".into(), ov(pcm.format.0));
    props.insert("Channels".into(), ov(pcm.channels));
    props.insert("Sampling".into(), ov(pcm.sampling()));
    props.insert("Codec".into(), ov(transport.codec().id()));
    props.insert("Delay".into(), ov(pcm.delay()));
    props.insert("SoftVolume".into(), ov(pcm.soft_volume()));
    props.insert("Volume".into(), ov(pcm.volume().0));
    props
}

/// The manager object at the service root.
pub struct Manager {
    engine: Arc<Engine>,
}

#[interface(name = "org.bluealsa.Manager1")]
impl Manager {
    /// Snapshot of every PCM currently surfaced.
    #[zbus(name = "GetPCMs")]
    async fn get_pcms(&self) -> Vec<(OwnedObjectPath, HashMap<String, OwnedValue>)> {
        self.engine
            .pcms()
            .iter()
            .filter_map(|(transport, pcm)| {
                let path = OwnedObjectPath::try_from(pcm.path.as_str()).ok()?;
                Some((path, pcm_properties(transport, pcm)))
            })
            .collect()
    }

    #[zbus(property)]
    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[zbus(property)]
    fn adapters(&self) -> Vec<String> {
        self.engine.adapter_names()
    }

    #[zbus(signal, name = "PCMAdded")]
    pub async fn pcm_added(
        emitter: &SignalEmitter<'_>,
        path: ObjectPath<'_>,
        props: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    #[zbus(signal, name = "PCMRemoved")]
    pub async fn pcm_removed(emitter: &SignalEmitter<'_>, path: ObjectPath<'_>) -> zbus::Result<()>;
}

/// One exported PCM.
pub struct PcmObject {
    transport: Arc<Transport>,
    pcm: Arc<Pcm>,
}

#[interface(name = "org.bluealsa.PCM1")]
impl PcmObject {
    /// Attach the calling client: returns the audio descriptor and the
    /// control socket.
    async fn open(
        &self,
    ) -> Result<(zbus::zvariant::OwnedFd, zbus::zvariant::OwnedFd), DbusError> {
        let transport = self.transport.clone();
        let mode = self.pcm.mode;
        let (audio, control) = tokio::task::spawn_blocking(move || transport.open_pcm(mode))
            .await
            .map_err(|err| DbusError::Failed(err.to_string()))??;
        Ok((audio.into(), control.into()))
    }

    /// Codecs selectable on this transport.
    async fn get_codecs(&self) -> Vec<(String, HashMap<String, OwnedValue>)> {
        let mut codecs = Vec::new();
        if self.transport.profile.is_a2dp() {
            let mut props = HashMap::new();
            if let Some(blob) = self.transport.a2dp_configuration() {
                props.insert("Configuration".to_string(), ov(blob));
            }
            codecs.push(("SBC".to_string(), props));
            if self.transport.profile == bluealsa_core::Profile::A2dpSink {
                codecs.push(("AAC".to_string(), HashMap::new()));
            }
        } else {
            codecs.push(("CVSD".to_string(), HashMap::new()));
            codecs.push(("mSBC".to_string(), HashMap::new()));
        }
        codecs
    }

    /// Reconfigure the transport codec; a running stream is closed.
    async fn select_codec(
        &self,
        name: String,
        props: HashMap<String, OwnedValue>,
    ) -> Result<(), DbusError> {
        if self.transport.profile.is_a2dp() {
            let configuration: Vec<u8> = match props.get("Configuration") {
                Some(value) => Vec::<u8>::try_from(value.clone())
                    .map_err(|_| DbusError::InvalidArguments("bad configuration blob".into()))?,
                None => self.transport.a2dp_configuration().unwrap_or_default(),
            };
            self.transport.select_codec(&name, configuration)?;
        } else {
            let codec = bluealsa_core::TransportCodec::hfp_from_name(&name)
                .map_err(DbusError::from)?;
            let bluealsa_core::TransportCodec::Hfp(hfp) = codec else { unreachable!() };
            self.transport.set_hfp_codec(hfp)?;
        }
        Ok(())
    }

    #[zbus(property)]
    fn device(&self) -> OwnedObjectPath {
        let device = self
            .pcm
            .path
            .rsplit_once('/')
            .and_then(|(rest, _)| rest.rsplit_once('/'))
            .map(|(device, _)| device.to_string())
            .unwrap_or_else(|| ROOT_PATH.to_string());
        OwnedObjectPath::try_from(device.as_str())
            .unwrap_or_else(|_| OwnedObjectPath::try_from(ROOT_PATH).unwrap())
    }

    #[zbus(property)]
    fn sequence(&self) -> u32 {
        self.pcm.sequence
    }

    #[zbus(property)]
    fn transport(&self) -> String {
        self.transport.profile.transport_name().to_string()
    }

    #[zbus(property)]
    fn mode(&self) -> String {
        self.pcm.mode.as_str().to_string()
    }

    #[zbus(property)]
    fn format(&self) -> u16 {
        self.pcm.format.0
    }

    #[zbus(property)]
    fn channels(&self) -> u8 {
        self.pcm.channels
    }

    #[zbus(property)]
    fn sampling(&self) -> u32 {
        self.pcm.sampling()
    }

    #[zbus(property)]
    fn codec(&self) -> u16 {
        self.transport.codec().id()
    }

    #[zbus(property)]
    fn delay(&self) -> u16 {
        self.pcm.delay()
    }

    #[zbus(property)]
    fn soft_volume(&self) -> bool {
        self.pcm.soft_volume()
    }

    #[zbus(property)]
    fn set_soft_volume(&self, enabled: bool) {
        self.pcm.set_soft_volume(enabled);
    }

    #[zbus(property)]
    fn volume(&self) -> u16 {
        self.pcm.volume().0
    }

    #[zbus(property)]
    fn set_volume(&self, volume: u16) {
        if !self.pcm.set_volume(Volume(volume)) {
            return;
        }
        // Keep a hands-free peer's gain in sync with ours.
        if !self.transport.profile.is_sco() {
            return;
        }
        let gain = match self.pcm.mode {
            PcmMode::Source => "VGS",
            PcmMode::Sink => "VGM",
        };
        let level = Volume(volume).level(0).min(self.pcm.max_bt_volume);
        if let Some(device) = self.transport.device.upgrade() {
            device.with_rfcomm(|rfcomm| {
                let _ = rfcomm.send_at(&bluealsa_rfcomm::at::format_response(gain, &level.to_string()));
            });
        }
    }
}

/// One exported RFCOMM link, at `<device>/rfcomm`.
pub struct RfcommObject {
    pub device: Arc<bluealsa_engine::Device>,
    pub profile: bluealsa_core::Profile,
}

#[interface(name = "org.bluealsa.RFCOMM1")]
impl RfcommObject {
    /// Attach the calling client to the AT dispatch socket.
    async fn open(&self) -> Result<zbus::zvariant::OwnedFd, DbusError> {
        let fd = self
            .device
            .with_rfcomm(|rfcomm| rfcomm.open_dispatch())
            .ok_or_else(|| DbusError::NotConnected("no RFCOMM session".into()))??;
        Ok(fd.into())
    }

    #[zbus(property)]
    fn transport(&self) -> String {
        self.profile.transport_name().to_string()
    }

    #[zbus(property)]
    fn features(&self) -> u32 {
        self.device.with_rfcomm(|rfcomm| rfcomm.features()).unwrap_or(0)
    }

    #[zbus(property)]
    fn battery(&self) -> u8 {
        self.device.battery().unwrap_or(0xff)
    }
}
