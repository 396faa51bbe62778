//! BlueZ integration: profile and media-endpoint registration, and the
//! callbacks through which the system Bluetooth daemon hands us RFCOMM
//! channels and A2DP transports.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

use bluealsa_core::{A2dpCodec, BdAddr, Config, Profile};
use bluealsa_audio::codec::sbc;
use bluealsa_engine::transport::{LinkHandle, LinkOps};
use bluealsa_engine::{Device, Engine};
use bluealsa_rfcomm::session::RfcommSession;
use zbus::zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, OwnedValue, Value};
use zbus::{interface, proxy, Connection};

use crate::error::DbusError;
use crate::service::RfcommObject;

pub const UUID_HSP_HS: &str = "00001108-0000-1000-8000-00805f9b34fb";
pub const UUID_HSP_AG: &str = "00001112-0000-1000-8000-00805f9b34fb";
pub const UUID_A2DP_SOURCE: &str = "0000110a-0000-1000-8000-00805f9b34fb";
pub const UUID_A2DP_SINK: &str = "0000110b-0000-1000-8000-00805f9b34fb";
pub const UUID_HFP_HF: &str = "0000111e-0000-1000-8000-00805f9b34fb";
pub const UUID_HFP_AG: &str = "0000111f-0000-1000-8000-00805f9b34fb";

#[proxy(
    interface = "org.bluez.ProfileManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
trait ProfileManager1 {
    fn register_profile(
        &self,
        profile: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, &Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.Media1", default_service = "org.bluez")]
trait Media1 {
    fn register_endpoint(
        &self,
        endpoint: &ObjectPath<'_>,
        properties: HashMap<&str, &Value<'_>>,
    ) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.MediaTransport1", default_service = "org.bluez")]
trait MediaTransport1 {
    /// Returns the transport descriptor plus read and write MTU.
    fn acquire(&self) -> zbus::Result<(OwnedFd, u16, u16)>;

    fn release(&self) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
trait Device1 {
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn alias(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn adapter(&self) -> zbus::Result<OwnedObjectPath>;
}

/// Link acquisition through `org.bluez.MediaTransport1`, used by A2DP
/// transports. Calls are made from the engine's blocking context.
struct BluezLinkOps {
    connection: zbus::blocking::Connection,
    transport_path: OwnedObjectPath,
}

impl LinkOps for BluezLinkOps {
    fn acquire(&self) -> bluealsa_core::Result<LinkHandle> {
        let proxy = MediaTransport1ProxyBlocking::builder(&self.connection)
            .path(self.transport_path.clone())
            .map_err(|e| bluealsa_core::Error::Hci(e.to_string()))?
            .build()
            .map_err(|e| bluealsa_core::Error::Hci(e.to_string()))?;
        let (fd, mtu_read, mtu_write) =
            proxy.acquire().map_err(|_| bluealsa_core::Error::NotConnected)?;
        let fd = fd_from_dbus(fd)?;
        Ok(LinkHandle { fd, mtu_read, mtu_write })
    }

    fn release(&self) {
        if let Ok(proxy) = MediaTransport1ProxyBlocking::builder(&self.connection)
            .path(self.transport_path.clone())
            .and_then(|b| b.build())
        {
            let _ = proxy.release();
        }
    }
}

/// Unwrap a descriptor received over the bus into a plain owned fd.
fn fd_from_dbus(fd: OwnedFd) -> std::io::Result<std::os::fd::OwnedFd> {
    fd.as_fd().try_clone_to_owned()
}

/// Resolve a BlueZ device object to our engine device.
async fn resolve_device(
    connection: &Connection,
    engine: &Arc<Engine>,
    device_path: &ObjectPath<'_>,
) -> Result<Arc<Device>, DbusError> {
    let proxy = Device1Proxy::builder(connection)
        .path(device_path.clone().into_owned())?
        .build()
        .await?;
    let address: BdAddr = proxy
        .address()
        .await?
        .parse()
        .map_err(|_| DbusError::Failed("bad device address".into()))?;
    let alias = proxy.alias().await.unwrap_or_default();
    let adapter_path = proxy.adapter().await?;
    let dev_id: u16 = adapter_path
        .as_str()
        .rsplit_once("hci")
        .and_then(|(_, id)| id.parse().ok())
        .ok_or_else(|| DbusError::Failed("bad adapter path".into()))?;

    let adapter = engine.adapter_get_or_create(dev_id).map_err(DbusError::from)?;
    Ok(adapter.device_get_or_create(address, &alias))
}

/// Exported `org.bluez.Profile1` object serving one HFP/HSP role.
pub struct ProfileObject {
    pub connection: Connection,
    pub engine: Arc<Engine>,
    pub config: Arc<Config>,
    pub profile: Profile,
}

#[interface(name = "org.bluez.Profile1")]
impl ProfileObject {
    /// BlueZ hands us the RFCOMM channel of a freshly connected peer.
    async fn new_connection(
        &self,
        device: ObjectPath<'_>,
        fd: OwnedFd,
        _fd_properties: HashMap<String, OwnedValue>,
    ) -> Result<(), DbusError> {
        tracing::info!("New RFCOMM connection: {} ({})", device, self.profile);
        let engine_device = resolve_device(&self.connection, &self.engine, &device).await?;

        let transport = match engine_device.sco_transport() {
            Some(transport) => transport,
            None => engine_device
                .create_sco_transport(self.profile, self.config.soft_volume)
                .map_err(DbusError::from)?,
        };

        let tty = fd_from_dbus(fd).map_err(|err| DbusError::Failed(err.to_string()))?;
        let session = RfcommSession::start(
            &engine_device,
            &transport,
            tty,
            self.profile,
            self.config.enable_msbc,
        )
        .map_err(DbusError::from)?;
        engine_device.set_rfcomm(session);

        let rfcomm_path = format!("{}/rfcomm", engine_device.path);
        let object = RfcommObject { device: engine_device.clone(), profile: self.profile };
        let _ = self.connection.object_server().at(rfcomm_path.as_str(), object).await;
        Ok(())
    }

    async fn request_disconnection(&self, device: ObjectPath<'_>) -> Result<(), DbusError> {
        tracing::info!("RFCOMM disconnection requested: {device}");
        let engine_device = resolve_device(&self.connection, &self.engine, &device).await?;
        if let Some(transport) = engine_device.sco_transport() {
            engine_device.remove_transport(&transport.path);
        }
        let rfcomm_path = format!("{}/rfcomm", engine_device.path);
        let _ = self
            .connection
            .object_server()
            .remove::<RfcommObject, _>(rfcomm_path.as_str())
            .await;
        Ok(())
    }

    async fn release(&self) {
        tracing::debug!("Profile released: {}", self.profile);
    }
}

/// Exported `org.bluez.MediaEndpoint1` object serving one A2DP SEP.
pub struct EndpointObject {
    pub connection: Connection,
    pub engine: Arc<Engine>,
    pub config: Arc<Config>,
    pub profile: Profile,
    /// BlueZ transport path → our transport path, for teardown.
    pub transports: Mutex<HashMap<OwnedObjectPath, String>>,
}

#[interface(name = "org.bluez.MediaEndpoint1")]
impl EndpointObject {
    /// Pick our preferred configuration from the peer capabilities.
    async fn select_configuration(&self, capabilities: Vec<u8>) -> Result<Vec<u8>, DbusError> {
        let config = sbc::caps::select_config(&capabilities)
            .map_err(|err| DbusError::InvalidArguments(err.to_string()))?;
        Ok(config.to_vec())
    }

    /// The peer configured a stream on this endpoint; surface the PCM.
    async fn set_configuration(
        &self,
        transport: ObjectPath<'_>,
        properties: HashMap<String, OwnedValue>,
    ) -> Result<(), DbusError> {
        let device_path = properties
            .get("Device")
            .and_then(|v| OwnedObjectPath::try_from(v.clone()).ok())
            .ok_or_else(|| DbusError::InvalidArguments("missing Device".into()))?;
        let configuration = properties
            .get("Configuration")
            .and_then(|v| Vec::<u8>::try_from(v.clone()).ok())
            .ok_or_else(|| DbusError::InvalidArguments("missing Configuration".into()))?;

        tracing::info!("A2DP configuration: {} ({})", transport, self.profile);
        let engine_device = resolve_device(&self.connection, &self.engine, &device_path).await?;

        let bluez_path = OwnedObjectPath::from(transport.into_owned());
        let link_ops = Box::new(BluezLinkOps {
            connection: zbus::blocking::Connection::from(self.connection.clone()),
            transport_path: bluez_path.clone(),
        });
        let engine_transport = engine_device
            .create_a2dp_transport(
                self.profile,
                A2dpCodec::Sbc,
                configuration,
                Some(link_ops),
                self.config.soft_volume,
                self.config.initial_volume,
                std::time::Duration::from_secs(self.config.keep_alive),
            )
            .map_err(DbusError::from)?;
        self.transports.lock().unwrap().insert(bluez_path, engine_transport.path.clone());
        Ok(())
    }

    /// The stream is gone; tear the transport down.
    async fn clear_configuration(&self, transport: ObjectPath<'_>) {
        tracing::info!("A2DP configuration cleared: {transport}");
        let bluez_path = OwnedObjectPath::from(transport.into_owned());
        let Some(path) = self.transports.lock().unwrap().remove(&bluez_path) else { return };
        for (graph_transport, _pcm) in self.engine.pcms() {
            if graph_transport.path == path {
                if let Some(device) = graph_transport.device.upgrade() {
                    device.remove_transport(&path);
                }
                break;
            }
        }
    }

    async fn release(&self) {
        tracing::debug!("Endpoint released: {}", self.profile);
    }
}

/// Register the enabled profiles and A2DP endpoints with BlueZ.
pub async fn register(
    connection: &Connection,
    engine: &Arc<Engine>,
    config: &Arc<Config>,
) -> Result<(), zbus::Error> {
    let manager = ProfileManager1Proxy::new(connection).await?;

    let profile_slots = [
        (Profile::HfpAg, UUID_HFP_AG, "/org/bluealsa/profile/hfpag"),
        (Profile::HfpHf, UUID_HFP_HF, "/org/bluealsa/profile/hfphf"),
        (Profile::HspAg, UUID_HSP_AG, "/org/bluealsa/profile/hspag"),
        (Profile::HspHs, UUID_HSP_HS, "/org/bluealsa/profile/hsphs"),
    ];
    for (profile, uuid, path) in profile_slots {
        if !config.profile_enabled(profile) {
            continue;
        }
        let object = ProfileObject {
            connection: connection.clone(),
            engine: engine.clone(),
            config: config.clone(),
            profile,
        };
        connection.object_server().at(path, object).await?;
        let name = Value::from(profile.transport_name());
        let mut options = HashMap::new();
        options.insert("Name", &name);
        let object_path = ObjectPath::try_from(path)?;
        manager.register_profile(&object_path, uuid, options).await?;
        tracing::info!("Registered profile: {profile}");
    }

    let endpoint_slots = [
        (Profile::A2dpSource, UUID_A2DP_SOURCE, "/org/bluealsa/endpoint/a2dpsrc/sbc"),
        (Profile::A2dpSink, UUID_A2DP_SINK, "/org/bluealsa/endpoint/a2dpsnk/sbc"),
    ];
    let sbc_capabilities: [u8; 4] = [
        sbc::caps::FREQ_16000
            | sbc::caps::FREQ_32000
            | sbc::caps::FREQ_44100
            | sbc::caps::FREQ_48000
            | sbc::caps::MODE_MONO
            | sbc::caps::MODE_DUAL
            | sbc::caps::MODE_STEREO
            | sbc::caps::MODE_JOINT,
        sbc::caps::BLOCKS_4
            | sbc::caps::BLOCKS_8
            | sbc::caps::BLOCKS_12
            | sbc::caps::BLOCKS_16
            | sbc::caps::SUBBANDS_4
            | sbc::caps::SUBBANDS_8
            | sbc::caps::ALLOCATION_SNR
            | sbc::caps::ALLOCATION_LOUDNESS,
        2,
        sbc::caps::BITPOOL_HQ,
    ];

    for adapter in hci_adapters(engine, config) {
        let media = Media1Proxy::builder(connection)
            .path(format!("/org/bluez/{adapter}"))?
            .build()
            .await?;
        for (profile, uuid, base_path) in endpoint_slots {
            if !config.profile_enabled(profile) {
                continue;
            }
            let path = format!("{base_path}/{adapter}");
            let object = EndpointObject {
                connection: connection.clone(),
                engine: engine.clone(),
                config: config.clone(),
                profile,
                transports: Mutex::new(HashMap::new()),
            };
            connection.object_server().at(path.as_str(), object).await?;

            let uuid_value = Value::from(uuid);
            let codec_value = Value::from(0u8); // SBC
            let caps_value = Value::from(sbc_capabilities.to_vec());
            let mut properties = HashMap::new();
            properties.insert("UUID", &uuid_value);
            properties.insert("Codec", &codec_value);
            properties.insert("Capabilities", &caps_value);
            let object_path = ObjectPath::try_from(path.as_str())?;
            media.register_endpoint(&object_path, properties).await?;
            tracing::info!("Registered endpoint: {profile} on {adapter}");
        }
    }

    Ok(())
}

/// Adapters to serve: the configured filter, or everything enumerable.
fn hci_adapters(engine: &Arc<Engine>, config: &Arc<Config>) -> Vec<String> {
    let mut names = engine.adapter_names();
    if names.is_empty() {
        if let Ok(devices) = bluealsa_engine::hci::enumerate() {
            names = devices.into_iter().map(|d| d.name).collect();
        }
    }
    names.retain(|name| config.adapter_enabled(name));
    names
}
