//! The transport: a codec-and-direction-specific audio endpoint of one
//! remote device, owner of the real-time I/O thread that services it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bluealsa_core::{A2dpCodec, BdAddr, Error, HfpCodec, Profile, Result, TransportCodec};
use bluealsa_audio::codec::aac::AacConfig;
use bluealsa_audio::codec::mpeg::MpegConfig;
use bluealsa_audio::codec::sbc;

use crate::ctl;
use crate::device::Device;
use crate::event::{Event, EventListener, PcmUpdate};
use crate::hci;
use crate::io;
use crate::pcm::{Pcm, PcmFds, PcmMode};
use crate::sys;

/// Control-pipe messages consumed by the I/O threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportSignal {
    Ping = 1,
    PcmOpen = 2,
    PcmClose = 3,
    PcmPause = 4,
    PcmResume = 5,
    PcmSync = 6,
    PcmDrop = 7,
}

impl TransportSignal {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => TransportSignal::Ping,
            2 => TransportSignal::PcmOpen,
            3 => TransportSignal::PcmClose,
            4 => TransportSignal::PcmPause,
            5 => TransportSignal::PcmResume,
            6 => TransportSignal::PcmSync,
            7 => TransportSignal::PcmDrop,
            _ => return None,
        })
    }
}

/// SCO transport lifecycle, mutated only by the I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoState {
    Idle,
    Running,
    Draining,
    Linger,
    Closing,
}

/// An acquired Bluetooth link.
pub struct LinkHandle {
    pub fd: OwnedFd,
    pub mtu_read: u16,
    pub mtu_write: u16,
}

/// Link acquisition delegate for A2DP transports, backed by the system
/// Bluetooth daemon's transport objects.
pub trait LinkOps: Send {
    fn acquire(&self) -> Result<LinkHandle>;
    fn release(&self) {}
}

/// Bluetooth socket state, guarded by the transport mutex.
pub(crate) struct Link {
    pub fd: Option<OwnedFd>,
    pub mtu_read: u16,
    pub mtu_write: u16,
}

/// Profile-specific transport payload.
pub(crate) enum Kind {
    A2dp { pcm: Arc<Pcm>, config: Mutex<Vec<u8>> },
    Sco { spk: Arc<Pcm>, mic: Arc<Pcm>, state: Mutex<ScoState> },
}

/// State shared between the graph node and the threads it runs.
pub(crate) struct Shared {
    pub profile: Profile,
    pub path: String,
    /// Adapter id and peer address, for SCO link establishment.
    pub dev_id: u16,
    pub peer: BdAddr,
    pub codec: Mutex<TransportCodec>,
    pub link: Mutex<Link>,
    pub kind: Kind,
    pub link_ops: Mutex<Option<Box<dyn LinkOps>>>,
    pub shutdown: AtomicBool,
    pub keep_alive: Duration,
    signal_tx: Mutex<OwnedFd>,
    pub listener: Arc<dyn EventListener>,
}

impl Shared {
    /// Post a control message to the I/O thread.
    pub fn send_signal(&self, signal: TransportSignal) {
        let tx = self.signal_tx.lock().unwrap();
        if let Err(err) = sys::write(tx.as_raw_fd(), &[signal as u8]) {
            if err.kind() != std::io::ErrorKind::WouldBlock {
                tracing::warn!("Couldn't signal transport {}: {err}", self.path);
            }
        }
    }

    /// Install a new Bluetooth socket, closing any previous one, and
    /// wake the I/O thread.
    pub fn install_link(&self, fd: OwnedFd) -> Result<()> {
        let mtu = hci::sco_mtu(fd.as_raw_fd()).unwrap_or(48);
        let mut link = self.link.lock().unwrap();
        link.fd = Some(fd);
        link.mtu_read = mtu;
        link.mtu_write = mtu;
        drop(link);
        self.send_signal(TransportSignal::Ping);
        Ok(())
    }

    /// Close the Bluetooth socket; the transport becomes unconfigured.
    pub fn release_link(&self) {
        let had_fd = {
            let mut link = self.link.lock().unwrap();
            link.fd.take().is_some()
        };
        if had_fd {
            if let Some(ops) = self.link_ops.lock().unwrap().as_ref() {
                ops.release();
            }
            tracing::debug!("Released link: {}", self.path);
        }
    }

    pub fn has_link(&self) -> bool {
        self.link.lock().unwrap().fd.is_some()
    }

    pub fn pcms(&self) -> Vec<Arc<Pcm>> {
        match &self.kind {
            Kind::A2dp { pcm, .. } => vec![pcm.clone()],
            Kind::Sco { spk, mic, .. } => vec![spk.clone(), mic.clone()],
        }
    }

    /// Close a PCM's descriptors and tell the I/O thread about it.
    pub fn close_pcm(&self, pcm: &Pcm) {
        if pcm.release_fds() {
            self.send_signal(TransportSignal::PcmClose);
        }
    }

    pub fn sco_state(&self) -> Option<ScoState> {
        match &self.kind {
            Kind::Sco { state, .. } => Some(*state.lock().unwrap()),
            Kind::A2dp { .. } => None,
        }
    }
}

/// One audio transport of a remote device.
pub struct Transport {
    pub profile: Profile,
    pub path: String,
    pub device: Weak<Device>,
    pub(crate) shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub(crate) fn new_a2dp(
        device: &Arc<Device>,
        profile: Profile,
        codec: A2dpCodec,
        configuration: Vec<u8>,
        link_ops: Option<Box<dyn LinkOps>>,
        soft_volume: bool,
        initial_volume: u8,
        keep_alive: Duration,
        listener: Arc<dyn EventListener>,
    ) -> Result<Arc<Self>> {
        let path = format!("{}/{}", device.path, profile.path_fragment());
        let (channels, sampling) = a2dp_stream_params(codec, &configuration)?;
        let mode = if profile == Profile::A2dpSource { PcmMode::Source } else { PcmMode::Sink };
        let pcm = Pcm::new(&path, mode, channels, sampling, 127, soft_volume, initial_volume, listener.clone());

        let pipe = sys::Pipe::new()?;
        let shared = Arc::new(Shared {
            profile,
            path: path.clone(),
            dev_id: device.adapter_dev_id(),
            peer: device.address,
            codec: Mutex::new(TransportCodec::A2dp(codec)),
            link: Mutex::new(Link { fd: None, mtu_read: 0, mtu_write: 0 }),
            kind: Kind::A2dp { pcm, config: Mutex::new(configuration) },
            link_ops: Mutex::new(link_ops),
            shutdown: AtomicBool::new(false),
            keep_alive,
            signal_tx: Mutex::new(pipe.tx),
            listener,
        });

        let thread = io::spawn(shared.clone(), pipe.rx)?;
        Ok(Arc::new(Transport {
            profile,
            path,
            device: Arc::downgrade(device),
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub(crate) fn new_sco(
        device: &Arc<Device>,
        profile: Profile,
        soft_volume: bool,
        listener: Arc<dyn EventListener>,
    ) -> Result<Arc<Self>> {
        let path = format!("{}/{}", device.path, profile.path_fragment());
        let spk = Pcm::new(&path, PcmMode::Source, 1, 8000, 15, soft_volume, 15, listener.clone());
        let mic = Pcm::new(&path, PcmMode::Sink, 1, 8000, 15, soft_volume, 15, listener.clone());

        let pipe = sys::Pipe::new()?;
        let shared = Arc::new(Shared {
            profile,
            path: path.clone(),
            dev_id: device.adapter_dev_id(),
            peer: device.address,
            codec: Mutex::new(TransportCodec::Hfp(HfpCodec::Cvsd)),
            link: Mutex::new(Link { fd: None, mtu_read: 0, mtu_write: 0 }),
            kind: Kind::Sco { spk, mic, state: Mutex::new(ScoState::Idle) },
            link_ops: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            keep_alive: Duration::ZERO,
            signal_tx: Mutex::new(pipe.tx),
            listener,
        });

        let thread = io::spawn(shared.clone(), pipe.rx)?;
        Ok(Arc::new(Transport {
            profile,
            path,
            device: Arc::downgrade(device),
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn codec(&self) -> TransportCodec {
        *self.shared.codec.lock().unwrap()
    }

    pub fn pcms(&self) -> Vec<Arc<Pcm>> {
        self.shared.pcms()
    }

    /// The PCM of the given direction, if this transport has one.
    pub fn pcm(&self, mode: PcmMode) -> Option<Arc<Pcm>> {
        self.shared.pcms().into_iter().find(|p| p.mode == mode)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.has_link()
    }

    pub fn sco_state(&self) -> Option<ScoState> {
        self.shared.sco_state()
    }

    /// The A2DP configuration blob currently in effect.
    pub fn a2dp_configuration(&self) -> Option<Vec<u8>> {
        match &self.shared.kind {
            Kind::A2dp { config, .. } => Some(config.lock().unwrap().clone()),
            Kind::Sco { .. } => None,
        }
    }

    /// Install an accepted SCO socket (dispatcher path) or a transport
    /// descriptor acquired from the Bluetooth daemon.
    pub fn install_link(&self, fd: OwnedFd) -> Result<()> {
        self.shared.install_link(fd)
    }

    pub fn release_link(&self) {
        self.shared.release_link()
    }

    /// Make sure a Bluetooth socket exists, establishing one if this
    /// side may initiate.
    fn acquire_link(&self) -> Result<()> {
        if self.shared.has_link() {
            return Ok(());
        }
        if self.profile.is_a2dp() {
            let ops = self.shared.link_ops.lock().unwrap();
            let ops = ops.as_ref().ok_or(Error::NotConnected)?;
            let handle = ops.acquire()?;
            let mut link = self.shared.link.lock().unwrap();
            link.mtu_read = handle.mtu_read;
            link.mtu_write = handle.mtu_write;
            link.fd = Some(handle.fd);
            drop(link);
            self.shared.send_signal(TransportSignal::Ping);
            Ok(())
        } else if self.profile.is_ag() {
            let transparent = self.codec() == TransportCodec::Hfp(HfpCodec::Msbc);
            let fd = hci::sco_connect(self.shared.dev_id, self.shared.peer, transparent)?;
            self.shared.install_link(fd)
        } else {
            // The gateway owns the SCO bandwidth decision; wait for it.
            Err(Error::NotConnected)
        }
    }

    /// Open the given PCM for exactly one local client. Returns the
    /// client's audio descriptor and control socket.
    pub fn open_pcm(self: &Arc<Self>, mode: PcmMode) -> Result<(OwnedFd, OwnedFd)> {
        let pcm = self.pcm(mode).ok_or_else(|| {
            Error::InvalidArguments(format!("no {} PCM on {}", mode.as_str(), self.path))
        })?;
        if pcm.is_open() {
            return Err(Error::InvalidArguments("PCM already open".into()));
        }
        self.acquire_link()?;
        // A previous client's controller may still be winding down.
        pcm.join_controller();

        let (audio_rx, audio_tx) = sys::audio_pipe()?;
        let (ctl_engine, ctl_client) = sys::control_socketpair()?;
        let shutdown = sys::Pipe::new()?;

        // Engine keeps the end matching the stream direction: it reads
        // what a source client plays and writes what a sink client reads.
        let (engine_audio, client_audio) = match mode {
            PcmMode::Source => (audio_rx, audio_tx),
            PcmMode::Sink => (audio_tx, audio_rx),
        };
        sys::set_nonblocking(engine_audio.as_raw_fd())?;

        let controller = ctl::spawn(self.shared.clone(), pcm.clone(), ctl_engine, shutdown.rx)?;
        pcm.install_fds(
            PcmFds { audio: engine_audio, controller_shutdown: shutdown.tx },
            controller,
        )
        .map_err(|_| Error::InvalidArguments("PCM already open".into()))?;

        self.shared.send_signal(TransportSignal::PcmOpen);
        tracing::info!("Opened PCM: {}", pcm.path);
        Ok((client_audio, ctl_client))
    }

    /// `SelectCodec` on an A2DP transport: validate, close the current
    /// stream, commit the new configuration.
    pub fn select_codec(&self, name: &str, configuration: Vec<u8>) -> Result<()> {
        let Kind::A2dp { pcm, config } = &self.shared.kind else {
            return Err(Error::NotSupported("codec selection on SCO transport".into()));
        };
        let codec = TransportCodec::a2dp_from_name(name)?;
        let TransportCodec::A2dp(a2dp) = codec else { unreachable!() };
        if self.profile == Profile::A2dpSource && a2dp != A2dpCodec::Sbc {
            // This build has no encoder for the other A2DP codecs.
            return Err(Error::NotSupported(format!("{name} encoding")));
        }
        let (channels, sampling) = a2dp_stream_params(a2dp, &configuration)?;

        // Close the running stream before the switch.
        self.shared.close_pcm(pcm);
        {
            let mut current = self.shared.codec.lock().unwrap();
            let mut blob = config.lock().unwrap();
            *current = codec;
            *blob = configuration;
        }
        pcm.set_sampling(sampling);
        let _ = channels; // channel count is fixed by the capability blob
        self.shared.listener.notify(Event::PcmUpdated {
            path: pcm.path.clone(),
            update: PcmUpdate::Codec,
        });
        self.shared.send_signal(TransportSignal::Ping);
        Ok(())
    }

    /// HFP codec switch driven by `+BCS`. Tears down an existing SCO
    /// link so the next open uses the new settings.
    pub fn set_hfp_codec(&self, codec: HfpCodec) -> Result<()> {
        let Kind::Sco { spk, mic, .. } = &self.shared.kind else {
            return Err(Error::NotSupported("HFP codec on A2DP transport".into()));
        };
        {
            let mut current = self.shared.codec.lock().unwrap();
            if *current == TransportCodec::Hfp(codec) {
                return Ok(());
            }
            *current = TransportCodec::Hfp(codec);
        }
        let sampling = match codec {
            HfpCodec::Cvsd => 8000,
            HfpCodec::Msbc => 16000,
        };
        spk.set_sampling(sampling);
        mic.set_sampling(sampling);
        for pcm in [spk, mic] {
            self.shared.listener.notify(Event::PcmUpdated {
                path: pcm.path.clone(),
                update: PcmUpdate::Codec,
            });
        }
        if self.shared.has_link() {
            self.shared.release_link();
        }
        self.shared.send_signal(TransportSignal::Ping);
        tracing::info!("Switched {} to {:?}", self.path, codec);
        Ok(())
    }

    pub fn send_signal(&self, signal: TransportSignal) {
        self.shared.send_signal(signal)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.send_signal(TransportSignal::Ping);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        for pcm in self.shared.pcms() {
            pcm.release_fds();
            pcm.join_controller();
        }
        self.shared.release_link();
        tracing::debug!("Destroyed transport: {}", self.path);
    }
}

/// Channel count and sampling rate implied by an A2DP configuration.
fn a2dp_stream_params(codec: A2dpCodec, configuration: &[u8]) -> Result<(u8, u32)> {
    match codec {
        A2dpCodec::Sbc => {
            let params = sbc::caps::parse_config(configuration).map_err(bluealsa_core::Error::from)?;
            Ok((params.mode.channels() as u8, params.frequency.as_hz()))
        }
        A2dpCodec::Mpeg24 => {
            let config = AacConfig::parse(configuration).map_err(bluealsa_core::Error::from)?;
            Ok((config.channels, config.sampling))
        }
        A2dpCodec::Mpeg12 => {
            let config = MpegConfig::parse(configuration).map_err(bluealsa_core::Error::from)?;
            Ok((config.channels, config.sampling))
        }
        other => Err(Error::NotSupported(format!("A2DP codec {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_bytes_roundtrip() {
        for signal in [
            TransportSignal::Ping,
            TransportSignal::PcmOpen,
            TransportSignal::PcmClose,
            TransportSignal::PcmPause,
            TransportSignal::PcmResume,
            TransportSignal::PcmSync,
            TransportSignal::PcmDrop,
        ] {
            assert_eq!(TransportSignal::from_byte(signal as u8), Some(signal));
        }
        assert_eq!(TransportSignal::from_byte(0), None);
        assert_eq!(TransportSignal::from_byte(200), None);
    }

    #[test]
    fn stream_params_from_sbc_config() {
        use bluealsa_audio::codec::sbc::caps;
        let blob = [
            caps::FREQ_44100 | caps::MODE_JOINT,
            caps::BLOCKS_16 | caps::SUBBANDS_8 | caps::ALLOCATION_LOUDNESS,
            2,
            53,
        ];
        let (channels, sampling) = a2dp_stream_params(A2dpCodec::Sbc, &blob).unwrap();
        assert_eq!(channels, 2);
        assert_eq!(sampling, 44100);
    }

    #[test]
    fn stream_params_reject_unsupported_codec() {
        assert!(matches!(
            a2dp_stream_params(A2dpCodec::AptX, &[0; 4]),
            Err(Error::NotSupported(_))
        ));
    }
}
