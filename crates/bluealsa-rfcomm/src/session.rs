//! Per-device RFCOMM worker.
//!
//! One thread per service-level connection reads AT traffic from the
//! RFCOMM tty, drives the handshake for the local role, and afterwards
//! services volume, codec-selection, indicator and battery events.
//! Unrecognised traffic is forwarded verbatim to the dispatch socket a
//! client may have opened over the bus.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use bluealsa_core::volume::Volume;
use bluealsa_core::{Error, HfpCodec, Profile, Result};
use bluealsa_engine::device::{Device, RfcommControl, Xapl};
use bluealsa_engine::pcm::PcmMode;
use bluealsa_engine::sys;
use bluealsa_engine::transport::Transport;

use crate::at::{self, AtKind, AtMessage, LineBuffer};
use crate::hfp;

/// State shared between the worker thread and its control handle.
struct Inner {
    shutdown: AtomicBool,
    /// Peer feature mask from `+BRSF`/`AT+BRSF`.
    features: AtomicU32,
    /// Lines queued for the peer; flushed on wakeup.
    outbox: Mutex<VecDeque<String>>,
    wake_tx: Mutex<OwnedFd>,
    /// Engine end of the dispatch socket, when a client is attached.
    dispatch: Mutex<Option<OwnedFd>>,
}

impl Inner {
    fn wake(&self) {
        let tx = self.wake_tx.lock().unwrap();
        let _ = sys::write(tx.as_raw_fd(), &[1]);
    }
}

/// HF-side handshake progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HfState {
    Brsf,
    Bac,
    CindTest,
    CindRead,
    Cmer,
    Done,
}

/// The RFCOMM worker handle owned by a [`Device`].
pub struct RfcommSession {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl RfcommSession {
    /// Spawn the worker on an established RFCOMM channel.
    pub fn start(
        device: &Arc<Device>,
        transport: &Arc<Transport>,
        tty: OwnedFd,
        role: Profile,
        enable_msbc: bool,
    ) -> Result<Box<dyn RfcommControl>> {
        sys::set_nonblocking(tty.as_raw_fd())?;
        let wake = sys::Pipe::new()?;
        let inner = Arc::new(Inner {
            shutdown: AtomicBool::new(false),
            features: AtomicU32::new(0),
            outbox: Mutex::new(VecDeque::new()),
            wake_tx: Mutex::new(wake.tx),
            dispatch: Mutex::new(None),
        });

        let worker = Worker {
            inner: inner.clone(),
            device: Arc::downgrade(device),
            transport: Arc::downgrade(transport),
            role,
            enable_msbc,
            hf_state: HfState::Brsf,
            peer_codecs: vec![hfp::CODEC_CVSD],
            pending_codec: None,
            lines: LineBuffer::new(),
        };
        let thread = std::thread::Builder::new()
            .name("ba-rfcomm".to_string())
            .spawn(move || worker.run(tty, wake.rx))
            .map_err(Error::from)?;

        tracing::debug!("Starting RFCOMM session: {} ({role})", device.path);
        Ok(Box::new(RfcommSession { inner, thread: Some(thread) }))
    }
}

impl RfcommControl for RfcommSession {
    fn features(&self) -> u32 {
        self.inner.features.load(Ordering::Relaxed)
    }

    fn send_at(&self, line: &str) -> Result<()> {
        self.inner.outbox.lock().unwrap().push_back(line.to_string());
        self.inner.wake();
        Ok(())
    }

    fn open_dispatch(&self) -> Result<OwnedFd> {
        let (engine_end, client_end) = sys::control_socketpair()?;
        sys::set_nonblocking(engine_end.as_raw_fd())?;
        *self.inner.dispatch.lock().unwrap() = Some(engine_end);
        self.inner.wake();
        Ok(client_end)
    }

    fn stop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    inner: Arc<Inner>,
    device: Weak<Device>,
    transport: Weak<Transport>,
    role: Profile,
    enable_msbc: bool,
    hf_state: HfState,
    peer_codecs: Vec<u8>,
    /// Codec id proposed with `+BCS`, awaiting confirmation.
    pending_codec: Option<u8>,
    lines: LineBuffer,
}

impl Worker {
    fn run(mut self, tty: OwnedFd, wake_rx: OwnedFd) {
        if self.role == Profile::HfpHf {
            // The hands-free side opens the service-level connection.
            self.send(at::format_command("BRSF", &self.local_hf_features().to_string()));
        }

        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.flush_outbox(&tty);

            let dispatch_fd = self
                .inner
                .dispatch
                .lock()
                .unwrap()
                .as_ref()
                .map(|fd| fd.as_raw_fd())
                .unwrap_or(-1);
            let mut fds = [
                sys::pollfd(tty.as_raw_fd(), libc::POLLIN),
                sys::pollfd(wake_rx.as_raw_fd(), libc::POLLIN),
                sys::pollfd(dispatch_fd, libc::POLLIN),
            ];
            if sys::poll(&mut fds, -1).is_err() {
                break;
            }

            if fds[1].revents & libc::POLLIN != 0 {
                let mut scratch = [0u8; 16];
                let _ = sys::read(wake_rx.as_raw_fd(), &mut scratch);
                continue;
            }

            if fds[2].revents & libc::POLLIN != 0 {
                // A dispatch client speaks raw AT; relay it to the peer.
                let mut buf = [0u8; 256];
                match sys::read(dispatch_fd, &mut buf) {
                    Ok(0) | Err(_) => {
                        *self.inner.dispatch.lock().unwrap() = None;
                    }
                    Ok(len) => {
                        let line = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                        if !line.is_empty() {
                            self.send(format!("{line}\r"));
                        }
                    }
                }
            } else if fds[2].revents != 0 {
                *self.inner.dispatch.lock().unwrap() = None;
            }

            if fds[0].revents & libc::POLLIN != 0 {
                let mut buf = [0u8; 512];
                match sys::read(tty.as_raw_fd(), &mut buf) {
                    Ok(0) => break,
                    Ok(len) => {
                        for line in self.lines.feed(&buf[..len]) {
                            tracing::debug!("RFCOMM read: {line}");
                            self.handle_line(&line);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        tracing::error!("RFCOMM read error: {err}");
                        break;
                    }
                }
            } else if fds[0].revents != 0 {
                break;
            }
        }
        tracing::debug!("RFCOMM session exit");
    }

    fn local_ag_features(&self) -> u32 {
        let mut features = hfp::ag_features::REJECT_CALL
            | hfp::ag_features::ENHANCED_CALL_STATUS
            | hfp::ag_features::EXTENDED_ERROR_CODES
            | hfp::ag_features::ESCO_S4;
        if self.enable_msbc {
            features |= hfp::ag_features::CODEC_NEGOTIATION;
        }
        features
    }

    fn local_hf_features(&self) -> u32 {
        let mut features = hfp::hf_features::CLI_PRESENTATION
            | hfp::hf_features::REMOTE_VOLUME_CONTROL
            | hfp::hf_features::ENHANCED_CALL_STATUS
            | hfp::hf_features::ESCO_S4;
        if self.enable_msbc {
            features |= hfp::hf_features::CODEC_NEGOTIATION;
        }
        features
    }

    fn send(&self, line: String) {
        self.inner.outbox.lock().unwrap().push_back(line);
        self.inner.wake();
    }

    fn flush_outbox(&self, tty: &OwnedFd) {
        let mut outbox = self.inner.outbox.lock().unwrap();
        while let Some(line) = outbox.pop_front() {
            tracing::debug!("RFCOMM write: {}", line.trim());
            if let Err(err) = sys::write(tty.as_raw_fd(), line.as_bytes()) {
                tracing::error!("RFCOMM write error: {err}");
                break;
            }
        }
    }

    fn reply_ok(&self) {
        self.send(at::format_result(true));
    }

    fn reply_error(&self) {
        self.send(at::format_result(false));
    }

    fn handle_line(&mut self, line: &str) {
        let Some(message) = at::parse_line(line) else {
            self.forward_unhandled(line);
            return;
        };
        match self.role {
            Profile::HfpAg | Profile::HspAg => self.handle_as_gateway(line, message),
            Profile::HfpHf | Profile::HspHs => self.handle_as_unit(line, message),
            _ => {}
        }
    }

    /// Gateway side: the peer is a hands-free or headset unit.
    fn handle_as_gateway(&mut self, raw: &str, message: AtMessage) {
        match message {
            AtMessage::Command { name, kind, value } => match (name.as_str(), kind) {
                ("BRSF", AtKind::Set) => {
                    let features = value.parse().unwrap_or(0);
                    self.inner.features.store(features, Ordering::Relaxed);
                    self.send(at::format_response("BRSF", &self.local_ag_features().to_string()));
                    self.reply_ok();
                }
                ("BAC", AtKind::Set) => {
                    self.peer_codecs =
                        value.split(',').filter_map(|c| c.trim().parse().ok()).collect();
                    self.reply_ok();
                }
                ("CIND", AtKind::Test) => {
                    self.send(at::format_response("CIND", &hfp::cind_capabilities()));
                    self.reply_ok();
                }
                ("CIND", AtKind::Get) => {
                    self.send(at::format_response("CIND", &hfp::cind_state()));
                    self.reply_ok();
                }
                ("CMER", AtKind::Set) => {
                    self.reply_ok();
                    // Service level connection established; pick the best
                    // common codec.
                    if self.enable_msbc && self.peer_codecs.contains(&hfp::CODEC_MSBC) {
                        self.pending_codec = Some(hfp::CODEC_MSBC);
                        self.send(at::format_response("BCS", &hfp::CODEC_MSBC.to_string()));
                    }
                    tracing::info!("RFCOMM SLC established");
                }
                ("CHLD", AtKind::Test) => {
                    self.send(at::format_response("CHLD", "(0,1,2,3)"));
                    self.reply_ok();
                }
                ("BCS", AtKind::Set) => {
                    let confirmed: u8 = value.trim().parse().unwrap_or(hfp::CODEC_CVSD);
                    self.reply_ok();
                    if self.pending_codec.take() == Some(confirmed) || self.pending_codec.is_none()
                    {
                        self.apply_codec(confirmed);
                    }
                }
                ("VGS", AtKind::Set) => {
                    self.apply_volume(PcmMode::Source, value.trim().parse().unwrap_or(0));
                    self.reply_ok();
                }
                ("VGM", AtKind::Set) => {
                    self.apply_volume(PcmMode::Sink, value.trim().parse().unwrap_or(0));
                    self.reply_ok();
                }
                ("XAPL", AtKind::Set) => {
                    self.handle_xapl(&value);
                }
                ("IPHONEACCEV", AtKind::Set) => {
                    self.handle_iphoneaccev(&value);
                    self.reply_ok();
                }
                ("CKPD", AtKind::Set) => self.reply_ok(),
                ("CLIP", AtKind::Set)
                | ("CCWA", AtKind::Set)
                | ("CMEE", AtKind::Set)
                | ("NREC", AtKind::Set)
                | ("BIA", AtKind::Set) => self.reply_ok(),
                _ => self.forward_unhandled(raw),
            },
            // Mirror a codec selection arriving in response form.
            AtMessage::Response { name, value } if name == "BCS" => {
                let codec: u8 = value.trim().parse().unwrap_or(hfp::CODEC_CVSD);
                self.send(at::format_command("BCS", &codec.to_string()));
                self.apply_codec(codec);
            }
            AtMessage::Ok | AtMessage::Error | AtMessage::Ring => {}
            AtMessage::Response { .. } => self.forward_unhandled(raw),
        }
    }

    /// Hands-free side: the peer is an audio gateway.
    fn handle_as_unit(&mut self, raw: &str, message: AtMessage) {
        match message {
            AtMessage::Response { name, value } => match name.as_str() {
                "BRSF" => {
                    self.inner.features.store(value.parse().unwrap_or(0), Ordering::Relaxed);
                }
                "BCS" => {
                    let codec: u8 = value.trim().parse().unwrap_or(hfp::CODEC_CVSD);
                    self.send(at::format_command("BCS", &codec.to_string()));
                    self.apply_codec(codec);
                }
                "CIEV" => self.handle_ciev(&value),
                "VGS" => self.apply_volume(PcmMode::Source, value.trim().parse().unwrap_or(0)),
                "VGM" => self.apply_volume(PcmMode::Sink, value.trim().parse().unwrap_or(0)),
                "BSIR" => {
                    tracing::debug!("In-band ringtone: {value}");
                }
                "CIND" | "CHLD" => {}
                _ => self.forward_unhandled(raw),
            },
            AtMessage::Ok => self.advance_handshake(),
            AtMessage::Error => {
                tracing::warn!("SLC step failed at {:?}", self.hf_state);
                self.advance_handshake();
            }
            AtMessage::Ring => {}
            AtMessage::Command { .. } => self.forward_unhandled(raw),
        }
    }

    /// Drive the HF-side handshake forward on each result code.
    fn advance_handshake(&mut self) {
        self.hf_state = match self.hf_state {
            HfState::Brsf => {
                if self.enable_msbc {
                    self.send(at::format_command(
                        "BAC",
                        &format!("{},{}", hfp::CODEC_CVSD, hfp::CODEC_MSBC),
                    ));
                    HfState::Bac
                } else {
                    self.send("AT+CIND=?\r".to_string());
                    HfState::CindTest
                }
            }
            HfState::Bac => {
                self.send("AT+CIND=?\r".to_string());
                HfState::CindTest
            }
            HfState::CindTest => {
                self.send("AT+CIND?\r".to_string());
                HfState::CindRead
            }
            HfState::CindRead => {
                self.send(at::format_command("CMER", "3,0,0,1"));
                HfState::Cmer
            }
            HfState::Cmer => {
                tracing::info!("RFCOMM SLC established");
                HfState::Done
            }
            HfState::Done => HfState::Done,
        };
    }

    fn apply_codec(&self, codec: u8) {
        let selected = match codec {
            hfp::CODEC_MSBC if self.enable_msbc => HfpCodec::Msbc,
            _ => HfpCodec::Cvsd,
        };
        if let Some(transport) = self.transport.upgrade() {
            if let Err(err) = transport.set_hfp_codec(selected) {
                tracing::error!("Couldn't switch HFP codec: {err}");
            }
        }
    }

    fn apply_volume(&self, mode: PcmMode, level: u8) {
        let Some(transport) = self.transport.upgrade() else { return };
        if let Some(pcm) = transport.pcm(mode) {
            pcm.set_volume(Volume::from_level(level.min(pcm.max_bt_volume)));
        }
    }

    /// `AT+XAPL=vendor-product-version,features`
    fn handle_xapl(&self, value: &str) {
        let Some((ids, features)) = value.split_once(',') else {
            self.reply_error();
            return;
        };
        let mut parts = ids.split('-');
        let vendor = parts.next().and_then(|v| u16::from_str_radix(v, 16).ok()).unwrap_or(0);
        let product = parts.next().and_then(|v| u16::from_str_radix(v, 16).ok()).unwrap_or(0);
        let version = parts.next().and_then(|v| u16::from_str_radix(v, 16).ok()).unwrap_or(0);
        let features: u8 = features.trim().parse().unwrap_or(0);
        if let Some(device) = self.device.upgrade() {
            device.set_xapl(Xapl { vendor_id: vendor, product_id: product, version, features });
        }
        // Battery reporting (2) and dock state (4).
        self.send("\r\n+XAPL=BlueALSA,6\r\n".to_string());
        self.reply_ok();
    }

    /// `AT+IPHONEACCEV=N,key,val,…`; key 1 is battery, 0–9.
    fn handle_iphoneaccev(&self, value: &str) {
        let fields: Vec<&str> = value.split(',').map(str::trim).collect();
        for pair in fields[1.min(fields.len())..].chunks(2) {
            if let [key, val] = pair {
                if *key == "1" {
                    if let Ok(level) = val.parse::<u8>() {
                        if let Some(device) = self.device.upgrade() {
                            device.set_battery((level.min(9) + 1) * 10);
                        }
                    }
                }
            }
        }
    }

    /// `+CIEV: index,value`
    fn handle_ciev(&self, value: &str) {
        let Some((index, level)) = value.split_once(',') else { return };
        let index: usize = index.trim().parse().unwrap_or(0);
        let level: u8 = level.trim().parse().unwrap_or(0);
        if index == hfp::IND_BATTCHG {
            if let Some(device) = self.device.upgrade() {
                device.set_battery(level.min(5) * 20);
            }
        }
    }

    /// Hand unrecognised traffic to the dispatch client, or fail the
    /// command when nobody listens.
    fn forward_unhandled(&self, raw: &str) {
        let dispatch = self.inner.dispatch.lock().unwrap();
        if let Some(fd) = dispatch.as_ref() {
            if sys::write(fd.as_raw_fd(), raw.as_bytes()).is_ok() {
                return;
            }
        }
        drop(dispatch);
        tracing::debug!("Unhandled AT traffic: {raw}");
        if raw.starts_with("AT") {
            self.reply_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluealsa_engine::adapter::Adapter;
    use bluealsa_engine::event::{EventListener, NullListener};
    use std::io::ErrorKind;
    use std::os::fd::FromRawFd;
    use std::time::{Duration, Instant};

    fn stream_socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    struct Peer {
        fd: OwnedFd,
        buf: String,
    }

    impl Peer {
        fn new(fd: OwnedFd) -> Self {
            sys::set_nonblocking(fd.as_raw_fd()).unwrap();
            Peer { fd, buf: String::new() }
        }

        fn send(&self, line: &str) {
            sys::write(self.fd.as_raw_fd(), format!("{line}\r").as_bytes()).unwrap();
        }

        /// Wait until the collected output contains `needle`.
        fn expect(&mut self, needle: &str) {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let mut buf = [0u8; 512];
                match sys::read(self.fd.as_raw_fd(), &mut buf) {
                    Ok(n) if n > 0 => self.buf.push_str(&String::from_utf8_lossy(&buf[..n])),
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => panic!("peer read: {err}"),
                }
                if self.buf.contains(needle) {
                    return;
                }
                assert!(Instant::now() < deadline, "timed out waiting for {needle:?}; got {:?}", self.buf);
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn gateway_session() -> (Box<dyn RfcommControl>, Peer, Arc<Transport>, Arc<Device>) {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener).unwrap();
        let device = adapter.device_get_or_create("AB:90:78:56:34:12".parse().unwrap(), "HF");
        let transport = device.create_sco_transport(Profile::HfpAg, true).unwrap();
        let (ours, theirs) = stream_socketpair();
        let session = RfcommSession::start(&device, &transport, ours, Profile::HfpAg, true).unwrap();
        (session, Peer::new(theirs), transport, device)
    }

    #[test]
    fn slc_handshake_as_gateway() {
        let (mut session, mut peer, _transport, _device) = gateway_session();

        peer.send("AT+BRSF=959");
        peer.expect("+BRSF: ");
        peer.expect("OK");

        peer.send("AT+BAC=1,2");
        peer.expect("OK");

        peer.send("AT+CIND=?");
        peer.expect("(\"battchg\",(0-5))");

        peer.send("AT+CIND?");
        // Both sides advertise codec negotiation, so the gateway offers
        // wide-band speech right after the SLC settles.
        peer.send("AT+CMER=3,0,0,1");
        peer.expect("+BCS: 2");

        assert_eq!(session.features(), 959);
        session.stop();
    }

    #[test]
    fn bcs_confirmation_switches_codec() {
        use bluealsa_core::TransportCodec;
        let (mut session, mut peer, transport, _device) = gateway_session();

        peer.send("AT+BRSF=959");
        peer.expect("OK");
        peer.send("AT+BAC=1,2");
        peer.send("AT+CMER=3,0,0,1");
        peer.expect("+BCS: 2");
        peer.send("AT+BCS=2");
        peer.expect("OK");

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.codec() != TransportCodec::Hfp(HfpCodec::Msbc) {
            assert!(Instant::now() < deadline, "codec was not switched");
            std::thread::sleep(Duration::from_millis(5));
        }
        session.stop();
    }

    #[test]
    fn vgs_updates_speaker_volume() {
        let (mut session, mut peer, transport, _device) = gateway_session();
        peer.send("AT+VGS=7");
        peer.expect("OK");

        let pcm = transport.pcm(PcmMode::Source).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pcm.volume().level(0) != 7 {
            assert!(Instant::now() < deadline, "volume was not applied");
            std::thread::sleep(Duration::from_millis(5));
        }
        session.stop();
    }

    #[test]
    fn xapl_battery_reporting() {
        let (mut session, mut peer, _transport, device) = gateway_session();
        peer.send("AT+XAPL=05AC-1234-0100,10");
        peer.expect("+XAPL=BlueALSA,6");
        peer.send("AT+IPHONEACCEV=2,1,8,2,0");
        peer.expect("OK");

        let deadline = Instant::now() + Duration::from_secs(2);
        while device.battery() != Some(90) {
            assert!(Instant::now() < deadline, "battery was not recorded");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(device.xapl().unwrap().vendor_id, 0x05ac);
        session.stop();
    }

    #[test]
    fn unknown_at_goes_to_dispatch_client() {
        let (mut session, mut peer, _transport, _device) = gateway_session();
        let client = session.open_dispatch().unwrap();
        sys::set_nonblocking(client.as_raw_fd()).unwrap();

        peer.send("AT+VENDORTHING=1");
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 128];
        loop {
            match sys::read(client.as_raw_fd(), &mut buf) {
                Ok(n) if n > 0 => {
                    assert!(String::from_utf8_lossy(&buf[..n]).contains("VENDORTHING"));
                    break;
                }
                _ => {
                    assert!(Instant::now() < deadline, "dispatch client saw nothing");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
        session.stop();
    }

    #[test]
    fn unit_side_initiates_handshake() {
        let listener: Arc<dyn EventListener> = Arc::new(NullListener);
        let adapter = Adapter::new(0, listener).unwrap();
        let device = adapter.device_get_or_create("AB:90:78:56:34:12".parse().unwrap(), "AG");
        let transport = device.create_sco_transport(Profile::HfpHf, true).unwrap();
        let (ours, theirs) = stream_socketpair();
        let mut session =
            RfcommSession::start(&device, &transport, ours, Profile::HfpHf, true).unwrap();
        let mut peer = Peer::new(theirs);

        peer.expect("AT+BRSF=");
        peer.send("+BRSF: 1536");
        peer.send("OK");
        peer.expect("AT+BAC=1,2");
        peer.send("OK");
        peer.expect("AT+CIND=?");
        peer.send("OK");
        peer.expect("AT+CIND?");
        peer.send("OK");
        peer.expect("AT+CMER=3,0,0,1");
        peer.send("OK");

        assert_eq!(session.features(), 1536);
        session.stop();
    }
}
