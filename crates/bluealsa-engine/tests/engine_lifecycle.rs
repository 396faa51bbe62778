//! End-to-end engine tests over mock Bluetooth links.
//!
//! A socketpair stands in for the Bluetooth socket, which lets these
//! tests drive the real I/O threads: client pipe in, codec, RTP or SCO
//! framing out, and the whole signal/lifecycle machinery in between.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bluealsa_core::{A2dpCodec, BdAddr, Config, HfpCodec, Profile, TransportCodec};
use bluealsa_core::volume::Volume;
use bluealsa_audio::codec::sbc::caps;
use bluealsa_engine::{sys, Engine, Event, EventListener, PcmMode, PcmUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Recorded {
    Added(String),
    Removed(String),
    Updated(String, PcmUpdate),
    Rfcomm(String),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Recorded>>,
}

impl Recorder {
    fn log(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    fn for_path(&self, path: &str) -> Vec<Recorded> {
        self.log()
            .into_iter()
            .filter(|e| match e {
                Recorded::Added(p) | Recorded::Removed(p) | Recorded::Updated(p, _) => p == path,
                Recorded::Rfcomm(p) => p == path,
            })
            .collect()
    }
}

impl EventListener for Recorder {
    fn notify(&self, event: Event) {
        let recorded = match event {
            Event::PcmAdded { pcm, .. } => Recorded::Added(pcm.path.clone()),
            Event::PcmRemoved { path } => Recorded::Removed(path),
            Event::PcmUpdated { path, update } => Recorded::Updated(path, update),
            Event::RfcommUpdated { device_path } => Recorded::Rfcomm(device_path),
        };
        self.events.lock().unwrap().push(recorded);
    }
}

fn engine_with_recorder() -> (Arc<Engine>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let engine = Engine::new(Arc::new(Config::default()), recorder.clone());
    (engine, recorder)
}

fn peer_address() -> BdAddr {
    "AB:90:78:56:34:12".parse().unwrap()
}

fn sbc_stereo_config() -> Vec<u8> {
    vec![
        caps::FREQ_44100 | caps::MODE_JOINT,
        caps::BLOCKS_16 | caps::SUBBANDS_8 | caps::ALLOCATION_LOUDNESS,
        2,
        53,
    ]
}

fn stream_socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
    };
    assert_eq!(ret, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Read from `fd` until `want` bytes arrived or the deadline passes.
fn read_exactly(fd: &OwnedFd, want: usize, timeout: Duration) -> Vec<u8> {
    sys::set_nonblocking(fd.as_raw_fd()).unwrap();
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < want {
        match sys::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
        assert!(Instant::now() < deadline, "timed out with {} of {} bytes", out.len(), want);
    }
    out
}

fn ctl_request(ctl: &OwnedFd, command: &str, timeout: Duration) -> String {
    sys::write(ctl.as_raw_fd(), command.as_bytes()).unwrap();
    let mut fds = [sys::pollfd(ctl.as_raw_fd(), libc::POLLIN)];
    assert!(sys::poll(&mut fds, timeout.as_millis() as i32).unwrap() > 0, "no reply to {command}");
    let mut buf = [0u8; 64];
    let len = sys::read(ctl.as_raw_fd(), &mut buf).unwrap();
    String::from_utf8_lossy(&buf[..len]).to_string()
}

#[test]
fn fresh_engine_lists_adapter_and_no_pcms() {
    let (engine, _recorder) = engine_with_recorder();
    engine.adapter_get_or_create(0).unwrap();
    assert_eq!(engine.adapter_names(), vec!["hci0".to_string()]);
    assert!(engine.pcms().is_empty());
}

#[test]
fn a2dp_sink_transport_surfaces_one_pcm() {
    let (engine, recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Phone");
    device
        .create_a2dp_transport(
            Profile::A2dpSink,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();

    let expected = "/org/bluealsa/hci0/dev_AB_90_78_56_34_12/a2dpsnk/sink";
    assert_eq!(recorder.log(), vec![Recorded::Added(expected.to_string())]);

    let pcms = engine.pcms();
    assert_eq!(pcms.len(), 1);
    let (transport, pcm) = &pcms[0];
    assert_eq!(pcm.path, expected);
    assert_eq!(pcm.format.0, 0x8210);
    assert_eq!(pcm.channels, 2);
    assert_eq!(pcm.sampling(), 44100);
    assert_eq!(transport.codec().id(), 0x0000);
}

#[test]
fn pcm_paths_are_unique_per_device_transport_mode() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Headset");
    device
        .create_a2dp_transport(
            Profile::A2dpSink,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();
    device.create_sco_transport(Profile::HfpAg, true).unwrap();

    let mut paths: Vec<String> = engine.pcms().iter().map(|(_, p)| p.path.clone()).collect();
    assert_eq!(paths.len(), 3);
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3, "duplicate (device, transport, mode) triple");
}

#[test]
fn volume_writes_are_signal_idempotent() {
    let (engine, recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Phone");
    let transport = device
        .create_a2dp_transport(
            Profile::A2dpSink,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();
    let pcm = transport.pcms().remove(0);

    let volume = Volume::from_level(100);
    pcm.set_volume(volume);
    pcm.set_volume(volume);

    let updates: Vec<Recorded> = recorder
        .for_path(&pcm.path)
        .into_iter()
        .filter(|e| matches!(e, Recorded::Updated(_, PcmUpdate::Volume)))
        .collect();
    assert_eq!(updates.len(), 1, "expected exactly one volume change signal");
}

#[test]
fn lifecycle_signal_ordering() {
    let (engine, recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Phone");
    let transport = device
        .create_a2dp_transport(
            Profile::A2dpSink,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();
    let pcm = transport.pcms().remove(0);
    let path = pcm.path.clone();

    pcm.set_volume(Volume::from_level(42));
    drop(pcm);
    let transport_path = transport.path.clone();
    drop(transport);
    device.remove_transport(&transport_path);

    let events = recorder.for_path(&path);
    assert!(matches!(events.first(), Some(Recorded::Added(_))), "log: {events:?}");
    assert!(matches!(events.last(), Some(Recorded::Removed(_))), "log: {events:?}");
    let added = events.iter().position(|e| matches!(e, Recorded::Added(_))).unwrap();
    let updated =
        events.iter().position(|e| matches!(e, Recorded::Updated(_, _))).unwrap();
    let removed = events.iter().position(|e| matches!(e, Recorded::Removed(_))).unwrap();
    assert!(added < updated && updated < removed);
}

#[test]
fn a2dp_source_streams_rtp_and_drains() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Speaker");
    let transport = device
        .create_a2dp_transport(
            Profile::A2dpSource,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();

    let (engine_end, peer) = stream_socketpair();
    transport.install_link(engine_end).unwrap();

    let (audio, ctl) = transport.open_pcm(PcmMode::Source).unwrap();

    // Two whole SBC frames of audio (256 samples each) plus a tail that
    // only a drain will flush.
    let samples: Vec<i16> = (0..600).map(|i| (i * 37 % 2048 - 1024) as i16).collect();
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    sys::write(audio.as_raw_fd(), &bytes).unwrap();

    let reply = ctl_request(&ctl, "Drain", Duration::from_secs(3));
    assert_eq!(reply, "OK");

    // Everything the client wrote must have left as RTP media packets;
    // 600 samples pad up to three 119-byte frames.
    let wire = read_exactly(&peer, 3 * (12 + 1 + 119), Duration::from_secs(2));
    assert_eq!(wire[0] & 0xc0, 0x80, "RTP version");
    assert_eq!(wire[1] & 0x7f, 96, "payload type");
    assert_eq!(wire[13], 0x9c, "SBC syncword after the media header");
}

#[test]
fn sco_cvsd_is_bit_identical_both_ways() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Headset");
    let transport = device.create_sco_transport(Profile::HfpAg, true).unwrap();
    assert_eq!(transport.codec(), TransportCodec::Hfp(HfpCodec::Cvsd));

    let (engine_end, peer) = stream_socketpair();
    transport.install_link(engine_end).unwrap();

    // Speaker direction: client -> SCO socket, byte for byte.
    let (spk_audio, _spk_ctl) = transport.open_pcm(PcmMode::Source).unwrap();
    let outgoing: Vec<u8> = (0..480u32).map(|i| (i % 251) as u8).collect();
    sys::write(spk_audio.as_raw_fd(), &outgoing).unwrap();
    let on_air = read_exactly(&peer, outgoing.len(), Duration::from_secs(3));
    assert_eq!(on_air, outgoing);

    // Microphone direction: SCO socket -> client, byte for byte.
    let (mic_audio, _mic_ctl) = transport.open_pcm(PcmMode::Sink).unwrap();
    let incoming: Vec<u8> = (0..480u32).map(|i| (255 - i % 240) as u8).collect();
    sys::write(peer.as_raw_fd(), &incoming).unwrap();
    let captured = read_exactly(&mic_audio, incoming.len(), Duration::from_secs(3));
    assert_eq!(captured, incoming);
}

#[test]
fn sco_drop_discards_pending_speaker_audio() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Headset");
    let transport = device.create_sco_transport(Profile::HfpAg, true).unwrap();

    // No link installed: written audio queues in the client FIFO.
    let (spk_audio, spk_ctl) = match transport.open_pcm(PcmMode::Source) {
        Ok(fds) => fds,
        Err(_) => return, // no loopback without an AG-initiated link
    };
    sys::write(spk_audio.as_raw_fd(), &[0x55u8; 960]).unwrap();
    let reply = ctl_request(&spk_ctl, "Drop", Duration::from_secs(1));
    assert_eq!(reply, "OK");
}

#[test]
fn ag_linger_releases_sco_after_close() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Headset");
    let transport = device.create_sco_transport(Profile::HfpAg, true).unwrap();

    let (engine_end, _peer) = stream_socketpair();
    transport.install_link(engine_end).unwrap();
    let fds = transport.open_pcm(PcmMode::Source).unwrap();

    // Closing the client descriptors counts as closing the PCM.
    drop(fds);

    // The gateway keeps the link through the linger window...
    std::thread::sleep(Duration::from_millis(500));
    assert!(transport.is_connected(), "link released before the linger window");

    // ...and releases it once the window passes with no new open.
    let deadline = Instant::now() + Duration::from_secs(3);
    while transport.is_connected() {
        assert!(Instant::now() < deadline, "link never released");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn hfp_codec_switch_retunes_both_pcms() {
    let (engine, recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Headset");
    let transport = device.create_sco_transport(Profile::HfpAg, true).unwrap();

    transport.set_hfp_codec(HfpCodec::Msbc).unwrap();
    assert_eq!(transport.codec().id(), 0x0002);
    for pcm in transport.pcms() {
        assert_eq!(pcm.sampling(), 16000);
    }

    let codec_updates = recorder
        .log()
        .into_iter()
        .filter(|e| matches!(e, Recorded::Updated(_, PcmUpdate::Codec)))
        .count();
    assert_eq!(codec_updates, 2);

    // Switching to the same codec again is a no-op.
    transport.set_hfp_codec(HfpCodec::Msbc).unwrap();
    let after = recorder
        .log()
        .into_iter()
        .filter(|e| matches!(e, Recorded::Updated(_, PcmUpdate::Codec)))
        .count();
    assert_eq!(after, 2);
}

#[test]
fn select_codec_validates_configuration() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Phone");
    let transport = device
        .create_a2dp_transport(
            Profile::A2dpSink,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();

    assert!(transport.select_codec("SBC", vec![0; 2]).is_err());
    assert!(transport.select_codec("FLAC", sbc_stereo_config()).is_err());
    assert!(transport.select_codec("SBC", sbc_stereo_config()).is_ok());
}

#[test]
fn second_open_on_same_pcm_is_rejected() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Speaker");
    let transport = device
        .create_a2dp_transport(
            Profile::A2dpSource,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();
    let (engine_end, _peer) = stream_socketpair();
    transport.install_link(engine_end).unwrap();

    let _fds = transport.open_pcm(PcmMode::Source).unwrap();
    assert!(transport.open_pcm(PcmMode::Source).is_err());
}

#[test]
fn open_without_link_reports_not_connected() {
    let (engine, _recorder) = engine_with_recorder();
    let adapter = engine.adapter_get_or_create(0).unwrap();
    let device = adapter.device_get_or_create(peer_address(), "Phone");
    let transport = device
        .create_a2dp_transport(
            Profile::A2dpSink,
            A2dpCodec::Sbc,
            sbc_stereo_config(),
            None,
            true,
            127,
            Duration::ZERO,
        )
        .unwrap();
    assert!(matches!(
        transport.open_pcm(PcmMode::Sink),
        Err(bluealsa_core::Error::NotConnected)
    ));
}
