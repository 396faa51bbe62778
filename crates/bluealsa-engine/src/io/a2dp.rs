//! A2DP I/O threads: RTP-framed codec streams over the L2CAP media
//! channel.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use bluealsa_core::{A2dpCodec, TransportCodec};
use bluealsa_audio::codec::aac::{AacConfig, AacDecoder};
use bluealsa_audio::codec::mpeg::{MpegConfig, MpegDecoder};
use bluealsa_audio::codec::sbc::{self, SbcCodec};
use bluealsa_audio::codec::{Codec, CodecError};
use bluealsa_audio::convert::{self, SoftVolume};
use bluealsa_audio::ffb::Ffb;
use bluealsa_audio::rate::AsrSync;
use bluealsa_audio::rtp::{MediaPacket, ReorderBuffer, ReorderEvent, RtpHeader, PAYLOAD_TYPE_MEDIA};

use crate::sys::{self, TimerFd};
use crate::transport::{Kind, Shared, TransportSignal};

use super::{flush_fd, pcm_raw_fd, poll_error, recv_signal};

/// Size of the sink-side sequence reorder window.
const REORDER_WINDOW: u16 = 16;

/// Cap on silence injected for one reported loss, in frames.
const MAX_GAP_FRAMES: u32 = 4096;

fn build_codec(codec: TransportCodec, config: &[u8]) -> Result<Box<dyn Codec>, CodecError> {
    match codec {
        TransportCodec::A2dp(A2dpCodec::Sbc) => {
            Ok(Box::new(SbcCodec::new(sbc::caps::parse_config(config)?)))
        }
        TransportCodec::A2dp(A2dpCodec::Mpeg24) => {
            Ok(Box::new(AacDecoder::new(AacConfig::parse(config)?)?))
        }
        TransportCodec::A2dp(A2dpCodec::Mpeg12) => {
            Ok(Box::new(MpegDecoder::new(MpegConfig::parse(config)?)?))
        }
        _ => Err(CodecError::NotSupported("A2DP codec")),
    }
}

/// Snapshot of codec identity and configuration, for rebuild detection.
fn codec_key(shared: &Shared) -> (TransportCodec, Vec<u8>) {
    let Kind::A2dp { config, .. } = &shared.kind else { unreachable!() };
    (*shared.codec.lock().unwrap(), config.lock().unwrap().clone())
}

fn link_raw_fd(shared: &Shared) -> (i32, u16, u16) {
    let link = shared.link.lock().unwrap();
    (
        link.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1),
        link.mtu_read,
        link.mtu_write,
    )
}

/// Encoder thread of an A2DP source transport.
pub(crate) fn source_thread(shared: Arc<Shared>, signal_rx: OwnedFd) {
    let Kind::A2dp { pcm, .. } = &shared.kind else { return };
    tracing::debug!("Starting A2DP source loop: {}", shared.path);

    let keep_alive = match TimerFd::new() {
        Ok(timer) => timer,
        Err(err) => {
            tracing::error!("Couldn't create keep-alive timer: {err}");
            return;
        }
    };

    let mut codec: Option<Box<dyn Codec>> = None;
    let mut active_key: Option<(TransportCodec, Vec<u8>)> = None;
    let mut pcm_ffb: Ffb<i16> = Ffb::new(8192);
    let mut wire: Ffb<u8> = Ffb::new(8192);
    let mut softvol = SoftVolume::new(pcm.channels as usize, pcm.max_bt_volume);
    let mut asrs = AsrSync::new(pcm.sampling());
    let mut sequence: u16 = 0;
    let mut timestamp: u32 = 0;
    let mut paused = false;
    let mut draining = false;
    let mut scratch = vec![0u8; 8192];
    let mut samples = Vec::new();

    loop {
        if shared.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        let key = codec_key(&shared);
        if active_key.as_ref() != Some(&key) {
            match build_codec(key.0, &key.1) {
                Ok(built) => {
                    codec = Some(built);
                    active_key = Some(key);
                    asrs = AsrSync::new(pcm.sampling());
                    pcm_ffb.rewind();
                    wire.rewind();
                }
                Err(err) => {
                    tracing::error!("Couldn't initialize codec: {err}");
                    codec = None;
                    active_key = Some(key);
                }
            }
        }

        let (link_fd, _mtu_read, mtu_write) = link_raw_fd(&shared);
        let audio_fd = pcm_raw_fd(pcm);
        let want_audio =
            audio_fd != -1 && link_fd != -1 && !paused && codec.is_some() && pcm_ffb.len_in() > 0;

        let mut fds = [
            sys::pollfd(signal_rx.as_raw_fd(), libc::POLLIN),
            sys::pollfd(if want_audio { audio_fd } else { -1 }, libc::POLLIN),
            sys::pollfd(keep_alive.as_raw_fd(), libc::POLLIN),
        ];
        if sys::poll(&mut fds, -1).is_err() {
            break;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            match recv_signal(signal_rx.as_raw_fd()) {
                Some(TransportSignal::PcmOpen) => {
                    let _ = keep_alive.cancel();
                    paused = false;
                    draining = false;
                    asrs.reset();
                    continue;
                }
                Some(TransportSignal::PcmResume) => {
                    paused = false;
                    asrs.reset();
                    continue;
                }
                Some(TransportSignal::PcmPause) => {
                    paused = true;
                    continue;
                }
                Some(TransportSignal::PcmClose) => {
                    if !pcm.is_open() {
                        if shared.keep_alive.is_zero() {
                            shared.release_link();
                            if let Some(c) = codec.as_mut() {
                                c.reset();
                            }
                        } else {
                            let _ = keep_alive.arm(shared.keep_alive.as_millis() as u64);
                        }
                    }
                    continue;
                }
                Some(TransportSignal::PcmSync) => {
                    draining = true;
                    // Fall through and flush below.
                }
                Some(TransportSignal::PcmDrop) => {
                    if audio_fd != -1 {
                        flush_fd(audio_fd);
                    }
                    pcm_ffb.rewind();
                    wire.rewind();
                    continue;
                }
                Some(TransportSignal::Ping) | None => continue,
            }
        }

        if fds[2].revents & libc::POLLIN != 0 && keep_alive.acknowledge() && !pcm.is_open() {
            tracing::debug!("Keep-alive expired, releasing transport: {}", shared.path);
            shared.release_link();
            if let Some(c) = codec.as_mut() {
                c.reset();
            }
            continue;
        }

        let Some(codec_ref) = codec.as_mut() else { continue };

        if fds[1].revents & libc::POLLIN != 0 {
            let room = pcm_ffb.len_in() * 2;
            let len = room.min(scratch.len());
            match sys::read(audio_fd, &mut scratch[..len]) {
                Ok(0) => {
                    shared.close_pcm(pcm);
                    continue;
                }
                Ok(bytes) => {
                    convert::bytes_to_s16(&scratch[..bytes], &mut samples);
                    softvol.set_volume(pcm.volume());
                    if pcm.soft_volume() {
                        softvol.apply(&mut samples);
                    }
                    pcm_ffb.append(&samples);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!("PCM read error: {err}");
                    shared.close_pcm(pcm);
                    continue;
                }
            }
        } else if poll_error(fds[1].revents) {
            shared.close_pcm(pcm);
            continue;
        }

        if draining {
            // Pull whatever the client FIFO still holds, then pad the
            // residual to a whole frame so every sample leaves the codec.
            if audio_fd != -1 {
                let mut more = vec![0u8; 4096];
                while let Ok(n) = sys::read(audio_fd, &mut more) {
                    if n == 0 {
                        break;
                    }
                    convert::bytes_to_s16(&more[..n], &mut samples);
                    pcm_ffb.append(&samples);
                }
            }
            let frame = codec_ref.frame_pcm_samples();
            let residual = pcm_ffb.len_out() % frame;
            if residual > 0 {
                let pad = vec![0i16; frame - residual];
                pcm_ffb.append(&pad);
            }
        }

        if let Err(err) = codec_ref.encode(&mut pcm_ffb, &mut wire) {
            tracing::error!("Encode error: {err}");
            shared.release_link();
            codec_ref.reset();
            continue;
        }

        let mut frames_sent = 0usize;
        let frame_bytes = codec_ref.frame_wire_bytes();
        if frame_bytes > 0 && link_fd != -1 {
            let per_packet = ((mtu_write as usize).saturating_sub(13) / frame_bytes).clamp(1, 15);
            while wire.len_out() >= frame_bytes {
                let n = (wire.len_out() / frame_bytes).min(per_packet);
                let header = RtpHeader::new(PAYLOAD_TYPE_MEDIA, sequence, timestamp, 1);
                let mut packet = Vec::with_capacity(13 + n * frame_bytes);
                packet.extend_from_slice(&header.serialize());
                packet.push(n as u8 & 0x0f);
                packet.extend_from_slice(&wire.data()[..n * frame_bytes]);

                match sys::write(link_fd, &packet) {
                    Ok(_) => {
                        wire.shift(n * frame_bytes);
                        sequence = sequence.wrapping_add(1);
                        let per_channel =
                            (n * codec_ref.frame_pcm_samples() / pcm.channels as usize) as u32;
                        timestamp = timestamp.wrapping_add(per_channel);
                        frames_sent += n;
                    }
                    Err(err) => {
                        tracing::error!("BT write error: {err}");
                        shared.release_link();
                        codec_ref.reset();
                        break;
                    }
                }
            }
        }

        if draining && pcm_ffb.len_out() < codec_ref.frame_pcm_samples() && wire.len_out() < frame_bytes.max(1)
        {
            draining = false;
            pcm.signal_drain_complete();
        }

        if frames_sent > 0 {
            let per_channel = frames_sent * codec_ref.frame_pcm_samples() / pcm.channels as usize;
            asrs.sync(per_channel);
            pcm.set_delay(asrs.delay());
        }
    }
    tracing::debug!("A2DP source loop exit: {}", shared.path);
}

/// Decoder thread of an A2DP sink transport.
pub(crate) fn sink_thread(shared: Arc<Shared>, signal_rx: OwnedFd) {
    let Kind::A2dp { pcm, .. } = &shared.kind else { return };
    tracing::debug!("Starting A2DP sink loop: {}", shared.path);

    let mut codec: Option<Box<dyn Codec>> = None;
    let mut active_key: Option<(TransportCodec, Vec<u8>)> = None;
    let mut reorder = ReorderBuffer::new(REORDER_WINDOW);
    let mut wire: Ffb<u8> = Ffb::new(16384);
    let mut pcm_out: Ffb<i16> = Ffb::new(16384);
    let mut softvol = SoftVolume::new(pcm.channels as usize, pcm.max_bt_volume);
    let mut paused = false;
    let mut scratch = vec![0u8; 4096];
    let mut bytes = Vec::new();

    loop {
        if shared.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        let key = codec_key(&shared);
        if active_key.as_ref() != Some(&key) {
            match build_codec(key.0, &key.1) {
                Ok(built) => {
                    codec = Some(built);
                    active_key = Some(key);
                    reorder.reset();
                    wire.rewind();
                    pcm_out.rewind();
                }
                Err(err) => {
                    tracing::error!("Couldn't initialize codec: {err}");
                    codec = None;
                    active_key = Some(key);
                }
            }
        }

        let (link_fd, _, _) = link_raw_fd(&shared);
        let mut fds = [
            sys::pollfd(signal_rx.as_raw_fd(), libc::POLLIN),
            sys::pollfd(if codec.is_some() { link_fd } else { -1 }, libc::POLLIN),
        ];
        if sys::poll(&mut fds, -1).is_err() {
            break;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            match recv_signal(signal_rx.as_raw_fd()) {
                Some(TransportSignal::PcmOpen) | Some(TransportSignal::PcmResume) => {
                    paused = false;
                    continue;
                }
                Some(TransportSignal::PcmPause) => {
                    paused = true;
                    continue;
                }
                Some(TransportSignal::PcmClose) => {
                    pcm_out.rewind();
                    continue;
                }
                Some(TransportSignal::PcmSync) => {
                    // Nothing buffers towards the peer on the sink side.
                    pcm.signal_drain_complete();
                    continue;
                }
                Some(TransportSignal::PcmDrop) => {
                    pcm_out.rewind();
                    continue;
                }
                Some(TransportSignal::Ping) | None => continue,
            }
        }

        let Some(codec_ref) = codec.as_mut() else { continue };

        if poll_error(fds[1].revents) {
            tracing::debug!("BT poll error status: {:#x}", fds[1].revents);
            shared.release_link();
            codec_ref.reset();
            reorder.reset();
            continue;
        }
        if fds[1].revents & libc::POLLIN == 0 {
            continue;
        }

        let len = match sys::read(link_fd, &mut scratch) {
            Ok(0) => {
                shared.release_link();
                codec_ref.reset();
                reorder.reset();
                continue;
            }
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                tracing::error!("BT read error: {err}");
                shared.release_link();
                continue;
            }
        };

        let Ok(header) = RtpHeader::parse(&scratch[..len]) else {
            tracing::debug!("Malformed RTP packet: {len} bytes");
            continue;
        };
        let mut payload = &scratch[header.payload_offset().min(len)..len];
        // The SBC media payload carries a one-byte frame-count header.
        if matches!(codec_ref.codec(), TransportCodec::A2dp(A2dpCodec::Sbc)) && !payload.is_empty() {
            payload = &payload[1..];
        }

        let events = reorder.push(MediaPacket {
            sequence: header.sequence,
            timestamp: header.timestamp,
            payload: payload.to_vec(),
        });

        for event in events {
            match event {
                ReorderEvent::Packet(packet) => {
                    wire.append(&packet.payload);
                    if let Err(err) = codec_ref.decode(&mut wire, &mut pcm_out) {
                        tracing::warn!("Decode error: {err}");
                        wire.rewind();
                    }
                }
                ReorderEvent::Gap { samples } => {
                    let frames = samples.min(MAX_GAP_FRAMES) as usize;
                    let silence = vec![0i16; frames * pcm.channels as usize];
                    pcm_out.append(&silence);
                }
            }
        }

        if paused || !pcm.is_open() {
            // Keep decoding for latency, drop the audio.
            pcm_out.rewind();
            continue;
        }

        if pcm_out.len_out() > 0 {
            softvol.set_volume(pcm.volume());
            let mut frames: Vec<i16> = pcm_out.data().to_vec();
            if pcm.soft_volume() {
                softvol.apply(&mut frames);
            }
            convert::s16_to_bytes(&frames, &mut bytes);
            let written = pcm
                .with_audio_fd(|fd| match sys::write(fd.as_raw_fd(), &bytes) {
                    Ok(n) => Ok(n),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                    Err(err) => Err(err),
                })
                .unwrap_or(Ok(bytes.len()));
            // Anything the client could not take right now is dropped to
            // keep latency bounded.
            pcm_out.rewind();
            if let Err(err) = written {
                tracing::error!("FIFO write error: {err}");
                shared.close_pcm(pcm);
            }
        }
    }
    tracing::debug!("A2DP sink loop exit: {}", shared.path);
}
