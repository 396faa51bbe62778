//! SCO transport I/O thread.
//!
//! One loop multiplexes the control pipe, both directions of the SCO
//! socket, the speaker and microphone PCM descriptors and the lifecycle
//! timer. Readiness is gated on codec buffer capacity, so backpressure
//! needs no extra bookkeeping. Losing the socket leaves the state
//! machine alive; the dispatcher reinstalls a descriptor later.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use bluealsa_core::{HfpCodec, TransportCodec};
use bluealsa_audio::codec::{Codec, CvsdCodec, MsbcCodec};
use bluealsa_audio::convert::{self, SoftVolume};
use bluealsa_audio::ffb::Ffb;
use bluealsa_audio::rate::AsrSync;

use crate::pcm::Pcm;
use crate::sys::{self, TimerFd};
use crate::transport::{Kind, ScoState, Shared, TransportSignal};

use super::{flush_fd, pcm_raw_fd, poll_error, recv_signal};

const DRAIN_TIMEOUT_MS: u64 = 250;
const LINGER_TIMEOUT_MS: u64 = 1000;
const CLOSE_TIMEOUT_MS: u64 = 600;

fn set_state(shared: &Shared, new: ScoState) {
    if let Kind::Sco { state, .. } = &shared.kind {
        *state.lock().unwrap() = new;
    }
}

fn get_state(shared: &Shared) -> ScoState {
    if let Kind::Sco { state, .. } = &shared.kind {
        *state.lock().unwrap()
    } else {
        ScoState::Idle
    }
}

fn both_pcms_closed(spk: &Pcm, mic: &Pcm) -> bool {
    !spk.is_open() && !mic.is_open()
}

pub(crate) fn sco_thread(shared: Arc<Shared>, signal_rx: OwnedFd) {
    let Kind::Sco { spk, mic, .. } = &shared.kind else { return };
    tracing::debug!("Starting SCO loop: {}", shared.path);

    let timer = match TimerFd::new() {
        Ok(timer) => timer,
        Err(err) => {
            tracing::error!("Couldn't create SCO timer: {err}");
            return;
        }
    };

    // Staging buffers around the codec; sized well above any SCO MTU.
    let mut enc_pcm: Ffb<i16> = Ffb::new(4096);
    let mut enc_wire: Ffb<u8> = Ffb::new(4096);
    let mut dec_wire: Ffb<u8> = Ffb::new(4096);
    let mut dec_pcm: Ffb<i16> = Ffb::new(4096);

    let mut codec: Box<dyn Codec> = Box::new(CvsdCodec::new(48));
    let mut active: Option<(TransportCodec, u16)> = None;
    let mut softvol = SoftVolume::new(1, spk.max_bt_volume);
    let mut asrs = AsrSync::new(spk.sampling());
    let mut scratch = vec![0u8; 4096];
    let mut samples = Vec::new();

    loop {
        if shared.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        // Pin the codec for this iteration; rebuild the adapter when the
        // negotiated codec or the link MTU changed.
        let wanted = *shared.codec.lock().unwrap();
        let (link_fd, mtu_read, mtu_write) = {
            let link = shared.link.lock().unwrap();
            (
                link.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1),
                link.mtu_read.max(24) as usize,
                link.mtu_write.max(24) as usize,
            )
        };
        if active != Some((wanted, mtu_write as u16)) {
            codec = match wanted {
                TransportCodec::Hfp(HfpCodec::Msbc) => Box::new(MsbcCodec::new()),
                _ => Box::new(CvsdCodec::new(mtu_write)),
            };
            active = Some((wanted, mtu_write as u16));
            enc_pcm.rewind();
            enc_wire.rewind();
            dec_wire.rewind();
            dec_pcm.rewind();
            asrs = AsrSync::new(spk.sampling());
        }

        // Move whole frames through the codec before deciding readiness.
        let mut frames_encoded = 0;
        if let Ok(frames) = codec.encode(&mut enc_pcm, &mut enc_wire) {
            frames_encoded += frames;
        }
        if let Err(err) = codec.decode(&mut dec_wire, &mut dec_pcm) {
            tracing::warn!("Couldn't decode SCO audio: {err}");
        }

        let write_chunk = mtu_write.min(codec.frame_wire_bytes().max(1)).max(1);
        let spk_fd = pcm_raw_fd(spk);
        let mic_fd = pcm_raw_fd(mic);

        let mut fds = [
            sys::pollfd(signal_rx.as_raw_fd(), libc::POLLIN),
            sys::pollfd(if dec_wire.len_in() >= mtu_read { link_fd } else { -1 }, libc::POLLIN),
            sys::pollfd(if enc_wire.len_out() >= write_chunk { link_fd } else { -1 }, libc::POLLOUT),
            sys::pollfd(
                if link_fd != -1 && enc_pcm.len_in() > 0 { spk_fd } else { -1 },
                libc::POLLIN,
            ),
            sys::pollfd(if dec_pcm.len_out() > 0 { mic_fd } else { -1 }, libc::POLLOUT),
            sys::pollfd(timer.as_raw_fd(), libc::POLLIN),
        ];
        if sys::poll(&mut fds, -1).is_err() {
            break;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            match recv_signal(signal_rx.as_raw_fd()) {
                Some(TransportSignal::Ping) | None => continue,
                Some(TransportSignal::PcmOpen) | Some(TransportSignal::PcmResume) => {
                    let _ = timer.cancel();
                    set_state(&shared, ScoState::Running);
                    asrs.reset();
                    continue;
                }
                Some(TransportSignal::PcmClose) => {
                    // The gateway releases SCO when no audio moves in
                    // either direction, freeing Bluetooth bandwidth; the
                    // headset keeps sending microphone data regardless.
                    if shared.profile.is_ag()
                        && both_pcms_closed(spk, mic)
                        && get_state(&shared) != ScoState::Linger
                    {
                        set_state(&shared, ScoState::Linger);
                        let _ = timer.arm(LINGER_TIMEOUT_MS);
                    }
                    continue;
                }
                Some(TransportSignal::PcmSync) => {
                    set_state(&shared, ScoState::Draining);
                    let _ = timer.arm(DRAIN_TIMEOUT_MS);
                }
                Some(TransportSignal::PcmDrop) => {
                    let _ = timer.cancel();
                    if spk_fd != -1 {
                        flush_fd(spk_fd);
                    }
                    enc_pcm.rewind();
                    enc_wire.rewind();
                    continue;
                }
                Some(TransportSignal::PcmPause) => continue,
            }
        }

        if fds[5].revents & libc::POLLIN != 0 {
            if !timer.acknowledge() {
                tracing::debug!("SCO timer failed");
                continue;
            }
            match get_state(&shared) {
                ScoState::Draining => {
                    set_state(&shared, ScoState::Running);
                    spk.signal_drain_complete();
                    continue;
                }
                ScoState::Linger => {
                    if shared.profile.is_ag() && both_pcms_closed(spk, mic) {
                        tracing::debug!("Releasing SCO due to PCM inactivity");
                        set_state(&shared, ScoState::Closing);
                        shared.release_link();
                        let _ = timer.arm(CLOSE_TIMEOUT_MS);
                    }
                    continue;
                }
                ScoState::Closing => {
                    set_state(&shared, ScoState::Idle);
                }
                _ => {}
            }
        }

        if asrs.is_reset() && spk.sampling() != 0 {
            asrs = AsrSync::new(spk.sampling());
        }

        if fds[1].revents & libc::POLLIN != 0 {
            match sys::read(link_fd, dec_wire.tail_mut()) {
                Ok(0) => {
                    shared.release_link();
                    continue;
                }
                Ok(len) => {
                    // Without a microphone client the incoming audio is
                    // dropped so latency never builds up.
                    if mic.is_open() {
                        dec_wire.seek(len);
                    }
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::ECONNABORTED) | Some(libc::ECONNRESET) => {
                        shared.release_link();
                        continue;
                    }
                    Some(libc::EAGAIN) => {}
                    _ => tracing::error!("SCO read error: {err}"),
                },
            }
        } else if poll_error(fds[1].revents) {
            tracing::debug!("SCO poll error status: {:#x}", fds[1].revents);
            shared.release_link();
        }

        if fds[2].revents & libc::POLLOUT != 0 {
            let len = write_chunk.min(enc_wire.len_out());
            match sys::write(link_fd, &enc_wire.data()[..len]) {
                Ok(written) => enc_wire.shift(written),
                Err(err) => match err.raw_os_error() {
                    Some(libc::ECONNABORTED) | Some(libc::ECONNRESET) | Some(libc::EPIPE) => {
                        shared.release_link();
                        continue;
                    }
                    Some(libc::EAGAIN) => {}
                    _ => tracing::error!("SCO write error: {err}"),
                },
            }
        } else if poll_error(fds[2].revents) {
            shared.release_link();
        }

        if fds[3].revents & libc::POLLIN != 0 {
            let room = (enc_pcm.len_in() * 2).min(scratch.len());
            match sys::read(spk_fd, &mut scratch[..room]) {
                Ok(0) => shared.close_pcm(spk),
                Ok(bytes) => {
                    convert::bytes_to_s16(&scratch[..bytes], &mut samples);
                    softvol.set_volume(spk.volume());
                    if spk.soft_volume() {
                        softvol.apply(&mut samples);
                    }
                    enc_pcm.append(&samples);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!("PCM read error: {err}");
                    shared.close_pcm(spk);
                }
            }
        } else if poll_error(fds[3].revents) {
            tracing::debug!("PCM poll error status: {:#x}", fds[3].revents);
            shared.close_pcm(spk);
        }

        if fds[4].revents & libc::POLLOUT != 0 {
            let mut bytes = Vec::new();
            convert::s16_to_bytes(dec_pcm.data(), &mut bytes);
            match sys::write(mic_fd, &bytes) {
                Ok(written) => dec_pcm.shift(written / 2),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!("FIFO write error: {err}");
                    shared.close_pcm(mic);
                    dec_pcm.rewind();
                }
            }
        } else if poll_error(fds[4].revents) {
            shared.close_pcm(mic);
            dec_pcm.rewind();
        }

        // Keep the outgoing leg at a constant bit rate.
        if frames_encoded > 0 {
            asrs.sync(frames_encoded * codec.frame_pcm_samples());
            let delay = asrs.delay();
            spk.set_delay(delay);
            mic.set_delay(delay);
        }
    }
    tracing::debug!("SCO loop exit: {}", shared.path);
}
