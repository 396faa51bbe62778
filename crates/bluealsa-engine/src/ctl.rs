//! PCM client control protocol.
//!
//! Each open PCM runs one controller thread servicing the client's end
//! of a SOCK_SEQPACKET pair: text commands `Drain`, `Drop`, `Pause` and
//! `Resume`, each answered with exactly one `"OK"` or `"ERR:<text>"`
//! datagram. Closing the socket counts as the client going away.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pcm::{Pcm, PcmMode};
use crate::sys;
use crate::transport::{Shared, TransportSignal};

/// How long a drain may take before the client gets an error.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) fn spawn(
    shared: Arc<Shared>,
    pcm: Arc<Pcm>,
    ctl: OwnedFd,
    shutdown_rx: OwnedFd,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ba-pcm-ctl".to_string())
        .spawn(move || controller(shared, pcm, ctl, shutdown_rx))
}

fn controller(shared: Arc<Shared>, pcm: Arc<Pcm>, ctl: OwnedFd, shutdown_rx: OwnedFd) {
    tracing::debug!("Starting PCM controller: {}", pcm.path);
    loop {
        let mut fds = [
            sys::pollfd(ctl.as_raw_fd(), libc::POLLIN),
            sys::pollfd(shutdown_rx.as_raw_fd(), libc::POLLIN),
        ];
        if sys::poll(&mut fds, -1).is_err() {
            break;
        }
        if fds[1].revents != 0 {
            // Engine-driven teardown; the transport handles the close.
            break;
        }
        if crate::io::poll_error(fds[0].revents) {
            shared.close_pcm(&pcm);
            break;
        }
        if fds[0].revents & libc::POLLIN == 0 {
            continue;
        }

        let mut buf = [0u8; 64];
        let len = match sys::read(ctl.as_raw_fd(), &mut buf) {
            Ok(0) | Err(_) => {
                shared.close_pcm(&pcm);
                break;
            }
            Ok(len) => len,
        };

        let reply: String = match &buf[..len] {
            b"Drain" => handle_drain(&shared, &pcm),
            b"Drop" => {
                shared.send_signal(TransportSignal::PcmDrop);
                "OK".into()
            }
            b"Pause" => {
                shared.send_signal(TransportSignal::PcmPause);
                "OK".into()
            }
            b"Resume" => {
                shared.send_signal(TransportSignal::PcmResume);
                "OK".into()
            }
            other => {
                let text = String::from_utf8_lossy(other);
                tracing::warn!("Invalid PCM control command: {text}");
                format!("ERR:invalid command: {text}")
            }
        };
        if sys::write(ctl.as_raw_fd(), reply.as_bytes()).is_err() {
            shared.close_pcm(&pcm);
            break;
        }
    }
    tracing::debug!("PCM controller exit: {}", pcm.path);
}

fn handle_drain(shared: &Shared, pcm: &Pcm) -> String {
    // Only the playback direction holds residual frames.
    if pcm.mode != PcmMode::Source {
        return "OK".into();
    }
    let generation = pcm.drain_begin();
    shared.send_signal(TransportSignal::PcmSync);
    if pcm.drain_wait_from(generation, DRAIN_TIMEOUT) {
        "OK".into()
    } else {
        "ERR:drain timed out".into()
    }
}
