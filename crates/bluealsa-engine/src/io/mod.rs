//! Per-transport real-time I/O threads.
//!
//! One thread runs per transport, multiplexing the transport control
//! pipe, the Bluetooth socket, the client PCM descriptors and (for SCO)
//! a timer through one level-triggered poll. Threads are cancelled
//! cooperatively: the shutdown flag is checked after every wakeup and a
//! ping on the control pipe forces one.

mod a2dp;
mod sco;

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use bluealsa_core::{Profile, Result};

use crate::sys;
use crate::transport::{Shared, TransportSignal};

/// Spawn the I/O thread matching the transport profile.
pub(crate) fn spawn(shared: Arc<Shared>, signal_rx: OwnedFd) -> Result<JoinHandle<()>> {
    let name = match shared.profile {
        Profile::A2dpSource => "ba-a2dp-source",
        Profile::A2dpSink => "ba-a2dp-sink",
        _ => "ba-sco",
    };
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match shared.profile {
            Profile::A2dpSource => a2dp::source_thread(shared, signal_rx),
            Profile::A2dpSink => a2dp::sink_thread(shared, signal_rx),
            _ => sco::sco_thread(shared, signal_rx),
        })
        .map_err(bluealsa_core::Error::from)?;
    Ok(handle)
}

/// Drain one signal byte from the control pipe.
pub(crate) fn recv_signal(rx: RawFd) -> Option<TransportSignal> {
    let mut byte = [0u8; 1];
    match sys::read(rx, &mut byte) {
        Ok(1) => TransportSignal::from_byte(byte[0]),
        _ => None,
    }
}

/// Read everything pending from a non-blocking descriptor and discard
/// it; used by the drop signal to flush a client FIFO.
pub(crate) fn flush_fd(fd: RawFd) {
    let mut scratch = [0u8; 4096];
    while let Ok(n) = sys::read(fd, &mut scratch) {
        if n == 0 {
            break;
        }
    }
}

/// True when a poll result carries an error or hangup condition.
pub(crate) fn poll_error(revents: libc::c_short) -> bool {
    revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}

/// The raw audio descriptor of an open PCM, for polling. The descriptor
/// may be closed concurrently; the poll loop treats POLLNVAL as closed.
pub(crate) fn pcm_raw_fd(pcm: &crate::pcm::Pcm) -> RawFd {
    pcm.with_audio_fd(|fd| fd.as_raw_fd()).unwrap_or(-1)
}
