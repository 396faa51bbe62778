//! Rate-sync pacing clock.
//!
//! An encoder loop produces frames faster than the link consumes them;
//! [`AsrSync::sync`] stretches each iteration to the wall-clock duration
//! of the frames it produced, keeping the outgoing bitrate constant
//! regardless of encoder jitter. The time spent outside of the sleep is
//! reported as the busy time and feeds the PCM `Delay` property.

use std::time::Instant;

/// Sleep until an absolute CLOCK_MONOTONIC deadline.
///
/// `clock_nanosleep(TIMER_ABSTIME)` keeps precision in the tens of
/// microseconds even under load, which a relative sleep cannot.
#[cfg(target_os = "linux")]
fn sleep_until_mono_ns(deadline_ns: u64) {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline_ns % 1_000_000_000) as libc::c_long,
    };
    unsafe {
        libc::clock_nanosleep(libc::CLOCK_MONOTONIC, libc::TIMER_ABSTIME, &ts, std::ptr::null_mut());
    }
}

/// Current CLOCK_MONOTONIC time in nanoseconds.
#[cfg(target_os = "linux")]
fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Audio sample rate synchronizer.
pub struct AsrSync {
    sample_rate: u32,
    /// Frames accounted for since [`AsrSync::reset`].
    frames: u64,
    /// CLOCK_MONOTONIC ns at stream start.
    #[cfg(target_os = "linux")]
    start_ns: u64,
    #[cfg(not(target_os = "linux"))]
    start: Instant,
    /// Wall time of the previous `sync` return.
    last_sync: Instant,
    busy_us: u32,
}

impl AsrSync {
    /// Create a synchronizer for the given nominal sample rate. The
    /// stream clock starts at the first call to [`AsrSync::sync`].
    pub fn new(sample_rate: u32) -> Self {
        AsrSync {
            sample_rate,
            frames: 0,
            #[cfg(target_os = "linux")]
            start_ns: 0,
            #[cfg(not(target_os = "linux"))]
            start: Instant::now(),
            last_sync: Instant::now(),
            busy_us: 0,
        }
    }

    /// Restart the stream clock, e.g. after resume.
    pub fn reset(&mut self) {
        self.frames = 0;
    }

    /// True when the stream clock has not been started yet.
    pub fn is_reset(&self) -> bool {
        self.frames == 0
    }

    /// Account for `frames` just produced and sleep until their
    /// wall-clock position in the stream.
    pub fn sync(&mut self, frames: usize) {
        if self.frames == 0 {
            #[cfg(target_os = "linux")]
            {
                self.start_ns = monotonic_now_ns();
            }
            #[cfg(not(target_os = "linux"))]
            {
                self.start = Instant::now();
            }
            self.last_sync = Instant::now();
        }

        self.busy_us = self.last_sync.elapsed().as_micros().min(u32::MAX as u128) as u32;
        self.frames += frames as u64;

        let elapsed_ns = self.frames * 1_000_000_000 / self.sample_rate as u64;
        #[cfg(target_os = "linux")]
        {
            sleep_until_mono_ns(self.start_ns + elapsed_ns);
        }
        #[cfg(not(target_os = "linux"))]
        {
            let deadline = self.start + std::time::Duration::from_nanos(elapsed_ns);
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }

        self.last_sync = Instant::now();
    }

    /// Time spent busy (not sleeping) in the last iteration, in
    /// microseconds.
    pub fn busy_us(&self) -> u32 {
        self.busy_us
    }

    /// Busy time in the 0.1 ms units of the PCM `Delay` property.
    pub fn delay(&self) -> u16 {
        (self.busy_us / 100).min(u16::MAX as u32) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn paces_to_sample_rate() {
        let mut asrs = AsrSync::new(8000);
        let begin = Instant::now();
        // 4 x 800 frames at 8 kHz is 400 ms of audio.
        for _ in 0..4 {
            asrs.sync(800);
        }
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(380), "finished early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "overslept: {elapsed:?}");
    }

    #[test]
    fn reports_busy_time() {
        let mut asrs = AsrSync::new(48000);
        asrs.sync(480);
        std::thread::sleep(Duration::from_millis(20));
        asrs.sync(480);
        assert!(asrs.busy_us() >= 15_000, "busy {} us", asrs.busy_us());
        assert!(asrs.delay() >= 150);
    }

    #[test]
    fn reset_restarts_stream_clock() {
        let mut asrs = AsrSync::new(8000);
        asrs.sync(80);
        assert!(!asrs.is_reset());
        asrs.reset();
        assert!(asrs.is_reset());
        // After reset the first sync must not try to catch up with the
        // previous stream position.
        let begin = Instant::now();
        asrs.sync(80);
        assert!(begin.elapsed() < Duration::from_millis(100));
    }
}
