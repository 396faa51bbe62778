//! RTP packet framing for A2DP media streams.

use bluealsa_core::{Error, Result};

/// Dynamic payload type used for A2DP media packets.
pub const PAYLOAD_TYPE_MEDIA: u8 = 96;

/// RTP header (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Create a header with protocol defaults.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize to the 12-byte wire layout.
    pub fn serialize(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0f);
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    /// Parse the fixed header from wire bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::InvalidArguments("RTP header too short".into()));
        }
        Ok(RtpHeader {
            version: (data[0] >> 6) & 0x03,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0f,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Payload offset, accounting for CSRC entries.
    pub fn payload_offset(&self) -> usize {
        12 + self.csrc_count as usize * 4
    }
}

/// One media packet accepted by the reorder window.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

/// Output of [`ReorderBuffer::push`], in playback order.
#[derive(Debug, Clone)]
pub enum ReorderEvent {
    /// A payload ready for decoding.
    Packet(MediaPacket),
    /// Packets were lost; the gap is the timestamp distance in samples
    /// that should be rendered as silence.
    Gap { samples: u32 },
}

/// Sink-side sequence-number reorder window.
///
/// Packets within `window` of the next expected sequence are held back
/// until their turn; anything older is dropped, and an unrecoverable gap
/// is reported as silence sized from the timestamp delta.
pub struct ReorderBuffer {
    window: u16,
    expected: Option<u16>,
    last_timestamp: u32,
    held: Vec<MediaPacket>,
}

impl ReorderBuffer {
    pub fn new(window: u16) -> Self {
        ReorderBuffer { window: window.max(1), expected: None, last_timestamp: 0, held: Vec::new() }
    }

    /// Forget stream state, e.g. after the transport reconnects.
    pub fn reset(&mut self) {
        self.expected = None;
        self.held.clear();
    }

    /// Accept one parsed packet and return everything now playable.
    pub fn push(&mut self, packet: MediaPacket) -> Vec<ReorderEvent> {
        let mut events = Vec::new();

        let expected = match self.expected {
            None => {
                // First packet seeds the stream position.
                self.expected = Some(packet.sequence.wrapping_add(1));
                self.last_timestamp = packet.timestamp;
                events.push(ReorderEvent::Packet(packet));
                return events;
            }
            Some(expected) => expected,
        };

        let distance = packet.sequence.wrapping_sub(expected);
        if distance >= u16::MAX / 2 {
            // Behind the playback position, a late duplicate.
            tracing::debug!("Dropping late RTP packet: seq={}", packet.sequence);
            return events;
        }

        if distance >= self.window {
            // Too far ahead to wait for the missing packets; flush what
            // we hold and report the remainder of the gap as loss.
            self.drain_held(expected, &mut events);
            let gap = packet.timestamp.wrapping_sub(self.last_timestamp);
            tracing::debug!(
                "RTP loss: expected seq={}, got seq={}, gap={} samples",
                expected,
                packet.sequence,
                gap
            );
            if gap > 0 {
                events.push(ReorderEvent::Gap { samples: gap });
            }
            self.expected = Some(packet.sequence.wrapping_add(1));
            self.last_timestamp = packet.timestamp;
            events.push(ReorderEvent::Packet(packet));
            return events;
        }

        if distance == 0 {
            self.last_timestamp = packet.timestamp;
            self.expected = Some(packet.sequence.wrapping_add(1));
            events.push(ReorderEvent::Packet(packet));
            self.release_in_order(&mut events);
        } else {
            self.held.push(packet);
        }
        events
    }

    /// Pop held packets that continue the in-order run.
    fn release_in_order(&mut self, events: &mut Vec<ReorderEvent>) {
        loop {
            let expected = self.expected.unwrap();
            let Some(pos) = self.held.iter().position(|p| p.sequence == expected) else {
                return;
            };
            let packet = self.held.swap_remove(pos);
            self.last_timestamp = packet.timestamp;
            self.expected = Some(packet.sequence.wrapping_add(1));
            events.push(ReorderEvent::Packet(packet));
        }
    }

    /// Emit held packets from a broken window in sequence order.
    fn drain_held(&mut self, expected: u16, events: &mut Vec<ReorderEvent>) {
        self.held.sort_by_key(|p| p.sequence.wrapping_sub(expected));
        for packet in self.held.drain(..) {
            self.last_timestamp = packet.timestamp;
            events.push(ReorderEvent::Packet(packet));
        }
    }
}
