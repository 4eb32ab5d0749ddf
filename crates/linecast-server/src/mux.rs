// crates/linecast-server/src/mux.rs
//
// Output side: MPEG-TS packetization and the PCR-paced emission thread.
//
// Attachment bootstrap: no TS header until the first real video frame
// arrives, and nothing is emitted for a frame before the header. Once the
// output queue reaches the steady-state depth the mux becomes the pacing
// authority; emission follows the PCR derived from CT, and producers are
// gated upstream by the slots this consumption frees.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use tokio::sync::broadcast;

use linecast_core::clock::MasterClock;
use linecast_core::config::Tunables;
use linecast_core::frame::OutputFrame;

const TS_PACKET_LEN: usize = 188;
const PID_PAT: u16 = 0x0000;
const PID_PMT: u16 = 0x1000;
const PID_VIDEO: u16 = 0x0100;
const PID_AUDIO: u16 = 0x0101;
const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;
/// PSI repetition interval, in video frames (~330 ms at 30 fps).
const PSI_INTERVAL_FRAMES: u64 = 10;
/// PCR leads PTS by a nominal mux delay (~30 ms at 90 kHz). Saturating at
/// zero near session start; PCR catches up within the first frame.
const PCR_LAG_90K: u64 = 2_700;
/// How long the emission thread waits for a frame before declaring a STALL.
const STALL_POLL_MS: u64 = 250;

/// 90 kHz presentation timestamp for a content time: `pts = ct_us · 9 / 100`.
/// Audio PTS uses the same mapping; both streams are slaved to CT.
pub fn pts_90k(ct_us: u64) -> u64 {
    ct_us * 9 / 100
}

// ── Packetizer ────────────────────────────────────────────────────────────────

pub struct TsPacketizer {
    cc_pat: u8,
    cc_pmt: u8,
    cc_video: u8,
    cc_audio: u8,
    frames_muxed: u64,
    header_written: bool,
}

impl TsPacketizer {
    pub fn new() -> Self {
        Self { cc_pat: 0, cc_pmt: 0, cc_video: 0, cc_audio: 0, frames_muxed: 0, header_written: false }
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    /// Mux one stamped frame into TS packets: PSI on schedule, a video PES
    /// carrying PCR, and an audio PES when the frame has audio. No frame ⇒
    /// no bytes; the packetizer never fabricates filler of its own.
    pub fn mux_frame(&mut self, frame: &OutputFrame) -> Bytes {
        let mut out = BytesMut::with_capacity(4 * 1024);

        if !self.header_written || self.frames_muxed % PSI_INTERVAL_FRAMES == 0 {
            self.write_pat(&mut out);
            self.write_pmt(&mut out);
            self.header_written = true;
        }
        self.frames_muxed += 1;

        let pts = pts_90k(frame.ct_us);
        let pcr_base = pts.saturating_sub(PCR_LAG_90K);

        let video_pes = pes_payload(STREAM_ID_VIDEO, pts, &frame.video.data, true);
        write_payload(&mut out, PID_VIDEO, &mut self.cc_video, &video_pes, Some(pcr_base));

        if let Some(audio) = &frame.audio {
            let bytes = samples_to_le_bytes(&audio.samples);
            let audio_pes = pes_payload(STREAM_ID_AUDIO, pts, &bytes, false);
            write_payload(&mut out, PID_AUDIO, &mut self.cc_audio, &audio_pes, None);
        }

        out.freeze()
    }

    fn write_pat(&mut self, out: &mut BytesMut) {
        // program 1 → PMT PID
        let mut section = vec![
            0x00, // table_id
            0xB0, 0x0D, // section_syntax + length (13)
            0x00, 0x01, // transport_stream_id
            0xC1, // version 0, current_next = 1
            0x00, 0x00, // section / last_section
            0x00, 0x01, // program_number 1
            0xE0 | ((PID_PMT >> 8) as u8 & 0x1F), (PID_PMT & 0xFF) as u8,
        ];
        let crc = crc32_mpeg(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        write_psi(out, PID_PAT, &mut self.cc_pat, &section);
    }

    fn write_pmt(&mut self, out: &mut BytesMut) {
        let mut body = vec![
            0x02, // table_id
            0x00, 0x00, // length patched below
            0x00, 0x01, // program_number 1
            0xC1, // version 0, current_next = 1
            0x00, 0x00, // section / last_section
            0xE0 | ((PID_VIDEO >> 8) as u8 & 0x1F), (PID_VIDEO & 0xFF) as u8, // PCR PID = video
            0xF0, 0x00, // program_info_length 0
            // video elementary stream
            0x1B, 0xE0 | ((PID_VIDEO >> 8) as u8 & 0x1F), (PID_VIDEO & 0xFF) as u8, 0xF0, 0x00,
            // audio elementary stream
            0x0F, 0xE0 | ((PID_AUDIO >> 8) as u8 & 0x1F), (PID_AUDIO & 0xFF) as u8, 0xF0, 0x00,
        ];
        let section_length = (body.len() - 3 + 4) as u16; // after length field, incl. CRC
        body[1] = 0xB0 | ((section_length >> 8) as u8 & 0x0F);
        body[2] = (section_length & 0xFF) as u8;
        let crc = crc32_mpeg(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        write_psi(out, PID_PMT, &mut self.cc_pmt, &body);
    }
}

impl Default for TsPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Build a PES packet: start code, stream id, length, PTS flags + PTS.
fn pes_payload(stream_id: u8, pts: u64, es: &[u8], unbounded: bool) -> Vec<u8> {
    let mut pes = Vec::with_capacity(es.len() + 14);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let body_len = 3 + 5 + es.len(); // flags + header_len byte + PTS + payload
    let length_field = if unbounded || body_len > 0xFFFF { 0 } else { body_len as u16 };
    pes.extend_from_slice(&length_field.to_be_bytes());
    pes.extend_from_slice(&[0x80, 0x80, 0x05]); // marker, PTS-only, header length
    pes.extend_from_slice(&encode_pts(pts));
    pes.extend_from_slice(es);
    pes
}

fn encode_pts(pts: u64) -> [u8; 5] {
    let pts = pts & 0x1_FFFF_FFFF; // 33 bits
    [
        0x20 | (((pts >> 30) as u8 & 0x07) << 1) | 0x01,
        (pts >> 22) as u8,
        (((pts >> 15) as u8 & 0x7F) << 1) | 0x01,
        (pts >> 7) as u8,
        ((pts as u8 & 0x7F) << 1) | 0x01,
    ]
}

/// Write one PSI section as a single TS packet (pointer field + stuffing).
fn write_psi(out: &mut BytesMut, pid: u16, cc: &mut u8, section: &[u8]) {
    let mut pkt = [0xFFu8; TS_PACKET_LEN];
    pkt[0] = 0x47;
    pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // PUSI set
    pkt[2] = (pid & 0xFF) as u8;
    pkt[3] = 0x10 | (*cc & 0x0F); // payload only
    *cc = cc.wrapping_add(1);
    pkt[4] = 0x00; // pointer field
    pkt[5..5 + section.len()].copy_from_slice(section);
    out.extend_from_slice(&pkt);
}

/// Chunk a PES packet across TS packets for `pid`. PCR (if any) rides the
/// adaptation field of the first packet; the final packet absorbs slack as
/// adaptation-field stuffing.
fn write_payload(out: &mut BytesMut, pid: u16, cc: &mut u8, pes: &[u8], pcr_base: Option<u64>) {
    let mut remaining = pes;
    let mut first = true;
    while !remaining.is_empty() {
        let mut pkt = Vec::with_capacity(TS_PACKET_LEN);
        pkt.push(0x47);
        pkt.push(if first { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F));
        pkt.push((pid & 0xFF) as u8);

        // Adaptation field content (the length byte is written separately).
        // `Some(vec![])` encodes af_length = 0; a single stuffing byte.
        let mut af: Option<Vec<u8>> = if first {
            pcr_base.map(|base| {
                let mut v = vec![0x10]; // PCR flag
                v.extend_from_slice(&encode_pcr(base));
                v
            })
        } else {
            None
        };

        let mut space = TS_PACKET_LEN - 4 - af.as_ref().map_or(0, |a| 1 + a.len());
        if remaining.len() < space {
            let deficit = space - remaining.len();
            match af.as_mut() {
                Some(a) => a.resize(a.len() + deficit, 0xFF),
                None if deficit == 1 => af = Some(Vec::new()),
                None => {
                    let mut a = vec![0x00]; // flags byte, then pure stuffing
                    a.resize(deficit - 1, 0xFF);
                    af = Some(a);
                }
            }
            space = remaining.len();
        }

        pkt.push(if af.is_some() { 0x30 } else { 0x10 } | (*cc & 0x0F));
        *cc = cc.wrapping_add(1);
        if let Some(a) = &af {
            pkt.push(a.len() as u8);
            pkt.extend_from_slice(a);
        }
        pkt.extend_from_slice(&remaining[..space]);
        remaining = &remaining[space..];
        debug_assert_eq!(pkt.len(), TS_PACKET_LEN);
        out.extend_from_slice(&pkt);
        first = false;
    }
}

fn encode_pcr(base: u64) -> [u8; 6] {
    let base = base & 0x1_FFFF_FFFF;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E, // reserved bits set, extension high bit 0
        0x00,
    ]
}

/// MPEG-2 PSI CRC32 (poly 0x04C11DB7, no reflection).
fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04C1_1DB7 } else { crc << 1 };
        }
    }
    crc
}

// ── Emission thread ───────────────────────────────────────────────────────────

/// PCR-paced emission loop. Consumes stamped frames from the control core's
/// output queue and broadcasts TS bytes to however many HTTP viewers are
/// subscribed (zero included; viewer presence is advisory).
///
/// A dry queue is a STALL, never fabricated silence: the loop waits and logs;
/// the deficit filler upstream is what guarantees real-time cadence.
pub fn run_mux(
    clock: Arc<dyn MasterClock>,
    cfg: Tunables,
    rx: Receiver<OutputFrame>,
    ts_tx: broadcast::Sender<Bytes>,
) {
    let mut packetizer = TsPacketizer::new();
    let mut steady = false;
    // (wall µs, CT µs) pair captured at steady-state entry; pacing holds
    // `wall = anchor + (ct − anchor_ct)` from there.
    let mut anchor: Option<(i64, u64)> = None;
    let (band_low, band_high) = cfg.equilibrium_band();

    loop {
        let frame = match rx.recv_timeout(std::time::Duration::from_millis(STALL_POLL_MS)) {
            Ok(f) => f,
            Err(RecvTimeoutError::Timeout) => {
                if packetizer.header_written() {
                    warn!("[mux] STALL: no frame for {STALL_POLL_MS} ms (no silence injected)");
                    steady = false;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                info!("[mux] control core gone; stream ends");
                return;
            }
        };

        let depth = rx.len() + 1; // the frame in hand counts
        if !steady && depth >= cfg.steady_state_entry_depth {
            steady = true;
            anchor = None;
            info!("STEADY_STATE_ENTERED depth={depth}");
        }
        if steady && (depth < band_low || depth > band_high) {
            debug!("[mux] depth {depth} outside equilibrium band [{band_low}, {band_high}]");
        }

        // PCR pacing: emission cadence is slaved to CT, not to producer
        // supply. The anchor fixes the wall instant CT was at on entry.
        if steady {
            let (anchor_us, anchor_ct) =
                *anchor.get_or_insert((clock.now_utc_ms() * 1_000, frame.ct_us));
            clock.sleep_until_utc_us(anchor_us + (frame.ct_us - anchor_ct) as i64);
        }

        let bytes = packetizer.mux_frame(&frame);
        // No receivers is fine; the channel drops the chunk, playout goes on.
        let _ = ts_tx.send(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linecast_core::frame::{AudioPayload, FrameKind, VideoPayload};
    use linecast_core::plan::SegmentId;

    fn frame(ct_us: u64, with_audio: bool) -> OutputFrame {
        OutputFrame {
            ct_us,
            origin: SegmentId(1),
            kind: FrameKind::Content,
            video: VideoPayload { media_ts_us: 0, width: 4, height: 4, data: vec![0xAB; 400] },
            audio: with_audio.then(|| AudioPayload {
                media_ts_us: 0,
                rate: 48_000,
                samples: vec![0; 3_200],
            }),
        }
    }

    fn packets(bytes: &Bytes) -> Vec<&[u8]> {
        assert_eq!(bytes.len() % TS_PACKET_LEN, 0, "output must be whole TS packets");
        bytes.chunks(TS_PACKET_LEN).collect()
    }

    fn pid_of(pkt: &[u8]) -> u16 {
        (u16::from(pkt[1] & 0x1F) << 8) | u16::from(pkt[2])
    }

    #[test]
    fn every_packet_is_188_bytes_with_sync() {
        let mut mux = TsPacketizer::new();
        let bytes = mux.mux_frame(&frame(0, true));
        for pkt in packets(&bytes) {
            assert_eq!(pkt.len(), TS_PACKET_LEN);
            assert_eq!(pkt[0], 0x47);
        }
    }

    #[test]
    fn header_precedes_first_video() {
        let mut mux = TsPacketizer::new();
        assert!(!mux.header_written());
        let bytes = mux.mux_frame(&frame(0, false));
        let pkts = packets(&bytes);
        assert_eq!(pid_of(pkts[0]), PID_PAT);
        assert_eq!(pid_of(pkts[1]), PID_PMT);
        assert_eq!(pid_of(pkts[2]), PID_VIDEO);
        assert!(mux.header_written());
    }

    #[test]
    fn continuity_counters_advance_per_pid() {
        let mut mux = TsPacketizer::new();
        let mut ccs = Vec::new();
        for i in 0..3 {
            let bytes = mux.mux_frame(&frame(i * 33_333, false));
            for pkt in packets(&bytes) {
                if pid_of(pkt) == PID_VIDEO {
                    ccs.push(pkt[3] & 0x0F);
                }
            }
        }
        for w in ccs.windows(2) {
            assert_eq!(w[1], (w[0] + 1) & 0x0F);
        }
    }

    #[test]
    fn pts_is_90khz_from_ct() {
        assert_eq!(pts_90k(0), 0);
        assert_eq!(pts_90k(1_000_000), 90_000);
        assert_eq!(pts_90k(33_333), 2_999);
    }

    #[test]
    fn pts_encoding_round_trips() {
        let enc = encode_pts(123_456_789);
        let decoded = (u64::from(enc[0] & 0x0E) << 29)
            | (u64::from(enc[1]) << 22)
            | (u64::from(enc[2] & 0xFE) << 14)
            | (u64::from(enc[3]) << 7)
            | (u64::from(enc[4]) >> 1);
        assert_eq!(decoded, 123_456_789);
    }

    #[test]
    fn audio_packets_appear_only_with_audio() {
        let mut mux = TsPacketizer::new();
        let with = mux.mux_frame(&frame(0, true));
        assert!(packets(&with).iter().any(|p| pid_of(p) == PID_AUDIO));
        let without = mux.mux_frame(&frame(33_333, false));
        assert!(!packets(&without).iter().any(|p| pid_of(p) == PID_AUDIO));
    }

    #[test]
    fn payload_chunking_stuffs_every_tail_size_to_188() {
        // Sweep awkward payload sizes around the packet boundary, with and
        // without a PCR in the first packet.
        for pcr in [None, Some(1_000_000u64)] {
            for len in [1usize, 170, 175, 176, 177, 183, 184, 185, 368, 369] {
                let mut out = BytesMut::new();
                let mut cc = 0u8;
                let payload = vec![0x55u8; len];
                write_payload(&mut out, PID_VIDEO, &mut cc, &payload, pcr);
                assert_eq!(out.len() % TS_PACKET_LEN, 0, "len={len} pcr={pcr:?}");
                for pkt in out.chunks(TS_PACKET_LEN) {
                    assert_eq!(pkt[0], 0x47);
                }
            }
        }
    }

    #[test]
    fn psi_crc_matches_reference_vector() {
        // CRC32/MPEG-2 of "123456789" is 0x0376E6E7.
        assert_eq!(crc32_mpeg(b"123456789"), 0x0376_E6E7);
    }
}
