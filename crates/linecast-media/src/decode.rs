// crates/linecast-media/src/decode.rs
//
// SegmentDecoder: stateful per-segment decoder. Opens at the planned start
// frame (keyframe-aligned seek + decode-only burn to the exact frame), then
// yields video and audio in media order until the container is exhausted.

use std::collections::VecDeque;

use anyhow::Result;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};

use linecast_core::frame::{AudioPayload, MediaItem, VideoPayload};
use linecast_core::plan::Fps;

pub struct SegmentDecoder {
    ictx: ffmpeg::format::context::Input,
    video_idx: usize,
    audio_idx: Option<usize>,
    vdec: ffmpeg::decoder::video::Video,
    adec: Option<ffmpeg::decoder::audio::Audio>,
    scaler: SwsContext,
    out_w: u32,
    out_h: u32,
    vtb: (i32, i32),
    atb: (i32, i32),
    reported_fps: Option<Fps>,
    /// Decode-only skip threshold after the keyframe-aligned seek. Burning
    /// through the GOP without scaling is several times cheaper than scaling
    /// every frame we are about to discard.
    skip_until_pts: i64,
    start_us: i64,
    pending: VecDeque<MediaItem>,
    exhausted: bool,
}

impl SegmentDecoder {
    /// Open `uri` positioned at `start_frame` (counted at `source_fps`).
    pub fn open(uri: &str, start_frame: u64, source_fps: Fps) -> Result<Self> {
        let mut ictx = input(uri)?;
        let video_idx = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| anyhow::anyhow!("no video stream in {uri}"))?
            .index();
        let audio_idx = ictx.streams().best(Type::Audio).map(|s| s.index());

        let start_secs =
            start_frame as f64 * f64::from(source_fps.den) / f64::from(source_fps.num);

        let (vtb, seek_ts, reported_fps) = {
            let stream = ictx.stream(video_idx).unwrap();
            let tb = stream.time_base();
            let rate = stream.avg_frame_rate();
            let reported = (rate.numerator() > 0 && rate.denominator() > 0)
                .then(|| Fps::new(rate.numerator() as u32, rate.denominator() as u32));
            let seek_ts =
                (start_secs * f64::from(tb.denominator()) / f64::from(tb.numerator())) as i64;
            ((tb.numerator(), tb.denominator()), seek_ts, reported)
        };
        let atb = audio_idx
            .map(|i| {
                let tb = ictx.stream(i).unwrap().time_base();
                (tb.numerator(), tb.denominator())
            })
            .unwrap_or((1, 1_000_000));

        if seek_ts > 0 {
            let _ = ictx.seek(seek_ts, ..=seek_ts);
        }

        // Second context for decoder params (Parameters borrows from ictx).
        let ictx2 = input(uri)?;
        let vdec = ffmpeg::codec::context::Context::from_parameters(
            ictx2.stream(video_idx).unwrap().parameters(),
        )?
        .decoder()
        .video()?;
        let adec = match audio_idx {
            Some(i) => Some(
                ffmpeg::codec::context::Context::from_parameters(
                    ictx2.stream(i).unwrap().parameters(),
                )?
                .decoder()
                .audio()?,
            ),
            None => None,
        };

        let (out_w, out_h) = (vdec.width().max(2), vdec.height().max(2));
        let scaler = SwsContext::get(
            vdec.format(), vdec.width(), vdec.height(),
            Pixel::RGBA, out_w, out_h, Flags::BILINEAR,
        )?;

        Ok(Self {
            ictx,
            video_idx,
            audio_idx,
            vdec,
            adec,
            scaler,
            out_w,
            out_h,
            vtb,
            atb,
            reported_fps,
            skip_until_pts: seek_ts,
            start_us: (start_secs * 1_000_000.0) as i64,
            pending: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Frame rate as reported by the container. May be wrong; the resample
    /// policy decides whether to believe it.
    pub fn reported_fps(&self) -> Option<Fps> {
        self.reported_fps
    }

    fn vpts_to_us(&self, pts: i64) -> i64 {
        pts * 1_000_000 * i64::from(self.vtb.0) / i64::from(self.vtb.1)
    }

    /// Next decoded item in media order, or None once the container is
    /// exhausted. EOF here is an event within the segment; the caller, not
    /// this decoder, knows where the scheduled boundary is.
    pub fn next_item(&mut self) -> Option<MediaItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            self.pull_packet();
        }
    }

    fn pull_packet(&mut self) {
        // Extract the stream index by value so the packet iterator's borrow
        // of the input context ends before the decoders run.
        let next = {
            let mut packets = self.ictx.packets();
            match packets.next() {
                Some(Ok((stream, packet))) => Some((stream.index(), packet)),
                Some(Err(_)) | None => None,
            }
        };
        let Some((idx, packet)) = next else {
            self.drain_decoders();
            self.exhausted = true;
            return;
        };

        if idx == self.video_idx {
            if self.vdec.send_packet(&packet).is_err() {
                return;
            }
            self.receive_video();
        } else if Some(idx) == self.audio_idx {
            if let Some(adec) = self.adec.as_mut() {
                if adec.send_packet(&packet).is_err() {
                    return;
                }
            }
            self.receive_audio();
        }
    }

    fn drain_decoders(&mut self) {
        let _ = self.vdec.send_eof();
        self.receive_video();
        if let Some(adec) = &mut self.adec {
            let _ = adec.send_eof();
        }
        self.receive_audio();
    }

    fn receive_video(&mut self) {
        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        while self.vdec.receive_frame(&mut decoded).is_ok() {
            let pts = decoded.pts().unwrap_or(0);
            // Burn-through: decode-only for pre-start frames after the seek.
            if self.skip_until_pts > 0 && pts < self.skip_until_pts {
                continue;
            }
            self.skip_until_pts = 0;

            let mut out = ffmpeg::util::frame::video::Video::empty();
            if self.scaler.run(&decoded, &mut out).is_err() {
                continue;
            }
            let stride = out.stride(0);
            let raw = out.data(0);
            let data: Vec<u8> = (0..self.out_h as usize)
                .flat_map(|row| {
                    let s = row * stride;
                    &raw[s..s + self.out_w as usize * 4]
                })
                .copied()
                .collect();
            self.pending.push_back(MediaItem::Video(VideoPayload {
                media_ts_us: self.vpts_to_us(pts),
                width: self.out_w,
                height: self.out_h,
                data,
            }));
        }
    }

    fn receive_audio(&mut self) {
        let (tb_num, tb_den) = self.atb;
        let start_us = self.start_us;
        let Some(adec) = self.adec.as_mut() else { return };
        let mut decoded = ffmpeg::util::frame::audio::Audio::empty();
        while adec.receive_frame(&mut decoded).is_ok() {
            let pts = decoded.pts().unwrap_or(0);
            let ts_us = pts * 1_000_000 * i64::from(tb_num) / i64::from(tb_den);
            if ts_us < start_us {
                continue; // pre-start audio from the keyframe-aligned seek
            }
            let samples = interleave_to_i16(&decoded);
            if samples.is_empty() {
                continue;
            }
            self.pending.push_back(MediaItem::Audio(AudioPayload {
                media_ts_us: ts_us,
                rate: decoded.rate(),
                samples,
            }));
        }
    }
}

/// Convert a decoded audio frame to interleaved stereo i16, whatever the
/// codec handed back. Mono is duplicated to both channels; extra channels
/// beyond the first two are ignored.
fn interleave_to_i16(frame: &ffmpeg::util::frame::audio::Audio) -> Vec<i16> {
    use ffmpeg::util::format::sample::{Sample, Type as SampleType};

    let n = frame.samples();
    let ch = (frame.channels().max(1)) as usize;
    let mut out = Vec::with_capacity(n * 2);

    match frame.format() {
        Sample::I16(SampleType::Packed) => {
            let data: &[i16] = frame.plane(0);
            for i in 0..n {
                let l = data[i * ch];
                let r = if ch > 1 { data[i * ch + 1] } else { l };
                out.push(l);
                out.push(r);
            }
        }
        Sample::I16(SampleType::Planar) => {
            let left: &[i16] = frame.plane(0);
            for i in 0..n {
                let l = left[i];
                let r = if ch > 1 { frame.plane::<i16>(1)[i] } else { l };
                out.push(l);
                out.push(r);
            }
        }
        Sample::F32(SampleType::Packed) => {
            let data: &[f32] = frame.plane(0);
            for i in 0..n {
                let l = f32_to_i16(data[i * ch]);
                let r = if ch > 1 { f32_to_i16(data[i * ch + 1]) } else { l };
                out.push(l);
                out.push(r);
            }
        }
        Sample::F32(SampleType::Planar) => {
            let left: &[f32] = frame.plane(0);
            for i in 0..n {
                let l = f32_to_i16(left[i]);
                let r = if ch > 1 { f32_to_i16(frame.plane::<f32>(1)[i]) } else { l };
                out.push(l);
                out.push(r);
            }
        }
        _ => {} // uncommon formats: skip the block rather than guess
    }
    out
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Measure the actual average frame rate from the first `samples` video
/// packet timestamps. Containers lie about fps often enough that the
/// resample policy wants a second opinion before thinning frames.
pub fn probe_measured_fps(uri: &str, samples: usize) -> Option<f64> {
    let mut ictx = input(uri).ok()?;
    let video_idx = ictx.streams().best(Type::Video)?.index();
    let (tb_num, tb_den) = {
        let tb = ictx.stream(video_idx).unwrap().time_base();
        (tb.numerator(), tb.denominator())
    };

    let mut ts: Vec<i64> = Vec::with_capacity(samples);
    for (stream, packet) in ictx.packets().flatten() {
        if stream.index() != video_idx {
            continue;
        }
        if let Some(dts) = packet.dts().or(packet.pts()) {
            ts.push(dts);
        }
        if ts.len() >= samples {
            break;
        }
    }
    if ts.len() < 8 {
        return None;
    }
    ts.sort_unstable();
    let span = (ts[ts.len() - 1] - ts[0]) as f64 * f64::from(tb_num) / f64::from(tb_den);
    if span <= 0.0 {
        return None;
    }
    Some((ts.len() - 1) as f64 / span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_samples_clamp_to_full_scale() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }
}
