//! Reads one packet ahead per active track and emits a globally
//! DTS-ordered stream. Ties are broken video-first (undocumented in the
//! original source; adopted here for determinism per the design notes).

use crate::demux::{Packet, TrackDemuxer};
use crate::error::{Error, Result};

/// A 64-bit rational timestamp, compared by cross-multiplication so mixed
/// audio/video time bases never collapse onto one fixed-point base.
#[derive(Debug, Clone, Copy)]
pub struct RationalTime {
    pub ts: i64,
    pub num: u32,
    pub den: u32,
}

impl RationalTime {
    pub fn new(ts: i64, num: u32, den: u32) -> Self {
        RationalTime { ts, num, den }
    }

    /// `self.ts * self.num/self.den` compared against `other`'s, via
    /// cross-multiplied 128-bit arithmetic with saturation.
    pub fn compare(&self, other: &RationalTime) -> std::cmp::Ordering {
        let lhs = (self.ts as i128)
            .saturating_mul(self.num as i128)
            .saturating_mul(other.den as i128);
        let rhs = (other.ts as i128)
            .saturating_mul(other.num as i128)
            .saturating_mul(self.den as i128);
        lhs.cmp(&rhs)
    }
}

pub enum TrackSlot {
    Video,
    Audio,
}

struct ActiveTrack {
    demuxer: TrackDemuxer,
    /// The inner stream's `start_time`, captured from the first packet read
    /// and subtracted independently of the other track — preserved from the
    /// source's per-stream `NOPTS` guard.
    start_time: Option<i64>,
    time_base: (u32, u32),
    lookahead: Option<Packet>,
    done: bool,
}

pub struct Interleaver {
    video: Option<ActiveTrack>,
    audio: Option<ActiveTrack>,
}

impl Interleaver {
    pub fn new() -> Self {
        Interleaver { video: None, audio: None }
    }

    pub fn set_video(&mut self, demuxer: TrackDemuxer, time_base: (u32, u32)) {
        self.video = Some(ActiveTrack { demuxer, start_time: None, time_base, lookahead: None, done: false });
    }

    pub fn set_audio(&mut self, demuxer: TrackDemuxer, time_base: (u32, u32)) {
        self.audio = Some(ActiveTrack { demuxer, start_time: None, time_base, lookahead: None, done: false });
    }

    pub fn video_demuxer_mut(&mut self) -> Option<&mut TrackDemuxer> {
        self.video.as_mut().map(|t| &mut t.demuxer)
    }

    pub fn audio_demuxer_mut(&mut self) -> Option<&mut TrackDemuxer> {
        self.audio.as_mut().map(|t| &mut t.demuxer)
    }

    /// Drops a track's lookahead packet and marks it not-yet-exhausted,
    /// used by `SeekEngine` right after it resets the track's `FragmentSource`.
    pub fn discard_lookahead(&mut self, slot: TrackSlot) {
        let track = match slot {
            TrackSlot::Video => self.video.as_mut(),
            TrackSlot::Audio => self.audio.as_mut(),
        };
        if let Some(track) = track {
            track.lookahead = None;
            track.done = false;
        }
    }

    /// Fills `track`'s lookahead slot if empty, honoring an active seek
    /// target: packets with `dts` below the target are discarded until a
    /// keyframe (or `seek_any`) is seen, and a packet with unknown DTS
    /// clears the seek target immediately.
    async fn fill(
        track: &mut ActiveTrack,
        first_timestamp: &mut Option<i64>,
        seek_target: &mut Option<i64>,
        seek_any: bool,
    ) -> Result<()> {
        if track.lookahead.is_some() || track.done {
            return Ok(());
        }

        loop {
            match track.demuxer.read_packet().await {
                Ok(packet) => {
                    if first_timestamp.is_none() {
                        *first_timestamp = Some(packet.dts);
                    }
                    if track.start_time.is_none() {
                        track.start_time = Some(packet.dts);
                    }

                    let Some(target) = *seek_target else {
                        track.lookahead = Some(packet);
                        return Ok(());
                    };

                    let rescaled = rescale(packet.dts, track.time_base);
                    if rescaled >= target && (packet.keyframe || seek_any) {
                        *seek_target = None;
                        track.lookahead = Some(packet);
                        return Ok(());
                    }
                    // below target: keep discarding
                }
                Err(Error::EndOfStream) => {
                    track.done = true;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Selects the lookahead packet with the smallest adjusted DTS,
    /// preferring video on ties, rewrites its `stream_index`, and clears
    /// the slot. Returns [`Error::EndOfStream`] once both tracks are done.
    pub async fn next_packet(
        &mut self,
        first_timestamp: &mut Option<i64>,
        seek_target: &mut Option<i64>,
        seek_any: bool,
    ) -> Result<Packet> {
        if let Some(track) = self.video.as_mut() {
            Self::fill(track, first_timestamp, seek_target, seek_any).await?;
        }
        if let Some(track) = self.audio.as_mut() {
            Self::fill(track, first_timestamp, seek_target, seek_any).await?;
        }

        let video_adj = self.video.as_ref().and_then(|t| adjusted(t));
        let audio_adj = self.audio.as_ref().and_then(|t| adjusted(t));

        let pick_video = match (video_adj, audio_adj) {
            (Some(v), Some(a)) => v.compare(&a) != std::cmp::Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return Err(Error::EndOfStream),
        };

        let track = if pick_video { self.video.as_mut().unwrap() } else { self.audio.as_mut().unwrap() };
        Ok(track.lookahead.take().expect("adjusted() implies lookahead is Some"))
    }
}

fn adjusted(track: &ActiveTrack) -> Option<RationalTime> {
    let packet = track.lookahead.as_ref()?;
    let dts = match track.start_time {
        Some(start) => packet.dts - start,
        None => packet.dts,
    };
    Some(RationalTime::new(dts, track.time_base.0, track.time_base.1))
}

fn rescale(dts: i64, time_base: (u32, u32)) -> i64 {
    // AV_TIME_BASE is microseconds (1_000_000 per second).
    const AV_TIME_BASE: i64 = 1_000_000;
    if time_base.1 == 0 {
        return dts;
    }
    (dts as i128 * AV_TIME_BASE as i128 * time_base.0 as i128 / time_base.1 as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_compare_handles_mixed_time_bases() {
        // 1 second at 90kHz vs. 1 second at 48kHz: equal real time.
        let video = RationalTime::new(90_000, 1, 90_000);
        let audio = RationalTime::new(48_000, 1, 48_000);
        assert_eq!(video.compare(&audio), std::cmp::Ordering::Equal);
    }

    #[test]
    fn rational_compare_orders_by_real_time_not_raw_ts() {
        // 50_000 ticks at 90kHz (~0.556s) is less than 48_000 at 48kHz (1s),
        // even though the raw integers alone would suggest otherwise.
        let video = RationalTime::new(50_000, 1, 90_000);
        let audio = RationalTime::new(48_000, 1, 48_000);
        assert_eq!(video.compare(&audio), std::cmp::Ordering::Less);
    }
}
