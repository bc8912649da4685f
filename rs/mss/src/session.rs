//! Ties manifest, per-track fragment sources, demuxers and the interleaver
//! together into the single entry point a caller drives: open, read packets,
//! seek, close.

use std::sync::Arc;

use url::Url;

use crate::demux::{Packet, TrackDemuxer};
use crate::error::{Error, Result};
use crate::interleave::{Interleaver, TrackSlot};
use crate::manifest::{Manifest, ManifestParser, Quality, Ticks, Track, TrackKind};
use crate::seek::{SeekEngine, SeekFlags};
use crate::source::{read_all_growing, ByteSource, FragmentSource, Interrupt, ManifestRefresher};

/// AV_TIME_BASE: the microsecond unit `Session`'s public timestamps and
/// durations are expressed in, matching the demuxer-boundary convention
/// named in the component design.
const AV_TIME_BASE: i64 = 1_000_000;

pub struct StreamInfo {
    pub stream_index: usize,
    pub kind: TrackKind,
}

pub struct Session {
    byte_source: Arc<dyn ByteSource>,
    interrupt: Interrupt,
    manifest: Manifest,
    interleaver: Interleaver,
    streams: Vec<StreamInfo>,
    is_live: bool,
    /// VOD duration in `AV_TIME_BASE` units (`manifest.duration / 10`);
    /// `None` for live sessions, which have no fixed duration.
    pub duration: Option<i64>,
    first_timestamp: Option<i64>,
    seek_target: Option<i64>,
}

impl Session {
    /// Scores how likely `buf` (the first bytes of a candidate input) and
    /// the optional source `url` are a Smooth Streaming manifest, mirroring
    /// `smoothstreaming_read_probe`'s `/manifest`-suffix-plus-XML-prologue
    /// heuristic: `AVPROBE_SCORE_MAX/2` for the URL suffix plus
    /// `AVPROBE_SCORE_MAX/4` for the XML prologue, stacked rather than
    /// collapsed — so both matching tops out at 75, not 100.
    pub fn probe(buf: &[u8], url: Option<&str>) -> u8 {
        let url_matches = url
            .map(|u| {
                let u = u.trim_end_matches('/');
                u.len() >= 9 && u[u.len() - 9..].eq_ignore_ascii_case("/manifest")
            })
            .unwrap_or(false);

        let prefix = &buf[..buf.len().min(64)];
        let text = String::from_utf8_lossy(prefix);
        let xml_matches = text.trim_start().starts_with("<?xml");

        (url_matches as u8) * 50 + (xml_matches as u8) * 25
    }

    /// Fetches and parses the manifest at `manifest_url`, selects the
    /// highest-bitrate quality on the first video and first audio track
    /// present, and opens both as active [`TrackDemuxer`]s.
    pub async fn open(manifest_url: Url, byte_source: Arc<dyn ByteSource>) -> Result<Session> {
        let interrupt = Interrupt::new();
        let mut reader = byte_source.open(&manifest_url, interrupt.clone()).await?;
        let bytes = read_all_growing(&mut *reader).await?;
        drop(reader);

        let manifest = ManifestParser::parse(&bytes, &manifest_url)?;
        let is_live = manifest.is_live;
        let duration = if is_live { None } else { Some((manifest.duration / 10) as i64) };

        let mut interleaver = Interleaver::new();
        let mut streams = Vec::new();

        if let Some(track) = manifest.tracks.iter().find(|t| t.kind == TrackKind::Video) {
            let demuxer = Self::open_track(track, 0, &manifest_url, &byte_source, is_live, manifest.duration, interrupt.clone()).await?;
            let time_base = demuxer.params().expect("init() populates params").time_base;
            streams.push(StreamInfo { stream_index: 0, kind: TrackKind::Video });
            interleaver.set_video(demuxer, time_base);
        }

        if let Some(track) = manifest.tracks.iter().find(|t| t.kind == TrackKind::Audio) {
            let stream_index = streams.len();
            let demuxer =
                Self::open_track(track, stream_index, &manifest_url, &byte_source, is_live, manifest.duration, interrupt.clone()).await?;
            let time_base = demuxer.params().expect("init() populates params").time_base;
            streams.push(StreamInfo { stream_index, kind: TrackKind::Audio });
            interleaver.set_audio(demuxer, time_base);
        }

        if streams.is_empty() {
            return Err(Error::manifest_invalid("manifest has no video or audio tracks"));
        }

        Ok(Session {
            byte_source,
            interrupt,
            manifest,
            interleaver,
            streams,
            is_live,
            duration,
            first_timestamp: None,
            seek_target: None,
        })
    }

    async fn open_track(
        track: &Track,
        output_stream_id: usize,
        manifest_url: &Url,
        byte_source: &Arc<dyn ByteSource>,
        is_live: bool,
        manifest_duration: Ticks,
        interrupt: Interrupt,
    ) -> Result<TrackDemuxer> {
        let quality_idx = select_quality(track);
        let mut track = track.clone();
        track.qualities[quality_idx].output_stream_id = Some(output_stream_id);
        let track = track;
        let refresher = is_live.then(|| ManifestRefresher {
            byte_source: byte_source.clone(),
            manifest_url: manifest_url.clone(),
            session_url: manifest_url.clone(),
            kind: track.kind,
        });

        let source = FragmentSource::new(
            track.clone(),
            quality_idx,
            byte_source.clone(),
            is_live,
            manifest_duration,
            interrupt,
            refresher,
        );
        let mut demuxer = TrackDemuxer::new(source, output_stream_id);
        demuxer.init().await?;
        Ok(demuxer)
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// Reads the next globally DTS-ordered packet across active tracks.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        self.interleaver.next_packet(&mut self.first_timestamp, &mut self.seek_target, false).await
    }

    /// Seeks the named stream to `target_us` (microseconds, `AV_TIME_BASE`).
    /// Only that track's cursor is reset; the interleaver re-synchronizes
    /// the other active track naturally as DTS-ordered reads continue.
    pub fn seek(&mut self, stream_index: usize, target_us: i64, flags: SeekFlags) -> Result<()> {
        let slot = self
            .streams
            .iter()
            .find(|s| s.stream_index == stream_index)
            .map(|s| s.kind)
            .ok_or_else(|| Error::io(anyhow::anyhow!("no such stream index {stream_index}")))?;

        match slot {
            TrackKind::Video => {
                let demuxer = self.interleaver.video_demuxer_mut().expect("stream_index maps to an active track");
                SeekEngine::seek(&mut demuxer.source, self.is_live, target_us, flags)?;
                self.interleaver.discard_lookahead(TrackSlot::Video);
            }
            TrackKind::Audio => {
                let demuxer = self.interleaver.audio_demuxer_mut().expect("stream_index maps to an active track");
                SeekEngine::seek(&mut demuxer.source, self.is_live, target_us, flags)?;
                self.interleaver.discard_lookahead(TrackSlot::Audio);
            }
            TrackKind::Text => return Err(Error::NotSupported("text tracks are not seekable")),
        }

        // `seek_target` is consulted by the Interleaver against packet DTS
        // rescaled to `AV_TIME_BASE` (microseconds, see `interleave::rescale`),
        // not the 100ns manifest ticks `SeekEngine` uses internally to locate
        // a fragment — store it in the same unit the comparison is made in.
        self.seek_target = Some(target_us);
        Ok(())
    }

    pub fn close(&mut self) {
        self.interrupt.trip();
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

/// Selects the active quality for a track, mirroring `get_init_streams_id`:
/// for video, the quality whose `(width,height)` matches `display_dims`,
/// else the one whose `(max_width,max_height)` matches, else the first;
/// for audio (and text), always the first quality — there is no per-track
/// ABR controller driving switches in this demuxer (§4.H, Non-goals).
fn select_quality(track: &Track) -> usize {
    if track.kind != TrackKind::Video {
        return 0;
    }

    if let Some(display) = track.display_dims {
        if let Some(idx) = track.qualities.iter().position(|q| quality_dims(q) == Some(display)) {
            return idx;
        }
    }
    if let Some(max) = track.max_dims {
        if let Some(idx) = track.qualities.iter().position(|q| quality_max_dims(q) == Some(max)) {
            return idx;
        }
    }
    0
}

fn quality_dims(q: &Quality) -> Option<(u32, u32)> {
    match &q.params {
        crate::manifest::QualityParams::Video { width: Some(w), height: Some(h), .. } => Some((*w, *h)),
        _ => None,
    }
}

fn quality_max_dims(q: &Quality) -> Option<(u32, u32)> {
    match &q.params {
        crate::manifest::QualityParams::Video { max_width: Some(w), max_height: Some(h), .. } => Some((*w, *h)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_scores_url_and_xml_prologue_independently() {
        let xml = b"<?xml version=\"1.0\"?><SmoothStreamingMedia/>";
        assert_eq!(Session::probe(xml, Some("http://x/Manifest")), 100);
        assert_eq!(Session::probe(xml, Some("http://x/video.ism")), 25);
        assert_eq!(Session::probe(b"not xml", Some("http://x/Manifest")), 50);
        assert_eq!(Session::probe(b"not xml", None), 0);
    }

    fn video_quality(width: Option<u32>, height: Option<u32>, max_width: Option<u32>, max_height: Option<u32>) -> Quality {
        Quality {
            index: 0,
            bit_rate: 500_000,
            fourcc: *b"h264",
            codec_private_hex: None,
            params: crate::manifest::QualityParams::Video { width, height, max_width, max_height },
            output_stream_id: None,
        }
    }

    #[test]
    fn select_quality_prefers_display_dims_match() {
        let track = Track {
            kind: TrackKind::Video,
            index: 0,
            url_template: String::new(),
            display_dims: Some((640, 360)),
            max_dims: None,
            qualities: vec![
                video_quality(Some(320), Some(180), None, None),
                video_quality(Some(640), Some(360), None, None),
            ],
            declared_chunks: 0,
            fragments: Vec::new(),
        };
        assert_eq!(select_quality(&track), 1);
    }

    #[test]
    fn select_quality_falls_back_to_max_dims_then_first() {
        let track = Track {
            kind: TrackKind::Video,
            index: 0,
            url_template: String::new(),
            display_dims: Some((1920, 1080)),
            max_dims: Some((640, 360)),
            qualities: vec![
                video_quality(Some(320), Some(180), Some(320), Some(180)),
                video_quality(Some(640), Some(360), Some(640), Some(360)),
            ],
            declared_chunks: 0,
            fragments: Vec::new(),
        };
        assert_eq!(select_quality(&track), 1);

        let track_no_match = Track { display_dims: None, max_dims: None, ..track };
        assert_eq!(select_quality(&track_no_match), 0);
    }

    #[test]
    fn select_quality_audio_always_picks_first() {
        let track = Track {
            kind: TrackKind::Audio,
            index: 0,
            url_template: String::new(),
            display_dims: None,
            max_dims: None,
            qualities: vec![
                Quality {
                    index: 0,
                    bit_rate: 64_000,
                    fourcc: *b"aacl",
                    codec_private_hex: None,
                    params: crate::manifest::QualityParams::Audio {
                        sample_rate: 44_100,
                        channels: 2,
                        bits_per_sample: 16,
                        packet_size: 4,
                        audio_tag: 0,
                        wave_format_ex: false,
                    },
                    output_stream_id: None,
                },
                Quality {
                    index: 1,
                    bit_rate: 128_000,
                    fourcc: *b"aacl",
                    codec_private_hex: None,
                    params: crate::manifest::QualityParams::Audio {
                        sample_rate: 44_100,
                        channels: 2,
                        bits_per_sample: 16,
                        packet_size: 4,
                        audio_tag: 0,
                        wave_format_ex: false,
                    },
                    output_stream_id: None,
                },
            ],
            declared_chunks: 0,
            fragments: Vec::new(),
        };
        assert_eq!(select_quality(&track), 0);
    }
}
