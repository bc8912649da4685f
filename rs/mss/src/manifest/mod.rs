//! The manifest model: a parsed `SmoothStreamingMedia` document turned into
//! tracks, quality levels and fragment timelines.

mod parser;

pub use parser::ManifestParser;

/// Manifest time unit: 100 nanoseconds, matching the original PIFF/MSS
/// convention. Distinguished from `AV_TIME_BASE` microseconds used at the
/// [`crate::Session`] boundary.
pub type Ticks = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Text,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub is_live: bool,
    pub duration: Ticks,
    pub major: u32,
    pub minor: u32,
    pub tracks: Vec<Track>,
}

impl Manifest {
    pub fn empty() -> Self {
        Manifest {
            is_live: false,
            duration: 0,
            major: 2,
            minor: 0,
            tracks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub kind: TrackKind,
    pub index: usize,
    /// The session URL with a trailing `/manifest` stripped, joined with the
    /// manifest's `Url` attribute. Still carries the literal `{bitrate}` and
    /// `{start time}` placeholders.
    pub url_template: String,
    pub display_dims: Option<(u32, u32)>,
    pub max_dims: Option<(u32, u32)>,
    pub qualities: Vec<Quality>,
    /// Declared fragment count (`Chunks`); informational only — the
    /// authoritative count is `fragments.len()` once `<c>` elements are
    /// parsed, since live manifests grow this list on reload.
    pub declared_chunks: u64,
    pub fragments: Vec<Fragment>,
}

impl Track {
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

#[derive(Debug, Clone)]
pub struct Quality {
    pub index: u32,
    pub bit_rate: u64,
    /// Always lowercased 4-byte codec tag (`h264`, `avc1`, `wvc1`, `aacl`,
    /// `wmap`, ...).
    pub fourcc: [u8; 4],
    pub codec_private_hex: Option<String>,
    pub params: QualityParams,
    /// Assigned once the track is activated by [`crate::Session::open`].
    pub output_stream_id: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum QualityParams {
    Video {
        width: Option<u32>,
        height: Option<u32>,
        max_width: Option<u32>,
        max_height: Option<u32>,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
        packet_size: u32,
        audio_tag: u32,
        wave_format_ex: bool,
    },
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct Fragment {
    pub index: u64,
    pub duration: Ticks,
    pub start_ts: Ticks,
}
