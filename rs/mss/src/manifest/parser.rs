//! Drives a `quick-xml` event loop over a fully-buffered manifest document
//! and populates a [`Manifest`]. Mirrors the original libexpat SAX handlers:
//! a failing start-element handler cannot abort the parser mid-stream, so
//! errors are captured in [`ParseCtx`] and only surfaced once the whole
//! document has been consumed — and the *last* captured error wins, since a
//! later failing element overwrites whatever an earlier one stored.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::{Fragment, Manifest, Quality, QualityParams, Track, TrackKind};

pub struct ManifestParser;

struct ParseCtx {
    manifest: Manifest,
    error: Option<Error>,
    /// Running sum of prior fragment durations for the current (last
    /// opened) track, used to synthesize `start_ts` when `t` is absent.
    running_start_ts: u64,
}

impl ManifestParser {
    /// Parses a manifest document, resolving each track's URL template
    /// against `session_url` (a trailing `/manifest`, case-insensitive,
    /// stripped before joining the manifest-provided per-track `Url`).
    pub fn parse(xml: &[u8], session_url: &Url) -> Result<Manifest> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut ctx = ParseCtx {
            manifest: Manifest::empty(),
            error: None,
            running_start_ts: 0,
        };

        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => break,
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    handle_start(&mut ctx, e, session_url);
                }
                Ok(_) => {}
                Err(err) => {
                    // A malformed document is itself a manifest-invalid
                    // failure; keep the "last error wins" rule by letting a
                    // later XML error override an earlier semantic one too.
                    ctx.error = Some(err.into());
                }
            }
            buf.clear();
        }

        if let Some(err) = ctx.error {
            return Err(err);
        }

        // An empty/no-video-or-audio manifest is rejected by
        // `Session::open` (it checks the selected active streams, not the
        // raw track count), not here — `Duration` is already mandatory
        // above, so there is no further "unset manifest" case to guard.
        Ok(ctx.manifest)
    }
}

fn handle_start(ctx: &mut ParseCtx, e: &BytesStart, session_url: &Url) {
    let name = e.name();
    let local = name.as_ref();

    if local.eq_ignore_ascii_case(b"SmoothStreamingMedia") {
        if let Err(err) = parse_media(ctx, e) {
            ctx.error = Some(err);
        }
    } else if local.eq_ignore_ascii_case(b"StreamIndex") {
        match parse_index(e, session_url) {
            Ok(track) => {
                ctx.manifest.tracks.push(track);
                ctx.running_start_ts = 0;
            }
            Err(err) => ctx.error = Some(err),
        }
    } else if local.eq_ignore_ascii_case(b"QualityLevel") {
        let Some(track) = ctx.manifest.tracks.last_mut() else {
            ctx.error = Some(Error::manifest_invalid(
                "QualityLevel outside of a StreamIndex",
            ));
            return;
        };
        match parse_quality(e, track.kind) {
            Ok(q) => track.qualities.push(q),
            Err(err) => ctx.error = Some(err),
        }
    } else if local == b"c" {
        let Some(track) = ctx.manifest.tracks.last_mut() else {
            ctx.error = Some(Error::manifest_invalid("<c> outside of a StreamIndex"));
            return;
        };
        match parse_frag(e, &mut ctx.running_start_ts, track.fragments.len() as u64) {
            Ok(frag) => track.fragments.push(frag),
            Err(err) => ctx.error = Some(err),
        }
    }
    // Unknown elements are warnings, not failures.
}

fn attr_str(e: &BytesStart, name: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref().eq_ignore_ascii_case(name.as_bytes()) {
            let value = attr.unescape_value()?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn require_u64(e: &BytesStart, name: &str) -> Result<u64> {
    attr_str(e, name)?
        .ok_or_else(|| Error::manifest_invalid(format!("missing mandatory attribute {name}")))?
        .parse::<u64>()
        .map_err(Error::from)
}

fn optional_u64(e: &BytesStart, name: &str) -> Result<Option<u64>> {
    attr_str(e, name)?.map(|s| s.parse::<u64>().map_err(Error::from)).transpose()
}

fn optional_u32(e: &BytesStart, name: &str) -> Result<Option<u32>> {
    attr_str(e, name)?.map(|s| s.parse::<u32>().map_err(Error::from)).transpose()
}

fn require_u32(e: &BytesStart, name: &str) -> Result<u32> {
    attr_str(e, name)?
        .ok_or_else(|| Error::manifest_invalid(format!("missing mandatory attribute {name}")))?
        .parse::<u32>()
        .map_err(Error::from)
}

fn parse_media(ctx: &mut ParseCtx, e: &BytesStart) -> Result<()> {
    const KNOWN: &[&str] = &[
        "Duration",
        "MajorVersion",
        "MinorVersion",
        "TimeScale",
        "LookAheadCount",
        "DVRWindowLength",
        "IsLive",
    ];

    for attr in e.attributes() {
        let attr = attr?;
        let known = KNOWN.iter().any(|k| attr.key.as_ref().eq_ignore_ascii_case(k.as_bytes()));
        if !known {
            return Err(Error::manifest_invalid(format!(
                "unknown attribute on SmoothStreamingMedia: {}",
                String::from_utf8_lossy(attr.key.as_ref())
            )));
        }
    }

    ctx.manifest.duration = require_u64(e, "Duration")?;
    ctx.manifest.major = require_u32(e, "MajorVersion")?;
    ctx.manifest.minor = require_u32(e, "MinorVersion")?;
    if ctx.manifest.major != 2 || ctx.manifest.minor != 0 {
        tracing::warn!(
            major = ctx.manifest.major,
            minor = ctx.manifest.minor,
            "manifest: MajorVersion should be 2, MinorVersion should be 0"
        );
    }

    // "isLive" is matched by exact name, not case-insensitively, and its
    // value must be the exact string "true" — both quirks preserved from
    // the original parser.
    ctx.manifest.is_live = e
        .attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == b"isLive")
        .map(|a| a.unescape_value().map(|v| v == "true").unwrap_or(false))
        .unwrap_or(false);

    // TimeScale / LookAheadCount / DVRWindowLength: recognized, silently
    // ignored (server-side extensions out of scope per the Non-goals).
    Ok(())
}

fn parse_index(e: &BytesStart, session_url: &Url) -> Result<Track> {
    let mut kind = None;
    let mut url_suffix = None;
    let mut display_dims = (None, None);
    let mut max_dims = (None, None);
    let mut declared_chunks = 0;
    let mut index = 0usize;

    for attr in e.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        let value = attr.unescape_value()?;
        if key.eq_ignore_ascii_case(b"Type") {
            kind = Some(match value.to_ascii_lowercase().as_str() {
                "video" => TrackKind::Video,
                "audio" => TrackKind::Audio,
                "text" => TrackKind::Text,
                other => {
                    return Err(Error::manifest_invalid(format!(
                        "unknown StreamIndex Type: {other}"
                    )))
                }
            });
        } else if key.eq_ignore_ascii_case(b"Chunks") {
            declared_chunks = value.parse::<u64>()?;
        } else if key.eq_ignore_ascii_case(b"Url") {
            url_suffix = Some(value.into_owned());
        } else if key.eq_ignore_ascii_case(b"Index") {
            index = value.parse::<usize>()?;
        } else if key.eq_ignore_ascii_case(b"MaxWidth") {
            max_dims.0 = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"MaxHeight") {
            max_dims.1 = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"DisplayWidth") {
            display_dims.0 = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"DisplayHeight") {
            display_dims.1 = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"QualityLevels") {
            // Ignored: some servers report a bogus count here. Only the
            // QualityLevel elements actually encountered are trusted.
        } else if key.eq_ignore_ascii_case(b"Subtype")
            || key.eq_ignore_ascii_case(b"SubtypeEventControl")
            || key.eq_ignore_ascii_case(b"ParentStream")
            || key.eq_ignore_ascii_case(b"Name")
        {
            tracing::info!(attr = %String::from_utf8_lossy(key), value = %value, "StreamIndex attribute");
        } else {
            tracing::warn!(attr = %String::from_utf8_lossy(key), "unrecognized StreamIndex attribute");
        }
    }

    let kind = kind.ok_or_else(|| Error::manifest_invalid("StreamIndex missing Type"))?;
    let url_suffix = url_suffix.unwrap_or_default();
    let url_template = make_stream_url(session_url, &url_suffix);

    let display_dims = match display_dims {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    };
    let max_dims = match max_dims {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    };

    Ok(Track {
        kind,
        index,
        url_template,
        display_dims,
        max_dims,
        qualities: Vec::new(),
        declared_chunks,
        fragments: Vec::new(),
    })
}

/// Strips a trailing `/manifest` (case-insensitive, last 9 bytes) from the
/// session URL and appends `/` + the StreamIndex's `Url` attribute.
fn make_stream_url(session_url: &Url, suffix: &str) -> String {
    let base = session_url.as_str();
    let base = if base.len() >= 9 && base[base.len() - 9..].eq_ignore_ascii_case("/manifest") {
        &base[..base.len() - 9]
    } else {
        base
    };
    format!("{base}/{suffix}")
}

fn parse_quality(e: &BytesStart, kind: TrackKind) -> Result<Quality> {
    let mut bit_rate = None;
    let mut fourcc: Option<[u8; 4]> = None;
    let mut codec_private_hex = None;
    let mut index = 0u32;
    let mut wave_format_ex = false;

    let mut width = None;
    let mut height = None;
    let mut max_width = None;
    let mut max_height = None;
    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut bits_per_sample = 0u16;
    let mut packet_size = 0u32;
    let mut audio_tag = 0u32;

    for attr in e.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        let value = attr.unescape_value()?;
        if key.eq_ignore_ascii_case(b"Bitrate") {
            bit_rate = Some(value.parse::<u64>()?);
        } else if key.eq_ignore_ascii_case(b"FourCC") {
            fourcc = Some(fourcc_bytes(&value));
        } else if key.eq_ignore_ascii_case(b"CodecPrivateData") {
            codec_private_hex = Some(value.into_owned());
        } else if key.eq_ignore_ascii_case(b"WaveFormatEx") {
            wave_format_ex = true;
            codec_private_hex = Some(value.into_owned());
        } else if key.eq_ignore_ascii_case(b"Index") {
            index = value.parse::<u32>()?;
        } else if key.eq_ignore_ascii_case(b"MaxWidth") {
            max_width = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"MaxHeight") {
            max_height = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"Width") {
            width = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"Height") {
            height = Some(value.parse::<u32>()?);
        } else if key.eq_ignore_ascii_case(b"SamplingRate") {
            sample_rate = value.parse::<u32>()?;
        } else if key.eq_ignore_ascii_case(b"Channels") {
            channels = value.parse::<u16>()?;
        } else if key.eq_ignore_ascii_case(b"BitsPerSample") {
            bits_per_sample = value.parse::<u16>()?;
        } else if key.eq_ignore_ascii_case(b"PacketSize") {
            packet_size = value.parse::<u32>()?;
        } else if key.eq_ignore_ascii_case(b"AudioTag") {
            audio_tag = value.parse::<u32>()?;
        } else {
            tracing::warn!(attr = %String::from_utf8_lossy(key), "unrecognized QualityLevel attribute");
        }
    }

    let fourcc = if wave_format_ex {
        *b"wmap"
    } else {
        fourcc.ok_or_else(|| Error::manifest_invalid("QualityLevel missing FourCC"))?
    };
    let bit_rate = bit_rate.ok_or_else(|| Error::manifest_invalid("QualityLevel missing Bitrate"))?;

    if let Some(ref hex) = codec_private_hex {
        if hex.len() % 2 != 0 {
            return Err(Error::manifest_invalid("codec_private hex has odd length"));
        }
    }

    let params = match kind {
        TrackKind::Video => QualityParams::Video {
            width,
            height,
            max_width,
            max_height,
        },
        TrackKind::Audio => QualityParams::Audio {
            sample_rate,
            channels,
            bits_per_sample,
            packet_size,
            audio_tag,
            wave_format_ex,
        },
        TrackKind::Text => QualityParams::Text,
    };

    Ok(Quality {
        index,
        bit_rate,
        fourcc,
        codec_private_hex,
        params,
        output_stream_id: None,
    })
}

fn fourcc_bytes(s: &str) -> [u8; 4] {
    let lower = s.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = *bytes.get(i).unwrap_or(&0);
    }
    out
}

fn parse_frag(e: &BytesStart, running_start_ts: &mut u64, synth_index: u64) -> Result<Fragment> {
    let n = optional_u64(e, "n")?.unwrap_or(synth_index);
    let d = require_u64(e, "d")?;
    if d == 0 {
        return Err(Error::manifest_invalid("fragment duration must be nonzero"));
    }
    let t = optional_u64(e, "t")?.unwrap_or(*running_start_ts);

    *running_start_ts = t + d;

    Ok(Fragment {
        index: n,
        duration: d,
        start_ts: t,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://example.com/stream/manifest").unwrap()
    }

    const VOD_MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="6000000000">
  <StreamIndex Type="video" Chunks="3" Url="Video({bitrate},{start time}).mp4">
    <QualityLevel Bitrate="500000" FourCC="H264" MaxWidth="640" MaxHeight="360" CodecPrivateData="00000001"/>
    <c d="20000000"/>
    <c d="20000000"/>
    <c d="20000000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;

    #[test]
    fn parses_vod_manifest_with_synthesized_start_ts() {
        let manifest = ManifestParser::parse(VOD_MANIFEST.as_bytes(), &url()).unwrap();
        assert!(!manifest.is_live);
        assert_eq!(manifest.duration, 6_000_000_000);
        assert_eq!(manifest.tracks.len(), 1);

        let track = &manifest.tracks[0];
        assert_eq!(track.fragments.len(), 3);
        assert_eq!(track.fragments[0].start_ts, 0);
        assert_eq!(track.fragments[1].start_ts, 20_000_000);
        assert_eq!(track.fragments[2].start_ts, 40_000_000);
        assert_eq!(track.url_template, "http://example.com/stream/Video({bitrate},{start time}).mp4");

        let quality = &track.qualities[0];
        assert_eq!(quality.bit_rate, 500_000);
        assert_eq!(&quality.fourcc, b"h264");
    }

    #[test]
    fn synthesizes_running_start_ts_over_four_fragments() {
        let xml = r#"<?xml version="1.0"?>
<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="4000">
  <StreamIndex Type="video" Chunks="4" Url="v({bitrate},{start time})">
    <QualityLevel Bitrate="1" FourCC="H264" CodecPrivateData=""/>
    <c d="1000"/>
    <c d="1000"/>
    <c d="1000"/>
    <c d="1000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let manifest = ManifestParser::parse(xml.as_bytes(), &url()).unwrap();
        let starts: Vec<u64> = manifest.tracks[0].fragments.iter().map(|f| f.start_ts).collect();
        assert_eq!(starts, vec![0, 1000, 2000, 3000]);
    }

    #[test]
    fn unknown_smoothstreamingmedia_attribute_fails() {
        let xml = r#"<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="1" Bogus="1">
  <StreamIndex Type="video" Chunks="0" Url="v"/>
</SmoothStreamingMedia>"#;
        let err = ManifestParser::parse(xml.as_bytes(), &url()).unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid(_)));
    }

    #[test]
    fn ignores_qualitylevels_count_attribute() {
        let xml = r#"<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="1000">
  <StreamIndex Type="video" Chunks="1" Url="v" QualityLevels="99">
    <QualityLevel Bitrate="1" FourCC="H264" CodecPrivateData=""/>
    <c d="1000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let manifest = ManifestParser::parse(xml.as_bytes(), &url()).unwrap();
        assert_eq!(manifest.tracks[0].qualities.len(), 1);
    }

    #[test]
    fn is_live_requires_exact_attribute_name_and_value() {
        let xml = r#"<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="1000" isLive="true">
  <StreamIndex Type="video" Chunks="1" Url="v">
    <QualityLevel Bitrate="1" FourCC="H264" CodecPrivateData=""/>
    <c d="1000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let manifest = ManifestParser::parse(xml.as_bytes(), &url()).unwrap();
        assert!(manifest.is_live);
    }

    #[test]
    fn missing_major_or_minor_version_is_manifest_invalid() {
        let missing_major = r#"<SmoothStreamingMedia MinorVersion="0" Duration="1000">
  <StreamIndex Type="video" Chunks="1" Url="v">
    <QualityLevel Bitrate="1" FourCC="H264" CodecPrivateData=""/>
    <c d="1000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let err = ManifestParser::parse(missing_major.as_bytes(), &url()).unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid(_)));

        let missing_minor = r#"<SmoothStreamingMedia MajorVersion="2" Duration="1000">
  <StreamIndex Type="video" Chunks="1" Url="v">
    <QualityLevel Bitrate="1" FourCC="H264" CodecPrivateData=""/>
    <c d="1000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let err = ManifestParser::parse(missing_minor.as_bytes(), &url()).unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid(_)));
    }

    #[test]
    fn zero_duration_live_manifest_parses_successfully() {
        // `Duration="0"` is the conventional value on MSS live manifests,
        // not an "unset" sentinel — it must not be rejected.
        let xml = r#"<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="0" isLive="true">
  <StreamIndex Type="video" Chunks="1" Url="v">
    <QualityLevel Bitrate="1" FourCC="H264" CodecPrivateData=""/>
    <c d="1000"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let manifest = ManifestParser::parse(xml.as_bytes(), &url()).unwrap();
        assert!(manifest.is_live);
        assert_eq!(manifest.duration, 0);
    }
}
