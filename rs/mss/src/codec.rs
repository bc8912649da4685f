//! Turns the hex codec-private blob and manifest metadata for the active
//! [`Quality`] into decoder-initialization parameters, once the inner fMP4
//! reader has surfaced its first elementary stream.
//!
//! The WAVEFORMATEX parser and the AVCC writer are named as external
//! utility collaborators in the component design; what's here is the
//! minimal amount needed to make `CodecInit` self-contained, not a general
//! codec-parsing library.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::manifest::{Quality, QualityParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    H264,
    Vc1,
    Aac,
    WmaPro,
    // A small slice of the MOV-audio fourcc table (`ff_codec_movaudio_tags`)
    // for fourccs that aren't the two cases the manifest overrides (`aacl`,
    // `wmap`). Not exhaustive — just the entries likely to show up in a
    // Smooth Streaming manifest in the wild.
    Mp3,
    AmrNb,
    AmrWb,
    Alac,
    Ac3,
    Eac3,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    Unspecified,
}

/// Decoder-initialization parameters for one active output stream,
/// synthesized from `(current Quality, inner stream time base)`.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub codec_id: CodecId,
    pub time_base: (u32, u32),
    pub extradata: Bytes,
    pub bit_rate: u64,

    // video
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pix_fmt_yuv420p: bool,

    // audio
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub block_align: u32,
    pub sample_fmt: SampleFormat,
    pub full_raw_parse: bool,
}

pub struct CodecInit;

impl CodecInit {
    pub fn init(quality: &Quality, inner_time_base: (u32, u32)) -> Result<StreamParams> {
        match &quality.params {
            QualityParams::Video { width, height, max_width, max_height } => {
                Self::init_video(quality, inner_time_base, *width, *height, *max_width, *max_height)
            }
            QualityParams::Audio { sample_rate, channels, bits_per_sample, packet_size, audio_tag, wave_format_ex } => {
                Self::init_audio(
                    quality,
                    inner_time_base,
                    *sample_rate,
                    *channels,
                    *bits_per_sample,
                    *packet_size,
                    *audio_tag,
                    *wave_format_ex,
                )
            }
            QualityParams::Text => Err(Error::manifest_invalid("text tracks have no codec parameters")),
        }
    }

    fn init_video(
        quality: &Quality,
        time_base: (u32, u32),
        width: Option<u32>,
        height: Option<u32>,
        max_width: Option<u32>,
        max_height: Option<u32>,
    ) -> Result<StreamParams> {
        let hex = quality.codec_private_hex.as_deref().unwrap_or("");
        let (codec_id, extradata, pix_fmt_yuv420p) = match &quality.fourcc {
            b"h264" | b"avc1" => {
                let raw = hex::decode(hex)?;
                let nal_starts = count_start_codes(&raw);
                tracing::debug!(nal_starts, "rewrapping H.264 codec_private into AVCC");
                (CodecId::H264, write_avcc(&raw)?, true)
            }
            b"wvc1" => (CodecId::Vc1, Bytes::from(hex::decode(hex)?), false),
            other => {
                tracing::warn!(fourcc = %String::from_utf8_lossy(other), "unrecognized video fourcc");
                (CodecId::Other, Bytes::from(hex::decode(hex)?), false)
            }
        };

        Ok(StreamParams {
            codec_id,
            time_base,
            extradata,
            bit_rate: quality.bit_rate,
            width: width.or(max_width),
            height: height.or(max_height),
            pix_fmt_yuv420p,
            sample_rate: 0,
            channels: 0,
            bits_per_sample: 0,
            block_align: 0,
            sample_fmt: SampleFormat::Unspecified,
            full_raw_parse: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn init_audio(
        quality: &Quality,
        time_base: (u32, u32),
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
        packet_size: u32,
        _audio_tag: u32,
        wave_format_ex: bool,
    ) -> Result<StreamParams> {
        let hex = quality.codec_private_hex.as_deref().unwrap_or("");

        if wave_format_ex {
            let raw = hex::decode(hex)?;
            let wfx = parse_waveformatex(&raw)?;
            return Ok(StreamParams {
                codec_id: CodecId::Other,
                time_base: (1, wfx.sample_rate),
                extradata: Bytes::from(raw),
                bit_rate: quality.bit_rate,
                width: None,
                height: None,
                pix_fmt_yuv420p: false,
                sample_rate: wfx.sample_rate,
                channels: wfx.channels,
                bits_per_sample: wfx.bits_per_sample,
                block_align: wfx.block_align,
                sample_fmt: SampleFormat::Unspecified,
                full_raw_parse: true,
            });
        }

        let codec_id = match &quality.fourcc {
            b"aacl" => CodecId::Aac,
            b"wmap" => CodecId::WmaPro,
            other => mov_audio_tag(other),
        };
        let sample_fmt = if bits_per_sample == 16 { SampleFormat::S16 } else { SampleFormat::Unspecified };

        Ok(StreamParams {
            codec_id,
            time_base,
            extradata: Bytes::from(hex::decode(hex)?),
            bit_rate: quality.bit_rate,
            width: None,
            height: None,
            pix_fmt_yuv420p: false,
            sample_rate,
            channels,
            bits_per_sample,
            block_align: packet_size,
            sample_fmt,
            full_raw_parse: false,
        })
    }
}

/// The fallback path for audio fourccs that aren't the two manifest-level
/// overrides (`aacl`/`wmap`), mirroring a lookup into `ff_codec_movaudio_tags`.
fn mov_audio_tag(fourcc: &[u8; 4]) -> CodecId {
    match fourcc {
        b".mp3" | b"mp3 " => CodecId::Mp3,
        b"samr" => CodecId::AmrNb,
        b"sawb" => CodecId::AmrWb,
        b"alac" => CodecId::Alac,
        b"ac-3" => CodecId::Ac3,
        b"ec-3" => CodecId::Eac3,
        _ => CodecId::Other,
    }
}

/// Counts non-overlapping `00 00 00 01` start-code prefixes, matching the
/// original's buffer-sizing heuristic for the rewrap.
fn count_start_codes(buf: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + 3 < buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 0 && buf[i + 3] == 1 {
            count += 1;
            i += 4;
        } else {
            i += 1;
        }
    }
    count
}

/// Finds the next Annex-B start code (3- or 4-byte) at or after `from`,
/// returning `(offset_of_code, code_len)`.
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 3 < buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

fn split_nalus(buf: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let Some((mut start, code_len)) = find_start_code(buf, 0) else {
        return nalus;
    };
    start += code_len;
    loop {
        match find_start_code(buf, start) {
            Some((next, code_len)) => {
                if next > start {
                    nalus.push(&buf[start..next]);
                }
                start = next + code_len;
            }
            None => {
                if start < buf.len() {
                    nalus.push(&buf[start..]);
                }
                break;
            }
        }
    }
    nalus
}

/// Rewraps an Annex-B H.264 codec-private blob into a length-prefixed AVCC
/// sample description (an `avcC` configuration record): SPS/PPS arrays
/// plus the profile/compatibility/level triplet read from the first SPS.
///
/// Already-AVCC-wrapped input (no Annex-B start code anywhere in the blob)
/// is passed through unchanged rather than rewrapped, so calling this twice
/// on its own output is idempotent.
fn write_avcc(annex_b: &[u8]) -> Result<Bytes> {
    if find_start_code(annex_b, 0).is_none() {
        return Ok(Bytes::copy_from_slice(annex_b));
    }

    let mut sps_list = Vec::new();
    let mut pps_list = Vec::new();
    for nalu in split_nalus(annex_b) {
        let Some(&header) = nalu.first() else { continue };
        match header & 0x1F {
            7 => sps_list.push(nalu),
            8 => pps_list.push(nalu),
            _ => {}
        }
    }

    let sps = sps_list
        .first()
        .ok_or_else(|| Error::manifest_invalid("h264 codec_private has no SPS"))?;
    if sps.len() < 4 {
        return Err(Error::manifest_invalid("h264 SPS too short"));
    }

    let mut out = Vec::with_capacity(annex_b.len() + 16);
    out.push(1); // configurationVersion
    out.push(sps[1]); // AVCProfileIndication
    out.push(sps[2]); // profile_compatibility
    out.push(sps[3]); // AVCLevelIndication
    out.push(0xFF); // reserved(6) + lengthSizeMinusOne(2) = 3 (4-byte lengths)
    out.push(0xE0 | (sps_list.len() as u8 & 0x1F));
    for sps in &sps_list {
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
    }
    out.push(pps_list.len() as u8);
    for pps in &pps_list {
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
    }

    Ok(Bytes::from(out))
}

pub struct WaveFormatEx {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub block_align: u32,
}

/// Parses the fixed 18-byte `WAVEFORMATEX` header (format tag, channels,
/// sample rate, avg bytes/sec, block align, bits per sample, extra size);
/// any trailing codec-specific bytes are ignored here since only the PCM
/// layout fields are needed downstream.
fn parse_waveformatex(buf: &[u8]) -> Result<WaveFormatEx> {
    if buf.len() < 16 {
        return Err(Error::manifest_invalid("WAVEFORMATEX blob too short"));
    }
    let channels = u16::from_le_bytes([buf[2], buf[3]]);
    let sample_rate = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let block_align = u16::from_le_bytes([buf[12], buf[13]]) as u32;
    let bits_per_sample = u16::from_le_bytes([buf[14], buf[15]]);
    Ok(WaveFormatEx { sample_rate, channels, bits_per_sample, block_align })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Quality;

    fn h264_quality(hex: &str) -> Quality {
        Quality {
            index: 0,
            bit_rate: 500_000,
            fourcc: *b"h264",
            codec_private_hex: Some(hex.to_string()),
            params: QualityParams::Video { width: Some(640), height: Some(360), max_width: None, max_height: None },
            output_stream_id: None,
        }
    }

    #[test]
    fn hex_decodes_to_expected_byte_count() {
        let raw = hex::decode("0001020304").unwrap();
        assert_eq!(raw.len(), 5);
    }

    #[test]
    fn avcc_rewrap_extracts_profile_and_level_from_sps() {
        // start code + SPS (profile=0x64, compat=0x00, level=0x1e) + start code + PPS
        let mut annex_b = vec![0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1e, 0xAA, 0xBB];
        annex_b.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        let hex = hex::encode(&annex_b);
        let q = h264_quality(&hex);
        let params = CodecInit::init(&q, (1, 90_000)).unwrap();
        assert_eq!(params.codec_id, CodecId::H264);
        assert_eq!(params.extradata[0], 1);
        assert_eq!(params.extradata[1], 0x64);
        assert_eq!(params.extradata[2], 0x00);
        assert_eq!(params.extradata[3], 0x1e);
        assert!(params.pix_fmt_yuv420p);
    }

    #[test]
    fn avcc_rewrap_is_idempotent_on_already_avcc_wrapped_input() {
        // Genuinely AVCC-wrapped bytes: no Annex-B start codes anywhere,
        // just a length-prefixed configuration record (as `write_avcc`
        // itself would have produced). Feeding this back through the
        // rewrap must be a byte-identical no-op.
        let mut annex_b = vec![0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1e, 0xAA, 0xBB];
        annex_b.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        let avcc = write_avcc(&annex_b).unwrap();

        let round_tripped = write_avcc(&avcc).unwrap();
        assert_eq!(round_tripped, avcc);
    }

    #[test]
    fn width_height_prefers_exact_over_max() {
        let mut q = h264_quality("00000001676400");
        q.params = QualityParams::Video { width: Some(320), height: Some(240), max_width: Some(640), max_height: Some(480) };
        let params = CodecInit::init(&q, (1, 1)).unwrap();
        assert_eq!(params.width, Some(320));
        assert_eq!(params.height, Some(240));
    }

    #[test]
    fn falls_back_to_max_dims_when_exact_missing() {
        let mut q = h264_quality("00000001676400");
        q.params = QualityParams::Video { width: None, height: None, max_width: Some(640), max_height: Some(480) };
        let params = CodecInit::init(&q, (1, 1)).unwrap();
        assert_eq!(params.width, Some(640));
        assert_eq!(params.height, Some(480));
    }

    #[test]
    fn aacl_fourcc_maps_to_aac() {
        let q = Quality {
            index: 0,
            bit_rate: 128_000,
            fourcc: *b"aacl",
            codec_private_hex: Some("1210".to_string()),
            params: QualityParams::Audio {
                sample_rate: 44_100,
                channels: 2,
                bits_per_sample: 16,
                packet_size: 4,
                audio_tag: 0,
                wave_format_ex: false,
            },
            output_stream_id: None,
        };
        let params = CodecInit::init(&q, (1, 44_100)).unwrap();
        assert_eq!(params.codec_id, CodecId::Aac);
        assert_eq!(params.sample_fmt, SampleFormat::S16);
    }

    #[test]
    fn unrecognized_audio_fourcc_consults_mov_audio_table() {
        let mut q = Quality {
            index: 0,
            bit_rate: 64_000,
            fourcc: *b"ec-3",
            codec_private_hex: Some("".to_string()),
            params: QualityParams::Audio {
                sample_rate: 48_000,
                channels: 6,
                bits_per_sample: 16,
                packet_size: 0,
                audio_tag: 0,
                wave_format_ex: false,
            },
            output_stream_id: None,
        };
        let params = CodecInit::init(&q, (1, 48_000)).unwrap();
        assert_eq!(params.codec_id, CodecId::Eac3);

        q.fourcc = *b"zzzz";
        let params = CodecInit::init(&q, (1, 48_000)).unwrap();
        assert_eq!(params.codec_id, CodecId::Other);
    }
}
