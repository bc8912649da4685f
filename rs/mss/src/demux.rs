//! Wraps a [`FragmentSource`] in a buffered, non-seekable input and feeds it
//! through an incremental fMP4 atom reader to produce packets. The fMP4
//! reader itself (`mp4-atom`) is the external collaborator named by the
//! component design; `TrackDemuxer` is the in-scope integration glue that
//! decodes `Moov` once, then walks `Moof`/`Mdat` pairs per fragment.

use std::collections::VecDeque;
use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};
use mp4_atom::{Any, Atom, DecodeAtom, DecodeMaybe, Header, Mdat, Moof, Moov};

use crate::codec::{CodecInit, StreamParams};
use crate::error::{Error, Result};
use crate::source::FragmentSource;

/// `INITIAL_BUFFER_SIZE` from the original demuxer: the buffered-input
/// chunk size used to probe and read fragment bytes.
pub const INITIAL_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct Packet {
    pub dts: i64,
    pub pts: i64,
    pub keyframe: bool,
    pub payload: Bytes,
    pub stream_index: usize,
}

enum AtomEvent {
    /// A fully-decoded atom plus its total on-wire size (header + body),
    /// needed to resolve `trun` data offsets that are expressed relative to
    /// the start of the enclosing `moof`.
    Atom(Any, usize),
    /// The `mdat` payload (sample bytes only) plus the size of its own
    /// header, mirroring `Fmp4::extract`'s `header_size = size -
    /// mdat.data.len()`.
    Mdat(Bytes, usize),
}

/// Incremental atom reader: accumulates bytes until a full atom (or a full
/// `mdat` payload) is available, zero-copying the `mdat` body out of the
/// accumulation buffer.
struct AtomReader {
    buffer: BytesMut,
}

impl AtomReader {
    fn new() -> Self {
        AtomReader { buffer: BytesMut::new() }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next(&mut self) -> Result<Option<AtomEvent>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buffer[..]);
        let header = match Header::decode_maybe(&mut cursor)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let header_size = cursor.position() as usize;
        let Some(payload_size) = header.size else {
            return Err(Error::io(anyhow::anyhow!("indefinite atom size unsupported")));
        };
        let total_size = header_size + payload_size;
        if self.buffer.len() < total_size {
            return Ok(None);
        }

        let mut atom_bytes = self.buffer.split_to(total_size).freeze();
        atom_bytes.advance(header_size);
        let payload = atom_bytes;

        if header.kind == Mdat::KIND {
            Ok(Some(AtomEvent::Mdat(payload, header_size)))
        } else {
            let mut payload_cursor = Cursor::new(payload);
            let atom = Any::decode_atom(&header, &mut payload_cursor)?;
            Ok(Some(AtomEvent::Atom(atom, total_size)))
        }
    }
}

struct TrackState {
    timescale: u32,
    default_sample_duration: u32,
    default_sample_size: u32,
    default_sample_flags: u32,
}

pub struct TrackDemuxer {
    pub source: FragmentSource,
    atoms: AtomReader,
    moov: Option<Moov>,
    track_state: Option<TrackState>,
    params: Option<StreamParams>,
    output_stream_id: usize,
    pending: VecDeque<Packet>,
    exhausted: bool,
    /// Held between seeing `Moof` and its matching `Mdat`, since sample
    /// payloads can only be sliced out of the `mdat` body once both are in
    /// hand (mirrors `Fmp4::decode` holding `self.moof` across atoms).
    pending_moof: Option<Moof>,
    moof_size: usize,
}

impl TrackDemuxer {
    pub fn new(source: FragmentSource, output_stream_id: usize) -> Self {
        TrackDemuxer {
            source,
            atoms: AtomReader::new(),
            moov: None,
            track_state: None,
            params: None,
            output_stream_id,
            pending: VecDeque::new(),
            exhausted: false,
            pending_moof: None,
            moof_size: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.params.is_some()
    }

    pub fn params(&self) -> Option<&StreamParams> {
        self.params.as_ref()
    }

    /// Pulls bytes until `Moov` is decoded and `CodecInit` has produced
    /// decoder parameters for the active quality.
    pub async fn init(&mut self) -> Result<()> {
        let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
        while self.moov.is_none() {
            let n = self.source.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::io(anyhow::anyhow!("eof before moov")));
            }
            self.atoms.push(&buf[..n]);
            self.drain_init_atoms()?;
        }

        let quality = &self.source.track.qualities[self.source.current_quality];
        let timescale = self.track_state.as_ref().map(|t| t.timescale).unwrap_or(1);
        let params = CodecInit::init(quality, (1, timescale))?;
        self.params = Some(params);
        Ok(())
    }

    fn drain_init_atoms(&mut self) -> Result<()> {
        while let Some(event) = self.atoms.next()? {
            match event {
                AtomEvent::Atom(Any::Moov(moov), _) => {
                    if let Some(trak) = moov.trak.first() {
                        let timescale = trak.mdia.mdhd.timescale;
                        let default_sample_duration =
                            trak.mdia.minf.stbl.stts.entries.first().map(|e| e.sample_delta).unwrap_or(0);
                        let trex = moov
                            .mvex
                            .as_ref()
                            .and_then(|mvex| mvex.trex.iter().find(|trex| trex.track_id == trak.tkhd.track_id));
                        self.track_state = Some(TrackState {
                            timescale,
                            default_sample_duration,
                            default_sample_size: trex.map(|t| t.default_sample_size).unwrap_or(0),
                            default_sample_flags: trex.map(|t| t.default_sample_flags).unwrap_or(0),
                        });
                    }
                    self.moov = Some(moov);
                    return Ok(());
                }
                AtomEvent::Atom(..) | AtomEvent::Mdat(..) => {}
            }
        }
        Ok(())
    }

    /// Reads one packet from the current fragment. On an EOF that coincides
    /// with the FragmentSource itself being exhausted, returns
    /// [`Error::EndOfStream`]; a transient rollover EOF is swallowed and
    /// retried, matching §4.E.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        if self.exhausted {
            return Err(Error::EndOfStream);
        }

        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(packet);
            }

            let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
            match self.source.read(&mut buf).await {
                Ok(0) => continue,
                Ok(n) => {
                    self.atoms.push(&buf[..n]);
                    self.advance_fragment_atoms()?;
                }
                Err(Error::EndOfStream) => {
                    self.exhausted = true;
                    return Err(Error::EndOfStream);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn advance_fragment_atoms(&mut self) -> Result<()> {
        while let Some(event) = self.atoms.next()? {
            match event {
                AtomEvent::Atom(Any::Moof(moof), size) => {
                    if self.pending_moof.is_some() {
                        return Err(Error::io(anyhow::anyhow!("duplicate moof box")));
                    }
                    self.pending_moof = Some(moof);
                    self.moof_size = size;
                }
                AtomEvent::Mdat(payload, header_size) => {
                    let moof = self
                        .pending_moof
                        .take()
                        .ok_or_else(|| Error::io(anyhow::anyhow!("mdat without a preceding moof")))?;
                    self.expand_moof(&moof, payload, header_size)?;
                }
                AtomEvent::Atom(..) => {}
            }
        }
        Ok(())
    }

    /// Walks `tfhd`/`tfdt`/`trun` to expand one fragment's samples into
    /// packets, slicing each sample's payload out of `mdat` and mirroring
    /// `Fmp4::extract`'s data-offset resolution and keyframe bit-twiddling
    /// (`kSampleDependsOnNoOther` at bits 24-25 of the sample flags).
    fn expand_moof(&mut self, moof: &Moof, mdat: Bytes, mdat_header_size: usize) -> Result<()> {
        let default_duration = self.track_state.as_ref().map(|t| t.default_sample_duration).unwrap_or(0);
        let default_size = self.track_state.as_ref().map(|t| t.default_sample_size).unwrap_or(0);
        let default_flags = self.track_state.as_ref().map(|t| t.default_sample_flags).unwrap_or(0);

        for traf in &moof.traf {
            let tfhd = &traf.tfhd;
            let Some(tfdt) = traf.tfdt.as_ref() else { continue };

            let mut dts = tfdt.base_media_decode_time as i64;
            let mut offset = tfhd.base_data_offset.unwrap_or_default() as usize;

            for trun in &traf.trun {
                if let Some(data_offset) = trun.data_offset {
                    let base_offset = tfhd.base_data_offset.unwrap_or_default() as usize;
                    let data_offset: usize = data_offset
                        .try_into()
                        .map_err(|_| Error::io(anyhow::anyhow!("negative trun data_offset unsupported")))?;
                    if data_offset < self.moof_size {
                        return Err(Error::io(anyhow::anyhow!("invalid trun data_offset")));
                    }
                    offset = base_offset + data_offset - self.moof_size - mdat_header_size;
                }

                for entry in &trun.entries {
                    let duration = entry.duration.unwrap_or(tfhd.default_sample_duration.unwrap_or(default_duration)) as i64;
                    let size = entry.size.unwrap_or(tfhd.default_sample_size.unwrap_or(default_size)) as usize;
                    let flags = entry.flags.unwrap_or(tfhd.default_sample_flags.unwrap_or(default_flags));
                    let keyframe = (flags >> 24) & 0x3 == 0x2;
                    let cts = entry.cts.unwrap_or(0) as i64;

                    if offset + size > mdat.len() {
                        return Err(Error::io(anyhow::anyhow!("sample extends past mdat bounds")));
                    }
                    let payload = mdat.slice(offset..offset + size);
                    offset += size;

                    self.pending.push_back(Packet {
                        dts,
                        pts: dts + cts,
                        keyframe,
                        payload,
                        stream_index: self.output_stream_id,
                    });
                    dts += duration;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn atom_reader_returns_none_on_partial_header() {
        let mut reader = AtomReader::new();
        reader.push(&16u32.to_be_bytes());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn atom_reader_yields_free_atom_once_body_arrives() {
        let mut reader = AtomReader::new();
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_slice(b"free");
        reader.push(&buf);

        match reader.next().unwrap() {
            Some(AtomEvent::Atom(Any::Free(_), size)) => assert_eq!(size, 8),
            other => panic!("expected Free atom, got atom present: {}", other.is_some()),
        }
    }

    #[test]
    fn atom_reader_zero_copies_mdat_payload() {
        let mut reader = AtomReader::new();
        let mut buf = BytesMut::new();
        buf.put_u32(20);
        buf.put_slice(b"mdat");
        buf.put_slice(b"hello world!");
        reader.push(&buf);

        match reader.next().unwrap() {
            Some(AtomEvent::Mdat(data, header_size)) => {
                assert_eq!(&data[..], b"hello world!");
                assert_eq!(header_size, 8);
            }
            _ => panic!("expected Mdat"),
        }
    }

    #[test]
    fn keyframe_bit_matches_kSampleDependsOnNoOther() {
        // bits 24-25 of the sample flags word: 0b10 means the sample
        // depends on no other sample (a keyframe).
        let keyframe_flags: u32 = 0x02000000;
        let inter_flags: u32 = 0x01000000;
        assert_eq!((keyframe_flags >> 24) & 0x3, 0x2);
        assert_ne!((inter_flags >> 24) & 0x3, 0x2);
    }
}
