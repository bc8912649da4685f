//! The per-track lazy byte stream across consecutive fragments, with
//! live-reload. [`ByteSource`] is the external HTTP/byte-range collaborator
//! named (not specified) by the component design — `mss` only depends on
//! the trait, the same way `hang`'s HLS ingest only depends on `HlsFetcher`
//! and leaves the concrete `reqwest` client to the CLI binary.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::{ManifestParser, Manifest, Ticks, Track, TrackKind};
use crate::templater::UrlTemplater;

/// Cooperative cancellation flag, checked between 100 ms sleep slices and
/// honored by [`ByteSource`] implementations during reads.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait ByteReader: Send {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;
}

/// `{open, read, close}` capability set. `close` is implicit in `Drop` for
/// the returned reader, matching the original's `ffurl_close` on rollover.
pub trait ByteSource: Send + Sync {
    /// Opens `url` with the `seekable=0` hint, honoring `interrupt`.
    fn open<'a>(
        &'a self,
        url: &'a Url,
        interrupt: Interrupt,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ByteReader>>> + Send + 'a>>;
}

/// Re-parses the manifest on live reload and locates this source's track in
/// the freshly parsed model. Constructed by [`crate::Session::open`] with
/// the concrete transport and the kind/position used to select the track
/// originally.
pub struct ManifestRefresher {
    pub byte_source: Arc<dyn ByteSource>,
    pub manifest_url: Url,
    pub session_url: Url,
    pub kind: TrackKind,
}

impl ManifestRefresher {
    async fn refresh(&self, interrupt: &Interrupt) -> Result<Track> {
        let mut reader = self.byte_source.open(&self.manifest_url, interrupt.clone()).await?;
        let bytes = read_all_growing(&mut *reader).await?;
        let manifest: Manifest = ManifestParser::parse(&bytes, &self.session_url)?;
        manifest
            .tracks
            .into_iter()
            .find(|t| t.kind == self.kind)
            .ok_or_else(|| Error::manifest_invalid("track disappeared on manifest reload"))
    }
}

/// Reads the whole manifest by growing a buffer in 4 KiB increments until
/// the reader returns `0`, the original's read strategy before handing the
/// fully-buffered document to the XML parser in one pass.
pub async fn read_all_growing(reader: &mut dyn ByteReader) -> Result<Bytes> {
    const CHUNK: usize = 4096;
    let mut buf = Vec::with_capacity(CHUNK);
    loop {
        let start = buf.len();
        buf.resize(start + CHUNK, 0);
        let n = reader.read(&mut buf[start..]).await?;
        buf.truncate(start + n);
        if n == 0 {
            break;
        }
    }
    Ok(Bytes::from(buf))
}

pub struct FragmentSource {
    pub track: Track,
    pub current_quality: usize,
    current_fragment: i64,
    byte_source: Arc<dyn ByteSource>,
    reader: Option<Box<dyn ByteReader>>,
    last_load_time: Instant,
    is_live: bool,
    manifest_duration: Ticks,
    interrupt: Interrupt,
    refresher: Option<ManifestRefresher>,
}

impl FragmentSource {
    pub fn new(
        track: Track,
        current_quality: usize,
        byte_source: Arc<dyn ByteSource>,
        is_live: bool,
        manifest_duration: Ticks,
        interrupt: Interrupt,
        refresher: Option<ManifestRefresher>,
    ) -> Self {
        FragmentSource {
            track,
            current_quality,
            current_fragment: -1,
            byte_source,
            reader: None,
            last_load_time: Instant::now(),
            is_live,
            manifest_duration,
            interrupt,
            refresher,
        }
    }

    pub fn current_fragment_index(&self) -> i64 {
        self.current_fragment
    }

    pub fn set_current_fragment(&mut self, idx: i64) {
        self.current_fragment = idx;
    }

    fn fragment_url(&self, frag_idx: usize) -> Result<String> {
        let quality = &self.track.qualities[self.current_quality];
        let frag = &self.track.fragments[frag_idx];
        UrlTemplater::expand(&self.track.url_template, quality.bit_rate, frag.start_ts)
    }

    /// Closes any open reader without touching `current_fragment`, used by
    /// `SeekEngine` before it resets the cursor directly.
    pub fn close_reader(&mut self) {
        self.reader = None;
    }

    async fn advance(&mut self) -> Result<()> {
        self.current_fragment += 1;

        if !self.is_live && self.current_fragment as usize >= self.track.fragments.len() {
            return Err(Error::EndOfStream);
        }

        let mut reload_interval = if self.is_live && !self.track.fragments.is_empty() {
            let idx = (self.current_fragment as usize).min(self.track.fragments.len() - 1);
            Duration::from_nanos(self.track.fragments[idx].duration * 100)
        } else {
            Duration::from_nanos(self.manifest_duration * 100)
        };

        loop {
            if self.is_live && self.last_load_time.elapsed() >= reload_interval {
                self.reload_manifest().await?;
                reload_interval = Duration::from_nanos(self.manifest_duration * 500_000 / 100);
            }

            if (self.current_fragment as usize) < self.track.fragments.len() {
                break;
            }

            if !self.is_live || self.current_fragment as usize == self.track.fragments.len() {
                return Err(Error::EndOfStream);
            }

            loop {
                if self.interrupt.is_tripped() {
                    return Err(Error::Interrupted);
                }
                if self.last_load_time.elapsed() >= reload_interval {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let url_str = self.fragment_url(self.current_fragment as usize)?;
        let url = Url::parse(&url_str)?;
        let reader = self.byte_source.open(&url, self.interrupt.clone()).await?;
        self.reader = Some(reader);
        Ok(())
    }

    async fn reload_manifest(&mut self) -> Result<()> {
        let Some(refresher) = &self.refresher else {
            self.last_load_time = Instant::now();
            return Ok(());
        };
        let fresh = refresher.refresh(&self.interrupt).await?;
        self.track.fragments = fresh.fragments;
        self.track.declared_chunks = fresh.declared_chunks;
        self.last_load_time = Instant::now();
        Ok(())
    }

    /// Reads from the current fragment, rolling over to the next one (or
    /// awaiting a live reload) transparently on exhaustion.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.reader.is_none() {
                self.advance().await?;
            }
            let reader = self.reader.as_mut().expect("just opened above");
            match reader.read(buf).await {
                Ok(0) => {
                    self.reader = None;
                }
                Ok(n) => return Ok(n),
                Err(err) => {
                    self.reader = None;
                    return Err(err);
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }
}
