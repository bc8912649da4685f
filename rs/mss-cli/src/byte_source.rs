//! The `reqwest`-backed `ByteSource` implementation. `mss` (the library)
//! only depends on the `ByteSource`/`ByteReader` trait pair, so swapping in
//! a different HTTP stack means writing a new module like this one, not
//! touching the demuxer.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, Bytes};
use mss::source::{ByteReader, ByteSource, Interrupt};
use mss::{Error, Result};
use reqwest::Client;
use url::Url;

pub struct ReqwestByteSource {
    client: Client,
}

impl ReqwestByteSource {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().user_agent("mss-cli/0.1").build()?;
        Ok(ReqwestByteSource { client })
    }
}

impl ByteSource for ReqwestByteSource {
    fn open<'a>(
        &'a self,
        url: &'a Url,
        interrupt: Interrupt,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ByteReader>>> + Send + 'a>> {
        Box::pin(async move {
            tracing::debug!(%url, "opening byte source");
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(Error::io)?
                .error_for_status()
                .map_err(Error::io)?;
            Ok(Box::new(ReqwestByteReader { response, leftover: Bytes::new(), interrupt })
                as Box<dyn ByteReader>)
        })
    }
}

struct ReqwestByteReader {
    response: reqwest::Response,
    leftover: Bytes,
    interrupt: Interrupt,
}

impl ByteReader for ReqwestByteReader {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            if self.leftover.is_empty() {
                match next_chunk(&mut self.response, &self.interrupt).await? {
                    Some(chunk) => self.leftover = chunk,
                    None => return Ok(0),
                }
            }

            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            Ok(n)
        })
    }
}

/// Polls for the next response chunk while honoring the interrupt flag on
/// 100 ms slices, the same granularity `FragmentSource`'s `AwaitReload` loop
/// uses (§5: "Any ongoing ByteSource read must itself honor the interrupt
/// callback").
async fn next_chunk(response: &mut reqwest::Response, interrupt: &Interrupt) -> Result<Option<Bytes>> {
    loop {
        tokio::select! {
            chunk = response.chunk() => return chunk.map_err(Error::io),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if interrupt.is_tripped() {
                    return Err(Error::Interrupted);
                }
            }
        }
    }
}
