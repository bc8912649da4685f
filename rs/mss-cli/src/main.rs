mod byte_source;
mod log;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use byte_source::ReqwestByteSource;
use clap::{Parser, Subcommand};
use log::LogArgs;
use mss::manifest::TrackKind;
use mss::seek::SeekFlags;
use mss::Session;
use url::Url;

#[derive(Parser)]
#[command(name = "mss", about = "Microsoft Smooth Streaming client demuxer")]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a manifest, demux every fragment, and report packet statistics.
    Play {
        /// The Smooth Streaming manifest URL, e.g. `https://example.com/stream.ism/Manifest`.
        url: Url,

        /// Seek to this many seconds into the stream before reading (VOD only).
        #[arg(long)]
        seek: Option<f64>,

        /// Directory to dump each active track's raw sample payloads into
        /// (`video.bin` / `audio.bin`). Omit to only print statistics.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Score how likely a URL and/or local file look like a Smooth
    /// Streaming manifest, per `Session::probe`.
    Probe {
        /// The candidate manifest URL.
        #[arg(long)]
        url: Option<Url>,

        /// A local file whose leading bytes are probed instead of fetching
        /// from `url`.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.log.init();

    match cli.command {
        Command::Play { url, seek, out } => play(url, seek, out).await,
        Command::Probe { url, file } => probe(url, file).await,
    }
}

async fn play(url: Url, seek: Option<f64>, out: Option<PathBuf>) -> anyhow::Result<()> {
    let byte_source = Arc::new(ReqwestByteSource::new()?);
    let mut session = Session::open(url, byte_source).await.context("failed to open session")?;

    tracing::info!(
        is_live = session.is_live(),
        duration_us = ?session.duration,
        streams = session.streams().len(),
        "session opened"
    );

    if let Some(seek_secs) = seek {
        let video_stream = session.streams().iter().find(|s| s.kind == TrackKind::Video).map(|s| s.stream_index);
        if let Some(stream_index) = video_stream {
            let target_us = (seek_secs * 1_000_000.0) as i64;
            session.seek(stream_index, target_us, SeekFlags::default())?;
            tracing::info!(seek_secs, "seeked");
        } else {
            tracing::warn!("no video stream to seek on");
        }
    }

    let mut writers = std::collections::HashMap::new();
    if let Some(dir) = &out {
        tokio::fs::create_dir_all(dir).await?;
        for stream in session.streams() {
            let name = match stream.kind {
                TrackKind::Video => "video.bin",
                TrackKind::Audio => "audio.bin",
                TrackKind::Text => "text.bin",
            };
            let file = tokio::fs::File::create(dir.join(name)).await?;
            writers.insert(stream.stream_index, file);
        }
    }

    let mut packet_count: u64 = 0;
    let mut byte_count: u64 = 0;
    loop {
        match session.read_packet().await {
            Ok(packet) => {
                packet_count += 1;
                byte_count += packet.payload.len() as u64;
                if let Some(writer) = writers.get_mut(&packet.stream_index) {
                    use tokio::io::AsyncWriteExt;
                    writer.write_all(&packet.payload).await?;
                }
            }
            Err(mss::Error::EndOfStream) => break,
            Err(err) => return Err(err.into()),
        }
    }

    session.close();
    tracing::info!(packet_count, byte_count, "playback finished");
    Ok(())
}

async fn probe(url: Option<Url>, file: Option<PathBuf>) -> anyhow::Result<()> {
    let buf = match file {
        Some(path) => tokio::fs::read(path).await?,
        None => Vec::new(),
    };
    let score = Session::probe(&buf, url.as_ref().map(|u| u.as_str()));
    println!("{score}");
    Ok(())
}
