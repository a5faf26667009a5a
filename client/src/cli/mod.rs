//! Command line front end: argument parsing and dispatch to the transfer
//! components.

mod progress;

pub use progress::BarSink;

use crate::engine::{EngineConfig, PeerEngine};
use crate::fetcher::{DEFAULT_CHUNK_SIZE, FetchOptions, Fetcher, RangeFallback};
use crate::resolver::{
    CommandResolver, MediaResolver, PlaylistError, ResolveError, download_playlist,
};
use crate::source::{
    FALLBACK_FILENAME, Source, SourceError, drive_download_url, drive_file_id, filename_from_url,
    is_playlist,
};
use crate::swarm::{DriverOptions, SwarmDriver};
use crate::upload::{HttpPutUploader, UploadConfig, UploadError, Uploader};
use clap::{Parser, Subcommand};
use omni_core::{DescriptorSource, TransferError, TransferResult};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Fetch files over HTTP, BitTorrent, Drive links and video pages", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub upload: UploadArgs,

    /// Do not draw a progress bar
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Detect the kind of source and download it
    Get {
        source: String,

        /// Output file (direct, drive) or directory (torrent, video)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        swarm: SwarmArgs,
    },

    /// Download a URL, resuming a partial file if present
    Fetch {
        url: Url,

        /// Output file; defaults to the name in the URL
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Bytes written between progress updates
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Fail instead of restarting when the server ignores the range
        #[arg(long)]
        no_restart: bool,
    },

    /// Download a torrent from a magnet URI, a .torrent file or its URL
    Torrent {
        source: String,

        /// Directory the torrent's folder is created in
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Interval between status polls, in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        #[command(flatten)]
        swarm: SwarmArgs,
    },

    /// Download a public Google Drive file
    Drive {
        link: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Download a video, or a whole playlist, through an external extractor
    Video {
        url: Url,

        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// yt-dlp compatible program
        #[arg(long, default_value = "yt-dlp")]
        extractor: String,

        /// Treat the URL as a playlist: save every video as
        /// `<playlist title>/NN_<name>`, skipping the ones that fail
        #[arg(long)]
        playlist: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SwarmArgs {
    /// Peer to dial directly (repeatable)
    #[arg(long = "peer", value_name = "IP:PORT")]
    pub peers: Vec<SocketAddrV4>,

    /// Do not use the DHT
    #[arg(long)]
    pub no_dht: bool,

    /// Maximum simultaneous peer connections
    #[arg(long, default_value_t = 50)]
    pub max_peers: usize,

    /// Port announced to trackers
    #[arg(long, default_value_t = 6881)]
    pub port: u16,
}

impl SwarmArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            listen_port: self.port,
            enable_dht: !self.no_dht,
            max_peers: self.max_peers,
            initial_peers: self.peers.clone(),
            ..EngineConfig::default()
        }
    }
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct UploadArgs {
    /// Upload the result once the download finishes
    #[arg(long, global = true)]
    pub upload: bool,

    /// Base URL files are PUT below
    #[arg(long, global = true, env = "OMNIFETCH_UPLOAD_ENDPOINT")]
    pub upload_endpoint: Option<Url>,

    #[arg(long, global = true, env = "OMNIFETCH_UPLOAD_USER")]
    pub upload_user: Option<String>,

    #[arg(long, global = true, env = "OMNIFETCH_UPLOAD_PASSWORD", hide_env_values = true)]
    pub upload_password: Option<String>,
}

impl UploadArgs {
    /// The upload target, or `None` when uploading was not asked for.
    pub fn config(&self) -> Result<Option<UploadConfig>, CliError> {
        if !self.upload {
            return Ok(None);
        }
        let endpoint = self
            .upload_endpoint
            .clone()
            .ok_or(CliError::MissingUploadSetting("--upload-endpoint"))?;
        let username = self
            .upload_user
            .clone()
            .ok_or(CliError::MissingUploadSetting("--upload-user"))?;
        let password = self
            .upload_password
            .clone()
            .ok_or(CliError::MissingUploadSetting("--upload-password"))?;
        Ok(Some(UploadConfig {
            endpoint,
            username,
            password,
        }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("uploading needs {0}")]
    MissingUploadSetting(&'static str),
}

/// Runs one command to completion, then uploads the result if asked to.
pub async fn run(args: Args, cancel: &CancellationToken) -> Result<(), CliError> {
    // Upload flags are validated before any transfer starts.
    let upload = args.upload.config()?;
    let quiet = args.quiet;

    let result = match args.command {
        Command::Get {
            source,
            output,
            swarm,
        } => get(&source, output, &swarm, quiet, cancel).await?,
        Command::Fetch {
            url,
            output,
            chunk_size,
            no_restart,
        } => {
            let options = FetchOptions {
                chunk_size,
                range_fallback: if no_restart { RangeFallback::Fail } else { RangeFallback::Restart },
                ..FetchOptions::default()
            };
            let output = output.unwrap_or_else(|| default_filename(&url));
            fetch(&Fetcher::with_options(options)?, &url, &output, quiet, cancel).await?
        }
        Command::Torrent {
            source,
            output,
            poll_ms,
            swarm,
        } => {
            let source = match Source::classify(&source)? {
                s @ (Source::Magnet(_) | Source::TorrentFile(_) | Source::TorrentUrl(_)) => s,
                _ => {
                    return Err(TransferError::InvalidInput(format!(
                        "{source} is not a magnet URI or torrent"
                    ))
                    .into());
                }
            };
            torrent(source, &output, Duration::from_millis(poll_ms), &swarm, quiet, cancel).await?
        }
        Command::Drive { link, output } => drive(&link, &output, quiet, cancel).await?,
        Command::Video {
            url,
            output,
            extractor,
            playlist: true,
        } => playlist(&CommandResolver::yt_dlp(extractor), &url, &output, quiet, cancel).await?,
        Command::Video {
            url,
            output,
            extractor,
            playlist: false,
        } => {
            let resolver = CommandResolver::yt_dlp(extractor);
            video(&resolver, &url, &output, quiet, cancel).await?
        }
    };

    println!(
        "Saved {} ({}) in {:.1}s",
        result.path.display(),
        indicatif::HumanBytes(result.total_bytes),
        result.elapsed.as_secs_f64()
    );

    if let Some(config) = upload {
        let uploader = HttpPutUploader::new(config)?;
        for url in uploader.upload(&result.path).await? {
            println!("Uploaded: {url}");
        }
    }
    Ok(())
}

async fn get(
    input: &str,
    output: Option<PathBuf>,
    swarm: &SwarmArgs,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<TransferResult, CliError> {
    let source = Source::classify(input)?;
    tracing::debug!(?source, "classified input");
    let dir = || output.clone().unwrap_or_else(|| PathBuf::from("."));
    Ok(match source {
        Source::Direct(url) => {
            let output = output.clone().unwrap_or_else(|| default_filename(&url));
            fetch(&Fetcher::new()?, &url, &output, quiet, cancel).await?
        }
        s @ (Source::Magnet(_) | Source::TorrentFile(_) | Source::TorrentUrl(_)) => {
            torrent(s, &dir(), DriverOptions::default().poll_interval, swarm, quiet, cancel).await?
        }
        Source::Drive(url) => {
            let output = match output.clone() {
                Some(output) => output,
                None => PathBuf::from(drive_file_id(url.as_str())?),
            };
            drive(url.as_str(), &output, quiet, cancel).await?
        }
        Source::Video(url) if is_playlist(&url) => {
            playlist(&CommandResolver::default(), &url, &dir(), quiet, cancel).await?
        }
        Source::Video(url) => video(&CommandResolver::default(), &url, &dir(), quiet, cancel).await?,
    })
}

fn default_filename(url: &Url) -> PathBuf {
    PathBuf::from(filename_from_url(url).unwrap_or_else(|| FALLBACK_FILENAME.to_string()))
}

async fn fetch(
    fetcher: &Fetcher,
    url: &Url,
    output: &Path,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<TransferResult, TransferError> {
    let label = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut bar = BarSink::new(&label, quiet);
    let chunk_size = fetcher.options().chunk_size;
    let outcome = fetcher
        .fetch(url.as_str(), output, chunk_size, &mut bar, cancel)
        .await;
    finish(&bar, &outcome);
    outcome
}

async fn torrent(
    source: Source,
    dir: &Path,
    poll_interval: Duration,
    swarm: &SwarmArgs,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<TransferResult, TransferError> {
    let driver = SwarmDriver::with_options(
        PeerEngine::new(swarm.engine_config()),
        DriverOptions { poll_interval },
    );
    let mut bar = BarSink::new("torrent", quiet);
    let outcome = match source {
        Source::Magnet(uri) => driver.drive_from_magnet(&uri, dir, &mut bar, cancel).await,
        Source::TorrentFile(path) => {
            driver
                .drive_from_descriptor(&DescriptorSource::Path(path), dir, &mut bar, cancel)
                .await
        }
        Source::TorrentUrl(url) => {
            let descriptor = dir.join(default_filename(&url));
            fetch(&Fetcher::new()?, &url, &descriptor, true, cancel).await?;
            driver
                .drive_from_descriptor(&DescriptorSource::Path(descriptor), dir, &mut bar, cancel)
                .await
        }
        other => Err(TransferError::InvalidInput(format!("{other:?} is not a torrent"))),
    };
    finish(&bar, &outcome);
    outcome
}

async fn drive(
    link: &str,
    output: &Path,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<TransferResult, CliError> {
    let url = drive_download_url(&drive_file_id(link)?)?;
    Ok(fetch(&Fetcher::new()?, &url, output, quiet, cancel).await?)
}

async fn video<R: MediaResolver>(
    resolver: &R,
    page: &Url,
    dir: &Path,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<TransferResult, CliError> {
    let media = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
        media = resolver.resolve(page) => media?,
    };
    tracing::info!(file = %media.filename, "resolved media stream");
    let output = dir.join(&media.filename);
    Ok(fetch(&Fetcher::new()?, &media.url, &output, quiet, cancel).await?)
}

async fn playlist<R: MediaResolver>(
    resolver: &R,
    page: &Url,
    dir: &Path,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<TransferResult, CliError> {
    let started = Instant::now();
    let mut bar = BarSink::new("playlist", quiet);
    let outcome = download_playlist(resolver, &Fetcher::new()?, page, dir, &mut bar, cancel).await;
    match &outcome {
        Ok(_) => bar.finish(),
        Err(_) => bar.abandon(),
    }
    let report = outcome?;
    if !report.skipped.is_empty() {
        eprintln!("Skipped {} video(s):", report.skipped.len());
        for skipped in &report.skipped {
            eprintln!("  {:02} {}: {}", skipped.position, skipped.title, skipped.reason);
        }
    }
    Ok(TransferResult {
        total_bytes: report.total_bytes(),
        path: report.dir,
        elapsed: started.elapsed(),
    })
}

fn finish(bar: &BarSink, outcome: &Result<TransferResult, TransferError>) {
    match outcome {
        Ok(_) => bar.finish(),
        Err(_) => bar.abandon(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let args = Args::try_parse_from([
            "omnifetch",
            "fetch",
            "https://example.com/a.iso",
            "-o",
            "out.iso",
            "--chunk-size",
            "4096",
            "--no-restart",
        ])
        .unwrap();
        match args.command {
            Command::Fetch {
                url,
                output,
                chunk_size,
                no_restart,
            } => {
                assert_eq!(url.as_str(), "https://example.com/a.iso");
                assert_eq!(output, Some(PathBuf::from("out.iso")));
                assert_eq!(chunk_size, 4096);
                assert!(no_restart);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_torrent_with_peers() {
        let args = Args::try_parse_from([
            "omnifetch",
            "torrent",
            "magnet:?xt=urn:btih:abc",
            "--peer",
            "10.0.0.2:6881",
            "--peer",
            "10.0.0.3:6881",
            "--no-dht",
            "--poll-ms",
            "250",
        ])
        .unwrap();
        let Command::Torrent { poll_ms, swarm, output, .. } = args.command else {
            panic!("expected torrent");
        };
        assert_eq!(poll_ms, 250);
        assert_eq!(output, PathBuf::from("."));
        let config = swarm.engine_config();
        assert_eq!(config.initial_peers.len(), 2);
        assert!(!config.enable_dht);
    }

    #[test]
    fn test_upload_settings_are_required_when_uploading() {
        let args = Args::try_parse_from([
            "omnifetch",
            "drive",
            "https://drive.google.com/file/d/x/view",
            "-o",
            "x.bin",
            "--upload",
            "--upload-endpoint",
            "https://dav.example/files/",
            "--upload-user",
            "me",
            "--upload-password",
            "secret",
        ])
        .unwrap();
        let config = args.upload.config().unwrap().unwrap();
        assert_eq!(config.endpoint.as_str(), "https://dav.example/files/");

        let partial = UploadArgs {
            upload: true,
            upload_endpoint: Some(Url::parse("https://dav.example/").unwrap()),
            ..UploadArgs::default()
        };
        assert!(matches!(
            partial.config(),
            Err(CliError::MissingUploadSetting("--upload-user"))
        ));
        assert!(UploadArgs::default().config().unwrap().is_none());
    }

    #[test]
    fn test_parse_video_playlist() {
        let args = Args::try_parse_from([
            "omnifetch",
            "video",
            "https://www.youtube.com/playlist?list=PL1",
            "--playlist",
            "--extractor",
            "/opt/yt-dlp",
        ])
        .unwrap();
        let Command::Video {
            playlist, extractor, ..
        } = args.command
        else {
            panic!("expected video");
        };
        assert!(playlist);
        assert_eq!(extractor, "/opt/yt-dlp");
    }

    #[test]
    fn test_default_filename() {
        let url = Url::parse("https://example.com/dl/My%20File.zip").unwrap();
        assert_eq!(default_filename(&url), PathBuf::from("My File.zip"));
        let bare = Url::parse("https://example.com/").unwrap();
        assert_eq!(default_filename(&bare), PathBuf::from(FALLBACK_FILENAME));
    }
}
