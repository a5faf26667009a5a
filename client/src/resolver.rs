//! Turning video page links into direct media URLs, and downloading whole
//! playlists through them.

use crate::fetcher::Fetcher;
use crate::storage::safe_component;
use omni_core::{ProgressSink, TransferError, TransferResult};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Folder name for playlists whose title the extractor does not report.
const UNTITLED_PLAYLIST: &str = "playlist";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("unexpected extractor output: {0}")]
    Output(String),
}

/// A directly downloadable media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub url: Url,
    pub filename: String,
}

/// One video of a playlist, still to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub title: String,
    pub page: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
}

pub trait MediaResolver: Send + Sync {
    fn resolve(
        &self,
        page: &Url,
    ) -> impl Future<Output = Result<ResolvedMedia, ResolveError>> + Send;

    /// Lists the videos of a playlist page, in playlist order.
    fn playlist(&self, page: &Url) -> impl Future<Output = Result<Playlist, ResolveError>> + Send;
}

/// Resolves pages by running an external extractor, `yt-dlp` by default.
///
/// For a single video the program is invoked as `<program> <args..> <page>`
/// and must print the file name on its first line and the media URL on its
/// second. For a playlist it runs `<program> <playlist_args..> <page>` and
/// prints one `playlist title<TAB>video title<TAB>video page` line per entry.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    pub program: String,
    pub args: Vec<String>,
    pub playlist_args: Vec<String>,
}

impl Default for CommandResolver {
    fn default() -> Self {
        Self::yt_dlp("yt-dlp")
    }
}

impl CommandResolver {
    /// A resolver for a `yt-dlp` compatible binary at `program`.
    pub fn yt_dlp(program: impl Into<String>) -> Self {
        let args = ["--no-playlist", "-f", "best", "--print", "filename", "--print", "urls"];
        let playlist_args = [
            "--flat-playlist",
            "--print",
            "%(playlist_title)s\t%(title)s\t%(url)s",
        ];
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            playlist_args: playlist_args.iter().map(|a| a.to_string()).collect(),
        }
    }

    async fn run(&self, args: &[String], page: &Url) -> Result<String, ResolveError> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .arg(page.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ResolveError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ResolveError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl MediaResolver for CommandResolver {
    async fn resolve(&self, page: &Url) -> Result<ResolvedMedia, ResolveError> {
        tracing::debug!(program = %self.program, %page, "resolving media");
        parse_output(&self.run(&self.args, page).await?)
    }

    async fn playlist(&self, page: &Url) -> Result<Playlist, ResolveError> {
        tracing::debug!(program = %self.program, %page, "listing playlist");
        parse_playlist(&self.run(&self.playlist_args, page).await?)
    }
}

fn parse_output(stdout: &str) -> Result<ResolvedMedia, ResolveError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(filename), Some(url)) = (lines.next(), lines.next()) else {
        return Err(ResolveError::Output(stdout.trim().to_string()));
    };
    let url = Url::parse(url).map_err(|e| ResolveError::Output(format!("{url}: {e}")))?;
    let filename = crate::storage::safe_component(filename);
    Ok(ResolvedMedia { url, filename })
}

fn parse_playlist(stdout: &str) -> Result<Playlist, ResolveError> {
    let mut title = None;
    let mut entries = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.splitn(3, '\t');
        let (Some(list), Some(name), Some(page)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(ResolveError::Output(line.to_string()));
        };
        let page = page.trim();
        let page = Url::parse(page).map_err(|e| ResolveError::Output(format!("{page}: {e}")))?;
        title.get_or_insert_with(|| list.trim().to_string());
        entries.push(PlaylistEntry {
            title: name.trim().to_string(),
            page,
        });
    }
    let title = title
        .filter(|t| !t.is_empty() && t != "NA")
        .unwrap_or_else(|| UNTITLED_PLAYLIST.to_string());
    Ok(Playlist { title, entries })
}

/// A playlist entry that could not be downloaded.
#[derive(Debug)]
pub struct SkippedEntry {
    /// 1-based position in the playlist.
    pub position: usize,
    pub title: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct PlaylistReport {
    /// Folder holding the downloaded videos.
    pub dir: PathBuf,
    pub saved: Vec<TransferResult>,
    pub skipped: Vec<SkippedEntry>,
}

impl PlaylistReport {
    pub fn total_bytes(&self) -> u64 {
        self.saved.iter().map(|r| r.total_bytes).sum()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Downloads every video of the playlist at `page` into
/// `save_root/<playlist title>/NN_<file name>`.
///
/// Entries that fail to resolve or download are skipped and reported; only
/// listing the playlist and cancellation abort the whole run. Each entry is
/// a separate transfer, so `sink` sees progress restart from zero per video.
pub async fn download_playlist<R, S>(
    resolver: &R,
    fetcher: &Fetcher,
    page: &Url,
    save_root: &Path,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<PlaylistReport, PlaylistError>
where
    R: MediaResolver,
    S: ProgressSink + ?Sized,
{
    let playlist = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
        listed = resolver.playlist(page) => listed?,
    };
    let dir = save_root.join(safe_component(&playlist.title));
    tracing::info!(
        title = %playlist.title,
        videos = playlist.entries.len(),
        dir = %dir.display(),
        "downloading playlist"
    );
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| TransferError::filesystem(&dir, e))?;

    let mut report = PlaylistReport {
        dir,
        saved: Vec::new(),
        skipped: Vec::new(),
    };
    let chunk_size = fetcher.options().chunk_size;
    for (i, entry) in playlist.entries.iter().enumerate() {
        let position = i + 1;
        let media = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            media = resolver.resolve(&entry.page) => media,
        };
        let reason = match media {
            Ok(media) => {
                let output = report.dir.join(format!("{position:02}_{}", media.filename));
                match fetcher
                    .fetch(media.url.as_str(), &output, chunk_size, sink, cancel)
                    .await
                {
                    Ok(result) => {
                        report.saved.push(result);
                        continue;
                    }
                    Err(TransferError::Cancelled) => return Err(TransferError::Cancelled.into()),
                    Err(e) => e.to_string(),
                }
            }
            Err(e) => e.to_string(),
        };
        tracing::warn!(position, title = %entry.title, "skipping video: {reason}");
        report.skipped.push(SkippedEntry {
            position,
            title: entry.title.clone(),
            reason,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::ErrorKind;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A resolver backed by `sh -c` scripts that receive the page URL as `$1`.
    fn scripted(resolve: &str, list: &str) -> CommandResolver {
        let script = |body: &str| vec!["-c".to_string(), body.to_string(), "sh".to_string()];
        CommandResolver {
            program: "sh".into(),
            args: script(resolve),
            playlist_args: script(list),
        }
    }

    #[test]
    fn test_parse_output() {
        let media = parse_output("My Clip.mp4\nhttps://cdn.example/v.mp4?sig=1\n").unwrap();
        assert_eq!(media.filename, "My Clip.mp4");
        assert_eq!(media.url.as_str(), "https://cdn.example/v.mp4?sig=1");

        let media = parse_output("a/b.webm\n\nhttps://cdn.example/x\n").unwrap();
        assert_eq!(media.filename, "a_b.webm");

        assert!(parse_output("only-one-line\n").is_err());
        assert!(parse_output("name\nnot a url\n").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_resolver_passes_page_url() {
        let resolver = scripted(
            r#"printf 'clip.mp4\nhttps://cdn.example/v.mp4?from=%s\n' "$1""#,
            "exit 1",
        );
        let page = Url::parse("https://youtu.be/abc").unwrap();
        let media = resolver.resolve(&page).await.unwrap();
        assert_eq!(media.filename, "clip.mp4");
        assert_eq!(media.url.query(), Some("from=https://youtu.be/abc"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_resolver_reports_failures() {
        let failing = scripted("echo nope >&2; exit 3", "exit 1");
        let page = Url::parse("https://youtu.be/abc").unwrap();
        match failing.resolve(&page).await.unwrap_err() {
            ResolveError::Failed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected {other}"),
        }

        let missing = CommandResolver::yt_dlp("/nonexistent/extractor");
        assert!(matches!(
            missing.resolve(&page).await.unwrap_err(),
            ResolveError::Spawn { .. }
        ));
    }

    #[test]
    fn test_parse_playlist() {
        let playlist = parse_playlist(
            "Road Trip\tDay 1\thttps://www.youtube.com/watch?v=a\n\
             Road Trip\tDay 2: the coast\thttps://www.youtube.com/watch?v=b\n",
        )
        .unwrap();
        assert_eq!(playlist.title, "Road Trip");
        assert_eq!(playlist.entries.len(), 2);
        assert_eq!(playlist.entries[1].title, "Day 2: the coast");
        assert_eq!(playlist.entries[1].page.query(), Some("v=b"));

        let untitled = parse_playlist("NA\tclip\thttps://youtu.be/x\n").unwrap();
        assert_eq!(untitled.title, UNTITLED_PLAYLIST);
        assert!(parse_playlist("").unwrap().entries.is_empty());
        assert!(parse_playlist("no tabs here\n").is_err());
        assert!(parse_playlist("L\tt\tnot a url\n").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_playlist_numbers_files_and_skips_failures() {
        let mock = MockServer::start().await;
        let videos: [(&str, &[u8]); 2] = [("/one.mp4", b"first video"), ("/three.mp4", b"third")];
        for (name, body) in videos {
            Mock::given(method("GET"))
                .and(path(name))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
                .mount(&mock)
                .await;
        }

        let resolve = format!(
            r#"case "$1" in
                *v=1) printf 'one.mp4\n{uri}/one.mp4\n' ;;
                *v=3) printf 'three.mp4\n{uri}/three.mp4\n' ;;
                *) echo 'video unavailable' >&2; exit 1 ;;
            esac"#,
            uri = mock.uri()
        );
        let list = "printf 'My/Mix\tOne\thttps://www.youtube.com/watch?v=1\n\
                    My/Mix\tTwo\thttps://www.youtube.com/watch?v=2\n\
                    My/Mix\tThree\thttps://www.youtube.com/watch?v=3\n'";
        let resolver = scripted(&resolve, list);

        let root = tempdir().unwrap();
        let page = Url::parse("https://www.youtube.com/playlist?list=PL1").unwrap();
        let mut samples = Vec::new();
        let report = download_playlist(
            &resolver,
            &Fetcher::new().unwrap(),
            &page,
            root.path(),
            &mut |s: &omni_core::ProgressSample| samples.push(s.bytes),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.dir, root.path().join("My_Mix"));
        assert_eq!(std::fs::read(report.dir.join("01_one.mp4")).unwrap(), b"first video");
        assert_eq!(std::fs::read(report.dir.join("03_three.mp4")).unwrap(), b"third");
        assert!(!report.dir.join("02_two.mp4").exists());
        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.total_bytes(), 16);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].position, 2);
        assert_eq!(report.skipped[0].title, "Two");
        assert!(report.skipped[0].reason.contains("video unavailable"));
        assert_eq!(samples.last(), Some(&5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_playlist_listing_failure_and_cancel() {
        let root = tempdir().unwrap();
        let page = Url::parse("https://www.youtube.com/playlist?list=PL1").unwrap();
        let fetcher = Fetcher::new().unwrap();

        let broken = scripted("exit 1", "echo 'private playlist' >&2; exit 2");
        let err = download_playlist(
            &broken,
            &fetcher,
            &page,
            root.path(),
            &mut omni_core::Silent,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PlaylistError::Resolve(ResolveError::Failed { .. })));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let listed = scripted("exit 1", "printf 'L\\tA\\thttps://youtu.be/a\\n'");
        match download_playlist(&listed, &fetcher, &page, root.path(), &mut omni_core::Silent, &cancel)
            .await
            .unwrap_err()
        {
            PlaylistError::Transfer(e) => assert_eq!(e.kind(), ErrorKind::Cancelled),
            other => panic!("unexpected {other}"),
        }
    }
}
