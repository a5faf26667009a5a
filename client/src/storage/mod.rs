use omni_core::Descriptor;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Turns an untrusted name into a single safe path component.
///
/// Separators become `_`, and names that would escape or alias the parent
/// directory (`""`, `.`, `..`) are replaced entirely.
///
/// # Examples
///
/// ```
/// use omnifetch::storage::safe_component;
///
/// assert_eq!(safe_component("../etc/passwd"), ".._etc_passwd");
/// assert_eq!(safe_component(".."), "_");
/// ```
pub fn safe_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// One file of the torrent and where it sits in the piece stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    /// Path relative to the storage directory.
    pub relative: PathBuf,
    /// Offset of the first byte within the concatenated content.
    pub offset: u64,
    pub length: u64,
}

/// Lays the descriptor's files out relative to the storage directory.
///
/// A single-file torrent maps to `<name>`; a multi-file torrent maps each
/// entry's path components below the directory (the directory already
/// carries the torrent name).
pub fn layout(descriptor: &Descriptor) -> Vec<FileSpan> {
    match &descriptor.files {
        Some(files) => {
            let mut offset = 0;
            files
                .iter()
                .map(|f| {
                    let relative: PathBuf = f.path.iter().map(|c| safe_component(c)).collect();
                    let span = FileSpan {
                        relative,
                        offset,
                        length: f.length,
                    };
                    offset += f.length;
                    span
                })
                .collect()
        }
        None => vec![FileSpan {
            relative: PathBuf::from(safe_component(&descriptor.name)),
            offset: 0,
            length: descriptor.total_length(),
        }],
    }
}

struct StoredFile {
    span: FileSpan,
    handle: File,
}

/// Maps piece-relative reads and writes onto the files of a torrent.
pub struct PieceStore {
    files: Vec<StoredFile>,
    piece_length: u64,
    total_length: u64,
}

impl PieceStore {
    /// Creates (or reopens) every file below `dir`, sized to its final
    /// length. Sizing uses `set_len`, so untouched regions stay sparse.
    ///
    /// Files are only ever grown: an existing file longer than the torrent
    /// says is an `InvalidData` error and is left as it is.
    pub async fn open(dir: &Path, descriptor: &Descriptor) -> io::Result<Self> {
        let mut files = Vec::new();
        for span in layout(descriptor) {
            let path = dir.join(&span.relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            let on_disk = handle.metadata().await?.len();
            if on_disk > span.length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{} holds {on_disk} bytes, torrent expects {}",
                        path.display(),
                        span.length
                    ),
                ));
            }
            if on_disk < span.length {
                handle.set_len(span.length).await?;
            }
            files.push(StoredFile { span, handle });
        }

        Ok(Self {
            files,
            piece_length: descriptor.piece_length,
            total_length: descriptor.total_length(),
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.span.relative.as_path())
    }

    /// Reads `len` bytes of piece `index`.
    pub async fn read_piece(&mut self, index: usize, len: u64) -> io::Result<Vec<u8>> {
        let start = index as u64 * self.piece_length;
        let mut buf = vec![0u8; len as usize];
        for (file_offset, range, file) in self.segments(start, len) {
            file.handle.seek(SeekFrom::Start(file_offset)).await?;
            file.handle.read_exact(&mut buf[range]).await?;
        }
        Ok(buf)
    }

    /// Writes a verified piece and flushes every file it touched.
    pub async fn write_piece(&mut self, index: usize, data: &[u8]) -> io::Result<()> {
        let start = index as u64 * self.piece_length;
        if start + data.len() as u64 > self.total_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("piece {index} extends past the end of the torrent"),
            ));
        }
        for (file_offset, range, file) in self.segments(start, data.len() as u64) {
            file.handle.seek(SeekFrom::Start(file_offset)).await?;
            file.handle.write_all(&data[range]).await?;
            file.handle.flush().await?;
        }
        Ok(())
    }

    /// Splits the global byte range `[start, start + len)` into per-file
    /// pieces: (offset in file, range in the caller's buffer, file).
    fn segments(
        &mut self,
        start: u64,
        len: u64,
    ) -> impl Iterator<Item = (u64, std::ops::Range<usize>, &mut StoredFile)> {
        let end = start + len;
        self.files.iter_mut().filter_map(move |file| {
            let file_start = file.span.offset;
            let file_end = file_start + file.span.length;
            let lo = start.max(file_start);
            let hi = end.min(file_end);
            (lo < hi).then(|| {
                let buf_range = (lo - start) as usize..(hi - start) as usize;
                (lo - file_start, buf_range, file)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::FileInfo;
    use tempfile::tempdir;

    fn multi_file() -> Descriptor {
        Descriptor {
            announce: String::new(),
            announce_list: None,
            info_hash: [0; 20],
            piece_length: 4,
            pieces: vec![[0; 20]; 3],
            name: "album".into(),
            length: None,
            files: Some(vec![
                FileInfo {
                    length: 3,
                    path: vec!["a.txt".into()],
                },
                FileInfo {
                    length: 0,
                    path: vec!["empty".into()],
                },
                FileInfo {
                    length: 6,
                    path: vec!["..".into(), "sub".into(), "b.txt".into()],
                },
            ]),
        }
    }

    #[test]
    fn test_safe_component() {
        assert_eq!(safe_component("movie.mkv"), "movie.mkv");
        assert_eq!(safe_component("a/b\\c"), "a_b_c");
        assert_eq!(safe_component("."), "_");
        assert_eq!(safe_component(""), "_");
    }

    #[test]
    fn test_layout_offsets_and_sanitized_paths() {
        let spans = layout(&multi_file());
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].offset, 0);
        assert_eq!(spans[2].offset, 3);
        assert_eq!(spans[2].relative, PathBuf::from("_").join("sub").join("b.txt"));
    }

    #[tokio::test]
    async fn test_piece_spanning_files() {
        let dir = tempdir().unwrap();
        let descriptor = multi_file();
        let mut store = PieceStore::open(dir.path(), &descriptor).await.unwrap();

        store.write_piece(0, b"abcd").await.unwrap();
        store.write_piece(1, b"efgh").await.unwrap();
        store.write_piece(2, b"i").await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"abc");
        assert_eq!(std::fs::read(dir.path().join("empty")).unwrap(), b"");
        assert_eq!(
            std::fs::read(dir.path().join("_/sub/b.txt")).unwrap(),
            b"defghi"
        );
        assert_eq!(store.read_piece(1, 4).await.unwrap(), b"efgh");
        assert!(store.write_piece(2, b"toolong").await.is_err());
    }

    #[tokio::test]
    async fn test_open_sizes_files_without_clobbering() {
        let dir = tempdir().unwrap();
        let descriptor = Descriptor {
            name: "single.bin".into(),
            length: Some(8),
            files: None,
            pieces: vec![[0; 20]; 2],
            ..multi_file()
        };
        std::fs::write(dir.path().join("single.bin"), b"1234").unwrap();

        let mut store = PieceStore::open(dir.path(), &descriptor).await.unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("single.bin")).unwrap().len(), 8);
        assert_eq!(store.read_piece(0, 4).await.unwrap(), b"1234");
        assert_eq!(store.paths().count(), 1);
    }

    #[tokio::test]
    async fn test_open_refuses_to_shrink_larger_file() {
        let dir = tempdir().unwrap();
        let descriptor = Descriptor {
            name: "single.bin".into(),
            length: Some(8),
            files: None,
            pieces: vec![[0; 20]; 2],
            ..multi_file()
        };
        let path = dir.path().join("single.bin");
        std::fs::write(&path, b"0123456789ab").unwrap();

        let err = PieceStore::open(dir.path(), &descriptor).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789ab");
    }
}
