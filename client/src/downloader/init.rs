use super::state::Downloader;
use crate::storage::PieceStore;
use omni_core::Descriptor;
use sha1::{Digest, Sha1};
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Opens the piece store below `dir` and builds a downloader with every
/// piece marked missing.
///
/// # Arguments
///
/// * `dir` - The storage directory; files are laid out below it.
/// * `descriptor` - The torrent metadata.
/// * `peer_id` - The id announced to trackers and peers.
///
/// # Errors
///
/// Returns the I/O error hit while creating or sizing any of the files.
pub async fn open(
    dir: &Path,
    descriptor: Arc<Descriptor>,
    peer_id: [u8; 20],
) -> io::Result<Downloader> {
    let store = PieceStore::open(dir, &descriptor).await?;
    tracing::debug!(
        dir = %dir.display(),
        files = store.paths().count(),
        total = descriptor.total_length(),
        "storage ready"
    );
    Ok(Downloader::new(descriptor, peer_id, store))
}

/// Hashes every piece already on disk and marks the matching ones present.
///
/// Returns the number of pieces found intact. Sparse regions read back as
/// zeros and simply fail verification.
pub async fn check_existing_data(downloader: &Downloader) -> io::Result<usize> {
    let descriptor = &downloader.descriptor;
    let mut found = 0;
    for (index, expected) in descriptor.pieces.iter().enumerate() {
        let len = descriptor.piece_size(index);
        let data = downloader.store.lock().await.read_piece(index, len).await?;
        let hash: [u8; 20] = Sha1::digest(&data).into();
        if &hash == expected {
            downloader.mark_have(index, false);
            found += 1;
        }
    }
    tracing::info!(
        found,
        total = descriptor.piece_count(),
        "verified existing data"
    );
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::PieceStatus;
    use tempfile::tempdir;

    fn descriptor(content: &[u8], piece_length: u64) -> Descriptor {
        Descriptor {
            announce: "http://tracker.com".to_string(),
            announce_list: None,
            info_hash: [0u8; 20],
            name: "existing.txt".to_string(),
            pieces: content
                .chunks(piece_length as usize)
                .map(|c| Sha1::digest(c).into())
                .collect(),
            piece_length,
            length: Some(content.len() as u64),
            files: None,
        }
    }

    #[tokio::test]
    async fn test_open_creates_sized_file() {
        let dir = tempdir().unwrap();
        let downloader = open(dir.path(), Arc::new(descriptor(&[7; 1024], 512)), [0; 20])
            .await
            .unwrap();
        assert_eq!(downloader.piece_status.lock().unwrap().len(), 2);

        let metadata = tokio::fs::metadata(dir.path().join("existing.txt")).await.unwrap();
        assert_eq!(metadata.len(), 1024);
    }

    #[tokio::test]
    async fn test_check_existing_data_marks_only_intact_pieces() {
        let dir = tempdir().unwrap();
        let content = b"AAAAAAAAAABBBBBBBBBBCCCCC";
        let mut on_disk = content.to_vec();
        on_disk[12] = b'x';
        std::fs::write(dir.path().join("existing.txt"), &on_disk).unwrap();

        let downloader = open(dir.path(), Arc::new(descriptor(content, 10)), [0; 20])
            .await
            .unwrap();
        assert_eq!(check_existing_data(&downloader).await.unwrap(), 2);

        let status = downloader.piece_status.lock().unwrap().clone();
        assert_eq!(
            status,
            vec![PieceStatus::Have, PieceStatus::Missing, PieceStatus::Have]
        );
        assert_eq!(downloader.verified_bytes(), 15);
        assert!(!downloader.is_complete());
    }

    #[tokio::test]
    async fn test_fully_present_content_completes() {
        let dir = tempdir().unwrap();
        let content = vec![3u8; 100];
        std::fs::write(dir.path().join("existing.txt"), &content).unwrap();
        let downloader = open(dir.path(), Arc::new(descriptor(&content, 32)), [0; 20])
            .await
            .unwrap();
        check_existing_data(&downloader).await.unwrap();
        assert!(downloader.is_complete());
        assert_eq!(downloader.session_bytes(), 0);
    }
}
