use super::{SwarmEngine, SwarmHandle, SwarmStatus};
use crate::storage::safe_component;
use omni_core::{
    DescriptorSource, MagnetLink, ProgressSample, ProgressSink, TransferError, TransferOutcome,
    TransferResult, parse_descriptor_from_bytes,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Where a swarm transfer currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Initializing,
    AwaitingMetadata,
    Downloading,
    Complete,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// How often the engine is polled for metadata and progress.
    pub poll_interval: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Walks one torrent through metadata, download and completion on top of a
/// [`SwarmEngine`], reporting progress as it goes.
pub struct SwarmDriver<E> {
    engine: E,
    options: DriverOptions,
}

impl<E: SwarmEngine> SwarmDriver<E> {
    pub fn new(engine: E) -> Self {
        Self::with_options(engine, DriverOptions::default())
    }

    pub fn with_options(engine: E, options: DriverOptions) -> Self {
        Self { engine, options }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Downloads the torrent behind a magnet URI into
    /// `save_root/<torrent name>`. Waits for metadata for as long as it
    /// takes; only `cancel` ends the wait early.
    pub async fn drive_from_magnet<S>(
        &self,
        uri: &str,
        save_root: &Path,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> TransferOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let started = Instant::now();
        let link = MagnetLink::parse(uri)
            .map_err(|e| TransferError::InvalidInput(format!("{uri}: {e}")))?;
        tracing::info!(
            state = ?DriveState::Initializing,
            info_hash = %link.info_hash_hex(),
            name = link.display_name.as_deref().unwrap_or(""),
            "adding magnet"
        );
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            handle = self.engine.add_magnet(&link) => handle?,
        };
        self.drive(handle, save_root, sink, cancel, started).await
    }

    /// Downloads a torrent whose descriptor is at hand.
    pub async fn drive_from_descriptor<S>(
        &self,
        source: &DescriptorSource,
        save_root: &Path,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> TransferOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let started = Instant::now();
        let bytes = match source {
            DescriptorSource::Bytes(bytes) => bytes.clone(),
            DescriptorSource::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| TransferError::filesystem(path, e))?,
        };
        let descriptor = parse_descriptor_from_bytes(&bytes)
            .map_err(|e| TransferError::InvalidInput(format!("torrent descriptor: {e}")))?;
        tracing::info!(
            state = ?DriveState::Initializing,
            info_hash = %descriptor.info_hash_hex(),
            name = %descriptor.name,
            "adding torrent"
        );
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            handle = self.engine.add_descriptor(descriptor) => handle?,
        };
        self.drive(handle, save_root, sink, cancel, started).await
    }

    async fn drive<S>(
        &self,
        mut handle: E::Handle,
        save_root: &Path,
        sink: &mut S,
        cancel: &CancellationToken,
        started: Instant,
    ) -> TransferOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let outcome = self.run(&mut handle, save_root, sink, cancel, started).await;
        handle.shutdown().await;
        match &outcome {
            Ok(result) => tracing::info!(
                path = %result.path.display(),
                bytes = result.total_bytes,
                "swarm transfer finished"
            ),
            Err(e) => tracing::warn!("swarm transfer failed: {e}"),
        }
        outcome
    }

    async fn run<S>(
        &self,
        handle: &mut E::Handle,
        save_root: &Path,
        sink: &mut S,
        cancel: &CancellationToken,
        started: Instant,
    ) -> TransferOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let mut state = DriveState::Initializing;

        let descriptor = loop {
            if let Some(descriptor) = handle.metadata() {
                break descriptor;
            }
            transition(&mut state, DriveState::AwaitingMetadata);
            check_failure(&handle.status())?;
            self.pause(cancel).await?;
        };

        let dir = save_root.join(safe_component(&descriptor.name));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::storage(&dir, e))?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            attached = handle.start(&dir) => attached.map_err(|e| match e {
                TransferError::Storage { .. } | TransferError::Cancelled => e,
                other => TransferError::storage(&dir, other),
            })?,
        }

        let total = descriptor.total_length();
        let mut last_emitted: Option<u64> = None;
        let mut rate = 0.0;
        loop {
            if handle.is_complete() {
                if last_emitted != Some(total) {
                    sink.on_progress(&ProgressSample {
                        bytes: total,
                        total: Some(total),
                        elapsed: started.elapsed(),
                        rate,
                    });
                }
                transition(&mut state, DriveState::Complete);
                return Ok(TransferResult {
                    path: dir,
                    total_bytes: total,
                    elapsed: started.elapsed(),
                });
            }
            transition(&mut state, DriveState::Downloading);

            let status = handle.status();
            check_failure(&status)?;
            rate = status.download_rate;
            if last_emitted.is_none_or(|last| status.total_done > last) {
                sink.on_progress(&ProgressSample {
                    bytes: status.total_done,
                    total: Some(status.total_size.max(total)),
                    elapsed: started.elapsed(),
                    rate,
                });
                last_emitted = Some(status.total_done);
                tracing::debug!(
                    done = status.total_done,
                    total,
                    peers = status.peers,
                    rate = status.download_rate,
                    "swarm progress"
                );
            }

            self.pause(cancel).await?;
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(self.options.poll_interval) => Ok(()),
        }
    }
}

fn transition(state: &mut DriveState, next: DriveState) {
    if *state != next {
        tracing::info!(from = ?*state, to = ?next, "swarm state");
        *state = next;
    }
}

fn check_failure(status: &SwarmStatus) -> Result<(), TransferError> {
    match &status.error {
        Some(message) => Err(TransferError::Session(message.clone())),
        None => Ok(()),
    }
}
