//! Waiting for the host to finish inserting uploaded images.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RenderConfig;
use crate::correlate::AttachmentCorrelator;
use crate::error::RenderError;
use crate::host::ComposeSurface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    Idle,
    Watching { expected: usize },
    Satisfied,
    TimedOut,
    Cancelled,
}

enum Wake {
    Cancelled,
    Deadline,
    Changed,
    /// The host dropped its side of the revision channel
    Closed,
}

/// Blocks a render cycle until every equation's upload shows up.
///
/// Mutations are observed through the host's revision channel when it offers
/// one, otherwise the body is polled. Either way the wait is capped.
#[derive(Debug)]
pub struct UploadWaiter {
    timeout: Duration,
    poll_interval: Duration,
    state: WaiterState,
}

impl UploadWaiter {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            timeout: config.upload_timeout,
            poll_interval: config.poll_interval,
            state: WaiterState::Idle,
        }
    }

    pub fn state(&self) -> WaiterState {
        self.state
    }

    /// Wait until every asset in `correlator` has a pending upload in `surface`.
    /// Returns the body as seen at that point.
    ///
    /// A waiter runs once; calling this again fails with `WaiterSpent`.
    #[tracing::instrument(level = "debug", skip_all, fields(expected = correlator.len()))]
    pub async fn wait<S: ComposeSurface>(
        &mut self,
        surface: &S,
        correlator: &AttachmentCorrelator,
        cancel: &CancellationToken,
    ) -> Result<String, RenderError> {
        if self.state != WaiterState::Idle {
            return Err(RenderError::WaiterSpent);
        }
        let expected = correlator.len();
        self.state = WaiterState::Watching { expected };

        let deadline = Instant::now() + self.timeout;
        // Subscribe before the first read so no mutation slips in between.
        let mut observer = surface.observe();
        if observer.is_none() {
            tracing::debug!(interval = ?self.poll_interval, "host offers no observation, polling");
        }

        loop {
            let body = surface.body();
            let observed = correlator.count_confirmed(&body);
            if observed >= expected {
                drop(observer);
                self.state = WaiterState::Satisfied;
                tracing::debug!(observed, "uploads confirmed");
                return Ok(body);
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                wake = next_change(observer.as_mut(), self.poll_interval) => wake,
            };

            match wake {
                Wake::Changed => {}
                Wake::Closed => {
                    tracing::debug!("revision channel closed, falling back to polling");
                    observer = None;
                }
                Wake::Cancelled => {
                    self.state = WaiterState::Cancelled;
                    return Err(RenderError::Cancelled);
                }
                Wake::Deadline => {
                    self.state = WaiterState::TimedOut;
                    let observed = correlator.count_confirmed(&surface.body());
                    tracing::warn!(expected, observed, "timed out waiting for uploads");
                    return Err(RenderError::UploadTimeout {
                        expected,
                        observed,
                        waited: self.timeout,
                    });
                }
            }
        }
    }
}

async fn next_change(observer: Option<&mut watch::Receiver<u64>>, poll: Duration) -> Wake {
    match observer {
        Some(rx) => match rx.changed().await {
            Ok(()) => Wake::Changed,
            Err(_) => Wake::Closed,
        },
        None => {
            tokio::time::sleep(poll).await;
            Wake::Changed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MARKER_CLASS, DEFAULT_SENTINEL};
    use crate::extract::MathSpanExtractor;
    use crate::host::memory::{MemoryCompose, MemoryOptions};
    use crate::render::RasterImage;
    use bytes::Bytes;

    fn correlator(body: &str) -> AttachmentCorrelator {
        let mut table = AttachmentCorrelator::new(body, 1, DEFAULT_SENTINEL, DEFAULT_MARKER_CLASS);
        for span in MathSpanExtractor::default().extract(body) {
            table.register(
                &span,
                RasterImage {
                    png: Bytes::from_static(b"\x89PNG\r\n\x1a\n"),
                    width: 4,
                    height: 4,
                    pixel_width: 8,
                    pixel_height: 8,
                },
            );
        }
        table
    }

    fn config() -> RenderConfig {
        RenderConfig {
            upload_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_once_all_uploads_appear() {
        let table = correlator("$x$ $y$");
        let surface = MemoryCompose::with_options(
            "",
            MemoryOptions {
                upload_delay: Duration::from_millis(300),
                ..Default::default()
            },
        );
        surface.attach_inline(table.attachments()).await.unwrap();

        let mut waiter = UploadWaiter::new(&config());
        let body = waiter
            .wait(&surface, &table, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(waiter.state(), WaiterState::Satisfied);
        assert_eq!(table.count_confirmed(&body), 2);

        let err = waiter
            .wait(&surface, &table, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::WaiterSpent));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_when_host_cannot_be_observed() {
        let table = correlator("$x$");
        let surface = MemoryCompose::with_options(
            "",
            MemoryOptions {
                upload_delay: Duration::from_millis(250),
                observable: false,
                ..Default::default()
            },
        );
        surface.attach_inline(table.attachments()).await.unwrap();

        let mut waiter = UploadWaiter::new(&config());
        let started = Instant::now();
        waiter
            .wait(&surface, &table, &CancellationToken::new())
            .await
            .unwrap();
        // first poll tick after the upload lands
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(250), "{waited:?}");
        assert!(waited <= Duration::from_millis(350), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_uploads_go_missing() {
        let table = correlator("$x$ $y$");
        let surface = MemoryCompose::with_options(
            "",
            MemoryOptions {
                drop_uploads: 1,
                ..Default::default()
            },
        );
        surface.attach_inline(table.attachments()).await.unwrap();

        let mut waiter = UploadWaiter::new(&config());
        let err = waiter
            .wait(&surface, &table, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(waiter.state(), WaiterState::TimedOut);
        match err {
            RenderError::UploadTimeout {
                expected,
                observed,
                waited,
            } => {
                assert_eq!((expected, observed), (2, 1));
                assert_eq!(waited, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_wait() {
        let table = correlator("$x$");
        let surface = MemoryCompose::new("");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut waiter = UploadWaiter::new(&config());
        let err = waiter.wait(&surface, &table, &cancel).await.unwrap_err();
        assert!(matches!(err, RenderError::Cancelled));
        assert_eq!(waiter.state(), WaiterState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_uploads_do_not_count() {
        let table = correlator("$x$");
        let surface = MemoryCompose::new(
            r#"<div><img src="cid:old" alt="eq_pending_0_0_x.png"><br></div>"#,
        );
        let mut waiter = UploadWaiter::new(&config());
        let err = waiter
            .wait(&surface, &table, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::UploadTimeout { observed: 0, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn copies_of_one_upload_do_not_satisfy() {
        let table = correlator("$x$ $y$");
        let copy = r#"<div><img src="cid:a" alt="eq_pending_1_0_x.png"><br></div>"#;
        let surface = MemoryCompose::new(format!("{copy}{copy}"));
        let mut waiter = UploadWaiter::new(&config());
        let err = waiter
            .wait(&surface, &table, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::UploadTimeout {
                expected: 2,
                observed: 1,
                ..
            }
        ));
    }
}
