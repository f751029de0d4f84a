//! In-memory compose surface.
//!
//! Behaves like a webmail compose window: uploads are accepted immediately and
//! their markup is appended to the end of the body a little later, one
//! mutation per image, wrapped in `<div>...<br></div>`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::sync::watch;

use super::{ComposeSurface, InlineAttachment};
use crate::error::HostError;
use crate::html::escape;

/// Where uploaded image markup points its `src`.
#[derive(Debug, Clone, Default)]
pub enum ImageSource {
    /// `cid:` references, as in a MIME message
    #[default]
    ContentId,
    /// Self-contained `data:` URIs
    DataUri,
    /// Files written to `dir`, referenced as `{href_prefix}{file}`
    Directory { dir: PathBuf, href_prefix: String },
}

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Delay before each upload's markup appears in the body
    pub upload_delay: Duration,
    pub source: ImageSource,
    /// Insert uploads in reverse order
    pub reverse_order: bool,
    /// Silently lose this many uploads
    pub drop_uploads: usize,
    /// Remove digits from file names, losing correlation identifiers
    pub strip_identifiers: bool,
    /// Rewrite each file name before its markup is inserted
    pub rename: Option<fn(&str) -> String>,
    /// Offer mutation observation
    pub observable: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            upload_delay: Duration::ZERO,
            source: ImageSource::default(),
            reverse_order: false,
            drop_uploads: 0,
            strip_identifiers: false,
            rename: None,
            observable: true,
        }
    }
}

/// An attachment the host accepted, with the content id it was given.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub content_id: String,
    pub attachment: InlineAttachment,
}

#[derive(Clone)]
pub struct MemoryCompose {
    inner: Arc<Inner>,
}

struct Inner {
    body: RwLock<String>,
    revision: watch::Sender<u64>,
    options: MemoryOptions,
    next_id: AtomicUsize,
    uploads: Mutex<Vec<StoredUpload>>,
}

impl MemoryCompose {
    pub fn new(body: impl Into<String>) -> Self {
        Self::with_options(body, MemoryOptions::default())
    }

    pub fn with_options(body: impl Into<String>, options: MemoryOptions) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                body: RwLock::new(body.into()),
                revision,
                options,
                next_id: AtomicUsize::new(0),
                uploads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every upload accepted so far.
    pub fn uploads(&self) -> Vec<StoredUpload> {
        self.inner
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of body mutations so far.
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    fn append(&self, markup: &str) {
        self.inner
            .body
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(markup);
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    async fn store(&self, attachment: InlineAttachment) -> Result<String, HostError> {
        let options = &self.inner.options;
        let content_id = format!(
            "ii_texmail_{}",
            self.inner.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let src = match &options.source {
            ImageSource::ContentId => format!("cid:{content_id}"),
            ImageSource::DataUri => format!(
                "data:{};base64,{}",
                attachment.mime_type,
                STANDARD.encode(&attachment.data)
            ),
            ImageSource::Directory { dir, href_prefix } => {
                let ext = attachment
                    .mime_type
                    .strip_prefix("image/")
                    .unwrap_or("bin");
                let file = format!("{content_id}.{ext}");
                tokio::fs::write(dir.join(&file), &attachment.data).await?;
                format!("{href_prefix}{file}")
            }
        };
        let name: String = if options.strip_identifiers {
            attachment
                .file_name
                .chars()
                .filter(|c| !c.is_ascii_digit())
                .collect()
        } else {
            attachment.file_name.clone()
        };
        let name = match options.rename {
            Some(rename) => rename(&name),
            None => name,
        };
        let name = escape(&name);
        let markup = format!(
            r#"<div><img src="{}" alt="{name}" data-name="{name}" width="{}" height="{}"><br></div>"#,
            escape(&src),
            attachment.width,
            attachment.height,
        );
        self.inner
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredUpload {
                content_id,
                attachment,
            });
        Ok(markup)
    }
}

impl ComposeSurface for MemoryCompose {
    fn body(&self) -> String {
        self.inner
            .body
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_body(&self, body: String) {
        *self
            .inner
            .body
            .write()
            .unwrap_or_else(PoisonError::into_inner) = body;
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    fn attach_inline(
        &self,
        attachments: Vec<InlineAttachment>,
    ) -> impl std::future::Future<Output = Result<(), HostError>> + Send {
        let this = self.clone();
        async move {
            let options = &this.inner.options;
            let mut attachments = attachments;
            if options.reverse_order {
                attachments.reverse();
            }
            let keep = attachments.len().saturating_sub(options.drop_uploads);
            attachments.truncate(keep);

            let mut blocks = Vec::with_capacity(attachments.len());
            for attachment in attachments {
                blocks.push(this.store(attachment).await?);
            }

            let delay = options.upload_delay;
            let surface = this.clone();
            tokio::spawn(async move {
                for block in blocks {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    surface.append(&block);
                }
            });
            Ok(())
        }
    }

    fn observe(&self) -> Option<watch::Receiver<u64>> {
        self.inner
            .options
            .observable
            .then(|| self.inner.revision.subscribe())
    }
}
