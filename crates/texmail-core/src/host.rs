//! Host compose surface abstraction.
//!
//! The pipeline never talks to a mail client directly. A [`ComposeSurface`]
//! exposes the body markup, accepts inline image uploads and optionally
//! reports body mutations. Implementations are provided by the embedding
//! application; [`memory::MemoryCompose`] is an in-process one.

pub mod memory;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use mime_sniffer::MimeTypeSniffer;
use tokio::sync::watch;

use crate::error::HostError;

/// An image handed to the host for inline upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAttachment {
    /// Suggested file name; carries the correlation identifier
    pub file_name: String,
    pub data: Bytes,
    pub mime_type: String,
    /// Declared display width in CSS pixels
    pub width: u32,
    /// Declared display height in CSS pixels
    pub height: u32,
}

impl InlineAttachment {
    /// Build an attachment, sniffing the MIME type from the bytes.
    pub fn new(file_name: String, data: Bytes, width: u32, height: u32) -> Self {
        let mime_type = data
            .sniff_mime_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        Self {
            file_name,
            data,
            mime_type,
            width,
            height,
        }
    }
}

/// A compose window's body, as seen by the render pipeline.
pub trait ComposeSurface: Send + Sync {
    /// Current body markup.
    fn body(&self) -> String;

    /// Replace the whole body in one step.
    fn set_body(&self, body: String);

    /// Start uploading `attachments` as inline images.
    ///
    /// Resolves once the host has accepted the files; the resulting image
    /// markup shows up in the body later, in an order and shape the host picks.
    fn attach_inline(
        &self,
        attachments: Vec<InlineAttachment>,
    ) -> impl Future<Output = Result<(), HostError>> + Send;

    /// Subscribe to body mutations.
    ///
    /// The receiver's value changes on every mutation. `None` means the host
    /// can't report mutations and callers have to poll.
    fn observe(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

impl<T: ComposeSurface> ComposeSurface for Arc<T> {
    fn body(&self) -> String {
        (**self).body()
    }

    fn set_body(&self, body: String) {
        (**self).set_body(body)
    }

    fn attach_inline(
        &self,
        attachments: Vec<InlineAttachment>,
    ) -> impl Future<Output = Result<(), HostError>> + Send {
        (**self).attach_inline(attachments)
    }

    fn observe(&self) -> Option<watch::Receiver<u64>> {
        (**self).observe()
    }
}
