//! Response observation.
//!
//! [`BasicWriter`] decorates a [`ResponseWriter`] and records the status code
//! and the number of body bytes that went through it, optionally copying the
//! bytes to a tee target. The tower middleware drives a writer from the
//! response it observes: the status when the response head is produced, then
//! every data frame as the body streams into a [`BodySink`].

use std::{
    collections::VecDeque,
    fmt, io,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use http::{StatusCode, Version};

/// The capability shared by a transport and the wrappers around it.
pub trait ResponseWriter {
    fn write_header(&mut self, status: StatusCode);

    fn write(&mut self, data: Bytes) -> io::Result<usize>;
}

/// A [`ResponseWriter`] decorator the middleware can observe.
///
/// A custom implementation can be plugged in through
/// [`TraceOptions::with_response_writer`](crate::middleware::TraceOptions::with_response_writer).
pub trait WrapResponseWriter: ResponseWriter + Send {
    /// The locked status code, `200 OK` until a final status was written.
    fn status(&self) -> StatusCode;

    /// Total length of every `write` call, discarded bytes included.
    fn bytes_written(&self) -> usize;

    /// Copies every body write to `target` as well.
    fn tee(&mut self, target: Box<dyn io::Write + Send>);

    /// Stops forwarding body writes to the transport. Bytes are still counted
    /// and teed.
    fn discard(&mut self);

    /// Whether [`discard`](Self::discard) was called.
    fn is_discarding(&self) -> bool;

    /// The wrapped transport.
    fn sink(&mut self) -> &mut BodySink;
}

/// Constructs the writer used for a request, given the transport and the
/// request's protocol version.
pub type MakeResponseWriter =
    Arc<dyn Fn(BodySink, Version) -> Box<dyn WrapResponseWriter> + Send + Sync>;

/// Transport end of the writer chain: the data queued here is what the
/// client receives.
#[derive(Debug, Default)]
pub struct BodySink {
    status: Option<StatusCode>,
    pending: VecDeque<Bytes>,
}

impl BodySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last status forwarded to the transport, informational ones included.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Pops the next chunk that should be delivered to the client.
    pub fn take_data(&mut self) -> Option<Bytes> {
        self.pending.pop_front()
    }
}

impl ResponseWriter for BodySink {
    fn write_header(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write(&mut self, data: Bytes) -> io::Result<usize> {
        let len = data.len();
        if len > 0 {
            self.pending.push_back(data);
        }
        Ok(len)
    }
}

/// Default [`WrapResponseWriter`].
pub struct BasicWriter<W> {
    inner: W,
    status: StatusCode,
    wrote_header: bool,
    bytes_written: usize,
    tee: Option<Box<dyn io::Write + Send>>,
    discard: bool,
}

impl<W> BasicWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            status: StatusCode::OK,
            wrote_header: false,
            bytes_written: 0,
            tee: None,
            discard: false,
        }
    }

    pub fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: ResponseWriter> ResponseWriter for BasicWriter<W> {
    fn write_header(&mut self, status: StatusCode) {
        if self.wrote_header {
            return;
        }

        // 1xx responses other than 101 are interim: the final status is still to come.
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            self.inner.write_header(status);
            return;
        }

        self.status = status;
        self.wrote_header = true;
        self.inner.write_header(status);
    }

    fn write(&mut self, data: Bytes) -> io::Result<usize> {
        if !self.wrote_header {
            self.write_header(StatusCode::OK);
        }

        let len = data.len();
        self.bytes_written += len;

        if let Some(tee) = self.tee.as_mut() {
            if let Err(err) = io::Write::write_all(&mut **tee, &data) {
                tracing::debug!(%err, "failed to copy response body to tee");
            }
        }

        if !self.discard {
            self.inner.write(data)?;
        }

        Ok(len)
    }
}

impl WrapResponseWriter for BasicWriter<BodySink> {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    fn tee(&mut self, target: Box<dyn io::Write + Send>) {
        self.tee = Some(target);
    }

    fn discard(&mut self) {
        self.discard = true;
    }

    fn is_discarding(&self) -> bool {
        self.discard
    }

    fn sink(&mut self) -> &mut BodySink {
        &mut self.inner
    }
}

impl<W: fmt::Debug> fmt::Debug for BasicWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicWriter")
            .field("inner", &self.inner)
            .field("status", &self.status)
            .field("wrote_header", &self.wrote_header)
            .field("bytes_written", &self.bytes_written)
            .field("tee", &self.tee.is_some())
            .field("discard", &self.discard)
            .finish()
    }
}

/// Shared in-memory tee target.
#[derive(Debug, Clone, Default)]
pub struct TeeBuffer(Arc<Mutex<Vec<u8>>>);

impl TeeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_string_lossy(&self) -> String {
        let buffer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for TeeBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
