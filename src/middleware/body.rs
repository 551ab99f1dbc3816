use std::{
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::Full;
use pin_project_lite::pin_project;

use super::finalize::{panic_cause, panic_description, Completion, Finalizer};
use crate::writer::{TeeBuffer, WrapResponseWriter};

/// Captured response bodies at or above this size are left out of logs and
/// spans.
pub const MAX_LOGGED_RESPONSE_BODY: usize = 100 * 1024;

pin_project! {
    /// Request body handed to the wrapped service: either the original
    /// stream, or the bytes the middleware already read for logging.
    pub struct RequestBody<B> {
        #[pin]
        kind: RequestKind<B>,
    }
}

pin_project! {
    #[project = RequestKindProj]
    enum RequestKind<B> {
        Buffered { body: Full<Bytes> },
        Streaming { #[pin] body: B },
    }
}

impl<B> RequestBody<B> {
    pub(crate) fn streaming(body: B) -> Self {
        Self {
            kind: RequestKind::Streaming { body },
        }
    }

    pub(crate) fn buffered(bytes: Bytes) -> Self {
        Self {
            kind: RequestKind::Buffered {
                body: Full::new(bytes),
            },
        }
    }
}

impl<B> Body for RequestBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().kind.project() {
            RequestKindProj::Buffered { body } => {
                Pin::new(body).poll_frame(cx).map_err(|never| match never {})
            }
            RequestKindProj::Streaming { body } => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            RequestKind::Buffered { body } => body.is_end_stream(),
            RequestKind::Streaming { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            RequestKind::Buffered { body } => body.size_hint(),
            RequestKind::Streaming { body } => body.size_hint(),
        }
    }
}

pin_project! {
    /// Response body produced by the middleware.
    ///
    /// Data frames of the wrapped body go through the request's response
    /// writer before reaching the client. The request is finalized once the
    /// body ends, fails, or is dropped. A panic while polling the wrapped body
    /// finishes the request as `500` before it resumes unwinding.
    pub struct ResponseBody<B> {
        #[pin]
        kind: ResponseKind<B>,
        telemetry: Option<ResponseTelemetry>,
    }
}

pin_project! {
    #[project = ResponseKindProj]
    enum ResponseKind<B> {
        Inner { #[pin] body: B },
        Problem { body: Full<Bytes> },
    }
}

impl<B> ResponseBody<B> {
    pub(crate) fn observed(body: B, telemetry: ResponseTelemetry) -> Self {
        Self {
            kind: ResponseKind::Inner { body },
            telemetry: Some(telemetry),
        }
    }

    pub(crate) fn problem(bytes: Bytes) -> Self {
        Self {
            kind: ResponseKind::Problem {
                body: Full::new(bytes),
            },
            telemetry: None,
        }
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            if let Some(data) = this
                .telemetry
                .as_mut()
                .and_then(|telemetry| telemetry.writer.sink().take_data())
            {
                return Poll::Ready(Some(Ok(Frame::data(data))));
            }

            let frame = match this.kind.as_mut().project() {
                ResponseKindProj::Inner { body } => {
                    match panic::catch_unwind(AssertUnwindSafe(|| body.poll_frame(cx))) {
                        Ok(poll) => ready!(poll),
                        Err(payload) => {
                            if let Some(telemetry) = this.telemetry.as_mut() {
                                let cause = panic_cause(payload.as_ref());
                                telemetry.complete(
                                    Some(StatusCode::INTERNAL_SERVER_ERROR),
                                    Some(panic_description(&cause)),
                                );
                            }
                            panic::resume_unwind(payload);
                        }
                    }
                }
                ResponseKindProj::Problem { body } => {
                    ready!(Pin::new(body).poll_frame(cx)).map(|frame| match frame {
                        Ok(frame) => Ok(frame),
                        Err(never) => match never {},
                    })
                }
            };

            let Some(telemetry) = this.telemetry.as_mut() else {
                return Poll::Ready(frame);
            };

            match frame {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        if let Err(err) = telemetry.writer.write(data.clone()) {
                            tracing::debug!(%err, "response writer failed, forwarding frame");
                            return Poll::Ready(Some(Ok(Frame::data(data))));
                        }
                    }
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                Some(Err(err)) => {
                    telemetry.complete(None, Some(err.to_string()));
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    telemetry.complete(None, None);
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        if self
            .telemetry
            .as_ref()
            .is_some_and(|telemetry| telemetry.writer.is_discarding())
        {
            return SizeHint::default();
        }

        match &self.kind {
            ResponseKind::Inner { body } => body.size_hint(),
            ResponseKind::Problem { body } => body.size_hint(),
        }
    }
}

/// Response side of an in-flight request: the writer observing the body and
/// the pending finalization.
pub(crate) struct ResponseTelemetry {
    writer: Box<dyn WrapResponseWriter>,
    tee: Option<TeeBuffer>,
    finalizer: Option<Finalizer>,
}

impl ResponseTelemetry {
    pub(crate) fn new(
        writer: Box<dyn WrapResponseWriter>,
        tee: Option<TeeBuffer>,
        finalizer: Finalizer,
    ) -> Self {
        Self {
            writer,
            tee,
            finalizer: Some(finalizer),
        }
    }

    /// Finishes the request with the writer's status unless `status`
    /// overrides it.
    fn complete(&mut self, status: Option<StatusCode>, error: Option<String>) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };

        let bytes_written = self.writer.bytes_written();
        let response_body = self
            .tee
            .as_ref()
            .filter(|_| bytes_written < MAX_LOGGED_RESPONSE_BODY)
            .map(TeeBuffer::to_string_lossy);

        finalizer.finish(Completion {
            status: status.unwrap_or_else(|| self.writer.status()).as_u16(),
            error,
            response_size: bytes_written as u64,
            response_body,
        });
    }
}

impl Drop for ResponseTelemetry {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.complete(
                Some(StatusCode::INTERNAL_SERVER_ERROR),
                Some("panicked while streaming the response".to_owned()),
            );
        } else {
            self.complete(None, None);
        }
    }
}

/// JSON problem response with an empty writer chain.
pub(crate) fn problem_response<B>(
    status: StatusCode,
    problem: &serde_json::Value,
) -> Response<ResponseBody<B>> {
    let bytes = serde_json::to_vec(problem).unwrap_or_default();
    let mut response = Response::new(ResponseBody::problem(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use http_body_util::{BodyExt, StreamBody};

    use super::*;

    #[tokio::test]
    async fn buffered_request_body_replays_bytes() {
        let body = RequestBody::<Full<Bytes>>::buffered(Bytes::from_static(b"{\"a\":1}"));

        assert_eq!(body.size_hint().exact(), Some(7));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"{\"a\":1}"));
    }

    #[tokio::test]
    async fn streaming_request_body_passes_through() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::convert::Infallible>(Frame::data(Bytes::from_static(b"ab"))),
            Ok(Frame::data(Bytes::from_static(b"cd"))),
        ]);
        let body = RequestBody::streaming(StreamBody::new(chunks));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn problem_response_is_json() {
        let response = problem_response::<Full<Bytes>>(
            StatusCode::UNPROCESSABLE_ENTITY,
            &serde_json::json!({ "title": "Failed to read request body" }),
        );

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["title"], "Failed to read request body");
    }
}
