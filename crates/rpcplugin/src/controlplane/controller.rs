//! Minimal implementation of go-plugin's shutdown controller service.
//!
//! go-plugin clients do not signal their plugins to exit; they call a
//! dedicated `plugin.GRPCController/Shutdown` RPC and hang for two seconds
//! whenever a server does not implement it. Registering this service when
//! the client looks like that dialect avoids the hang.
//!
//! The schema is a single method over an empty message, so the prost types
//! and the tonic service glue are maintained by hand here rather than
//! generated.

use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_util::sync::CancellationToken;
use tonic::codegen::http;
use tonic::codegen::{empty_body, Body, BoxFuture, Service, StdError};
use tonic::server::NamedService;

/// Fully-qualified method path of the shutdown RPC.
const SHUTDOWN_PATH: &str = "/plugin.GRPCController/Shutdown";

/// Empty request and response payload of the shutdown RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

/// Handler interface for the shutdown controller service.
#[tonic::async_trait]
pub trait GrpcController: Send + Sync + 'static {
    /// Ask the server to finish in-flight requests and exit.
    async fn shutdown(
        &self,
        request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;
}

/// The handler wired into plugin servers: shutdown fires the lifecycle's
/// cancellation token.
pub(crate) struct ShutdownController {
    done: CancellationToken,
}

impl ShutdownController {
    pub(crate) fn new(done: CancellationToken) -> Self {
        Self { done }
    }
}

#[tonic::async_trait]
impl GrpcController for ShutdownController {
    async fn shutdown(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        self.done.cancel();
        Ok(tonic::Response::new(Empty {}))
    }
}

/// gRPC server wrapper exposing a [`GrpcController`] implementation.
pub struct GrpcControllerServer<T> {
    inner: Arc<T>,
}

impl<T> GrpcControllerServer<T> {
    /// Wrap a handler.
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl<T> Clone for GrpcControllerServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, B> Service<http::Request<B>> for GrpcControllerServer<T>
where
    T: GrpcController,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            SHUTDOWN_PATH => {
                struct ShutdownSvc<T>(Arc<T>);

                impl<T: GrpcController> tonic::server::UnaryService<Empty> for ShutdownSvc<T> {
                    type Response = Empty;
                    type Future = BoxFuture<tonic::Response<Empty>, tonic::Status>;

                    fn call(&mut self, request: tonic::Request<Empty>) -> Self::Future {
                        let inner = Arc::clone(&self.0);
                        Box::pin(async move { inner.shutdown(request).await })
                    }
                }

                let inner = Arc::clone(&self.inner);
                Box::pin(async move {
                    let method = ShutdownSvc(inner);
                    let codec = tonic::codec::ProstCodec::default();
                    let mut grpc = tonic::server::Grpc::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            }
            _ => Box::pin(async move {
                Ok(http::Response::builder()
                    .status(http::StatusCode::OK)
                    .header("grpc-status", tonic::Code::Unimplemented as i32)
                    .header(http::header::CONTENT_TYPE, "application/grpc")
                    .body(empty_body())
                    .expect("static response parts are valid"))
            }),
        }
    }
}

impl<T: GrpcController> NamedService for GrpcControllerServer<T> {
    const NAME: &'static str = "plugin.GRPCController";
}

/// Client stub for the shutdown controller, used to drive go-plugin
/// compatible servers (and this crate's own tests).
#[derive(Debug, Clone)]
pub struct GrpcControllerClient {
    inner: tonic::client::Grpc<tonic::transport::Channel>,
}

impl GrpcControllerClient {
    /// Bind the stub to an open channel.
    #[must_use]
    pub fn new(channel: tonic::transport::Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Call `plugin.GRPCController/Shutdown`.
    ///
    /// # Errors
    ///
    /// Returns the gRPC [`tonic::Status`] if the channel is not ready or
    /// the call fails.
    pub async fn shutdown(&mut self) -> Result<tonic::Response<Empty>, tonic::Status> {
        self.inner.ready().await.map_err(|error| {
            tonic::Status::unknown(format!("service was not ready: {error}"))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(SHUTDOWN_PATH);
        self.inner
            .unary(tonic::Request::new(Empty {}), path, codec)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_handler_cancels_token() {
        let done = CancellationToken::new();
        let handler = ShutdownController::new(done.clone());
        let response = handler
            .shutdown(tonic::Request::new(Empty {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner(), Empty {});
        assert!(done.is_cancelled());
    }

    #[test]
    fn test_service_name_matches_go_plugin_namespace() {
        assert_eq!(
            <GrpcControllerServer<ShutdownController> as NamedService>::NAME,
            "plugin.GRPCController"
        );
    }
}
