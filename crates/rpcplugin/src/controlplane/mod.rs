//! Control-plane services registered alongside the caller's services.
//!
//! Every plugin server carries a standard gRPC health service reporting
//! status for the well-known service name `"plugin"` (a constant inherited
//! for wire compatibility with go-plugin). Clients probe it to detect hung
//! plugins.
//!
//! When the client looks like the go-plugin dialect, the server additionally
//! registers that dialect's shutdown controller service; see
//! [`controller`].

pub mod controller;

use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

use self::controller::{GrpcControllerServer, ShutdownController};

/// Well-known service name under which health status is reported.
///
/// Ideally this would be called `rpcplugin`, but the name is inherited from
/// go-plugin to retain wire compatibility.
pub const CONTROL_SERVICE_NAME: &str = "plugin";

/// Register the control-plane services into the route set.
///
/// The health service always reports `SERVING` from this point until the
/// returned reporter is told otherwise. The shutdown controller is
/// registered only when a cancellation token is supplied, which the server
/// lifecycle does exactly when the client looks like the go-plugin dialect.
pub(crate) async fn register(
    routes: &mut RoutesBuilder,
    shutdown: Option<CancellationToken>,
) -> HealthReporter {
    let (mut reporter, health_service) = tonic_health::server::health_reporter();
    reporter
        .set_service_status(CONTROL_SERVICE_NAME, ServingStatus::Serving)
        .await;
    routes.add_service(health_service);

    if let Some(done) = shutdown {
        routes.add_service(GrpcControllerServer::new(ShutdownController::new(done)));
    }

    reporter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_health_only() {
        let mut routes = RoutesBuilder::default();
        let _reporter = register(&mut routes, None).await;
    }

    #[tokio::test]
    async fn test_register_with_shutdown_controller() {
        let mut routes = RoutesBuilder::default();
        let done = CancellationToken::new();
        let _reporter = register(&mut routes, Some(done.clone())).await;
        assert!(!done.is_cancelled());
    }
}
