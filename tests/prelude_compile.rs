//! Compile-time prelude coverage test.
use std::time::Duration;
use tower::{service_fn, ServiceExt};
use waypoint::prelude::*;
use waypoint::ChannelService;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let _backoff = Backoff::fibonacci(Duration::from_millis(100));
    let _jitter = Jitter::None;
    let _options = SelfRefreshingOptions::default().with_refresh(RetryPolicy::refresh_default());

    let echo = ServiceDescriptor::new("echo").shared();
    let router = Router::for_servers(vec![Server::from_service(
        echo.clone(),
        service_fn(|req: Request| async move {
            Ok::<Response, std::io::Error>(req.into_payload())
        }),
    )])
    .expect("router");

    let reply = ChannelService::new(router.clone())
        .oneshot((Trace::new(), Request::new(echo, b"via tower".to_vec())))
        .await
        .expect("tower call failed");
    assert_eq!(reply, b"via tower".to_vec());

    router.close();
    let _closed: RouteError = RouteError::RouterClosed;
}
