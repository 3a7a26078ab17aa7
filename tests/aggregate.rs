mod common;

use common::{leaf, request, svc, Recording, ScriptedProvider};
use waypoint::{
    ConfigError, RetryPolicy, RouteState, Router, SelfRefreshingRouter, Server, ServiceDescriptor,
    Trace,
};

#[tokio::test]
async fn aggregate_dispatches_by_name_and_closes_with_any_downstream() {
    let a = Recording::new("a");
    let b = Recording::new("b");
    let router_a = leaf(&a, "foo");
    let router_b = leaf(&b, "bar");
    let aggregate = Router::for_routers(vec![router_a.clone(), router_b.clone()]).unwrap();
    let trace = Trace::new();

    let reply = aggregate.call(&trace, request(&svc("foo"), b"1")).await.unwrap();
    assert_eq!(reply, b"a:1".to_vec());
    let reply = aggregate.call(&trace, request(&svc("bar"), b"2")).await.unwrap();
    assert_eq!(reply, b"b:2".to_vec());

    let err = aggregate.call(&trace, request(&svc("baz"), b"3")).await.unwrap_err();
    assert!(err.is_service_not_found());
    assert_eq!(err.service(), Some("baz"));

    router_b.close();

    assert!(aggregate.is_closed());
    assert!(!router_a.is_closed(), "close only cascades upward");
    let err = aggregate.call(&trace, request(&svc("foo"), b"4")).await.unwrap_err();
    assert!(err.is_router_closed());
    assert_eq!(a.count(), 1);
    assert_eq!(b.count(), 1);
}

#[tokio::test]
async fn for_servers_builds_one_route_per_server() {
    let foo = Recording::new("foo");
    let bar = Recording::new("bar");
    let baz = Recording::new("baz");
    let router = Router::for_servers(vec![
        Server::new(svc("foo"), foo.clone()),
        Server::new(svc("bar"), bar.clone()),
        Server::new(svc("baz"), baz.clone()),
    ])
    .unwrap();

    let names: Vec<&str> = router.services().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["foo", "bar", "baz"]);

    for (name, channel) in [("foo", &foo), ("bar", &bar), ("baz", &baz)] {
        router.call(&Trace::new(), request(&svc(name), name.as_bytes())).await.unwrap();
        assert_eq!(channel.payloads(), vec![name.as_bytes().to_vec()]);
    }
}

#[test]
fn for_servers_rejects_duplicate_services() {
    let err = Router::for_servers(vec![
        Server::new(svc("foo"), Recording::new("a")),
        Server::new(svc("foo"), Recording::new("b")),
    ])
    .unwrap_err();
    assert_eq!(err, ConfigError::DuplicateService { name: "foo".into() });
}

#[test]
fn alias_collisions_are_duplicates() {
    let a = leaf(&Recording::new("a"), "foo");
    let b = Router::for_channel(
        Recording::new("b"),
        vec![ServiceDescriptor::new("bar").with_alias("legacy", "bar").shared()],
    )
    .unwrap();
    let c = Router::for_channel(
        Recording::new("c"),
        vec![ServiceDescriptor::new("qux").with_alias("legacy", "qux").shared()],
    )
    .unwrap();

    assert!(Router::for_routers(vec![a.clone(), b.clone()]).is_ok());
    let err = Router::for_routers(vec![a, b, c]).unwrap_err();
    assert_eq!(err, ConfigError::DuplicateService { name: "legacy".into() });
}

#[tokio::test]
async fn request_matching_two_downstreams_is_ambiguous() {
    let a = Recording::new("a");
    let b = Recording::new("b");
    let aggregate = Router::for_routers(vec![leaf(&a, "foo"), leaf(&b, "bar")]).unwrap();

    let both = ServiceDescriptor::new("foo").with_alias("bar", "foo").shared();
    let err = aggregate.call(&Trace::new(), request(&both, b"x")).await.unwrap_err();

    assert!(err.is_ambiguous());
    assert_eq!(err.service(), Some("foo"));
    assert_eq!(err.colliding_names(), Some(&["foo".to_string(), "bar".to_string()][..]));
    assert_eq!(a.count() + b.count(), 0, "ambiguous calls are never forwarded");
}

#[tokio::test]
async fn alias_routes_to_its_single_owner() {
    let a = Recording::new("a");
    let b = Recording::new("b");
    let aggregate = Router::for_routers(vec![leaf(&a, "foo"), leaf(&b, "bar")]).unwrap();

    let renamed = ServiceDescriptor::new("foo-v2").with_alias("foo", "foo-v2").shared();
    let reply = aggregate.call(&Trace::new(), request(&renamed, b"x")).await.unwrap();

    assert_eq!(reply, b"a:x".to_vec());
    assert_eq!(a.seen()[0].service, "foo-v2");
}

#[tokio::test]
async fn nested_aggregates_close_bottom_up() {
    let leaf_a = leaf(&Recording::new("a"), "foo");
    let leaf_b = leaf(&Recording::new("b"), "bar");
    let leaf_c = leaf(&Recording::new("c"), "baz");
    let inner = Router::for_routers(vec![leaf_a.clone(), leaf_b]).unwrap();
    let outer = Router::for_routers(vec![inner.router().clone(), leaf_c.clone()]).unwrap();

    let reply = outer.call(&Trace::new(), request(&svc("bar"), b"deep")).await.unwrap();
    assert_eq!(reply, b"b:deep".to_vec());

    leaf_a.close();

    assert!(inner.is_closed());
    assert!(outer.is_closed());
    assert!(!leaf_c.is_closed());
}

#[tokio::test]
async fn closing_the_aggregate_leaves_downstreams_usable() {
    let a = Recording::new("a");
    let router_a = leaf(&a, "foo");
    let aggregate = Router::for_routers(vec![router_a.clone()]).unwrap();

    aggregate.close();

    assert!(!router_a.is_closed());
    let reply = router_a.call(&Trace::new(), request(&svc("foo"), b"direct")).await.unwrap();
    assert_eq!(reply, b"a:direct".to_vec());
    router_a.close();
    assert!(aggregate.is_closed());
}

#[tokio::test]
async fn self_refreshing_downstream_keeps_the_aggregate_open() {
    let first = Recording::new("first");
    let second = Recording::new("second");
    let other = Recording::new("other");
    let first_route = leaf(&first, "foo");
    let provider = ScriptedProvider::new(vec![common::up(&leaf(&second, "foo"))]);
    let refreshing =
        SelfRefreshingRouter::new(first_route.clone(), provider, RetryPolicy::refresh_default())
            .unwrap();
    let aggregate =
        Router::for_routers(vec![refreshing.router().clone(), leaf(&other, "bar")]).unwrap();

    first_route.close();
    common::settle().await;

    assert!(!aggregate.is_closed(), "refreshing routers absorb delegate loss");
    assert_eq!(refreshing.state(), RouteState::Active);
    let reply = aggregate.call(&Trace::new(), request(&svc("foo"), b"again")).await.unwrap();
    assert_eq!(reply, b"second:again".to_vec());

    refreshing.close();
    assert!(aggregate.is_closed());
}
