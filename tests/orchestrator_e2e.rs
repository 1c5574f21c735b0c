//! End-to-end startup against the in-memory runtime.
//!
//! Exercises the whole start sequence (image check, pull, port allocation,
//! create, start, inspect, wait) and the handle returned from it, without a
//! Docker daemon. Host ports are real listeners, so host reachability is
//! checked for real.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use testbay::runtime::{ExecResult, RepoTag};
use testbay::testing::FakeRuntime;
use testbay::{
    ContainerRequest, Error, HarnessConfig, HealthCheck, HealthStatus, HostPort, Orchestrator,
    PortAllocator, RemoveOptions, RuntimeError, StopOptions, WaitStrategy,
};
use testbay::runtime::ContainerRuntime;

fn harness(runtime: &FakeRuntime, allocator: &PortAllocator) -> Orchestrator {
    Orchestrator::new(Arc::new(runtime.clone()))
        .with_allocator(allocator.clone())
        .with_config(HarnessConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
}

fn is_listen_table_check(cmd: &[String]) -> bool {
    cmd.last().is_some_and(|c| c.contains("/proc/net/tcp"))
}

#[tokio::test]
async fn start_resolves_once_ports_open_after_two_polls() {
    let runtime = FakeRuntime::new();
    let polls = Arc::new(AtomicUsize::new(0));
    let seen = polls.clone();
    runtime.on_exec(move |cmd| {
        let poll = if is_listen_table_check(cmd) {
            seen.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            seen.load(Ordering::SeqCst)
        };
        ExecResult {
            output: String::new(),
            exit_code: if poll > 2 { 0 } else { 1 },
        }
    });
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(polls.load(Ordering::SeqCst), 3);

    let host_port = container.mapped_port(8080).unwrap();
    assert_eq!(
        container.bound_ports().host_ports().collect::<Vec<_>>(),
        vec![HostPort::new(host_port).unwrap()]
    );
    assert!(allocator.is_reserved(HostPort::new(host_port).unwrap()));
    assert_eq!(container.host(), "127.0.0.1");
    assert!(
        tokio::net::TcpStream::connect(("127.0.0.1", host_port))
            .await
            .is_ok()
    );

    let calls = runtime.calls();
    assert_eq!(calls[0], "list_repo_tags");
    assert_eq!(calls[1], "pull_image app:latest");
    assert_eq!(calls[2], "create_container");
    assert!(calls[3].starts_with("start_container "));
    assert!(calls[4].starts_with("inspect_container "));

    container.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn unhealthy_health_check_is_fatal_not_timeout() {
    let runtime = FakeRuntime::new().with_initial_health(HealthStatus::Unhealthy);
    let allocator = PortAllocator::new();

    let started = Instant::now();
    let err = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("db")
                .with_health_check(HealthCheck::new("pg_isready").with_retries(3))
                .with_wait_strategy(WaitStrategy::for_health_check())
                .with_startup_timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(err.is_fatal(), "expected fatal, got {err}");
    assert!(!err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));

    // Left in place for inspection.
    let ids = runtime.container_ids();
    assert_eq!(ids.len(), 1);
    assert!(runtime.is_running(&ids[0]));
    assert!(!runtime.calls().iter().any(|c| c.starts_with("remove_container")));
}

#[tokio::test]
async fn timeout_names_pending_probes_and_releases_ports() {
    let runtime = FakeRuntime::new();
    runtime.on_exec(|_| ExecResult {
        output: String::new(),
        exit_code: 1,
    });
    let allocator = PortAllocator::new();

    let err = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("slow")
                .with_exposed_ports([5432])
                .with_startup_timeout(Duration::from_millis(300))
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {err}");
    let message = err.to_string();
    assert!(message.contains("internal port listening"), "{message}");
    assert!(!message.contains("host port reachability"), "{message}");

    let ids = runtime.container_ids();
    assert_eq!(ids.len(), 1);
    let options = runtime.create_options(&ids[0]).unwrap();
    let host = options.bound_ports.host_ports().next().unwrap();
    assert!(!allocator.is_reserved(host));
}

#[tokio::test]
async fn local_image_is_not_pulled() {
    let runtime = FakeRuntime::new().with_image(RepoTag::new("redis", "7"));
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(ContainerRequest::builder("redis:7").build().unwrap())
        .await
        .unwrap();

    assert!(!runtime.calls().iter().any(|c| c.starts_with("pull_image")));

    let id = container.id().clone();
    container
        .remove(RemoveOptions {
            remove_volumes: false,
        })
        .await
        .unwrap();
    assert_eq!(
        runtime.calls().last().unwrap(),
        &format!("remove_container {} volumes=false", id)
    );
}

#[tokio::test]
async fn pull_failure_aborts_before_create() {
    let runtime = FakeRuntime::new().with_pull_failure("unauthorized");
    let allocator = PortAllocator::new();

    let err = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("private/app")
                .with_auth("bot", "secret", "registry.example.com")
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Runtime(RuntimeError::ImagePullFailed { .. })
    ));
    assert!(!runtime.calls().iter().any(|c| c == "create_container"));
}

#[tokio::test]
async fn start_failure_propagates_and_releases_ports() {
    let runtime = FakeRuntime::new().with_start_failure("no space left on device");
    let allocator = PortAllocator::new();

    let err = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([80, 443])
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Runtime(RuntimeError::ContainerStartFailed { .. })
    ));
    let ids = runtime.container_ids();
    let options = runtime.create_options(&ids[0]).unwrap();
    for host in options.bound_ports.host_ports() {
        assert!(!allocator.is_reserved(host));
    }
}

#[tokio::test]
async fn unexposed_port_lookup_is_config_error() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let err = container.mapped_port(9999).unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("9999"));

    container.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn fixed_port_mapping_is_used_as_given() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();
    // A port that is free right now, from an allocator the harness doesn't share.
    let fixed = PortAllocator::new().allocate_one().await.unwrap();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("web")
                .with_exposed_port_mapping(80, fixed.get())
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(container.mapped_port(80).unwrap(), fixed.get());
    assert!(!allocator.is_reserved(fixed));
    container.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn stop_removes_container_and_releases_ports() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .with_name("stop-me")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    let id = container.id().clone();
    let host = HostPort::new(container.mapped_port(8080).unwrap()).unwrap();

    let stopped = container
        .stop(StopOptions {
            timeout: Duration::from_secs(3),
            remove_volumes: true,
        })
        .await
        .unwrap();

    assert_eq!(stopped.name(), "stop-me");
    assert_eq!(stopped.id(), &id);
    assert!(runtime.container_ids().is_empty());
    assert!(!allocator.is_reserved(host));

    let calls = runtime.calls();
    let n = calls.len();
    assert_eq!(calls[n - 2], format!("stop_container {} 3s", id));
    assert_eq!(calls[n - 1], format!("remove_container {} volumes=true", id));
}

#[tokio::test]
async fn stop_of_vanished_container_still_releases_ports() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    let host = HostPort::new(container.mapped_port(8080).unwrap()).unwrap();

    // Someone else removed it behind our back.
    runtime
        .remove_container(container.id(), true)
        .await
        .unwrap();

    let err = container.stop(StopOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Runtime(RuntimeError::NotFound { .. })
    ));
    assert!(!allocator.is_reserved(host));
}

#[tokio::test]
async fn remove_of_vanished_container_still_releases_ports() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([80, 443])
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    let hosts: Vec<HostPort> = container.bound_ports().host_ports().collect();

    runtime
        .remove_container(container.id(), true)
        .await
        .unwrap();

    assert!(container.remove(RemoveOptions::default()).await.is_err());
    for host in hosts {
        assert!(!allocator.is_reserved(host));
    }
}

#[tokio::test]
async fn start_waits_for_host_ports_to_open() {
    // Internal checks pass from the first poll; host listeners only open on
    // the second exec, so the host check holds startup back.
    let runtime = FakeRuntime::new().with_host_listeners_after_execs(2);
    let allocator = PortAllocator::new();

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    // The internal check is ready on poll 1, so every later poll was spent
    // waiting on refused host connections.
    let polls = runtime
        .exec_calls()
        .iter()
        .filter(|cmd| is_listen_table_check(cmd))
        .count();
    assert!(polls >= 2, "ready after {polls} polls");
    assert!(
        tokio::net::TcpStream::connect(("127.0.0.1", container.mapped_port(8080).unwrap()))
            .await
            .is_ok()
    );

    container.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn host_ports_that_never_open_time_out() {
    let runtime = FakeRuntime::new().without_host_listeners();
    let allocator = PortAllocator::new();

    let err = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .with_startup_timeout(Duration::from_millis(300))
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {err}");
    let message = err.to_string();
    assert!(message.contains("host port reachability"), "{message}");
    assert!(!message.contains("internal port listening"), "{message}");
}

#[tokio::test]
async fn log_message_wait_sees_output_after_start() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();

    let writer = runtime.clone();
    tokio::spawn(async move {
        let id = loop {
            if let Some(id) = writer.container_ids().into_iter().next() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let logs = writer.log_sender(&id);
        logs.send("booting\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        logs.send("listening on :8080\n");
    });

    let container = harness(&runtime, &allocator)
        .start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080])
                .with_wait_strategy(WaitStrategy::for_log_message("listening on").unwrap())
                .with_startup_timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let state = container.inspect().await.unwrap();
    assert!(state.running);
    container.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn attach_by_name_reads_published_ports() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();
    let orchestrator = harness(&runtime, &allocator);

    let started = orchestrator
        .start(
            ContainerRequest::builder("cache")
                .with_exposed_ports([6379])
                .with_name("shared-cache")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let attached = orchestrator
        .attach_by_name("shared-cache")
        .await
        .unwrap()
        .expect("container should be found");
    assert_eq!(attached.id(), started.id());
    assert_eq!(
        attached.mapped_port(6379).unwrap(),
        started.mapped_port(6379).unwrap()
    );

    assert!(
        orchestrator
            .attach_by_name("no-such-container")
            .await
            .unwrap()
            .is_none()
    );

    attached.detach();
    started.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_get_distinct_ports() {
    let runtime = FakeRuntime::new();
    let allocator = PortAllocator::new();
    let orchestrator = harness(&runtime, &allocator);

    let starts = (0..4).map(|_| {
        orchestrator.start(
            ContainerRequest::builder("app")
                .with_exposed_ports([8080, 8081])
                .build()
                .unwrap(),
        )
    });
    let containers = futures::future::try_join_all(starts).await.unwrap();

    let mut ports: Vec<u16> = containers
        .iter()
        .flat_map(|c| c.bound_ports().host_ports().map(HostPort::get))
        .collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 8);

    for container in containers {
        container.stop(StopOptions::default()).await.unwrap();
    }
}
