use discovery_core::{
    DiscoveryConfig, RegistrationOptions, ServiceDiscovery, ServiceEvent, ServiceInstance,
    ServiceStatus,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn fast() -> RegistrationOptions {
    RegistrationOptions {
        health_check_interval: Some(Duration::from_millis(100)),
        ttl: None,
    }
}

async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

fn record(discovery: &ServiceDiscovery, service: &str) -> Arc<Mutex<Vec<ServiceEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    discovery.watch_service(service, move |event, _| {
        sink.lock().unwrap().push(event);
        Ok(())
    });
    seen
}

// ---------------------------------------------------------------------------
// Health checking over HTTP
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_scenario_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let _health = server
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;

    let discovery = ServiceDiscovery::new(DiscoveryConfig::default()).unwrap();
    discovery.start().unwrap();

    assert!(discovery.register_service(ServiceInstance::new("svc-a", "cache", "10.0.0.1", 6379)));
    assert_eq!(
        discovery.get_service_status("svc-a"),
        Some(ServiceStatus::Healthy)
    );

    let svc_b = ServiceInstance::new("svc-b", "cache", "10.0.0.2", 6379)
        .with_health_check(format!("{}/health", server.url()));
    assert!(discovery.register_service_with(svc_b, fast()));

    assert!(
        wait_for(Duration::from_secs(5), || {
            discovery.get_service_status("svc-b") == Some(ServiceStatus::Healthy)
        })
        .await
    );

    let healthy = discovery.discover_services("cache", true);
    assert_eq!(healthy.len(), 2);
    assert!(healthy
        .iter()
        .all(|i| discovery.get_service_status(&i.service_id) == Some(ServiceStatus::Healthy)));

    discovery.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_endpoint_notifies_unhealthy_once() {
    let mut server = mockito::Server::new_async().await;
    let ok = server
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;

    let discovery = ServiceDiscovery::new(DiscoveryConfig::default()).unwrap();
    let seen = record(&discovery, "worker");
    discovery.start().unwrap();

    let instance = ServiceInstance::new("w-1", "worker", "127.0.0.1", 9000)
        .with_health_check(format!("{}/health", server.url()));
    assert!(discovery.register_service_with(instance, fast()));

    assert!(
        wait_for(Duration::from_secs(5), || {
            discovery.get_service_status("w-1") == Some(ServiceStatus::Healthy)
        })
        .await
    );

    ok.remove_async().await;
    let failing = server
        .mock("GET", "/health")
        .with_status(503)
        .expect_at_least(3)
        .create_async()
        .await;

    assert!(
        wait_for(Duration::from_secs(5), || {
            discovery.get_service_status("w-1") == Some(ServiceStatus::Unhealthy)
        })
        .await
    );
    // Let several more failing probes run.
    tokio::time::sleep(Duration::from_millis(400)).await;
    failing.assert_async().await;

    assert!(discovery.get_healthy_instance("worker").is_none());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ServiceEvent::Registered,
            ServiceEvent::Healthy,
            ServiceEvent::Unhealthy
        ]
    );

    discovery.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_is_unhealthy() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let discovery = ServiceDiscovery::new(DiscoveryConfig::default()).unwrap();
    discovery.start().unwrap();

    let instance = ServiceInstance::new("w-2", "worker", "127.0.0.1", port)
        .with_health_check(format!("http://127.0.0.1:{port}/health"));
    assert!(discovery.register_service_with(instance, fast()));

    assert!(
        wait_for(Duration::from_secs(5), || {
            discovery.get_service_status("w-2") == Some(ServiceStatus::Unhealthy)
        })
        .await
    );
    discovery.stop();
}

// ---------------------------------------------------------------------------
// Expiry sweep
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_instance_expires_after_ttl() {
    let config = DiscoveryConfig {
        expiry_sweep_interval_secs: 1,
        ..Default::default()
    };
    let discovery = ServiceDiscovery::new(config).unwrap();
    let mut changes = discovery.subscribe();
    discovery.start().unwrap();

    let short_ttl = RegistrationOptions {
        ttl: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    assert!(discovery.register_service_with(
        ServiceInstance::new("svc-a", "cache", "10.0.0.1", 6379),
        short_ttl
    ));
    let keep = ServiceInstance::new("svc-keep", "cache", "10.0.0.5", 6379);
    assert!(discovery.register_service(keep));

    assert!(
        wait_for(Duration::from_secs(5), || {
            discovery.get_service_by_id("svc-a").is_none()
        })
        .await
    );
    assert!(discovery
        .discover_services("cache", false)
        .iter()
        .all(|i| i.service_id != "svc-a"));
    assert!(discovery.get_service_by_id("svc-keep").is_some());

    let mut deregistered = false;
    while let Ok(change) = changes.try_recv() {
        if change.event == ServiceEvent::Deregistered && change.instance.service_id == "svc-a" {
            deregistered = true;
        }
    }
    assert!(deregistered);

    discovery.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeats_keep_instance_alive() {
    let config = DiscoveryConfig {
        expiry_sweep_interval_secs: 1,
        ..Default::default()
    };
    let discovery = ServiceDiscovery::new(config).unwrap();
    discovery.start().unwrap();

    let options = RegistrationOptions {
        ttl: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    assert!(discovery.register_service_with(
        ServiceInstance::new("svc-a", "cache", "10.0.0.1", 6379),
        options
    ));

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(discovery.heartbeat("svc-a"));
    }
    assert!(discovery.get_service_by_id("svc-a").is_some());
    discovery.stop();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn from_config_file_applies_yaml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("discovery.yaml");
    std::fs::write(&path, "ttl_secs: 45\nhealth_check_interval_secs: 7\n").unwrap();

    let discovery = ServiceDiscovery::from_config_file(&path).unwrap();
    assert_eq!(discovery.config().ttl_secs, 45);
    assert_eq!(discovery.config().health_check_interval_secs, 7);

    discovery.register_service(ServiceInstance::new("svc-a", "cache", "10.0.0.1", 6379));
    let listed = discovery.list_services();
    assert_eq!(listed["cache"][0].ttl_secs, 45);
}

#[test]
fn from_config_file_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("discovery.yaml");
    std::fs::write(&path, "probe_timeout_ms: 0\n").unwrap();
    assert!(ServiceDiscovery::from_config_file(&path).is_err());
}
