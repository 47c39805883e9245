//! REST API integration tests for virtumancer.
//!
//! Every test runs the full service against its own `test://` driver.

mod common;

use std::time::Duration;

use futures::SinkExt;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use virtumancer::hub::{ServerMessage, Subject};
use virtumancer::model::{TaskState, VmState};
use virtumancer_hv::DomainState;
use virtumancer_hv::test_driver::{DEFAULT_DOMAIN_UUID, DEFAULT_URI, default_domain_spec};

use common::{TestServer, next_ws_json, wait_for_json, wait_for_message};

/// Import the default domain, powered off first when `stopped`.
async fn import_default(server: &TestServer, stopped: bool) -> Value {
    if stopped {
        server
            .hv_host(DEFAULT_URI)
            .set_domain_state(DEFAULT_DOMAIN_UUID, DomainState::Shutoff);
    }
    let response = server.post("/hosts/h1/vms/test/import").await;
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

async fn assert_error(response: reqwest::Response, status: u16, code: &str) {
    assert_eq!(response.status(), status);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], code, "unexpected body {}", body);
    assert!(body["error"].is_string());
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health() {
    let server = TestServer::spawn().await;

    let response = server.get("/health").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"ok": true}));

    server.shutdown().await;
}

// =============================================================================
// Hosts
// =============================================================================

#[tokio::test]
async fn test_add_host_connects() {
    let server = TestServer::with_default_host().await;

    let response = server.get("/hosts").await;
    assert_eq!(response.status(), 200);
    let hosts: Value = response.json().await.unwrap();
    let hosts = hosts.as_array().unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0]["id"], "h1");
    assert_eq!(hosts[0]["state"], "CONNECTED");
    assert_eq!(hosts[0]["auto_reconnect_disabled"], false);

    let info: Value = server.get("/hosts/h1/info").await.json().await.unwrap();
    assert!(info["node"]["cpus"].as_u64().unwrap() > 0);
    assert_eq!(info["host"]["id"], "h1");

    let stats: Value = server.get("/hosts/h1/stats").await.json().await.unwrap();
    assert!(stats["memory"]["total_kib"].as_u64().unwrap() > 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_host_conflicts() {
    let server = TestServer::with_default_host().await;

    let response = server
        .post_json("/hosts", &json!({"id": "h1", "uri": "test:///empty"}))
        .await;
    assert_error(response, 409, "CONFLICT").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_create_host_validation() {
    let server = TestServer::spawn().await;

    let response = server
        .post_json("/hosts", &json!({"id": " ", "uri": "test:///default"}))
        .await;
    assert_error(response, 400, "VALIDATION_ERROR").await;

    let response = server
        .post_json("/hosts", &json!({"id": "h1", "uri": "not a uri"}))
        .await;
    assert_error(response, 400, "VALIDATION_ERROR").await;

    let response = server
        .client
        .post(format!("{}/hosts", server.base_url()))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_error(response, 400, "BAD_REQUEST").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_host() {
    let server = TestServer::spawn().await;

    let response = server
        .post_json("/hosts", &json!({"id": "h2", "uri": "test:///nowhere"}))
        .await;
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "ERRORED");
    assert!(body["last_error"].is_string());

    assert_error(server.post("/hosts/h2/connect").await, 503, "HOST_DISCONNECTED").await;
    assert_error(server.get("/hosts/h2/info").await, 503, "HOST_DISCONNECTED").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_host() {
    let server = TestServer::spawn().await;

    assert_error(server.get("/hosts/nope").await, 404, "HOST_NOT_FOUND").await;
    assert_error(server.get("/hosts/nope/vms").await, 404, "HOST_NOT_FOUND").await;
    assert_error(server.post("/hosts/nope/vms/x/start").await, 404, "HOST_NOT_FOUND").await;
    assert_error(server.delete("/hosts/nope").await, 404, "HOST_NOT_FOUND").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_blank_path_param() {
    let server = TestServer::with_default_host().await;

    assert_error(server.get("/hosts/%20/vms").await, 400, "VALIDATION_ERROR").await;
    assert_error(
        server.post("/hosts/h1/vms/%20/start").await,
        400,
        "VALIDATION_ERROR",
    )
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_user_disconnect_and_forced_connect() {
    let server = TestServer::with_default_host().await;

    let response = server.post("/hosts/h1/disconnect").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "DISCONNECTED");
    assert_eq!(body["auto_reconnect_disabled"], true);

    // Backoff is in the tens of milliseconds; nothing may reconnect.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let body: Value = server.get("/hosts/h1").await.json().await.unwrap();
    assert_eq!(body["state"], "DISCONNECTED");
    assert_error(server.get("/hosts/h1/info").await, 503, "HOST_DISCONNECTED").await;

    let response = server.post("/hosts/h1/connect").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "CONNECTED");
    assert_eq!(body["auto_reconnect_disabled"], false);

    server.shutdown().await;
}

#[tokio::test]
async fn test_lost_connection_recovers() {
    let server = TestServer::with_default_host().await;
    let hv = server.hv_host(DEFAULT_URI);

    hv.fail_next_opens(2);
    hv.drop_connections();
    // The next call notices the loss.
    let _ = server.get("/hosts/h1/info").await;

    wait_for_json(&server, "/hosts/h1", Duration::from_secs(5), |h| {
        h["state"] == "CONNECTED"
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_patch_and_delete_host() {
    let server = TestServer::with_default_host().await;

    let response = server
        .patch_json("/hosts/h1", &json!({"uri": "test:///empty"}))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["uri"], "test:///empty");
    assert_eq!(body["state"], "CONNECTED");

    let response = server.patch_json("/hosts/h1", &json!({})).await;
    assert_error(response, 400, "VALIDATION_ERROR").await;

    let response = server.delete("/hosts/h1").await;
    assert_eq!(response.status(), 204);
    let hosts: Value = server.get("/hosts").await.json().await.unwrap();
    assert!(hosts.as_array().unwrap().is_empty());

    server.shutdown().await;
}

// =============================================================================
// Discovery & import
// =============================================================================

#[tokio::test]
async fn test_discover_and_import() {
    let server = TestServer::with_default_host().await;

    let response = server.get("/hosts/h1/discovered-vms").await;
    assert_eq!(response.status(), 200);
    let discovered: Value = response.json().await.unwrap();
    let discovered = discovered.as_array().unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0]["domain_uuid"], DEFAULT_DOMAIN_UUID);
    assert_eq!(discovered[0]["imported"], false);

    let vm = import_default(&server, false).await;
    assert_eq!(vm["name"], "test");
    assert_eq!(vm["domain_uuid"], DEFAULT_DOMAIN_UUID);
    assert_eq!(vm["state"], "ACTIVE");
    assert_eq!(vm["sync_status"], "SYNCED");

    assert_error(server.post("/hosts/h1/vms/test/import").await, 409, "CONFLICT").await;

    let discovered: Value = server.get("/hosts/h1/discovered-vms").await.json().await.unwrap();
    assert_eq!(discovered[0]["imported"], true);

    let vms: Value = server.get("/hosts/h1/vms").await.json().await.unwrap();
    assert_eq!(vms.as_array().unwrap().len(), 1);
    assert_eq!(vms[0]["imported"], true);
    assert_eq!(vms[0]["vm_uuid"], vm["uuid"]);

    let inventory: Value = server.get("/hosts/h1/inventory").await.json().await.unwrap();
    assert_eq!(inventory.as_array().unwrap().len(), 1);
    assert_eq!(inventory[0]["uuid"], vm["uuid"]);

    let hardware: Value = server.get("/hosts/h1/vms/test/hardware").await.json().await.unwrap();
    assert_eq!(hardware["devices"].as_array().unwrap().len(), 3);

    let extended: Value = server
        .get("/hosts/h1/vms/test/hardware/extended")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(extended["attachments"].as_array().unwrap().len(), 3);
    assert_eq!(extended["live"]["uuid"], DEFAULT_DOMAIN_UUID);

    server.shutdown().await;
}

#[tokio::test]
async fn test_vm_list_shows_live_domains_before_import() {
    let server = TestServer::with_default_host().await;

    let vms: Value = server.get("/hosts/h1/vms").await.json().await.unwrap();
    let vms = vms.as_array().unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0]["domain_uuid"], DEFAULT_DOMAIN_UUID);
    assert_eq!(vms[0]["name"], "test");
    assert_eq!(vms[0]["state"], "running");
    assert_eq!(vms[0]["imported"], false);
    assert!(vms[0].get("vm_uuid").is_none());

    import_default(&server, false).await;
    let mut extra = default_domain_spec();
    extra.name = "db".to_string();
    extra.uuid = "11111111-2222-3333-4444-555555555555".to_string();
    server.hv_host(DEFAULT_URI).add_domain(extra, DomainState::Shutoff);

    let vms: Value = server.get("/hosts/h1/vms").await.json().await.unwrap();
    let summary: Vec<_> = vms
        .as_array()
        .unwrap()
        .iter()
        .map(|d| (d["name"].clone(), d["state"].clone(), d["imported"].clone()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (json!("db"), json!("shutoff"), json!(false)),
            (json!("test"), json!("running"), json!(true)),
        ]
    );

    let inventory: Value = server.get("/hosts/h1/inventory").await.json().await.unwrap();
    assert_eq!(inventory.as_array().unwrap().len(), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_discovery_and_import() {
    let server = TestServer::with_default_host().await;
    let hv = server.hv_host(DEFAULT_URI);
    for i in 0..10u32 {
        let mut spec = default_domain_spec();
        spec.name = format!("extra-{}", i);
        spec.uuid = format!("00000000-0000-0000-0000-{:012}", i + 1);
        let mac = format!("52:54:00:00:10:{:02x}", i);
        for device in &mut spec.devices {
            if device.attrs.contains_key("mac@address") {
                device.key = mac.clone();
                device.attrs.insert("mac@address".to_string(), mac.clone());
            }
        }
        hv.add_domain(spec, DomainState::Shutoff);
    }

    let base = server.base_url();
    let mut listings = Vec::new();
    for _ in 0..8 {
        let client = server.client.clone();
        let url = format!("{}/hosts/h1/discovered-vms", base);
        listings.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().status()
        }));
    }
    let mut imports = Vec::new();
    for i in 0..10 {
        let client = server.client.clone();
        let url = format!("{}/hosts/h1/vms/extra-{}/import", base, i);
        imports.push(tokio::spawn(async move {
            client.post(url).send().await.unwrap().status()
        }));
    }

    for listing in listings {
        assert_eq!(listing.await.unwrap(), 200);
    }
    for import in imports {
        assert_eq!(import.await.unwrap(), 201);
    }

    let inventory: Value = server.get("/hosts/h1/inventory").await.json().await.unwrap();
    assert_eq!(inventory.as_array().unwrap().len(), 10);
    let discovered = wait_for_json(&server, "/hosts/h1/discovered-vms", Duration::from_secs(5), |body| {
        body.as_array()
            .unwrap()
            .iter()
            .filter(|d| d["imported"] == true)
            .count()
            == 10
    })
    .await;
    assert_eq!(discovered.as_array().unwrap().len(), 11);

    server.shutdown().await;
}

#[tokio::test]
async fn test_import_selected_reports_each_domain() {
    let server = TestServer::with_default_host().await;
    server.get("/hosts/h1/discovered-vms").await;

    let response = server
        .post_json(
            "/hosts/h1/vms/import-selected",
            &json!({"domain_uuids": [DEFAULT_DOMAIN_UUID, "00000000-0000-0000-0000-000000000000"]}),
        )
        .await;
    assert_eq!(response.status(), 200);
    let outcomes: Value = response.json().await.unwrap();
    let outcomes = outcomes.as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0]["ok"], true);
    assert_eq!(outcomes[1]["ok"], false);
    assert_eq!(outcomes[1]["code"], "VM_NOT_FOUND");

    // Nothing left to import.
    let outcomes: Value = server
        .post("/hosts/h1/vms/import-all")
        .await
        .json()
        .await
        .unwrap();
    assert!(outcomes.as_array().unwrap().is_empty());

    let response = server
        .post_json("/hosts/h1/vms/import-selected", &json!({"domain_uuids": []}))
        .await;
    assert_error(response, 400, "VALIDATION_ERROR").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_delete_discovered() {
    let server = TestServer::with_default_host().await;
    server.get("/hosts/h1/discovered-vms").await;

    let response = server
        .delete_json(
            "/hosts/h1/discovered-vms",
            &json!({"domain_uuids": [DEFAULT_DOMAIN_UUID]}),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["deleted"], 1);

    server.shutdown().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_stopped_vm() {
    let server = TestServer::with_default_host().await;
    let vm = import_default(&server, true).await;
    assert_eq!(vm["state"], "STOPPED");

    let (_client, mut rx) = server.hub_client().await;

    let response = server.post("/hosts/h1/vms/test/start").await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["task_state"], "STARTING");

    wait_for_message(&mut rx, Duration::from_secs(5), |m| {
        matches!(m, ServerMessage::VmsChanged { vm: Some(vm), .. }
            if vm.task_state == Some(TaskState::Starting))
    })
    .await;
    wait_for_message(&mut rx, Duration::from_secs(10), |m| {
        matches!(m, ServerMessage::VmsChanged { vm: Some(vm), .. }
            if vm.state == VmState::Active && vm.task_state.is_none())
    })
    .await;

    let body: Value = server.get("/hosts/h1/vms/test").await.json().await.unwrap();
    assert_eq!(body["state"], "ACTIVE");
    assert_eq!(body["task_state"], Value::Null);

    server.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let server = TestServer::with_default_host().await;
    import_default(&server, true).await;

    assert_error(
        server.post("/hosts/h1/vms/test/shutdown").await,
        409,
        "VM_STATE_ERROR",
    )
    .await;
    assert_error(
        server.post("/hosts/h1/vms/nope/start").await,
        404,
        "VM_NOT_FOUND",
    )
    .await;

    let response = server
        .put_json("/hosts/h1/vms/test/state", &json!({"state": "sideways"}))
        .await;
    assert_error(response, 400, "VALIDATION_ERROR").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_busy_vm_rejects_second_task() {
    let server = TestServer::with_default_host().await;
    import_default(&server, false).await;
    server
        .hv_host(DEFAULT_URI)
        .set_ignore_shutdown(DEFAULT_DOMAIN_UUID, true);

    let response = server.post("/hosts/h1/vms/test/shutdown").await;
    assert_eq!(response.status(), 202);
    assert_error(server.post("/hosts/h1/vms/test/reboot").await, 409, "VM_BUSY").await;

    // The guest ignores the request; the task times out and clears.
    wait_for_json(&server, "/hosts/h1/vms/test", Duration::from_secs(5), |vm| {
        vm["task_state"].is_null()
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_desired_state() {
    let server = TestServer::with_default_host().await;
    import_default(&server, false).await;

    let response = server
        .put_json("/hosts/h1/vms/test/state", &json!({"state": "PAUSED"}))
        .await;
    assert_eq!(response.status(), 202);
    wait_for_json(&server, "/hosts/h1/vms/test", Duration::from_secs(5), |vm| {
        vm["state"] == "PAUSED" && vm["task_state"].is_null()
    })
    .await;

    let response = server
        .put_json("/hosts/h1/vms/test/state", &json!({"state": "active"}))
        .await;
    assert_eq!(response.status(), 202);
    wait_for_json(&server, "/hosts/h1/vms/test", Duration::from_secs(5), |vm| {
        vm["state"] == "ACTIVE" && vm["task_state"].is_null()
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_drift_sync_and_rebuild() {
    let server = TestServer::with_default_host().await;
    import_default(&server, false).await;
    let hv = server.hv_host(DEFAULT_URI);

    hv.modify_domain(DEFAULT_DOMAIN_UUID, |spec| spec.vcpu_count += 2);
    server.get("/hosts/h1/discovered-vms").await;
    let vm: Value = server.get("/hosts/h1/vms/test").await.json().await.unwrap();
    assert_eq!(vm["sync_status"], "DRIFTED");
    assert!(
        vm["drift_details"]
            .as_array()
            .unwrap()
            .iter()
            .any(|d| d["field"] == "vcpu_count")
    );

    // Put the stored definition back onto the hypervisor.
    let response = server.post("/hosts/h1/vms/test/rebuild-from-db").await;
    assert_eq!(response.status(), 202);
    let vm = wait_for_json(&server, "/hosts/h1/vms/test", Duration::from_secs(10), |vm| {
        vm["task_state"].is_null()
    })
    .await;
    assert_eq!(vm["sync_status"], "SYNCED");
    assert_eq!(vm["state"], "ACTIVE");
    let live = hv.domain_spec(DEFAULT_DOMAIN_UUID).unwrap();
    assert_eq!(live.vcpu_count, vm["vcpu_count"].as_u64().unwrap() as u32);

    // Drift again, then accept the live definition instead.
    hv.modify_domain(DEFAULT_DOMAIN_UUID, |spec| spec.memory_bytes *= 2);
    let response = server.post("/hosts/h1/vms/test/sync-from-libvirt").await;
    assert_eq!(response.status(), 200);
    let vm: Value = response.json().await.unwrap();
    assert_eq!(vm["sync_status"], "SYNCED");
    assert_eq!(vm["memory_bytes"].as_u64().unwrap(), live.memory_bytes * 2);

    server.shutdown().await;
}

// =============================================================================
// Telemetry
// =============================================================================

#[tokio::test]
async fn test_vm_stats_stream() {
    let server = TestServer::with_default_host().await;
    let vm = import_default(&server, false).await;
    let response = server
        .put_json("/settings/metrics", &json!({"vmIntervalMs": 200}))
        .await;
    assert_eq!(response.status(), 200);

    let snapshot: Value = server.get("/hosts/h1/vms/test/stats").await.json().await.unwrap();
    assert_eq!(snapshot["state"], "running");
    assert!(snapshot["disks"]["vda"].is_object());

    let (client, mut rx) = server.hub_client().await;
    let uuid = vm["uuid"].as_str().unwrap().to_string();
    server
        .service
        .hub
        .subscribe(client, Subject::Vm(uuid.clone()))
        .await;

    let message = wait_for_message(&mut rx, Duration::from_secs(2), |m| {
        matches!(m, ServerMessage::VmStats(_))
    })
    .await;
    let ServerMessage::VmStats(stats) = message else {
        unreachable!()
    };
    assert_eq!(stats.vm_uuid, uuid);
    assert!((0.0..=100.0).contains(&stats.cpu_percent));

    let runtime: Value = server
        .get("/settings/metrics/runtime")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(runtime["active_samplers"], json!([format!("vm:{}", uuid)]));

    server.shutdown().await;
}

// =============================================================================
// Settings
// =============================================================================

#[tokio::test]
async fn test_metrics_settings() {
    let server = TestServer::spawn().await;

    let body: Value = server.get("/settings/metrics").await.json().await.unwrap();
    assert_eq!(body["cpuDisplayDefault"], "host");
    assert_eq!(body["units"]["disk"], "mib");

    let response = server
        .put_json("/settings/metrics", &json!({"cpuDisplayDefault": "guest"}))
        .await;
    assert_eq!(response.status(), 200);

    let runtime: Value = server
        .get("/settings/metrics/runtime")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(runtime["cpuDisplayDefault"], "guest");
    assert_eq!(runtime["cpuSmoothAlpha"], 0.3);
    assert!(runtime.get("settings").is_none());
    assert!(runtime["connected_hosts"].is_array());

    let response = server
        .put_json("/settings/metrics", &json!({"diskSmoothAlpha": 1.5}))
        .await;
    assert_error(response, 400, "VALIDATION_ERROR").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_ws_subscribe_stream_unsubscribe() {
    let server = TestServer::with_default_host().await;
    let vm = import_default(&server, false).await;
    let uuid = vm["uuid"].as_str().unwrap().to_string();
    let subject = format!("vm:{}", uuid);

    let mut socket = server.ws_connect().await;
    let subscribe = json!({"type": "subscribe", "payload": {"subject": subject}});
    socket.send(WsMessage::text(subscribe.to_string())).await.unwrap();

    let stats = next_ws_json(&mut socket, Duration::from_secs(5), |m| m["type"] == "vm_stats").await;
    assert_eq!(stats["payload"]["vm_uuid"], uuid);
    assert_eq!(stats["payload"]["domain_uuid"], DEFAULT_DOMAIN_UUID);
    let runtime: Value = server.get("/settings/metrics/runtime").await.json().await.unwrap();
    assert_eq!(runtime["active_samplers"], json!([subject]));

    let unsubscribe = json!({"type": "unsubscribe", "payload": {"subject": subject}});
    socket.send(WsMessage::text(unsubscribe.to_string())).await.unwrap();
    wait_for_json(&server, "/settings/metrics/runtime", Duration::from_secs(5), |r| {
        r["active_samplers"].as_array().is_some_and(|a| a.is_empty())
    })
    .await;

    socket.send(WsMessage::text("not json")).await.unwrap();
    let error = next_ws_json(&mut socket, Duration::from_secs(5), |m| m["type"] == "error").await;
    assert_eq!(error["payload"]["code"], "BAD_REQUEST");

    // Closing the socket releases the hub client.
    socket.send(WsMessage::text(subscribe.to_string())).await.unwrap();
    next_ws_json(&mut socket, Duration::from_secs(5), |m| m["type"] == "vm_stats").await;
    socket.close(None).await.unwrap();
    wait_for_json(&server, "/settings/metrics/runtime", Duration::from_secs(5), |r| {
        r["active_samplers"].as_array().is_some_and(|a| a.is_empty())
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_ws_requires_upgrade() {
    let server = TestServer::spawn().await;

    let response = server
        .client
        .get(format!("http://{}/ws", server.addr))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    server.shutdown().await;
}
