//! End-to-end scenarios driving a client `Stack` and a service `Stack` +
//! `ApplicationRegistry` + `WorkerPool` against a shared `InProcessBroker`,
//! with no real network involved.

use std::sync::Arc;
use std::time::Duration;

use osrf_bus::{PopTimeout, TransportClient};
use osrf_dispatch::{ApplicationRegistry, DispatcherConfig, MethodDescriptor, MethodOptions};
use osrf_session::{RequestHandler, Stack};
use osrf_testkit::InProcessBroker;
use osrf_wire::{status, ProtocolMessage};
use osrf_worker::{WorkerPool, WorkerPoolConfig};
use serde_json::{json, Value};

/// Starts a service listening on `service` with its system methods
/// registered, plus whatever extra `(descriptor, handler)` pairs are given.
/// Returns the transport (kept alive for the test's duration) and the
/// listener task's handle.
async fn start_service(
    broker: &InProcessBroker,
    service: &str,
    extra_methods: Vec<(MethodDescriptor, osrf_dispatch::HandlerFn)>,
) -> (Arc<TransportClient>, tokio::task::JoinHandle<()>) {
    let service_addr = osrf_testkit::service_address(service);
    let transport = osrf_testkit::build_transport(broker, service_addr.clone()).await;

    let registry = ApplicationRegistry::new(DispatcherConfig::default());
    registry.register_application(service).await;
    for (descriptor, handler) in extra_methods {
        registry.register_method(service, descriptor, handler).await;
    }
    let registry = Arc::new(registry);

    let stack = Arc::new(Stack::new(transport.clone(), Some(registry as Arc<dyn RequestHandler>), Some(service.to_owned())));
    let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::default(), stack, transport.clone()));
    pool.warm_up().await;

    let listen_transport = transport.clone();
    let handle = tokio::spawn(async move {
        loop {
            match listen_transport.recv_for(&service_addr, PopTimeout::Seconds(1)).await {
                Ok(Some(envelope)) => pool.dispatch(envelope).await,
                Ok(None) => continue,
                Err(_) => break,
            }
        }
    });
    (transport, handle)
}

async fn build_client(broker: &InProcessBroker, hostname: &str, pid: u32, rand8: &str) -> (Arc<TransportClient>, Arc<Stack>) {
    let addr = osrf_testkit::client_address(hostname, pid, rand8);
    let transport = osrf_testkit::build_transport(broker, addr).await;
    let stack = Arc::new(Stack::new(transport.clone(), None, None));
    (transport, stack)
}

fn extract_complete(msg: &ProtocolMessage) -> bool {
    matches!(msg, ProtocolMessage::Status { status_code, .. } if *status_code == status::COMPLETE)
}

#[tokio::test]
async fn echo_round_trip_streams_one_result_per_param() {
    let broker = InProcessBroker::new();
    let (_svc_transport, _listener) = start_service(&broker, "opensrf.math", Vec::new()).await;
    let (_client_transport, client) = build_client(&broker, "host1", 100, "aaaaaaaa").await;

    let session = client.registry.create_client(osrf_testkit::service_address("opensrf.math")).await;
    let trace = client
        .send_request(&session, "opensrf.system.echo", vec![json!("a"), json!(2), Value::Null])
        .await
        .unwrap();

    let mut results = Vec::new();
    loop {
        let msg = client.recv_response(&session, trace, Duration::from_secs(2)).await.unwrap().expect("response before timeout");
        if extract_complete(&msg) {
            break;
        }
        match msg {
            ProtocolMessage::Result { status_code, content, .. } => {
                assert_eq!(status_code, status::OK);
                results.push(content);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    assert_eq!(results, vec![json!("a"), json!(2), Value::Null]);
}

#[tokio::test]
async fn atomic_echo_returns_a_single_array_result() {
    let broker = InProcessBroker::new();
    let (_svc_transport, _listener) = start_service(&broker, "opensrf.math", Vec::new()).await;
    let (_client_transport, client) = build_client(&broker, "host1", 101, "bbbbbbbb").await;

    let session = client.registry.create_client(osrf_testkit::service_address("opensrf.math")).await;
    let trace = client
        .send_request(&session, "opensrf.system.echo.atomic", vec![json!("a"), json!(2), Value::Null])
        .await
        .unwrap();

    let first = client.recv_response(&session, trace, Duration::from_secs(2)).await.unwrap().expect("result");
    let ProtocolMessage::Result { content, .. } = first else {
        panic!("expected a single RESULT, got {first:?}");
    };
    assert_eq!(content, Value::Array(vec![json!("a"), json!(2), Value::Null]));

    let second = client.recv_response(&session, trace, Duration::from_secs(2)).await.unwrap().expect("complete");
    assert!(extract_complete(&second));
}

#[tokio::test]
async fn unknown_method_yields_a_single_not_found_status() {
    let broker = InProcessBroker::new();
    let (_svc_transport, _listener) = start_service(&broker, "opensrf.math", Vec::new()).await;
    let (_client_transport, client) = build_client(&broker, "host1", 102, "cccccccc").await;

    let session = client.registry.create_client(osrf_testkit::service_address("opensrf.math")).await;
    let trace = client.send_request(&session, "opensrf.math.nope", vec![json!(1)]).await.unwrap();

    let msg = client.recv_response(&session, trace, Duration::from_secs(2)).await.unwrap().expect("response");
    match msg {
        ProtocolMessage::Status { status_code, .. } => assert_eq!(status_code, status::NOT_FOUND),
        other => panic!("expected STATUS(404), got {other:?}"),
    }

    let followup = client.recv_response(&session, trace, Duration::from_millis(200)).await.unwrap();
    assert!(followup.is_none(), "expected nothing further on this trace, got {followup:?}");
}

#[tokio::test]
async fn introspect_prefix_lists_the_matching_method_and_its_atomic_twin() {
    let broker = InProcessBroker::new();
    let (_svc_transport, _listener) = start_service(&broker, "opensrf.math", Vec::new()).await;
    let (_client_transport, client) = build_client(&broker, "host1", 103, "dddddddd").await;

    let session = client.registry.create_client(osrf_testkit::service_address("opensrf.math")).await;
    let trace = client
        .send_request(&session, "opensrf.system.method", vec![json!("opensrf.system.echo")])
        .await
        .unwrap();

    let mut names = Vec::new();
    loop {
        let msg = client.recv_response(&session, trace, Duration::from_secs(2)).await.unwrap().expect("response before timeout");
        if extract_complete(&msg) {
            break;
        }
        let ProtocolMessage::Result { content, .. } = msg else {
            panic!("unexpected message: {msg:?}");
        };
        names.push(content["api_name"].as_str().unwrap().to_owned());
    }

    names.sort();
    assert_eq!(names, vec!["opensrf.system.echo", "opensrf.system.echo.atomic"]);
}

#[tokio::test]
async fn stateful_conversation_survives_across_requests_until_disconnect() {
    let broker = InProcessBroker::new();
    let (_svc_transport, _listener) = start_service(&broker, "opensrf.math", Vec::new()).await;
    let (_client_transport, client) = build_client(&broker, "host1", 104, "eeeeeeee").await;

    let session = client.registry.create_client(osrf_testkit::service_address("opensrf.math")).await;

    let connect_trace = client.send_connect(&session).await.unwrap();
    let reply = client.recv_response(&session, connect_trace, Duration::from_secs(2)).await.unwrap().expect("CONNECT reply");
    match reply {
        ProtocolMessage::Status { status_code, .. } => assert_eq!(status_code, status::OK),
        other => panic!("expected STATUS(OK), got {other:?}"),
    }

    // Every reply on this thread comes from the same process-wide service
    // address in this runtime (workers are tokio tasks sharing one
    // `TransportClient`, not separate processes with distinct listen
    // addresses) — so "same worker" here is demonstrated by the session
    // simply staying connected and answering two REQUESTs in a row, rather
    // than by comparing distinct sender addresses.
    for n in [1, 2] {
        let trace = client.send_request(&session, "opensrf.system.echo", vec![json!(n)]).await.unwrap();
        loop {
            let msg = client.recv_response(&session, trace, Duration::from_secs(2)).await.unwrap().expect("response before timeout");
            if extract_complete(&msg) {
                break;
            }
        }
    }

    client.send_disconnect(&session).await.unwrap();
    let nothing = client.recv_response(&session, connect_trace, Duration::from_millis(200)).await.unwrap();
    assert!(nothing.is_none(), "DISCONNECT should not draw a reply, got {nothing:?}");
}

#[tokio::test]
async fn continue_status_resets_the_recv_deadline_for_a_slow_handler() {
    let broker = InProcessBroker::new();
    // Installed directly (not through `register_application`): a handler
    // that stalls past any single recv attempt's timeout, announcing
    // liveness with CONTINUE partway through.
    let descriptor = MethodDescriptor {
        name: "opensrf.math.slow".to_owned(),
        notes: String::new(),
        argc: 0,
        options: MethodOptions::streaming(),
    };
    let handler: osrf_dispatch::HandlerFn = Arc::new(|_params, responder| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = responder.send_continue().await;
            tokio::time::sleep(Duration::from_millis(700)).await;
            let _ = responder.respond_complete(json!("done")).await;
            0
        })
    });
    let (_svc_transport, _listener) = start_service(&broker, "opensrf.math", vec![(descriptor, handler)]).await;
    let (_client_transport, client) = build_client(&broker, "host1", 105, "ffffffff").await;

    let session = client.registry.create_client(osrf_testkit::service_address("opensrf.math")).await;
    let trace = client.send_request(&session, "opensrf.math.slow", vec![]).await.unwrap();

    let first = client.recv_response(&session, trace, Duration::from_millis(1500)).await.unwrap().expect("CONTINUE before timeout");
    match first {
        ProtocolMessage::Status { status_code, .. } => assert_eq!(status_code, status::CONTINUE),
        other => panic!("expected STATUS(CONTINUE), got {other:?}"),
    }

    let second = client.recv_response(&session, trace, Duration::from_millis(1500)).await.unwrap().expect("RESULT after CONTINUE");
    match second {
        ProtocolMessage::Result { content, .. } => assert_eq!(content, json!("done")),
        other => panic!("expected RESULT, got {other:?}"),
    }

    // `respond_complete` sends STATUS(COMPLETE) itself once the RESULT is
    // out, independent of the handler's own return value.
    let third = client.recv_response(&session, trace, Duration::from_millis(500)).await.unwrap().expect("COMPLETE after RESULT");
    assert!(extract_complete(&third), "expected STATUS(COMPLETE), got {third:?}");
}
