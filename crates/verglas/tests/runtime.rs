//! End-to-end exercises of the connection runtime over loopback sockets:
//! request/reply, large payloads, size limits, failover after a graceful
//! close, connect retries, invocation timeouts, batching, hold/resume and
//! datagrams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use verglas::prelude::*;
use verglas::{InvocationError, TransportError};
use verglas_codec::OutputStream as CodecOutputStream;

struct TestState {
    calls: AtomicUsize,
}

struct TestServant {
    state: Arc<TestState>,
}

impl Servant for TestServant {
    fn dispatch(
        &self,
        current: &Current,
        params: &mut InputStream,
    ) -> Result<DispatchResult, LocalError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        match current.operation.as_str() {
            "ping" | "count" | "swallow" => Ok(DispatchResult::Ok(current.empty_reply())),
            "echoLen" => {
                params.start_encapsulation()?;
                let data = params.read_byte_seq()?;
                params.end_encapsulation()?;
                let mut out = current.reply_stream();
                out.write_i32(data.len() as i32);
                Ok(DispatchResult::Ok(current.finish_reply(out)?))
            }
            "delay" => {
                params.start_encapsulation()?;
                let ms = params.read_i32()?;
                params.end_encapsulation()?;
                std::thread::sleep(Duration::from_millis(ms as u64));
                Ok(DispatchResult::Ok(current.empty_reply()))
            }
            _ => Err(InvocationError::OperationNotExist {
                identity: current.identity.clone(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
            }
            .into()),
        }
    }
}

struct Server {
    communicator: Communicator,
    adapter: Arc<verglas::ObjectAdapter>,
    state: Arc<TestState>,
    port: u16,
}

fn start_server(extra: &[(&str, &str)]) -> Server {
    start_server_with_endpoint(extra, "tcp -h 127.0.0.1 -p 0")
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn start_server_with_endpoint(extra: &[(&str, &str)], endpoint: &str) -> Server {
    init_tracing();
    let properties = Properties::from_pairs(extra.iter().copied());
    let communicator = Communicator::with_properties(properties).unwrap();
    let adapter = communicator
        .create_object_adapter_with_endpoints("Test", endpoint)
        .unwrap();
    let state = Arc::new(TestState { calls: AtomicUsize::new(0) });
    adapter
        .add(Identity::named("test"), Arc::new(TestServant { state: state.clone() }))
        .unwrap();
    adapter.activate().unwrap();
    let port = adapter.published_endpoints()[0].port;
    Server { communicator, adapter, state, port }
}

fn client(extra: &[(&str, &str)]) -> Communicator {
    let properties = Properties::from_pairs(extra.iter().copied());
    Communicator::with_properties(properties).unwrap()
}

fn proxy_to(communicator: &Communicator, port: u16) -> ObjectPrx {
    communicator
        .string_to_proxy(&format!("test:tcp -h 127.0.0.1 -p {port}"))
        .unwrap()
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn twoway_empty_reply() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port);

    let outcome = proxy
        .invoke("ping", OperationMode::Normal, true, None, None)
        .unwrap();
    assert!(matches!(outcome, InvocationOutcome::Ok(_)));
    assert_eq!(server.state.calls.load(Ordering::SeqCst), 1);

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn large_payload_within_limit() {
    // One mebibyte of params under a two-mebibyte cap.
    let server = start_server(&[("MessageSizeMax", "2048")]);
    let client = client(&[("MessageSizeMax", "2048")]);
    let proxy = proxy_to(&client, server.port);

    let payload = vec![0x5Au8; 1024 * 1024];
    let mut params = proxy.start_params().unwrap();
    params.write_byte_seq(&payload).unwrap();
    let outcome = proxy
        .invoke("echoLen", OperationMode::Normal, true, Some(params), None)
        .unwrap();
    match outcome {
        InvocationOutcome::Ok(encaps) => {
            let mut reader = encaps.reader();
            reader.start_encapsulation().unwrap();
            assert_eq!(reader.read_i32().unwrap(), payload.len() as i32);
        }
        InvocationOutcome::UserException(_) => panic!("unexpected user exception"),
    }

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn message_size_max_is_a_hard_boundary() {
    // Request frame layout for identity "test" and operation "swallow"
    // with an empty context and a blob of n raw bytes in the params
    // encapsulation:
    //   14 (header) + 4 (request id) + 5 ("test") + 1 (category)
    //   + 1 (facet) + 8 ("swallow") + 1 (mode) + 1 (context)
    //   + 6 + n (params encapsulation)
    // = 41 + n.
    const FRAME_OVERHEAD: usize = 41;
    let limit = 2 * 1024; // MessageSizeMax=2 KiB on the server.

    let server = start_server(&[("MessageSizeMax", "2")]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port);

    // Exactly at the limit: accepted.
    let mut params = proxy.start_params().unwrap();
    params.write_blob(&vec![1u8; limit - FRAME_OVERHEAD]);
    let outcome = proxy.invoke("swallow", OperationMode::Normal, true, Some(params), None);
    assert!(matches!(outcome, Ok(InvocationOutcome::Ok(_))));

    // One byte past it: the server drops the connection.
    let mut params = proxy.start_params().unwrap();
    params.write_blob(&vec![1u8; limit - FRAME_OVERHEAD + 1]);
    let outcome = proxy.invoke("swallow", OperationMode::Normal, true, Some(params), None);
    assert!(outcome.is_err());

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn failover_after_graceful_server_close() {
    let first = start_server(&[]);
    let second = start_server(&[]);
    let client = client(&[("RetryIntervals", "0")]);
    let proxy = client
        .string_to_proxy(&format!(
            "test:tcp -h 127.0.0.1 -p {}:tcp -h 127.0.0.1 -p {}",
            first.port, second.port
        ))
        .unwrap()
        .with_endpoint_selection(verglas::EndpointSelection::Ordered);

    proxy
        .invoke("ping", OperationMode::Normal, true, None, None)
        .unwrap();
    assert_eq!(first.state.calls.load(Ordering::SeqCst), 1);

    // The first server goes away gracefully; the proxy must build a new
    // connection and land on the second endpoint.
    first.adapter.deactivate();
    proxy
        .invoke("ping", OperationMode::Normal, true, None, None)
        .unwrap();
    assert_eq!(second.state.calls.load(Ordering::SeqCst), 1);

    client.destroy();
    first.communicator.destroy();
    second.communicator.destroy();
}

#[test]
fn connect_refused_retries_then_fails() {
    // Grab a port nobody will be listening on.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = client(&[("RetryIntervals", "0 100"), ("ConnectTimeout", "5")]);
    let proxy = proxy_to(&client, dead_port);

    let started = Instant::now();
    let outcome = proxy.invoke("ping", OperationMode::Normal, true, None, None);
    let elapsed = started.elapsed();

    match outcome {
        Err(LocalError::Transport(TransportError::ConnectFailed(_))) => {}
        Err(other) => panic!("expected ConnectFailed, got {other}"),
        Ok(_) => panic!("invocation cannot succeed without a server"),
    }
    // The second retry interval alone is 100 ms.
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");

    client.destroy();
}

#[test]
fn invocation_timeout_cancels_and_connection_recovers() {
    let server = start_server(&[]);
    let client = client(&[("RetryIntervals", "0")]);
    let proxy = proxy_to(&client, server.port);

    let mut params = proxy.start_params().unwrap();
    params.write_i32(300);
    let outcome = proxy
        .with_invocation_timeout(50)
        .invoke("delay", OperationMode::Normal, true, Some(params), None);
    assert!(matches!(
        outcome,
        Err(LocalError::Invocation(InvocationError::InvocationTimeout))
    ));

    // The late reply hits a connection that no longer knows the request
    // id; the runtime treats that as a protocol error and closes it. A
    // later invocation must transparently get a fresh connection.
    assert!(wait_for(Duration::from_secs(2), || {
        proxy
            .invoke("ping", OperationMode::Idempotent, true, None, None)
            .is_ok()
    }));

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn explicit_cancellation_wins_over_reply() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port);

    let mut params = proxy.start_params().unwrap();
    params.write_i32(200);
    let future = proxy
        .invoke_async("delay", OperationMode::Normal, true, Some(params), None)
        .unwrap();
    let handle = future.cancel_handle();
    std::thread::sleep(Duration::from_millis(20));
    handle.cancel();
    assert!(matches!(
        future.wait(),
        Err(LocalError::Invocation(InvocationError::InvocationCanceled))
    ));

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn batch_requests_accumulate_until_flush() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port).batch_oneway();

    for _ in 0..3 {
        let outcome = proxy
            .invoke("count", OperationMode::Normal, false, None, None)
            .unwrap();
        assert!(matches!(outcome, InvocationOutcome::Ok(_)));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.state.calls.load(Ordering::SeqCst), 0, "batch left early");

    client.flush_batch_requests().unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        server.state.calls.load(Ordering::SeqCst) == 3
    }));

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn oneway_completes_without_reply() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port).oneway();

    proxy
        .invoke("count", OperationMode::Normal, false, None, None)
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        server.state.calls.load(Ordering::SeqCst) == 1
    }));

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn twoway_only_operations_reject_oneway_proxies() {
    let client = client(&[]);
    let proxy = proxy_to(&client, 4061).oneway();
    assert!(matches!(
        proxy.invoke("ping", OperationMode::Normal, true, None, None),
        Err(LocalError::Invocation(InvocationError::TwowayOnly { .. }))
    ));
    client.destroy();
}

#[test]
fn unknown_operation_maps_to_operation_not_exist() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port);

    let outcome = proxy.invoke("noSuchOp", OperationMode::Normal, true, None, None);
    assert!(matches!(
        outcome,
        Err(LocalError::Invocation(InvocationError::OperationNotExist { .. }))
    ));

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn missing_object_maps_to_object_not_exist() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = client
        .string_to_proxy(&format!("nobody:tcp -h 127.0.0.1 -p {}", server.port))
        .unwrap();

    let outcome = proxy.invoke("ping", OperationMode::Normal, true, None, None);
    match outcome {
        Err(LocalError::Invocation(InvocationError::ObjectNotExist { identity, .. })) => {
            assert_eq!(identity, Identity::named("nobody"));
        }
        other => panic!("expected ObjectNotExist, got {:?}", other.err().map(|e| e.to_string())),
    }

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn hold_defers_dispatch_until_resume() {
    let server = start_server(&[]);
    let client = client(&[]);
    let proxy = proxy_to(&client, server.port);

    // Establish the connection first; hold only pauses existing ones.
    proxy
        .invoke("ping", OperationMode::Normal, true, None, None)
        .unwrap();
    server.adapter.hold();

    let future = proxy
        .invoke_async("ping", OperationMode::Normal, true, None, None)
        .unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(server.state.calls.load(Ordering::SeqCst), 1, "dispatched while held");

    server.adapter.resume();
    assert!(matches!(future.wait(), Ok(_)));
    assert_eq!(server.state.calls.load(Ordering::SeqCst), 2);

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn datagram_oneway_reaches_udp_endpoint() {
    let server = start_server_with_endpoint(&[], "udp -h 127.0.0.1 -p 0");
    let client = client(&[]);
    let proxy = client
        .string_to_proxy(&format!("test:udp -h 127.0.0.1 -p {}", server.port))
        .unwrap()
        .datagram();

    for _ in 0..5 {
        proxy
            .invoke("count", OperationMode::Normal, false, None, None)
            .unwrap();
    }
    assert!(wait_for(Duration::from_secs(5), || {
        server.state.calls.load(Ordering::SeqCst) >= 1
    }));

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn concurrent_twoway_invocations_multiplex_one_connection() {
    let server = start_server(&[("ThreadPool.Size", "4")]);
    let client = client(&[("ThreadPool.Size", "2")]);
    let proxy = proxy_to(&client, server.port);

    // Issue several delayed calls at once; replies correlate by id, not
    // by order.
    let futures: Vec<_> = (0..4)
        .map(|_| {
            let mut params = proxy.start_params().unwrap();
            params.write_i32(50);
            proxy
                .invoke_async("delay", OperationMode::Normal, true, Some(params), None)
                .unwrap()
        })
        .collect();
    for future in futures {
        assert!(matches!(future.wait(), Ok(_)));
    }
    assert_eq!(server.state.calls.load(Ordering::SeqCst), 4);

    client.destroy();
    server.communicator.destroy();
}

#[test]
fn proxy_equality_is_structural() {
    let client = client(&[]);
    let a = proxy_to(&client, 4061);
    let b = proxy_to(&client, 4061);
    assert_eq!(a, b);
    assert_ne!(a, a.oneway());
    assert_ne!(a, a.with_facet("admin"));
    client.destroy();
}

// Touch the codec re-export so the facade keeps exposing it.
#[test]
fn facade_reexports_codec_streams() {
    let mut out = CodecOutputStream::new(verglas::ENCODING_1_1);
    out.write_i32(7);
    assert_eq!(out.as_slice(), &[7, 0, 0, 0]);
}
