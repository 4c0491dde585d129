//! End-to-end scenarios over an in-memory duplex transport (`spec.md` §8).
//! Each test wires up two `Processor`s — conventionally named `client` and
//! `server` — connected by `tokio::io::duplex`, the same in-process stand-in
//! the teacher's `mcp/test_support.rs` style favors over a real socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rpc_core::api::{ApiDescriptor, MethodDescriptor};
use rpc_core::codec::{DynamicValue, SerializerId};
use rpc_core::dispatcher::{CallContext, RpcScopeRef};
use rpc_core::processor::{register_builtin_scope_types, Processor, ProcessorState};
use rpc_core::registry::MessageRegistry;
use rpc_core::scope::cancellation::CancellationToken;
use rpc_core::scope::registry::ScopeRegistry;
use rpc_core::scope::stream::StreamConfig;
use rpc_core::scope::ScopeValue;
use rpc_core::{ProcessorConfig, RpcError};

fn shared_registries() -> (Arc<MessageRegistry>, Arc<ScopeRegistry>) {
    let scope_registry = Arc::new(ScopeRegistry::new());
    register_builtin_scope_types(&scope_registry).unwrap();
    (Arc::new(MessageRegistry::new()), scope_registry)
}

fn spawn_pair(
    server_config: ProcessorConfig,
    client_config: ProcessorConfig,
) -> (Arc<Processor>, Arc<Processor>) {
    let (message_registry, scope_registry) = shared_registries();
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let server = Processor::new(
        server_stream,
        server_config,
        message_registry.clone(),
        scope_registry.clone(),
    );
    let client = Processor::new(client_stream, client_config, message_registry, scope_registry);
    (server, client)
}

async fn start_pair(server: &Arc<Processor>, client: &Arc<Processor>) {
    server.start().await;
    client.start().await;
}

fn echo_method(name: &str) -> MethodDescriptor {
    MethodDescriptor::builder(
        name,
        Arc::new(|ctx: CallContext| {
            Box::pin(async move {
                let message: String = ctx
                    .param(0)
                    .ok_or_else(|| RpcError::MethodNotFound {
                        api: ctx.api.clone(),
                        method: ctx.method.clone(),
                    })??;
                Ok(serde_json::Value::String(message))
            })
        }),
    )
    .build()
}

// Scenario 1 & 2: synchronous and "asynchronous" echo handlers are
// indistinguishable in Rust (every handler is an `async fn`); both are
// registered under their own method name so both wire paths are exercised.
#[tokio::test]
async fn echo_sync_and_async_return_the_input_unchanged() {
    let server_api = ApiDescriptor::builder("ServerApi")
        .method(echo_method("Echo"))
        .method(echo_method("EchoAsync"))
        .build();
    let (server, client) = spawn_pair(
        ProcessorConfig::default().with_apis(vec![server_api]),
        ProcessorConfig::default(),
    );
    start_pair(&server, &client).await;

    let param = DynamicValue::encode(&"test".to_string(), SerializerId::Json).unwrap();
    let reply: String = client
        .call_value("ServerApi", "Echo", vec![param.clone()], None)
        .await
        .unwrap();
    assert_eq!(reply, "test");

    let reply: String = client
        .call_value("ServerApi", "EchoAsync", vec![param], None)
        .await
        .unwrap();
    assert_eq!(reply, "test");
}

// Scenario 3: raising a processor-scoped event with `waiting=true` blocks
// the raiser's RPC call until the peer's handler has completed exactly once.
#[tokio::test]
async fn raise_event_with_wait_invokes_the_handler_exactly_once() {
    let server_api = ApiDescriptor::builder("ServerApi")
        .method(MethodDescriptor::builder(
            "RaiseRemoteEventAsync",
            Arc::new(|ctx: CallContext| {
                Box::pin(async move {
                    ctx.processor.raise_event("test", None, true).await?;
                    Ok(serde_json::Value::Null)
                })
            }),
        )
        .build())
        .build();
    let (server, client) = spawn_pair(
        ProcessorConfig::default().with_apis(vec![server_api]),
        ProcessorConfig::default(),
    );
    start_pair(&server, &client).await;

    let raise_count = Arc::new(AtomicUsize::new(0));
    let counted = raise_count.clone();
    client
        .register_event(
            "test",
            Arc::new(move |_args| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await
        .unwrap();

    client
        .call_void("ServerApi", "RaiseRemoteEventAsync", Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(raise_count.load(Ordering::SeqCst), 1);
}

// Scenario 4: a ping resolves within its timeout and the call is itself a
// tracked request, round-tripping through the Request Table like any other.
#[tokio::test]
async fn ping_resolves_within_timeout() {
    let (server, client) = spawn_pair(ProcessorConfig::default(), ProcessorConfig::default());
    start_pair(&server, &client).await;

    client.ping(Duration::from_secs(1)).await.unwrap();
}

// Scenario 5: closing transitions the closer to Stopped and the peer
// observes Stopping shortly after, driven entirely by the `Close` message.
#[tokio::test]
async fn close_propagates_to_the_peer() {
    let (server, client) = spawn_pair(ProcessorConfig::default(), ProcessorConfig::default());
    start_pair(&server, &client).await;

    client.close(0, None).await.unwrap();
    assert_eq!(client.state().await, ProcessorState::Stopped);

    for _ in 0..20 {
        if server.state().await == ProcessorState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.state().await, ProcessorState::Stopped);
}

// Scenario 6: a keyed cancellation scope is mirrored to the peer, the peer's
// acknowledgement is observed as `create_cancellation_scope` returning, and
// firing the source token tears down both sides' indexes.
#[tokio::test]
async fn cancellation_scope_mirrors_and_tears_down_on_both_sides() {
    let (server, client) = spawn_pair(ProcessorConfig::default(), ProcessorConfig::default());
    start_pair(&server, &client).await;

    let token = CancellationToken::new();
    let scope_id = client
        .create_cancellation_scope(Some("cancellation".into()), token.clone())
        .await
        .unwrap();

    assert_eq!(
        client.local_scope_id_by_key("cancellation").await,
        Some(scope_id)
    );

    let mut remote_token = None;
    for _ in 0..20 {
        if let Some(value) = server.get_remote_scope(scope_id).await {
            remote_token = value.as_any().downcast_ref::<CancellationToken>().cloned();
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let remote_token = remote_token.expect("consumer materializes the mirrored token");
    assert_eq!(
        server.remote_scope_id_by_key("cancellation").await,
        Some(scope_id)
    );
    assert!(!remote_token.is_cancelled());

    token.cancel();

    tokio::time::timeout(Duration::from_secs(1), remote_token.cancelled())
        .await
        .expect("the mirrored token observes cancellation");

    for _ in 0..20 {
        if client.get_scope(scope_id).await.is_none() && server.get_remote_scope(scope_id).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.get_scope(scope_id).await.is_none());
    assert!(client.local_scope_id_by_key("cancellation").await.is_none());
    assert!(server.get_remote_scope(scope_id).await.is_none());
    assert!(server.remote_scope_id_by_key("cancellation").await.is_none());
}

// Scenario 7: a cancellation token flowing as a call parameter
// (`spec.md` §4.8 step 3): the scope is established out-of-band via
// `create_cancellation_scope`, and its id crosses as an `RpcScopeRef`
// parameter that the callee resolves back to the mirrored `RemoteScope`.
#[tokio::test]
async fn cancellation_as_parameter_observes_the_caller_cancelling() {
    let server_saw_cancellation = Arc::new(AtomicUsize::new(0));
    let counted = server_saw_cancellation.clone();
    let server_api = ApiDescriptor::builder("ServerApi")
        .method(
            MethodDescriptor::builder(
                "CancellationParameterAsync",
                Arc::new(move |ctx: CallContext| {
                    let counted = counted.clone();
                    Box::pin(async move {
                        let mut scope = ctx.scope_param(0).await;
                        for _ in 0..50 {
                            if scope.is_ok() {
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            scope = ctx.scope_param(0).await;
                        }
                        let scope = scope.expect("mirrored cancellation scope materialized");
                        let token = scope
                            .as_any()
                            .downcast_ref::<CancellationToken>()
                            .expect("cancellation scope type")
                            .clone();
                        token.cancelled().await;
                        counted.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::Value::Null)
                    })
                }),
            )
            .build(),
        )
        .build();
    let (server, client) = spawn_pair(
        ProcessorConfig::default().with_apis(vec![server_api]),
        ProcessorConfig::default(),
    );
    start_pair(&server, &client).await;

    let ct = CancellationToken::new();
    let scope_id = client
        .create_cancellation_scope(None, ct.clone())
        .await
        .unwrap();
    let scope_ref = DynamicValue::encode(&RpcScopeRef { scope_id }, SerializerId::Json).unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_void("ServerApi", "CancellationParameterAsync", vec![scope_ref], None)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    ct.cancel();

    tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("call completes after the server observes cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(server_saw_cancellation.load(Ordering::SeqCst), 1);
}

// Scenario 8: a stream scope's sender only dispatches its next chunk once
// the previous chunk's `Response` has arrived (`spec.md` §4.11), and an
// empty chunk both signals `is_last` and tears down the scope.
#[tokio::test]
async fn stream_scope_sends_chunks_in_order_with_backpressure() {
    let (server, client) = spawn_pair(ProcessorConfig::default(), ProcessorConfig::default());
    start_pair(&server, &client).await;

    let outbound = client
        .open_stream_scope(Some("upload".into()), StreamConfig::default())
        .await
        .unwrap();

    outbound
        .outbound_sender()
        .send(Bytes::from_static(b"hello"))
        .await
        .unwrap();
    outbound
        .outbound_sender()
        .send(Bytes::from_static(b"world"))
        .await
        .unwrap();
    outbound.outbound_sender().send(Bytes::new()).await.unwrap();

    let stream_id = client.local_scope_id_by_key("upload").await.unwrap();

    let mut inbound = None;
    for _ in 0..20 {
        if let Some(scope) = server.get_inbound_stream(stream_id).await {
            inbound = Some(scope);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let inbound = inbound.expect("peer materializes the stream on StreamStart");
    let mut reader = inbound.take_inbound_receiver().unwrap();

    assert_eq!(reader.recv().await, Some(Bytes::from_static(b"hello")));
    assert_eq!(reader.recv().await, Some(Bytes::from_static(b"world")));
    assert_eq!(reader.recv().await, Some(Bytes::new()));

    for _ in 0..20 {
        if client.local_scope_id_by_key("upload").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.local_scope_id_by_key("upload").await.is_none());
}
