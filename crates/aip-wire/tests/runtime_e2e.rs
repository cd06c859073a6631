//! End-to-end tests: a real hub and worker runtimes over loopback TCP.

use aip_types::agent::AgentId;
use aip_types::error::AipError;
use aip_types::message::{AnyPayload, Interaction};
use aip_types::tool::FunctionCall;
use aip_wire::{
    Agent, CodecRegistry, ConnectionState, HandlerError, Hub, HubOptions, MessageContext,
    RuntimeOptions, WorkerRuntime,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers `ask` with the question, its own key and the caller.
struct EchoAgent {
    delay: Duration,
    cancelled: Arc<AtomicBool>,
}

impl EchoAgent {
    fn new() -> Self {
        Self::slow(Duration::ZERO)
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn on_message(
        &self,
        message: AnyPayload,
        ctx: MessageContext,
    ) -> Result<AnyPayload, HandlerError> {
        let msg = message
            .downcast::<Interaction>()
            .map_err(|p| HandlerError::Unsupported(p.type_name().to_string()))?;
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancellation.cancelled() => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    return Err(HandlerError::Failed("cancelled".into()));
                }
            }
        }
        match msg {
            Interaction::Ask { content, .. } => Ok(AnyPayload::new(Interaction::response(json!({
                "echo": content,
                "key": ctx.recipient.key,
                "from": ctx.sender.to_string(),
            })))),
            other => Err(HandlerError::Failed(format!(
                "unsupported action {}",
                other.action()
            ))),
        }
    }
}

async fn start_hub() -> Arc<Hub> {
    let (hub, _task) = Hub::start(HubOptions::default()).await.unwrap();
    hub
}

fn runtime(hub: &Hub) -> WorkerRuntime {
    let codecs = CodecRegistry::new();
    codecs.register_json::<Interaction>();
    WorkerRuntime::new(
        RuntimeOptions::for_hub(hub.local_addr().to_string()),
        codecs,
    )
}

fn me() -> AgentId {
    AgentId::singleton("caller")
}

async fn ask(
    rt: &WorkerRuntime,
    target: AgentId,
    question: &str,
    timeout: Option<Duration>,
) -> Result<serde_json::Value, AipError> {
    let reply: Interaction = rt
        .call(&Interaction::ask(question), target, me(), timeout)
        .await?;
    Ok(reply.response_content().cloned().unwrap_or_default())
}

#[tokio::test]
async fn test_request_reply_through_hub() {
    let hub = start_hub().await;

    let host = runtime(&hub);
    host.register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();
    assert_eq!(caller.state(), ConnectionState::Connected);

    let content = ask(&caller, AgentId::new("echo", "alice"), "hello", None)
        .await
        .unwrap();
    assert_eq!(content["echo"], "hello");
    assert_eq!(content["key"], "alice");
    assert_eq!(content["from"], "caller/default");
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test]
async fn test_instances_created_lazily_per_key() {
    let hub = start_hub().await;
    let created = Arc::new(AtomicUsize::new(0));

    let host = runtime(&hub);
    let counter = Arc::clone(&created);
    host.register("echo", move |_id: &AgentId| {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(EchoAgent::new()) as Arc<dyn Agent>
    })
    .await
    .unwrap();
    host.start().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let caller = runtime(&hub);
    caller.start().await.unwrap();
    for key in ["a", "b", "a", "a"] {
        ask(&caller, AgentId::new("echo", key), "x", None)
            .await
            .unwrap();
    }
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_host_for_kind_is_rejected() {
    let hub = start_hub().await;

    let first = runtime(&hub);
    first
        .register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    first.start().await.unwrap();

    // Claimed in the handshake.
    let second = runtime(&hub);
    second
        .register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, AipError::KindConflict(_)), "got {err:?}");

    // Claimed after start.
    let third = runtime(&hub);
    third.start().await.unwrap();
    let err = third
        .register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, AipError::KindConflict(ref k) if k == "echo"));
    assert!(third.hosted_kinds().is_empty());

    // Re-registration by the current host is fine.
    first
        .register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_kind_is_released_when_host_stops() {
    let hub = start_hub().await;

    let first = runtime(&hub);
    first
        .register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    first.start().await.unwrap();
    first.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = runtime(&hub);
    second
        .register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    second.start().await.unwrap();
    assert_eq!(
        hub.directory().lookup("echo").as_deref(),
        Some(second.worker_id())
    );
}

#[tokio::test]
async fn test_concurrent_calls_keep_their_own_replies() {
    let hub = start_hub().await;

    let host = runtime(&hub);
    host.register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let caller = caller.clone();
        handles.push(tokio::spawn(async move {
            let question = format!("q-{i}");
            let content = ask(&caller, AgentId::singleton("echo"), &question, None)
                .await
                .unwrap();
            (question, content["echo"].as_str().unwrap_or_default().to_string())
        }));
    }
    for handle in handles {
        let (question, echoed) = handle.await.unwrap();
        assert_eq!(question, echoed);
    }
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test]
async fn test_unknown_kind_is_agent_not_found() {
    let hub = start_hub().await;
    let caller = runtime(&hub);
    caller.start().await.unwrap();
    let err = ask(&caller, AgentId::singleton("nobody"), "x", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AipError::AgentNotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unregistered_codec_fails_fast() {
    let hub = start_hub().await;
    let caller = runtime(&hub);
    caller.start().await.unwrap();
    let call = FunctionCall::new("echo", &json!({}));
    let err = caller
        .send_message(&call, AgentId::singleton("echo"), me(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AipError::CodecNotFound(_)));
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test]
async fn test_callee_without_codec_answers_415() {
    let hub = start_hub().await;

    // The host only knows Interaction.
    let host = runtime(&hub);
    host.register_singleton("echo", Arc::new(EchoAgent::new()))
        .await
        .unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.add_message_serializer::<FunctionCall>();
    caller.start().await.unwrap();

    let err = caller
        .send_message(
            &FunctionCall::new("echo", &json!({})),
            AgentId::singleton("echo"),
            me(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AipError::Remote { code: 415, .. }), "got {err:?}");
}

#[tokio::test]
async fn test_timeout_surfaces_and_cancels_callee() {
    let hub = start_hub().await;

    let slow = EchoAgent::slow(Duration::from_secs(5));
    let cancelled = Arc::clone(&slow.cancelled);
    let host = runtime(&hub);
    host.register_singleton("slow", Arc::new(slow)).await.unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();

    let err = ask(
        &caller,
        AgentId::singleton("slow"),
        "x",
        Some(Duration::from_millis(150)),
    )
    .await
    .unwrap_err();
    match err {
        AipError::DeliveryTimeout { timeout_ms, .. } => assert_eq!(timeout_ms, 150),
        other => panic!("Expected DeliveryTimeout, got {other:?}"),
    }
    assert_eq!(caller.pending_calls(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(host.inflight_handlers(), 0);
    assert_eq!(hub.pending_routes(), 0);
}

#[tokio::test]
async fn test_abandoned_call_is_withdrawn_and_cancelled() {
    let hub = start_hub().await;

    let slow = EchoAgent::slow(Duration::from_secs(30));
    let cancelled = Arc::clone(&slow.cancelled);
    let host = runtime(&hub);
    host.register_singleton("slow", Arc::new(slow)).await.unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();

    // The caller gives up long before its own deadline.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        ask(
            &caller,
            AgentId::singleton("slow"),
            "x",
            Some(Duration::from_secs(20)),
        ),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(caller.pending_calls(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(host.inflight_handlers(), 0);
    assert_eq!(hub.pending_routes(), 0);

    // Nothing left to drain, so stop returns well inside the drain timeout.
    tokio::time::timeout(Duration::from_secs(2), caller.stop())
        .await
        .expect("stop waited on an abandoned call")
        .unwrap();
}

#[tokio::test]
async fn test_stop_drains_in_flight_calls() {
    let hub = start_hub().await;

    let host = runtime(&hub);
    host.register_singleton("slow", Arc::new(EchoAgent::slow(Duration::from_millis(300))))
        .await
        .unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();

    let in_flight = {
        let caller = caller.clone();
        tokio::spawn(async move { ask(&caller, AgentId::singleton("slow"), "late", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(caller.pending_calls(), 1);

    caller.stop().await.unwrap();
    assert_eq!(caller.state(), ConnectionState::Closed);

    let content = in_flight.await.unwrap().unwrap();
    assert_eq!(content["echo"], "late");

    let err = ask(&caller, AgentId::singleton("slow"), "after", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AipError::ShuttingDown));
}

#[tokio::test]
async fn test_callee_drain_finishes_its_handlers() {
    let hub = start_hub().await;

    let host = runtime(&hub);
    host.register_singleton("slow", Arc::new(EchoAgent::slow(Duration::from_millis(300))))
        .await
        .unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();

    let in_flight = {
        let caller = caller.clone();
        tokio::spawn(async move { ask(&caller, AgentId::singleton("slow"), "owed", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.inflight_handlers(), 1);

    host.stop().await.unwrap();
    let content = in_flight.await.unwrap().unwrap();
    assert_eq!(content["echo"], "owed");
}

#[tokio::test]
async fn test_callee_crash_is_connection_lost() {
    let hub = start_hub().await;

    let mut options = RuntimeOptions::for_hub(hub.local_addr().to_string());
    options.drain_timeout = Duration::from_millis(50);
    let codecs = CodecRegistry::new();
    codecs.register_json::<Interaction>();
    let host = WorkerRuntime::new(options, codecs);
    host.register_singleton("slow", Arc::new(EchoAgent::slow(Duration::from_secs(5))))
        .await
        .unwrap();
    host.start().await.unwrap();

    let caller = runtime(&hub);
    caller.start().await.unwrap();

    let in_flight = {
        let caller = caller.clone();
        tokio::spawn(async move {
            ask(
                &caller,
                AgentId::singleton("slow"),
                "x",
                Some(Duration::from_secs(10)),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    host.stop().await.unwrap();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, AipError::ConnectionLost(_)), "got {err:?}");
}

#[tokio::test]
async fn test_stop_when_returns_after_condition() {
    let hub = start_hub().await;
    let rt = runtime(&hub);
    rt.start().await.unwrap();
    rt.stop_when(tokio::time::sleep(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(rt.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_hub_shutdown_closes_workers() {
    let hub = start_hub().await;
    let rt = runtime(&hub);
    rt.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.shutdown();
    tokio::time::timeout(Duration::from_secs(2), rt.closed())
        .await
        .unwrap();
    assert_eq!(rt.state(), ConnectionState::Closed);
}
