// ABOUTME: End-to-end pipeline scenarios with scripted engines and a manual clock
// ABOUTME: Burst limiting, validator rejection, breaker fallback, tracebacks, blocking and policy

mod common;

use codegate_gateway::admission::CounterStore;
use codegate_gateway::clock::Clock;
use codegate_gateway::executors::{EngineError, ExitStatus};
use codegate_gateway::resilience::CircuitPhase;
use codegate_gateway::{
    Engine, ErrorKind, ExecutionRequest, GatewayConfig, LimitType, SourceFile, Tier,
};
use common::{harness, harness_with, output, ScriptedExecutor};
use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn anonymous(code: &str) -> ExecutionRequest {
    ExecutionRequest::source(code, Tier::Anonymous)
        .with_client_addr(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))
}

#[tokio::test]
async fn test_fourth_anonymous_request_in_burst_window_is_limited() {
    let h = harness(
        ScriptedExecutor::printing(Engine::Light, "hi\n"),
        ScriptedExecutor::printing(Engine::Heavy, "hi\n"),
    );

    for _ in 0..3 {
        let result = h.gateway.submit(anonymous("print('hi')")).await;
        assert_eq!(result.error_kind, ErrorKind::None);
        assert_eq!(result.stdout, "hi\n");
    }
    let limited = h.gateway.submit(anonymous("print('hi')")).await;

    assert_eq!(limited.error_kind, ErrorKind::RateLimited);
    assert_eq!(limited.retry_after_ms, Some(10_000));
    assert_eq!(limited.detail.unwrap().limit_type, Some(LimitType::Burst));
    assert_eq!(h.light.calls(), 3);
}

#[tokio::test]
async fn test_forbidden_import_is_rejected_but_still_counted() {
    let h = harness(
        ScriptedExecutor::printing(Engine::Light, ""),
        ScriptedExecutor::printing(Engine::Heavy, ""),
    );

    let request = ExecutionRequest::source("import subprocess\nsubprocess.run(['ls'])", Tier::Free)
        .with_identity("student-1");
    let result = h.gateway.submit(request).await;

    assert_eq!(result.error_kind, ErrorKind::ValidationFailed);
    let detail = result.detail.unwrap();
    assert_eq!(detail.rule_id.as_deref(), Some("forbidden_module:subprocess"));
    assert_eq!(h.light.calls() + h.heavy.calls(), 0);

    let burst = h
        .store
        .get("student-1:burst:10s", h.clock.now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(burst.count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_heavy_outage_opens_breaker_and_light_serves_the_sixth_request() {
    let h = harness(
        ScriptedExecutor::printing(Engine::Light, "from light\n"),
        ScriptedExecutor::failing(Engine::Heavy, EngineError::Unavailable("docker down".into())),
    );
    let request = || {
        ExecutionRequest::source("print('from light')", Tier::Paid)
            .with_identity("paid-user")
            .with_engine_hint(Engine::Heavy)
    };

    for _ in 0..5 {
        let result = h.gateway.submit(request()).await;
        assert_eq!(result.error_kind, ErrorKind::None);
        assert!(result.fallback_used);
    }
    let heavy_calls = h.heavy.calls();
    assert_eq!(heavy_calls, 15);

    let sixth = h.gateway.submit(request()).await;

    assert_eq!(sixth.error_kind, ErrorKind::None);
    assert_eq!(sixth.stdout, "from light\n");
    assert_eq!(sixth.engine, Some(Engine::Light));
    assert!(sixth.fallback_used);
    assert_eq!(h.heavy.calls(), heavy_calls, "open circuit must not reach the heavy engine");

    let health = h.gateway.health().await;
    let heavy = health.engines.iter().find(|e| e.engine == Engine::Heavy).unwrap();
    assert_eq!(heavy.circuit.phase, CircuitPhase::Open);
}

#[tokio::test]
async fn test_multi_file_runtime_exception_is_a_successful_run() {
    let traceback = "Traceback (most recent call last):\n  File \"main.py\", line 2, in <module>\nZeroDivisionError: division by zero\n";
    let heavy = ScriptedExecutor::new(Engine::Heavy, move |job| {
        assert_eq!(job.files.len(), 2);
        assert_eq!(job.entry_point, "main.py");
        Ok(output(Engine::Heavy, "loaded\n", traceback, ExitStatus::Exited(1)))
    });
    let h = harness(ScriptedExecutor::printing(Engine::Light, ""), heavy);

    let request = ExecutionRequest::project(
        vec![
            SourceFile::new("main.py", "from helpers import ratio\nprint(ratio(1, 0))\n"),
            SourceFile::new("helpers.py", "print('loaded')\ndef ratio(a, b):\n    return a / b\n"),
        ],
        "main.py",
        Tier::Free,
    )
    .with_identity("student-2");
    let result = h.gateway.submit(request).await;

    assert_eq!(result.error_kind, ErrorKind::None);
    assert_eq!(result.engine, Some(Engine::Heavy));
    assert_eq!(result.exit_code, Some(1));
    assert!(result.stderr.contains("ZeroDivisionError"));
    assert!(result.timing_ms > 0);
    assert!(!result.fallback_used);
    assert_eq!(h.light.calls(), 0);
}

#[tokio::test]
async fn test_sandbox_timeout_surfaces_as_timeout() {
    let light = ScriptedExecutor::new(Engine::Light, |_| {
        Ok(output(Engine::Light, "", "", ExitStatus::TimedOut))
    });
    let h = harness(light, ScriptedExecutor::printing(Engine::Heavy, ""));

    let result = h
        .gateway
        .submit(ExecutionRequest::source("total = sum(range(10))\nprint(total)", Tier::Free).with_identity("u"))
        .await;

    assert_eq!(result.error_kind, ErrorKind::Timeout);
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn test_oversized_source_never_reaches_admission() {
    let h = harness(
        ScriptedExecutor::printing(Engine::Light, ""),
        ScriptedExecutor::printing(Engine::Heavy, ""),
    );

    let request = ExecutionRequest::source("#".repeat(20 * 1024), Tier::Free).with_identity("big");
    let result = h.gateway.submit(request).await;

    assert_eq!(result.error_kind, ErrorKind::ValidationFailed);
    assert_eq!(
        result.detail.unwrap().rule_id.as_deref(),
        Some("request:code_too_large")
    );
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_check_consumes_no_quota() {
    let h = harness(
        ScriptedExecutor::printing(Engine::Light, ""),
        ScriptedExecutor::printing(Engine::Heavy, ""),
    );

    let verdict = h
        .gateway
        .check(&ExecutionRequest::source("import socket", Tier::Anonymous))
        .unwrap();

    assert!(!verdict.safe);
    assert_eq!(verdict.rule_id.as_deref(), Some("forbidden_module:socket"));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_request_flood_blocks_identity_for_later_requests() {
    let mut config = GatewayConfig::default();
    config.monitor.max_executions_per_minute = 4;
    let h = harness_with(
        config,
        ScriptedExecutor::printing(Engine::Light, "ok\n"),
        ScriptedExecutor::printing(Engine::Heavy, "ok\n"),
    );
    let request = || ExecutionRequest::source("print('ok')", Tier::Paid).with_identity("flooder");

    for _ in 0..5 {
        h.gateway.submit(request()).await;
    }
    let blocked = h.gateway.submit(request()).await;

    assert_eq!(blocked.error_kind, ErrorKind::RateLimited);
    assert_eq!(blocked.detail.unwrap().limit_type, Some(LimitType::Blocked));
    assert_eq!(blocked.retry_after_ms, Some(900_000));
    assert_eq!(h.light.calls(), 5);

    h.clock.advance(Duration::from_secs(901));
    let after = h.gateway.submit(request()).await;
    assert_eq!(after.error_kind, ErrorKind::None);
}

#[tokio::test]
async fn test_medium_confidence_rule_can_be_downgraded_to_a_warning() {
    let mut config = GatewayConfig::default();
    config.validator.reject_medium = false;
    let h = harness_with(
        config,
        ScriptedExecutor::printing(Engine::Light, "3\n"),
        ScriptedExecutor::printing(Engine::Heavy, ""),
    );
    let code = "class P:\n    x = 3\nprint(getattr(P, 'x'))\n";

    let warned = h
        .gateway
        .submit(ExecutionRequest::source(code, Tier::Free).with_identity("a"))
        .await;
    assert_eq!(warned.error_kind, ErrorKind::None);

    let strict = harness(
        ScriptedExecutor::printing(Engine::Light, "3\n"),
        ScriptedExecutor::printing(Engine::Heavy, ""),
    );
    let rejected = strict
        .gateway
        .submit(ExecutionRequest::source(code, Tier::Free).with_identity("a"))
        .await;
    assert_eq!(rejected.error_kind, ErrorKind::ValidationFailed);
}

#[tokio::test]
async fn test_no_engine_available_is_service_unavailable() {
    let light = ScriptedExecutor::failing(Engine::Light, EngineError::Unavailable("stopped".into()));
    light.set_available(false);
    let h = harness(
        light,
        ScriptedExecutor::failing(Engine::Heavy, EngineError::Unavailable("docker down".into())),
    );

    let health = h.gateway.health().await;
    assert!(!health.healthy);

    let result = h
        .gateway
        .submit(
            ExecutionRequest::source("print(1)", Tier::Paid)
                .with_identity("u")
                .with_engine_hint(Engine::Light),
        )
        .await;
    assert_eq!(result.error_kind, ErrorKind::ServiceUnavailable);
}
