//! HTTP surface - Streamable HTTP (/mcp) + 헬스 프로브 + 메트릭
//!
//! 헬스 응답 형식:
//! `{status, checks: [{name, status, duration_ms}], version, uptime_seconds}`

use crate::gateway::{GatewayContext, HangarGateway};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// 전체 HTTP 라우터 구성
pub fn build_router(gateway: HangarGateway, ctx: Arc<GatewayContext>) -> Router {
    let mcp_service = StreamableHttpService::new(
        move || Ok(gateway.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    Router::new()
        .nest_service("/mcp", mcp_service)
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/health/startup", get(health_ready))
        .route("/metrics", get(metrics))
        .with_state(ctx)
}

/// 헬스 체크 하나 실행 후 결과 기록
fn run_check(name: &str, ok: bool, started: Instant) -> Value {
    json!({
        "name": name,
        "status": if ok { "pass" } else { "fail" },
        "duration_ms": started.elapsed().as_millis() as u64,
    })
}

fn health_body(ctx: &GatewayContext, checks: Vec<Value>) -> Json<Value> {
    let healthy = checks.iter().all(|c| c["status"] == "pass");
    Json(json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": checks,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
    }))
}

/// liveness: 프로세스가 응답하는지만 확인
async fn health_live(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let started = Instant::now();
    let checks = vec![run_check("process", true, started)];
    health_body(&ctx, checks)
}

/// readiness: registry와 이벤트 버스 접근 가능 여부
async fn health_ready(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let mut checks = Vec::new();

    let started = Instant::now();
    let provider_count = ctx.registry.providers().len() + ctx.registry.groups().len();
    checks.push(run_check("registry", provider_count > 0 || ctx.config.providers.is_empty(), started));

    let started = Instant::now();
    // 구독자 유무와 무관하게 발행 경로가 살아있으면 통과
    let _ = ctx.events.event_count();
    checks.push(run_check("event_bus", true, started));

    health_body(&ctx, checks)
}

/// 메트릭 스냅샷 (JSON)
async fn metrics(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let mut snapshot = ctx.metrics.snapshot();
    snapshot["events_published"] = Value::from(ctx.events.event_count());
    snapshot["events_dropped"] = Value::from(ctx.events.dropped_count());
    Json(snapshot)
}
