//! Hangar Gateway - 클라이언트에 노출되는 MCP 도구 surface
//!
//! 게이트웨이 자체가 MCP 서버이며, registry_* / hangar_* 도구들로 provider
//! fleet을 조작합니다. 도구 응답은 JSON 문자열입니다.

use hangar_core::batch::{BatchCall, BatchExecutor, BatchOptions};
use hangar_core::config::HangarConfig;
use hangar_core::dispatch::{DispatchEngine, DispatchRequest, DEFAULT_INVOKE_DEADLINE};
use hangar_core::metrics::MetricsCollector;
use hangar_core::registry::{Registry, Target};
use hangar_foundation::{Error, EventBus};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ServerHandler,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 게이트웨이 공유 상태
pub struct GatewayContext {
    pub config: HangarConfig,
    pub registry: Arc<Registry>,
    pub dispatch: Arc<DispatchEngine>,
    pub batch: Arc<BatchExecutor>,
    pub metrics: Arc<MetricsCollector>,
    pub events: Arc<EventBus>,
    pub started_at: Instant,
}

/// MCP Hangar 게이트웨이 서버
#[derive(Clone)]
pub struct HangarGateway {
    ctx: Arc<GatewayContext>,
    tool_router: ToolRouter<Self>,
}

// ============================================================================
// 도구 파라미터
// ============================================================================

/// registry_list / registry_health / registry_metrics / registry_discover
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct EmptyParams {}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProviderParams {
    #[schemars(description = "Provider or group ID")]
    pub provider: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct InvokeParams {
    #[schemars(description = "Provider or group ID to route the call to")]
    pub provider: String,
    #[schemars(description = "Tool name to invoke")]
    pub tool: String,
    #[schemars(description = "Tool arguments as a JSON object")]
    #[serde(default)]
    pub arguments: Value,
    #[schemars(description = "Call deadline in seconds (default 30)")]
    pub timeout: Option<f64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BatchCallParams {
    #[schemars(description = "Provider or group ID")]
    pub provider: String,
    #[schemars(description = "Tool name")]
    pub tool: String,
    #[schemars(description = "Tool arguments as a JSON object")]
    #[serde(default)]
    pub arguments: Value,
    #[schemars(description = "Per-call deadline in seconds")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Default, serde::Deserialize, schemars::JsonSchema)]
pub struct BatchOptionsParams {
    #[schemars(description = "Maximum concurrent dispatches")]
    pub max_parallel: Option<usize>,
    #[schemars(description = "Batch deadline in seconds (default 60)")]
    pub timeout: Option<f64>,
    #[schemars(description = "Cancel remaining calls on first error")]
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BatchParams {
    #[schemars(description = "Calls to execute in parallel; results preserve input order")]
    pub calls: Vec<BatchCallParams>,
    #[schemars(description = "Batch options")]
    pub options: Option<BatchOptionsParams>,
}

// ============================================================================
// 응답 헬퍼
// ============================================================================

fn ok_json(value: Value) -> String {
    serde_json::to_string_pretty(&value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn error_json(e: &Error) -> String {
    ok_json(json!({
        "error": {
            "code": e.code(),
            "kind": e.kind(),
            "message": e.to_string(),
        }
    }))
}

#[tool_router]
impl HangarGateway {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    async fn invoke_inner(&self, params: InvokeParams) -> String {
        let deadline = params
            .timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_INVOKE_DEADLINE);
        let request = DispatchRequest::new(&params.provider, &params.tool, params.arguments)
            .with_deadline(deadline);

        let cancel = CancellationToken::new();
        match self.ctx.dispatch.dispatch(request, &cancel).await {
            Ok(value) => ok_json(value),
            Err(e) => error_json(&e),
        }
    }

    #[tool(description = "List all providers and groups with state, mode and tool counts")]
    async fn registry_list(&self, Parameters(_params): Parameters<EmptyParams>) -> String {
        let mut providers = Vec::new();
        for manager in self.ctx.registry.providers() {
            let status = manager.status().await;
            providers.push(json!({
                "id": status.provider,
                "state": status.state,
                "mode": status.mode,
                "tools_count": status.tools_count,
            }));
        }

        let groups: Vec<Value> = self
            .ctx
            .registry
            .groups()
            .into_iter()
            .map(|group| {
                let members = self.ctx.registry.member_snapshots(&group);
                serde_json::to_value(group.status(&members)).unwrap_or(Value::Null)
            })
            .collect();

        ok_json(json!({ "providers": providers, "groups": groups }))
    }

    #[tool(description = "Get tool schemas (JSON Schema) for a provider or group")]
    async fn registry_tools(&self, Parameters(params): Parameters<ProviderParams>) -> String {
        match self.ctx.registry.resolve(&params.provider) {
            Ok(Target::Provider(manager)) => {
                // 선언된 도구가 없고 cold면 발견을 위해 시작
                if manager.tools().await.is_empty() {
                    if let Err(e) = manager.ensure_ready().await {
                        return error_json(&e);
                    }
                }
                let tools = manager.tools().await;
                ok_json(json!({
                    "provider": params.provider,
                    "state": manager.state(),
                    "tools": tools,
                }))
            }
            Ok(Target::Group(group)) => {
                let members = self.ctx.registry.member_snapshots(&group);
                let member_id = match group.pick_member(&members) {
                    Ok(id) => id,
                    Err(e) => return error_json(&e),
                };
                let Some(manager) = self.ctx.registry.provider(&member_id) else {
                    return error_json(&Error::UnknownTarget(member_id.to_string()));
                };
                if let Err(e) = manager.ensure_ready().await {
                    group.record_outcome(false, e.counts_for_health());
                    return error_json(&e);
                }
                group.record_outcome(true, true);
                ok_json(json!({
                    "provider": params.provider,
                    "group": true,
                    "member": member_id.to_string(),
                    "tools": manager.tools().await,
                }))
            }
            Err(e) => error_json(&e),
        }
    }

    #[tool(description = "Invoke a tool on a provider or group")]
    async fn registry_invoke(&self, Parameters(params): Parameters<InvokeParams>) -> String {
        self.invoke_inner(params).await
    }

    #[tool(description = "Invoke a tool on a provider or group (alias of registry_invoke)")]
    async fn hangar_call(&self, Parameters(params): Parameters<InvokeParams>) -> String {
        self.invoke_inner(params).await
    }

    #[tool(description = "Execute multiple tool calls in parallel; results preserve input order")]
    async fn hangar_batch(&self, Parameters(params): Parameters<BatchParams>) -> String {
        let calls: Vec<BatchCall> = params
            .calls
            .into_iter()
            .map(|c| BatchCall {
                provider: c.provider,
                tool: c.tool,
                arguments: c.arguments,
                timeout: c.timeout,
            })
            .collect();

        let options = params.options.unwrap_or_default();
        let result = self
            .ctx
            .batch
            .execute(
                calls,
                BatchOptions {
                    max_parallel: options.max_parallel,
                    timeout: options.timeout,
                    fail_fast: options.fail_fast,
                },
            )
            .await;

        ok_json(serde_json::to_value(&result).unwrap_or(Value::Null))
    }

    #[tool(description = "Warm up a provider (or all members of a group) ahead of use")]
    async fn registry_start(&self, Parameters(params): Parameters<ProviderParams>) -> String {
        match self.ctx.registry.resolve(&params.provider) {
            Ok(Target::Provider(manager)) => match manager.ensure_ready().await {
                Ok(()) => ok_json(json!({
                    "provider": params.provider,
                    "state": manager.state(),
                })),
                Err(e) => error_json(&e),
            },
            Ok(Target::Group(group)) => {
                let mut started = Vec::new();
                let mut failed = Vec::new();
                for member in &group.spec().members {
                    let Some(manager) = self.ctx.registry.provider(&member.id) else {
                        continue;
                    };
                    match manager.ensure_ready().await {
                        Ok(()) => started.push(member.id.to_string()),
                        Err(e) => failed.push(json!({
                            "id": member.id.to_string(),
                            "error": e.kind(),
                        })),
                    }
                }
                ok_json(json!({
                    "group": params.provider,
                    "started": started,
                    "failed": failed,
                }))
            }
            Err(e) => error_json(&e),
        }
    }

    #[tool(description = "Stop a provider (or all members of a group)")]
    async fn registry_stop(&self, Parameters(params): Parameters<ProviderParams>) -> String {
        match self.ctx.registry.resolve(&params.provider) {
            Ok(Target::Provider(manager)) => {
                manager.shutdown("requested").await;
                ok_json(json!({
                    "provider": params.provider,
                    "state": manager.state(),
                }))
            }
            Ok(Target::Group(group)) => {
                let mut stopped = Vec::new();
                for member in &group.spec().members {
                    if let Some(manager) = self.ctx.registry.provider(&member.id) {
                        manager.shutdown("requested").await;
                        stopped.push(member.id.to_string());
                    }
                }
                ok_json(json!({ "group": params.provider, "stopped": stopped }))
            }
            Err(e) => error_json(&e),
        }
    }

    #[tool(description = "Health overview for all providers and groups")]
    async fn registry_health(&self, Parameters(_params): Parameters<EmptyParams>) -> String {
        let mut providers = Vec::new();
        for manager in self.ctx.registry.providers() {
            let status = manager.status().await;
            providers.push(json!({
                "id": status.provider,
                "state": status.state,
                "alive": status.alive,
                "health": status.health,
            }));
        }

        let groups: Vec<Value> = self
            .ctx
            .registry
            .groups()
            .into_iter()
            .map(|group| {
                let members = self.ctx.registry.member_snapshots(&group);
                let status = group.status(&members);
                json!({
                    "id": status.group_id,
                    "is_available": status.is_available,
                    "healthy_count": status.healthy_count,
                    "circuit_state": status.circuit_state,
                })
            })
            .collect();

        ok_json(json!({ "providers": providers, "groups": groups }))
    }

    #[tool(description = "Aggregated invocation/health metrics snapshot")]
    async fn registry_metrics(&self, Parameters(_params): Parameters<EmptyParams>) -> String {
        let mut snapshot = self.ctx.metrics.snapshot();
        snapshot["events_published"] = Value::from(self.ctx.events.event_count());
        snapshot["events_dropped"] = Value::from(self.ctx.events.dropped_count());
        ok_json(snapshot)
    }

    #[tool(description = "Discover configured providers with descriptions (no side effects)")]
    async fn registry_discover(&self, Parameters(_params): Parameters<EmptyParams>) -> String {
        let mut entries = Vec::new();
        for manager in self.ctx.registry.providers() {
            let status = manager.status().await;
            entries.push(json!({
                "id": status.provider,
                "mode": status.mode,
                "state": status.state,
                "description": status.description,
                "tools": status.tools_cached,
            }));
        }
        for group in self.ctx.registry.groups() {
            let spec = group.spec();
            entries.push(json!({
                "id": spec.id.to_string(),
                "mode": "group",
                "description": spec.description,
                "strategy": spec.strategy.as_str(),
                "members": spec.members.iter().map(|m| m.id.to_string()).collect::<Vec<_>>(),
            }));
        }
        ok_json(json!({ "entries": entries }))
    }

    #[tool(description = "Detailed runtime info for one provider or group")]
    async fn registry_details(&self, Parameters(params): Parameters<ProviderParams>) -> String {
        match self.ctx.registry.resolve(&params.provider) {
            Ok(Target::Provider(manager)) => {
                let status = manager.status().await;
                let stderr_tail = manager.stderr_tail().await;
                let mut detail = serde_json::to_value(&status).unwrap_or(Value::Null);
                detail["tools"] = serde_json::to_value(manager.tools().await).unwrap_or(Value::Null);
                detail["stderr_tail"] = Value::from(stderr_tail);
                ok_json(detail)
            }
            Ok(Target::Group(group)) => {
                let members = self.ctx.registry.member_snapshots(&group);
                ok_json(serde_json::to_value(group.status(&members)).unwrap_or(Value::Null))
            }
            Err(e) => error_json(&e),
        }
    }
}

#[tool_handler]
impl ServerHandler for HangarGateway {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "MCP Hangar - control-plane gateway over a fleet of MCP providers. \
                 Use registry_list to see providers, registry_tools for schemas, \
                 registry_invoke (or hangar_call) to invoke a tool, and hangar_batch \
                 for parallel fan-out."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::testing::{mock_provider_spec, MockTransportFactory};
    use hangar_core::provider::ProviderManager;

    fn test_gateway() -> HangarGateway {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::empty(Arc::clone(&events)));

        let factory = Arc::new(MockTransportFactory::new());
        let manager = Arc::new(ProviderManager::new(
            mock_provider_spec("math"),
            factory,
            Arc::clone(&events),
        ));
        registry.insert_provider(manager);

        let config = HangarConfig::default();
        let dispatch = Arc::new(DispatchEngine::new(
            Arc::clone(&registry),
            &config.rate_limit,
            &config.concurrency,
        ));
        let batch = Arc::new(BatchExecutor::new(
            Arc::clone(&dispatch),
            Arc::clone(&events),
        ));
        let metrics = Arc::new(MetricsCollector::new());

        HangarGateway::new(Arc::new(GatewayContext {
            config,
            registry,
            dispatch,
            batch,
            metrics,
            events,
            started_at: Instant::now(),
        }))
    }

    #[tokio::test]
    async fn test_registry_list_shape() {
        let gateway = test_gateway();
        let raw = gateway.registry_list(Parameters(EmptyParams {})).await;
        let body: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(body["providers"][0]["id"], "math");
        assert_eq!(body["providers"][0]["state"], "cold");
        assert!(body["groups"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_roundtrip() {
        let gateway = test_gateway();
        let raw = gateway
            .hangar_call(Parameters(InvokeParams {
                provider: "math".into(),
                tool: "add".into(),
                arguments: json!({"a": 20, "b": 22}),
                timeout: None,
            }))
            .await;

        let body: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(body["structuredContent"]["result"], json!(42.0));
    }

    #[tokio::test]
    async fn test_unknown_target_error_shape() {
        let gateway = test_gateway();
        let raw = gateway
            .registry_invoke(Parameters(InvokeParams {
                provider: "ghost".into(),
                tool: "add".into(),
                arguments: json!({}),
                timeout: None,
            }))
            .await;

        let body: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(body["error"]["kind"], "unknown_target");
        assert_eq!(body["error"]["code"], -32002);
    }

    #[tokio::test]
    async fn test_batch_tool_preserves_order() {
        let gateway = test_gateway();
        let calls = (0..4)
            .map(|i| BatchCallParams {
                provider: "math".into(),
                tool: "add".into(),
                arguments: json!({"a": i, "b": 0}),
                timeout: None,
            })
            .collect();

        let raw = gateway
            .hangar_batch(Parameters(BatchParams {
                calls,
                options: None,
            }))
            .await;

        let body: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(body["total"], 4);
        assert_eq!(body["succeeded"], 4);
        for (i, result) in body["results"].as_array().unwrap().iter().enumerate() {
            assert_eq!(result["index"], i);
        }
    }

    #[tokio::test]
    async fn test_registry_details_provider() {
        let gateway = test_gateway();
        let raw = gateway
            .registry_details(Parameters(ProviderParams {
                provider: "math".into(),
            }))
            .await;

        let body: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(body["provider"], "math");
        assert_eq!(body["mode"], "subprocess");
    }
}
