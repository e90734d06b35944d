//! 설정 타입 정의
//!
//! `hangar.json`의 스키마. providers 맵 하나에 단일 provider와 group 항목이
//! 함께 들어오며, `mode` 필드로 구분합니다.

use hangar_foundation::{Error, ProviderId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// 기본값
// ============================================================================

fn default_idle_ttl_s() -> u64 {
    300
}

fn default_health_interval_s() -> u64 {
    30
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_in_flight() -> usize {
    10
}

fn default_network() -> String {
    "none".to_string()
}

fn default_read_only() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_s() -> f64 {
    30.0
}

fn default_global_limit() -> usize {
    50
}

fn default_connect_timeout_s() -> f64 {
    5.0
}

fn default_read_timeout_s() -> f64 {
    30.0
}

// ============================================================================
// 최상위 설정
// ============================================================================

/// Hangar 전체 설정
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HangarConfig {
    /// Provider/Group 정의 (id → 항목)
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,

    /// 헬스 체크 워커 설정
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// 전역 요청 속도 제한
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// 동시성 제한 (전역 + provider 기본값)
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// 도메인 이벤트 append-only 로그 경로 (없으면 비활성)
    ///
    /// 존재 여부가 코어 동작을 바꾸지 않습니다.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<PathBuf>,
}

/// 헬스 체크 워커 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_s")]
    pub interval_s: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: default_health_interval_s(),
        }
    }
}

/// 전역 속도 제한 설정 (0이면 비활성)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub rps: u32,
}

/// 동시성 제한 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// 전체 in-flight 호출 상한 (0이면 무제한)
    #[serde(default = "default_global_limit")]
    pub global_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_limit: default_global_limit(),
        }
    }
}

// ============================================================================
// Provider 항목
// ============================================================================

/// providers 맵의 한 항목 (provider 또는 group)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderEntry {
    pub mode: Mode,

    /// AI 모델에게 보여줄 설명
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // --- subprocess ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    // --- container ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,

    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default = "default_read_only")]
    pub read_only: bool,

    // --- remote ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpTimeouts>,

    // --- lifecycle ---
    #[serde(default = "default_idle_ttl_s")]
    pub idle_ttl_s: u64,

    #[serde(default = "default_health_interval_s")]
    pub health_check_interval_s: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// 선언된 도구 스키마 (cold 상태에서의 목록 조회용 fallback)
    #[serde(default)]
    pub tools: Vec<DeclaredTool>,

    // --- group ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_healthy: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,

    #[serde(default)]
    pub members: Vec<MemberEntry>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            mode: Mode::Subprocess,
            description: None,
            command: None,
            env: HashMap::new(),
            image: None,
            volumes: Vec::new(),
            resources: None,
            network: default_network(),
            read_only: default_read_only(),
            endpoint: None,
            http: None,
            idle_ttl_s: default_idle_ttl_s(),
            health_check_interval_s: default_health_interval_s(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_in_flight: default_max_in_flight(),
            tools: Vec::new(),
            strategy: None,
            min_healthy: None,
            circuit_breaker: None,
            members: Vec::new(),
        }
    }
}

/// Provider 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Subprocess,
    Container,
    Remote,
    Group,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Subprocess => "subprocess",
            Mode::Container => "container",
            Mode::Remote => "remote",
            Mode::Group => "group",
        }
    }
}

/// 컨테이너 리소스 제한
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

/// remote 모드의 HTTP 타임아웃
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTimeouts {
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout: f64,

    #[serde(default = "default_read_timeout_s")]
    pub read_timeout: f64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout_s(),
            read_timeout: default_read_timeout_s(),
        }
    }
}

/// 설정에 선언된 도구 스키마
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredTool {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// 라우팅 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    Priority,
    LeastConnections,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::Random => "random",
            Strategy::Priority => "priority",
            Strategy::LeastConnections => "least_connections",
        }
    }
}

/// 서킷 브레이커 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_s")]
    pub reset_timeout_s: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_s: default_reset_timeout_s(),
        }
    }
}

/// 그룹 멤버 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

// ============================================================================
// 검증된 스펙 (런타임에서 사용하는 형태)
// ============================================================================

/// 검증된 단일 provider 스펙
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub id: ProviderId,
    pub mode: Mode,
    pub description: Option<String>,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub image: Option<String>,
    pub volumes: Vec<String>,
    pub resources: ResourceLimits,
    pub network: String,
    pub read_only: bool,
    pub endpoint: Option<String>,
    pub http: HttpTimeouts,
    pub idle_ttl: Duration,
    pub health_check_interval: Duration,
    pub max_consecutive_failures: u32,
    pub max_in_flight: usize,
    pub declared_tools: Vec<DeclaredTool>,
}

impl ProviderSpec {
    /// remote 모드의 읽기 타임아웃
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http.read_timeout)
    }
}

/// 검증된 그룹 스펙
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: ProviderId,
    pub description: Option<String>,
    pub strategy: Strategy,
    pub min_healthy: usize,
    pub circuit_breaker: CircuitBreakerSettings,
    pub members: Vec<GroupMember>,
}

/// 검증된 그룹 멤버
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub id: ProviderId,
    pub weight: u32,
    pub priority: u32,
}

// ============================================================================
// 항목 → 스펙 변환
// ============================================================================

impl ProviderEntry {
    /// 단일 provider 항목 검증
    pub fn to_provider_spec(&self, id: ProviderId) -> Result<ProviderSpec> {
        match self.mode {
            Mode::Subprocess => {
                if self.command.as_ref().map_or(true, |c| c.is_empty()) {
                    return Err(Error::Config(format!(
                        "provider '{}': subprocess mode requires a non-empty 'command'",
                        id
                    )));
                }
            }
            Mode::Container => {
                if self.image.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::Config(format!(
                        "provider '{}': container mode requires 'image'",
                        id
                    )));
                }
            }
            Mode::Remote => {
                if self.endpoint.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::Config(format!(
                        "provider '{}': remote mode requires 'endpoint'",
                        id
                    )));
                }
            }
            Mode::Group => {
                return Err(Error::Config(format!(
                    "'{}' is a group, not a provider",
                    id
                )))
            }
        }

        Ok(ProviderSpec {
            id,
            mode: self.mode,
            description: self.description.clone(),
            command: self.command.clone().unwrap_or_default(),
            env: self.env.clone(),
            image: self.image.clone(),
            volumes: self.volumes.clone(),
            resources: self.resources.clone().unwrap_or(ResourceLimits {
                memory: Some("256m".to_string()),
                cpu: Some("0.5".to_string()),
            }),
            network: self.network.clone(),
            read_only: self.read_only,
            endpoint: self.endpoint.clone(),
            http: self.http.clone().unwrap_or_default(),
            idle_ttl: Duration::from_secs(self.idle_ttl_s),
            health_check_interval: Duration::from_secs(self.health_check_interval_s),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
            max_in_flight: self.max_in_flight.max(1),
            declared_tools: self.tools.clone(),
        })
    }

    /// 그룹 항목 검증
    ///
    /// 멤버 존재 여부와 그룹 중첩 금지는 전체 설정을 아는 Registry에서
    /// 검사합니다.
    pub fn to_group_spec(&self, id: ProviderId) -> Result<GroupSpec> {
        if self.mode != Mode::Group {
            return Err(Error::Config(format!("'{}' is not a group", id)));
        }
        if self.members.is_empty() {
            return Err(Error::Config(format!(
                "group '{}' must declare at least one member",
                id
            )));
        }

        let min_healthy = self.min_healthy.unwrap_or(0);
        if min_healthy > self.members.len() {
            return Err(Error::Config(format!(
                "group '{}': min_healthy {} exceeds member count {}",
                id,
                min_healthy,
                self.members.len()
            )));
        }

        let mut members = Vec::with_capacity(self.members.len());
        for m in &self.members {
            members.push(GroupMember {
                id: ProviderId::new(&m.id)?,
                weight: m.weight.unwrap_or(1).max(1),
                priority: m.priority.unwrap_or(0),
            });
        }

        Ok(GroupSpec {
            id,
            description: self.description.clone(),
            strategy: self.strategy.unwrap_or(Strategy::RoundRobin),
            min_healthy,
            circuit_breaker: self.circuit_breaker.clone().unwrap_or_default(),
            members,
        })
    }
}

// ============================================================================
// 테스트
// ============================================================================
