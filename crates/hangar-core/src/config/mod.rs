//! 설정 시스템
//!
//! JSON 설정 파일의 스키마(`types`)와 검색/로드(`loader`).

mod loader;
mod types;

pub use loader::{
    load_config_from_file, strip_json_comments, ConfigLoader, CONFIG_ENV_VAR, CONFIG_FILE_NAME,
};
pub use types::{
    CircuitBreakerSettings, ConcurrencyConfig, DeclaredTool, GroupMember, GroupSpec, HangarConfig,
    HealthCheckConfig, HttpTimeouts, MemberEntry, Mode, ProviderEntry, ProviderSpec,
    RateLimitConfig, ResourceLimits, Strategy,
};
