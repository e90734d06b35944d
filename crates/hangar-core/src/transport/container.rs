//! Container Transport - 컨테이너 런타임 기반 stdio 통신
//!
//! subprocess와 동일한 프로토콜이지만 argv를 컨테이너 런타임 명령으로
//! 구성합니다. rootless 런타임(podman)을 우선 탐지하고, 기본 정책은
//! network=none, 읽기 전용 루트, 모든 capability 제거입니다.

use super::{JsonRpcNotification, StdioTransport, Transport};
use crate::config::ProviderSpec;
use async_trait::async_trait;
use hangar_foundation::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 호스트 경로 마운트 금지 목록
pub const VOLUME_DENY_LIST: &[&str] = &[
    "/", "/etc", "/var", "/usr", "/bin", "/sbin", "/lib", "/lib64", "/boot", "/root", "/sys",
    "/proc",
];

/// 사용 가능한 컨테이너 런타임 탐지 (rootless 우선)
pub fn detect_container_runtime() -> Result<String> {
    for runtime in ["podman", "docker"] {
        if which::which(runtime).is_ok() {
            debug!("Detected container runtime: {}", runtime);
            return Ok(runtime.to_string());
        }
    }
    Err(Error::Config(
        "no container runtime found (tried podman, docker)".to_string(),
    ))
}

/// 볼륨 마운트 검증
///
/// `host:container[:mode]` 형식만 허용하고 호스트 경로가 금지 목록에 있으면
/// 거부합니다.
pub(crate) fn validate_volume(volume: &str) -> Result<()> {
    let mut parts = volume.splitn(3, ':');
    let host = parts.next().unwrap_or_default();
    let container = parts.next().unwrap_or_default();

    if host.is_empty() || container.is_empty() {
        return Err(Error::Config(format!(
            "invalid volume spec '{}', expected host:container[:mode]",
            volume
        )));
    }

    let normalized = Path::new(host)
        .components()
        .collect::<std::path::PathBuf>();
    let normalized = normalized.to_string_lossy();

    for denied in VOLUME_DENY_LIST {
        if normalized == *denied {
            return Err(Error::Config(format!(
                "volume host path '{}' is denied",
                host
            )));
        }
    }

    Ok(())
}

/// 컨테이너 실행 argv 구성
pub(crate) fn build_run_args(spec: &ProviderSpec) -> Result<Vec<String>> {
    let image = spec
        .image
        .as_deref()
        .ok_or_else(|| Error::Config(format!("provider '{}': missing image", spec.id)))?;

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--network".into(),
        spec.network.clone(),
        "--cap-drop".into(),
        "ALL".into(),
    ];

    if spec.read_only {
        args.push("--read-only".into());
    }

    if let Some(memory) = &spec.resources.memory {
        args.push("--memory".into());
        args.push(memory.clone());
    }
    if let Some(cpu) = &spec.resources.cpu {
        args.push("--cpus".into());
        args.push(cpu.clone());
    }

    for volume in &spec.volumes {
        validate_volume(volume)?;
        args.push("-v".into());
        args.push(volume.clone());
    }

    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }

    args.push(image.to_string());
    Ok(args)
}

/// Container Transport
///
/// 내부적으로 stdio transport를 그대로 사용합니다.
pub struct ContainerTransport {
    inner: StdioTransport,
}

impl ContainerTransport {
    /// 컨테이너 실행 및 연결
    pub async fn launch(
        spec: &ProviderSpec,
        notifications: mpsc::Sender<JsonRpcNotification>,
    ) -> Result<Self> {
        let runtime = detect_container_runtime()?;
        let args = build_run_args(spec)?;

        info!(
            "Launching container provider '{}': {} {}",
            spec.id,
            runtime,
            args.join(" ")
        );

        // env는 -e 플래그로 컨테이너 내부에 전달되므로 런타임 프로세스에는
        // 넘기지 않는다
        let inner = StdioTransport::spawn(&runtime, &args, &HashMap::new(), notifications).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for ContainerTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.inner.request(method, params, deadline, cancel).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.notify(method, params).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.inner.stderr_tail()
    }
}

// ============================================================================
// 테스트
// ============================================================================
