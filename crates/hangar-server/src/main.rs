//! MCP Hangar server - main entry point

mod gateway;
mod http;

use clap::Parser;
use gateway::{GatewayContext, HangarGateway};
use hangar_core::audit::EventLogWriter;
use hangar_core::batch::BatchExecutor;
use hangar_core::dispatch::DispatchEngine;
use hangar_core::metrics::MetricsCollector;
use hangar_core::registry::Registry;
use hangar_core::transport::DefaultTransportFactory;
use hangar_core::worker::{HealthWorker, IdleGcWorker};
use hangar_core::ConfigLoader;
use hangar_foundation::event::system as system_events;
use hangar_foundation::{Error, EventBus, EventListener};
use rmcp::{transport::stdio, ServiceExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 종료 코드: 사용자 에러 (잘못된 설정 등)
const EXIT_USER_ERROR: u8 = 1;
/// 종료 코드: 시스템 에러
const EXIT_SYSTEM_ERROR: u8 = 2;
/// 종료 코드: 인터럽트
const EXIT_INTERRUPTED: u8 = 130;

/// MCP Hangar - control-plane gateway for MCP providers
#[derive(Parser, Debug)]
#[command(name = "hangar")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (default: $MCP_HANGAR_CONFIG, then hangar.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve Streamable HTTP on this address instead of stdio
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // stdio 모드에서는 stdout이 MCP 채널이므로 로그는 stderr로
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(args).await {
        Ok(Outcome::Finished) => ExitCode::SUCCESS,
        Ok(Outcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!("hangar failed: {}", e);
            match e {
                Error::Config(_) | Error::InvalidArgument(_) => ExitCode::from(EXIT_USER_ERROR),
                _ => ExitCode::from(EXIT_SYSTEM_ERROR),
            }
        }
    }
}

enum Outcome {
    Finished,
    Interrupted,
}

async fn run(args: Args) -> Result<Outcome, Error> {
    // 설정 로드
    let config = ConfigLoader::new(args.config.as_deref()).load()?;

    // 이벤트 버스 + 구독자
    let events = Arc::new(EventBus::new());
    let metrics = Arc::new(MetricsCollector::new());
    events.subscribe(Arc::clone(&metrics) as Arc<dyn EventListener>);

    if let Some(path) = &config.event_log {
        let writer = EventLogWriter::open(path)?;
        events.subscribe(Arc::new(writer));
        info!("Event log enabled: {}", path.display());
    }

    // 코어 구성
    let registry = Arc::new(Registry::from_config(
        &config,
        Arc::new(DefaultTransportFactory),
        Arc::clone(&events),
    )?);
    let dispatch = Arc::new(DispatchEngine::new(
        Arc::clone(&registry),
        &config.rate_limit,
        &config.concurrency,
    ));
    let batch = Arc::new(BatchExecutor::new(
        Arc::clone(&dispatch),
        Arc::clone(&events),
    ));

    // 백그라운드 워커
    let cancel = CancellationToken::new();
    let mut workers = Vec::new();
    if config.health_check.enabled {
        workers.push(HealthWorker::spawn(
            Arc::clone(&registry),
            Duration::from_secs(config.health_check.interval_s.max(1)),
            cancel.child_token(),
        ));
    }
    workers.push(IdleGcWorker::spawn(
        Arc::clone(&registry),
        cancel.child_token(),
    ));

    let provider_count = registry.providers().len();
    let group_count = registry.groups().len();
    events.publish(system_events::started(
        env!("CARGO_PKG_VERSION"),
        provider_count,
        group_count,
    ));
    info!(
        "MCP Hangar {} started: {} providers, {} groups",
        env!("CARGO_PKG_VERSION"),
        provider_count,
        group_count
    );

    let ctx = Arc::new(GatewayContext {
        config,
        registry: Arc::clone(&registry),
        dispatch,
        batch,
        metrics,
        events: Arc::clone(&events),
        started_at: Instant::now(),
    });
    let gateway = HangarGateway::new(Arc::clone(&ctx));

    // 클라이언트 전송 구동
    let outcome = match args.http {
        Some(addr) => serve_http(gateway, ctx, addr).await?,
        None => serve_stdio(gateway).await?,
    };

    // 정리: 워커 중지 → provider 종료
    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    registry.shutdown_all("shutdown").await;
    events.publish(system_events::shutdown(match outcome {
        Outcome::Finished => "client_disconnected",
        Outcome::Interrupted => "interrupted",
    }));

    Ok(outcome)
}

/// stdio 모드: stdin/stdout이 MCP 채널
async fn serve_stdio(gateway: HangarGateway) -> Result<Outcome, Error> {
    info!("Serving MCP over stdio");

    let service = gateway
        .serve(stdio())
        .await
        .map_err(|e| Error::Transport(format!("stdio serve failed: {}", e)))?;

    tokio::select! {
        quit = service.waiting() => {
            quit.map_err(|e| Error::Transport(format!("stdio session error: {}", e)))?;
            Ok(Outcome::Finished)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(Outcome::Interrupted)
        }
    }
}

/// HTTP 모드: /mcp + 헬스 프로브 + 메트릭
async fn serve_http(
    gateway: HangarGateway,
    ctx: Arc<GatewayContext>,
    addr: SocketAddr,
) -> Result<Outcome, Error> {
    let router = http::build_router(gateway, ctx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Transport(format!("failed to bind {}: {}", addr, e)))?;
    info!("Serving MCP over HTTP at http://{}/mcp", addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Transport(format!("http server error: {}", e)))?;

    info!("Interrupted, shutting down");
    Ok(Outcome::Interrupted)
}
