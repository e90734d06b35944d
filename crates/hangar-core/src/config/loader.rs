//! Configuration Loader
//!
//! ## 검색 우선순위
//!
//! 1. 명시적 경로 (`--config`)
//! 2. 환경 변수 `MCP_HANGAR_CONFIG`
//! 3. 사용자 설정 디렉토리: `~/.config/mcp-hangar/hangar.json`
//! 4. 현재 디렉토리: `./hangar.json`
//!
//! 처음 발견되는 파일 하나를 사용합니다. JSON에 `//`, `/* */` 주석을
//! 허용합니다.

use super::types::HangarConfig;
use hangar_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 기본 설정 파일 이름
pub const CONFIG_FILE_NAME: &str = "hangar.json";

/// 설정 경로 환경 변수
pub const CONFIG_ENV_VAR: &str = "MCP_HANGAR_CONFIG";

/// 사용자 설정 디렉토리 이름
const CONFIG_DIR_NAME: &str = "mcp-hangar";

// ============================================================================
// ConfigLoader
// ============================================================================

/// 설정 로더
pub struct ConfigLoader {
    /// 검색 경로 (우선순위 순)
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// 기본 검색 경로로 생성
    pub fn new(explicit: Option<&Path>) -> Self {
        let mut paths = Vec::new();

        if let Some(path) = explicit {
            paths.push(path.to_path_buf());
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            if !env_path.is_empty() {
                paths.push(PathBuf::from(env_path));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
        }

        paths.push(PathBuf::from(CONFIG_FILE_NAME));

        Self {
            search_paths: paths,
        }
    }

    /// 커스텀 검색 경로로 생성
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths: paths,
        }
    }

    /// 처음 발견되는 설정 파일 로드
    ///
    /// 어떤 파일도 없으면 빈 기본 설정을 반환합니다.
    pub fn load(&self) -> Result<HangarConfig> {
        for path in &self.search_paths {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return load_config_from_file(path);
            }
            debug!("Config not found at: {}", path.display());
        }

        info!("No config file found, starting with empty configuration");
        Ok(HangarConfig::default())
    }

    /// 존재하는 설정 파일 목록
    pub fn existing_files(&self) -> Vec<PathBuf> {
        self.search_paths
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }
}

// ============================================================================
// 유틸리티 함수
// ============================================================================

/// 파일에서 설정 로드
pub fn load_config_from_file(path: &Path) -> Result<HangarConfig> {
    let content = std::fs::read_to_string(path)?;
    let content = strip_json_comments(&content);

    let config: HangarConfig = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("invalid {} at {}: {}", CONFIG_FILE_NAME, path.display(), e))
    })?;

    debug!(
        "Loaded config from {}: {} provider entries",
        path.display(),
        config.providers.len()
    );

    Ok(config)
}

/// JSON 주석 제거 (`//` 및 `/* */`)
pub fn strip_json_comments(input: &str) -> String {
    #[derive(PartialEq)]
    enum Scan {
        Code,
        Str,
        StrEscape,
        LineComment,
        BlockComment,
        BlockCommentStar,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = Scan::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        state = match state {
            Scan::Code => match c {
                '"' => {
                    out.push(c);
                    Scan::Str
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    Scan::LineComment
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    Scan::BlockComment
                }
                _ => {
                    out.push(c);
                    Scan::Code
                }
            },
            Scan::Str => {
                out.push(c);
                match c {
                    '\\' => Scan::StrEscape,
                    '"' => Scan::Code,
                    _ => Scan::Str,
                }
            }
            Scan::StrEscape => {
                out.push(c);
                Scan::Str
            }
            Scan::LineComment => {
                if c == '\n' {
                    out.push(c);
                    Scan::Code
                } else {
                    Scan::LineComment
                }
            }
            Scan::BlockComment => {
                if c == '*' {
                    Scan::BlockCommentStar
                } else {
                    Scan::BlockComment
                }
            }
            Scan::BlockCommentStar => match c {
                '/' => Scan::Code,
                '*' => Scan::BlockCommentStar,
                _ => Scan::BlockComment,
            },
        };
    }

    out
}

// ============================================================================
// 테스트
// ============================================================================
