//! 식별자 타입 - ProviderId, CorrelationId

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// ProviderId 최대 길이
const MAX_ID_LEN: usize = 64;

/// Provider/Group 식별자
///
/// 설정 파일과 클라이언트 요청 양쪽에서 들어오는 이름이므로 생성 시점에
/// 검증합니다: 비어있지 않고, `[A-Za-z0-9_.-]`만 허용, 64자 이하.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// 검증 후 생성
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(Error::InvalidArgument("provider id is empty".to_string()));
        }
        if raw.len() > MAX_ID_LEN {
            return Err(Error::InvalidArgument(format!(
                "provider id too long ({} > {} chars): {}",
                raw.len(),
                MAX_ID_LEN,
                raw
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(Error::InvalidArgument(format!(
                "provider id contains invalid characters: {}",
                raw
            )));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ProviderId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ProviderId::new(raw).map_err(serde::de::Error::custom)
    }
}

/// 호출 추적용 상관관계 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// 새 상관관계 ID 생성
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(ProviderId::new("math").is_ok());
        assert!(ProviderId::new("llm-group_2.beta").is_ok());
        assert!(ProviderId::new("A").is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert!(ProviderId::new("").is_err());
        assert!(ProviderId::new("has space").is_err());
        assert!(ProviderId::new("slash/name").is_err());
        assert!(ProviderId::new("한글이름").is_err());
        assert!(ProviderId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_max_length_boundary() {
        assert!(ProviderId::new("a".repeat(64)).is_ok());
    }

    #[test]
    fn test_correlation_id_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_deserialize_rejects_invalid() {
        let ok: std::result::Result<ProviderId, _> = serde_json::from_str("\"math\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<ProviderId, _> = serde_json::from_str("\"no good\"");
        assert!(bad.is_err());
    }
}
