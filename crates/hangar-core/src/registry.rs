//! Registry - provider/group 색인
//!
//! 읽기 위주의 공유 맵. 설정 리로드 같은 쓰기는 배타 락을 잡고, 조회는
//! 동시에 진행됩니다. 그룹은 멤버를 id로만 참조하므로 소유 순환이 없습니다.

use crate::config::{HangarConfig, Mode};
use crate::group::{MemberSnapshot, ProviderGroup};
use crate::provider::ProviderManager;
use crate::transport::TransportFactory;
use hangar_foundation::{Error, EventBus, ProviderId, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tracing::info;

/// id 해석 결과
#[derive(Clone, Debug)]
pub enum Target {
    Provider(Arc<ProviderManager>),
    Group(Arc<ProviderGroup>),
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

/// Provider/Group 색인
pub struct Registry {
    providers: StdRwLock<HashMap<ProviderId, Arc<ProviderManager>>>,
    groups: StdRwLock<HashMap<ProviderId, Arc<ProviderGroup>>>,
    events: Arc<EventBus>,
}

impl Registry {
    /// 설정에서 Registry 구성
    ///
    /// 검증: id 유효성(맵 키의 유일성은 구조상 보장), 멤버 존재, 그룹 중첩
    /// 금지.
    pub fn from_config(
        config: &HangarConfig,
        factory: Arc<dyn TransportFactory>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let mut providers = HashMap::new();
        let mut groups = HashMap::new();

        // 1차: 단일 provider 생성
        for (raw_id, entry) in &config.providers {
            if entry.mode == Mode::Group {
                continue;
            }
            let id = ProviderId::new(raw_id)?;
            let spec = entry.to_provider_spec(id.clone())?;
            let manager = Arc::new(ProviderManager::new(
                spec,
                Arc::clone(&factory),
                Arc::clone(&events),
            ));
            providers.insert(id, manager);
        }

        // 2차: 그룹 생성 + 멤버 검증
        for (raw_id, entry) in &config.providers {
            if entry.mode != Mode::Group {
                continue;
            }
            let id = ProviderId::new(raw_id)?;
            let spec = entry.to_group_spec(id.clone())?;

            for member in &spec.members {
                if providers.contains_key(&member.id) {
                    continue;
                }
                if config
                    .providers
                    .get(member.id.as_str())
                    .map(|e| e.mode == Mode::Group)
                    .unwrap_or(false)
                {
                    return Err(Error::Config(format!(
                        "group '{}' member '{}' is a group; groups cannot nest",
                        id, member.id
                    )));
                }
                return Err(Error::Config(format!(
                    "group '{}' references unknown member '{}'",
                    id, member.id
                )));
            }

            groups.insert(id, Arc::new(ProviderGroup::new(spec, Arc::clone(&events))));
        }

        info!(
            "Registry loaded: {} providers, {} groups",
            providers.len(),
            groups.len()
        );

        Ok(Self {
            providers: StdRwLock::new(providers),
            groups: StdRwLock::new(groups),
            events,
        })
    }

    /// 빈 Registry (테스트용)
    pub fn empty(events: Arc<EventBus>) -> Self {
        Self {
            providers: StdRwLock::new(HashMap::new()),
            groups: StdRwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ========================================================================
    // 조회
    // ========================================================================

    /// id를 provider 또는 group으로 해석
    pub fn resolve(&self, raw_id: &str) -> Result<Target> {
        let id = ProviderId::new(raw_id)?;

        if let Some(manager) = self.provider(&id) {
            return Ok(Target::Provider(manager));
        }
        if let Some(group) = self.group(&id) {
            return Ok(Target::Group(group));
        }
        Err(Error::UnknownTarget(raw_id.to_string()))
    }

    pub fn provider(&self, id: &ProviderId) -> Option<Arc<ProviderManager>> {
        self.providers
            .read()
            .expect("provider map poisoned")
            .get(id)
            .cloned()
    }

    pub fn group(&self, id: &ProviderId) -> Option<Arc<ProviderGroup>> {
        self.groups
            .read()
            .expect("group map poisoned")
            .get(id)
            .cloned()
    }

    /// 모든 provider 매니저 (id 정렬)
    pub fn providers(&self) -> Vec<Arc<ProviderManager>> {
        let map = self.providers.read().expect("provider map poisoned");
        let mut list: Vec<_> = map.values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    /// 모든 그룹 (id 정렬)
    pub fn groups(&self) -> Vec<Arc<ProviderGroup>> {
        let map = self.groups.read().expect("group map poisoned");
        let mut list: Vec<_> = map.values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    /// 그룹 멤버들의 현재 관측값
    pub fn member_snapshots(&self, group: &ProviderGroup) -> Vec<MemberSnapshot> {
        group
            .spec()
            .members
            .iter()
            .filter_map(|member| {
                self.provider(&member.id).map(|manager| MemberSnapshot {
                    id: member.id.clone(),
                    weight: member.weight,
                    priority: member.priority,
                    state: manager.state(),
                    in_flight: manager.in_flight(),
                    consecutive_failures: manager.health().consecutive_failures(),
                })
            })
            .collect()
    }

    /// provider가 속한 그룹들
    pub fn groups_containing(&self, provider_id: &ProviderId) -> Vec<Arc<ProviderGroup>> {
        self.groups
            .read()
            .expect("group map poisoned")
            .values()
            .filter(|g| g.spec().members.iter().any(|m| &m.id == provider_id))
            .cloned()
            .collect()
    }

    // ========================================================================
    // 쓰기 (설정 리로드)
    // ========================================================================

    /// provider 추가/교체
    pub fn insert_provider(&self, manager: Arc<ProviderManager>) {
        self.providers
            .write()
            .expect("provider map poisoned")
            .insert(manager.id().clone(), manager);
    }

    /// 그룹 추가/교체
    pub fn insert_group(&self, group: Arc<ProviderGroup>) {
        self.groups
            .write()
            .expect("group map poisoned")
            .insert(group.id().clone(), group);
    }

    /// provider 제거 (반환된 매니저는 호출자가 shutdown)
    pub fn remove_provider(&self, id: &ProviderId) -> Option<Arc<ProviderManager>> {
        self.providers
            .write()
            .expect("provider map poisoned")
            .remove(id)
    }

    /// 모든 provider 종료
    pub async fn shutdown_all(&self, reason: &str) {
        for manager in self.providers() {
            manager.shutdown(reason).await;
        }
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemberEntry, ProviderEntry};

    fn config_with(entries: Vec<(&str, ProviderEntry)>) -> HangarConfig {
        HangarConfig {
            providers: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            ..Default::default()
        }
    }

    fn subprocess(cmd: &str) -> ProviderEntry {
        ProviderEntry {
            mode: Mode::Subprocess,
            command: Some(vec![cmd.to_string()]),
            ..Default::default()
        }
    }

    fn group_of(members: &[&str]) -> ProviderEntry {
        ProviderEntry {
            mode: Mode::Group,
            members: members
                .iter()
                .map(|id| MemberEntry {
                    id: id.to_string(),
                    weight: None,
                    priority: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn build(config: &HangarConfig) -> Result<Registry> {
        Registry::from_config(
            config,
            Arc::new(crate::transport::DefaultTransportFactory),
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn test_resolve_provider_and_group() {
        let config = config_with(vec![
            ("math", subprocess("srv")),
            ("g", group_of(&["math"])),
        ]);
        let registry = build(&config).unwrap();

        assert!(matches!(registry.resolve("math"), Ok(Target::Provider(_))));
        assert!(matches!(registry.resolve("g"), Ok(Target::Group(_))));
        assert_eq!(
            registry.resolve("nope").unwrap_err().kind(),
            "unknown_target"
        );
    }

    #[tokio::test]
    async fn test_unknown_member_rejected() {
        let config = config_with(vec![("g", group_of(&["ghost"]))]);
        assert!(build(&config).is_err());
    }

    #[tokio::test]
    async fn test_nested_groups_rejected() {
        let config = config_with(vec![
            ("math", subprocess("srv")),
            ("inner", group_of(&["math"])),
            ("outer", group_of(&["inner"])),
        ]);
        let err = build(&config).unwrap_err();
        assert!(err.to_string().contains("cannot nest"));
    }

    #[tokio::test]
    async fn test_member_snapshots() {
        let config = config_with(vec![
            ("math", subprocess("srv")),
            ("g", group_of(&["math"])),
        ]);
        let registry = build(&config).unwrap();

        let group = registry.group(&ProviderId::new("g").unwrap()).unwrap();
        let snapshots = registry.member_snapshots(&group);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, crate::provider::ProviderState::Cold);
    }

    #[tokio::test]
    async fn test_groups_containing() {
        let config = config_with(vec![
            ("math", subprocess("srv")),
            ("other", subprocess("srv2")),
            ("g1", group_of(&["math"])),
            ("g2", group_of(&["math", "other"])),
        ]);
        let registry = build(&config).unwrap();

        let containing = registry.groups_containing(&ProviderId::new("math").unwrap());
        assert_eq!(containing.len(), 2);

        let containing = registry.groups_containing(&ProviderId::new("other").unwrap());
        assert_eq!(containing.len(), 1);
    }
}
