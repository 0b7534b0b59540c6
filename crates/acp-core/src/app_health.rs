use crate::contracts::{AppHealth, AppSpec, ManifestApp};
use crate::error::AgentApiError;
use std::collections::HashMap;
use uuid::Uuid;

/// Health of each declared application. Apps without a healthcheck are
/// pinned to `Disabled`.
#[derive(Debug, Clone)]
pub struct AppHealthMap {
    apps: Vec<AppSpec>,
    health: HashMap<Uuid, AppHealth>,
}

impl AppHealthMap {
    pub fn new(apps: Vec<AppSpec>) -> Self {
        let health = apps
            .iter()
            .map(|app| {
                let initial = if app.healthcheck.is_some() {
                    AppHealth::Initializing
                } else {
                    AppHealth::Disabled
                };
                (app.id, initial)
            })
            .collect();
        Self { apps, health }
    }

    pub fn health(&self, app_id: &Uuid) -> Option<AppHealth> {
        self.health.get(app_id).copied()
    }

    /// Validates the whole batch before touching any entry. Returns the apps
    /// whose health actually changed.
    pub fn apply(
        &mut self,
        batch: &HashMap<Uuid, String>,
    ) -> Result<Vec<(Uuid, AppHealth)>, AgentApiError> {
        if batch.is_empty() {
            return Err(AgentApiError::BadRequest(
                "health payload must contain at least one app".to_string(),
            ));
        }

        let mut validated = Vec::with_capacity(batch.len());
        for (app_id, raw) in batch {
            let Some(app) = self.apps.iter().find(|app| app.id == *app_id) else {
                return Err(AgentApiError::BadRequest(format!(
                    "app {app_id} does not belong to this agent"
                )));
            };
            if app.healthcheck.is_none() {
                return Err(AgentApiError::BadRequest(format!(
                    "app {} has no healthcheck configured",
                    app.slug
                )));
            }
            let health = match raw.parse::<AppHealth>() {
                Ok(AppHealth::Disabled) | Err(_) => {
                    return Err(AgentApiError::BadRequest(format!(
                        "invalid health {raw:?} for app {}",
                        app.slug
                    )));
                }
                Ok(value) => value,
            };
            validated.push((*app_id, health));
        }

        let mut changed = Vec::new();
        for (app_id, health) in validated {
            if self.health.insert(app_id, health) != Some(health) {
                changed.push((app_id, health));
            }
        }
        Ok(changed)
    }

    pub fn manifest_apps(&self) -> Vec<ManifestApp> {
        self.apps
            .iter()
            .map(|app| ManifestApp {
                app: app.clone(),
                health: self.health.get(&app.id).copied().unwrap_or(AppHealth::Disabled),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Healthcheck;

    fn apps() -> (Vec<AppSpec>, Uuid, Uuid) {
        let plain = Uuid::new_v4();
        let checked = Uuid::new_v4();
        let apps = vec![
            AppSpec {
                id: plain,
                slug: "code-server".to_string(),
                display_name: String::new(),
                command: Some("some-command".to_string()),
                url: Some("http://localhost:3000".to_string()),
                healthcheck: None,
            },
            AppSpec {
                id: checked,
                slug: "code-server-2".to_string(),
                display_name: "code-server-2".to_string(),
                command: Some("some-command".to_string()),
                url: Some("http://localhost:3000".to_string()),
                healthcheck: Some(Healthcheck {
                    url: "http://localhost:3000".to_string(),
                    interval: 5,
                    threshold: 6,
                }),
            },
        ];
        (apps, plain, checked)
    }

    fn batch(entries: &[(Uuid, &str)]) -> HashMap<Uuid, String> {
        entries
            .iter()
            .map(|(id, value)| (*id, value.to_string()))
            .collect()
    }

    #[test]
    fn initial_health_follows_healthcheck_declaration() {
        let (apps, plain, checked) = apps();
        let map = AppHealthMap::new(apps);
        assert_eq!(map.health(&plain), Some(AppHealth::Disabled));
        assert_eq!(map.health(&checked), Some(AppHealth::Initializing));
    }

    #[test]
    fn invalid_batches_leave_state_unchanged() {
        let (apps, plain, checked) = apps();
        let mut map = AppHealthMap::new(apps);

        assert!(map.apply(&HashMap::new()).is_err());
        assert!(map.apply(&batch(&[(plain, "initializing")])).is_err());
        assert!(map.apply(&batch(&[(checked, "bad-value")])).is_err());
        assert!(map.apply(&batch(&[(checked, "disabled")])).is_err());
        assert!(map.apply(&batch(&[(Uuid::new_v4(), "healthy")])).is_err());

        assert_eq!(map.health(&checked), Some(AppHealth::Initializing));
    }

    #[test]
    fn mixed_batch_is_all_or_nothing() {
        let (apps, plain, checked) = apps();
        let mut map = AppHealthMap::new(apps);
        let err = map
            .apply(&batch(&[(checked, "healthy"), (plain, "healthy")]))
            .expect_err("plain app has no healthcheck");
        assert!(matches!(err, AgentApiError::BadRequest(_)));
        assert_eq!(map.health(&checked), Some(AppHealth::Initializing));
    }

    #[test]
    fn valid_updates_apply() {
        let (apps, _, checked) = apps();
        let mut map = AppHealthMap::new(apps);

        let changed = map.apply(&batch(&[(checked, "healthy")])).expect("healthy");
        assert_eq!(changed, vec![(checked, AppHealth::Healthy)]);
        assert_eq!(map.manifest_apps()[1].health, AppHealth::Healthy);

        map.apply(&batch(&[(checked, "unhealthy")])).expect("unhealthy");
        assert_eq!(map.health(&checked), Some(AppHealth::Unhealthy));

        let unchanged = map.apply(&batch(&[(checked, "unhealthy")])).expect("repeat");
        assert!(unchanged.is_empty());
    }
}
