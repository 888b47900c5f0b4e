use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-group dependency proxy setting.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct GroupSetting {
    #[serde(default)]
    pub enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl GroupSetting {
    /// Upstream credentials, only when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

/// Settings store, read on every request.
///
/// Groups that were never configured share a single disabled setting and are
/// never added to the store.
pub struct GroupSettings {
    settings: ArcSwap<HashMap<String, Arc<GroupSetting>>>,
    unconfigured: Arc<GroupSetting>,
}

fn to_snapshot(configured: &HashMap<String, GroupSetting>) -> HashMap<String, Arc<GroupSetting>> {
    configured
        .iter()
        .map(|(group, setting)| (group.clone(), Arc::new(setting.clone())))
        .collect()
}

impl GroupSettings {
    pub fn new(configured: &HashMap<String, GroupSetting>) -> Self {
        Self {
            settings: ArcSwap::from_pointee(to_snapshot(configured)),
            unconfigured: Arc::new(GroupSetting::default()),
        }
    }

    pub fn find(&self, group: &str) -> Arc<GroupSetting> {
        match self.settings.load().get(group) {
            Some(setting) => Arc::clone(setting),
            None => {
                debug!("No setting for group '{group}', defaulting to disabled");
                Arc::clone(&self.unconfigured)
            }
        }
    }

    /// Replaces every setting with the configured ones.
    pub fn replace(&self, configured: &HashMap<String, GroupSetting>) {
        self.settings.store(Arc::new(to_snapshot(configured)));
        info!("Loaded settings for {} group(s)", configured.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> GroupSetting {
        GroupSetting {
            enabled: true,
            username: Some("robot".to_string()),
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_unknown_group_defaults_to_disabled() {
        let settings = GroupSettings::new(&HashMap::new());

        let setting = settings.find("acme");

        assert!(!setting.enabled);
        assert_eq!(setting.credentials(), None);
    }

    #[test]
    fn test_unknown_groups_are_not_stored() {
        let configured = HashMap::from([("acme".to_string(), enabled())]);
        let settings = GroupSettings::new(&configured);

        for i in 0..1000 {
            assert!(!settings.find(&format!("unknown-{i}")).enabled);
        }

        assert_eq!(settings.settings.load().len(), 1);
        assert!(Arc::ptr_eq(
            &settings.find("unknown-1"),
            &settings.find("unknown-2")
        ));
    }

    #[test]
    fn test_configured_group() {
        let configured = HashMap::from([("acme".to_string(), enabled())]);
        let settings = GroupSettings::new(&configured);

        let setting = settings.find("acme");

        assert!(setting.enabled);
        assert_eq!(setting.credentials(), Some(("robot", "secret")));
    }

    #[test]
    fn test_replace() {
        let settings = GroupSettings::new(&HashMap::new());
        assert!(!settings.find("acme").enabled);

        settings.replace(&HashMap::from([("acme".to_string(), enabled())]));
        assert!(settings.find("acme").enabled);

        settings.replace(&HashMap::new());
        assert!(!settings.find("acme").enabled);
    }

    #[test]
    fn test_partial_credentials() {
        let setting = GroupSetting {
            enabled: true,
            username: Some("robot".to_string()),
            password: None,
        };
        assert_eq!(setting.credentials(), None);
    }
}
