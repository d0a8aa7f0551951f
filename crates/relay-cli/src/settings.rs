//! Persisted permission rules: project scope over user scope

use std::fs;
use std::path::Path;

use relay_agent::permission::{PermissionSubject, SessionOverrides};
use relay_agent::{Decision, RuleSet, SettingsStore};
use serde::Deserialize;

use crate::config::PermissionsConfig;

/// Project settings file, relative to the working directory
pub const PROJECT_SETTINGS: &str = ".relay/settings.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProjectSettings {
    permissions: PermissionsConfig,
}

/// Settings store with a project rule set consulted before the user's.
/// The first scope with a matching rule decides; session-approved patterns
/// turn anything short of a deny into an allow.
#[derive(Debug, Default)]
pub struct LayeredSettings {
    project: RuleSet,
    user: RuleSet,
}

impl LayeredSettings {
    pub fn new(project: RuleSet, user: RuleSet) -> Self {
        Self { project, user }
    }

    /// Build from the user config and `<cwd>/.relay/settings.toml`.
    /// Unparsable rules and files are reported and skipped.
    pub fn load(cwd: &Path, user: &PermissionsConfig) -> Self {
        let path = cwd.join(PROJECT_SETTINGS);
        let project = load_project_rules(&path);
        Self::new(
            rule_set(&project, &path.display().to_string()),
            rule_set(user, "user config"),
        )
    }
}

fn load_project_rules(path: &Path) -> PermissionsConfig {
    if !path.exists() {
        return PermissionsConfig::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|content| {
            toml::from_str::<ProjectSettings>(&content).map_err(|e| e.to_string())
        });
    match parsed {
        Ok(settings) => settings.permissions,
        Err(e) => {
            eprintln!("Warning: Ignoring {}: {}", path.display(), e);
            PermissionsConfig::default()
        }
    }
}

fn rule_set(lists: &PermissionsConfig, source: &str) -> RuleSet {
    let (rules, errors) = RuleSet::from_lists(&lists.allow, &lists.deny, &lists.ask);
    for error in errors {
        tracing::warn!("Skipping rule from {}: {}", source, error);
        eprintln!("Warning: {} ({})", error, source);
    }
    rules
}

impl SettingsStore for LayeredSettings {
    fn check_permission(
        &self,
        subject: &PermissionSubject<'_>,
        overrides: &SessionOverrides,
    ) -> Option<Decision> {
        let verdict = self
            .project
            .check(subject)
            .or_else(|| self.user.check(subject));
        match verdict {
            Some(Decision::Deny) => Some(Decision::Deny),
            _ if overrides.approved_rules().iter().any(|r| r.matches(subject)) => {
                Some(Decision::Allow)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_agent::ToolCategory;
    use relay_agent::permission::PermissionRule;
    use serde_json::json;

    fn rules(allow: &[&str], deny: &[&str], ask: &[&str]) -> RuleSet {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        RuleSet::from_lists(&owned(allow), &owned(deny), &owned(ask)).0
    }

    fn check(settings: &LayeredSettings, command: &str, overrides: &SessionOverrides) -> Option<Decision> {
        let args = json!({ "command": command });
        let subject = PermissionSubject::new("bash", &args, ToolCategory::Shell);
        settings.check_permission(&subject, overrides)
    }

    #[test]
    fn test_project_scope_is_consulted_first() {
        let settings = LayeredSettings::new(
            rules(&["bash(cargo test:*)"], &[], &[]),
            rules(&[], &["bash(cargo:*)"], &[]),
        );
        let none = SessionOverrides::default();
        assert_eq!(check(&settings, "cargo test -p relay", &none), Some(Decision::Allow));
        assert_eq!(check(&settings, "cargo publish", &none), Some(Decision::Deny));
        assert_eq!(check(&settings, "ls", &none), None);
    }

    #[test]
    fn test_deny_wins_within_a_scope() {
        let settings = LayeredSettings::new(
            rules(&["bash(git:*)"], &["bash(git push:*)"], &[]),
            RuleSet::new(),
        );
        let none = SessionOverrides::default();
        assert_eq!(check(&settings, "git push origin", &none), Some(Decision::Deny));
        assert_eq!(check(&settings, "git log", &none), Some(Decision::Allow));
    }

    #[test]
    fn test_session_approvals_never_override_a_deny() {
        let settings = LayeredSettings::new(
            rules(&[], &["bash(make deploy)"], &["bash(make:*)"]),
            RuleSet::new(),
        );
        let mut overrides = SessionOverrides::default();
        overrides.approve(PermissionRule::exact("bash", "make build"));
        overrides.approve(PermissionRule::exact("bash", "make deploy"));
        assert_eq!(check(&settings, "make build", &overrides), Some(Decision::Allow));
        assert_eq!(check(&settings, "make deploy", &overrides), Some(Decision::Deny));
        assert_eq!(check(&settings, "make lint", &overrides), Some(Decision::Ask));
    }

    #[test]
    fn test_load_reads_project_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".relay")).unwrap();
        fs::write(
            dir.path().join(PROJECT_SETTINGS),
            "[permissions]\ndeny = [\"bash(curl:*)\"]\n",
        )
        .unwrap();
        let user = PermissionsConfig {
            allow: vec!["bash(curl:*)".into(), "bash(".into()],
            ..Default::default()
        };

        let settings = LayeredSettings::load(dir.path(), &user);

        assert_eq!(
            check(&settings, "curl example.com", &SessionOverrides::default()),
            Some(Decision::Deny)
        );
    }
}
