//! Permission arbiter: decides Allow / Deny / Ask for a tool call
//!
//! Evaluation order:
//! 1. plan mode denies every tool outside the read category
//! 2. a session override (or auto-accept mode for edits and writes) allows
//! 3. a persisted rule from the settings store decides
//! 4. the tool's declared default decides
//! 5. otherwise ask
//!
//! A pre-tool hook may veto an Allow or Ask outcome before anything runs.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::tool::Tool;

/// Outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

/// Coarse tool classification used by overrides and modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Edit,
    Write,
    Shell,
    Task,
    Network,
    Other,
}

/// Session-wide operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Normal,
    /// Edits and writes run without asking
    AutoAccept,
    /// Read-only planning
    Plan,
}

/// The parts of a tool call the arbiter looks at
#[derive(Debug, Clone, Copy)]
pub struct PermissionSubject<'a> {
    pub tool_name: &'a str,
    pub arguments: &'a Value,
    pub category: ToolCategory,
    pub default: Option<Decision>,
}

impl<'a> PermissionSubject<'a> {
    pub fn new(tool_name: &'a str, arguments: &'a Value, category: ToolCategory) -> Self {
        Self {
            tool_name,
            arguments,
            category,
            default: None,
        }
    }

    pub fn for_tool(tool: &'a dyn Tool, arguments: &'a Value) -> Self {
        Self {
            tool_name: tool.name(),
            arguments,
            category: tool.category(),
            default: tool.default_permission(),
        }
    }

    pub fn with_default(mut self, default: Option<Decision>) -> Self {
        self.default = default;
        self
    }

    /// The argument rules match against: the shell command, a path, a URL
    /// or a search pattern, whichever the tool takes.
    pub fn rule_target(&self) -> Option<&'a str> {
        ["command", "path", "file_path", "url", "pattern"]
            .iter()
            .find_map(|key| self.arguments.get(*key).and_then(Value::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RulePattern {
    /// `git diff:*`; the command must start with the prefix as a whole word
    Prefix(String),
    Exact(String),
    Glob(glob::Pattern),
}

const COMMAND_CHAINING: &[&str] = &["&&", "||", ";", "|", "`", "$(", "\n"];

impl RulePattern {
    fn parse(raw: &str) -> Self {
        if let Some(prefix) = raw.strip_suffix(":*") {
            return Self::Prefix(prefix.to_string());
        }
        if raw.contains(['*', '?', '[']) {
            if let Ok(pattern) = glob::Pattern::new(raw) {
                return Self::Glob(pattern);
            }
        }
        Self::Exact(raw.to_string())
    }

    fn matches(&self, target: &str) -> bool {
        match self {
            Self::Prefix(prefix) => {
                // A prefix approval never extends to chained commands
                if COMMAND_CHAINING.iter().any(|op| target.contains(op)) {
                    return false;
                }
                match target.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest.is_empty() || rest.starts_with(' '),
                    None => false,
                }
            }
            Self::Exact(exact) => target == exact,
            Self::Glob(pattern) => pattern.matches(target),
        }
    }
}

impl fmt::Display for RulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(prefix) => write!(f, "{}:*", prefix),
            Self::Exact(exact) => f.write_str(exact),
            Self::Glob(pattern) => f.write_str(pattern.as_str()),
        }
    }
}

/// A rule written as `tool` or `tool(pattern)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    pub tool: String,
    pattern: Option<RulePattern>,
}

impl PermissionRule {
    /// Rule matching every call of `tool`
    pub fn tool(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            pattern: None,
        }
    }

    /// Rule matching exactly one argument value
    pub fn exact(tool: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            pattern: Some(RulePattern::Exact(target.into())),
        }
    }

    pub fn matches(&self, subject: &PermissionSubject<'_>) -> bool {
        if self.tool != subject.tool_name {
            return false;
        }
        match &self.pattern {
            None => true,
            Some(pattern) => subject.rule_target().is_some_and(|t| pattern.matches(t)),
        }
    }
}

impl FromStr for PermissionRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some(open) = s.find('(') else {
            if s.is_empty() || s.contains(')') {
                return Err(format!("invalid permission rule: {:?}", s));
            }
            return Ok(Self::tool(s));
        };
        let Some(inner) = s[open + 1..].strip_suffix(')') else {
            return Err(format!("unterminated pattern in rule: {:?}", s));
        };
        let tool = s[..open].trim();
        if tool.is_empty() {
            return Err(format!("missing tool name in rule: {:?}", s));
        }
        let inner = inner.trim();
        Ok(Self {
            tool: tool.to_string(),
            pattern: (!inner.is_empty()).then(|| RulePattern::parse(inner)),
        })
    }
}

impl fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(f, "{}({})", self.tool, pattern),
            None => f.write_str(&self.tool),
        }
    }
}

/// In-memory permission escalations, cleared on every mode change
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    categories: HashSet<ToolCategory>,
    tools: HashSet<String>,
    approved: Vec<PermissionRule>,
}

impl SessionOverrides {
    pub fn allow_category(&mut self, category: ToolCategory) {
        self.categories.insert(category);
    }

    pub fn allow_tool(&mut self, tool: impl Into<String>) {
        self.tools.insert(tool.into());
    }

    pub fn approve(&mut self, rule: PermissionRule) {
        if !self.approved.contains(&rule) {
            self.approved.push(rule);
        }
    }

    /// Category or named-tool override
    pub fn allows(&self, subject: &PermissionSubject<'_>) -> bool {
        self.categories.contains(&subject.category) || self.tools.contains(subject.tool_name)
    }

    /// Previously approved argument patterns
    pub fn approved_rules(&self) -> &[PermissionRule] {
        &self.approved
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.tools.is_empty() && self.approved.is_empty()
    }

    pub fn clear(&mut self) {
        self.categories.clear();
        self.tools.clear();
        self.approved.clear();
    }
}

/// Persisted permission policy
pub trait SettingsStore: Send + Sync {
    /// Verdict of the first matching persisted rule, or `None` if no rule
    /// applies. Stores may also honor the session's approved patterns.
    fn check_permission(
        &self,
        subject: &PermissionSubject<'_>,
        overrides: &SessionOverrides,
    ) -> Option<Decision>;
}

/// Allow, deny and ask rule lists for one scope
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    allow: Vec<PermissionRule>,
    deny: Vec<PermissionRule>,
    ask: Vec<PermissionRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, decision: Decision, rule: &str) -> Result<(), String> {
        let rule = rule.parse()?;
        match decision {
            Decision::Allow => self.allow.push(rule),
            Decision::Deny => self.deny.push(rule),
            Decision::Ask => self.ask.push(rule),
        }
        Ok(())
    }

    /// Build from rule strings. Unparsable rules are returned separately so
    /// the caller can report them.
    pub fn from_lists(allow: &[String], deny: &[String], ask: &[String]) -> (Self, Vec<String>) {
        let mut set = Self::new();
        let mut errors = Vec::new();
        for (decision, rules) in [
            (Decision::Allow, allow),
            (Decision::Deny, deny),
            (Decision::Ask, ask),
        ] {
            for rule in rules {
                if let Err(e) = set.add(decision, rule) {
                    errors.push(e);
                }
            }
        }
        (set, errors)
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty() && self.ask.is_empty()
    }

    /// Deny beats ask, ask beats allow
    pub fn check(&self, subject: &PermissionSubject<'_>) -> Option<Decision> {
        if self.deny.iter().any(|r| r.matches(subject)) {
            Some(Decision::Deny)
        } else if self.ask.iter().any(|r| r.matches(subject)) {
            Some(Decision::Ask)
        } else if self.allow.iter().any(|r| r.matches(subject)) {
            Some(Decision::Allow)
        } else {
            None
        }
    }
}

impl SettingsStore for RuleSet {
    fn check_permission(
        &self,
        subject: &PermissionSubject<'_>,
        overrides: &SessionOverrides,
    ) -> Option<Decision> {
        match self.check(subject) {
            Some(Decision::Deny) => Some(Decision::Deny),
            _ if overrides.approved_rules().iter().any(|r| r.matches(subject)) => {
                Some(Decision::Allow)
            }
            other => other,
        }
    }
}

/// Hook points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookOutcome {
    pub should_block: bool,
    pub block_reason: Option<String>,
}

impl HookOutcome {
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            should_block: true,
            block_reason: Some(reason.into()),
        }
    }
}

/// External hooks consulted before a tool runs or a prompt is shown.
/// Runs synchronously on the controller loop.
pub trait HookEngine: Send + Sync {
    fn execute(&self, event: HookEvent, payload: &Value) -> HookOutcome;
}

/// Hook engine with nothing configured
#[derive(Debug, Default)]
pub struct NoHooks;

impl HookEngine for NoHooks {
    fn execute(&self, _event: HookEvent, _payload: &Value) -> HookOutcome {
        HookOutcome::default()
    }
}

/// Final verdict after hooks ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Ask,
    Deny { reason: String },
}

pub struct PermissionArbiter {
    settings: Arc<dyn SettingsStore>,
    hooks: Arc<dyn HookEngine>,
    overrides: SessionOverrides,
    mode: OperatingMode,
}

impl Default for PermissionArbiter {
    fn default() -> Self {
        Self::new(Arc::new(RuleSet::new()), Arc::new(NoHooks))
    }
}

impl PermissionArbiter {
    pub fn new(settings: Arc<dyn SettingsStore>, hooks: Arc<dyn HookEngine>) -> Self {
        Self {
            settings,
            hooks,
            overrides: SessionOverrides::default(),
            mode: OperatingMode::Normal,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Switch mode. Any actual change clears session overrides. Returns the
    /// previous mode if it changed.
    pub fn set_mode(&mut self, mode: OperatingMode) -> Option<OperatingMode> {
        if mode == self.mode {
            return None;
        }
        let previous = self.mode;
        self.mode = mode;
        if !self.overrides.is_empty() {
            tracing::debug!("Clearing session overrides on mode change {:?} -> {:?}", previous, mode);
        }
        self.overrides.clear();
        Some(previous)
    }

    pub fn overrides(&self) -> &SessionOverrides {
        &self.overrides
    }

    pub fn allow_category_for_session(&mut self, category: ToolCategory) {
        self.overrides.allow_category(category);
    }

    pub fn allow_tool_for_session(&mut self, tool: impl Into<String>) {
        self.overrides.allow_tool(tool);
    }

    /// Install the override an "approve for this session" answer implies:
    /// the exact command for shell calls, the category for edits, writes and
    /// tasks, the tool name otherwise.
    pub fn remember_approval(&mut self, subject: &PermissionSubject<'_>) {
        match subject.category {
            ToolCategory::Shell => match subject.arguments.get("command").and_then(Value::as_str) {
                Some(command) => self
                    .overrides
                    .approve(PermissionRule::exact(subject.tool_name, command)),
                None => self.overrides.allow_tool(subject.tool_name),
            },
            ToolCategory::Edit | ToolCategory::Write | ToolCategory::Task => {
                self.overrides.allow_category(subject.category)
            }
            _ => self.overrides.allow_tool(subject.tool_name),
        }
    }

    /// Policy verdict without hooks
    pub fn evaluate(&self, subject: &PermissionSubject<'_>) -> Decision {
        if self.mode == OperatingMode::Plan && subject.category != ToolCategory::Read {
            return Decision::Deny;
        }
        if self.overrides.allows(subject) {
            return Decision::Allow;
        }
        if self.mode == OperatingMode::AutoAccept
            && matches!(subject.category, ToolCategory::Edit | ToolCategory::Write)
        {
            return Decision::Allow;
        }
        if let Some(decision) = self.settings.check_permission(subject, &self.overrides) {
            return decision;
        }
        subject.default.unwrap_or(Decision::Ask)
    }

    /// Policy verdict followed by the pre-tool hook
    pub fn authorize(&self, subject: &PermissionSubject<'_>) -> Authorization {
        let decision = self.evaluate(subject);
        if decision == Decision::Deny {
            return Authorization::Deny {
                reason: self.deny_reason(subject),
            };
        }

        let payload = json!({
            "hook_event_name": "PreToolUse",
            "tool_name": subject.tool_name,
            "tool_input": subject.arguments,
            "decision": decision,
        });
        let outcome = self.hooks.execute(HookEvent::PreToolUse, &payload);
        if outcome.should_block {
            let reason = outcome
                .block_reason
                .unwrap_or_else(|| "no reason given".to_string());
            tracing::info!("Hook blocked {}: {}", subject.tool_name, reason);
            return Authorization::Deny {
                reason: format!("Blocked by hook: {}", reason),
            };
        }

        match decision {
            Decision::Allow => Authorization::Allow,
            _ => Authorization::Ask,
        }
    }

    fn deny_reason(&self, subject: &PermissionSubject<'_>) -> String {
        if self.mode == OperatingMode::Plan {
            format!(
                "Tool {} is not available in plan mode. Present the plan with exit_plan_mode first.",
                subject.tool_name
            )
        } else {
            format!("Permission to use {} was denied by a rule", subject.tool_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject<'a>(tool: &'a str, args: &'a Value, category: ToolCategory) -> PermissionSubject<'a> {
        PermissionSubject::new(tool, args, category)
    }

    struct BlockingHooks;

    impl HookEngine for BlockingHooks {
        fn execute(&self, _event: HookEvent, payload: &Value) -> HookOutcome {
            if payload["tool_input"]["command"] == "rm -rf /" {
                HookOutcome::block("destructive")
            } else {
                HookOutcome::default()
            }
        }
    }

    #[test]
    fn test_rule_parsing() {
        let rule: PermissionRule = "bash(git diff:*)".parse().unwrap();
        assert_eq!(rule.tool, "bash");
        assert_eq!(rule.to_string(), "bash(git diff:*)");
        assert_eq!("read".parse::<PermissionRule>().unwrap().to_string(), "read");
        assert!("bash(git".parse::<PermissionRule>().is_err());
        assert!("(ls)".parse::<PermissionRule>().is_err());
    }

    #[test]
    fn test_prefix_rule_matches_whole_words_only() {
        let rule: PermissionRule = "bash(git diff:*)".parse().unwrap();
        let ok = json!({"command": "git diff --stat"});
        let bare = json!({"command": "git diff"});
        let other = json!({"command": "git difftool"});
        let chained = json!({"command": "git diff && rm -rf ."});
        assert!(rule.matches(&subject("bash", &ok, ToolCategory::Shell)));
        assert!(rule.matches(&subject("bash", &bare, ToolCategory::Shell)));
        assert!(!rule.matches(&subject("bash", &other, ToolCategory::Shell)));
        assert!(!rule.matches(&subject("bash", &chained, ToolCategory::Shell)));
    }

    #[test]
    fn test_glob_rule_matches_paths() {
        let rule: PermissionRule = "edit(src/**/*.rs)".parse().unwrap();
        let inside = json!({"path": "src/a/b.rs"});
        let outside = json!({"path": "Cargo.toml"});
        assert!(rule.matches(&subject("edit", &inside, ToolCategory::Edit)));
        assert!(!rule.matches(&subject("edit", &outside, ToolCategory::Edit)));
    }

    #[test]
    fn test_deny_beats_allow() {
        let (rules, errors) = RuleSet::from_lists(
            &["bash".into()],
            &["bash(rm:*)".into()],
            &[],
        );
        assert!(errors.is_empty());
        let rm = json!({"command": "rm foo"});
        let ls = json!({"command": "ls"});
        assert_eq!(rules.check(&subject("bash", &rm, ToolCategory::Shell)), Some(Decision::Deny));
        assert_eq!(rules.check(&subject("bash", &ls, ToolCategory::Shell)), Some(Decision::Allow));
        assert_eq!(rules.check(&subject("read", &ls, ToolCategory::Read)), None);
    }

    #[test]
    fn test_evaluation_order() {
        let mut rules = RuleSet::new();
        rules.add(Decision::Allow, "bash(cargo test:*)").unwrap();
        let mut arbiter = PermissionArbiter::new(Arc::new(rules), Arc::new(NoHooks));

        let test = json!({"command": "cargo test -p relay-agent"});
        let other = json!({"command": "make"});
        let read = json!({"path": "README.md"});

        assert_eq!(arbiter.evaluate(&subject("bash", &test, ToolCategory::Shell)), Decision::Allow);
        assert_eq!(arbiter.evaluate(&subject("bash", &other, ToolCategory::Shell)), Decision::Ask);
        assert_eq!(
            arbiter.evaluate(
                &subject("read", &read, ToolCategory::Read).with_default(Some(Decision::Allow))
            ),
            Decision::Allow
        );

        arbiter.allow_category_for_session(ToolCategory::Shell);
        assert_eq!(arbiter.evaluate(&subject("bash", &other, ToolCategory::Shell)), Decision::Allow);
    }

    #[test]
    fn test_plan_mode_denies_non_read_tools() {
        let mut arbiter = PermissionArbiter::default();
        arbiter.set_mode(OperatingMode::Plan);
        let args = json!({"path": "x"});
        assert_eq!(arbiter.evaluate(&subject("edit", &args, ToolCategory::Edit)), Decision::Deny);
        assert_eq!(
            arbiter.evaluate(&subject("read", &args, ToolCategory::Read).with_default(Some(Decision::Allow))),
            Decision::Allow
        );
        match arbiter.authorize(&subject("edit", &args, ToolCategory::Edit)) {
            Authorization::Deny { reason } => assert!(reason.contains("plan mode")),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_accept_allows_edits() {
        let mut arbiter = PermissionArbiter::default();
        let args = json!({"path": "x"});
        assert_eq!(arbiter.evaluate(&subject("edit", &args, ToolCategory::Edit)), Decision::Ask);
        arbiter.set_mode(OperatingMode::AutoAccept);
        assert_eq!(arbiter.evaluate(&subject("edit", &args, ToolCategory::Edit)), Decision::Allow);
        assert_eq!(arbiter.evaluate(&subject("bash", &args, ToolCategory::Shell)), Decision::Ask);
    }

    #[test]
    fn test_session_override_cleared_on_mode_change() {
        let mut arbiter = PermissionArbiter::default();
        arbiter.set_mode(OperatingMode::AutoAccept);
        let args = json!({"path": "src/lib.rs"});
        let edit = subject("edit", &args, ToolCategory::Edit);

        arbiter.allow_category_for_session(ToolCategory::Edit);
        assert_eq!(arbiter.evaluate(&edit), Decision::Allow);

        assert_eq!(arbiter.set_mode(OperatingMode::Normal), Some(OperatingMode::AutoAccept));
        assert!(arbiter.overrides().is_empty());
        assert_eq!(arbiter.evaluate(&edit), Decision::Ask);
    }

    #[test]
    fn test_same_mode_keeps_overrides() {
        let mut arbiter = PermissionArbiter::default();
        arbiter.allow_tool_for_session("web_fetch");
        assert_eq!(arbiter.set_mode(OperatingMode::Normal), None);
        assert!(!arbiter.overrides().is_empty());
    }

    #[test]
    fn test_remember_shell_approval_is_exact_command() {
        let mut arbiter = PermissionArbiter::default();
        let approved = json!({"command": "npm run build"});
        let different = json!({"command": "npm run deploy"});
        arbiter.remember_approval(&subject("bash", &approved, ToolCategory::Shell));
        assert_eq!(arbiter.evaluate(&subject("bash", &approved, ToolCategory::Shell)), Decision::Allow);
        assert_eq!(arbiter.evaluate(&subject("bash", &different, ToolCategory::Shell)), Decision::Ask);
    }

    #[test]
    fn test_persisted_deny_beats_session_approval() {
        let mut rules = RuleSet::new();
        rules.add(Decision::Deny, "bash(npm publish:*)").unwrap();
        let mut arbiter = PermissionArbiter::new(Arc::new(rules), Arc::new(NoHooks));
        let publish = json!({"command": "npm publish"});
        arbiter.remember_approval(&subject("bash", &publish, ToolCategory::Shell));
        assert_eq!(arbiter.evaluate(&subject("bash", &publish, ToolCategory::Shell)), Decision::Deny);
    }

    #[test]
    fn test_hook_vetoes_before_prompt() {
        let arbiter = PermissionArbiter::new(Arc::new(RuleSet::new()), Arc::new(BlockingHooks));
        let bad = json!({"command": "rm -rf /"});
        let fine = json!({"command": "ls"});
        assert_eq!(
            arbiter.authorize(&subject("bash", &bad, ToolCategory::Shell)),
            Authorization::Deny {
                reason: "Blocked by hook: destructive".into()
            }
        );
        assert_eq!(arbiter.authorize(&subject("bash", &fine, ToolCategory::Shell)), Authorization::Ask);
    }
}
