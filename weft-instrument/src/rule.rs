//! Instrumentation rule types.
//!
//! Rules arrive from an external loader (YAML, JSON, anything that can feed
//! serde); the core consumes only these structs. A rule binds one target
//! function to up to two hooks and selects how the dispatch is woven in.

use serde::{Deserialize, Serialize};

use crate::error::InstrumentError;

/// How a rule's dispatch is injected.
///
/// `CallSite` rewrites every call to the target inside the package.
/// `FuncBody` rewrites the target's own body instead (prologue/epilogue),
/// for targets whose callers live outside the package being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectMode {
    #[default]
    CallSite,
    FuncBody,
}

/// Reference to one user hook: where to call it and what it looks like.
///
/// `path` is the qualified call path emitted into generated dispatch
/// (e.g. `my_hooks::before_query`). `decl` is the hook's textual declaration,
/// extracted by the rule loader from the hook package's source; the core
/// parses it to compute parameter traits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRef {
    pub path: String,
    pub decl: String,
}

/// One instrumentation directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRule {
    /// Rule name, unique within a package run. Trampoline names derive
    /// from it, so it also keys the runtime's enabled-rules registry.
    pub name: String,
    /// Package path the rule applies to (matched by the driver, carried
    /// here for diagnostics).
    pub target: String,
    /// Target function name.
    pub func: String,
    /// Receiver type name for inherent methods; `None` for free functions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<HookRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<HookRef>,
    #[serde(default)]
    pub mode: InjectMode,
}

impl HookRule {
    /// A rule with neither hook is a loader bug; reject it up front.
    pub fn validate(&self) -> Result<(), InstrumentError> {
        if self.before.is_none() && self.after.is_none() {
            return Err(InstrumentError::HookSignature {
                hook: self.name.clone(),
                reason: "rule configures neither a before nor an after hook".to_string(),
            });
        }
        Ok(())
    }

    /// Target description used in diagnostics and name derivation,
    /// e.g. `Conn::query` or `open`.
    pub fn target_symbol(&self) -> String {
        match &self.receiver {
            Some(recv) => format!("{}::{}", recv, self.func),
            None => self.func.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(path: &str) -> HookRef {
        HookRef {
            path: path.to_string(),
            decl: format!("fn {}(ctx: HookContext) {{}}", path.rsplit("::").next().unwrap()),
        }
    }

    #[test]
    fn rule_requires_at_least_one_hook() {
        let mut rule = HookRule {
            name: "db_query".into(),
            target: "my_app::db".into(),
            func: "query".into(),
            receiver: Some("Conn".into()),
            before: None,
            after: None,
            mode: InjectMode::CallSite,
        };
        assert!(rule.validate().is_err());

        rule.before = Some(hook("hooks::before_query"));
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn target_symbol_includes_receiver() {
        let rule = HookRule {
            name: "r".into(),
            target: "p".into(),
            func: "query".into(),
            receiver: Some("Conn".into()),
            before: Some(hook("h::b")),
            after: None,
            mode: InjectMode::default(),
        };
        assert_eq!(rule.target_symbol(), "Conn::query");
    }

    #[test]
    fn deserializes_with_defaults() {
        let rule: HookRule = serde_json::from_str(
            r#"{
                "name": "http_serve",
                "target": "my_app::http",
                "func": "serve",
                "before": { "path": "hooks::before_serve", "decl": "fn before_serve(ctx: HookContext) {}" }
            }"#,
        )
        .expect("rule should deserialize");
        assert_eq!(rule.mode, InjectMode::CallSite);
        assert!(rule.receiver.is_none());
        assert!(rule.after.is_none());
    }
}
