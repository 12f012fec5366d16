//! Instrumentation phase driver.
//!
//! Entry point for the build-driver collaborator: [`rewrite_package`] applies
//! every rule to one package's AST session, in the order supplied. Each rule
//! is transactional — it either commits fully or the session is restored to
//! its pre-rule snapshot and a diagnostic records why. Only malformed-AST
//! errors abort the phase; everything else is a per-rule skip.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::emit_dispatch;
use crate::error::InstrumentError;
use crate::rewrite::{inject_function_body, rewrite_call_sites, RewritePlan};
use crate::rule::{HookRule, InjectMode};
use crate::session::{AstSession, TargetFunction};
use crate::signature::HookSignature;
use crate::trampoline::{self, TrampolineKind};

/// Cooperative cancellation handle shared with the driver. Checked at rule
/// and step boundaries; the in-flight rule rolls back when it fires.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Ok,
    Cancelled,
}

/// Per-rule outcome reported back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Applied,
    SkippedTargetNotFound,
    SkippedHookSignature,
    SkippedArity,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: String,
    pub outcome: OutcomeKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub status: PhaseStatus,
    pub outcomes: Vec<RuleOutcome>,
}

/// One rule application walks these states in order; any failure returns it
/// to `Init` via snapshot rollback. Only `Committed` persists changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleState {
    Init,
    Resolved,
    SignaturesParsed,
    TrampolinesBuilt,
    DispatchersEmitted,
    CallsRewritten,
    Committed,
}

/// Apply `rules` to `session`. Fatal errors surface as `Err`; the driver
/// discards the phase output in that case.
pub fn rewrite_package(
    session: &mut AstSession,
    rules: &[HookRule],
    cancel: &CancelFlag,
) -> Result<PhaseReport, InstrumentError> {
    let mut outcomes = Vec::with_capacity(rules.len());
    let mut status = PhaseStatus::Ok;
    let mut seen_names: HashSet<&str> = HashSet::new();

    for rule in rules {
        if cancel.is_cancelled() {
            status = PhaseStatus::Cancelled;
            break;
        }

        // Rule names key trampoline derivation and the runtime registry;
        // a duplicate would collide with the earlier rule's declarations.
        if !seen_names.insert(rule.name.as_str()) {
            warn!(rule = %rule.name, "duplicate rule name");
            outcomes.push(RuleOutcome {
                rule: rule.name.clone(),
                outcome: OutcomeKind::SkippedHookSignature,
                message: format!("duplicate rule name `{}` in this package run", rule.name),
            });
            continue;
        }

        let snapshot = session.snapshot();
        let mut phase = InstrumentPhase::new(session, rule, cancel);
        match phase.apply() {
            Ok(applied) => {
                info!(rule = %rule.name, target = %rule.target_symbol(), "rule applied");
                outcomes.push(RuleOutcome {
                    rule: rule.name.clone(),
                    outcome: OutcomeKind::Applied,
                    message: applied,
                });
            }
            Err(err) if err.is_fatal() => {
                // No rollback: the driver discards the whole phase output.
                return Err(err);
            }
            Err(InstrumentError::Cancelled) => {
                session.restore(snapshot);
                outcomes.push(RuleOutcome {
                    rule: rule.name.clone(),
                    outcome: OutcomeKind::RolledBack,
                    message: InstrumentError::Cancelled.to_string(),
                });
                status = PhaseStatus::Cancelled;
                break;
            }
            Err(err) => {
                session.restore(snapshot);
                warn!(rule = %rule.name, error = %err, "rule skipped");
                outcomes.push(skip_outcome(rule, &err));
            }
        }
    }

    Ok(PhaseReport { status, outcomes })
}

fn skip_outcome(rule: &HookRule, err: &InstrumentError) -> RuleOutcome {
    let (outcome, message) = match err {
        InstrumentError::TargetNotFound {
            suggestion: Some(candidate),
            ..
        } => (
            OutcomeKind::SkippedTargetNotFound,
            format!("{}; did you mean `{}`?", err, candidate),
        ),
        InstrumentError::TargetNotFound { .. } => {
            (OutcomeKind::SkippedTargetNotFound, err.to_string())
        }
        InstrumentError::HookSignature { .. } => {
            (OutcomeKind::SkippedHookSignature, err.to_string())
        }
        InstrumentError::HookArity { .. } => (OutcomeKind::SkippedArity, err.to_string()),
        // Fatal and cancellation are handled by the caller.
        _ => (OutcomeKind::RolledBack, err.to_string()),
    };
    RuleOutcome {
        rule: rule.name.clone(),
        outcome,
        message,
    }
}

/// Per-rule working state: the session handle, the rule being applied, and
/// the trampoline pair under construction.
struct InstrumentPhase<'a> {
    session: &'a mut AstSession,
    rule: &'a HookRule,
    cancel: &'a CancelFlag,
    state: RuleState,
    target: Option<TargetFunction>,
    before_sig: Option<HookSignature>,
    after_sig: Option<HookSignature>,
    before_hook_fn: Option<syn::ItemFn>,
    after_hook_fn: Option<syn::ItemFn>,
}

impl<'a> InstrumentPhase<'a> {
    fn new(session: &'a mut AstSession, rule: &'a HookRule, cancel: &'a CancelFlag) -> Self {
        Self {
            session,
            rule,
            cancel,
            state: RuleState::Init,
            target: None,
            before_sig: None,
            after_sig: None,
            before_hook_fn: None,
            after_hook_fn: None,
        }
    }

    /// Run the rule to `Committed`, returning the applied-message.
    fn apply(&mut self) -> Result<String, InstrumentError> {
        self.rule.validate()?;

        self.checkpoint()?;
        self.resolve()?;
        self.checkpoint()?;
        self.parse_signatures()?;
        self.checkpoint()?;
        self.build_trampolines()?;
        self.emit_dispatchers()?;
        self.insert_declarations();
        self.checkpoint()?;
        let message = self.rewrite_calls()?;
        self.advance(RuleState::Committed);
        Ok(message)
    }

    fn checkpoint(&self) -> Result<(), InstrumentError> {
        if self.cancel.is_cancelled() {
            return Err(InstrumentError::Cancelled);
        }
        Ok(())
    }

    fn advance(&mut self, next: RuleState) {
        debug!(rule = %self.rule.name, from = ?self.state, to = ?next, "rule state");
        self.state = next;
    }

    fn resolve(&mut self) -> Result<(), InstrumentError> {
        let target = self
            .session
            .resolve_target(&self.rule.func, self.rule.receiver.as_deref())?;
        self.target = Some(target);
        self.advance(RuleState::Resolved);
        Ok(())
    }

    fn parse_signatures(&mut self) -> Result<(), InstrumentError> {
        if let Some(hook) = &self.rule.before {
            self.before_sig = Some(HookSignature::analyze(&hook.path, &hook.decl)?);
        }
        if let Some(hook) = &self.rule.after {
            self.after_sig = Some(HookSignature::analyze(&hook.path, &hook.decl)?);
        }
        self.advance(RuleState::SignaturesParsed);
        Ok(())
    }

    fn build_trampolines(&mut self) -> Result<(), InstrumentError> {
        let target = self.target.as_ref().expect("resolved before building");
        let pair = trampoline::build(target, self.rule)?;
        self.before_hook_fn = pair.before;
        self.after_hook_fn = pair.after;
        self.advance(RuleState::TrampolinesBuilt);
        Ok(())
    }

    fn emit_dispatchers(&mut self) -> Result<(), InstrumentError> {
        if let (Some(tramp), Some(sig), Some(hook)) = (
            self.before_hook_fn.as_mut(),
            self.before_sig.as_ref(),
            self.rule.before.as_ref(),
        ) {
            emit_dispatch(
                tramp,
                TrampolineKind::Before,
                &self.rule.name,
                &hook.path,
                &sig.traits,
            )?;
        }
        if let (Some(tramp), Some(sig), Some(hook)) = (
            self.after_hook_fn.as_mut(),
            self.after_sig.as_ref(),
            self.rule.after.as_ref(),
        ) {
            emit_dispatch(
                tramp,
                TrampolineKind::After,
                &self.rule.name,
                &hook.path,
                &sig.traits,
            )?;
        }
        self.advance(RuleState::DispatchersEmitted);
        Ok(())
    }

    fn insert_declarations(&mut self) {
        let file = self.target.as_ref().expect("resolved").file;
        if let Some(item) = self.before_hook_fn.clone() {
            self.session.insert_item(file, syn::Item::Fn(item));
        }
        if let Some(item) = self.after_hook_fn.clone() {
            self.session.insert_item(file, syn::Item::Fn(item));
        }
    }

    fn rewrite_calls(&mut self) -> Result<String, InstrumentError> {
        let target = self.target.as_ref().expect("resolved");
        let plan = RewritePlan {
            target,
            before: self.before_hook_fn.as_ref().map(|f| f.sig.ident.clone()),
            after: self.after_hook_fn.as_ref().map(|f| f.sig.ident.clone()),
        };

        let message = match self.rule.mode {
            InjectMode::CallSite => {
                let count = rewrite_call_sites(self.session, &plan);
                debug!(rule = %self.rule.name, call_sites = count, "call sites rewritten");
                format!(
                    "instrumented `{}` at {} call site(s)",
                    target.symbol(),
                    count
                )
            }
            InjectMode::FuncBody => {
                inject_function_body(self.session, &plan)?;
                format!("injected dispatch into body of `{}`", target.symbol())
            }
        };
        self.advance(RuleState::CallsRewritten);
        Ok(message)
    }
}
