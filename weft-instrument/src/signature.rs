//! Hook signature analysis.
//!
//! Hooks are user-authored functions living outside the package under
//! compilation; the rule loader hands the core their textual declarations.
//! Analysis here is purely syntactic: the only identity check is that the
//! first formal names the well-known `HookContext` type. Everything else the
//! analyzer produces is positional.

use syn::ItemFn;

use crate::error::InstrumentError;

/// The well-known context type every hook must lead with.
pub const HOOK_CONTEXT_IDENT: &str = "HookContext";

/// Descriptor of one hook formal: its position (counting the mandatory
/// leading `HookContext` at index 0) and whether it is the trailing variadic
/// rest-slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamTrait {
    pub index: usize,
    pub is_variadic: bool,
}

/// Analyzed hook declaration: the parsed signature plus one trait per formal.
#[derive(Debug, Clone)]
pub struct HookSignature {
    pub ident: syn::Ident,
    pub sig: syn::Signature,
    pub traits: Vec<ParamTrait>,
}

impl HookSignature {
    /// Parse and analyze a textual hook declaration. `hook` is the qualified
    /// name used in diagnostics.
    pub fn analyze(hook: &str, decl: &str) -> Result<Self, InstrumentError> {
        let item: ItemFn = syn::parse_str(decl).map_err(|e| InstrumentError::HookSignature {
            hook: hook.to_string(),
            reason: format!("unparsable declaration: {}", e),
        })?;
        Self::from_signature(hook, item.sig)
    }

    pub fn from_signature(hook: &str, sig: syn::Signature) -> Result<Self, InstrumentError> {
        let first = sig.inputs.first().ok_or_else(|| missing_context(hook))?;
        match first {
            syn::FnArg::Typed(pat) if is_hook_context(&pat.ty) => {}
            _ => return Err(missing_context(hook)),
        }

        let mut traits: Vec<ParamTrait> = sig
            .inputs
            .iter()
            .enumerate()
            .map(|(index, _)| ParamTrait {
                index,
                is_variadic: false,
            })
            .collect();
        if sig.variadic.is_some() {
            traits.push(ParamTrait {
                index: traits.len(),
                is_variadic: true,
            });
        }
        validate_traits(hook, &traits)?;

        Ok(Self {
            ident: sig.ident.clone(),
            sig,
            traits,
        })
    }

    /// Re-emit the analyzed signature as source text.
    pub fn render(&self) -> String {
        let sig = &self.sig;
        quote::quote!(#sig).to_string()
    }
}

/// Structural checks shared with the dispatcher (which also accepts
/// driver-built trait lists): the context slot is never variadic, and a
/// variadic slot must be the last formal.
pub fn validate_traits(hook: &str, traits: &[ParamTrait]) -> Result<(), InstrumentError> {
    if traits.first().map(|t| t.is_variadic).unwrap_or(false) {
        return Err(missing_context(hook));
    }
    for (i, t) in traits.iter().enumerate() {
        if t.is_variadic && i != traits.len() - 1 {
            return Err(InstrumentError::HookSignature {
                hook: hook.to_string(),
                reason: "non-final variadic".to_string(),
            });
        }
    }
    Ok(())
}

fn missing_context(hook: &str) -> InstrumentError {
    InstrumentError::HookSignature {
        hook: hook.to_string(),
        reason: "missing HookContext".to_string(),
    }
}

/// Match the well-known context type by name: the last path segment, looking
/// through at most one reference. No type checking happens here.
fn is_hook_context(ty: &syn::Type) -> bool {
    let ty = match ty {
        syn::Type::Reference(r) => &*r.elem,
        other => other,
    };
    match ty {
        syn::Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|seg| seg.ident == HOOK_CONTEXT_IDENT)
            .unwrap_or(false),
        _ => false,
    }
}
