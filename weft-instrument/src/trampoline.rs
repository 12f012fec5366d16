//! Trampoline synthesis.
//!
//! A trampoline is a synthesized package-level function whose body (filled in
//! by the dispatcher) calls the user hook under guard. The before trampoline
//! mirrors the target's inputs exactly; the after trampoline prepends the
//! `HookContext` handed over by the call site and appends the target's
//! results. Neither returns anything, and both bodies are seeded with a lone
//! `return;` so the dispatcher has a well-defined insertion point.
//!
//! Variadic targets carry their rest-slot through to the trampolines; the
//! rest-slot stays the final formal (after the results on the after side),
//! which is the only position Rust's grammar admits.

use proc_macro2::Span;
use syn::parse_quote;
use syn::punctuated::Punctuated;
use syn::token::Comma;

use crate::error::InstrumentError;
use crate::naming;
use crate::rule::HookRule;
use crate::session::TargetFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineKind {
    Before,
    After,
}

/// The synthesized pair for one rule. A side is `None` when the rule
/// configures no hook for it; no wrapping is emitted for that side.
#[derive(Debug, Clone)]
pub struct Trampolines {
    pub before: Option<syn::ItemFn>,
    pub after: Option<syn::ItemFn>,
}

/// Identifier of the receiver formal when the target is a method.
pub const RECEIVER_IDENT: &str = "recv";
/// Identifier of the after trampoline's context formal.
pub const CONTEXT_IDENT: &str = "ctx";

/// Synthesize the trampoline pair for `rule` against `target`.
pub fn build(target: &TargetFunction, rule: &HookRule) -> Result<Trampolines, InstrumentError> {
    let before = rule
        .before
        .as_ref()
        .map(|_| build_one(TrampolineKind::Before, target, rule))
        .transpose()?;
    let after = rule
        .after
        .as_ref()
        .map(|_| build_one(TrampolineKind::After, target, rule))
        .transpose()?;
    Ok(Trampolines { before, after })
}

fn build_one(
    kind: TrampolineKind,
    target: &TargetFunction,
    rule: &HookRule,
) -> Result<syn::ItemFn, InstrumentError> {
    let symbol = target.symbol();
    let name = match kind {
        TrampolineKind::Before => naming::before_name(&rule.name, &symbol),
        TrampolineKind::After => naming::after_name(&rule.name, &symbol),
    };
    let ident = syn::Ident::new(&name, Span::call_site());

    let mut inputs: Punctuated<syn::FnArg, Comma> = Punctuated::new();
    if kind == TrampolineKind::After {
        let ctx = syn::Ident::new(CONTEXT_IDENT, Span::call_site());
        inputs.push(parse_quote!(#ctx: ::weft_runtime::HookContext));
    }
    if let Some(recv_ty) = &target.receiver {
        let recv = syn::Ident::new(RECEIVER_IDENT, Span::call_site());
        inputs.push(parse_quote!(#recv: #recv_ty));
    }
    for param in &target.params {
        let id = &param.ident;
        let ty = &param.ty;
        inputs.push(parse_quote!(#id: #ty));
    }
    if kind == TrampolineKind::After {
        for (i, ty) in target.results.iter().enumerate() {
            let id = result_ident(i);
            inputs.push(parse_quote!(#id: #ty));
        }
    }

    let mut item: syn::ItemFn = parse_quote! {
        #[allow(unused_variables)]
        pub fn #ident() {
            return;
        }
    };
    item.sig.inputs = inputs;
    item.sig.variadic = target.variadic.as_ref().map(named_variadic);

    verify_arity(kind, target, &item)?;
    Ok(item)
}

/// Name of the `i`-th result formal on the after trampoline.
pub fn result_ident(i: usize) -> syn::Ident {
    syn::Ident::new(&format!("r{}", i), Span::call_site())
}

/// The trampoline forwards the rest-slot by name, so an unnamed `...` on the
/// target gets a binding here.
fn named_variadic(variadic: &syn::Variadic) -> syn::Variadic {
    let mut cloned = variadic.clone();
    if cloned.pat.is_none() {
        let pat: syn::Pat = syn::Pat::Ident(syn::PatIdent {
            attrs: Vec::new(),
            by_ref: None,
            mutability: None,
            ident: syn::Ident::new("varargs", Span::call_site()),
            subpat: None,
        });
        cloned.pat = Some((Box::new(pat), Default::default()));
    }
    cloned
}

/// The variadic rest-slot's binding identifier, when the trampoline has one.
pub fn variadic_ident(item: &syn::ItemFn) -> Option<syn::Ident> {
    let variadic = item.sig.variadic.as_ref()?;
    let (pat, _) = variadic.pat.as_ref()?;
    match &**pat {
        syn::Pat::Ident(p) => Some(p.ident.clone()),
        _ => None,
    }
}

fn verify_arity(
    kind: TrampolineKind,
    target: &TargetFunction,
    item: &syn::ItemFn,
) -> Result<(), InstrumentError> {
    let built = item.sig.inputs.len() + usize::from(item.sig.variadic.is_some());
    let expected = match kind {
        TrampolineKind::Before => target.input_slots(),
        TrampolineKind::After => 1 + target.input_slots() + target.results.len(),
    };
    if built != expected {
        return Err(InstrumentError::AstMalformed {
            detail: format!(
                "{:?} trampoline for `{}` has {} formals, expected {}",
                kind,
                target.symbol(),
                built,
                expected
            ),
        });
    }
    Ok(())
}
