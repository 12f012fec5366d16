//! Hook dispatch generation.
//!
//! Fills a trampoline body with the single guarded statement that calls the
//! user hook. The guard is the runtime's per-rule predicate; the call and all
//! argument construction run under `catch_unwind`, so nothing a hook does can
//! reach the instrumented caller's frame.
//!
//! Argument selection is a positional prefix match. With `A` the trampoline's
//! formals and `H` the hook's traits, the emitted call passes exactly
//! `H[0] .. H[|H|-1]` where `H[0]` is the dispatch context (constructed
//! in-line on the before side, the `ctx` formal on the after side) and
//! `H[i]` for `i >= 1` maps to `A[i-1]` (before) or `A[i]` (after). A hook
//! declaring fewer formals than available simply ignores the tail; declaring
//! more is an arity error.

use proc_macro2::Span;
use syn::parse_quote;

use crate::error::{AritySide, InstrumentError};
use crate::signature::{validate_traits, ParamTrait};
use crate::trampoline::{variadic_ident, TrampolineKind};

/// Insert the guarded hook call into `tramp`, immediately before the
/// trailing `return;`.
pub fn emit_dispatch(
    tramp: &mut syn::ItemFn,
    kind: TrampolineKind,
    rule_name: &str,
    hook_path: &str,
    traits: &[ParamTrait],
) -> Result<(), InstrumentError> {
    if traits.is_empty() {
        return Err(InstrumentError::HookSignature {
            hook: hook_path.to_string(),
            reason: "missing HookContext".to_string(),
        });
    }
    validate_traits(hook_path, traits)?;

    let formals = formal_idents(tramp)?;
    check_arity(kind, traits.len(), formals.len())?;

    let hook: syn::Path =
        syn::parse_str(hook_path).map_err(|e| InstrumentError::HookSignature {
            hook: hook_path.to_string(),
            reason: format!("unparsable hook path: {}", e),
        })?;

    let variadic = variadic_ident(tramp);
    let args = hook_args(kind, traits, &formals);
    let guarded = match kind {
        TrampolineKind::Before => before_stmt(rule_name, &hook, &formals, variadic.as_ref(), args),
        TrampolineKind::After => after_stmt(rule_name, &hook, args),
    };

    let stmts = &mut tramp.block.stmts;
    if stmts.is_empty() {
        return Err(InstrumentError::AstMalformed {
            detail: format!(
                "trampoline `{}` has no trailing return to insert before",
                tramp.sig.ident
            ),
        });
    }
    stmts.insert(stmts.len() - 1, guarded);
    Ok(())
}

/// The trampoline's formal binding names, the variadic rest-slot last.
fn formal_idents(tramp: &syn::ItemFn) -> Result<Vec<syn::Ident>, InstrumentError> {
    let mut idents = Vec::new();
    for input in &tramp.sig.inputs {
        match input {
            syn::FnArg::Typed(pat) => match &*pat.pat {
                syn::Pat::Ident(p) => idents.push(p.ident.clone()),
                other => {
                    return Err(InstrumentError::AstMalformed {
                        detail: format!(
                            "trampoline formal is not a plain binding: {}",
                            quote::quote!(#other)
                        ),
                    })
                }
            },
            syn::FnArg::Receiver(_) => {
                return Err(InstrumentError::AstMalformed {
                    detail: "trampoline must not have a self receiver".to_string(),
                })
            }
        }
    }
    if let Some(ident) = variadic_ident(tramp) {
        idents.push(ident);
    }
    Ok(idents)
}

fn check_arity(
    kind: TrampolineKind,
    declared: usize,
    formals: usize,
) -> Result<(), InstrumentError> {
    let (available, side) = match kind {
        // The before side constructs the context itself, so the hook can
        // address one more position than the trampoline declares.
        TrampolineKind::Before => (formals + 1, AritySide::BeforeTarget),
        TrampolineKind::After => (formals, AritySide::AfterTrampoline),
    };
    if declared > available {
        return Err(InstrumentError::HookArity {
            declared,
            available,
            side,
        });
    }
    Ok(())
}

/// Argument expressions for the hook call, positions `1..` of the prefix.
/// The context argument at position 0 is supplied by the caller-side
/// statement builders. Matching is positional, so the trait's declared
/// `index` field is descriptive only. A variadic rest-slot is forwarded by
/// name with no per-element copy; Rust has no call-site spread token, so the
/// bundle travels as-is.
fn hook_args(
    kind: TrampolineKind,
    traits: &[ParamTrait],
    formals: &[syn::Ident],
) -> Vec<syn::Expr> {
    traits[1..]
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let formal = match kind {
                TrampolineKind::Before => &formals[i],
                TrampolineKind::After => &formals[i + 1],
            };
            parse_quote!(#formal)
        })
        .collect()
}

fn before_stmt(
    rule_name: &str,
    hook: &syn::Path,
    formals: &[syn::Ident],
    variadic: Option<&syn::Ident>,
    args: Vec<syn::Expr>,
) -> syn::Stmt {
    let ctx = syn::Ident::new("__weft_ctx", Span::call_site());
    let slots: Vec<syn::Expr> = formals
        .iter()
        .map(|formal| -> syn::Expr {
            if variadic == Some(formal) {
                // The bundle cannot be cloned into a slot; its position stays
                // empty so later slots keep their indices.
                parse_quote!(::weft_runtime::Slot::empty())
            } else {
                parse_quote!(::weft_runtime::Slot::new(#formal.clone()))
            }
        })
        .collect();

    parse_quote! {
        if ::weft_runtime::hook_enabled(#rule_name) {
            match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                let #ctx = ::weft_runtime::HookContext::new(vec![#(#slots),*]);
                #hook(#ctx.clone() #(, #args)*);
                #ctx
            })) {
                Ok(#ctx) => ::weft_runtime::store_context(#ctx),
                Err(payload) => ::weft_runtime::report_hook_panic(#rule_name, payload),
            }
        }
    }
}

fn after_stmt(rule_name: &str, hook: &syn::Path, args: Vec<syn::Expr>) -> syn::Stmt {
    let ctx = syn::Ident::new(crate::trampoline::CONTEXT_IDENT, Span::call_site());
    parse_quote! {
        if ::weft_runtime::hook_enabled(#rule_name) {
            if let Err(payload) = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                #hook(#ctx.clone() #(, #args)*);
            })) {
                ::weft_runtime::report_hook_panic(#rule_name, payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traits(n: usize) -> Vec<ParamTrait> {
        (0..n)
            .map(|index| ParamTrait {
                index,
                is_variadic: false,
            })
            .collect()
    }

    /// The inserted guard's hook call, for asserting on argument shape.
    fn dispatch_call(tramp: &syn::ItemFn) -> syn::ExprCall {
        let guard = tramp
            .block
            .stmts
            .iter()
            .find_map(|stmt| match stmt {
                syn::Stmt::Expr(syn::Expr::If(e), _) => Some(e),
                _ => None,
            })
            .expect("guard statement inserted");
        let mut found = None;
        find_call(&guard.then_branch, &mut found);
        found.expect("hook call inside guard")
    }

    fn find_call(block: &syn::Block, found: &mut Option<syn::ExprCall>) {
        // Everything the generator emits besides the hook call itself.
        const GENERATED: &[&str] = &[
            "catch_unwind",
            "AssertUnwindSafe",
            "new",
            "empty",
            "hook_enabled",
            "store_context",
            "report_hook_panic",
            "clone",
        ];
        struct V<'a>(&'a mut Option<syn::ExprCall>);
        impl<'ast> syn::visit::Visit<'ast> for V<'_> {
            fn visit_expr_call(&mut self, call: &'ast syn::ExprCall) {
                if let syn::Expr::Path(p) = &*call.func {
                    let name = p.path.segments.last().unwrap().ident.to_string();
                    if !GENERATED.contains(&name.as_str()) && self.0.is_none() {
                        *self.0 = Some(call.clone());
                    }
                }
                syn::visit::visit_expr_call(self, call);
            }
        }
        syn::visit::Visit::visit_block(&mut V(found), block);
    }

    #[test]
    fn before_hook_declaring_all_parameters() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn before_t(recv: Conn, p1: String, p2: i64) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::Before,
            "test_hook",
            "hooks::before",
            &traits(4),
        )
        .expect("full-prefix hook should dispatch");

        let call = dispatch_call(&tramp);
        assert_eq!(call.args.len(), 4, "context + receiver + 2 params");
    }

    #[test]
    fn before_hook_declaring_subset() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn before_t(recv: Conn, p1: String, p2: i64) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::Before,
            "test_hook",
            "hooks::before",
            &traits(2),
        )
        .unwrap();

        let call = dispatch_call(&tramp);
        assert_eq!(call.args.len(), 2, "context + receiver only");
    }

    #[test]
    fn before_hook_over_arity() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn before_t(p1: String) { return; }
        };
        let err = emit_dispatch(
            &mut tramp,
            TrampolineKind::Before,
            "test_hook",
            "hooks::before",
            &traits(3),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "hook declares 3 params but target function only has 2 params available"
        );
    }

    #[test]
    fn before_hook_with_variadic() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn before_t() { return; }
        };
        tramp.sig.inputs = parse_quote!(level: i32);
        tramp.sig.variadic = Some(syn::parse_str::<syn::ItemFn>("fn f(items: ...) {}")
            .unwrap()
            .sig
            .variadic
            .unwrap());

        let mut t = traits(2);
        t.push(ParamTrait {
            index: 2,
            is_variadic: true,
        });
        emit_dispatch(
            &mut tramp,
            TrampolineKind::Before,
            "test_hook",
            "hooks::before",
            &t,
        )
        .unwrap();

        let call = dispatch_call(&tramp);
        assert_eq!(call.args.len(), 3, "context + level + bundle");
        let last = call.args.last().unwrap();
        assert_eq!(
            quote::quote!(#last).to_string(),
            "items",
            "bundle forwarded as-is, no re-copy"
        );
    }

    #[test]
    fn after_hook_declaring_all_parameters() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn after_t(ctx: ::weft_runtime::HookContext, recv: Conn, p1: String, r0: f32, r1: String) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::After,
            "test_hook",
            "hooks::after",
            &traits(5),
        )
        .unwrap();
        assert_eq!(dispatch_call(&tramp).args.len(), 5);
    }

    #[test]
    fn after_hook_takes_strict_prefix() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn after_t(ctx: ::weft_runtime::HookContext, s: String, r0: f32, r1: String) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::After,
            "test_hook",
            "hooks::after",
            &traits(3),
        )
        .unwrap();

        let call = dispatch_call(&tramp);
        assert_eq!(call.args.len(), 3);
        // Strict prefix: positions 0..3 of (ctx, s, r0, r1), not a semantic
        // subset that skips the input.
        let rendered: Vec<String> = call
            .args
            .iter()
            .map(|a| quote::quote!(#a).to_string())
            .collect();
        assert_eq!(rendered[1], "s");
        assert_eq!(rendered[2], "r0");
    }

    #[test]
    fn after_hook_context_only() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn after_t(ctx: ::weft_runtime::HookContext, p1: String, p2: i64) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::After,
            "test_hook",
            "hooks::after",
            &traits(1),
        )
        .unwrap();
        assert_eq!(dispatch_call(&tramp).args.len(), 1);
    }

    #[test]
    fn after_hook_over_arity() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn after_t(ctx: ::weft_runtime::HookContext, p1: String) { return; }
        };
        let err = emit_dispatch(
            &mut tramp,
            TrampolineKind::After,
            "test_hook",
            "hooks::after",
            &traits(3),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "hook declares 3 params but trampoline only has 2 params available"
        );
    }

    #[test]
    fn guard_inserted_before_trailing_return() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn before_t(p1: String) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::Before,
            "test_hook",
            "hooks::before",
            &traits(2),
        )
        .unwrap();

        assert_eq!(tramp.block.stmts.len(), 2);
        assert!(matches!(
            tramp.block.stmts.last(),
            Some(syn::Stmt::Expr(syn::Expr::Return(_), Some(_)))
        ));
    }

    #[test]
    fn panic_containment_wraps_the_call() {
        let mut tramp: syn::ItemFn = parse_quote! {
            pub fn before_t(p1: String) { return; }
        };
        emit_dispatch(
            &mut tramp,
            TrampolineKind::Before,
            "test_hook",
            "hooks::before",
            &traits(2),
        )
        .unwrap();

        let rendered = quote::quote!(#tramp).to_string();
        assert!(rendered.contains("hook_enabled"));
        assert!(rendered.contains("catch_unwind"));
        assert!(rendered.contains("report_hook_panic"));
        assert!(rendered.contains("store_context"));
    }
}
