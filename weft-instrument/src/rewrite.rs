//! Call-site rewriting and entry-point body injection.
//!
//! In `CallSite` mode every call to the target inside the package is replaced
//! by a block that binds the arguments once, routes them through the before
//! trampoline, reads back any hook mutations from the runtime's context
//! storage, performs the original call, dispatches the after trampoline with
//! a fresh context carrying parameter and result slots, and yields the
//! original result unchanged.
//!
//! In `FuncBody` mode (targets whose callers live outside the package) the
//! target's own body is rewritten instead: prologue, original body moved into
//! an immediately-invoked `move` closure so early returns converge, epilogue.
//!
//! Generated code clones arguments and results into context slots, so
//! instrumented values must be `Clone + 'static`; this is the statically
//! typed rendering of the type-erased slot container. Method receivers are
//! bound by reference at call sites (`&self` methods; mutation read-back
//! never applies to the receiver slot) and variadic targets are dispatched at
//! the trampoline layer only — their call sites cannot be re-expressed in
//! this grammar and are left alone.

use proc_macro2::Span;
use quote::format_ident;
use syn::parse_quote;
use syn::visit_mut::VisitMut;

use crate::error::InstrumentError;
use crate::session::{AstSession, TargetFunction};

/// What the rewriter weaves around the target: the trampoline pair's names.
/// An absent side emits no wrapping for that side.
#[derive(Debug, Clone)]
pub struct RewritePlan<'a> {
    pub target: &'a TargetFunction,
    pub before: Option<syn::Ident>,
    pub after: Option<syn::Ident>,
}

impl RewritePlan<'_> {
    fn has_receiver(&self) -> bool {
        self.target.receiver.is_some()
    }

    /// Slot index of parameter `i` in the hook context (receiver occupies
    /// slot 0 when present).
    fn param_slot(&self, i: usize) -> usize {
        i + usize::from(self.has_receiver())
    }
}

/// Rewrite every matching call expression in the session. Returns the number
/// of rewritten sites.
pub fn rewrite_call_sites(session: &mut AstSession, plan: &RewritePlan) -> usize {
    if plan.target.variadic.is_some() {
        return 0;
    }
    let mut rewriter = CallRewriter { plan, count: 0 };
    for file in session.files_mut() {
        rewriter.visit_file_mut(&mut file.ast);
    }
    rewriter.count
}

struct CallRewriter<'a> {
    plan: &'a RewritePlan<'a>,
    count: usize,
}

impl VisitMut for CallRewriter<'_> {
    fn visit_expr_mut(&mut self, expr: &mut syn::Expr) {
        // Children first: nested calls (including earlier rules' generated
        // blocks) are rewritten before this node wraps them.
        syn::visit_mut::visit_expr_mut(self, expr);
        if let Some(replacement) = self.try_rewrite(expr) {
            *expr = replacement;
            self.count += 1;
        }
    }
}

impl CallRewriter<'_> {
    fn try_rewrite(&self, expr: &syn::Expr) -> Option<syn::Expr> {
        let target = self.plan.target;
        match expr {
            syn::Expr::Call(call) if !self.plan.has_receiver() => {
                let path = match &*call.func {
                    syn::Expr::Path(p) => p,
                    _ => return None,
                };
                let last = path.path.segments.last()?;
                if last.ident != target.name || call.args.len() != target.params.len() {
                    return None;
                }
                let args: Vec<syn::Expr> = call.args.iter().cloned().collect();
                Some(self.build_call_site(Callee::Path(path.clone()), None, args))
            }
            syn::Expr::MethodCall(call) if self.plan.has_receiver() => {
                if call.method != target.name
                    || call.args.len() != target.params.len()
                    || call.turbofish.is_some()
                {
                    return None;
                }
                let args: Vec<syn::Expr> = call.args.iter().cloned().collect();
                Some(self.build_call_site(
                    Callee::Method(call.method.clone()),
                    Some((*call.receiver).clone()),
                    args,
                ))
            }
            _ => None,
        }
    }

    /// The replacement block. `receiver` is the receiver expression for
    /// method calls, bound by reference so the surrounding code keeps
    /// ownership.
    fn build_call_site(
        &self,
        callee: Callee,
        receiver: Option<syn::Expr>,
        args: Vec<syn::Expr>,
    ) -> syn::Expr {
        let plan = self.plan;
        let target = plan.target;
        let mutable = plan.before.is_some();

        let recv_ident = receiver
            .as_ref()
            .map(|_| syn::Ident::new("__weft_recv", Span::call_site()));
        let arg_idents: Vec<syn::Ident> = (0..args.len())
            .map(|i| format_ident!("__weft_arg{}", i))
            .collect();

        let mut stmts: Vec<syn::Stmt> = Vec::new();

        // 1. Bind arguments once, left to right, receiver first.
        if let (Some(recv), Some(recv_ident)) = (&receiver, &recv_ident) {
            stmts.push(parse_quote!(let #recv_ident = &(#recv);));
        }
        for (ident, arg) in arg_idents.iter().zip(&args) {
            if mutable {
                stmts.push(parse_quote!(#[allow(unused_mut)] let mut #ident = #arg;));
            } else {
                stmts.push(parse_quote!(let #ident = #arg;));
            }
        }

        // 2. Before trampoline with clones of the bindings. The receiver is
        // cloned through a deref so a borrowed receiver still yields a value.
        if let Some(before) = &plan.before {
            let mut before_args: Vec<syn::Expr> = Vec::new();
            if let Some(recv_ident) = &recv_ident {
                before_args.push(parse_quote!((*#recv_ident).clone()));
            }
            before_args.extend(arg_idents.iter().map(|id| -> syn::Expr {
                parse_quote!(#id.clone())
            }));
            stmts.push(parse_quote!(#before(#(#before_args),*);));

            // 3. Fold hook mutations back into the live arguments. The
            // receiver slot is read-only.
            if !arg_idents.is_empty() {
                let readbacks: Vec<syn::Stmt> = arg_idents
                    .iter()
                    .enumerate()
                    .map(|(i, ident)| {
                        let ty = &target.params[i].ty;
                        let slot = plan.param_slot(i);
                        parse_quote! {
                            if let Some(__weft_v) = __weft_cx.take_param::<#ty>(#slot) {
                                #ident = __weft_v;
                            }
                        }
                    })
                    .collect();
                stmts.push(parse_quote! {
                    if let Some(__weft_cx) = ::weft_runtime::take_context() {
                        #(#readbacks)*
                    }
                });
            } else {
                stmts.push(parse_quote! {
                    let _ = ::weft_runtime::take_context();
                });
            }
        }

        // 4. Pre-copies for the after dispatch, taken before the call
        // consumes the bindings.
        let param_copies: Vec<syn::Ident> = (0..arg_idents.len() + usize::from(recv_ident.is_some()))
            .map(|i| format_ident!("__weft_p{}", i))
            .collect();
        if plan.after.is_some() {
            let mut sources: Vec<syn::Expr> = Vec::new();
            if let Some(recv_ident) = &recv_ident {
                sources.push(parse_quote!((*#recv_ident).clone()));
            }
            sources.extend(arg_idents.iter().map(|id| -> syn::Expr {
                parse_quote!(#id.clone())
            }));
            for (copy, source) in param_copies.iter().zip(&sources) {
                stmts.push(parse_quote!(let #copy = #source;));
            }
        }

        // 5. The original call with the (possibly mutated) bindings.
        let call_expr: syn::Expr = match &callee {
            Callee::Path(path) => parse_quote!(#path(#(#arg_idents),*)),
            Callee::Method(method) => {
                let recv_ident = recv_ident.as_ref().expect("method call has receiver");
                parse_quote!((*#recv_ident).#method(#(#arg_idents),*))
            }
        };
        let has_results = !target.results.is_empty();
        if has_results {
            stmts.push(parse_quote!(let __weft_ret = #call_expr;));
        } else {
            stmts.push(parse_quote!(#call_expr;));
        }

        // 6. After trampoline with a fresh context over params and results.
        if let Some(after) = &plan.after {
            let result_exprs = result_accessors(target.results.len());
            let param_slots: Vec<syn::Expr> = param_copies
                .iter()
                .map(|id| -> syn::Expr { parse_quote!(::weft_runtime::Slot::new(#id.clone())) })
                .collect();
            let result_slots: Vec<syn::Expr> = result_exprs
                .iter()
                .map(|e| -> syn::Expr { parse_quote!(::weft_runtime::Slot::new(#e.clone())) })
                .collect();
            let result_args: Vec<syn::Expr> = result_exprs
                .iter()
                .map(|e| -> syn::Expr { parse_quote!(#e.clone()) })
                .collect();
            stmts.push(parse_quote! {
                #after(
                    ::weft_runtime::HookContext::with_returns(
                        vec![#(#param_slots),*],
                        vec![#(#result_slots),*],
                    )
                    #(, #param_copies)*
                    #(, #result_args)*
                );
            });
        }

        if has_results {
            parse_quote!({ #(#stmts)* __weft_ret })
        } else {
            parse_quote!({ #(#stmts)* })
        }
    }
}

enum Callee {
    Path(syn::ExprPath),
    Method(syn::Ident),
}

/// Accessor expressions for the bound result: the whole binding for a single
/// result, tuple projections otherwise.
fn result_accessors(count: usize) -> Vec<syn::Expr> {
    match count {
        0 => Vec::new(),
        1 => vec![parse_quote!(__weft_ret)],
        n => (0..n)
            .map(|i| {
                let idx = syn::Index::from(i);
                parse_quote!(__weft_ret.#idx)
            })
            .collect(),
    }
}

/// Entry-point mode: rewrite the target's own body with prologue/epilogue
/// dispatch. Used when external call sites cannot be rewritten.
pub fn inject_function_body(
    session: &mut AstSession,
    plan: &RewritePlan,
) -> Result<(), InstrumentError> {
    if plan.target.variadic.is_some() {
        return Err(InstrumentError::AstMalformed {
            detail: format!(
                "variadic target `{}` cannot host body injection",
                plan.target.symbol()
            ),
        });
    }
    let target = plan.target;
    let file = &mut session.files_mut()[target.file];

    for item in &mut file.ast.items {
        match item {
            syn::Item::Fn(f) if target.receiver.is_none() && f.sig.ident == target.name => {
                f.block = Box::new(injected_body(plan, &f.sig, &f.block));
                return Ok(());
            }
            syn::Item::Impl(imp) if target.receiver.is_some() && imp.trait_.is_none() => {
                let wanted = target.receiver.as_ref().and_then(crate::session::type_name);
                if crate::session::type_name(&imp.self_ty) != wanted {
                    continue;
                }
                for impl_item in &mut imp.items {
                    if let syn::ImplItem::Fn(m) = impl_item {
                        if m.sig.ident == target.name {
                            m.block = injected_body(plan, &m.sig, &m.block);
                            return Ok(());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Err(InstrumentError::AstMalformed {
        detail: format!(
            "resolved target `{}` disappeared before body injection",
            target.symbol()
        ),
    })
}

fn injected_body(plan: &RewritePlan, sig: &syn::Signature, original: &syn::Block) -> syn::Block {
    let target = plan.target;
    let mut stmts: Vec<syn::Stmt> = Vec::new();

    let recv_expr: Option<syn::Expr> =
        target.receiver.as_ref().map(|_| parse_quote!(self.clone()));
    let param_idents: Vec<&syn::Ident> = target.params.iter().map(|p| &p.ident).collect();

    // Prologue: before dispatch plus mutation read-back by shadow rebinding.
    if let Some(before) = &plan.before {
        let mut before_args: Vec<syn::Expr> = Vec::new();
        if let Some(recv) = &recv_expr {
            before_args.push(recv.clone());
        }
        before_args.extend(param_idents.iter().map(|id| -> syn::Expr {
            parse_quote!(#id.clone())
        }));
        stmts.push(parse_quote!(#before(#(#before_args),*);));

        if param_idents.is_empty() {
            stmts.push(parse_quote!(let _ = ::weft_runtime::take_context();));
        } else {
            let rebinds: Vec<syn::Expr> = param_idents
                .iter()
                .enumerate()
                .map(|(i, ident)| {
                    let ty = &target.params[i].ty;
                    let slot = plan.param_slot(i);
                    parse_quote!(__weft_cx.take_param::<#ty>(#slot).unwrap_or(#ident))
                })
                .collect();
            let fallthrough: Vec<syn::Expr> = param_idents
                .iter()
                .map(|id| -> syn::Expr { parse_quote!(#id) })
                .collect();
            if param_idents.len() == 1 {
                let ident = param_idents[0];
                let rebind = &rebinds[0];
                let fall = &fallthrough[0];
                stmts.push(parse_quote! {
                    #[allow(unused_mut)]
                    let mut #ident = match ::weft_runtime::take_context() {
                        Some(__weft_cx) => #rebind,
                        None => #fall,
                    };
                });
            } else {
                stmts.push(parse_quote! {
                    #[allow(unused_mut)]
                    let (#(mut #param_idents),*) = match ::weft_runtime::take_context() {
                        Some(__weft_cx) => (#(#rebinds),*),
                        None => (#(#fallthrough),*),
                    };
                });
            }
        }
    }

    // Pre-copies for the epilogue, taken before the body consumes anything.
    let copy_count = usize::from(recv_expr.is_some()) + param_idents.len();
    let param_copies: Vec<syn::Ident> = (0..copy_count)
        .map(|i| format_ident!("__weft_p{}", i))
        .collect();
    if plan.after.is_some() {
        let mut sources: Vec<syn::Expr> = Vec::new();
        if let Some(recv) = &recv_expr {
            sources.push(recv.clone());
        }
        sources.extend(param_idents.iter().map(|id| -> syn::Expr {
            parse_quote!(#id.clone())
        }));
        for (copy, source) in param_copies.iter().zip(&sources) {
            stmts.push(parse_quote!(let #copy = #source;));
        }
    }

    // The original body, with early returns converging on the binding.
    let invoke: syn::Expr = if sig.asyncness.is_some() {
        parse_quote!((async move #original).await)
    } else if let syn::ReturnType::Type(_, ty) = &sig.output {
        if contains_impl_trait(ty) {
            parse_quote!((move || #original)())
        } else {
            parse_quote!((move || -> #ty #original)())
        }
    } else {
        parse_quote!((move || #original)())
    };
    stmts.push(parse_quote!(let __weft_ret = #invoke;));

    // Epilogue: after dispatch over the pre-copies and the bound result.
    if let Some(after) = &plan.after {
        let result_exprs = result_accessors(target.results.len());
        let param_slots: Vec<syn::Expr> = param_copies
            .iter()
            .map(|id| -> syn::Expr { parse_quote!(::weft_runtime::Slot::new(#id.clone())) })
            .collect();
        let result_slots: Vec<syn::Expr> = result_exprs
            .iter()
            .map(|e| -> syn::Expr { parse_quote!(::weft_runtime::Slot::new(#e.clone())) })
            .collect();
        let result_args: Vec<syn::Expr> = result_exprs
            .iter()
            .map(|e| -> syn::Expr { parse_quote!(#e.clone()) })
            .collect();
        stmts.push(parse_quote! {
            #after(
                ::weft_runtime::HookContext::with_returns(
                    vec![#(#param_slots),*],
                    vec![#(#result_slots),*],
                )
                #(, #param_copies)*
                #(, #result_args)*
            );
        });
    }

    parse_quote!({ #(#stmts)* __weft_ret })
}

fn contains_impl_trait(ty: &syn::Type) -> bool {
    struct Finder(bool);
    impl<'ast> syn::visit::Visit<'ast> for Finder {
        fn visit_type_impl_trait(&mut self, _: &'ast syn::TypeImplTrait) {
            self.0 = true;
        }
    }
    let mut finder = Finder(false);
    syn::visit::Visit::visit_type(&mut finder, ty);
    finder.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AstSession;

    fn plan_idents(before: bool, after: bool) -> (Option<syn::Ident>, Option<syn::Ident>) {
        (
            before.then(|| syn::Ident::new("__weft_before_r_aaaaaaaa", Span::call_site())),
            after.then(|| syn::Ident::new("__weft_after_r_aaaaaaaa", Span::call_site())),
        )
    }

    const FREE_FN_SRC: &str = r#"
        pub fn open(path: String, flags: i64) -> (f32, String) {
            (0.0, path)
        }

        pub fn caller() {
            let (score, name) = open(String::from("a"), 1);
            let _ = (score, name);
        }
    "#;

    #[test]
    fn rewrites_free_function_call() {
        let mut session = AstSession::parse_source("lib.rs", FREE_FN_SRC).unwrap();
        let target = session.resolve_target("open", None).unwrap();
        let (before, after) = plan_idents(true, true);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };

        let count = rewrite_call_sites(&mut session, &plan);
        assert_eq!(count, 1);

        let rendered = session.render().remove(0).1;
        assert!(rendered.contains("__weft_before_r_aaaaaaaa("));
        assert!(rendered.contains("__weft_after_r_aaaaaaaa("));
        assert!(rendered.contains("take_context"));
        assert!(
            rendered.contains("take_param::<String>"),
            "read-back is type-directed: {}",
            rendered
        );
        // The declaration itself is untouched.
        assert!(rendered.contains("pub fn open(path: String, flags: i64) -> (f32, String)"));
    }

    #[test]
    fn before_only_emits_no_after_wrapping() {
        let mut session = AstSession::parse_source("lib.rs", FREE_FN_SRC).unwrap();
        let target = session.resolve_target("open", None).unwrap();
        let (before, after) = plan_idents(true, false);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };

        rewrite_call_sites(&mut session, &plan);
        let rendered = session.render().remove(0).1;
        assert!(rendered.contains("__weft_before_r_aaaaaaaa("));
        assert!(!rendered.contains("__weft_after"));
        assert!(!rendered.contains("with_returns"));
    }

    #[test]
    fn arity_mismatch_is_not_a_call_site() {
        let src = r#"
            pub fn open(path: String) -> f32 { 0.0 }
            pub fn caller() { let _ = open(String::new()); other::open(); }
        "#;
        let mut session = AstSession::parse_source("lib.rs", src).unwrap();
        let target = session.resolve_target("open", None).unwrap();
        let (before, after) = plan_idents(true, false);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };
        // `other::open()` takes zero args; only the real call is rewritten.
        assert_eq!(rewrite_call_sites(&mut session, &plan), 1);
    }

    #[test]
    fn rewrites_method_call_binding_receiver_by_ref() {
        let src = r#"
            pub struct Conn;
            impl Conn {
                pub fn query(&self, sql: String) -> f32 { let _ = sql; 0.0 }
            }
            pub fn caller(conn: &Conn) {
                let _ = conn.query(String::from("select 1"));
            }
        "#;
        let mut session = AstSession::parse_source("lib.rs", src).unwrap();
        let target = session.resolve_target("query", Some("Conn")).unwrap();
        let (before, after) = plan_idents(true, true);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };

        assert_eq!(rewrite_call_sites(&mut session, &plan), 1);
        let rendered = session.render().remove(0).1;
        assert!(rendered.contains("let __weft_recv = &(conn)"));
        assert!(rendered.contains("(*__weft_recv).query("));
        // Receiver occupies slot 0, so the sql param reads back from slot 1.
        assert!(rendered.contains("take_param::<String>(1usize)"));
    }

    #[test]
    fn nested_calls_rewrite_inside_out() {
        let src = r#"
            pub fn twice(n: i64) -> i64 { n * 2 }
            pub fn caller() -> i64 { twice(twice(3)) }
        "#;
        let mut session = AstSession::parse_source("lib.rs", src).unwrap();
        let target = session.resolve_target("twice", None).unwrap();
        let (before, after) = plan_idents(true, false);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };
        assert_eq!(rewrite_call_sites(&mut session, &plan), 2);
    }

    #[test]
    fn variadic_targets_leave_call_sites_alone() {
        let src = r#"
            pub unsafe extern "C" fn emit(level: i32, items: ...) {}
        "#;
        let mut session = AstSession::parse_source("lib.rs", src).unwrap();
        let target = session.resolve_target("emit", None).unwrap();
        let (before, after) = plan_idents(true, false);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };
        assert_eq!(rewrite_call_sites(&mut session, &plan), 0);
    }

    #[test]
    fn body_injection_wraps_original_in_closure() {
        let src = r#"
            pub struct Handler;
            impl Handler {
                pub fn serve(&self, req: String) -> i64 {
                    if req.is_empty() {
                        return -1;
                    }
                    req.len() as i64
                }
            }
        "#;
        let mut session = AstSession::parse_source("lib.rs", src).unwrap();
        let target = session.resolve_target("serve", Some("Handler")).unwrap();
        let (before, after) = plan_idents(true, true);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };

        inject_function_body(&mut session, &plan).unwrap();
        let rendered = session.render().remove(0).1;
        assert!(rendered.contains("__weft_before_r_aaaaaaaa(self.clone()"));
        assert!(
            rendered.contains("move || -> i64"),
            "early returns converge through the closure: {}",
            rendered
        );
        assert!(rendered.contains("__weft_after_r_aaaaaaaa("));
        assert!(rendered.contains("__weft_ret"));
    }

    #[test]
    fn body_injection_of_async_target_uses_async_block() {
        let src = r#"
            pub async fn fetch(url: String) -> f32 { let _ = url; 0.0 }
        "#;
        let mut session = AstSession::parse_source("lib.rs", src).unwrap();
        let target = session.resolve_target("fetch", None).unwrap();
        let (before, after) = plan_idents(true, false);
        let plan = RewritePlan {
            target: &target,
            before,
            after,
        };
        inject_function_body(&mut session, &plan).unwrap();
        let rendered = session.render().remove(0).1;
        assert!(rendered.contains("async move"));
        assert!(rendered.contains(".await"));
    }
}
