//! AST session: parsed source of one package.
//!
//! The session owns every declaration, including the ones the phase
//! synthesizes. The package's files are treated as one flat namespace (the
//! driver hands the core the files of a single module), so a trampoline
//! inserted next to the target declaration is callable from every rewritten
//! call site.

use std::path::PathBuf;

use strsim::levenshtein;

use crate::error::InstrumentError;

/// One named formal of a target function.
#[derive(Debug, Clone)]
pub struct Param {
    pub ident: syn::Ident,
    pub ty: syn::Type,
}

/// The resolved declaration a rule instruments.
///
/// Receivers are carried separately and treated as the first parameter by
/// every downstream component. Results are decomposed: a tuple return type
/// contributes one result per element, any other type is a single result,
/// and no return type means no results.
#[derive(Debug, Clone)]
pub struct TargetFunction {
    pub name: String,
    pub receiver: Option<syn::Type>,
    pub params: Vec<Param>,
    pub variadic: Option<syn::Variadic>,
    pub results: Vec<syn::Type>,
    /// Index of the session file holding the declaration.
    pub file: usize,
}

impl TargetFunction {
    /// `Conn::query` for methods, `open` for free functions.
    pub fn symbol(&self) -> String {
        match &self.receiver {
            Some(ty) => format!("{}::{}", type_name(ty).unwrap_or_default(), self.name),
            None => self.name.clone(),
        }
    }

    /// Number of input slots: receiver (when present) plus declared params
    /// plus the variadic rest-slot.
    pub fn input_slots(&self) -> usize {
        usize::from(self.receiver.is_some())
            + self.params.len()
            + usize::from(self.variadic.is_some())
    }
}

/// One parsed source file of the package.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: PathBuf,
    pub ast: syn::File,
}

/// Byte-faithful copy of the session used for per-rule rollback.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    files: Vec<SourceFile>,
}

/// The decorated syntax tree of one package under compilation.
#[derive(Debug)]
pub struct AstSession {
    files: Vec<SourceFile>,
}

impl AstSession {
    /// Parse a set of `(file name, source text)` pairs. Any parse failure is
    /// fatal: the package cannot be instrumented at all.
    pub fn parse_files<I, P>(sources: I) -> Result<Self, InstrumentError>
    where
        I: IntoIterator<Item = (P, String)>,
        P: Into<PathBuf>,
    {
        let mut files = Vec::new();
        for (name, source) in sources {
            let name = name.into();
            let ast = syn::parse_file(&source).map_err(|e| InstrumentError::AstMalformed {
                detail: format!("{}: {}", name.display(), e),
            })?;
            files.push(SourceFile { name, ast });
        }
        Ok(Self { files })
    }

    /// Single-file convenience used heavily by tests.
    pub fn parse_source(name: &str, source: &str) -> Result<Self, InstrumentError> {
        Self::parse_files([(name, source.to_string())])
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut [SourceFile] {
        &mut self.files
    }

    /// Pretty-print every file back to source text.
    pub fn render(&self) -> Vec<(PathBuf, String)> {
        self.files
            .iter()
            .map(|f| (f.name.clone(), prettyplease::unparse(&f.ast)))
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            files: self.files.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        self.files = snapshot.files;
    }

    /// Append a synthesized declaration to a file. The session owns it from
    /// here on.
    pub fn insert_item(&mut self, file: usize, item: syn::Item) {
        self.files[file].ast.items.push(item);
    }

    /// Resolve a rule's target inside the package.
    ///
    /// Free functions match top-level `fn` items by name; methods match
    /// inherent-impl items whose self type's last segment equals the rule's
    /// receiver (leading `&`/`*` in the rule text are ignored). Generic
    /// declarations are not candidates: instrumentation is restricted to
    /// concrete functions.
    pub fn resolve_target(
        &self,
        func: &str,
        receiver: Option<&str>,
    ) -> Result<TargetFunction, InstrumentError> {
        for (file_idx, file) in self.files.iter().enumerate() {
            for item in &file.ast.items {
                match (item, receiver) {
                    (syn::Item::Fn(f), None) if f.sig.ident == func => {
                        if !f.sig.generics.params.is_empty() {
                            continue;
                        }
                        return target_from_signature(&f.sig, None, file_idx);
                    }
                    (syn::Item::Impl(imp), Some(recv)) if imp.trait_.is_none() => {
                        if type_name(&imp.self_ty).as_deref() != Some(normalize_receiver(recv)) {
                            continue;
                        }
                        for impl_item in &imp.items {
                            if let syn::ImplItem::Fn(m) = impl_item {
                                if m.sig.ident == func && m.sig.generics.params.is_empty() {
                                    return target_from_signature(
                                        &m.sig,
                                        Some((*imp.self_ty).clone()),
                                        file_idx,
                                    );
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let wanted = match receiver {
            Some(recv) => format!("{}::{}", normalize_receiver(recv), func),
            None => func.to_string(),
        };
        Err(InstrumentError::TargetNotFound {
            suggestion: self.suggest(&wanted),
            name: wanted,
        })
    }

    /// Closest declared function symbol, for "did you mean" diagnostics.
    fn suggest(&self, wanted: &str) -> Option<String> {
        const MAX_DISTANCE: usize = 3;
        self.function_symbols()
            .into_iter()
            .filter(|candidate| candidate != wanted)
            .map(|candidate| (levenshtein(wanted, &candidate), candidate))
            .filter(|(dist, _)| *dist <= MAX_DISTANCE)
            .min_by_key(|(dist, _)| *dist)
            .map(|(_, candidate)| candidate)
    }

    fn function_symbols(&self) -> Vec<String> {
        let mut symbols = Vec::new();
        for file in &self.files {
            for item in &file.ast.items {
                match item {
                    syn::Item::Fn(f) => symbols.push(f.sig.ident.to_string()),
                    syn::Item::Impl(imp) if imp.trait_.is_none() => {
                        let recv = type_name(&imp.self_ty).unwrap_or_default();
                        for impl_item in &imp.items {
                            if let syn::ImplItem::Fn(m) = impl_item {
                                symbols.push(format!("{}::{}", recv, m.sig.ident));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        symbols
    }
}

fn target_from_signature(
    sig: &syn::Signature,
    receiver: Option<syn::Type>,
    file: usize,
) -> Result<TargetFunction, InstrumentError> {
    let mut params = Vec::new();
    for (i, input) in sig.inputs.iter().enumerate() {
        match input {
            syn::FnArg::Receiver(_) => {
                if receiver.is_none() {
                    return Err(InstrumentError::AstMalformed {
                        detail: format!("free function `{}` has a receiver", sig.ident),
                    });
                }
            }
            syn::FnArg::Typed(pat) => {
                let ident = match &*pat.pat {
                    syn::Pat::Ident(p) => p.ident.clone(),
                    // Destructuring patterns keep their type but get a
                    // positional name in the trampoline.
                    _ => syn::Ident::new(&format!("p{}", i), proc_macro2::Span::call_site()),
                };
                params.push(Param {
                    ident,
                    ty: (*pat.ty).clone(),
                });
            }
        }
    }

    Ok(TargetFunction {
        name: sig.ident.to_string(),
        receiver,
        params,
        variadic: sig.variadic.clone(),
        results: decompose_results(&sig.output),
        file,
    })
}

/// Tuple returns contribute one result per element; `()` and no return type
/// contribute none; anything else is a single result.
pub fn decompose_results(output: &syn::ReturnType) -> Vec<syn::Type> {
    match output {
        syn::ReturnType::Default => Vec::new(),
        syn::ReturnType::Type(_, ty) => match &**ty {
            syn::Type::Tuple(tuple) => tuple.elems.iter().cloned().collect(),
            other => vec![other.clone()],
        },
    }
}

/// Last path segment of a type, ignoring references and raw pointers.
pub(crate) fn type_name(ty: &syn::Type) -> Option<String> {
    match ty {
        syn::Type::Reference(r) => type_name(&r.elem),
        syn::Type::Ptr(p) => type_name(&p.elem),
        syn::Type::Path(p) => p.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}

fn normalize_receiver(recv: &str) -> &str {
    recv.trim_start_matches(['&', '*', ' '])
}
