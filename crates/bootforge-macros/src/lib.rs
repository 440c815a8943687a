//! `#[Task]` turns a step config struct into a planned, dispatchable pipeline
//! step; `#[Module]` ties a table config to its steps.
//!
//! A step lives at `<module>.<step>` (the module is the id prefix) and reads
//! its switches from `[<module>.steps.<step>]`. Steps marked `core` are
//! required: neither the step nor its whole module may be switched off.

use std::collections::BTreeMap;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Expr, ExprArray, ExprLit, ExprPath, Ident, ItemStruct, Lit, Meta, Token};

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, "Task", task)
}

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, "Module", module)
}

type Expander = fn(&mut Args, &ItemStruct) -> syn::Result<TokenStream2>;

fn expand(attr: TokenStream, item: TokenStream, macro_name: &str, f: Expander) -> TokenStream {
    let res = syn::parse::<ItemStruct>(item).and_then(|st| {
        let mut args = Args::parse(attr, macro_name, st.ident.span())?;
        let body = f(&mut args, &st)?;
        args.finish()?;
        Ok(quote! {
            #st
            #body
        })
    });
    match res {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

/// `key = value` pairs from the attribute, consumed one key at a time.
struct Args {
    macro_name: String,
    at: Span,
    entries: BTreeMap<String, Expr>,
}

impl Args {
    fn parse(attr: TokenStream, macro_name: &str, at: Span) -> syn::Result<Self> {
        let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse(attr)?;
        let mut entries = BTreeMap::new();
        for m in metas {
            let Meta::NameValue(nv) = m else {
                return Err(syn::Error::new(m.span(), "expected `key = value`"));
            };
            let Some(key) = nv.path.get_ident().map(Ident::to_string) else {
                return Err(syn::Error::new(nv.path.span(), "expected a plain key"));
            };
            if entries.insert(key.clone(), nv.value).is_some() {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("{macro_name}: `{key}` given twice"),
                ));
            }
        }
        Ok(Self {
            macro_name: macro_name.to_string(),
            at,
            entries,
        })
    }

    fn missing(&self, key: &str) -> syn::Error {
        syn::Error::new(self.at, format!("{}: missing `{key}`", self.macro_name))
    }

    fn string(&mut self, key: &str) -> syn::Result<Option<String>> {
        self.entries.remove(key).map(|e| lit_str(&e)).transpose()
    }

    fn required_string(&mut self, key: &str) -> syn::Result<String> {
        self.string(key)?.ok_or_else(|| self.missing(key))
    }

    fn strings(&mut self, key: &str) -> syn::Result<Vec<String>> {
        let Some(e) = self.entries.remove(key) else {
            return Ok(Vec::new());
        };
        array(&e)?.iter().map(lit_str).collect()
    }

    fn flag(&mut self, key: &str) -> syn::Result<bool> {
        match self.entries.remove(key) {
            None => Ok(false),
            Some(Expr::Lit(ExprLit {
                lit: Lit::Bool(b), ..
            })) => Ok(b.value),
            Some(e) => Err(syn::Error::new(e.span(), "expected `true` or `false`")),
        }
    }

    fn path(&mut self, key: &str) -> syn::Result<syn::Path> {
        match self.entries.remove(key) {
            Some(Expr::Path(ExprPath { path, .. })) => Ok(path),
            Some(e) => Err(syn::Error::new(e.span(), "expected a type name")),
            None => Err(self.missing(key)),
        }
    }

    fn paths(&mut self, key: &str) -> syn::Result<Vec<syn::Path>> {
        let e = self.entries.remove(key).ok_or_else(|| self.missing(key))?;
        array(&e)?
            .iter()
            .map(|e| match e {
                Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
                other => Err(syn::Error::new(other.span(), "expected a task type")),
            })
            .collect()
    }

    /// Anything not consumed is a typo.
    fn finish(self) -> syn::Result<()> {
        match self.entries.into_iter().next() {
            None => Ok(()),
            Some((key, e)) => Err(syn::Error::new(
                e.span(),
                format!("{}: unknown key `{key}`", self.macro_name),
            )),
        }
    }
}

fn lit_str(e: &Expr) -> syn::Result<String> {
    match e {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(e.span(), "expected a string literal")),
    }
}

fn array(e: &Expr) -> syn::Result<Vec<Expr>> {
    match e {
        Expr::Array(ExprArray { elems, .. }) => Ok(elems.iter().cloned().collect()),
        _ => Err(syn::Error::new(e.span(), "expected `[...]`")),
    }
}

fn task(args: &mut Args, st: &ItemStruct) -> syn::Result<TokenStream2> {
    let ident = &st.ident;
    let id = args.required_string("id")?;
    let phase = args.required_string("phase")?;
    let default_label = args.required_string("default_label")?;
    let provides = args.strings("provides")?;
    let after = args.strings("after")?;
    let when = args.string("when")?;
    let core = args.flag("core")?;

    let Some((module, step)) = id.split_once('.') else {
        return Err(syn::Error::new(
            ident.span(),
            format!("Task: id `{id}` must be `<module>.<step>`"),
        ));
    };
    let step_path = format!("{module}.steps.{step}");

    // Steps gated on a spec value vanish from the plan when it is empty.
    let gate = when.map(|path| {
        quote! {
            if !doc.has_entries(#path) {
                return Ok(());
            }
        }
    });

    let disabled = if core {
        quote! {
            return Err(crate::Error::config(format!(
                "[{}] is a required step and cannot be disabled",
                #step_path
            )));
        }
    } else {
        quote! { return Ok(None); }
    };

    Ok(quote! {
        impl #ident {
            pub const ID: &'static str = #id;
            pub const CORE: bool = #core;

            /// Step switches, or `None` when the step is turned off.
            fn step(doc: &crate::config::ConfigDoc) -> crate::Result<Option<Self>> {
                let step: Self = doc.deserialize_path(#step_path)?.unwrap_or_default();
                if !step.enabled {
                    #disabled
                }
                Ok(Some(step))
            }

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                #gate
                let Some(step) = Self::step(doc)? else {
                    return Ok(());
                };
                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label: step.label.clone().unwrap_or_else(|| #default_label.to_string()),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let Some(step) = Self::step(doc)? else {
                    return Ok(());
                };
                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }
                Self::run(&step, doc, ctx)
            }
        }
    })
}

fn module(args: &mut Args, st: &ItemStruct) -> syn::Result<TokenStream2> {
    let ident = &st.ident;
    let id = args.required_string("id")?;
    let config = args.path("config")?;
    let tasks = args.paths("tasks")?;

    Ok(quote! {
        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#id)
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config = doc.deserialize_path(#id)?.unwrap_or_default();
                if !cfg.enabled {
                    let required: Vec<&str> = [#((#tasks::ID, #tasks::CORE)),*]
                        .into_iter()
                        .filter_map(|(id, core)| core.then_some(id))
                        .collect();
                    if !required.is_empty() {
                        return Err(crate::Error::config(format!(
                            "[{}].enabled = false would skip required steps: {}",
                            #id,
                            required.join(", ")
                        )));
                    }
                    return Ok(());
                }
                #(#tasks::plan(doc, plan)?;)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(reg.add(#tasks::ID, #tasks::exec)?;)*
                Ok(())
            }
        }
    })
}
