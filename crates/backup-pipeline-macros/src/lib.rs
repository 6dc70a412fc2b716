use proc_macro::TokenStream;

use quote::quote;
use syn::{Attribute, Expr, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser, spanned::Spanned};

/// Declares a scheduler job kind and its default options.
///
/// ```ignore
/// #[Job(kind = "backup.messages", max_attempts = 3, single_instance = true,
///       network = "wifi", queue_after = "backup.digest_backfill")]
/// pub struct MessageBackupJob { ... }
/// ```
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Job(attr: TokenStream, item: TokenStream) -> TokenStream {
    match job_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn lit_u32(expr: &Expr) -> syn::Result<u32> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Int(i), ..
        }) => i.base10_parse::<u32>(),
        _ => Err(syn::Error::new(expr.span(), "expected integer literal")),
    }
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Job"
        })
        .cloned()
        .collect()
}

struct JobMeta {
    kind: String,
    max_attempts: u32,
    single_instance: bool,
    network: String,
    queue_after: Option<String>,
}

fn job_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut kind: Option<String> = None;
    let mut max_attempts: u32 = 1;
    let mut single_instance = false;
    let mut network = "any".to_string();
    let mut queue_after: Option<String> = None;

    for m in metas {
        let nv = match m {
            Meta::NameValue(nv) => nv,
            other => return Err(syn::Error::new(other.span(), "expected key = value")),
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "kind" => kind = Some(lit_str(v)?),
            "max_attempts" => max_attempts = lit_u32(v)?,
            "single_instance" => single_instance = lit_bool(v)?,
            "network" => network = lit_str(v)?,
            "queue_after" => queue_after = Some(lit_str(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Job attribute key '{other}'"),
                ));
            }
        }
    }

    let meta = JobMeta {
        kind: kind.ok_or_else(|| syn::Error::new(struct_ident.span(), "Job: missing kind"))?,
        max_attempts,
        single_instance,
        network,
        queue_after,
    };

    if meta.max_attempts == 0 {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Job: max_attempts must be at least 1",
        ));
    }

    let network = match meta.network.as_str() {
        "wifi" => quote! { crate::jobs::NetworkRequirement::Wifi },
        "any" => quote! { crate::jobs::NetworkRequirement::Any },
        other => {
            return Err(syn::Error::new(
                struct_ident.span(),
                format!("Job: unknown network requirement '{other}' (expected wifi|any)"),
            ));
        }
    };

    let kind_lit = meta.kind;
    let max_attempts = meta.max_attempts;
    let single_instance = meta.single_instance;
    let queue_after = match meta.queue_after {
        Some(k) => quote! { Some(::std::string::String::from(#k)) },
        None => quote! { None },
    };

    let expanded = quote! {
        #st

        impl #impl_generics crate::jobs::JobSpec for #struct_ident #ty_generics #where_clause {
            const KIND: &'static str = #kind_lit;

            fn default_options() -> crate::jobs::JobOptions {
                crate::jobs::JobOptions {
                    max_attempts: #max_attempts,
                    single_instance: #single_instance,
                    network: #network,
                    queue_after: #queue_after,
                }
            }
        }
    };

    Ok(expanded.into())
}
