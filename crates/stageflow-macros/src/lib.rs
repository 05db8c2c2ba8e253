//! Derive macros for stageflow.
//!
//! # `MutationRegistry`
//!
//! Derives the compile-time registry for an enum of mutation payloads. Every
//! variant must be a single-field tuple variant wrapping a `Deserialize` +
//! `Serialize` payload type. The derive generates:
//!
//! - `NAMES`: every registered mutation name, in declaration order
//! - `name(&self)`: the registered name of this mutation
//! - `decode(name, payload)`: name-keyed decoding of a JSON payload
//!
//! Each variant is registered under its kebab-cased name (`UpdateStep`
//! becomes `update-step`). Encoding is left to the enum's own `Serialize`.
//!
//! ```ignore
//! use stageflow::MutationRegistry;
//!
//! #[derive(MutationRegistry)]
//! pub enum Mutation {
//!     CreateWorkflow(CreateWorkflow),
//!     SetMemory(SetMemory),
//! }
//!
//! assert_eq!(Mutation::NAMES, &["create-workflow", "set-memory"]);
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Fields, Variant, parse_macro_input};

#[proc_macro_derive(MutationRegistry)]
pub fn derive_mutation_registry(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_registry_impl(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn derive_registry_impl(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "MutationRegistry can only be derived for enums",
        ));
    };

    if data.variants.is_empty() {
        return Err(syn::Error::new(
            input.span(),
            "MutationRegistry needs at least one mutation variant",
        ));
    }

    let mut names = Vec::with_capacity(data.variants.len());
    let mut name_arms = Vec::new();
    let mut decode_arms = Vec::new();

    for variant in &data.variants {
        check_payload_variant(variant)?;

        let variant_ident = &variant.ident;
        let registered = kebab_case(&variant.ident.to_string());

        if names.contains(&registered) {
            return Err(syn::Error::new(
                variant.span(),
                format!("mutation name `{registered}` is registered twice"),
            ));
        }

        name_arms.push(quote! {
            #name::#variant_ident(_) => #registered,
        });
        decode_arms.push(quote! {
            #registered => ::core::result::Result::Ok(
                #name::#variant_ident(::serde_json::from_value(payload)?)
            ),
        });
        names.push(registered);
    }

    Ok(quote! {
        impl #name {
            /// Every registered mutation name, in declaration order.
            pub const NAMES: &'static [&'static str] = &[#(#names),*];

            /// The registered name of this mutation.
            pub fn name(&self) -> &'static str {
                match self {
                    #(#name_arms)*
                }
            }

            /// Decode a payload by its registered name.
            pub fn decode(
                name: &str,
                payload: ::serde_json::Value,
            ) -> ::stageflow::Result<Self> {
                match name {
                    #(#decode_arms)*
                    other => ::core::result::Result::Err(
                        ::stageflow::Error::UnrecognizedMutation(other.to_string())
                    ),
                }
            }
        }
    })
}

fn check_payload_variant(variant: &Variant) -> syn::Result<()> {
    match &variant.fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => Ok(()),
        Fields::Unnamed(_) => Err(syn::Error::new(
            variant.span(),
            format!(
                "Variant `{}` must wrap exactly one payload type.",
                variant.ident
            ),
        )),
        Fields::Named(_) => Err(syn::Error::new(
            variant.span(),
            "MutationRegistry does not support struct variants. Wrap a payload struct instead.",
        )),
        Fields::Unit => Err(syn::Error::new(
            variant.span(),
            "MutationRegistry does not support unit variants. Every mutation carries a payload.",
        )),
    }
}

fn kebab_case(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 4);
    for (i, ch) in ident.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
