// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use darling::FromDeriveInput;
use proc_macro2::TokenStream;
use quote::quote;
use syn::DeriveInput;
use syn::parse_macro_input;

#[derive(FromDeriveInput)]
#[darling(attributes(derror))]
struct Args {
    leaf_data: Option<syn::Path>,
}

/// Generate a `DError` implementation for a tree-structured error enum
/// where only leaf variants hold additional data.
///
/// Each variant name becomes a `&'static str` discriminant. A variant
/// holding exactly one unnamed field is treated as a link to a nested
/// error unless it is annotated `#[leaf]`. A `leaf_data` function may
/// be supplied to copy up to two integers out of a leaf variant:
///
/// ```ignore
/// #[derive(DError)]
/// enum StepError {
///     Field(FieldError),
///     #[leaf]
///     Hw(HwError),
/// }
///
/// #[derive(DError)]
/// #[derror(leaf_data = FieldError::data)]
/// enum FieldError {
///     BadIndex { kind: &'static str, idx: u16 },
///     Reject,
/// }
/// ```
#[proc_macro_derive(DError, attributes(derror, leaf))]
pub fn derive_derror(
    input: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let derive_input = parse_macro_input!(input);

    let parsed_args = match Args::from_derive_input(&derive_input) {
        Ok(o) => o,
        Err(e) => return e.write_errors().into(),
    };

    let DeriveInput { ident, data, .. } = derive_input;

    let syn::Data::Enum(data) = data else {
        return syn::Error::new(
            ident.span(),
            "cannot autoderive `DError` for struct or union",
        )
        .to_compile_error()
        .into();
    };

    let mut name_arms: Vec<TokenStream> = vec![];
    let mut child_arms: Vec<TokenStream> = vec![];

    for variant in data.variants {
        let var_name = variant.ident;
        let name_lit = syn::LitStr::new(&var_name.to_string(), var_name.span());

        let known_leaf =
            variant.attrs.iter().any(|v| v.path().is_ident("leaf"));

        let (name_arm, child_arm) = match variant.fields {
            syn::Fields::Unnamed(fields) => (
                quote! { Self::#var_name(..) => #name_lit, },
                if !known_leaf && fields.unnamed.len() == 1 {
                    quote! { Self::#var_name(f) => Some(f), }
                } else {
                    quote! { Self::#var_name(..) => None, }
                },
            ),
            syn::Fields::Named(_) => (
                quote! { Self::#var_name { .. } => #name_lit, },
                quote! { Self::#var_name { .. } => None, },
            ),
            syn::Fields::Unit => (
                quote! { Self::#var_name => #name_lit, },
                quote! { Self::#var_name => None, },
            ),
        };

        name_arms.push(name_arm);
        child_arms.push(child_arm);
    }

    let leaf_data_impl = match parsed_args.leaf_data {
        Some(data_fn) => quote! {
            fn leaf_data(&self, data: &mut [u64]) {
                #data_fn(self, data);
            }
        },
        None => quote! {},
    };

    quote! {
        impl DError for #ident {
            fn discriminant(&self) -> &'static str {
                match self {
                    #( #name_arms )*
                }
            }

            fn child(&self) -> Option<&dyn DError> {
                match self {
                    #( #child_arms )*
                }
            }

            #leaf_data_impl
        }
    }
    .into()
}
