// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`flowmap::ddi::stat::StatProvider`] implementation
/// given a struct of named fields of type
/// [`flowmap::ddi::stat::StatU64`].
///
/// ```ignore
/// #[derive(StatProvider)]
/// struct MapperStats {
///     flows_created: StatU64,
///     flows_failed: StatU64,
/// }
/// ```
///
/// Besides the trait implementation, a `MapperStatsSnap` struct of
/// plain `u64` fields is generated, along with a `pairs()` listing
/// used when printing.
#[proc_macro_derive(StatProvider)]
pub fn derive_stat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            _ => {
                return syn::Error::new(
                    ident.span(),
                    "a StatProvider must have named fields",
                )
                .to_compile_error()
                .into();
            }
        },

        _ => {
            return syn::Error::new(
                ident.span(),
                "only a struct may be a StatProvider",
            )
            .to_compile_error()
            .into();
        }
    };

    let num_fields = fields.len() as u32;
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        #[derive(::serde::Serialize, ::serde::Deserialize)]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl #ident_snap {
            /// Each counter's name and value, in declaration order.
            pub fn pairs(&self) -> [(&'static str, u64); #num_fields as usize] {
                [ #( (stringify!(#fields_ident), self.#fields_ident), )* ]
            }
        }

        impl StatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn new() -> Self {
                Self {
                    #( #fields_ident: StatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }
        }
    };

    output.into()
}
