// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Fields;
use syn::Ident;
use syn::parse_macro_input;

/// Derive [`flowoffload::ddi::kstat::KStatProvider`] for a struct whose
/// named fields are all [`flowoffload::ddi::kstat::KStatU64`]
/// counters.
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct OffloadStats {
///     offload_added: KStatU64,
///     hooks_reaped: KStatU64,
/// }
/// ```
///
/// Alongside the trait impl a plain `OffloadStatsSnap` struct is
/// generated, holding one `u64` per field. A snapshot is the only way
/// to copy the counters out.
#[proc_macro_derive(KStatProvider)]
pub fn derive_kstat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);

    let named = match data {
        syn::Data::Struct(s) => match s.fields {
            Fields::Named(fields) => fields.named,
            Fields::Unnamed(_) => {
                return compile_error(
                    &ident,
                    "a KStatProvider cannot have unnamed fields",
                );
            }
            Fields::Unit => {
                return compile_error(
                    &ident,
                    "a unit struct cannot be a KStatProvider",
                );
            }
        },

        _ => return compile_error(&ident, "only a struct may be a KStatProvider"),
    };

    let num_fields = named.len() as u32;
    let fields: Vec<Ident> =
        named.into_iter().filter_map(|f| f.ident).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct #ident_snap {
            #( pub #fields: u64, )*
        }

        impl ::flowoffload::ddi::kstat::KStatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn init(
                &mut self
            ) -> ::core::result::Result<(), ::flowoffload::ddi::kstat::Error> {
                #( self.#fields.init(stringify!(#fields))?; )*
                Ok(())
            }

            fn new() -> Self {
                use ::flowoffload::ddi::kstat::KStatU64;

                Self {
                    #( #fields: KStatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields: self.#fields.val(), )*
                }
            }
        }
    };

    output.into()
}

fn compile_error(ident: &Ident, msg: &str) -> TokenStream {
    syn::Error::new(ident.span(), msg).to_compile_error().into()
}
