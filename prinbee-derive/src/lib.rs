// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support macros for `prinbee-core`'s test helpers, mirroring the role
//! `apfs-derive` plays for `apfs-core`: generated boilerplate kept out of
//! hand-written code, not a replacement for the runtime descriptor tables
//! that drive the actual codec.

extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Ident};

fn derive_error(ident: &Ident, msg: &str) -> TokenStream {
    syn::Error::new_spanned(ident, msg)
        .to_compile_error()
        .into()
}

/// Derive a `mask()`/`combine()` pair for a fieldless enum whose variants
/// name the bits of a `BITS*` field, one variant per bit position in
/// declaration order.
///
/// Used by `prinbee-core`'s structure tests to name `BITS8`/`BITS16`/...
/// flags instead of hand-writing shift amounts, e.g.:
///
/// ```ignore
/// #[derive(BitMask, Clone, Copy)]
/// enum StatusFlags {
///     Null,
///     Advance,
///     Sign,
/// }
/// assert_eq!(StatusFlags::Advance.mask(), 0b010);
/// ```
#[proc_macro_derive(BitMask)]
pub fn derive_bit_mask(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input as DeriveInput);

    let variants = match data {
        Data::Enum(data_enum) => data_enum.variants,
        _ => return derive_error(&ident, "BitMask can only be derived for a fieldless enum"),
    };

    let mut arms = Vec::with_capacity(variants.len());
    for (index, variant) in variants.iter().enumerate() {
        if !matches!(variant.fields, Fields::Unit) {
            return derive_error(&variant.ident, "BitMask variants must not carry fields");
        }
        let variant_ident = &variant.ident;
        let bit = index as u32;
        arms.push(quote! { #ident::#variant_ident => 1u64 << #bit });
    }

    let expanded = quote! {
        impl #ident {
            /// The single-bit mask this variant occupies.
            pub const fn mask(self) -> u64 {
                match self {
                    #(#arms,)*
                }
            }

            /// The OR of every listed variant's mask.
            pub fn combine(flags: &[Self]) -> u64 {
                flags.iter().fold(0u64, |acc, f| acc | f.mask())
            }
        }
    };

    expanded.into()
}
