use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derives pointer-arithmetic operators (`+`, `-`, `+=`, `-=`) for a newtype
/// wrapping a single `usize` address. Also derives the crate's `Address`
/// trait, which exposes `as_raw_ptr`/`as_ptr`/`as_mut_ptr`.
#[proc_macro_derive(AddressOps)]
pub fn derive_address_ops(item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as DeriveInput);
    let name = &ast.ident;
    let gen = quote! {
        impl Address for #name {
            fn as_raw_ptr(&self) -> usize {
                self.0
            }

            fn as_ptr<T: Sized>(&self) -> *const T {
                self.0 as *const T
            }

            fn as_mut_ptr<T: Sized>(&self) -> *mut T {
                self.0 as *mut T
            }
        }

        impl core::ops::Add<isize> for #name {
            type Output = Self;

            fn add(self, val: isize) -> Self {
                Self((self.0 as isize + val) as usize)
            }
        }

        impl core::ops::Sub<isize> for #name {
            type Output = Self;

            fn sub(self, val: isize) -> Self {
                Self((self.0 as isize - val) as usize)
            }
        }

        impl core::ops::Add<usize> for #name {
            type Output = Self;

            fn add(self, val: usize) -> Self {
                Self(self.0 + val)
            }
        }

        impl core::ops::Sub<usize> for #name {
            type Output = Self;

            fn sub(self, val: usize) -> Self {
                Self(self.0 - val)
            }
        }

        impl core::ops::Sub for #name {
            type Output = isize;

            fn sub(self, other: Self) -> isize {
                (self.0 - other.0) as isize
            }
        }

        impl core::ops::AddAssign<isize> for #name {
            fn add_assign(&mut self, val: isize) {
                self.0 = (self.0 as isize + val) as usize;
            }
        }

        impl core::ops::SubAssign<isize> for #name {
            fn sub_assign(&mut self, val: isize) {
                self.0 = (self.0 as isize - val) as usize;
            }
        }

        impl core::ops::AddAssign<usize> for #name {
            fn add_assign(&mut self, val: usize) {
                self.0 = self.0 + val;
            }
        }

        impl core::ops::SubAssign<usize> for #name {
            fn sub_assign(&mut self, val: usize) {
                self.0 = self.0 - val;
            }
        }
    };

    gen.into()
}
