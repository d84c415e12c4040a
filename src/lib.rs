#![cfg_attr(feature = "no_std", no_std)]

pub mod address;
pub mod bug;
#[allow(dead_code)] // `modular_bitfield` emits `into_bytes`/`from_bytes` we don't call
pub mod bud;
pub mod error;
pub mod kma;
pub mod page;
pub mod rm;

pub use kma::{Allocator, Kma, KmaAllocator};
