#![no_std]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod communication;
pub mod nonce;
pub mod sealed;
pub mod tee;

pub use communication::*;
pub use nonce::{NONCE_LEN, Nonce};
