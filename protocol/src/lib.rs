// SPDX-License-Identifier:

//! Shared Remote Key Injection (RKI) protocol library.
//!
//! Both the terminal and the key-issuing service link against this crate, so
//! the canonical payload encoding and every cryptographic check is written
//! (and tested) exactly once. The role drivers only add transport and
//! durable state on top of [`flow`].

pub mod codec;
pub mod error;
pub mod flow;
pub mod identity;
pub mod nonce;
pub mod types;
pub mod wrap;

pub use error::RkiError;
pub use identity::Identity;
