// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data types shared by every tessera crate.
//!
//! Contains the BLAKE3 [`Hash`] used for content addressing, ed25519 identities ([`PrivateKey`],
//! [`PublicKey`], [`Signature`]) and the signed [`Entry`] which is appended to replicated logs.
//! Everything which goes over the wire or into a block store is encoded as [CBOR] using the
//! helpers in [`cbor`].
//!
//! [CBOR]: https://cbor.io/
pub mod cbor;
pub mod entry;
pub mod hash;
pub mod identity;
mod serde;

pub use entry::Entry;
pub use hash::{HASH_LEN, Hash, HashError};
pub use identity::{IdentityError, PrivateKey, PublicKey, Signature};
