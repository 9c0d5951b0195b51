// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_access::role_table::Grant;
use tessera_core::cbor::decode_cbor;
use tessera_core::{Entry, Hash, PrivateKey};

// Feed arbitrary bytes to everything a remote peer controls in a role table: the entry itself and
// the grant in its payload.
fuzz_target!(|bytes: &[u8]| {
    if let Ok(entry) = decode_cbor::<Entry, _>(bytes) {
        // Checking a signature never panics, whatever the entry claims.
        let _ = entry.verified_author();
    }

    let Ok(grant) = Grant::from_bytes(bytes) else {
        return;
    };
    assert!(!grant.key.as_str().is_empty());

    // Any grant which decodes can be signed into a valid entry.
    let private_key = PrivateKey::new();
    let payload = grant.to_bytes().expect("grant encoding");
    let entry = Entry::new(&private_key, Hash::new(b"fuzz"), payload);
    assert_eq!(entry.verified_author(), Some(private_key.public_key()));
    assert_eq!(Grant::from_bytes(&entry.payload).expect("grant decoding"), grant);
});
