// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_access::Manifest;
use tessera_core::Hash;

// Decode arbitrary blocks as manifests. Whatever decodes needs to encode to a block which decodes
// to the same manifest again, under a stable address.
fuzz_target!(|bytes: &[u8]| {
    let Ok(manifest) = Manifest::decode(bytes) else {
        return;
    };

    assert!(!manifest.controller_type.is_empty());
    assert!(!manifest.label.is_empty());
    assert!(!manifest.owner.as_str().is_empty());

    let (hash, encoded) = manifest.encode().expect("manifest encoding");
    assert_eq!(hash, Hash::new(&encoded));

    let manifest_again = Manifest::decode(&encoded).expect("manifest decoding");
    assert_eq!(manifest, manifest_again);
    assert_eq!(
        manifest.address().expect("manifest address"),
        manifest_again.address().expect("manifest address")
    );
});
