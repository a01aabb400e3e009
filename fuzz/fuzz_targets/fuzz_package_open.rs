#![no_main]
use gpk_rs::{LoadOptions, Package};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must open and load without panicking
fuzz_target!(|data: &[u8]| {
    let options = LoadOptions {
        max_property_depth: 16,
        ..LoadOptions::default()
    };
    let package = match Package::from_bytes("Fuzz", data.to_vec(), options) {
        Ok(p) => p,
        Err(_) => return,
    };
    for object in package.objects() {
        let _ = object.load();
    }
    let _ = package.to_bytes();
});
