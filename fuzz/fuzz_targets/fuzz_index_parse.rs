#![no_main]
use gpk_rs::core::mapper::KeyValueIndex;
use gpk_rs::CompositeIndex;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(index) = CompositeIndex::parse(data) {
        // Whatever parses must re-serialize to something that parses the same
        if let Ok(text) = index.to_plaintext() {
            let again = CompositeIndex::parse(&text).expect("re-serialized index parses");
            assert_eq!(again.len(), index.len());
        }
    }
    let _ = CompositeIndex::from_encrypted(data);
    let _ = KeyValueIndex::parse(data);
});
