#![no_main]
use arbitrary::Arbitrary;
use gpk_rs::{IndexPatcher, PatchEntry};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    name: String,
    filename: String,
    object_path: String,
    offset: u64,
    size: u64,
}

const BASE: &[u8] = b"S1Data_0?PkgA,comp_a,100,200,|PkgB,comp_b,300,50,|!S1Data_1?PkgC,comp_c,0,9000,|!";

// A patch either applies and leaves a valid index, or fails and changes nothing
fuzz_target!(|input: Input| {
    let mut patcher = IndexPatcher::new(BASE.to_vec()).expect("base index is valid");
    let entry = PatchEntry {
        filename: input.filename,
        object_path: input.object_path,
        offset: input.offset,
        size: input.size,
    };
    match patcher.patch(&input.name, &entry) {
        Ok(()) => {
            patcher.index().expect("patched index parses");
        }
        Err(_) => assert_eq!(patcher.plaintext(), BASE),
    }
});
