//! Composite bundles: the encrypted mapper index and its patcher

pub mod cipher;
mod index;
mod patcher;

pub use cipher::{decrypt, encrypt};
pub use index::{CompositeEntry, CompositeIndex, CompositeSection};
pub use patcher::{IndexPatcher, PatchEntry};

pub(crate) use index::{latin1, to_latin1};
