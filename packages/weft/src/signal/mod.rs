//! Lock-free hierarchical signal index.
//!
//! [`SignalTree`] tracks which slots of a fixed pool are ready to run. It is
//! a complete binary tree flattened into one contiguous array of atomic
//! words: leaf words are bitmaps of 64 signals each, internal words count
//! the set signals in their subtree. `set`, `select`, and `clear` all run in
//! O(log N) without locks, and the bias word threaded through `select`
//! steers consecutive selections into different subtrees so no signal
//! starves.

mod tree;

pub use tree::SignalTree;
