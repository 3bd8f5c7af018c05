//! # Copy-on-Write B-Tree
//!
//! The ordered map at the heart of the store:
//!
//! - [`page`]: immutable nodes, their on-disk format, and the 64-bit page
//!   position encoding.
//! - [`map`]: the [`Map`] handle with ordered navigation, rank lookups, and
//!   retained old roots for snapshot reads.
//! - [`cursor`]: ordered iteration with count-assisted skip, and the
//!   changed-pages cursor used for incremental diffing.
//!
//! Mutating a map copies the page path from the root to the touched leaf and
//! publishes a new root; prior roots stay valid for readers. Pages reference
//! each other by chunk position once written; unsaved subtrees are held by
//! strong references until their chunk reaches the file.

pub mod cursor;
pub mod map;
pub mod page;

pub use cursor::{ChangeCursor, Cursor};
pub use map::Map;
pub use page::Page;
