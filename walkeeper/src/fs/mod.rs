//! Local filesystem side: classifying source trees and making restores durable.

pub mod durability;
pub mod walker;

pub use durability::{FileSyncer, FsyncEnforcer};
pub use walker::{classify_tree, EntryKind, FileEntry, WalkOptions};
