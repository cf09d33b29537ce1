//! Grouping classified entries into size-bounded tar partitions.
//!
//! Entries are taken in relative-path order and packed greedily: a partition
//! is closed as soon as the next entry would push it over the budget. An
//! entry larger than the budget on its own becomes a single-entry partition.

use crate::fs::walker::FileEntry;

/// One independently restorable archive unit.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Stable index, embedded in the partition's object key
    pub index: u32,

    /// Target size this partition was packed against
    pub budget: u64,

    pub entries: Vec<FileEntry>,
}

impl Partition {
    fn new(index: u32, budget: u64) -> Self {
        Self {
            index,
            budget,
            entries: Vec::new(),
        }
    }

    /// Sum of content bytes of the member entries
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(FileEntry::size_bytes).sum()
    }

    /// True when a single entry exceeds the budget by itself
    pub fn is_oversized(&self) -> bool {
        self.total_bytes() > self.budget
    }
}

/// Pack `entries` into partitions of at most `budget` content bytes.
///
/// The input is sorted by relative path first, so the result only depends
/// on the snapshot and the budget.
pub fn partition_entries(mut entries: Vec<FileEntry>, budget: u64) -> Vec<Partition> {
    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut partitions = Vec::new();
    let mut current = Partition::new(0, budget);
    let mut current_bytes = 0u64;

    for entry in entries {
        let size = entry.size_bytes();

        if !current.entries.is_empty() && current_bytes.saturating_add(size) > budget {
            let next_index = current.index + 1;
            partitions.push(std::mem::replace(
                &mut current,
                Partition::new(next_index, budget),
            ));
            current_bytes = 0;
        }

        current_bytes += size;
        current.entries.push(entry);

        // Oversized entries never share a partition
        if current_bytes > budget {
            let next_index = current.index + 1;
            partitions.push(std::mem::replace(
                &mut current,
                Partition::new(next_index, budget),
            ));
            current_bytes = 0;
        }
    }

    if !current.entries.is_empty() {
        partitions.push(current);
    }

    tracing::debug!(
        "Packed entries into {} partitions (budget {} bytes)",
        partitions.len(),
        budget
    );
    partitions
}
