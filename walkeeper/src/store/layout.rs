//! Deterministic object keys.
//!
//! ```text
//! <prefix>/basebackups/data/<backup_id>/part_<index:08>.tar<suffix>
//! <prefix>/basebackups/manifests/<backup_id>.json
//! <prefix>/basebackups/manifests/<backup_id>.complete
//! <prefix>/wal/<segment_name><suffix>
//! ```

const BACKUP_DATA: &str = "basebackups/data/";
const BACKUP_MANIFESTS: &str = "basebackups/manifests/";
const WAL: &str = "wal/";

pub const MANIFEST_EXT: &str = ".json";
pub const MARKER_EXT: &str = ".complete";

#[derive(Debug, Clone, Default)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self { prefix }
    }

    pub fn partition_key(&self, backup_id: &str, index: u32, suffix: &str) -> String {
        format!(
            "{}{}{}/part_{:08}.tar{}",
            self.prefix, BACKUP_DATA, backup_id, index, suffix
        )
    }

    pub fn manifest_key(&self, backup_id: &str) -> String {
        format!("{}{}{}{}", self.prefix, BACKUP_MANIFESTS, backup_id, MANIFEST_EXT)
    }

    pub fn marker_key(&self, backup_id: &str) -> String {
        format!("{}{}{}{}", self.prefix, BACKUP_MANIFESTS, backup_id, MARKER_EXT)
    }

    pub fn wal_key(&self, segment: &str, suffix: &str) -> String {
        format!("{}{}{}{}", self.prefix, WAL, segment, suffix)
    }

    pub fn all_backup_data_prefix(&self) -> String {
        format!("{}{}", self.prefix, BACKUP_DATA)
    }

    pub fn manifests_prefix(&self) -> String {
        format!("{}{}", self.prefix, BACKUP_MANIFESTS)
    }

    pub fn wal_prefix(&self) -> String {
        format!("{}{}", self.prefix, WAL)
    }

    /// Backup id of a key under the manifests prefix, with its extension.
    pub fn parse_manifest_key<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        let name = key.strip_prefix(self.prefix.as_str())?.strip_prefix(BACKUP_MANIFESTS)?;
        [MANIFEST_EXT, MARKER_EXT]
            .into_iter()
            .find_map(|ext| name.strip_suffix(ext).map(|id| (id, ext)))
    }

    /// Backup id owning a partition object key.
    pub fn parse_data_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix(BACKUP_DATA)?;
        rest.split('/').next().filter(|id| !id.is_empty())
    }
}
