/// Wire format version of a [`GtidDescriptor`]'s `info` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidVersion {
    /// Human-readable text, e.g. `source-uuid:1-5`.
    Text = 1,
    /// Tagged binary encoding.
    Binary = 2,
}

/// A single committed GTID, as queued onto the persister's in-memory lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidDescriptor {
    pub is_set: bool,
    pub version: GtidVersion,
    pub info: Vec<u8>,
}

impl GtidDescriptor {
    pub fn text(info: impl Into<Vec<u8>>) -> Self {
        GtidDescriptor {
            is_set: true,
            version: GtidVersion::Text,
            info: info.into(),
        }
    }
}

/// One `(source_uuid, interval_start, interval_end)` row of the persisted
/// GTID set, as it would be stored in `mysql.gtid_executed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GtidInterval {
    pub source_uuid: String,
    pub interval_start: u64,
    pub interval_end: u64,
}
