//! The unit of the log (§3 DATA MODEL).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FluxError, Result};

/// An event in the log. `partition` and `offset` are assigned by
/// [`crate::log::PartitionedLog::append`]; callers leave them at their
/// default (`0`) when constructing a record to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub event_type: String,
    /// Event time, stored as absolute wallclock (ms since epoch).
    pub timestamp: i64,
    pub partition: u32,
    pub offset: u64,
}

impl Record {
    /// Construct a record ready to append; `partition`/`offset` are filled
    /// in by the log.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, event_type: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            value: value.into(),
            event_type: event_type.into(),
            timestamp,
            partition: 0,
            offset: 0,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

/// Self-describing payload codec (MessagePack). Additional fields present in
/// a frame's payload but absent from [`Record`] are ignored on read, per the
/// codec contract in §6.
pub fn encode(record: &Record) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(record).map_err(FluxError::from)
}

pub fn decode(bytes: &[u8]) -> Result<Record> {
    rmp_serde::from_slice(bytes).map_err(FluxError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_fields() {
        let mut r = Record::new(b"k".to_vec(), b"v".to_vec(), "order.created", 1000);
        r.partition = 2;
        r.offset = 7;
        let bytes = encode(&r).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn ignores_unknown_fields_on_read() {
        #[derive(Serialize)]
        struct WithExtra {
            id: Uuid,
            key: Vec<u8>,
            value: Vec<u8>,
            event_type: String,
            timestamp: i64,
            partition: u32,
            offset: u64,
            extra_field: String,
        }
        let extra = WithExtra {
            id: Uuid::new_v4(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            event_type: "t".into(),
            timestamp: 1,
            partition: 0,
            offset: 0,
            extra_field: "ignored".into(),
        };
        let bytes = rmp_serde::to_vec_named(&extra).unwrap();
        let record = decode(&bytes).unwrap();
        assert_eq!(record.event_type, "t");
    }
}
