//! pgoutput message decoding.
//!
//! Maps the binary payload of one XLogData frame to a [`WalEvent`]. The
//! format is the "Logical Replication Message Formats" chapter of the
//! PostgreSQL protocol documentation, proto_version 1.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::wal::lsn::Lsn;

/// Microseconds from the PostgreSQL epoch (2000-01-01) to the Unix epoch.
const PG_EPOCH_OFFSET_US: i64 = 946_684_800_000_000;

/// Errors raised while decoding a pgoutput payload.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("truncated message at byte {offset}, need {needed} more")]
    Truncated { offset: usize, needed: usize },

    #[error("unknown pgoutput message type 0x{0:02X}")]
    UnknownMessage(u8),

    #[error("malformed pgoutput message: {0}")]
    Malformed(String),

    #[error("invalid UTF-8 at byte {0}")]
    InvalidUtf8(usize),
}

/// One cell of a replicated tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    /// SQL NULL.
    Null,
    /// Unchanged TOAST datum: the server did not resend the value. Skipped
    /// in UPDATE SET lists, never legal anywhere else.
    Toast,
    /// Text-format value.
    Text(String),
}

/// A replicated row: cells in column ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WalTuple {
    pub values: Vec<TupleValue>,
}

/// Column descriptor from a Relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalColumn {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// Part of the replica identity key.
    pub is_key: bool,
}

/// A decoded pgoutput message.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEvent {
    Begin {
        final_lsn: Lsn,
        commit_ts: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_ts: DateTime<Utc>,
    },
    Relation {
        relation_id: u32,
        namespace: String,
        name: String,
        replica_identity: u8,
        columns: Vec<WalColumn>,
    },
    Insert {
        relation_id: u32,
        new_tuple: WalTuple,
    },
    Update {
        relation_id: u32,
        old_tuple: Option<WalTuple>,
        new_tuple: WalTuple,
    },
    Delete {
        relation_id: u32,
        old_tuple: WalTuple,
    },
    Truncate {
        relation_ids: Vec<u32>,
        /// Bit 0 CASCADE, bit 1 RESTART IDENTITY.
        options: u8,
    },
    Origin {
        origin_lsn: Lsn,
        name: String,
    },
    Type {
        type_id: u32,
        namespace: String,
        name: String,
    },
}

/// Decode one pgoutput message.
pub fn decode_event(data: &[u8]) -> Result<WalEvent, DecodeError> {
    let mut r = ByteReader::new(data);
    match r.u8()? {
        b'B' => Ok(WalEvent::Begin {
            final_lsn: Lsn::new(r.u64()?),
            commit_ts: pg_timestamp(r.i64()?),
            xid: r.u32()?,
        }),
        b'C' => Ok(WalEvent::Commit {
            flags: r.u8()?,
            commit_lsn: Lsn::new(r.u64()?),
            end_lsn: Lsn::new(r.u64()?),
            commit_ts: pg_timestamp(r.i64()?),
        }),
        b'R' => decode_relation(&mut r),
        b'I' => decode_insert(&mut r),
        b'U' => decode_update(&mut r),
        b'D' => decode_delete(&mut r),
        b'T' => decode_truncate(&mut r),
        b'O' => Ok(WalEvent::Origin {
            origin_lsn: Lsn::new(r.u64()?),
            name: r.cstring()?,
        }),
        b'Y' => Ok(WalEvent::Type {
            type_id: r.u32()?,
            namespace: r.cstring()?,
            name: r.cstring()?,
        }),
        other => Err(DecodeError::UnknownMessage(other)),
    }
}

fn decode_relation(r: &mut ByteReader<'_>) -> Result<WalEvent, DecodeError> {
    let relation_id = r.u32()?;
    let namespace = r.cstring()?;
    let name = r.cstring()?;
    let replica_identity = r.u8()?;
    let n_cols = wire_count(r.i16()?)?;

    let mut columns = Vec::with_capacity(n_cols);
    for _ in 0..n_cols {
        let flags = r.u8()?;
        columns.push(WalColumn {
            name: r.cstring()?,
            type_oid: r.u32()?,
            type_modifier: r.i32()?,
            is_key: flags & 1 != 0,
        });
    }

    Ok(WalEvent::Relation {
        relation_id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_insert(r: &mut ByteReader<'_>) -> Result<WalEvent, DecodeError> {
    let relation_id = r.u32()?;
    let tag = r.u8()?;
    if tag != b'N' {
        return Err(DecodeError::Malformed(format!(
            "INSERT expects 'N' tuple tag, got 0x{tag:02X}"
        )));
    }
    Ok(WalEvent::Insert {
        relation_id,
        new_tuple: decode_tuple(r)?,
    })
}

fn decode_update(r: &mut ByteReader<'_>) -> Result<WalEvent, DecodeError> {
    let relation_id = r.u32()?;
    let tag = r.u8()?;

    let (old_tuple, new_tuple) = match tag {
        b'N' => (None, decode_tuple(r)?),
        // 'K': key columns only; 'O': full old row (REPLICA IDENTITY FULL)
        b'K' | b'O' => {
            let old = decode_tuple(r)?;
            let new_tag = r.u8()?;
            if new_tag != b'N' {
                return Err(DecodeError::Malformed(format!(
                    "UPDATE expects 'N' after old tuple, got 0x{new_tag:02X}"
                )));
            }
            (Some(old), decode_tuple(r)?)
        }
        other => {
            return Err(DecodeError::Malformed(format!(
                "UPDATE has unexpected tuple tag 0x{other:02X}"
            )));
        }
    };

    Ok(WalEvent::Update {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(r: &mut ByteReader<'_>) -> Result<WalEvent, DecodeError> {
    let relation_id = r.u32()?;
    let tag = r.u8()?;
    if tag != b'K' && tag != b'O' {
        return Err(DecodeError::Malformed(format!(
            "DELETE expects 'K' or 'O' tuple tag, got 0x{tag:02X}"
        )));
    }
    Ok(WalEvent::Delete {
        relation_id,
        old_tuple: decode_tuple(r)?,
    })
}

fn decode_truncate(r: &mut ByteReader<'_>) -> Result<WalEvent, DecodeError> {
    let n_relations = r.u32()? as usize;
    let options = r.u8()?;
    let mut relation_ids = Vec::with_capacity(n_relations);
    for _ in 0..n_relations {
        relation_ids.push(r.u32()?);
    }
    Ok(WalEvent::Truncate {
        relation_ids,
        options,
    })
}

fn decode_tuple(r: &mut ByteReader<'_>) -> Result<WalTuple, DecodeError> {
    let n_cols = wire_count(r.i16()?)?;
    let mut values = Vec::with_capacity(n_cols);
    for _ in 0..n_cols {
        match r.u8()? {
            b'n' => values.push(TupleValue::Null),
            b'u' => values.push(TupleValue::Toast),
            b't' => {
                let len = wire_count(r.i32()?)?;
                let start = r.pos;
                let bytes = r.bytes(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::InvalidUtf8(start))?;
                values.push(TupleValue::Text(text.to_string()));
            }
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown tuple cell kind 0x{other:02X}"
                )));
            }
        }
    }
    Ok(WalTuple { values })
}

/// PostgreSQL timestamps are microseconds since 2000-01-01.
fn pg_timestamp(pg_us: i64) -> DateTime<Utc> {
    let unix_us = pg_us.saturating_add(PG_EPOCH_OFFSET_US);
    Utc.timestamp_micros(unix_us)
        .single()
        .unwrap_or_else(|| Utc.timestamp_micros(0).single().unwrap())
}

/// Bounds-checked big-endian reader.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() - self.pos < len {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len - (self.data.len() - self.pos),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn cstring(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let nul = self.data[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DecodeError::Malformed("unterminated string".to_string()))?;
        let s = std::str::from_utf8(&self.data[start..start + nul])
            .map_err(|_| DecodeError::InvalidUtf8(start))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Convert a signed wire count to usize, rejecting negatives.
fn wire_count<T: TryInto<usize> + std::fmt::Display + Copy>(raw: T) -> Result<usize, DecodeError> {
    raw.try_into()
        .map_err(|_| DecodeError::Malformed(format!("negative count {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds pgoutput messages byte by byte for the decode tests.
    struct EventBuilder {
        buf: Vec<u8>,
    }

    impl EventBuilder {
        fn new(msg_type: u8) -> Self {
            Self { buf: vec![msg_type] }
        }

        fn u8(mut self, v: u8) -> Self {
            self.buf.push(v);
            self
        }

        fn i16(mut self, v: i16) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn i32(mut self, v: i32) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn u32(mut self, v: u32) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn i64(mut self, v: i64) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn u64(mut self, v: u64) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn cstring(mut self, s: &str) -> Self {
            self.buf.extend_from_slice(s.as_bytes());
            self.buf.push(0);
            self
        }

        fn text_cell(mut self, s: &str) -> Self {
            self.buf.push(b't');
            self.buf.extend_from_slice(&(s.len() as i32).to_be_bytes());
            self.buf.extend_from_slice(s.as_bytes());
            self
        }

        fn null_cell(mut self) -> Self {
            self.buf.push(b'n');
            self
        }

        fn toast_cell(mut self) -> Self {
            self.buf.push(b'u');
            self
        }

        fn build(self) -> Vec<u8> {
            self.buf
        }
    }

    #[test]
    fn test_decode_begin() {
        let data = EventBuilder::new(b'B')
            .u64(0xABCD)
            .i64(0) // PG epoch itself
            .u32(17)
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Begin {
                final_lsn,
                commit_ts,
                xid,
            } => {
                assert_eq!(final_lsn, Lsn::new(0xABCD));
                assert_eq!(xid, 17);
                // 2000-01-01T00:00:00Z
                assert_eq!(commit_ts.timestamp(), 946_684_800);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_commit() {
        let data = EventBuilder::new(b'C')
            .u8(0)
            .u64(0x100)
            .u64(0x200)
            .i64(0)
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Commit {
                commit_lsn,
                end_lsn,
                ..
            } => {
                assert_eq!(commit_lsn, Lsn::new(0x100));
                assert_eq!(end_lsn, Lsn::new(0x200));
            }
            other => panic!("expected Commit, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_relation() {
        let data = EventBuilder::new(b'R')
            .u32(16392)
            .cstring("public")
            .cstring("t")
            .u8(b'd')
            .i16(2)
            .u8(1) // key column
            .cstring("id")
            .u32(23) // int4
            .i32(-1)
            .u8(0)
            .cstring("v")
            .u32(25) // text
            .i32(-1)
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Relation {
                relation_id,
                namespace,
                name,
                replica_identity,
                columns,
            } => {
                assert_eq!(relation_id, 16392);
                assert_eq!(namespace, "public");
                assert_eq!(name, "t");
                assert_eq!(replica_identity, b'd');
                assert_eq!(columns.len(), 2);
                assert!(columns[0].is_key);
                assert_eq!(columns[0].type_oid, 23);
                assert!(!columns[1].is_key);
            }
            other => panic!("expected Relation, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_insert_with_null_and_toast() {
        let data = EventBuilder::new(b'I')
            .u32(16392)
            .u8(b'N')
            .i16(3)
            .text_cell("3")
            .null_cell()
            .toast_cell()
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Insert {
                relation_id,
                new_tuple,
            } => {
                assert_eq!(relation_id, 16392);
                assert_eq!(
                    new_tuple.values,
                    vec![
                        TupleValue::Text("3".into()),
                        TupleValue::Null,
                        TupleValue::Toast
                    ]
                );
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_without_old_tuple() {
        let data = EventBuilder::new(b'U')
            .u32(16392)
            .u8(b'N')
            .i16(1)
            .text_cell("b")
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Update { old_tuple, .. } => assert!(old_tuple.is_none()),
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_with_key_old_tuple() {
        let data = EventBuilder::new(b'U')
            .u32(16392)
            .u8(b'K')
            .i16(1)
            .text_cell("1")
            .u8(b'N')
            .i16(2)
            .text_cell("1")
            .text_cell("changed")
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Update {
                old_tuple,
                new_tuple,
                ..
            } => {
                assert_eq!(old_tuple.unwrap().values.len(), 1);
                assert_eq!(
                    new_tuple.values[1],
                    TupleValue::Text("changed".into())
                );
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete() {
        let data = EventBuilder::new(b'D')
            .u32(16392)
            .u8(b'O')
            .i16(2)
            .text_cell("1")
            .null_cell()
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Delete { old_tuple, .. } => {
                assert_eq!(old_tuple.values.len(), 2);
                assert_eq!(old_tuple.values[1], TupleValue::Null);
            }
            other => panic!("expected Delete, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncate() {
        let data = EventBuilder::new(b'T')
            .u32(2)
            .u8(3)
            .u32(16392)
            .u32(16400)
            .build();

        match decode_event(&data).unwrap() {
            WalEvent::Truncate {
                relation_ids,
                options,
            } => {
                assert_eq!(relation_ids, vec![16392, 16400]);
                assert_eq!(options, 3);
            }
            other => panic!("expected Truncate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_origin_and_type() {
        let data = EventBuilder::new(b'O').u64(0x99).cstring("upstream").build();
        assert!(matches!(
            decode_event(&data).unwrap(),
            WalEvent::Origin { .. }
        ));

        let data = EventBuilder::new(b'Y')
            .u32(90210)
            .cstring("public")
            .cstring("mood")
            .build();
        match decode_event(&data).unwrap() {
            WalEvent::Type { type_id, name, .. } => {
                assert_eq!(type_id, 90210);
                assert_eq!(name, "mood");
            }
            other => panic!("expected Type, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(decode_event(&[]).is_err());
        assert!(matches!(
            decode_event(&[0xFF]),
            Err(DecodeError::UnknownMessage(0xFF))
        ));
        // truncated Begin
        let data = EventBuilder::new(b'B').u32(1).build();
        assert!(matches!(
            decode_event(&data),
            Err(DecodeError::Truncated { .. })
        ));
        // bad insert tuple tag
        let data = EventBuilder::new(b'I').u32(1).u8(b'X').build();
        assert!(matches!(
            decode_event(&data),
            Err(DecodeError::Malformed(_))
        ));
    }
}
