//! Streaming-replication wire frames.
//!
//! Inside the CopyBoth stream the server sends two frame kinds: XLogData
//! (`w`) carrying pgoutput bytes, and primary keepalives (`k`). The client
//! answers with 34-byte standby status updates (`r`) that advance the
//! slot's confirmed position.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DtsError, Result};
use crate::wal::lsn::Lsn;

/// XLogData header: tag + wal_start + wal_end + server clock.
const XLOG_HEADER_LEN: usize = 1 + 8 + 8 + 8;
/// Keepalive: tag + wal_end + server clock + reply flag.
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;

/// One inbound frame from the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    /// WAL payload; `data` holds raw pgoutput bytes.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        /// Server clock, microseconds since the PostgreSQL epoch.
        server_time_us: i64,
        data: Bytes,
    },
    /// Periodic server heartbeat; `reply_requested` demands an immediate
    /// standby status update.
    Keepalive {
        wal_end: Lsn,
        server_time_us: i64,
        reply_requested: bool,
    },
}

/// Parse the payload of one CopyData message.
pub fn parse_frame(data: &[u8]) -> Result<ReplicationFrame> {
    let Some(&tag) = data.first() else {
        return Err(DtsError::Replication("empty replication frame".to_string()));
    };

    match tag {
        b'w' => {
            if data.len() < XLOG_HEADER_LEN {
                return Err(DtsError::Replication(format!(
                    "truncated XLogData frame: {} bytes",
                    data.len()
                )));
            }
            Ok(ReplicationFrame::XLogData {
                wal_start: Lsn::new(read_u64(&data[1..9])),
                wal_end: Lsn::new(read_u64(&data[9..17])),
                server_time_us: read_u64(&data[17..25]) as i64,
                data: Bytes::copy_from_slice(&data[XLOG_HEADER_LEN..]),
            })
        }
        b'k' => {
            if data.len() < KEEPALIVE_LEN {
                return Err(DtsError::Replication(format!(
                    "truncated keepalive frame: {} bytes",
                    data.len()
                )));
            }
            Ok(ReplicationFrame::Keepalive {
                wal_end: Lsn::new(read_u64(&data[1..9])),
                server_time_us: read_u64(&data[9..17]) as i64,
                reply_requested: data[17] != 0,
            })
        }
        other => Err(DtsError::Replication(format!(
            "unknown replication frame tag 0x{other:02X}"
        ))),
    }
}

/// Encode a standby status update advancing write/flush/apply to `position`.
pub fn encode_status_update(position: Lsn) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(position.as_u64()); // written
    buf.put_u64(position.as_u64()); // flushed
    buf.put_u64(position.as_u64()); // applied
    buf.put_i64(0); // client clock: not required by the server
    buf.put_u8(0); // no reply requested
    buf.freeze()
}

/// The command that opens the logical stream on a replication session.
pub fn start_replication_command(slot: &str, start: Lsn, publication: &str) -> String {
    format!(
        "START_REPLICATION SLOT {slot} LOGICAL {start} \
         (proto_version '1', publication_names '{publication}')"
    )
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xlog_data() {
        let mut msg = vec![b'w'];
        msg.extend_from_slice(&0x100u64.to_be_bytes());
        msg.extend_from_slice(&0x200u64.to_be_bytes());
        msg.extend_from_slice(&42i64.to_be_bytes());
        msg.extend_from_slice(b"payload");

        match parse_frame(&msg).unwrap() {
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                server_time_us,
                data,
            } => {
                assert_eq!(wal_start, Lsn::new(0x100));
                assert_eq!(wal_end, Lsn::new(0x200));
                assert_eq!(server_time_us, 42);
                assert_eq!(&data[..], b"payload");
            }
            other => panic!("expected XLogData, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut msg = vec![b'k'];
        msg.extend_from_slice(&0x300u64.to_be_bytes());
        msg.extend_from_slice(&7i64.to_be_bytes());
        msg.push(1);

        match parse_frame(&msg).unwrap() {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                assert_eq!(wal_end, Lsn::new(0x300));
                assert!(reply_requested);
            }
            other => panic!("expected Keepalive, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(parse_frame(&[]).is_err());
        assert!(parse_frame(&[0xFF]).is_err());
        assert!(parse_frame(&[b'w', 0, 0]).is_err());
        assert!(parse_frame(&[b'k', 0, 0, 0]).is_err());
    }

    #[test]
    fn test_status_update_layout() {
        let buf = encode_status_update(Lsn::new(0x0000_0001_0000_0A00));
        assert_eq!(buf.len(), 34);
        assert_eq!(buf[0], b'r');
        for offset in [1usize, 9, 17] {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&buf[offset..offset + 8]);
            assert_eq!(u64::from_be_bytes(arr), 0x0000_0001_0000_0A00);
        }
        assert_eq!(buf[33], 0);
    }

    #[test]
    fn test_start_replication_command() {
        let cmd = start_replication_command("dts_slot_t1", Lsn::ZERO, "dts_pub_t1");
        assert_eq!(
            cmd,
            "START_REPLICATION SLOT dts_slot_t1 LOGICAL 0/0 \
             (proto_version '1', publication_names 'dts_pub_t1')"
        );
    }
}
