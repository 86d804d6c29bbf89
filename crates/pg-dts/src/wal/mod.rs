//! Logical-replication consumption: LSNs, wire frames, pgoutput decoding,
//! and the subscriber that applies the stream to the target.

pub mod decoder;
pub mod lsn;
pub mod proto;
pub mod subscriber;

pub use decoder::{decode_event, DecodeError, TupleValue, WalColumn, WalEvent, WalTuple};
pub use lsn::Lsn;
pub use proto::{encode_status_update, parse_frame, start_replication_command, ReplicationFrame};
pub use subscriber::{ChangeSink, LagGauge, Subscriber, SubscriberHandle};
