//! Log entry types and their binary encoding.
//!
//! Every replicated record is an [`Entry`]: an index assigned at append
//! time, the term of the leader that created it, and a [`Record`] payload.
//! Records encode to length-prefixed frames inside segment files:
//!
//! ```text
//! | length (u32) | term (u64) | type (u8) | payload |
//! ```
//!
//! Frame type `0` is a skip marker written by compaction in place of a
//! discarded entry, preserving index contiguity within a segment.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::{Member, MemberKind};

use crate::error::Error;

/// Position of an entry in the log (1-based; 0 means "no entry").
pub type Index = u64;

/// Leadership epoch an entry was created under.
pub type Term = u64;

/// Identifier of a client session; equals the index of its Register entry.
pub type SessionId = u64;

/// Frame type written in place of a compacted-out entry.
pub(crate) const TYPE_SKIP: u8 = 0;
const TYPE_NOOP: u8 = 1;
const TYPE_REGISTER: u8 = 2;
const TYPE_KEEP_ALIVE: u8 = 3;
const TYPE_COMMAND: u8 = 4;
const TYPE_QUERY: u8 = 5;
const TYPE_CONFIGURATION: u8 = 6;

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub index: Index,
    pub term: Term,
    pub record: Record,
}

impl Entry {
    pub fn new(index: Index, term: Term, record: Record) -> Self {
        Self {
            index,
            term,
            record,
        }
    }
}

/// The payload variants an entry may carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Appended by a newly elected leader to commit prior-term entries.
    NoOp,
    /// Creates a session; the entry's index becomes the session id.
    Register { connection: u64, timestamp: i64 },
    /// Renews a session and acknowledges command responses.
    KeepAlive {
        session: SessionId,
        command_sequence: u64,
        timestamp: i64,
    },
    /// A mutating operation submitted by a session.
    Command {
        session: SessionId,
        sequence: u64,
        timestamp: i64,
        operation: Bytes,
    },
    /// A read operation, built for execution at a point in the log.
    Query {
        session: SessionId,
        sequence: u64,
        timestamp: i64,
        operation: Bytes,
    },
    /// Replaces the cluster membership.
    Configuration {
        active: Vec<Member>,
        passive: Vec<Member>,
    },
}

impl Record {
    pub(crate) fn type_id(&self) -> u8 {
        match self {
            Record::NoOp => TYPE_NOOP,
            Record::Register { .. } => TYPE_REGISTER,
            Record::KeepAlive { .. } => TYPE_KEEP_ALIVE,
            Record::Command { .. } => TYPE_COMMAND,
            Record::Query { .. } => TYPE_QUERY,
            Record::Configuration { .. } => TYPE_CONFIGURATION,
        }
    }

    /// The leader-clock timestamp carried by this record, if any.
    ///
    /// Applying a timestamped record advances the deterministic "log time"
    /// that session expiration is judged against.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Record::NoOp | Record::Configuration { .. } => None,
            Record::Register { timestamp, .. }
            | Record::KeepAlive { timestamp, .. }
            | Record::Command { timestamp, .. }
            | Record::Query { timestamp, .. } => Some(*timestamp),
        }
    }

    pub(crate) fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Record::NoOp => {}
            Record::Register {
                connection,
                timestamp,
            } => {
                buf.put_u64(*connection);
                buf.put_i64(*timestamp);
            }
            Record::KeepAlive {
                session,
                command_sequence,
                timestamp,
            } => {
                buf.put_u64(*session);
                buf.put_u64(*command_sequence);
                buf.put_i64(*timestamp);
            }
            Record::Command {
                session,
                sequence,
                timestamp,
                operation,
            }
            | Record::Query {
                session,
                sequence,
                timestamp,
                operation,
            } => {
                buf.put_u64(*session);
                buf.put_u64(*sequence);
                buf.put_i64(*timestamp);
                buf.put_slice(operation);
            }
            Record::Configuration { active, passive } => {
                encode_members(active, buf);
                encode_members(passive, buf);
            }
        }
    }

    pub(crate) fn decode_payload(type_id: u8, mut payload: Bytes) -> Result<Record, Error> {
        match type_id {
            TYPE_NOOP => Ok(Record::NoOp),
            TYPE_REGISTER => {
                check_remaining(&payload, 16)?;
                Ok(Record::Register {
                    connection: payload.get_u64(),
                    timestamp: payload.get_i64(),
                })
            }
            TYPE_KEEP_ALIVE => {
                check_remaining(&payload, 24)?;
                Ok(Record::KeepAlive {
                    session: payload.get_u64(),
                    command_sequence: payload.get_u64(),
                    timestamp: payload.get_i64(),
                })
            }
            TYPE_COMMAND | TYPE_QUERY => {
                check_remaining(&payload, 24)?;
                let session = payload.get_u64();
                let sequence = payload.get_u64();
                let timestamp = payload.get_i64();
                let operation = payload;
                Ok(if type_id == TYPE_COMMAND {
                    Record::Command {
                        session,
                        sequence,
                        timestamp,
                        operation,
                    }
                } else {
                    Record::Query {
                        session,
                        sequence,
                        timestamp,
                        operation,
                    }
                })
            }
            TYPE_CONFIGURATION => {
                let active = decode_members(&mut payload)?;
                let passive = decode_members(&mut payload)?;
                Ok(Record::Configuration { active, passive })
            }
            other => Err(Error::Corruption(format!(
                "invalid entry type: 0x{:02x}",
                other
            ))),
        }
    }
}

fn encode_members(members: &[Member], buf: &mut BytesMut) {
    buf.put_u16(members.len() as u16);
    for member in members {
        buf.put_u64(member.id);
        buf.put_u8(match member.kind {
            MemberKind::Active => 0,
            MemberKind::Passive => 1,
            MemberKind::Client => 2,
        });
        buf.put_u16(member.port);
        buf.put_u16(member.host.len() as u16);
        buf.put_slice(member.host.as_bytes());
    }
}

fn decode_members(payload: &mut Bytes) -> Result<Vec<Member>, Error> {
    check_remaining(payload, 2)?;
    let count = payload.get_u16() as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        check_remaining(payload, 13)?;
        let id = payload.get_u64();
        let kind = match payload.get_u8() {
            0 => MemberKind::Active,
            1 => MemberKind::Passive,
            2 => MemberKind::Client,
            other => {
                return Err(Error::Corruption(format!(
                    "invalid member kind: 0x{:02x}",
                    other
                )))
            }
        };
        let port = payload.get_u16();
        let host_len = payload.get_u16() as usize;
        check_remaining(payload, host_len)?;
        let host = String::from_utf8(payload.split_to(host_len).to_vec())
            .map_err(|e| Error::Corruption(format!("invalid member host: {}", e)))?;
        members.push(Member { id, host, port, kind });
    }
    Ok(members)
}

fn check_remaining(payload: &Bytes, needed: usize) -> Result<(), Error> {
    if payload.remaining() < needed {
        return Err(Error::Corruption(format!(
            "truncated entry payload: need {} bytes, have {}",
            needed,
            payload.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: Record) -> Record {
        let mut buf = BytesMut::new();
        record.encode_payload(&mut buf);
        Record::decode_payload(record.type_id(), buf.freeze()).unwrap()
    }

    #[test]
    fn should_roundtrip_command_with_operation_bytes() {
        // given
        let record = Record::Command {
            session: 7,
            sequence: 3,
            timestamp: 12_345,
            operation: Bytes::from_static(b"PUT k v"),
        };

        // then
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn should_roundtrip_configuration_with_mixed_members() {
        // given
        let record = Record::Configuration {
            active: vec![
                Member::new(1, "node-a", 7001, MemberKind::Active),
                Member::new(2, "node-b", 7002, MemberKind::Active),
            ],
            passive: vec![Member::new(3, "node-c", 7003, MemberKind::Passive)],
        };

        // then
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn should_reject_unknown_type_id() {
        // when
        let result = Record::decode_payload(0x7f, Bytes::new());

        // then
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn should_reject_truncated_payload() {
        // given: a register payload missing its timestamp
        let mut buf = BytesMut::new();
        buf.put_u64(42);

        // when
        let result = Record::decode_payload(TYPE_REGISTER, buf.freeze());

        // then
        assert!(matches!(result, Err(Error::Corruption(_))));
    }
}
