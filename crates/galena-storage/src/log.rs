//! Op-log record framing.
//!
//! Each record is a fixed header followed by the key and, for sets, the
//! value:
//!
//! ```text
//! [op: u8][clocktime: u64 BE][keylen: u32 BE][vallen: u32 BE][key][val]
//! ```
//!
//! `vallen` is zero for deletes. A torn tail (crash mid-append) is
//! detected as an incomplete record and replay stops there; anything
//! structurally wrong before the tail is reported as corruption.

use std::io::{self, Read, Write};

use bytes::Bytes;

use galena_types::ClockTime;

use crate::{StorageError, StorageResult};

/// Magic bytes at the start of every op log.
pub const MAGIC: &[u8; 4] = b"GLN1";

const OP_SET: u8 = 0;
const OP_DELETE: u8 = 1;

const HEADER_LEN: usize = 1 + 8 + 4 + 4;

/// Hard cap on key and value sizes, guarding replay against garbage
/// length fields.
const MAX_KEY_LEN: u32 = 64 * 1024;
const MAX_VAL_LEN: u32 = 64 * 1024 * 1024;

/// One decoded op-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Set {
        key: Bytes,
        value: Bytes,
        clocktime: ClockTime,
    },
    Delete {
        key: Bytes,
        clocktime: ClockTime,
    },
}

impl LogRecord {
    /// Appends the encoded record to `w`.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let mut header = [0u8; HEADER_LEN];
        match self {
            LogRecord::Set {
                key,
                value,
                clocktime,
            } => {
                header[0] = OP_SET;
                header[1..9].copy_from_slice(&clocktime.as_u64().to_be_bytes());
                header[9..13].copy_from_slice(&(key.len() as u32).to_be_bytes());
                header[13..17].copy_from_slice(&(value.len() as u32).to_be_bytes());
                w.write_all(&header)?;
                w.write_all(key)?;
                w.write_all(value)
            }
            LogRecord::Delete { key, clocktime } => {
                header[0] = OP_DELETE;
                header[1..9].copy_from_slice(&clocktime.as_u64().to_be_bytes());
                header[9..13].copy_from_slice(&(key.len() as u32).to_be_bytes());
                w.write_all(&header)?;
                w.write_all(key)
            }
        }
    }

    /// Reads the next record from `r` at logical offset `offset`.
    ///
    /// Returns `Ok(None)` on clean end-of-log or on a torn tail.
    pub fn read_from(r: &mut impl Read, offset: u64) -> StorageResult<Option<LogRecord>> {
        let mut header = [0u8; HEADER_LEN];
        match read_exact_or_eof(r, &mut header)? {
            Filled::Eof => return Ok(None),
            Filled::Partial => {
                tracing::warn!(offset, "torn record header at log tail, truncating replay");
                return Ok(None);
            }
            Filled::Full => {}
        }

        let op = header[0];
        let clocktime = ClockTime::from(u64::from_be_bytes(header[1..9].try_into().unwrap()));
        let keylen = u32::from_be_bytes(header[9..13].try_into().unwrap());
        let vallen = u32::from_be_bytes(header[13..17].try_into().unwrap());

        if keylen > MAX_KEY_LEN || vallen > MAX_VAL_LEN {
            return Err(StorageError::Corrupt {
                offset,
                reason: format!("implausible lengths keylen={keylen} vallen={vallen}"),
            });
        }

        let mut key = vec![0u8; keylen as usize];
        if read_exact_or_eof(r, &mut key)? != Filled::Full {
            tracing::warn!(offset, "torn key at log tail, truncating replay");
            return Ok(None);
        }

        match op {
            OP_SET => {
                let mut value = vec![0u8; vallen as usize];
                if read_exact_or_eof(r, &mut value)? != Filled::Full {
                    tracing::warn!(offset, "torn value at log tail, truncating replay");
                    return Ok(None);
                }
                Ok(Some(LogRecord::Set {
                    key: Bytes::from(key),
                    value: Bytes::from(value),
                    clocktime,
                }))
            }
            OP_DELETE => {
                if vallen != 0 {
                    return Err(StorageError::Corrupt {
                        offset,
                        reason: format!("delete record with vallen={vallen}"),
                    });
                }
                Ok(Some(LogRecord::Delete {
                    key: Bytes::from(key),
                    clocktime,
                }))
            }
            other => Err(StorageError::Corrupt {
                offset,
                reason: format!("unknown op byte {other}"),
            }),
        }
    }

    /// Encoded size of the record, for offset accounting during replay.
    pub fn encoded_len(&self) -> u64 {
        match self {
            LogRecord::Set { key, value, .. } => (HEADER_LEN + key.len() + value.len()) as u64,
            LogRecord::Delete { key, .. } => (HEADER_LEN + key.len()) as u64,
        }
    }
}

#[derive(PartialEq, Eq)]
enum Filled {
    Full,
    Partial,
    Eof,
}

/// Like `read_exact`, but distinguishes clean EOF (no bytes read) from a
/// torn tail (some bytes read, then EOF).
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<Filled> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 { Filled::Eof } else { Filled::Partial });
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Filled::Full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: &LogRecord) -> LogRecord {
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, record.encoded_len());
        LogRecord::read_from(&mut buf.as_slice(), 0).unwrap().unwrap()
    }

    #[test]
    fn set_record_roundtrip() {
        let record = LogRecord::Set {
            key: Bytes::from_static(b"foo"),
            value: Bytes::from_static(b"hello"),
            clocktime: ClockTime::new(100, 7),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn delete_record_roundtrip() {
        let record = LogRecord::Delete {
            key: Bytes::from_static(b"foo"),
            clocktime: ClockTime::new(100, 8),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn empty_reader_is_clean_eof() {
        let empty: &[u8] = &[];
        assert_eq!(LogRecord::read_from(&mut &*empty, 0).unwrap(), None);
    }

    #[test]
    fn torn_tail_stops_replay() {
        let record = LogRecord::Set {
            key: Bytes::from_static(b"foo"),
            value: Bytes::from_static(b"hello"),
            clocktime: ClockTime::new(1, 1),
        };
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        assert_eq!(LogRecord::read_from(&mut buf.as_slice(), 0).unwrap(), None);
    }

    #[test]
    fn garbage_op_is_corruption() {
        let mut buf = vec![0xFFu8; HEADER_LEN];
        // Zero lengths so the header parses and the op byte is reached.
        buf[9..13].copy_from_slice(&0u32.to_be_bytes());
        buf[13..17].copy_from_slice(&0u32.to_be_bytes());
        let err = LogRecord::read_from(&mut buf.as_slice(), 0).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
