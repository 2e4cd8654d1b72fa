//! Incremental memcached text-protocol parser.
//!
//! The parser consumes from the connection's read buffer and calls into
//! a [`StoreCommandSink`] as commands complete. It is resumable: when
//! the buffer holds only part of a command line or data block, `parse`
//! returns and picks up where it left off once more bytes arrive.
//!
//! Commands with a data block that the gateway refuses (`replace`,
//! `append`, `prepend`, `cas`) still have their block consumed, so one
//! refused command does not poison the rest of the stream.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ParseError;

/// Longest accepted command line, terminator included.
const MAX_LINE: usize = 8 * 1024;

/// Largest accepted data block.
const MAX_DATA: usize = 32 * 1024 * 1024;

/// Receiver for parsed commands.
///
/// The original protocol handler dispatched through a table of
/// type-erased function pointers; a plain trait carries the same four
/// entry points without the gymnastics.
pub trait StoreCommandSink {
    /// `get <k1> [<k2> ...]`
    fn get(&mut self, keys: Vec<Bytes>);

    /// `set <key> <flags> <exptime> <len> [noreply]` plus its data block.
    fn set(&mut self, key: Bytes, flags: u16, exptime: u32, value: Bytes, noreply: bool);

    /// `delete <key> [<exptime>] [noreply]`
    fn delete(&mut self, key: Bytes, exptime: u32, noreply: bool);

    /// A recognized command the gateway refuses to serve.
    fn unsupported(&mut self);
}

/// What a pending data block belongs to.
enum Pending {
    Set {
        key: Bytes,
        flags: u16,
        exptime: u32,
        noreply: bool,
    },
    /// replace / append / prepend / cas: block is consumed and dropped.
    Unsupported,
}

enum State {
    /// Waiting for a full command line.
    Command,
    /// Waiting for `needed` data bytes plus the CRLF terminator.
    Data { pending: Pending, needed: usize },
}

/// The parser state machine. One per connection.
pub struct MemtextParser {
    state: State,
}

impl Default for MemtextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MemtextParser {
    pub fn new() -> Self {
        Self {
            state: State::Command,
        }
    }

    /// Consumes as many complete commands from `buf` as possible.
    ///
    /// Returns `Ok` when more input is needed; any error is fatal to
    /// the connection.
    pub fn parse(
        &mut self,
        buf: &mut BytesMut,
        sink: &mut impl StoreCommandSink,
    ) -> Result<(), ParseError> {
        loop {
            match &mut self.state {
                State::Command => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_LINE {
                            return Err(ParseError::LineTooLong);
                        }
                        return Ok(());
                    };
                    let line = buf.split_to(line_end + 2);
                    let next = self.command(&line[..line_end], sink)?;
                    self.state = next;
                }
                State::Data { needed, .. } => {
                    if buf.len() < *needed + 2 {
                        return Ok(());
                    }
                    let data = buf.split_to(*needed).freeze();
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::BadTerminator);
                    }
                    buf.advance(2);
                    let state = std::mem::replace(&mut self.state, State::Command);
                    let State::Data { pending, .. } = state else {
                        unreachable!("matched Data above");
                    };
                    match pending {
                        Pending::Set {
                            key,
                            flags,
                            exptime,
                            noreply,
                        } => sink.set(key, flags, exptime, data, noreply),
                        Pending::Unsupported => sink.unsupported(),
                    }
                }
            }
        }
    }

    fn command(
        &self,
        line: &[u8],
        sink: &mut impl StoreCommandSink,
    ) -> Result<State, ParseError> {
        let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect();
        let Some((&command, args)) = tokens.split_first() else {
            return Err(ParseError::UnknownCommand);
        };

        match command {
            b"get" => {
                if args.is_empty() {
                    return Err(ParseError::Malformed("get"));
                }
                sink.get(args.iter().map(|k| Bytes::copy_from_slice(k)).collect());
                Ok(State::Command)
            }
            b"set" => {
                let (key, flags, exptime, needed, noreply) = parse_storage_args("set", args)?;
                Ok(State::Data {
                    pending: Pending::Set {
                        key,
                        flags,
                        exptime,
                        noreply,
                    },
                    needed,
                })
            }
            b"delete" => {
                let (key, rest) = args
                    .split_first()
                    .ok_or(ParseError::Malformed("delete"))?;
                let key = Bytes::copy_from_slice(key);
                let mut exptime = 0u32;
                let mut noreply = false;
                match rest {
                    [] => {}
                    [b"noreply"] => noreply = true,
                    [t] => exptime = parse_number("delete", t)?,
                    [t, b"noreply"] => {
                        exptime = parse_number("delete", t)?;
                        noreply = true;
                    }
                    _ => return Err(ParseError::Malformed("delete")),
                }
                sink.delete(key, exptime, noreply);
                Ok(State::Command)
            }
            b"replace" | b"append" | b"prepend" => {
                let (_, _, _, needed, _) = parse_storage_args("storage", args)?;
                Ok(State::Data {
                    pending: Pending::Unsupported,
                    needed,
                })
            }
            b"cas" => {
                // cas <key> <flags> <exptime> <len> <unique> [noreply]
                if args.len() < 5 {
                    return Err(ParseError::Malformed("cas"));
                }
                let needed: usize = parse_number("cas", args[3])?;
                if needed > MAX_DATA {
                    return Err(ParseError::Malformed("cas"));
                }
                Ok(State::Data {
                    pending: Pending::Unsupported,
                    needed,
                })
            }
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

type StorageArgs = (Bytes, u16, u32, usize, bool);

/// `<key> <flags> <exptime> <len> [noreply]`
fn parse_storage_args(which: &'static str, args: &[&[u8]]) -> Result<StorageArgs, ParseError> {
    if args.len() < 4 || args.len() > 5 {
        return Err(ParseError::Malformed(which));
    }
    let key = Bytes::copy_from_slice(args[0]);
    let flags: u16 = parse_number(which, args[1])?;
    let exptime: u32 = parse_number(which, args[2])?;
    let needed: usize = parse_number(which, args[3])?;
    if needed > MAX_DATA {
        return Err(ParseError::Malformed(which));
    }
    let noreply = match args.get(4) {
        None => false,
        Some(&b"noreply") => true,
        Some(_) => return Err(ParseError::Malformed(which)),
    };
    Ok((key, flags, exptime, needed, noreply))
}

fn parse_number<T: std::str::FromStr>(which: &'static str, token: &[u8]) -> Result<T, ParseError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::BadNumber(which))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
