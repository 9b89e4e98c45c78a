//! The self-describing binary packing format shared with the target agent.
//!
//! One message body is one top-level array whose first element is the op or
//! event tag. Values carry single-byte type prefixes distinguishing fixed
//! integers, wider integers, UTF-8 strings, booleans, nil, and nested
//! arrays; the layout is MessagePack-compatible for the subset the protocol
//! uses. A message never exceeds [`BUF_SIZE`]; decoders parse the first
//! complete value and ignore trailing zero padding.

use std::fmt;

use crate::error::{Error, Result};
use crate::queue::BUF_SIZE;

/// A single packed value on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Array(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Pack `value` onto the end of `buf`.
pub fn encode(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Nil => buf.push(0xc0),
        Value::Bool(false) => buf.push(0xc2),
        Value::Bool(true) => buf.push(0xc3),
        Value::Int(n) => encode_int(*n, buf),
        Value::Str(s) => encode_str(s, buf),
        Value::Array(items) => {
            let len = items.len();
            if len <= 15 {
                buf.push(0x90 | len as u8);
            } else if len <= u16::MAX as usize {
                buf.push(0xdc);
                buf.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                buf.push(0xdd);
                buf.extend_from_slice(&(len as u32).to_be_bytes());
            }
            for item in items {
                encode(item, buf);
            }
        }
    }
}

// Non-negative values take the unsigned forms, negatives the signed forms,
// always in the smallest width that fits. This matches what the agent's own
// packer emits, so encode-then-decode is byte-stable in both directions.
fn encode_int(n: i64, buf: &mut Vec<u8>) {
    if n >= 0 {
        let n = n as u64;
        if n < 0x80 {
            buf.push(n as u8);
        } else if n <= u8::MAX as u64 {
            buf.push(0xcc);
            buf.push(n as u8);
        } else if n <= u16::MAX as u64 {
            buf.push(0xcd);
            buf.extend_from_slice(&(n as u16).to_be_bytes());
        } else if n <= u32::MAX as u64 {
            buf.push(0xce);
            buf.extend_from_slice(&(n as u32).to_be_bytes());
        } else {
            buf.push(0xcf);
            buf.extend_from_slice(&n.to_be_bytes());
        }
    } else if n >= -32 {
        buf.push(n as i8 as u8);
    } else if n >= i8::MIN as i64 {
        buf.push(0xd0);
        buf.push(n as i8 as u8);
    } else if n >= i16::MIN as i64 {
        buf.push(0xd1);
        buf.extend_from_slice(&(n as i16).to_be_bytes());
    } else if n >= i32::MIN as i64 {
        buf.push(0xd2);
        buf.extend_from_slice(&(n as i32).to_be_bytes());
    } else {
        buf.push(0xd3);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_str(s: &str, buf: &mut Vec<u8>) {
    let len = s.len();
    if len <= 31 {
        buf.push(0xa0 | len as u8);
    } else if len <= u8::MAX as usize {
        buf.push(0xd9);
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(0xda);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(0xdb);
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
    buf.extend_from_slice(s.as_bytes());
}

/// Pack a command tuple into a single message body.
///
/// The op tag becomes the first array element. Commands that do not fit the
/// per-message byte budget are rejected before anything reaches the queue.
pub fn encode_message(op: &str, args: Vec<Value>) -> Result<Vec<u8>> {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::Str(op.to_string()));
    items.extend(args);

    let mut buf = Vec::with_capacity(64);
    encode(&Value::Array(items), &mut buf);

    if buf.len() > BUF_SIZE {
        return Err(Error::CommandTooLarge {
            op: op.to_string(),
            len: buf.len(),
            max: BUF_SIZE,
        });
    }

    Ok(buf)
}

/// Unpack the first complete value from a message body, discarding padding.
pub fn decode(buf: &[u8]) -> Result<Value> {
    Reader { buf, pos: 0 }.value()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn value(&mut self) -> Result<Value> {
        let tag = self.u8()?;

        let value = match tag {
            0x00..=0x7f => Value::Int(tag as i64),
            0xe0..=0xff => Value::Int(tag as i8 as i64),
            0xc0 => Value::Nil,
            0xc2 => Value::Bool(false),
            0xc3 => Value::Bool(true),
            0xcc => Value::Int(self.u8()? as i64),
            0xcd => Value::Int(u16::from_be_bytes(self.array()?) as i64),
            0xce => Value::Int(u32::from_be_bytes(self.array()?) as i64),
            0xcf => {
                let n = u64::from_be_bytes(self.array()?);
                let n = i64::try_from(n).map_err(|_| malformed("uint64 out of range"))?;
                Value::Int(n)
            }
            0xd0 => Value::Int(self.u8()? as i8 as i64),
            0xd1 => Value::Int(i16::from_be_bytes(self.array()?) as i64),
            0xd2 => Value::Int(i32::from_be_bytes(self.array()?) as i64),
            0xd3 => Value::Int(i64::from_be_bytes(self.array()?)),
            0xa0..=0xbf => self.str((tag & 0x1f) as usize)?,
            0xd9 => {
                let len = self.u8()? as usize;
                self.str(len)?
            }
            0xda => {
                let len = u16::from_be_bytes(self.array()?) as usize;
                self.str(len)?
            }
            0xdb => {
                let len = u32::from_be_bytes(self.array()?) as usize;
                self.str(len)?
            }
            0x90..=0x9f => self.items((tag & 0x0f) as usize)?,
            0xdc => {
                let len = u16::from_be_bytes(self.array()?) as usize;
                self.items(len)?
            }
            0xdd => {
                let len = u32::from_be_bytes(self.array()?) as usize;
                self.items(len)?
            }
            other => return Err(malformed(format!("unsupported type prefix 0x{other:02x}"))),
        };

        Ok(value)
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| malformed("truncated value"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("truncated value"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn str(&mut self, len: usize) -> Result<Value> {
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| malformed("string is not utf-8"))?;
        Ok(Value::Str(s.to_string()))
    }

    fn items(&mut self, len: usize) -> Result<Value> {
        // Bound preallocation by what the buffer could possibly hold.
        let mut items = Vec::with_capacity(len.min(self.buf.len()));
        for _ in 0..len {
            items.push(self.value()?);
        }
        Ok(Value::Array(items))
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Malformed {
        reason: reason.into(),
    }
}
