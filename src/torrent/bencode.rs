//! Bencode codec
//!
//! Hand-rolled parser and encoder that keeps dictionary keys as raw bytes.
//! The info dictionary arriving over the metadata extension must be hashed
//! exactly as received, so the codec never re-orders or re-encodes what it
//! reads; `decode_prefix` also reports how many bytes it consumed, which the
//! metadata messages need to split the bencoded header from the raw piece
//! payload that follows it.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Maximum length accepted for a single bencode string (32 MiB).
/// Torrent info dicts are far below this; anything larger is hostile input.
const MAX_STRING_LENGTH: usize = 32 * 1024 * 1024;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte-string keys, sorted
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 40 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

impl BencodeValue {
    /// Decode a complete bencode value, rejecting trailing data
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (value, consumed) = Self::decode_prefix(data)?;
        if consumed != data.len() {
            return Err(parse_error(format!(
                "trailing data: {} bytes",
                data.len() - consumed
            )));
        }
        Ok(value)
    }

    /// Decode one bencode value from the front of `data`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor { data, pos: 0 };
        let value = cursor.parse_value()?;
        Ok((value, cursor.pos))
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode into an existing buffer
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Get as UTF-8 string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as non-negative integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dict entry by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Convenience constructor for a dict under construction
pub fn dict(entries: impl IntoIterator<Item = (&'static str, BencodeValue)>) -> BencodeValue {
    BencodeValue::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect(),
    )
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| parse_error("unexpected end of input"))
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(BencodeValue::Bytes(self.parse_string()?)),
            c => Err(parse_error(format!("invalid type marker {:?}", c as char))),
        }
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| parse_error("non-ASCII integer"))?;

        // Leading zeros and negative zero are invalid encodings
        if (digits.len() > 1 && digits.starts_with('0'))
            || digits == "-0"
            || (digits.starts_with("-0") && digits.len() > 2)
        {
            return Err(parse_error(format!("invalid integer {:?}", digits)));
        }

        let value = digits
            .parse::<i64>()
            .map_err(|_| parse_error(format!("unparsable integer {:?}", digits)))?;
        self.pos += 1; // 'e'
        Ok(BencodeValue::Integer(value))
    }

    fn parse_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(parse_error("invalid string length"));
            }
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| parse_error("invalid string length"))?;

        if len > MAX_STRING_LENGTH {
            return Err(parse_error(format!("string of {} bytes exceeds limit", len)));
        }

        self.pos += 1; // ':'
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| parse_error("string exceeds available data"))?;

        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // 'e'
        Ok(BencodeValue::List(items))
    }

    fn parse_dict(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'd'
        let mut entries = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;

        while self.peek()? != b'e' {
            let key = self.parse_string()?;
            if let Some(ref prev) = last_key {
                if key <= *prev {
                    return Err(parse_error("dict keys not in sorted order"));
                }
            }
            let value = self.parse_value()?;
            last_key = Some(key.clone());
            entries.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(BencodeValue::Dict(entries))
    }
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}
