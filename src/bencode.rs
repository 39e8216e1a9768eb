//! A minimal bencode codec.
//!
//! Values decode into a small recursive [`Value`] enum rather than directly
//! into domain types, which lets [`crate::metainfo`] ask for the raw,
//! byte-for-byte span of the `info` dictionary as it appeared in the
//! original file, rather than re-encoding it and risking a different
//! (but still valid) byte string. BitTorrent's info hash is defined over
//! those original bytes, so re-encoding a non-canonically-ordered dict would
//! silently produce the wrong hash.

use std::collections::BTreeMap;

pub use crate::error::BencodeError;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Dict keys are sorted lexicographically by construction (`BTreeMap`),
    /// matching the canonical on-wire ordering bencode requires.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

/// Decodes a single bencoded value from the start of `data`.
///
/// Trailing bytes after the value are ignored; callers that care about
/// exact framing (e.g. reading a `.torrent` file that should contain
/// exactly one value) should check [`decode_prefix`]'s returned length
/// against `data.len()` themselves.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, _) = decode_prefix(data)?;
    Ok(value)
}

/// Decodes a single bencoded value from the start of `data`, returning it
/// along with the number of bytes consumed.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut d = Decoder { data, pos: 0 };
    let value = d.decode_value()?;
    Ok((value, d.pos))
}

/// Decodes the top-level value as a dict and returns the raw byte span of
/// `key`'s value, exactly as it appeared in `data`.
///
/// Returns `Ok(None)` if `data` decodes to a dict but lacks `key`.
pub fn raw_field_span<'a>(
    data: &'a [u8],
    key: &[u8],
) -> Result<Option<&'a [u8]>, BencodeError> {
    let mut d = Decoder { data, pos: 0 };
    if d.peek()? != b'd' {
        return Err(BencodeError::WrongType);
    }
    d.pos += 1;
    loop {
        if d.peek()? == b'e' {
            d.pos += 1;
            return Ok(None);
        }
        let dict_key = d.decode_bytes()?;
        let value_start = d.pos;
        d.skip_value()?;
        let value_end = d.pos;
        if dict_key == key {
            return Ok(Some(&data[value_start..value_end]));
        }
    }
}

/// Encodes `value` into its canonical bencoded byte representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend(n.to_string().into_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend(b.len().to_string().into_bytes());
            out.push(b':');
            out.extend(b);
        }
        Value::List(l) => {
            out.push(b'l');
            for v in l {
                encode_into(v, out);
            }
            out.push(b'e');
        }
        Value::Dict(d) => {
            out.push(b'd');
            // `BTreeMap` iterates in key order, giving us canonical
            // ordering for free.
            for (k, v) in d {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn decode_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.decode_int(),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.decode_bytes()?)),
            c => Err(BencodeError::Malformed {
                pos: self.pos,
                reason: format!("unexpected byte {:?}", c as char),
            }),
        }
    }

    /// Advances past a value without allocating it, used by
    /// [`raw_field_span`] to find a value's byte boundaries cheaply.
    fn skip_value(&mut self) -> Result<(), BencodeError> {
        match self.peek()? {
            b'i' => {
                self.decode_int()?;
            }
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.decode_bytes()?;
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b'0'..=b'9' => {
                self.decode_bytes()?;
            }
            c => {
                return Err(BencodeError::Malformed {
                    pos: self.pos,
                    reason: format!("unexpected byte {:?}", c as char),
                })
            }
        }
        Ok(())
    }

    fn decode_int(&mut self) -> Result<Value, BencodeError> {
        debug_assert_eq!(self.data[self.pos], b'i');
        let start = self.pos + 1;
        let mut end = start;
        while self.data.get(end).ok_or(BencodeError::UnexpectedEof)? != &b'e' {
            end += 1;
        }
        let s = std::str::from_utf8(&self.data[start..end]).map_err(|_| {
            BencodeError::Malformed {
                pos: start,
                reason: "integer is not valid utf8".into(),
            }
        })?;
        // Bencode integers have a single canonical encoding: no leading
        // zeros (`i03e`) and no negative zero (`i-0e`); `-` alone is
        // caught by the parse below.
        let digits = s.strip_prefix('-').unwrap_or(s);
        if digits == "0" && s.starts_with('-') {
            return Err(BencodeError::Malformed {
                pos: start,
                reason: "negative zero is not a canonical integer".into(),
            });
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(BencodeError::Malformed {
                pos: start,
                reason: format!("{:?} has a non-canonical leading zero", s),
            });
        }
        let n: i64 = s.parse().map_err(|_| BencodeError::Malformed {
            pos: start,
            reason: format!("{:?} is not a valid integer", s),
        })?;
        self.pos = end + 1;
        Ok(Value::Int(n))
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let mut end = start;
        while self.data.get(end).ok_or(BencodeError::UnexpectedEof)? != &b':' {
            end += 1;
        }
        let len_str = std::str::from_utf8(&self.data[start..end]).map_err(|_| {
            BencodeError::Malformed {
                pos: start,
                reason: "string length is not valid utf8".into(),
            }
        })?;
        let len: usize = len_str.parse().map_err(|_| BencodeError::Malformed {
            pos: start,
            reason: format!("{:?} is not a valid string length", len_str),
        })?;
        let data_start = end + 1;
        let data_end = data_start
            .checked_add(len)
            .ok_or(BencodeError::UnexpectedEof)?;
        if data_end > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        self.pos = data_end;
        Ok(self.data[data_start..data_end].to_vec())
    }

    fn decode_list(&mut self) -> Result<Value, BencodeError> {
        debug_assert_eq!(self.data[self.pos], b'l');
        self.pos += 1;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode_value()?);
        }
        self.pos += 1;
        Ok(Value::List(list))
    }

    fn decode_dict(&mut self) -> Result<Value, BencodeError> {
        debug_assert_eq!(self.data[self.pos], b'd');
        self.pos += 1;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.decode_bytes()?;
            let value = self.decode_value()?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam".to_vec()));
    }

    #[test]
    fn decodes_empty_string() {
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn decodes_positive_and_negative_ints() {
        assert_eq!(decode(b"i3e").unwrap(), Value::Int(3));
        assert_eq!(decode(b"i-3e").unwrap(), Value::Int(-3));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    /// `spec.md` §4.1 declares leading zeros and negative zero malformed,
    /// even though `i0e` itself is the canonical encoding of zero.
    #[test]
    fn rejects_non_canonical_integers() {
        assert!(matches!(
            decode(b"i03e"),
            Err(BencodeError::Malformed { .. })
        ));
        assert!(matches!(
            decode(b"i-0e"),
            Err(BencodeError::Malformed { .. })
        ));
        assert!(matches!(
            decode(b"i-03e"),
            Err(BencodeError::Malformed { .. })
        ));
    }

    #[test]
    fn decodes_list() {
        assert_eq!(
            decode(b"l4:spam4:eggse").unwrap(),
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec()),
            ])
        );
    }

    #[test]
    fn decodes_nested_dict() {
        let data = b"d3:cow3:moo4:spaml1:a1:beee";
        let value = decode(data).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get(&b"cow"[..]).unwrap().as_bytes().unwrap(), b"moo");
        assert_eq!(
            dict.get(&b"spam"[..]).unwrap().as_list().unwrap().len(),
            2
        );
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(decode(b"5:hi"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b""), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn encode_is_canonical_regardless_of_insertion_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zebra".to_vec(), Value::Int(1));
        dict.insert(b"aardvark".to_vec(), Value::Int(2));
        let encoded = encode(&Value::Dict(dict));
        assert_eq!(encoded, b"d8:aardvarki2e5:zebrai1ee");
    }

    #[test]
    fn round_trips_through_decode_and_encode() {
        let data = b"d4:infod6:lengthi12345e4:name8:test.txtee";
        let value = decode(data).unwrap();
        assert_eq!(encode(&value), data.to_vec());
    }

    #[test]
    fn raw_field_span_returns_exact_source_bytes_even_if_reencoding_would_differ() {
        // The `info` dict's keys are deliberately out of lexicographic
        // order here (`zzz` before `aaa`): a real `.torrent` file must not
        // do this, but if one somehow did, a decode-then-reencode
        // roundtrip would reorder the keys and change the hash. The span
        // extractor must return the literal source bytes instead.
        let data = b"d4:infod3:zzzi1e3:aaai2ee6:lengthi99ee";
        let span = raw_field_span(data, b"info").unwrap().unwrap();
        assert_eq!(span, &b"d3:zzzi1e3:aaai2ee"[..]);
    }

    #[test]
    fn raw_field_span_missing_key_is_none() {
        let data = b"d6:lengthi99ee";
        assert_eq!(raw_field_span(data, b"info").unwrap(), None);
    }
}
