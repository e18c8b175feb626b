use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

/// Maximum nesting depth accepted before the parser bails out.
const MAX_DEPTH: usize = 64;

/// Decodes exactly one bencode value from `input`.
///
/// Trailing bytes after the value are an error; use [`decode_prefix`] when
/// the value is followed by raw payload data (as in ut_metadata messages).
///
/// # Examples
///
/// ```
/// use riptide::bencode::decode;
///
/// let v = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
/// assert_eq!(v.get_str(b"bar"), Some("spam"));
/// assert_eq!(v.get_int(b"foo"), Some(42));
/// ```
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(input)?;
    if used != input.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one bencode value from the front of `input`, returning the value
/// and the number of bytes it occupied.
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut parser = Parser { input, pos: 0 };
    let value = parser.value(0)?;
    Ok((value, parser.pos))
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump(); // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.bump();
        }
        let digits = &self.input[start..self.pos];
        self.bump(); // 'e'

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::BadInteger)?;
        // Canonical form: no empty body, no leading zeros, no negative zero.
        if text.is_empty()
            || text == "-"
            || text.starts_with("-0")
            || (text.len() > 1 && text.starts_with('0'))
        {
            return Err(BencodeError::BadInteger);
        }
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| BencodeError::BadInteger)
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.bump();
        }
        let len_text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| BencodeError::BadLength)?;
        let len: usize = len_text.parse().map_err(|_| BencodeError::BadLength)?;
        self.bump(); // ':'

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::Truncated)?;
        let bytes = Bytes::copy_from_slice(&self.input[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump(); // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.bump(); // 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump(); // 'd'
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        self.bump(); // 'e'
        Ok(Value::Dict(dict))
    }
}
