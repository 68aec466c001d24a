//! # Remopack
//!
//! A small, bounded encoding for the dynamic values that travel inside remote
//! object messages: arguments, return values, property values, context bags.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! A Map body is a run of named entries, each a `Variant` holding the key
//! string followed by exactly one payload item. All integers are Little-Endian.

mod value;

#[cfg(test)]
mod tests;

pub use value::Value;

/// Deepest container nesting `Decoder::value` will follow.
pub const MAX_DEPTH: usize = 64;

/// Serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// A valid tag was found where another one was required.
    UnexpectedTag { expected: Tag, found: Tag },
    /// String data is not valid UTF-8, or a char is not a scalar value.
    InvalidUtf8,
    /// Closing a scope that does not match the active scope.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// Wrote a second payload into a Variant.
    TooManyItems,
    /// Closed a Variant without its payload.
    EmptyVariant,
    /// Wrote something other than a named entry directly into a Map.
    InvalidMapEntry,
    /// Containers nested deeper than `MAX_DEPTH`.
    RecursionLimitExceeded,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::UnexpectedTag { expected, found } => {
                write!(f, "expected {:?}, found {:?}", expected, found)
            }
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds u32 length", n),
            Error::RecursionLimitExceeded => write!(f, "values nested deeper than {}", MAX_DEPTH),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for remopack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of the encoded item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U32 = 0x05,
    U64 = 0x06,
    S32 = 0x09,
    S64 = 0x0A,
    F64 = 0x0C,
    Char = 0x0D,
    Null = 0x0E,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    Variant = 0x33,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::BoolTrue),
            0x02 => Some(Tag::BoolFalse),
            0x05 => Some(Tag::U32),
            0x06 => Some(Tag::U64),
            0x09 => Some(Tag::S32),
            0x0A => Some(Tag::S64),
            0x0C => Some(Tag::F64),
            0x0D => Some(Tag::Char),
            0x0E => Some(Tag::Null),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x33 => Some(Tag::Variant),
            _ => None,
        }
    }

    /// Width of the fixed data following the tag, or `None` for length-prefixed items.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::BoolTrue | Tag::BoolFalse | Tag::Null => Some(0),
            Tag::U32 | Tag::S32 | Tag::Char => Some(4),
            Tag::U64 | Tag::S64 | Tag::F64 => Some(8),
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Variant => None,
        }
    }
}

/// Scope kinds tracked by the `Encoder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    List,
    /// Only named entries (`variant_begin`) are allowed.
    Map,
    /// Exactly one payload item after the name.
    Variant,
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A state-machine driven encoder.
///
/// Open containers are tracked on a stack so their length headers can be
/// back-patched when they close.
pub struct Encoder {
    buf: Vec<u8>,
    stack: Vec<Frame>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            stack: Vec::with_capacity(8),
        }
    }

    /// Consumes the encoder and returns the final bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.stack.is_empty() {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn scope(&self) -> Scope {
        self.stack.last().map_or(Scope::Root, |f| f.scope)
    }

    fn check_write(&self, tag: Tag) -> Result<()> {
        match self.stack.last() {
            None => Ok(()),
            Some(frame) => match frame.scope {
                Scope::Root | Scope::List => Ok(()),
                Scope::Map if tag == Tag::Variant => Ok(()),
                Scope::Map => Err(Error::InvalidMapEntry),
                Scope::Variant if frame.count >= 1 => Err(Error::TooManyItems),
                Scope::Variant => Ok(()),
            },
        }
    }

    fn on_item_written(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.count += 1;
        }
    }

    fn scalar(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        let actual = self.scope();
        if actual == Scope::Root {
            return Err(Error::ScopeUnderflow);
        }
        if actual != expected {
            return Err(Error::ScopeMismatch { expected, actual });
        }
        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        if frame.scope == Scope::Variant && frame.count == 0 {
            return Err(Error::EmptyVariant);
        }

        let body_len = self.buf.len() - frame.start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[frame.start - 4..frame.start].copy_from_slice(&len.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.scalar(if v { Tag::BoolTrue } else { Tag::BoolFalse }, &[])
    }

    pub fn null(&mut self) -> Result<()> { self.scalar(Tag::Null, &[]) }
    pub fn u32(&mut self, v: u32) -> Result<()> { self.scalar(Tag::U32, &v.to_le_bytes()) }
    pub fn s32(&mut self, v: i32) -> Result<()> { self.scalar(Tag::S32, &v.to_le_bytes()) }
    pub fn u64(&mut self, v: u64) -> Result<()> { self.scalar(Tag::U64, &v.to_le_bytes()) }
    pub fn s64(&mut self, v: i64) -> Result<()> { self.scalar(Tag::S64, &v.to_le_bytes()) }
    pub fn f64(&mut self, v: f64) -> Result<()> { self.scalar(Tag::F64, &v.to_le_bytes()) }
    pub fn char(&mut self, v: char) -> Result<()> { self.scalar(Tag::Char, &(v as u32).to_le_bytes()) }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> { self.blob(Tag::String, v.as_bytes()) }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.blob(Tag::Bytes, v) }

    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a Map. Only `variant_begin` entries may be written until `map_end`.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    /// Begins a named entry. Exactly one payload item must follow before `variant_end`.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin_scope(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // The name is metadata, not the payload.
        if let Some(frame) = self.stack.last_mut() {
            frame.count = 0;
        }
        Ok(())
    }
    pub fn variant_end(&mut self) -> Result<()> { self.end_scope(Scope::Variant) }

    /// Encodes a dynamic value, recursing into lists and maps.
    ///
    /// Values nested deeper than `MAX_DEPTH` fail with `RecursionLimitExceeded`,
    /// the same bound the decoder enforces. On error the encoder is left
    /// mid-value and should be discarded.
    pub fn value(&mut self, v: &Value) -> Result<()> {
        self.value_at(v, 0)
    }

    fn value_at(&mut self, v: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::RecursionLimitExceeded);
        }
        match v {
            Value::Null => self.null(),
            Value::Bool(b) => self.bool(*b),
            Value::Int(i) => self.s64(*i),
            Value::UInt(u) => self.u64(*u),
            Value::Double(d) => self.f64(*d),
            Value::Char(c) => self.char(*c),
            Value::String(s) => self.str(s),
            Value::Bytes(b) => self.bytes(b),
            Value::List(items) => {
                self.list_begin()?;
                for item in items {
                    self.value_at(item, depth + 1)?;
                }
                self.list_end()
            }
            Value::Map(entries) => {
                self.map_begin()?;
                for (key, item) in entries {
                    self.variant_begin(key)?;
                    self.value_at(item, depth + 1)?;
                    self.variant_end()?;
                }
                self.map_end()
            }
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Container reads return new `Decoder`s restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        <[u8; N]>::try_from(bytes).map_err(|_| Error::UnexpectedEnd)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.buf = &self.buf[1..];
        Ok(())
    }

    /// Skips the next item and everything nested in it.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.buf = &self.buf[1..];
        match tag.fixed_width() {
            Some(width) => self.read_bytes(width)?,
            None => {
                let len = self.read_len()?;
                self.read_bytes(len)?
            }
        };
        Ok(())
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.buf = &self.buf[1..]; Ok(true) }
            Tag::BoolFalse => { self.buf = &self.buf[1..]; Ok(false) }
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    pub fn null(&mut self) -> Result<()> { self.expect_tag(Tag::Null) }
    pub fn u32(&mut self) -> Result<u32> { self.expect_tag(Tag::U32)?; Ok(u32::from_le_bytes(self.read_array()?)) }
    pub fn s32(&mut self) -> Result<i32> { self.expect_tag(Tag::S32)?; Ok(i32::from_le_bytes(self.read_array()?)) }
    pub fn u64(&mut self) -> Result<u64> { self.expect_tag(Tag::U64)?; Ok(u64::from_le_bytes(self.read_array()?)) }
    pub fn s64(&mut self) -> Result<i64> { self.expect_tag(Tag::S64)?; Ok(i64::from_le_bytes(self.read_array()?)) }
    pub fn f64(&mut self) -> Result<f64> { self.expect_tag(Tag::F64)?; Ok(f64::from_le_bytes(self.read_array()?)) }

    pub fn char(&mut self) -> Result<char> {
        self.expect_tag(Tag::Char)?;
        let raw = u32::from_le_bytes(self.read_array()?);
        char::from_u32(raw).ok_or(Error::InvalidUtf8)
    }

    pub fn str(&mut self) -> Result<&'a str> {
        self.expect_tag(Tag::String)?;
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    fn enter_container(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.expect_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::List)? })
    }

    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter_container(Tag::Map)? })
    }

    /// Decodes a named entry, returning `(name, payload decoder)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }

    /// Decodes the next item as a dynamic value.
    pub fn value(&mut self) -> Result<Value> {
        self.value_at(0)
    }

    fn value_at(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::RecursionLimitExceeded);
        }
        let value = match self.peek_tag()? {
            Tag::Null => { self.null()?; Value::Null }
            Tag::BoolTrue | Tag::BoolFalse => Value::Bool(self.bool()?),
            Tag::U32 => Value::UInt(u64::from(self.u32()?)),
            Tag::S32 => Value::Int(i64::from(self.s32()?)),
            Tag::U64 => Value::UInt(self.u64()?),
            Tag::S64 => Value::Int(self.s64()?),
            Tag::F64 => Value::Double(self.f64()?),
            Tag::Char => Value::Char(self.char()?),
            Tag::String => Value::String(self.str()?.to_owned()),
            Tag::Bytes => Value::Bytes(self.bytes()?.to_vec()),
            Tag::List => {
                let mut items = Vec::new();
                let mut list = self.list()?;
                while let Some(mut item) = list.next()? {
                    items.push(item.value_at(depth + 1)?);
                }
                Value::List(items)
            }
            Tag::Map => {
                let mut entries = std::collections::BTreeMap::new();
                let mut map = self.map()?;
                while let Some((key, mut item)) = map.next()? {
                    entries.insert(key.to_owned(), item.value_at(depth + 1)?);
                }
                Value::Map(entries)
            }
            // A bare named entry decodes as a single-entry map.
            Tag::Variant => {
                let (key, mut item) = self.variant()?;
                let mut entries = std::collections::BTreeMap::new();
                entries.insert(key.to_owned(), item.value_at(depth + 1)?);
                Value::Map(entries)
            }
        };
        Ok(value)
    }
}

/// Iterator over the items of a List.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder positioned on the next item, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator over the named entries of a Map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(key, value decoder)` for the next entry, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let found = self.dec.peek_tag()?;
        if found != Tag::Variant {
            return Err(Error::UnexpectedTag { expected: Tag::Variant, found });
        }
        Ok(Some(self.dec.variant()?))
    }
}
