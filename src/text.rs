//! Managed codepoint string buffers and the UTF-8 boundary codec.
//!
//! String-kind values carry a shared, length-tracked sequence of 32-bit
//! codepoints. Sharing follows the usual copy-on-write discipline: a buffer
//! with a single holder is mutated in place, a shared buffer is cloned before
//! mutation, and compiled-in constants (held in statics) are never mutated or
//! freed at all.
//!
//! Byte-oriented encodings exist only at OS call boundaries. Encoding stages
//! output through a fixed 256-byte buffer so printing never allocates per
//! character; decoding an invalid byte sequence produces `Value::Nothing`
//! rather than a partial string.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::value::{StrRef, Value};

/// Staging buffer size for byte output at OS boundaries.
const CHUNK: usize = 256;

static EMPTY: Lazy<StrRef> = Lazy::new(|| Arc::new(StrBuf::new()));

/// A length-tracked sequence of codepoints, the payload of string-kind values.
///
/// Codepoints are stored as raw 32-bit words; values that fall outside the
/// Unicode scalar range (or the NUL codepoint) are mapped to U+FFFD when they
/// cross an OS boundary, never inside the buffer itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StrBuf {
    chars: Vec<u32>,
}

impl StrBuf {
    pub fn new() -> Self {
        Self { chars: Vec::new() }
    }

    pub fn from_str(text: &str) -> Self {
        Self {
            chars: text.chars().map(|ch| ch as u32).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn chars(&self) -> &[u32] {
        &self.chars
    }

    /// Lossy conversion for diagnostics and path building.
    pub fn to_string_lossy(&self) -> String {
        self.chars.iter().map(|&cp| cp_to_char(cp)).collect()
    }

    /// Writes the UTF-8 encoding of this buffer, staged in bounded chunks.
    pub fn write_to(&self, out: &mut dyn Write, end_is_new_line: bool) -> io::Result<()> {
        if self.chars.is_empty() && !end_is_new_line {
            return Ok(());
        }
        let mut buffer = [0u8; CHUNK];
        let mut used = 0;
        for &cp in &self.chars {
            let ch = cp_to_char(cp);
            if used + ch.len_utf8() > CHUNK {
                out.write_all(&buffer[..used])?;
                used = 0;
            }
            used += ch.encode_utf8(&mut buffer[used..]).len();
        }
        if end_is_new_line {
            if used == CHUNK {
                out.write_all(&buffer)?;
                used = 0;
            }
            buffer[used] = b'\n';
            used += 1;
        }
        if used != 0 {
            out.write_all(&buffer[..used])?;
        }
        out.flush()
    }
}

/// The shared immortal empty buffer.
pub fn empty() -> StrRef {
    Arc::clone(&EMPTY)
}

/// Appends `suffix` to `target`, cloning the buffer first when it is shared.
pub fn append(target: &mut StrRef, suffix: &StrBuf) {
    if suffix.is_empty() {
        return;
    }
    Arc::make_mut(target).chars.extend_from_slice(&suffix.chars);
}

/// Appends raw codepoints to `target` under the same copy-on-write rule.
pub fn append_codepoints(target: &mut StrRef, codepoints: &[u32]) {
    if codepoints.is_empty() {
        return;
    }
    Arc::make_mut(target).chars.extend_from_slice(codepoints);
}

/// Decodes external bytes into a string value, or `Nothing` if the bytes are
/// not valid UTF-8.
pub fn value_from_utf8(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => str_value(text),
        Err(_) => Value::Nothing,
    }
}

pub fn str_value(text: &str) -> Value {
    if text.is_empty() {
        return Value::Str(empty());
    }
    Value::Str(Arc::new(StrBuf::from_str(text)))
}

pub fn path_value(path: &Path) -> Value {
    str_value(&path.to_string_lossy())
}

// =========================================================================
// Terminal output
// =========================================================================

pub fn print(text: &StrBuf) {
    let _ = text.write_to(&mut io::stdout().lock(), false);
}

pub fn println(text: &StrBuf) {
    let _ = text.write_to(&mut io::stdout().lock(), true);
}

pub fn print_as_error(text: &StrBuf) {
    let _ = text.write_to(&mut io::stderr().lock(), false);
}

pub fn println_as_error(text: &StrBuf) {
    let _ = text.write_to(&mut io::stderr().lock(), true);
}

fn cp_to_char(cp: u32) -> char {
    if cp == 0 {
        return char::REPLACEMENT_CHARACTER;
    }
    char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER)
}
