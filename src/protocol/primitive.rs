//! Primitive stream encodings.
//!
//! Every message payload is built from the encodings in this module. All
//! multi-byte values are big-endian and fixed width; strings and byte arrays
//! are prefixed with a signed 32-bit length.
//!
//! | Type          | Encoding                       |
//! |---------------|--------------------------------|
//! | `i16`         | 2 bytes                        |
//! | `i32`         | 4 bytes                        |
//! | `i64`         | 8 bytes                        |
//! | `f32`         | 4 bytes (IEEE 754 bits)        |
//! | `f64`         | 8 bytes (IEEE 754 bits)        |
//! | UTF-16 unit   | 2 bytes                        |
//! | `bool`        | 1 byte, `0` false, else true   |
//! | byte array    | `i32` length, then raw bytes   |
//! | string        | `i32` length, then UTF-8 bytes |
//!
//! Fixed-width numerics are delegated to `bincode` with a big-endian,
//! fixed-int configuration.
use std::io::{Read, Write};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};

use crate::error::{Error, Result};

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

fn put<T: Encode>(mut out: &mut dyn Write, value: T) -> Result<()> {
    encode_into_std_write(value, &mut out, config())?;
    Ok(())
}

fn take<T: Decode<()>>(mut input: &mut dyn Read) -> Result<T> {
    Ok(decode_from_std_read(&mut input, config())?)
}

pub fn write_i16(out: &mut dyn Write, value: i16) -> Result<()> {
    put(out, value)
}

pub fn read_i16(input: &mut dyn Read) -> Result<i16> {
    take(input)
}

pub fn write_i32(out: &mut dyn Write, value: i32) -> Result<()> {
    put(out, value)
}

pub fn read_i32(input: &mut dyn Read) -> Result<i32> {
    take(input)
}

pub fn write_i64(out: &mut dyn Write, value: i64) -> Result<()> {
    put(out, value)
}

pub fn read_i64(input: &mut dyn Read) -> Result<i64> {
    take(input)
}

pub fn write_f32(out: &mut dyn Write, value: f32) -> Result<()> {
    put(out, value)
}

pub fn read_f32(input: &mut dyn Read) -> Result<f32> {
    take(input)
}

pub fn write_f64(out: &mut dyn Write, value: f64) -> Result<()> {
    put(out, value)
}

pub fn read_f64(input: &mut dyn Read) -> Result<f64> {
    take(input)
}

pub fn write_utf16(out: &mut dyn Write, unit: u16) -> Result<()> {
    put(out, unit)
}

pub fn read_utf16(input: &mut dyn Read) -> Result<u16> {
    take(input)
}

/// Writes a character as a single UTF-16 code unit.
///
/// Characters outside the basic multilingual plane need a surrogate pair and
/// are rejected.
pub fn write_char(out: &mut dyn Write, value: char) -> Result<()> {
    let mut units = [0u16; 2];
    match value.encode_utf16(&mut units) {
        [unit] => write_utf16(out, *unit),
        _ => Err(Error::protocol(format!(
            "'{value}' does not fit in one UTF-16 code unit"
        ))),
    }
}

pub fn read_char(input: &mut dyn Read) -> Result<char> {
    let unit = read_utf16(input)?;
    char::from_u32(unit as u32)
        .ok_or_else(|| Error::protocol(format!("lone surrogate code unit {unit:#06x}")))
}

// bincode rejects anything but 0 and 1 for bools, so the byte is handled here.
pub fn write_bool(out: &mut dyn Write, value: bool) -> Result<()> {
    out.write_all(&[value as u8])?;
    Ok(())
}

pub fn read_bool(input: &mut dyn Read) -> Result<bool> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0] != 0)
}

pub fn write_bytes(out: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| Error::protocol(format!("{} bytes exceed the length prefix", bytes.len())))?;
    write_i32(out, len)?;
    out.write_all(bytes)?;
    Ok(())
}

pub fn read_bytes(input: &mut dyn Read) -> Result<Vec<u8>> {
    let len = read_i32(input)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::protocol(format!("negative length prefix {len}")))?;

    let mut body = Vec::new();
    input.take(len as u64).read_to_end(&mut body)?;
    if body.len() < len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, stream ended after {}", body.len()),
        )));
    }
    Ok(body)
}

pub fn write_string(out: &mut dyn Write, value: &str) -> Result<()> {
    write_bytes(out, value.as_bytes())
}

pub fn read_string(input: &mut dyn Read) -> Result<String> {
    String::from_utf8(read_bytes(input)?)
        .map_err(|e| Error::protocol(format!("string is not valid UTF-8: {e}")))
}
