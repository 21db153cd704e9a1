//! Stable `.cbo` serialization for [`Image`].
//!
//! Design goals:
//! - Portable, explicit encoding: little-endian, fixed-width integers,
//!   8-byte-aligned code section.
//! - Deterministic (canonical) output so `encode -> decode -> encode`
//!   is byte-identical, and compiling the same source twice is too.
//! - No reliance on Rust-specific layouts or `serde` formats.
//!
//! Layout, in order: magic `"CBO1"`, version `{u8 major, u8 minor}`,
//! constant pool, routine table, code section (preceded by its `u32`
//! length and zero padding up to the next 8-byte file offset), export
//! table, debug-line table.

use crate::{Const, Export, Image, LineRecord, Routine, VERSION_MAJOR, VERSION_MINOR};

pub const MAGIC: &[u8; 4] = b"CBO1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    pub message: String,
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.message)
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub message: String,
    pub offset: usize,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error at {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for DecodeError {}

pub fn to_bytes(image: &Image) -> Result<Vec<u8>, EncodeError> {
    let mut enc = Encoder::new();
    enc.write_bytes(MAGIC);
    enc.write_u8(VERSION_MAJOR);
    enc.write_u8(VERSION_MINOR);

    enc.write_len(image.consts.len())?;
    for entry in &image.consts {
        enc.write_const(entry)?;
    }

    enc.write_len(image.routines.len())?;
    for routine in &image.routines {
        enc.write_routine(routine);
    }

    enc.write_len(image.code.len())?;
    enc.pad_to(8);
    enc.write_bytes(&image.code);

    enc.write_len(image.exports.len())?;
    for export in &image.exports {
        enc.write_u32(export.name);
        enc.write_u32(export.routine);
    }

    enc.write_len(image.debug_lines.len())?;
    for record in &image.debug_lines {
        enc.write_u32(record.code_offset);
        enc.write_u32(record.line);
    }

    Ok(enc.finish())
}

pub fn from_bytes(bytes: &[u8]) -> Result<Image, DecodeError> {
    let mut dec = Decoder::new(bytes);
    dec.expect_bytes(MAGIC)?;
    let major = dec.read_u8()?;
    let minor = dec.read_u8()?;
    if major != VERSION_MAJOR {
        return Err(dec.err(format!(
            "unsupported cbo version {major}.{minor} (expected {VERSION_MAJOR}.{VERSION_MINOR})"
        )));
    }

    let const_count = dec.read_len()?;
    let mut consts = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        consts.push(dec.read_const()?);
    }

    let routine_count = dec.read_len()?;
    let mut routines = Vec::with_capacity(routine_count);
    for _ in 0..routine_count {
        routines.push(dec.read_routine()?);
    }

    let code_len = dec.read_len()?;
    dec.skip_padding(8)?;
    let code = dec.read_exact(code_len)?.to_vec();

    let export_count = dec.read_len()?;
    let mut exports = Vec::with_capacity(export_count);
    for _ in 0..export_count {
        exports.push(Export {
            name: dec.read_u32()?,
            routine: dec.read_u32()?,
        });
    }

    let line_count = dec.read_len()?;
    let mut debug_lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        debug_lines.push(LineRecord {
            code_offset: dec.read_u32()?,
            line: dec.read_u32()?,
        });
    }

    if dec.remaining() != 0 {
        return Err(dec.err("trailing bytes".to_string()));
    }

    let image = Image {
        consts,
        routines,
        code,
        exports,
        debug_lines,
    };
    crate::verify::verify_image(&image).map_err(|e| dec.err(e.message))?;
    Ok(image)
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn write_len(&mut self, len: usize) -> Result<(), EncodeError> {
        let len_u32: u32 = len.try_into().map_err(|_| EncodeError {
            message: "length overflow".to_string(),
        })?;
        self.write_u32(len_u32);
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> Result<(), EncodeError> {
        self.write_len(s.len())?;
        self.write_bytes(s.as_bytes());
        Ok(())
    }

    fn pad_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }

    fn write_const(&mut self, entry: &Const) -> Result<(), EncodeError> {
        self.write_u8(entry.tag());
        match entry {
            Const::I64(v) => self.write_i64(*v),
            Const::F64(v) => self.write_f64(*v),
            Const::Str(s) | Const::Ident(s) | Const::Decimal(s) => self.write_string(s)?,
            Const::Bool(b) => self.write_u8(u8::from(*b)),
        }
        Ok(())
    }

    fn write_routine(&mut self, routine: &Routine) {
        self.write_u32(routine.name);
        self.write_u32(routine.code_offset);
        self.write_u32(routine.code_len);
        self.write_u16(routine.local_count);
        self.write_u8(routine.arg_count);
        self.write_u8(routine.flags);
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn err(&self, message: String) -> DecodeError {
        DecodeError {
            message,
            offset: self.pos,
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(self.err(format!("unexpected end of input (wanted {n} bytes)")));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn expect_bytes(&mut self, expected: &[u8]) -> Result<(), DecodeError> {
        let got = self.read_exact(expected.len())?;
        if got != expected {
            return Err(DecodeError {
                message: "bad magic".to_string(),
                offset: 0,
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_exact(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_exact(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.read_exact(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.read_exact(8)?;
        Ok(f64::from_bits(u64::from_le_bytes(b.try_into().expect("8 bytes"))))
    }

    fn read_len(&mut self) -> Result<usize, DecodeError> {
        Ok(self.read_u32()? as usize)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_len()?;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.err("invalid utf-8".to_string()))
    }

    fn skip_padding(&mut self, align: usize) -> Result<(), DecodeError> {
        while self.pos % align != 0 {
            let byte = self.read_u8()?;
            if byte != 0 {
                return Err(self.err("nonzero padding byte".to_string()));
            }
        }
        Ok(())
    }

    fn read_const(&mut self) -> Result<Const, DecodeError> {
        let tag = self.read_u8()?;
        Ok(match tag {
            0 => Const::I64(self.read_i64()?),
            1 => Const::F64(self.read_f64()?),
            2 => Const::Str(self.read_string()?),
            3 => Const::Ident(self.read_string()?),
            4 => Const::Decimal(self.read_string()?),
            5 => Const::Bool(self.read_u8()? != 0),
            other => return Err(self.err(format!("unknown constant tag {other}"))),
        })
    }

    fn read_routine(&mut self) -> Result<Routine, DecodeError> {
        Ok(Routine {
            name: self.read_u32()?,
            code_offset: self.read_u32()?,
            code_len: self.read_u32()?,
            local_count: self.read_u16()?,
            arg_count: self.read_u8()?,
            flags: self.read_u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{pack_regs, Op};

    fn sample_image() -> Image {
        let mut image = Image::new();
        let name = image.intern_ident("main");
        let forty_two = image.intern_const(Const::I64(42));

        let mut code = Vec::new();
        code.push(Op::LoadConst as u8);
        pack_regs(&mut code, &[0]);
        code.extend_from_slice(&forty_two.to_le_bytes());
        code.push(Op::Ret as u8);
        pack_regs(&mut code, &[0]);

        image.routines.push(Routine {
            name,
            code_offset: 0,
            code_len: code.len() as u32,
            local_count: 0,
            arg_count: 0,
            flags: 0,
        });
        image.code = code;
        image.exports.push(Export { name, routine: 0 });
        image.debug_lines.push(LineRecord {
            code_offset: 0,
            line: 1,
        });
        image
    }

    #[test]
    fn encode_decode_round_trips() {
        let image = sample_image();
        let bytes = to_bytes(&image).expect("encode");
        let decoded = from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, image);
    }

    #[test]
    fn encode_is_deterministic() {
        let image = sample_image();
        assert_eq!(to_bytes(&image).unwrap(), to_bytes(&image).unwrap());
    }

    #[test]
    fn code_section_is_eight_byte_aligned() {
        let image = sample_image();
        let bytes = to_bytes(&image).expect("encode");
        // Header (6) + pool + routine table + code length field, then
        // padding: the code section itself must start on an 8-byte
        // file offset.
        let mut offset = 6;
        // Constant pool: count + entries.
        offset += 4;
        for entry in &image.consts {
            offset += 1 + match entry {
                Const::I64(_) | Const::F64(_) => 8,
                Const::Str(s) | Const::Ident(s) | Const::Decimal(s) => 4 + s.len(),
                Const::Bool(_) => 1,
            };
        }
        offset += 4 + image.routines.len() * 16;
        offset += 4; // code length field
        let aligned = offset.next_multiple_of(8);
        assert_eq!(&bytes[aligned..aligned + image.code.len()], &image.code[..]);
    }

    #[test]
    fn rejects_bad_magic() {
        let image = sample_image();
        let mut bytes = to_bytes(&image).expect("encode");
        bytes[0] = b'X';
        assert!(from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let image = sample_image();
        let mut bytes = to_bytes(&image).expect("encode");
        bytes.push(0);
        assert!(from_bytes(&bytes).is_err());
    }

    #[test]
    fn empty_image_is_header_only() {
        let image = Image::new();
        let bytes = to_bytes(&image).expect("encode");
        let decoded = from_bytes(&bytes).expect("decode");
        assert!(decoded.routines.is_empty());
        assert!(decoded.consts.is_empty());
        assert!(decoded.code.is_empty());
    }
}
