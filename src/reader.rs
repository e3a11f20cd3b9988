use anyhow::{ensure, Result};

use std::io::{BufRead, Read, Write};

use crate::TEXTLEN;

/// Fixed-width little-endian field reads shared by every inter-phase
/// file codec.
pub trait RecordRead: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut data = [0; 1];
        self.read_exact(&mut data)?;
        Ok(data[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(bincode::deserialize_from(&mut *self)?)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(bincode::deserialize_from(&mut *self)?)
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(bincode::deserialize_from(&mut *self)?)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(bincode::deserialize_from(&mut *self)?)
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(bincode::deserialize_from(&mut *self)?)
    }
}
impl<R: Read> RecordRead for R {}

/// String reads that need buffering to find the terminator.
pub trait RecordBufRead: RecordRead + BufRead {
    /// Read a NUL-terminated string of at most TEXTLEN bytes.
    fn read_cstr(&mut self) -> Result<String> {
        let mut buf = vec![];
        self.read_until(b'\x00', &mut buf)?;
        ensure!(buf.pop() == Some(b'\x00'), "Unexpected EoF in string");
        ensure!(buf.len() <= TEXTLEN, "String in file too long");
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
impl<R: RecordRead + BufRead> RecordBufRead for R {}

/// Matching fixed-width little-endian writes.
pub trait RecordWrite: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        Ok(bincode::serialize_into(&mut *self, &v)?)
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(bincode::serialize_into(&mut *self, &v)?)
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(bincode::serialize_into(&mut *self, &v)?)
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(bincode::serialize_into(&mut *self, &v)?)
    }

    fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(bincode::serialize_into(&mut *self, &v)?)
    }

    fn write_cstr(&mut self, s: &str) -> Result<()> {
        ensure!(s.len() <= TEXTLEN, "String too long to serialise");
        self.write_all(s.as_bytes())?;
        self.write_all(&[0])?;
        Ok(())
    }
}
impl<W: Write> RecordWrite for W {}
