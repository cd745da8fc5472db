use std::io::{Cursor, Error, ErrorKind, Read, Result};

/// Big-endian reader over packed encryption side metadata.
#[derive(Clone, Default)]
pub struct Reader {
    inner: Cursor<Vec<u8>>,
}

impl Reader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Cursor::new(data.into()),
        }
    }

    pub fn has_more_data(&self) -> bool {
        self.inner.position() < self.get_length()
    }

    pub fn get_length(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn get_position(&self) -> u64 {
        self.inner.position()
    }

    pub fn remaining(&self) -> u64 {
        self.get_length().saturating_sub(self.get_position())
    }

    pub fn skip(&mut self, bytes: u64) -> Result<()> {
        let position = self.get_position() + bytes;

        if position > self.get_length() {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "Reader skips past the end of data.",
            ));
        }

        self.inner.set_position(position);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_bytes(&mut self, bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; bytes];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian() {
        let mut reader = Reader::new(vec![0, 1, 0, 0, 0, 2, 9]);
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(reader.read_u32().unwrap(), 2);
        assert_eq!(reader.remaining(), 1);
        assert!(reader.has_more_data());
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert!(!reader.has_more_data());
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_skip_past_end() {
        let mut reader = Reader::new(vec![0; 4]);
        assert!(reader.skip(4).is_ok());
        assert!(reader.skip(1).is_err());
    }
}
