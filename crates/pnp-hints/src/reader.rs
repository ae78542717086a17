//! Aligned reads over a hints buffer

use crate::HintsError;

const INT_SIZE: usize = std::mem::size_of::<i32>();

/// Round `pos` up to the next multiple of the integer width.
pub fn align_int(pos: usize) -> usize {
    (pos + INT_SIZE - 1) & !(INT_SIZE - 1)
}

/// Cursor over a hints buffer.
///
/// Alignment is measured from the start of the buffer, which is the start of
/// the file.
#[derive(Debug, Clone)]
pub struct HintsReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HintsReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read one native-endian `int` at the next aligned offset.
    pub fn read_int(&mut self) -> Result<i32, HintsError> {
        let start = align_int(self.pos);
        let end = start + INT_SIZE;
        if end > self.buf.len() {
            return Err(HintsError::Truncated { offset: start });
        }
        let mut bytes = [0u8; INT_SIZE];
        bytes.copy_from_slice(&self.buf[start..end]);
        self.pos = end;
        Ok(i32::from_ne_bytes(bytes))
    }

    /// Read a length-prefixed string (`u8` length, raw bytes, no NUL).
    pub fn read_str(&mut self) -> Result<&'a [u8], HintsError> {
        let Some(&len) = self.buf.get(self.pos) else {
            return Err(HintsError::Truncated { offset: self.pos });
        };
        let start = self.pos + 1;
        let end = start + usize::from(len);
        if end > self.buf.len() {
            return Err(HintsError::Truncated { offset: self.pos });
        }
        self.pos = end;
        Ok(&self.buf[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_int() {
        assert_eq!(align_int(0), 0);
        assert_eq!(align_int(1), 4);
        assert_eq!(align_int(4), 4);
        assert_eq!(align_int(7), 8);
    }

    #[test]
    fn test_read_int_skips_padding() {
        let mut buf = vec![3u8, b'p', b'c', b'i'];
        buf.extend_from_slice(&42i32.to_ne_bytes());
        let mut r = HintsReader::new(&buf);
        assert_eq!(r.read_str().unwrap(), b"pci");
        assert_eq!(r.position(), 4);
        assert_eq!(r.read_int().unwrap(), 42);
        assert_eq!(r.position(), 8);
    }

    #[test]
    fn test_read_int_after_unaligned_string() {
        let mut buf = vec![1u8, b'x', 0, 0];
        buf.extend_from_slice(&(-7i32).to_ne_bytes());
        let mut r = HintsReader::new(&buf);
        r.read_str().unwrap();
        assert_eq!(r.position(), 2);
        assert_eq!(r.read_int().unwrap(), -7);
    }

    #[test]
    fn test_truncated_reads() {
        let buf = [0u8, 0, 0];
        assert!(matches!(
            HintsReader::new(&buf).read_int(),
            Err(HintsError::Truncated { offset: 0 })
        ));

        let buf = [5u8, b'a', b'b'];
        assert!(matches!(
            HintsReader::new(&buf).read_str(),
            Err(HintsError::Truncated { offset: 0 })
        ));

        assert!(HintsReader::new(&[]).read_str().is_err());
    }

    #[test]
    fn test_empty_string() {
        let buf = [0u8];
        let mut r = HintsReader::new(&buf);
        assert_eq!(r.read_str().unwrap(), b"");
        assert_eq!(r.position(), 1);
    }
}
