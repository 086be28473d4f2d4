//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read, Seek, SeekFrom};

pub trait ReadExt {
    /// Appends up to `read_len` bytes to `vec`, stopping early only at EOF.
    ///
    /// Unlike `read_exact`, running into EOF is not an error; the caller compares the resulting
    /// length against what it asked for. The space is reserved up front, so a huge `read_len`
    /// fails with [io::ErrorKind::OutOfMemory] instead of aborting.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        vec.try_reserve_exact(read_len)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        self.take(read_len as u64).read_to_end(vec)?;
        Ok(())
    }
}

pub trait SeekReadExt {
    /// Seek to the absolute position `pos` and fill `buf` completely.
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl<T: Read + Seek> SeekReadExt for T {
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        self.read_exact(buf)
    }
}

/// Round `value` up to the next multiple of `align`, which must be a power of two.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);

    // EOF stops the read short without an error
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_read_exact_at() -> io::Result<()> {
    let mut cursor = io::Cursor::new((0u8..32).collect::<Vec<_>>());
    let mut buf = [0u8; 4];
    cursor.read_exact_at(10, &mut buf)?;
    assert_eq!(buf, [10, 11, 12, 13]);
    assert_eq!(cursor.stream_position()?, 14);

    let short = cursor.read_exact_at(30, &mut buf);
    assert_eq!(
        short.map_err(|e| e.kind()),
        Err(io::ErrorKind::UnexpectedEof)
    );
    Ok(())
}

#[test]
fn test_align_up() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(2049, 2048), 4096);
}
