//! Ogg page reader.

use std::io::{self, Read};

use super::page::{page_checksum, Page};

/// Magic bytes for an Ogg page header.
const OGG_MAGIC: [u8; 4] = *b"OggS";

const PAGE_HEADER_SIZE: usize = 27;

/// Reads Ogg pages from a byte stream.
///
/// Resynchronizes on the `OggS` capture pattern, so a stream that starts
/// mid-page (or carries junk between pages) loses only the damaged page.
/// Pages with a bad CRC are rejected as invalid data.
pub struct PageReader<R: Read> {
    reader: R,
}

impl<R: Read> PageReader<R> {
    /// Creates a page reader over `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next page. Returns `Ok(None)` at end of stream.
    pub fn read_page(&mut self) -> io::Result<Option<Page>> {
        let mut header = [0u8; PAGE_HEADER_SIZE];

        // Sync to the capture pattern, shifting one byte at a time past
        // anything that is not a page boundary.
        if !self.read_full(&mut header[..4])? {
            return Ok(None);
        }
        while header[..4] != OGG_MAGIC {
            header.copy_within(1..4, 0);
            if !self.read_full(&mut header[3..4])? {
                return Ok(None);
            }
        }

        if !self.read_full(&mut header[4..])? {
            return Ok(None);
        }

        let version = header[4];
        if version != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported Ogg page version",
            ));
        }

        let header_type = header[5];
        let granule_position = i64::from_le_bytes(header[6..14].try_into().unwrap());
        let serial = u32::from_le_bytes(header[14..18].try_into().unwrap());
        let sequence = u32::from_le_bytes(header[18..22].try_into().unwrap());
        let checksum = u32::from_le_bytes(header[22..26].try_into().unwrap());
        let n_segments = header[26] as usize;

        let mut segment_table = vec![0u8; n_segments];
        if !self.read_full(&mut segment_table)? {
            return Ok(None);
        }

        let body_size: usize = segment_table.iter().map(|&s| s as usize).sum();
        let mut body = vec![0u8; body_size];
        if !self.read_full(&mut body)? {
            return Ok(None);
        }

        if page_checksum(&header, &segment_table, &body) != checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Ogg page checksum mismatch",
            ));
        }

        Ok(Some(Page {
            version,
            header_type,
            granule_position,
            serial,
            sequence,
            checksum,
            segment_table,
            body,
        }))
    }

    /// Returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads exactly `buf.len()` bytes; `Ok(false)` on end of stream.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => return Ok(false),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::write_page;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_single_page() {
        let mut data = Vec::new();
        write_page(&mut data, 0x02, 0, 7, 0, &[b"hello".as_ref()]);

        let mut reader = PageReader::new(Cursor::new(data));
        let page = reader.read_page().unwrap().unwrap();
        assert!(page.is_bos());
        assert_eq!(page.serial, 7);
        assert_eq!(page.body, b"hello");
        assert!(reader.read_page().unwrap().is_none());
    }

    #[test]
    fn test_resync_past_garbage() {
        let mut data = vec![0xAA, 0xBB, 0xCC];
        write_page(&mut data, 0, 960, 7, 1, &[b"frame".as_ref()]);

        let mut reader = PageReader::new(Cursor::new(data));
        let page = reader.read_page().unwrap().unwrap();
        assert_eq!(page.granule_position, 960);
        assert_eq!(page.body, b"frame");
    }

    #[test]
    fn test_checksum_rejected() {
        let mut data = Vec::new();
        write_page(&mut data, 0, 0, 7, 0, &[b"hello".as_ref()]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let mut reader = PageReader::new(Cursor::new(data));
        assert!(reader.read_page().is_err());
    }

    #[test]
    fn test_empty_input() {
        let mut reader = PageReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.read_page().unwrap().is_none());
    }

    #[test]
    fn test_truncated_page_is_eof() {
        let mut data = Vec::new();
        write_page(&mut data, 0, 0, 7, 0, &[b"hello".as_ref()]);
        data.truncate(data.len() - 2);

        let mut reader = PageReader::new(Cursor::new(data));
        assert!(reader.read_page().unwrap().is_none());
    }
}
