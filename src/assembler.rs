use std::collections::BTreeMap;

use bytes::Bytes;

/// Reassembles out-of-order byte ranges into an ordered prefix.
///
/// Duplicate bytes are discarded and overlapping ranges are trimmed against
/// whatever arrived first, so each byte is buffered at most once.
#[derive(Debug, Default)]
pub struct Assembler {
    data: BTreeMap<u64, Bytes>,
    /// Offset of the first byte not yet handed to the consumer.
    offset: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset one past the last byte read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether any bytes are buffered, contiguous or not.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn insert(&mut self, mut offset: u64, mut data: Bytes) {
        if offset < self.offset {
            let diff = self.offset - offset;
            if diff >= data.len() as u64 {
                return;
            }
            data = data.split_off(diff as usize);
            offset = self.offset;
        }
        while !data.is_empty() {
            if let Some((&start, chunk)) = self.data.range(..=offset).next_back() {
                let end = start + chunk.len() as u64;
                if end > offset {
                    let diff = end - offset;
                    if diff >= data.len() as u64 {
                        return;
                    }
                    data = data.split_off(diff as usize);
                    offset = end;
                }
            }
            match self.data.range(offset..).next().map(|(&s, _)| s) {
                Some(next) if next < offset + data.len() as u64 => {
                    let len = (next - offset) as usize;
                    if len > 0 {
                        let head = data.split_to(len);
                        self.data.insert(offset, head);
                    }
                    offset = next;
                }
                _ => {
                    self.data.insert(offset, data);
                    return;
                }
            }
        }
    }

    /// Copy contiguous bytes at the current read offset into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let (start, mut chunk) = match self.pop() {
                Some(x) => x,
                None => break,
            };
            let n = chunk.len().min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&chunk[..n]);
            read += n;
            if n < chunk.len() {
                // Put the unread tail back and rewind the frontier over it.
                let rest = chunk.split_off(n);
                self.offset = start + n as u64;
                self.data.insert(self.offset, rest);
            }
        }
        read
    }

    /// Take the next contiguous chunk at the read offset, advancing past it.
    pub fn pop(&mut self) -> Option<(u64, Bytes)> {
        let start = *self.data.keys().next()?;
        if start != self.offset {
            return None;
        }
        let data = self.data.remove(&start).unwrap();
        self.offset = start + data.len() as u64;
        Some((start, data))
    }

    /// Drop all buffered data without moving the read offset.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::from(s.as_bytes().to_vec())
    }

    #[test]
    fn in_order_read() {
        let mut rob = Assembler::new();
        rob.insert(0, bytes("hello"));
        let mut buf = [0; 8];
        assert_eq!(rob.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(rob.offset(), 5);
    }

    #[test]
    fn reorders_and_fills_gap() {
        let mut rob = Assembler::new();
        rob.insert(5, bytes(" world"));
        assert_eq!(rob.pop(), None);
        rob.insert(0, bytes("hello"));
        let mut buf = [0; 16];
        assert_eq!(rob.read(&mut buf), 11);
        assert_eq!(&buf[..11], b"hello world");
    }

    #[test]
    fn duplicates_discarded() {
        let mut rob = Assembler::new();
        rob.insert(0, bytes("hello"));
        rob.insert(0, bytes("HELLO"));
        let mut buf = [0; 8];
        assert_eq!(rob.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        // Already-read bytes are dropped entirely.
        rob.insert(0, bytes("HELLO"));
        assert_eq!(rob.read(&mut buf), 0);
    }

    #[test]
    fn overlap_trimmed_against_existing() {
        let mut rob = Assembler::new();
        rob.insert(2, bytes("cde"));
        rob.insert(0, bytes("abXXXf"));
        let mut buf = [0; 8];
        assert_eq!(rob.read(&mut buf), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn straddling_chunk_is_split() {
        let mut rob = Assembler::new();
        rob.insert(3, bytes("d"));
        rob.insert(0, bytes("abcdef"));
        let mut buf = [0; 8];
        assert_eq!(rob.read(&mut buf), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn partial_read_resumes() {
        let mut rob = Assembler::new();
        rob.insert(0, bytes("abcdef"));
        let mut buf = [0; 4];
        assert_eq!(rob.read(&mut buf), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(rob.read(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
    }
}
