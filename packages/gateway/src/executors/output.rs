// ABOUTME: Output capture capped at a byte limit
// ABOUTME: Keeps draining past the cap so a chatty child never blocks on a full pipe

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(8 * 1024)),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Decode as UTF-8, dropping a multi-byte character split by the cap
    pub fn into_string(self) -> (String, bool) {
        let bytes = match std::str::from_utf8(&self.buf) {
            Ok(_) => &self.buf[..],
            Err(err) if err.error_len().is_none() => &self.buf[..err.valid_up_to()],
            Err(_) => &self.buf[..],
        };
        (String::from_utf8_lossy(bytes).into_owned(), self.truncated)
    }
}

/// Read `reader` to EOF, keeping at most `cap` bytes
pub async fn drain<R>(mut reader: R, cap: usize) -> std::io::Result<CappedBuffer>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(cap);
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.push(&chunk[..read]);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_to_exactly_the_cap() {
        let mut buffer = CappedBuffer::new(10);
        buffer.push(b"hello ");
        buffer.push(b"world, again");
        assert_eq!(buffer.len(), 10);
        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string(), ("hello worl".to_string(), true));
    }

    #[test]
    fn test_exact_fit_is_not_truncated() {
        let mut buffer = CappedBuffer::new(5);
        buffer.push(b"12345");
        buffer.push(b"");
        assert_eq!(buffer.into_string(), ("12345".to_string(), false));
    }

    #[test]
    fn test_split_multibyte_character_is_dropped() {
        let mut buffer = CappedBuffer::new(4);
        buffer.push("abé".as_bytes());
        buffer.push("z".as_bytes());
        assert_eq!(buffer.into_string(), ("abé".to_string(), true));

        let mut split = CappedBuffer::new(3);
        split.push("abé".as_bytes());
        assert_eq!(split.into_string(), ("ab".to_string(), true));
    }

    #[tokio::test]
    async fn test_drain_reads_past_cap() {
        let data = vec![b'x'; 100_000];
        let buffer = drain(&data[..], 1_000).await.unwrap();
        assert_eq!(buffer.len(), 1_000);
        assert!(buffer.is_truncated());
    }
}
