use bytes::Bytes;
use futures_core::Stream;
use std::io::{self, Read, Seek, SeekFrom};
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes handed to a blob store
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Readable, rewindable source of a candidate's content
pub trait SourceStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> SourceStream for T {}

/// Owned source stream
pub type BoxedSource = Box<dyn SourceStream>;

/// Unique identifier for a batch, used to correlate log lines
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchId(pub String);

impl BatchId {
    /// Generate a new random batch ID
    pub fn new() -> Self {
        Self(format!("batch_{}", Uuid::new_v4().simple()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Turn an owned source into a byte stream, reading from offset 0 to the end
/// exactly once. The source is dropped when the stream finishes or is dropped.
///
/// Reads run on tokio's blocking pool, so the stream must be polled inside a
/// tokio runtime.
pub fn source_to_stream(source: BoxedSource, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let stream = async_stream::stream! {
        let mut source = source;
        let mut rewind = true;
        loop {
            let read = tokio::task::spawn_blocking(move || read_chunk(source, chunk_size, rewind));
            let (returned, chunk) = match read.await {
                Ok(done) => done,
                Err(e) => {
                    yield Err(io::Error::new(io::ErrorKind::Other, e));
                    return;
                }
            };
            source = returned;
            rewind = false;

            match chunk {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => yield Ok(chunk),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    };
    Box::pin(stream)
}

/// Read up to `chunk_size` bytes, seeking to the start first when `rewind`.
/// An empty chunk means end of input.
fn read_chunk(
    mut source: BoxedSource,
    chunk_size: usize,
    rewind: bool,
) -> (BoxedSource, io::Result<Bytes>) {
    if rewind {
        if let Err(e) = source.seek(SeekFrom::Start(0)) {
            return (source, Err(e));
        }
    }
    let mut buf = vec![0u8; chunk_size];
    loop {
        match source.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return (source, Ok(Bytes::from(buf)));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (source, Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_source_to_stream_reads_from_start() {
        let mut cursor = Cursor::new(b"hello world".to_vec());
        cursor.seek(SeekFrom::Start(6)).unwrap();

        let mut stream = source_to_stream(Box::new(cursor), 4);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(out, b"hello world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_source_to_stream_reads_file_off_the_runtime() {
        let path = std::env::temp_dir().join(format!("{}.bin", BatchId::new()));
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut stream = source_to_stream(Box::new(file), 4096);
        let mut chunks = 0;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks += 1;
            out.extend_from_slice(&chunk.unwrap());
        }
        std::fs::remove_file(&path).unwrap();

        assert_eq!(chunks, 3);
        assert_eq!(out, data);
    }

    #[test]
    fn test_batch_ids_are_distinct() {
        assert_ne!(BatchId::new(), BatchId::new());
        assert!(BatchId::new().as_str().starts_with("batch_"));
    }
}
