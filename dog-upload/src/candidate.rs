use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use md5::Context as Md5Context;
use sha1::{Digest, Sha1};

use crate::normalizer::{read_dimensions, ImageDimensions};
use crate::resolver::extension_of;
use crate::{BoxedSource, SourceStream, UploadError, UploadResult};

const HASH_BUFFER: usize = 64 * 1024;

/// Digest algorithms a candidate can compute over its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
}

/// One incoming file as handed over by the request layer (a multipart field,
/// a file on disk, a test fixture).
pub trait RawUpload {
    /// File name as supplied by the client
    fn file_name(&self) -> &str;

    /// Declared length in bytes
    fn content_length(&self) -> u64;

    /// Declared content type
    fn content_type(&self) -> &str;

    /// Hand over the content. `None` when the input carried no body.
    fn into_stream(self) -> Option<BoxedSource>
    where
        Self: Sized;
}

/// Plain [`RawUpload`] implementation over an in-memory buffer or a file
pub struct RawFile {
    file_name: String,
    content_type: String,
    content_length: u64,
    stream: Option<BoxedSource>,
}

impl RawFile {
    /// Raw input over a byte buffer; the declared length is the buffer length
    pub fn from_bytes<N, C>(file_name: N, content_type: C, data: Vec<u8>) -> Self
    where
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            content_length: data.len() as u64,
            stream: Some(Box::new(Cursor::new(data))),
        }
    }

    /// Raw input over a file on disk, named after its final path component
    pub fn open<P: AsRef<Path>, C: Into<String>>(path: P, content_type: C) -> UploadResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let content_length = file.metadata()?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::invalid(format!("{} has no file name", path.display())))?;

        Ok(Self {
            file_name,
            content_type: content_type.into(),
            content_length,
            stream: Some(Box::new(file)),
        })
    }

    /// Raw input that arrived without a body
    pub fn empty<N: Into<String>, C: Into<String>>(file_name: N, content_type: C) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            content_length: 0,
            stream: None,
        }
    }

    /// Override the declared length
    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.content_length = length;
        self
    }
}

impl RawUpload for RawFile {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn content_length(&self) -> u64 {
        self.content_length
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn into_stream(self) -> Option<BoxedSource> {
        self.stream
    }
}

/// A file staged for upload.
///
/// The save name is owned by the [`UploadBatch`](crate::UploadBatch) once the
/// candidate is inserted. Digests are computed lazily and cached; computing one
/// reads the whole stream and seeks it back to offset 0.
pub struct UploadCandidate {
    stream: Option<BoxedSource>,
    original_name: String,
    requested_name: String,
    save_name: String,
    size_bytes: u64,
    content_type: String,
    extension: String,
    image: Option<ImageDimensions>,
    md5: Option<[u8; 16]>,
    sha1: Option<[u8; 20]>,
}

impl UploadCandidate {
    /// Create a candidate.
    ///
    /// Fails with [`UploadError::InvalidInput`] when `stream` is `None` or when
    /// `content_length` does not match the length of the stream.
    pub fn new<N, C, S>(
        stream: Option<BoxedSource>,
        original_name: N,
        content_length: u64,
        content_type: C,
        save_name: S,
    ) -> UploadResult<Self>
    where
        N: Into<String>,
        C: Into<String>,
        S: Into<String>,
    {
        let original_name = original_name.into();
        let mut stream = stream.ok_or_else(|| {
            UploadError::invalid(format!("{} has no content stream", original_name))
        })?;

        let measured = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;
        if measured != content_length {
            return Err(UploadError::invalid(format!(
                "{} declares {} bytes but its stream holds {}",
                original_name, content_length, measured
            )));
        }

        let save_name = save_name.into();
        let extension = extension_of(&original_name).to_string();

        Ok(Self {
            stream: Some(stream),
            requested_name: save_name.clone(),
            save_name,
            size_bytes: measured,
            content_type: content_type.into(),
            extension,
            original_name,
            image: None,
            md5: None,
            sha1: None,
        })
    }

    /// Build a candidate from a raw input
    pub fn from_raw<R: RawUpload>(raw: R, save_name: String) -> UploadResult<Self> {
        let original_name = raw.file_name().to_string();
        let content_length = raw.content_length();
        let content_type = raw.content_type().to_string();
        Self::new(raw.into_stream(), original_name, content_length, content_type, save_name)
    }

    /// Build a candidate from a raw input and attach its image dimensions.
    /// Fails with [`UploadError::Image`] when the content is not a decodable image.
    pub fn image_from_raw<R: RawUpload>(raw: R, save_name: String) -> UploadResult<Self> {
        let mut candidate = Self::from_raw(raw, save_name)?;
        candidate.attach_image_dimensions()?;
        Ok(candidate)
    }

    /// Decode the image header of the stream and remember width and height
    pub fn attach_image_dimensions(&mut self) -> UploadResult<&ImageDimensions> {
        let original_name = &self.original_name;
        let stream = self.stream.as_mut().ok_or_else(|| {
            UploadError::invalid(format!("{} stream was already released", original_name))
        })?;
        let dimensions = read_dimensions(&mut **stream)?;
        Ok(self.image.insert(dimensions))
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn save_name(&self) -> &str {
        &self.save_name
    }

    /// Save name asked for before any conflict resolution
    pub fn requested_name(&self) -> &str {
        &self.requested_name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Extension of the original name, including the dot (may be empty)
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Image dimensions, when the candidate was built as an image
    pub fn image(&self) -> Option<&ImageDimensions> {
        self.image.as_ref()
    }

    pub(crate) fn set_save_name(&mut self, name: String) {
        self.save_name = name;
    }

    /// True iff the candidate is at most `max_bytes` long
    pub fn within_size(&self, max_bytes: u64) -> bool {
        size_within(self.size_bytes, max_bytes)
    }

    /// True when `allowed` is empty, or when the content type contains every
    /// entry of `allowed` as a substring. Entries are combined with AND, so a
    /// list like `["image/png", "image/jpeg"]` matches nothing in practice.
    pub fn has_content_type<S: AsRef<str>>(&self, allowed: &[S]) -> bool {
        content_type_matches(&self.content_type, allowed)
    }

    /// False when `allowed` is empty; otherwise true only if the extension
    /// equals every entry (entries include the dot, e.g. `".png"`).
    pub fn has_extension<S: AsRef<str>>(&self, allowed: &[S]) -> bool {
        if allowed.is_empty() {
            return false;
        }
        allowed.iter().all(|ext| self.extension == ext.as_ref())
    }

    /// Digest of the full content.
    ///
    /// The first call per algorithm reads the stream from offset 0 to the end,
    /// caches the result and seeks the stream back to 0. Later calls return the
    /// cached bytes and leave the stream where it is: a caller that reads the
    /// stream between calls must reposition it itself.
    pub fn digest(&mut self, algorithm: DigestAlgorithm) -> UploadResult<&[u8]> {
        match algorithm {
            DigestAlgorithm::Md5 => Ok(self.md5()?.as_slice()),
            DigestAlgorithm::Sha1 => Ok(self.sha1()?.as_slice()),
        }
    }

    /// Lowercase hex form of [`digest`](Self::digest)
    pub fn digest_hex(&mut self, algorithm: DigestAlgorithm) -> UploadResult<String> {
        self.digest(algorithm).map(hex::encode)
    }

    /// MD5 of the content, computed once
    pub fn md5(&mut self) -> UploadResult<&[u8; 16]> {
        let digest = match self.md5 {
            Some(digest) => digest,
            None => {
                let mut context = Md5Context::new();
                self.hash_stream(|chunk| context.consume(chunk))?;
                context.compute().0
            }
        };
        Ok(self.md5.insert(digest))
    }

    /// SHA-1 of the content, computed once
    pub fn sha1(&mut self) -> UploadResult<&[u8; 20]> {
        let digest = match self.sha1 {
            Some(digest) => digest,
            None => {
                let mut hasher = Sha1::new();
                self.hash_stream(|chunk| hasher.update(chunk))?;
                hasher.finalize().into()
            }
        };
        Ok(self.sha1.insert(digest))
    }

    /// MD5 if it was already computed
    pub fn cached_md5(&self) -> Option<[u8; 16]> {
        self.md5
    }

    fn hash_stream<F: FnMut(&[u8])>(&mut self, mut update: F) -> UploadResult<()> {
        let original_name = &self.original_name;
        let stream = self.stream.as_mut().ok_or_else(|| {
            UploadError::invalid(format!("{} stream was already released", original_name))
        })?;

        stream.seek(SeekFrom::Start(0))?;
        let mut buffer = vec![0u8; HASH_BUFFER];
        loop {
            let read = match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            update(&buffer[..read]);
        }
        stream.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Live stream, if it has not been released
    pub fn stream_mut(&mut self) -> Option<&mut (dyn SourceStream + 'static)> {
        self.stream.as_deref_mut()
    }

    /// Release the stream to the caller. Afterwards only cached digests remain available.
    pub fn take_stream(&mut self) -> Option<BoxedSource> {
        self.stream.take()
    }

    /// Whether the stream has been released
    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }
}

impl std::fmt::Debug for UploadCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCandidate")
            .field("original_name", &self.original_name)
            .field("save_name", &self.save_name)
            .field("size_bytes", &self.size_bytes)
            .field("content_type", &self.content_type)
            .field("image", &self.image)
            .field("released", &self.stream.is_none())
            .finish()
    }
}

pub(crate) fn size_within(size_bytes: u64, max_bytes: u64) -> bool {
    size_bytes <= max_bytes
}

pub(crate) fn content_type_matches<S: AsRef<str>>(content_type: &str, allowed: &[S]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().all(|mime| content_type.contains(mime.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_candidate(name: &str, body: &[u8]) -> UploadCandidate {
        let raw = RawFile::from_bytes(name, "text/plain", body.to_vec());
        UploadCandidate::from_raw(raw, name.to_string()).unwrap()
    }

    #[test]
    fn test_missing_stream_is_rejected() {
        let raw = RawFile::empty("a.txt", "text/plain");
        let err = UploadCandidate::from_raw(raw, "a.txt".to_string()).unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput { .. }));
    }

    #[test]
    fn test_declared_length_must_match() {
        let raw =
            RawFile::from_bytes("a.txt", "text/plain", b"abc".to_vec()).with_declared_length(10);
        let err = UploadCandidate::from_raw(raw, "a.txt".to_string()).unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput { .. }));
    }

    #[test]
    fn test_metadata() {
        let candidate = text_candidate("notes.final.txt", b"hello");
        assert_eq!(candidate.size_bytes(), 5);
        assert_eq!(candidate.extension(), ".txt");
        assert_eq!(candidate.save_name(), "notes.final.txt");
        assert_eq!(candidate.requested_name(), "notes.final.txt");
        assert!(candidate.image().is_none());

        let bare = text_candidate("Makefile", b"all:");
        assert_eq!(bare.extension(), "");
    }

    #[test]
    fn test_within_size() {
        let candidate = text_candidate("a.txt", b"12345");
        assert!(candidate.within_size(5));
        assert!(candidate.within_size(6));
        assert!(!candidate.within_size(4));
    }

    #[test]
    fn test_content_type_and_extension_asymmetry() {
        let candidate = text_candidate("a.txt", b"x");
        let none: [&str; 0] = [];
        assert!(candidate.has_content_type(&none));
        assert!(!candidate.has_extension(&none));
    }

    #[test]
    fn test_content_type_is_conjunctive_substring_match() {
        let candidate = UploadCandidate::from_raw(
            RawFile::from_bytes("a.png", "image/png", vec![1, 2, 3]),
            "a.png".to_string(),
        )
        .unwrap();

        assert!(candidate.has_content_type(&["image/"]));
        assert!(candidate.has_content_type(&["image", "png"]));
        // Every entry must match, so a typical allow-list of alternatives fails.
        assert!(!candidate.has_content_type(&["image/png", "image/jpeg"]));
        assert!(!candidate.has_content_type(&["text/"]));
    }

    #[test]
    fn test_has_extension() {
        let candidate = text_candidate("a.txt", b"x");
        assert!(candidate.has_extension(&[".txt"]));
        assert!(!candidate.has_extension(&["txt"]));
        assert!(!candidate.has_extension(&[".TXT"]));
        assert!(!candidate.has_extension(&[".txt", ".md"]));
    }

    #[test]
    fn test_md5_is_deterministic_and_rewinds() {
        let mut candidate = text_candidate("a.txt", b"The quick brown fox");

        let first = *candidate.md5().unwrap();
        let second = *candidate.md5().unwrap();
        assert_eq!(first, second);
        assert_eq!(hex::encode(first), format!("{:x}", md5::compute(b"The quick brown fox")));

        let mut content = Vec::new();
        candidate.stream_mut().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"The quick brown fox");
    }

    #[test]
    fn test_sha1_digest() {
        let mut candidate = text_candidate("a.txt", b"abc");
        assert_eq!(
            candidate.digest_hex(DigestAlgorithm::Sha1).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(candidate.digest(DigestAlgorithm::Sha1).unwrap().len(), 20);
    }

    #[test]
    fn test_cache_hit_leaves_stream_position_alone() {
        let mut candidate = text_candidate("a.txt", b"abcdef");
        let digest = candidate.digest(DigestAlgorithm::Md5).unwrap().to_vec();

        let stream = candidate.stream_mut().unwrap();
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).unwrap();

        assert_eq!(candidate.digest(DigestAlgorithm::Md5).unwrap(), digest.as_slice());
        let position = candidate.stream_mut().unwrap().stream_position().unwrap();
        assert_eq!(position, 2);
    }

    #[test]
    fn test_digest_starts_from_offset_zero() {
        let mut candidate = text_candidate("a.txt", b"abcdef");
        candidate.stream_mut().unwrap().seek(SeekFrom::Start(4)).unwrap();

        let hex = candidate.digest_hex(DigestAlgorithm::Md5).unwrap();
        assert_eq!(hex, format!("{:x}", md5::compute(b"abcdef")));
    }

    #[test]
    fn test_released_stream_keeps_cached_digest() {
        let mut candidate = text_candidate("a.txt", b"abc");
        candidate.md5().unwrap();
        assert!(candidate.take_stream().is_some());
        assert!(candidate.is_released());

        assert!(candidate.md5().is_ok());
        assert!(matches!(candidate.sha1(), Err(UploadError::InvalidInput { .. })));
    }

    #[test]
    fn test_open_file() {
        let path = std::env::temp_dir().join(format!("dog-upload-{}.bin", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"on disk").unwrap();

        let raw = RawFile::open(&path, "application/octet-stream").unwrap();
        assert_eq!(raw.content_length(), 7);
        let candidate = UploadCandidate::from_raw(raw, "copy.bin".to_string()).unwrap();
        assert_eq!(candidate.extension(), ".bin");
        assert_eq!(candidate.save_name(), "copy.bin");

        std::fs::remove_file(&path).unwrap();
    }
}
