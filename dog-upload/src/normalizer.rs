use std::io::{BufReader, Cursor, SeekFrom};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};

use crate::{SourceStream, UploadError, UploadResult};

/// Content type of everything the normalizer produces
pub const NORMALIZED_CONTENT_TYPE: &str = "image/jpeg";

/// Anything with a pixel width and height
pub trait Sizeable {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Both dimensions are at most `size`
    fn smaller_than(&self, size: u32) -> bool {
        self.width() <= size && self.height() <= size
    }

    /// Width is at most `max_width` and height at most `max_height`
    fn smaller_than_bounds(&self, max_height: u32, max_width: u32) -> bool {
        self.width() <= max_width && self.height() <= max_height
    }

    /// Either dimension is at least `size`
    fn larger_than(&self, size: u32) -> bool {
        self.width() >= size || self.height() >= size
    }

    /// Width is at least `min_width` or height at least `min_height`
    fn larger_than_bounds(&self, min_height: u32, min_width: u32) -> bool {
        self.width() >= min_width || self.height() >= min_height
    }
}

/// Pixel dimensions of a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Sizeable for ImageDimensions {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Box an image is scaled into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleBound {
    /// Same bound for width and height
    Square(u32),
    /// Independent bounds
    Box { max_height: u32, max_width: u32 },
}

impl ScaleBound {
    fn limits(self) -> (u32, u32) {
        match self {
            Self::Square(size) => (size, size),
            Self::Box { max_height, max_width } => (max_width, max_height),
        }
    }
}

/// Size after scaling `width` x `height` into `max_width` x `max_height`.
///
/// `ratio = max(width / max_width, height / max_height)`, each side becomes
/// `floor(side / ratio)`. The aspect ratio is kept and neither side exceeds its
/// bound; images smaller than the bound are scaled up to it.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let x_ratio = f64::from(width) / f64::from(max_width);
    let y_ratio = f64::from(height) / f64::from(max_height);
    let ratio = x_ratio.max(y_ratio);
    if !(ratio > 0.0) || !ratio.is_finite() {
        return (width, height);
    }

    let scaled_width = (f64::from(width) / ratio).floor() as u32;
    let scaled_height = (f64::from(height) / ratio).floor() as u32;
    (scaled_width.max(1), scaled_height.max(1))
}

/// Re-encodes images to a bounded size as JPEG
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    quality: u8,
    filter: FilterType,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self {
            quality: 90,
            filter: FilterType::Lanczos3,
        }
    }
}

impl ImageNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// JPEG quality, clamped to 1-100
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Scale so the longer side matches `max_dimension`
    pub fn scale_to_bound(
        &self,
        source: &mut dyn SourceStream,
        max_dimension: u32,
    ) -> UploadResult<Cursor<Vec<u8>>> {
        self.scale(source, ScaleBound::Square(max_dimension))
    }

    /// Scale into `max_width` x `max_height`
    pub fn scale_to_bounds(
        &self,
        source: &mut dyn SourceStream,
        max_height: u32,
        max_width: u32,
    ) -> UploadResult<Cursor<Vec<u8>>> {
        self.scale(source, ScaleBound::Box { max_height, max_width })
    }

    /// Decode the first frame of `source`, scale it into `bound` and encode it
    /// as JPEG. `source` is rewound before decoding and left at offset 0.
    pub fn scale(
        &self,
        source: &mut dyn SourceStream,
        bound: ScaleBound,
    ) -> UploadResult<Cursor<Vec<u8>>> {
        let (max_width, max_height) = bound.limits();
        if max_width == 0 || max_height == 0 {
            return Err(UploadError::invalid("image bounds must be at least one pixel"));
        }

        let decoded = with_reader(source, |reader| Ok(reader.decode()?))?;
        let (width, height) =
            scaled_dimensions(decoded.width(), decoded.height(), max_width, max_height);
        let resized = decoded.resize_exact(width, height, self.filter);
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

        let mut out = Cursor::new(Vec::new());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, self.quality))?;
        out.set_position(0);
        Ok(out)
    }
}

/// Read width and height from the image header of `stream`
pub(crate) fn read_dimensions(stream: &mut dyn SourceStream) -> UploadResult<ImageDimensions> {
    let (width, height) = with_reader(stream, |reader| Ok(reader.into_dimensions()?))?;
    Ok(ImageDimensions::new(width, height))
}

fn with_reader<S, T, F>(stream: &mut S, f: F) -> UploadResult<T>
where
    S: SourceStream + ?Sized,
    F: FnOnce(ImageReader<BufReader<&mut S>>) -> UploadResult<T>,
{
    stream.seek(SeekFrom::Start(0))?;
    let result = ImageReader::new(BufReader::new(&mut *stream))
        .with_guessed_format()
        .map_err(UploadError::from)
        .and_then(f);
    stream.seek(SeekFrom::Start(0))?;
    result
}
