//! Image discovery and encoding.
//!
//! Turns an image file into the `data:<mime>;base64,...` URL sent to the
//! endpoint. Large images are downscaled and re-encoded as JPEG to fit the
//! configured size budget; small ones are sent as-is.

use crate::cache::{EncodeParams, PreprocessCache};
use crate::config::BatchConfig;
use crate::error::Result;
use crate::types::WorkItem;
use crate::PipelineError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extensions treated as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// Files above this size are always re-encoded when compression is enabled.
const COMPRESSION_THRESHOLD_BYTES: u64 = 512 * 1024;

/// Images above this many pixels use the cheaper filter and lower quality.
const LARGE_IMAGE_PIXELS: u64 = 4_000_000;

const MIN_JPEG_QUALITY: u8 = 30;

/// List the supported images directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(PipelineError::Input(format!(
            "input directory does not exist: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(PipelineError::Input(format!(
            "not a directory: {}",
            dir.display()
        )));
    }

    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }

    if images.is_empty() {
        return Err(PipelineError::Input(format!(
            "no supported images in {} (supported: {})",
            dir.display(),
            IMAGE_EXTENSIONS.join(", ")
        )));
    }

    images.sort();
    Ok(images)
}

/// Whether the path has one of [`IMAGE_EXTENSIONS`].
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// MIME type from the file extension (`image/jpeg` when unknown).
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

/// Encode a file's bytes unchanged.
pub fn encode_raw(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(data_url(mime_type(path), &bytes))
}

/// Encode an image, re-encoding it when it is too large for `params`.
pub fn encode_image(path: &Path, params: EncodeParams) -> Result<String> {
    if !path.is_file() {
        return Err(PipelineError::Input(format!(
            "image file does not exist: {}",
            path.display()
        )));
    }
    if !params.compression {
        return encode_raw(path);
    }

    let (width, height) = image::image_dimensions(path)?;
    let file_size = std::fs::metadata(path)?.len();
    let needs_compression = width > params.max_dimensions.0
        || height > params.max_dimensions.1
        || file_size > COMPRESSION_THRESHOLD_BYTES;

    if !needs_compression {
        return encode_raw(path);
    }

    let bytes = compress(path, params, file_size)?;
    Ok(data_url("image/jpeg", &bytes))
}

/// Downscale to fit `params.max_dimensions` and re-encode as JPEG within
/// `params.max_bytes` (best effort down to quality 30).
fn compress(path: &Path, params: EncodeParams, file_size: u64) -> Result<Vec<u8>> {
    let img = image::open(path)?;
    let (width, height) = img.dimensions();
    let is_large = u64::from(width) * u64::from(height) > LARGE_IMAGE_PIXELS;

    let (max_w, max_h) = params.max_dimensions;
    let ratio = (f64::from(max_w) / f64::from(width))
        .min(f64::from(max_h) / f64::from(height))
        .min(1.0);
    let img = if ratio < 1.0 {
        let new_w = ((f64::from(width) * ratio) as u32).max(1);
        let new_h = ((f64::from(height) * ratio) as u32).max(1);
        let filter = if is_large {
            FilterType::Nearest
        } else {
            FilterType::Triangle
        };
        tracing::debug!(
            path = %path.display(),
            from = ?(width, height),
            to = ?(new_w, new_h),
            file_size,
            "resizing image"
        );
        img.resize_exact(new_w, new_h, filter)
    } else {
        img
    };

    let rgb = flatten_on_white(&img);
    let mut quality: u8 = if is_large { 75 } else { 85 };
    let step: u8 = if is_large { 10 } else { 5 };

    let mut buffer = encode_jpeg(&rgb, quality)?;
    while buffer.len() as u64 > params.max_bytes && quality > MIN_JPEG_QUALITY {
        quality = quality.saturating_sub(step).max(1);
        buffer = encode_jpeg(&rgb, quality)?;
    }
    Ok(buffer)
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(rgb)?;
    Ok(buffer)
}

/// Convert to RGB, compositing any alpha channel over white.
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

/// Cache-aware encoder shared by the preprocessing workers.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    cache: Arc<PreprocessCache>,
    params: EncodeParams,
}

impl Preprocessor {
    pub fn new(cache: Arc<PreprocessCache>, params: EncodeParams) -> Self {
        Self { cache, params }
    }

    /// Encoding parameters derived from a batch configuration.
    pub fn params_for(config: &BatchConfig) -> EncodeParams {
        EncodeParams {
            max_dimensions: config.max_image_size,
            max_bytes: config.max_bytes(),
            compression: config.enable_compression,
        }
    }

    pub fn params(&self) -> EncodeParams {
        self.params
    }

    /// Return the encoded payload for `item`, computing and caching it on a miss.
    ///
    /// Blocking; call from `spawn_blocking` inside async code.
    pub fn encode(&self, item: &WorkItem) -> Result<Arc<str>> {
        if let Some(hit) = self.cache.get(&item.identity, self.params) {
            tracing::debug!(image = %item.name(), "preprocess cache hit");
            return Ok(hit);
        }
        let payload: Arc<str> = encode_image(item.path(), self.params)?.into();
        self.cache
            .put(&item.identity, self.params, Arc::clone(&payload));
        Ok(payload)
    }
}
