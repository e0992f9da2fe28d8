//! Image payload decoding and temporary image files.
//!
//! Generated images arrive as base64 (sometimes without padding, sometimes as a
//! `data:` URL) and must become files before they can be attached to a Discord
//! message. Decoded bytes are written verbatim; the `image` crate only sniffs
//! the container to pick an extension and to check the payload is a real image.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Payloads shorter than this are not treated as images.
pub const MIN_IMAGE_BYTES: usize = 100;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("payload too small to be an image ({0} bytes)")]
    TooSmall(usize),

    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),
}

/// Either base64 text from the provider or bytes already in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Base64(String),
    Raw(Vec<u8>),
}

impl ImagePayload {
    pub fn into_bytes(self) -> Result<Vec<u8>, ImageError> {
        let bytes = match self {
            ImagePayload::Base64(text) => decode_base64(&text)?,
            ImagePayload::Raw(bytes) => bytes,
        };
        if bytes.len() < MIN_IMAGE_BYTES {
            return Err(ImageError::TooSmall(bytes.len()));
        }
        Ok(bytes)
    }
}

/// Strip a `<header>,` prefix (e.g. `data:image/png;base64,`) and whitespace,
/// then right-pad with `=` to a multiple of four.
pub fn normalize_base64(input: &str) -> String {
    let payload = match input.split_once(',') {
        Some((_, rest)) => rest,
        None => input,
    };
    let mut cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let rem = cleaned.len() % 4;
    if rem != 0 {
        cleaned.extend(std::iter::repeat('=').take(4 - rem));
    }
    cleaned
}

pub fn decode_base64(input: &str) -> Result<Vec<u8>, ImageError> {
    Ok(STANDARD.decode(normalize_base64(input))?)
}

/// File extension for a provider MIME type. Unknown types use their subtype.
pub fn extension_for_mime(mime: &str) -> String {
    let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg".to_string(),
        "image/png" => "png".to_string(),
        "image/webp" => "webp".to_string(),
        "image/gif" => "gif".to_string(),
        other => {
            let sub = other.rsplit('/').next().unwrap_or(other);
            let sub = sub.split('+').next().unwrap_or(sub);
            if sub.is_empty() {
                "png".to_string()
            } else {
                sub.to_string()
            }
        }
    }
}

/// MIME type for raw bytes, by magic number.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|f| f.to_mime_type())
}

fn extension_for_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        other => other.extensions_str().first().copied().unwrap_or("png"),
    }
}

/// Decode `payload` and write it next to `requested`.
///
/// When the container sniffs and decodes, the extension is replaced with the
/// sniffed one. When sniffing fails the requested extension is kept (PNG if
/// there is none). When the bytes do not decode as an image at all they are
/// still written, unmodified, at the requested path. Returns the path written.
pub fn save_image(payload: ImagePayload, requested: &Path) -> Result<PathBuf, ImageError> {
    let bytes = payload.into_bytes()?;

    let path = match image::guess_format(&bytes) {
        Ok(format) => match image::load_from_memory_with_format(&bytes, format) {
            Ok(_) => requested.with_extension(extension_for_format(format)),
            Err(e) => {
                debug!("Images: {:?} payload did not decode ({}), writing raw bytes", format, e);
                requested.to_path_buf()
            }
        },
        Err(_) => {
            if requested.extension().is_some() {
                requested.to_path_buf()
            } else {
                requested.with_extension("png")
            }
        }
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, &bytes)?;
    debug!("Images: wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(path)
}

/// Sequentially numbered temporary files for generated images.
pub struct ImageStore {
    dir: PathBuf,
    counter: AtomicU64,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Decode and save one image. Failures are logged and yield `None` so the
    /// reply goes out without that image.
    pub fn persist(&self, mime: &str, payload: ImagePayload) -> Option<PathBuf> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let requested = self
            .dir
            .join(format!("generated_image_{}.{}", n, extension_for_mime(mime)));
        match save_image(payload, &requested) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Images: dropping generated image {} ({}): {}", n, mime, e);
                None
            }
        }
    }

    /// Best-effort removal after upload. Errors are logged only.
    pub fn remove_all(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Images: failed to delete {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, ((x ^ y) * 4) as u8]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn padding_is_restored() {
        let data = b"any carnal pleasure.";
        let padded = STANDARD.encode(&data[..19]);
        assert!(padded.ends_with('='));
        let stripped = padded.trim_end_matches('=');
        assert_eq!(decode_base64(stripped).unwrap(), decode_base64(&padded).unwrap());
        for len in [120usize, 121, 122] {
            let s = STANDARD.encode(vec![7u8; len]);
            let unpadded = s.trim_end_matches('=');
            assert_eq!(decode_base64(unpadded).unwrap(), STANDARD.decode(&s).unwrap());
        }
    }

    #[test]
    fn data_url_header_is_stripped() {
        let raw = vec![1u8, 2, 3, 4, 5];
        let url = format!("data:image/png;base64,{}", STANDARD.encode(&raw));
        assert_eq!(decode_base64(&url).unwrap(), raw);
    }

    #[test]
    fn small_payload_rejected() {
        let err = ImagePayload::Base64(STANDARD.encode([0u8; 99])).into_bytes().unwrap_err();
        assert!(matches!(err, ImageError::TooSmall(99)));
    }

    #[test]
    fn garbage_base64_rejected() {
        let err = ImagePayload::Base64("!!!not base64!!!".into()).into_bytes().unwrap_err();
        assert!(matches!(err, ImageError::InvalidBase64(_)));
    }

    #[test]
    fn png_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let original = png_bytes();
        assert!(original.len() >= MIN_IMAGE_BYTES);
        let encoded = STANDARD.encode(&original);
        let path = save_image(ImagePayload::Base64(encoded), &dir.path().join("out.jpg")).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn unknown_bytes_written_raw_with_requested_name() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = vec![0xABu8; 256];
        let path = save_image(ImagePayload::Raw(bytes.clone()), &dir.path().join("blob")).unwrap();
        assert_eq!(path, dir.path().join("blob.png"));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn truncated_png_falls_back_to_raw_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = png_bytes();
        bytes.truncate(120);
        let requested = dir.path().join("cut.webp");
        let path = save_image(ImagePayload::Raw(bytes.clone()), &requested).unwrap();
        assert_eq!(path, requested);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn mime_extensions() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("image/webp"), "webp");
        assert_eq!(extension_for_mime("image/gif"), "gif");
        assert_eq!(extension_for_mime("image/bmp"), "bmp");
        assert_eq!(extension_for_mime("image/svg+xml; charset=utf-8"), "svg");
    }

    #[test]
    fn sniffs_png_mime() {
        assert_eq!(sniff_mime(&png_bytes()), Some("image/png"));
        assert_eq!(sniff_mime(b"plain text"), None);
    }

    #[test]
    fn store_numbers_files_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        let encoded = STANDARD.encode(png_bytes());
        let a = store.persist("image/png", ImagePayload::Base64(encoded.clone())).unwrap();
        let b = store.persist("image/png", ImagePayload::Base64(encoded)).unwrap();
        assert_eq!(a.file_name().and_then(|n| n.to_str()), Some("generated_image_1.png"));
        assert_eq!(b.file_name().and_then(|n| n.to_str()), Some("generated_image_2.png"));
        assert!(store.persist("image/png", ImagePayload::Raw(vec![1, 2, 3])).is_none());

        store.remove_all(&[a.clone(), b.clone(), dir.path().join("missing.png")]);
        assert!(!a.exists());
        assert!(!b.exists());
    }
}
