//! Image type detection by file signature

use std::path::Path;

/// Detect the image MIME type from the first bytes of a buffer
///
/// Only signatures the decoder understands are recognized; anything else
/// returns `None`.
#[must_use]
pub fn detect_image_format(data: &[u8]) -> Option<&'static str> {
    if data.len() < 4 {
        return None;
    }

    // PNG: 89 50 4E 47 0D 0A 1A 0A
    if data
        .get(0..8)
        .is_some_and(|slice| slice == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])
    {
        return Some("image/png");
    }

    // JPEG: FF D8 FF
    if data.get(0..3).is_some_and(|slice| slice == [0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }

    // WebP: RIFF....WEBP
    if data.get(0..4).is_some_and(|slice| slice == b"RIFF")
        && data.get(8..12).is_some_and(|slice| slice == b"WEBP")
    {
        return Some("image/webp");
    }

    // GIF87a / GIF89a
    if data.get(0..4).is_some_and(|slice| slice == b"GIF8") {
        return Some("image/gif");
    }

    // TIFF, little and big endian
    if data
        .get(0..4)
        .is_some_and(|slice| slice == [0x49, 0x49, 0x2A, 0x00] || slice == [0x4D, 0x4D, 0x00, 0x2A])
    {
        return Some("image/tiff");
    }

    // BMP: "BM"
    if data.get(0..2).is_some_and(|slice| slice == b"BM") {
        return Some("image/bmp");
    }

    None
}

/// Guess the MIME type from a file extension
#[must_use]
pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "tif" | "tiff" => Some("image/tiff"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// Canonical spelling of a declared MIME type
///
/// Lowercases, strips parameters (`; charset=...`) and folds the common
/// `image/jpg` alias into `image/jpeg`.
#[must_use]
pub fn canonical_mime(mime_type: &str) -> String {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => essence,
    }
}

/// Whether a declared type carries no real information
#[must_use]
pub fn is_unspecified(mime_type: &str) -> bool {
    let canonical = canonical_mime(mime_type);
    canonical.is_empty() || canonical == "application/octet-stream" || canonical == "binary/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_known_signatures() {
        assert_eq!(
            detect_image_format(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]),
            Some("image/png")
        );
        assert_eq!(detect_image_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(detect_image_format(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(detect_image_format(b"GIF89a.."), Some("image/gif"));
        assert_eq!(detect_image_format(b"BM\x00\x00\x00\x00"), Some("image/bmp"));
    }

    #[test]
    fn test_detect_rejects_short_or_unknown() {
        assert_eq!(detect_image_format(&[0xFF, 0xD8]), None);
        assert_eq!(detect_image_format(b"%PDF-1.7"), None);
        assert_eq!(detect_image_format(b"RIFF\x10\x00\x00\x00WAVE"), None);
    }

    #[test]
    fn test_canonical_mime_aliases() {
        assert_eq!(canonical_mime("image/jpg"), "image/jpeg");
        assert_eq!(canonical_mime("Image/PNG; charset=binary"), "image/png");
        assert!(is_unspecified("application/octet-stream"));
        assert!(is_unspecified(""));
        assert!(!is_unspecified("image/webp"));
    }

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension(Path::new("a/b/photo.JPG")), Some("image/jpeg"));
        assert_eq!(mime_from_extension(Path::new("scan.tif")), Some("image/tiff"));
        assert_eq!(mime_from_extension(Path::new("notes.txt")), None);
        assert_eq!(mime_from_extension(Path::new("noext")), None);
    }
}
