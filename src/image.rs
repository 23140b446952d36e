use crate::error::FailureReason;

/// Bytes of the body kept for magic-number sniffing.
pub const SNIFF_LEN: usize = 16;

/// Bodies at or below this size are treated as server-rendered placeholders.
pub const DEFAULT_MIN_TILE_BYTES: u64 = 100;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Raster formats accepted as a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    WebP,
    Tiff,
}

/// Recognises an image by its leading bytes.
pub fn sniff(header: &[u8]) -> Option<ImageKind> {
    if header.starts_with(PNG_SIGNATURE) {
        Some(ImageKind::Png)
    } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageKind::Jpeg)
    } else if header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        Some(ImageKind::WebP)
    } else if header.starts_with(b"II*\0") || header.starts_with(b"MM\0*") {
        Some(ImageKind::Tiff)
    } else {
        None
    }
}

/// Accepts a body of `len` bytes starting with `header` as a tile, or says why not.
pub fn validate(len: u64, header: &[u8], min_len: u64) -> Result<ImageKind, FailureReason> {
    if len <= min_len {
        return Err(FailureReason::invalid_image(format!(
            "body of {} bytes is too small",
            len
        )));
    }

    sniff(header).ok_or_else(|| FailureReason::invalid_image("unrecognized magic bytes"))
}

/// `image/*` and `application/octet-stream` are accepted; a missing header is
/// left to the magic-byte check.
pub fn is_acceptable_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    mime.starts_with("image/") || mime == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_known_formats() {
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"), Some(ImageKind::Png));
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
        assert_eq!(sniff(b"RIFF\x10\0\0\0WEBPVP8 "), Some(ImageKind::WebP));
        assert_eq!(sniff(b"II*\0\x08\0\0\0"), Some(ImageKind::Tiff));
        assert_eq!(sniff(b"MM\0*\0\0\0\x08"), Some(ImageKind::Tiff));
        assert_eq!(sniff(b"<html>"), None);
        assert_eq!(sniff(b"RIFF\x10\0\0\0WAVE"), None);
        assert_eq!(sniff(b""), None);
    }

    #[test]
    fn rejects_small_bodies() {
        let header = b"\x89PNG\r\n\x1a\n";
        assert!(validate(100, header, DEFAULT_MIN_TILE_BYTES).is_err());
        assert_eq!(
            validate(101, header, DEFAULT_MIN_TILE_BYTES),
            Ok(ImageKind::Png)
        );
        assert!(matches!(
            validate(6, b"<html>", DEFAULT_MIN_TILE_BYTES),
            Err(FailureReason::InvalidImage { .. })
        ));
    }

    #[test]
    fn content_types() {
        assert!(is_acceptable_content_type(Some("image/png")));
        assert!(is_acceptable_content_type(Some("IMAGE/JPEG; charset=binary")));
        assert!(is_acceptable_content_type(Some("application/octet-stream")));
        assert!(is_acceptable_content_type(None));
        assert!(!is_acceptable_content_type(Some("text/html; charset=utf-8")));
    }
}
