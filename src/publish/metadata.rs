use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use md5::{Digest, Md5};
use std::collections::BTreeMap;

use super::object_store::ObjectHeaders;
use crate::slug::slugify;
use crate::store::LocalTile;

pub const CACHE_CONTROL: &str = "max-age=31536000, public";
pub const CONTENT_DISPOSITION: &str = "inline";
pub const ACL_PUBLIC_READ: &str = "public-read";

/// Content type by file extension.
pub fn content_type_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// `low` below zoom 10, `medium` up to 13, `high` from 14.
pub fn tile_detail(zoom: u8) -> &'static str {
    match zoom {
        0..=9 => "low",
        10..=13 => "medium",
        _ => "high",
    }
}

/// MD5 digest of a file body, hex and base64 encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Md5Digest {
    pub hex: String,
    pub base64: String,
}

impl Md5Digest {
    pub fn of(body: &[u8]) -> Self {
        let digest = Md5::digest(body);
        Self {
            hex: hex::encode(digest),
            base64: STANDARD.encode(digest),
        }
    }
}

/// Object metadata of a tile. Free-text values go through the slug rule so
/// they are plain ASCII; keys are lowercase.
pub fn tile_metadata(
    tile: &LocalTile,
    md5_hex: &str,
    size: u64,
    uploaded_at: DateTime<Utc>,
    uploader_version: &str,
) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        metadata.insert(key.to_owned(), value);
    };

    put("region", slugify(&tile.region_id));
    put("variant", slugify(tile.variant.label()));
    put("variant-folder", tile.variant.folder().to_owned());
    put("variant-priority", tile.variant.priority().to_string());
    if let Some(sub) = &tile.subregion_id {
        put("subregion", slugify(sub));
    }
    put("zoom", tile.coord.z.to_string());
    put("tile-detail", tile_detail(tile.coord.z).to_owned());
    put("md5-hash", md5_hex.to_owned());
    put("file-size", size.to_string());
    put(
        "upload-time",
        uploaded_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    put("uploader-version", sanitize_version(uploader_version));

    metadata
}

/// Versions keep their dots and slashes but lose anything non-ASCII.
fn sanitize_version(version: &str) -> String {
    let cleaned: String = version
        .chars()
        .filter(|c| c.is_ascii_graphic())
        .collect();
    if cleaned.is_empty() {
        "unknown".to_owned()
    } else {
        cleaned
    }
}

pub fn tile_headers(metadata: BTreeMap<String, String>, ext: &str) -> ObjectHeaders {
    ObjectHeaders {
        content_type: content_type_for(ext).to_owned(),
        cache_control: CACHE_CONTROL.to_owned(),
        content_disposition: CONTENT_DISPOSITION.to_owned(),
        acl: ACL_PUBLIC_READ.to_owned(),
        metadata,
    }
}
