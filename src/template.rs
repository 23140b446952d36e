use maplit::hashmap;
use std::{fmt, sync::Arc};
use strfmt::strfmt;

use crate::error::ConfigError;
use crate::tile::TileCoord;
use crate::variant::{classify, Variant};

const PLACEHOLDERS: [&str; 3] = ["{z}", "{x}", "{y}"];
const DEFAULT_EXTENSION: &str = "png";

/// A tile URL with the replacement specifiers `{z}`, `{x}` and `{y}`, each
/// present exactly once.
///
/// Cheap to clone; every planned tile carries its template.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UrlTemplate {
    format_str: Arc<str>,
}

impl UrlTemplate {
    /// Validates `format_str` and wraps it.
    ///
    /// # Example
    /// ```rust
    /// # use planning_tile_harvester::{TileCoord, UrlTemplate};
    /// let template = UrlTemplate::parse("https://tiles.example/qh-2030/{z}/{x}/{y}.png").unwrap();
    /// let url = template.tile_url(&TileCoord::new(12, 3258, 1797).unwrap()).unwrap();
    /// assert_eq!(url, "https://tiles.example/qh-2030/12/3258/1797.png");
    /// ```
    pub fn parse(format_str: impl Into<String>) -> Result<Self, ConfigError> {
        let format_str = format_str.into();

        let complete = PLACEHOLDERS
            .iter()
            .all(|placeholder| format_str.matches(placeholder).count() == 1);
        if !complete {
            return Err(ConfigError::MissingPlaceholders {
                template: format_str,
            });
        }

        // Any other `{name}` would fail at fetch time; reject it now.
        let probe = hashmap! {
            "x".to_owned() => "0".to_owned(),
            "y".to_owned() => "0".to_owned(),
            "z".to_owned() => "0".to_owned(),
        };
        if let Err(e) = strfmt(&format_str, &probe) {
            return Err(ConfigError::InvalidTemplate {
                template: format_str,
                reason: e.to_string(),
            });
        }

        Ok(Self {
            format_str: format_str.into(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.format_str
    }

    /// Substitutes the tile coordinate into the template.
    pub fn tile_url(&self, tile: &TileCoord) -> Result<String, strfmt::FmtError> {
        let vars = hashmap! {
            "x".to_owned() => tile.x.to_string(),
            "y".to_owned() => tile.y.to_string(),
            "z".to_owned() => tile.z.to_string(),
        };

        strfmt(&self.format_str, &vars)
    }

    /// File extension of the tiles this template serves, without the dot.
    pub fn extension(&self) -> &'static str {
        let path = self
            .format_str
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        let last_segment = path.rsplit('/').next().unwrap_or_default();

        match last_segment.rsplit_once('.') {
            Some((_, ext)) => match ext.to_ascii_lowercase().as_str() {
                "png" => "png",
                "jpg" | "jpeg" => "jpg",
                "webp" => "webp",
                _ => DEFAULT_EXTENSION,
            },
            None => DEFAULT_EXTENSION,
        }
    }

    pub fn variant(&self) -> Variant {
        classify(&self.format_str)
    }
}

impl fmt::Debug for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlTemplate")
            .field("format_str", &self.as_str())
            .finish()
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_placeholders() {
        for bad in [
            "https://tiles.example/{z}/{x}.png",
            "https://tiles.example/{z}/{x}/{x}/{y}.png",
            "https://tiles.example/tile.png",
        ] {
            assert!(matches!(
                UrlTemplate::parse(bad),
                Err(ConfigError::MissingPlaceholders { .. })
            ));
        }
    }

    #[test]
    fn rejects_foreign_placeholders() {
        assert!(matches!(
            UrlTemplate::parse("https://{s}.tiles.example/{z}/{x}/{y}.png"),
            Err(ConfigError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn extension_from_path() {
        let ext = |s: &str| UrlTemplate::parse(s).unwrap().extension();
        assert_eq!(ext("https://t.example/{z}/{x}/{y}.png"), "png");
        assert_eq!(ext("https://t.example/{z}/{x}/{y}.JPEG"), "jpg");
        assert_eq!(ext("https://t.example/{z}/{x}/{y}.webp?v=2"), "webp");
        assert_eq!(ext("https://t.example/{z}/{x}/{y}"), "png");
        assert_eq!(ext("https://t.example/tiles.v2/{z}/{x}/{y}"), "png");
    }

    #[test]
    fn substitutes_coordinates() {
        let template = UrlTemplate::parse("https://t.example/{z}/{y}/{x}.jpg").unwrap();
        let tile = TileCoord::new(3, 5, 7).unwrap();
        assert_eq!(template.tile_url(&tile).unwrap(), "https://t.example/3/7/5.jpg");
    }
}
