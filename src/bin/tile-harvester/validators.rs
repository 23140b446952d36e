use planning_tile_harvester::{slugify, Variant, MAX_ZOOM};

pub fn is_numeric_min(
    min: usize,
) -> impl Fn(&str) -> Result<usize, String> + Clone + Send + Sync + 'static {
    move |v: &str| {
        let val = v
            .parse::<usize>()
            .map_err(|_| "must be numeric".to_owned())?;

        if val < min {
            return Err(format!("must be >= {}", min));
        }

        Ok(val)
    }
}

/// Requests per second; `0` turns the limiter off.
pub fn is_rate(v: &str) -> Result<u32, String> {
    v.parse::<u32>().map_err(|_| "must be numeric".to_owned())
}

fn zoom(v: &str) -> Result<u8, String> {
    let zoom = v
        .trim()
        .parse::<u8>()
        .map_err(|_| format!("`{}` is not a zoom level", v))?;

    if zoom > MAX_ZOOM {
        return Err(format!("zoom must be <= {}", MAX_ZOOM));
    }

    Ok(zoom)
}

/// `12`, `10,12` or the inclusive range `12..14`.
pub fn is_zoom_set(v: &str) -> Result<Vec<u8>, String> {
    let mut zooms = Vec::new();

    for part in v.split(',') {
        match part.split_once("..") {
            Some((from, to)) => {
                let (from, to) = (zoom(from)?, zoom(to.trim_start_matches('='))?);
                if from > to {
                    return Err(format!("empty zoom range `{}`", part));
                }
                zooms.extend(from..=to);
            }
            None => zooms.push(zoom(part)?),
        }
    }

    Ok(zooms)
}

pub fn is_variant(v: &str) -> Result<Variant, String> {
    v.parse::<Variant>()
}

pub fn is_region(v: &str) -> Result<String, String> {
    if !v.chars().any(char::is_alphanumeric) {
        return Err("must contain at least one letter or digit".to_owned());
    }

    Ok(slugify(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_sets() {
        assert_eq!(is_zoom_set("12"), Ok(vec![12]));
        assert_eq!(is_zoom_set("12..14"), Ok(vec![12, 13, 14]));
        assert_eq!(is_zoom_set("10,12..13"), Ok(vec![10, 12, 13]));
        assert!(is_zoom_set("14..12").is_err());
        assert!(is_zoom_set("23").is_err());
        assert!(is_zoom_set("z").is_err());
    }

    #[test]
    fn numeric_min() {
        assert_eq!(is_numeric_min(1)("5"), Ok(5));
        assert!(is_numeric_min(1)("0").is_err());
        assert!(is_numeric_min(1)("five").is_err());
    }

    #[test]
    fn regions_are_slugified() {
        assert_eq!(is_region("Hà Nội"), Ok("ha-noi".to_owned()));
        assert!(is_region("--").is_err());
    }
}
