use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Letters that survive NFD decomposition without an ASCII base.
const ASCII_SUBSTITUTES: &[(char, &str)] = &[
    ('đ', "d"),
    ('ð', "d"),
    ('ø', "o"),
    ('ł', "l"),
    ('æ', "ae"),
    ('œ', "oe"),
    ('ß', "ss"),
];

const UNKNOWN: &str = "unknown";

/// Turns a display name or identifier into an ASCII slug (`[a-z0-9-]+`).
///
/// Vietnamese diacritics are decomposed and stripped, `đ` becomes `d`, and
/// every run of other characters collapses into a single `-`. An input with
/// nothing usable left becomes `unknown`.
///
/// # Example
/// ```rust
/// # use planning_tile_harvester::slugify;
/// assert_eq!(slugify("Thành phố Hồ Chí Minh"), "thanh-pho-ho-chi-minh");
/// assert_eq!(slugify("Đà Nẵng"), "da-nang");
/// ```
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;

    let mut push = |c: char, out: &mut String| {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    };

    for c in input.to_lowercase().nfd().filter(|c| !is_combining_mark(*c)) {
        match ASCII_SUBSTITUTES.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => {
                for t in to.chars() {
                    push(t, &mut out);
                }
            }
            None => push(c, &mut out),
        }
    }

    if out.is_empty() {
        UNKNOWN.to_owned()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn vietnamese_names() {
        assert_eq!(slugify("Hà Nội"), "ha-noi");
        assert_eq!(slugify("Bắc Kạn"), "bac-kan");
        assert_eq!(slugify("ĐỒNG THÁP"), "dong-thap");
        assert_eq!(slugify("Huyện Chợ Đồn"), "huyen-cho-don");
        assert_eq!(slugify("Thừa Thiên Huế"), "thua-thien-hue");
    }

    #[test]
    fn separators_collapse() {
        assert_eq!(slugify("  --Quận  1 // "), "quan-1");
        assert_eq!(slugify("a__b"), "a-b");
    }

    #[test]
    fn empty_becomes_unknown() {
        assert_eq!(slugify(""), "unknown");
        assert_eq!(slugify("---"), "unknown");
        assert_eq!(slugify("漢字"), "unknown");
    }

    proptest! {
        #[test]
        fn prop_slug_idempotent_and_ascii(s in "\\PC{0,40}") {
            let once = slugify(&s);
            prop_assert_eq!(slugify(&once), once.clone());
            prop_assert!(once.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!once.starts_with('-') && !once.ends_with('-'));
            prop_assert!(!once.contains("--"));
        }
    }
}
