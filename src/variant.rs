use serde::{Deserialize, Serialize};
use std::fmt;

/// Which planning layer a template renders.
///
/// Declaration order is priority order, which is also the tie-break used by
/// [`classify`] when a URL matches more than one family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Variant {
    MasterPlan2030,
    AnnualPlan2025,
    SubzonePlan,
    OtherPlan,
    Unknown,
}

impl Variant {
    /// The four variants a template can be filed under.
    pub const ALL: [Variant; 4] = [
        Variant::MasterPlan2030,
        Variant::AnnualPlan2025,
        Variant::SubzonePlan,
        Variant::OtherPlan,
    ];

    /// On-disk folder and object-key segment. These names are published
    /// contract and must not change.
    pub fn folder(self) -> &'static str {
        match self {
            Variant::MasterPlan2030 => "qh-2030",
            Variant::AnnualPlan2025 => "kh-2025",
            Variant::SubzonePlan => "qh-phan-khu",
            Variant::OtherPlan => "qh-khac",
            Variant::Unknown => "unknown",
        }
    }

    pub fn from_folder(folder: &str) -> Option<Self> {
        match folder {
            "qh-2030" => Some(Variant::MasterPlan2030),
            "kh-2025" => Some(Variant::AnnualPlan2025),
            "qh-phan-khu" => Some(Variant::SubzonePlan),
            "qh-khac" => Some(Variant::OtherPlan),
            "unknown" => Some(Variant::Unknown),
            _ => None,
        }
    }

    /// Variant for a key of the template input file. Keys that are not one
    /// of the known folders are filed as [`Variant::OtherPlan`].
    pub fn from_input_key(key: &str) -> Self {
        match Variant::from_folder(key) {
            Some(Variant::Unknown) | None => Variant::OtherPlan,
            Some(variant) => variant,
        }
    }

    /// 1 is the most important layer.
    pub fn priority(self) -> u8 {
        match self {
            Variant::MasterPlan2030 => 1,
            Variant::AnnualPlan2025 => 2,
            Variant::SubzonePlan => 3,
            Variant::OtherPlan => 4,
            Variant::Unknown => 99,
        }
    }

    /// Human-facing slug of the tag, used as the `variant` metadata value.
    pub fn label(self) -> &'static str {
        match self {
            Variant::MasterPlan2030 => "master-plan-2030",
            Variant::AnnualPlan2025 => "annual-plan-2025",
            Variant::SubzonePlan => "subzone-plan",
            Variant::OtherPlan => "other-plan",
            Variant::Unknown => "unknown",
        }
    }

    /// Only the annual plan is published per district.
    pub fn is_per_subregion(self) -> bool {
        self == Variant::AnnualPlan2025
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(variant) = Variant::from_folder(s) {
            return Ok(variant);
        }

        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "MASTER_PLAN_2030" => Ok(Variant::MasterPlan2030),
            "ANNUAL_PLAN_2025" => Ok(Variant::AnnualPlan2025),
            "SUBZONE_PLAN" => Ok(Variant::SubzonePlan),
            "OTHER_PLAN" => Ok(Variant::OtherPlan),
            _ => Err(format!("unknown variant `{}`", s)),
        }
    }
}

/// Path portion of a URL (everything after the authority), lowercased.
fn url_path(url: &str) -> String {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let path = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "",
    };

    path.to_ascii_lowercase()
}

/// Classifies a template URL by substring match on its path.
///
/// Checked in priority order, so `.../qh-2030/phan-khu/...` is a master plan.
pub fn classify(url: &str) -> Variant {
    let path = url_path(url);

    if path.contains("-2030") {
        Variant::MasterPlan2030
    } else if path.contains("2025") || path.contains("2024") {
        Variant::AnnualPlan2025
    } else if path.contains("qhc") || path.contains("phan-khu") {
        Variant::SubzonePlan
    } else {
        Variant::OtherPlan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_round_trip() {
        for variant in Variant::ALL.iter().copied().chain(Some(Variant::Unknown)) {
            assert_eq!(Variant::from_folder(variant.folder()), Some(variant));
        }
        assert_eq!(Variant::from_folder("qh-2031"), None);
    }

    #[test]
    fn unknown_input_keys_are_other_plan() {
        assert_eq!(Variant::from_input_key("qh-2030"), Variant::MasterPlan2030);
        assert_eq!(Variant::from_input_key("kh-2025"), Variant::AnnualPlan2025);
        assert_eq!(Variant::from_input_key("qh-tinh"), Variant::OtherPlan);
        assert_eq!(Variant::from_input_key("unknown"), Variant::OtherPlan);
    }

    #[test]
    fn classification_by_path() {
        assert_eq!(
            classify("https://tiles.example/hanoi/qh-2030/{z}/{x}/{y}.png"),
            Variant::MasterPlan2030
        );
        assert_eq!(
            classify("https://tiles.example/kh2025/huyen-a/{z}/{x}/{y}.png"),
            Variant::AnnualPlan2025
        );
        assert_eq!(
            classify("https://tiles.example/2024/{z}/{x}/{y}.png"),
            Variant::AnnualPlan2025
        );
        assert_eq!(
            classify("https://tiles.example/qhc/{z}/{x}/{y}.png"),
            Variant::SubzonePlan
        );
        assert_eq!(
            classify("https://tiles.example/QH-PHAN-KHU/{z}/{x}/{y}.png"),
            Variant::SubzonePlan
        );
        assert_eq!(
            classify("https://tiles.example/khac/{z}/{x}/{y}.png"),
            Variant::OtherPlan
        );
    }

    #[test]
    fn host_does_not_influence_classification() {
        assert_eq!(
            classify("https://qh-2030.example/{z}/{x}/{y}.png"),
            Variant::OtherPlan
        );
    }

    #[test]
    fn ambiguous_urls_use_priority_order() {
        assert_eq!(
            classify("https://tiles.example/qh-2030/phan-khu/{z}/{x}/{y}.png"),
            Variant::MasterPlan2030
        );
        assert_eq!(
            classify("https://tiles.example/kh-2025/qhc/{z}/{x}/{y}.png"),
            Variant::AnnualPlan2025
        );
    }

    #[test]
    fn parses_folder_and_tag_names() {
        assert_eq!("kh-2025".parse::<Variant>(), Ok(Variant::AnnualPlan2025));
        assert_eq!(
            "master_plan_2030".parse::<Variant>(),
            Ok(Variant::MasterPlan2030)
        );
        assert!("bogus".parse::<Variant>().is_err());
    }
}
