use serde::{Deserialize, Serialize};

/// A point in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub lat: f64,
    pub lon: f64,
}

/// An administrative subdivision; only used by the per-district annual plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subregion {
    pub id: String,
    pub display_name: String,
    pub parent_region_id: String,
}

/// A harvested province or city: a disc of `radius_km` around `centroid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub display_name: String,
    pub centroid: Centroid,
    pub radius_km: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subregions: Vec<Subregion>,
}

impl Region {
    pub fn has_subregions(&self) -> bool {
        !self.subregions.is_empty()
    }

    pub fn subregion(&self, id: &str) -> Option<&Subregion> {
        self.subregions.iter().find(|s| s.id == id)
    }
}
