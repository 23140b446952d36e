use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::region::{Centroid, Region, Subregion};
use crate::slug::slugify;
use crate::template::UrlTemplate;
use crate::variant::Variant;

#[derive(Debug, Deserialize)]
struct InputFile {
    regions: Vec<InputRegion>,
}

#[derive(Debug, Deserialize)]
struct InputRegion {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    centroid: Centroid,
    radius_km: f64,
    #[serde(default)]
    variants: BTreeMap<String, InputVariant>,
}

#[derive(Debug, Default, Deserialize)]
struct InputVariant {
    #[serde(default)]
    templates: Vec<String>,
    #[serde(default)]
    by_subregion: BTreeMap<String, InputSubregion>,
}

#[derive(Debug, Deserialize)]
struct InputSubregion {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    templates: Vec<String>,
}

/// A template whose URL classifies to a different variant than the key it was
/// declared under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Misfiled {
    pub region_id: String,
    pub declared: Variant,
    pub classified: Variant,
    pub template: UrlTemplate,
}

/// In-memory catalogue of `(region, variant[, subregion]) → [template]`.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    regions: Vec<Region>,
    by_variant: HashMap<(String, Variant), Vec<UrlTemplate>>,
    by_subregion: HashMap<(String, String), Vec<UrlTemplate>>,
    misfiled: Vec<Misfiled>,
}

impl TemplateRegistry {
    /// Loads the template input file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadInput {
            path: path.to_owned(),
            source,
        })?;

        Self::parse(&raw, path)
    }

    /// Parses the template input document from a string.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, Path::new("<inline>"))
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let input: InputFile =
            serde_json::from_str(raw).map_err(|source| ConfigError::ParseInput {
                path: PathBuf::from(path),
                source,
            })?;

        let mut registry = Self::default();
        for region in input.regions {
            registry.add_region(region)?;
        }

        debug!(
            regions = registry.regions.len(),
            templates = registry.template_count(),
            "loaded template registry"
        );

        Ok(registry)
    }

    fn add_region(&mut self, input: InputRegion) -> Result<(), ConfigError> {
        let id = slugify(&input.id);
        if self.regions.iter().any(|r| r.id == id) {
            return Err(ConfigError::DuplicateRegion(id));
        }

        let Centroid { lat, lon } = input.centroid;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(ConfigError::InvalidCentroid {
                region: id,
                lat,
                lon,
            });
        }
        if !input.radius_km.is_finite() || input.radius_km <= 0.0 {
            return Err(ConfigError::InvalidRadius {
                region: id,
                radius_km: input.radius_km,
            });
        }

        let mut subregions = Vec::new();
        for (key, variant_input) in input.variants {
            let variant = Variant::from_input_key(&key);

            if variant.is_per_subregion() && !variant_input.by_subregion.is_empty() {
                if !variant_input.templates.is_empty() {
                    return Err(ConfigError::MixedSubregionLayout {
                        region: id,
                        variant: key,
                    });
                }

                for (sub_key, sub) in variant_input.by_subregion {
                    let sub_id = slugify(&sub_key);
                    let templates = self.parse_templates(&id, variant, sub.templates)?;
                    if !subregions.iter().any(|s: &Subregion| s.id == sub_id) {
                        subregions.push(Subregion {
                            id: sub_id.clone(),
                            display_name: sub.display_name.unwrap_or_else(|| sub_key.clone()),
                            parent_region_id: id.clone(),
                        });
                    }
                    extend_unique(
                        self.by_subregion
                            .entry((id.clone(), sub_id))
                            .or_default(),
                        templates,
                    );
                }
            } else {
                // Only the annual plan is split per district; any other
                // by_subregion block folds into the region-wide list.
                let mut raw = variant_input.templates;
                raw.extend(
                    variant_input
                        .by_subregion
                        .into_values()
                        .flat_map(|sub| sub.templates),
                );
                let templates = self.parse_templates(&id, variant, raw)?;
                extend_unique(
                    self.by_variant.entry((id.clone(), variant)).or_default(),
                    templates,
                );
            }
        }

        self.regions.push(Region {
            display_name: input.display_name.unwrap_or_else(|| input.id.clone()),
            id,
            centroid: input.centroid,
            radius_km: input.radius_km,
            subregions,
        });

        Ok(())
    }

    fn parse_templates(
        &mut self,
        region_id: &str,
        declared: Variant,
        raw: Vec<String>,
    ) -> Result<Vec<UrlTemplate>, ConfigError> {
        raw.into_iter()
            .map(|s| {
                let template = UrlTemplate::parse(s)?;
                let classified = template.variant();
                if classified != declared {
                    warn!(
                        region = region_id,
                        declared = %declared,
                        classified = %classified,
                        template = %template,
                        "template URL does not look like the variant it is filed under"
                    );
                    self.misfiled.push(Misfiled {
                        region_id: region_id.to_owned(),
                        declared,
                        classified,
                        template: template.clone(),
                    });
                }
                Ok(template)
            })
            .collect()
    }

    /// Templates filed under `(region, variant[, subregion])`; empty when
    /// nothing is known about the key.
    pub fn templates_for(
        &self,
        region_id: &str,
        variant: Variant,
        subregion_id: Option<&str>,
    ) -> &[UrlTemplate] {
        let found = match subregion_id {
            Some(sub) if variant.is_per_subregion() => self
                .by_subregion
                .get(&(region_id.to_owned(), sub.to_owned())),
            Some(_) => None,
            None => self.by_variant.get(&(region_id.to_owned(), variant)),
        };

        found.map(Vec::as_slice).unwrap_or_default()
    }

    /// Classifies a URL; see [`crate::classify`].
    pub fn classify(url: &str) -> Variant {
        crate::variant::classify(url)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Variants with at least one template for `region_id`, by priority.
    pub fn variants_for(&self, region_id: &str) -> Vec<Variant> {
        let Some(region) = self.region(region_id) else {
            return Vec::new();
        };

        Variant::ALL
            .iter()
            .copied()
            .filter(|&variant| {
                if variant.is_per_subregion() && region.has_subregions() {
                    region
                        .subregions
                        .iter()
                        .any(|s| !self.templates_for(region_id, variant, Some(&s.id)).is_empty())
                } else {
                    !self.templates_for(region_id, variant, None).is_empty()
                }
            })
            .collect()
    }

    pub fn template_count(&self) -> usize {
        self.by_variant.values().map(Vec::len).sum::<usize>()
            + self.by_subregion.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.template_count() == 0
    }

    /// Templates whose URL classification disagrees with their declared key.
    pub fn misfiled(&self) -> &[Misfiled] {
        &self.misfiled
    }
}

fn extend_unique(target: &mut Vec<UrlTemplate>, templates: Vec<UrlTemplate>) {
    let mut seen: HashSet<UrlTemplate> = target.iter().cloned().collect();
    for template in templates {
        if seen.insert(template.clone()) {
            target.push(template);
        }
    }
}
