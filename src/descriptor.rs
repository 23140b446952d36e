use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
};
use tracing::{debug, info};

use crate::error::{ConfigError, FailureReason};
use crate::planner::plan_region;
use crate::registry::TemplateRegistry;
use crate::store::LocalTile;
use crate::template::UrlTemplate;
use crate::tile::TileCoord;
use crate::variant::Variant;

/// Rough size of one tile, for estimates only.
pub const ESTIMATED_TILE_BYTES: u64 = 10_000;

/// One tile to fetch: where it comes from and where it goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileDescriptor {
    pub region_id: String,
    pub variant: Variant,
    /// Set iff the variant is published per district and the region has
    /// districts.
    pub subregion_id: Option<String>,
    pub coord: TileCoord,
    pub template: UrlTemplate,
}

impl TileDescriptor {
    pub fn local_tile(&self) -> LocalTile {
        LocalTile {
            region_id: self.region_id.clone(),
            variant: self.variant,
            subregion_id: self.subregion_id.clone(),
            coord: self.coord,
            ext: self.template.extension().to_owned(),
        }
    }

    pub fn relative_path(&self) -> String {
        self.local_tile().relative_path()
    }

    pub fn url(&self) -> Result<String, FailureReason> {
        self.template
            .tile_url(&self.coord)
            .map_err(|e| FailureReason::Config {
                message: format!("template {}: {}", self.template, e),
            })
    }
}

impl fmt::Display for TileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// Restricts which regions and variants get planned. `None` means all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorFilter {
    pub regions: Option<BTreeSet<String>>,
    pub variants: Option<BTreeSet<Variant>>,
}

impl DescriptorFilter {
    pub fn allows_region(&self, region_id: &str) -> bool {
        self.regions
            .as_ref()
            .map_or(true, |regions| regions.contains(region_id))
    }

    pub fn allows_variant(&self, variant: Variant) -> bool {
        self.variants
            .as_ref()
            .map_or(true, |variants| variants.contains(&variant))
    }
}

/// Expands the registry into the unique set of tiles to fetch over `zooms`.
///
/// Tiles landing on the same local path are merged; the template listed
/// first wins. Order follows the registry, then variant priority, then the
/// planner's row-major order.
pub fn build_descriptors(
    registry: &TemplateRegistry,
    zooms: &[u8],
    filter: &DescriptorFilter,
) -> Result<Vec<TileDescriptor>, ConfigError> {
    let mut descriptors = Vec::new();
    let mut seen = HashSet::new();
    let mut merged = 0usize;

    for region in registry.regions() {
        if !filter.allows_region(&region.id) {
            continue;
        }

        let coords = plan_region(region, zooms)?;

        for variant in Variant::ALL {
            if !filter.allows_variant(variant) {
                continue;
            }

            let sources: Vec<(Option<&str>, &[UrlTemplate])> =
                if variant.is_per_subregion() && region.has_subregions() {
                    region
                        .subregions
                        .iter()
                        .map(|sub| {
                            let templates =
                                registry.templates_for(&region.id, variant, Some(&sub.id));
                            (Some(sub.id.as_str()), templates)
                        })
                        .collect()
                } else {
                    vec![(None, registry.templates_for(&region.id, variant, None))]
                };

            for (subregion_id, templates) in sources {
                for template in templates {
                    for &coord in &coords {
                        let descriptor = TileDescriptor {
                            region_id: region.id.clone(),
                            variant,
                            subregion_id: subregion_id.map(str::to_owned),
                            coord,
                            template: template.clone(),
                        };

                        if seen.insert(descriptor.relative_path()) {
                            descriptors.push(descriptor);
                        } else {
                            merged += 1;
                        }
                    }
                }
            }
        }
    }

    if merged > 0 {
        debug!(merged, "merged descriptors sharing a local path");
    }
    info!(descriptors = descriptors.len(), "planned tiles");

    Ok(descriptors)
}

/// Drops descriptors whose local path was already seen, keeping the first.
pub fn dedupe(descriptors: Vec<TileDescriptor>) -> Vec<TileDescriptor> {
    let mut seen = HashSet::new();
    descriptors
        .into_iter()
        .filter(|d| seen.insert(d.relative_path()))
        .collect()
}

/// What a fetch would do, without doing it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Tile count per `<region>/<folder>[/<subregion>]`.
    pub by_combination: BTreeMap<String, u64>,
    pub total: u64,
}

impl PlanSummary {
    pub fn estimated_bytes(&self) -> u64 {
        self.total * ESTIMATED_TILE_BYTES
    }

    /// One line, as printed by a dry run.
    pub fn describe(&self) -> String {
        format!(
            "would download {} tiles (approx {}, assuming 10 kb per tile)",
            self.total,
            pretty_bytes::converter::convert(self.estimated_bytes() as f64)
        )
    }
}

pub fn summarize(descriptors: &[TileDescriptor]) -> PlanSummary {
    let mut summary = PlanSummary::default();
    for descriptor in descriptors {
        *summary
            .by_combination
            .entry(descriptor.local_tile().combination())
            .or_default() += 1;
        summary.total += 1;
    }
    summary
}
