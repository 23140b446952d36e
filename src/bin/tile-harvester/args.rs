use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::validators::*;
use planning_tile_harvester::{
    state_dir, DescriptorFilter, ExistenceMode, FetchConfig, PublishConfig, PublishFilters,
    PublishOptions, RetryPolicy, Variant, DEFAULT_TILE_ROOT, FETCH_REPORT_FILE_NAME,
    STORAGE_CONFIG_FILE_NAME, UPLOAD_REPORT_FILE_NAME,
};

const PLAN_CMD: &str = "plan";
const FETCH_CMD: &str = "fetch";
const PUBLISH_CMD: &str = "publish";
const INVENTORY_CMD: &str = "inventory";

const VERBOSE_ARG: &str = "verbose";
const INPUT_ARG: &str = "input";
const ZOOM_ARG: &str = "zoom";
const REGION_ARG: &str = "region";
const VARIANT_ARG: &str = "variant";
const TILES_ARG: &str = "tiles";
const WORKERS_ARG: &str = "workers";
const PARALLEL_ARG: &str = "parallel";
const RATE_ARG: &str = "rate";
const RETRIES_ARG: &str = "retries";
const TIMEOUT_ARG: &str = "timeout";
const DRY_RUN_ARG: &str = "dry_run";
const FETCH_EXISTING_ARG: &str = "fetch_existing";
const REPORT_ARG: &str = "report";
const PREFIX_ARG: &str = "prefix";
const PER_OBJECT_ARG: &str = "per_object";
const SKIP_COMBINATIONS_ARG: &str = "skip_existing_combinations";
const STORAGE_CONFIG_ARG: &str = "storage_config";
const JSON_ARG: &str = "json";

pub struct PlanArgs {
    pub input: PathBuf,
    pub zooms: Vec<u8>,
    pub filter: DescriptorFilter,
}

pub struct FetchArgs {
    pub input: PathBuf,
    pub filter: DescriptorFilter,
    pub config: FetchConfig,
    pub report: PathBuf,
    pub dry_run: bool,
}

pub struct PublishArgs {
    pub config: PublishConfig,
    pub storage_config: PathBuf,
    pub report: PathBuf,
}

pub struct InventoryArgs {
    pub tiles: PathBuf,
    pub json: bool,
}

pub enum Subcommand {
    Plan(PlanArgs),
    Fetch(FetchArgs),
    Publish(PublishArgs),
    Inventory(InventoryArgs),
}

pub struct Args {
    pub verbosity: u8,
    pub command: Subcommand,
}

impl Args {
    pub fn parse() -> Self {
        let matches = get_matches();
        let verbosity = matches.get_count(VERBOSE_ARG);

        let command = match matches.subcommand() {
            Some((PLAN_CMD, m)) => Subcommand::Plan(PlanArgs {
                input: input(m),
                zooms: zooms(m),
                filter: descriptor_filter(m),
            }),
            Some((FETCH_CMD, m)) => Subcommand::Fetch(fetch_args(m)),
            Some((PUBLISH_CMD, m)) => Subcommand::Publish(publish_args(m)),
            Some((INVENTORY_CMD, m)) => Subcommand::Inventory(InventoryArgs {
                tiles: tiles(m),
                json: m.get_flag(JSON_ARG),
            }),
            // `subcommand_required` rules everything else out.
            _ => unreachable!("clap accepted an unknown subcommand"),
        };

        Self { verbosity, command }
    }
}

fn fetch_args(m: &ArgMatches) -> FetchArgs {
    let tiles = tiles(m);
    let defaults = FetchConfig::default();
    let timeout = m.get_one::<usize>(TIMEOUT_ARG).copied().unwrap_or(15);

    let mut http = defaults.http.clone();
    http.request_timeout = Duration::from_secs(timeout as u64);

    FetchArgs {
        input: input(m),
        filter: descriptor_filter(m),
        report: report(m, &tiles, FETCH_REPORT_FILE_NAME),
        dry_run: m.get_flag(DRY_RUN_ARG),
        config: FetchConfig {
            tile_root: tiles,
            zooms: zooms(m),
            workers: m
                .get_one::<usize>(WORKERS_ARG)
                .copied()
                .unwrap_or(defaults.workers),
            rate_per_second: m
                .get_one::<u32>(RATE_ARG)
                .copied()
                .unwrap_or(defaults.rate_per_second),
            retry: retry(m),
            fetch_existing: m.get_flag(FETCH_EXISTING_ARG),
            http,
            ..defaults
        },
    }
}

fn publish_args(m: &ArgMatches) -> PublishArgs {
    let tiles = tiles(m);
    let defaults = PublishConfig::default();

    let options = PublishOptions {
        parallelism: m
            .get_one::<usize>(PARALLEL_ARG)
            .copied()
            .unwrap_or(defaults.options.parallelism),
        dry_run: m.get_flag(DRY_RUN_ARG),
        skip_existing_combinations: m.get_flag(SKIP_COMBINATIONS_ARG),
        existence: if m.get_flag(PER_OBJECT_ARG) {
            ExistenceMode::PerObject
        } else {
            ExistenceMode::BatchPrefix
        },
        retry: retry(m),
        ..defaults.options
    };

    let zooms: BTreeSet<u8> = zooms(m).into_iter().collect();

    PublishArgs {
        report: report(m, &tiles, UPLOAD_REPORT_FILE_NAME),
        storage_config: m
            .get_one::<PathBuf>(STORAGE_CONFIG_ARG)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(STORAGE_CONFIG_FILE_NAME)),
        config: PublishConfig {
            tile_root: tiles,
            prefix: m.get_one::<String>(PREFIX_ARG).cloned().unwrap_or_default(),
            filters: PublishFilters {
                regions: regions(m),
                variants: variants(m),
                zooms: (!zooms.is_empty()).then_some(zooms),
            },
            options,
            rate_per_second: m
                .get_one::<u32>(RATE_ARG)
                .copied()
                .unwrap_or(defaults.rate_per_second),
        },
    }
}

fn input(m: &ArgMatches) -> PathBuf {
    m.get_one::<PathBuf>(INPUT_ARG).cloned().unwrap_or_default()
}

fn tiles(m: &ArgMatches) -> PathBuf {
    m.get_one::<PathBuf>(TILES_ARG)
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TILE_ROOT))
}

fn zooms(m: &ArgMatches) -> Vec<u8> {
    m.get_many::<Vec<u8>>(ZOOM_ARG)
        .map(|sets| sets.flatten().copied().collect())
        .unwrap_or_default()
}

fn regions(m: &ArgMatches) -> Option<BTreeSet<String>> {
    m.get_many::<String>(REGION_ARG)
        .map(|values| values.cloned().collect())
}

fn variants(m: &ArgMatches) -> Option<BTreeSet<Variant>> {
    m.get_many::<Variant>(VARIANT_ARG)
        .map(|values| values.copied().collect())
}

fn descriptor_filter(m: &ArgMatches) -> DescriptorFilter {
    DescriptorFilter {
        regions: regions(m),
        variants: variants(m),
    }
}

fn retry(m: &ArgMatches) -> RetryPolicy {
    let retries = m.get_one::<usize>(RETRIES_ARG).copied().unwrap_or(2);
    RetryPolicy {
        max_attempts: u32::try_from(retries).unwrap_or(u32::MAX).saturating_add(1),
        ..RetryPolicy::default()
    }
}

/// The report goes next to the tile root unless a path is given.
fn report(m: &ArgMatches, tiles: &Path, file_name: &str) -> PathBuf {
    m.get_one::<PathBuf>(REPORT_ARG)
        .cloned()
        .unwrap_or_else(|| state_dir(tiles).join(file_name))
}

fn input_arg() -> Arg {
    Arg::new(INPUT_ARG)
        .help("The template input file (JSON) listing regions, centroids and tile URL templates.")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .short('i')
        .long("input")
}

fn zoom_arg(required: bool) -> Arg {
    Arg::new(ZOOM_ARG)
        .help("Zoom levels: a single level, a comma separated list or an inclusive range like `12..14`. May be repeated.")
        .required(required)
        .value_parser(is_zoom_set)
        .action(ArgAction::Append)
        .short('z')
        .long("zoom")
}

fn region_arg() -> Arg {
    Arg::new(REGION_ARG)
        .help("Only handle this region (id or display name). May be repeated.")
        .value_parser(is_region)
        .action(ArgAction::Append)
        .long("region")
}

fn variant_arg() -> Arg {
    Arg::new(VARIANT_ARG)
        .help("Only handle this planning layer, e.g. `qh-2030` or `kh-2025`. May be repeated.")
        .value_parser(is_variant)
        .action(ArgAction::Append)
        .long("variant")
}

fn tiles_arg() -> Arg {
    Arg::new(TILES_ARG)
        .help("Root of the local tile tree. State files and reports live next to it.")
        .default_value(DEFAULT_TILE_ROOT)
        .value_parser(value_parser!(PathBuf))
        .short('o')
        .long("tiles")
}

fn rate_arg(default: &'static str) -> Arg {
    Arg::new(RATE_ARG)
        .help("Maximum requests per second. Pass 0 for no limit.")
        .default_value(default)
        .value_parser(is_rate)
        .short('r')
        .long("rate")
}

fn retries_arg() -> Arg {
    Arg::new(RETRIES_ARG)
        .help("The amount of times to retry a failed request.")
        .default_value("2")
        .value_parser(is_numeric_min(0))
        .long("retries")
}

fn dry_run_arg(help: &'static str) -> Arg {
    Arg::new(DRY_RUN_ARG)
        .help(help)
        .action(ArgAction::SetTrue)
        .long("dry-run")
}

fn report_arg() -> Arg {
    Arg::new(REPORT_ARG)
        .help("Where to write the JSON report; a .txt summary is written next to it.")
        .value_parser(value_parser!(PathBuf))
        .long("report")
}

fn get_matches() -> ArgMatches {
    command!()
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new(VERBOSE_ARG)
                .help("Log more. Pass twice for trace output. RUST_LOG overrides this.")
                .action(ArgAction::Count)
                .global(true)
                .short('v')
                .long("verbose"),
        )
        .subcommand(
            Command::new(PLAN_CMD)
                .about("Print how many tiles a fetch would request, per region and layer.")
                .arg(input_arg())
                .arg(zoom_arg(true))
                .arg(region_arg())
                .arg(variant_arg()),
        )
        .subcommand(
            Command::new(FETCH_CMD)
                .about("Download tiles into the local tile tree.")
                .arg(input_arg())
                .arg(zoom_arg(true))
                .arg(region_arg())
                .arg(variant_arg())
                .arg(tiles_arg())
                .arg(
                    Arg::new(WORKERS_ARG)
                        .help("The amount of tiles fetched in parallel.")
                        .default_value("50")
                        .value_parser(is_numeric_min(1))
                        .short('w')
                        .long("workers"),
                )
                .arg(rate_arg("250"))
                .arg(retries_arg())
                .arg(
                    Arg::new(TIMEOUT_ARG)
                        .help("The timeout (in seconds) for fetching a single tile.")
                        .default_value("15")
                        .value_parser(is_numeric_min(1))
                        .short('t')
                        .long("timeout"),
                )
                .arg(
                    Arg::new(FETCH_EXISTING_ARG)
                        .help("Fetch tiles that are already on disk but unknown to the cache (this usually isn't required)")
                        .action(ArgAction::SetTrue)
                        .long("fetch-existing"),
                )
                .arg(report_arg())
                .arg(dry_run_arg(
                    "Don't actually fetch anything, just determine how many tiles would be fetched.",
                )),
        )
        .subcommand(
            Command::new(PUBLISH_CMD)
                .about("Upload the local tile tree to S3-compatible storage.")
                .arg(tiles_arg())
                .arg(
                    Arg::new(PREFIX_ARG)
                        .help("Key prefix inside the bucket.")
                        .short('p')
                        .long("prefix"),
                )
                .arg(region_arg())
                .arg(variant_arg())
                .arg(zoom_arg(false))
                .arg(
                    Arg::new(PARALLEL_ARG)
                        .help("The amount of objects uploaded in parallel (at most 15).")
                        .default_value("10")
                        .value_parser(is_numeric_min(1))
                        .long("parallel"),
                )
                .arg(rate_arg("200"))
                .arg(retries_arg())
                .arg(
                    Arg::new(PER_OBJECT_ARG)
                        .help("Check every object with HEAD instead of listing each layer once.")
                        .action(ArgAction::SetTrue)
                        .long("per-object"),
                )
                .arg(
                    Arg::new(SKIP_COMBINATIONS_ARG)
                        .help("Skip a whole layer when the bucket already holds at least as many objects as there are local files.")
                        .action(ArgAction::SetTrue)
                        .long("skip-existing-combinations"),
                )
                .arg(
                    Arg::new(STORAGE_CONFIG_ARG)
                        .help("JSON file with STORAGE_* settings, used for keys missing from the environment.")
                        .default_value(STORAGE_CONFIG_FILE_NAME)
                        .value_parser(value_parser!(PathBuf))
                        .long("storage-config"),
                )
                .arg(report_arg())
                .arg(dry_run_arg(
                    "Don't upload anything, just report what would be uploaded.",
                )),
        )
        .subcommand(
            Command::new(INVENTORY_CMD)
                .about("Count the tiles on disk per region, layer and zoom level.")
                .arg(tiles_arg())
                .arg(
                    Arg::new(JSON_ARG)
                        .help("Print JSON instead of a table.")
                        .action(ArgAction::SetTrue)
                        .long("json"),
                ),
        )
        .get_matches()
}
