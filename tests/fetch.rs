mod common;

use common::*;
use planning_tile_harvester::{
    build_descriptors, DescriptorFilter, ExistenceCache, ExitStatus, FailureReason, FetchConfig, FetchResult,
    Fetcher, ProgressEvent, ProgressHook, RetryPolicy, RunContext, TileCoord, TileDescriptor, TileResponse,
    UrlTemplate, Variant,
};
use futures::StreamExt;
use std::{path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;

fn config(root: &Path, zooms: Vec<u8>) -> FetchConfig {
    FetchConfig {
        tile_root: root.to_owned(),
        zooms,
        workers: 8,
        rate_per_second: 0,
        ..FetchConfig::default()
    }
}

fn single_tile() -> TileDescriptor {
    TileDescriptor {
        region_id: "hanoi".into(),
        variant: Variant::MasterPlan2030,
        subregion_id: None,
        coord: TileCoord::new(12, 3252, 1803).unwrap(),
        template: UrlTemplate::parse("https://tiles.example.vn/qh-2030/{z}/{x}/{y}.png").unwrap(),
    }
}

async fn start(
    source: ScriptedSource,
    config: FetchConfig,
) -> (Fetcher<ScriptedSource>, Arc<ScriptedSource>) {
    let ctx = RunContext::new(source, config.rate_per_second);
    let client = Arc::clone(&ctx.client);
    (Fetcher::new(ctx, config).await.unwrap(), client)
}

#[tokio::test]
async fn first_run_downloads_then_second_run_is_cached() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let descriptors =
        build_descriptors(&hanoi_registry(), &[12], &DescriptorFilter::default()).unwrap();
    assert_eq!(descriptors.len(), 121);

    let (fetcher, source) = start(ScriptedSource::serving_png(), config(&root, vec![12])).await;
    let report = fetcher.run(descriptors.clone()).await.unwrap();

    assert_eq!(report.downloaded, 121);
    assert_eq!(report.failed, 0);
    assert_eq!(report.exit_status(), ExitStatus::Success);
    assert_eq!(source.requests(), 121);

    let zoom_dir = root.join("hanoi/qh-2030/12");
    assert_eq!(std::fs::read_dir(&zoom_dir).unwrap().count(), 121);
    assert!(zoom_dir.join("3252_1803.png").is_file());
    assert_eq!(fetcher.cache().len().await, 121);
    drop(fetcher);

    // A fresh fetcher reads the persisted cache and issues no requests.
    let (fetcher, source) = start(ScriptedSource::serving_png(), config(&root, vec![12])).await;
    let report = fetcher.run(descriptors).await.unwrap();

    assert_eq!(report.cached, 121);
    assert_eq!(report.downloaded, 0);
    assert_eq!(source.requests(), 0);
    assert_eq!(report.exit_status(), ExitStatus::Success);
}

#[tokio::test]
async fn tiles_already_on_disk_are_not_fetched_again() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let (fetcher, source) = start(ScriptedSource::serving_png(), config(&root, vec![12])).await;
    assert!(fetcher.cache().is_empty().await);

    // Appears after the cache was built, e.g. copied in by hand.
    let tile = single_tile();
    write_tile(&root, &tile.relative_path(), &png_tile());
    let report = fetcher.run(vec![tile]).await.unwrap();

    assert_eq!(report.cached, 1);
    assert_eq!(source.requests(), 0);
}

#[tokio::test]
async fn annual_plan_is_laid_out_per_district() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let descriptors =
        build_descriptors(&backan_registry(), &[12], &DescriptorFilter::default()).unwrap();

    let (fetcher, _) = start(ScriptedSource::serving_png(), config(&root, vec![12])).await;
    let report = fetcher.run(descriptors).await.unwrap();
    assert_eq!(report.downloaded, 242);

    for district in ["huyen-a", "huyen-b"] {
        let zoom_dir = root.join("backan/kh-2025").join(district).join("12");
        assert_eq!(std::fs::read_dir(&zoom_dir).unwrap().count(), 121);
    }
    assert!(!root.join("backan/kh-2025/12").exists());
}

#[tokio::test]
async fn html_placeholder_is_rejected_without_retry() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let source = ScriptedSource::new(|_, _| Ok(TileResponse::from_bytes(200, None, &b"<html>"[..])));

    let (fetcher, source) = start(source, config(&root, vec![12])).await;
    let tile = single_tile();
    let dest = tile.local_tile().absolute(&root);

    let report = fetcher.run(vec![tile]).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(matches!(
        report.failures[0].reason,
        FailureReason::InvalidImage { .. }
    ));
    assert_eq!(report.failures[0].attempts, 1);
    assert_eq!(source.requests(), 1);
    assert!(!dest.exists());
    assert!(!dest.with_file_name("3252_1803.png.part").exists());
    assert_eq!(report.exit_status(), ExitStatus::PartialFailure);
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried_with_backoff() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let source = ScriptedSource::new(|_, previous| {
        if previous < 2 {
            Ok(TileResponse::from_bytes(503, None, Vec::new()))
        } else {
            Ok(png_response())
        }
    });

    let (fetcher, source) = start(source, config(&root, vec![12])).await;
    let outcomes: Vec<_> = fetcher.fetch_all(vec![single_tile()]).collect().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].result, FetchResult::Downloaded { size: 200 });
    assert_eq!(outcomes[0].attempts, 3);

    let times = source.request_times();
    assert_eq!(times.len(), 3);
    let first = times[1] - times[0];
    let second = times[2] - times[1];
    assert!(first >= Duration::from_millis(500) && first < Duration::from_secs(1));
    assert!(second >= Duration::from_secs(1) && second < Duration::from_secs(2));
}

#[tokio::test]
async fn client_errors_are_final() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let source = ScriptedSource::new(|_, _| Ok(TileResponse::from_bytes(404, None, Vec::new())));

    let (fetcher, source) = start(source, config(&root, vec![12])).await;
    let report = fetcher.run(vec![single_tile()]).await.unwrap();

    assert_eq!(
        report.failures[0].reason,
        FailureReason::HttpStatus { code: 404 }
    );
    assert_eq!(source.requests(), 1);
}

#[tokio::test]
async fn unreachable_server_is_a_transport_failure() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let source = ScriptedSource::new(|_, _| Err(FailureReason::transport("connection refused")));
    let config = FetchConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        ..config(&root, vec![12])
    };

    let (fetcher, source) = start(source, config).await;
    let report = fetcher.run(vec![single_tile()]).await.unwrap();

    assert_eq!(report.failures[0].attempts, 3);
    assert_eq!(source.requests(), 3);
    assert_eq!(report.exit_status(), ExitStatus::TransportFailure);
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let descriptors =
        build_descriptors(&hanoi_registry(), &[12], &DescriptorFilter::default()).unwrap();

    let (fetcher, source) = start(ScriptedSource::serving_png(), config(&root, vec![12])).await;
    fetcher.context().cancel.cancel();
    let report = fetcher.run(descriptors).await.unwrap();

    assert_eq!(source.requests(), 0);
    assert_eq!(report.failed, 121);
    assert!(report
        .failures
        .iter()
        .all(|f| f.reason == FailureReason::Cancelled));
    assert_eq!(report.exit_status(), ExitStatus::Cancelled);
}

#[tokio::test]
async fn panicking_hook_fails_the_tile_but_keeps_the_file() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let hook: ProgressHook = Arc::new(|event: &ProgressEvent<'_>| {
        if let ProgressEvent::Fetched(_) = event {
            panic!("progress display broke");
        }
    });

    let (fetcher, _) = start(ScriptedSource::serving_png(), config(&root, vec![12])).await;
    let fetcher = fetcher.with_hook(hook);
    let tile = single_tile();
    let relative = tile.relative_path();
    let report = fetcher.run(vec![tile]).await.unwrap();

    assert!(matches!(
        report.failures[0].reason,
        FailureReason::Internal { .. }
    ));
    assert!(root.join(&relative).is_file());
    assert!(fetcher.cache().contains(&relative).await);
}

fn cached_paths(root: &Path) -> Vec<String> {
    std::fs::read_to_string(ExistenceCache::file_for(root))
        .map(|body| body.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn cache_is_flushed_while_downloading() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cities");
    let config = FetchConfig {
        workers: 1,
        cache_flush_every: 2,
        ..config(&root, vec![12])
    };
    let tiles: Vec<TileDescriptor> = (0..3)
        .map(|dx| TileDescriptor {
            coord: TileCoord::new(12, 3252 + dx, 1803).unwrap(),
            ..single_tile()
        })
        .collect();

    let (fetcher, _) = start(ScriptedSource::serving_png(), config).await;
    {
        let outcomes = fetcher.fetch_all(tiles);
        futures::pin_mut!(outcomes);

        outcomes.next().await.unwrap();
        assert!(cached_paths(&root).is_empty());

        outcomes.next().await.unwrap();
        assert_eq!(cached_paths(&root).len(), 2);

        outcomes.next().await.unwrap();
        assert_eq!(cached_paths(&root).len(), 2);
        assert!(outcomes.next().await.is_none());
    }

    fetcher.shutdown().await.unwrap();
    assert_eq!(
        cached_paths(&root),
        vec![
            "hanoi/qh-2030/12/3252_1803.png",
            "hanoi/qh-2030/12/3253_1803.png",
            "hanoi/qh-2030/12/3254_1803.png",
        ]
    );
}
