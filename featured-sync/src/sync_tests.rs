use super::*;
use std::sync::Arc;
use std::time::Duration;

use deviant_core::{DeviantClient, MemoryTokenStore, OAuthClient, RetryPolicy, TokenManager};
use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RECENT: i64 = 2_000_000_000;
const OLD: i64 = 1_000;

fn cutoff() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_900_000_000).unwrap()
}

async fn sync_for(server: &MockServer, options: SyncOptions) -> FeaturedSync {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token-1",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
    let oauth = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let tokens = Arc::new(TokenManager::new(
        oauth,
        "refresh-1",
        Arc::new(MemoryTokenStore::new()),
    ));
    let client = DeviantClient::with_base_url(&server.uri(), tokens)
        .unwrap()
        .with_policy(RetryPolicy {
            min_delay: Duration::ZERO,
            ..RetryPolicy::default()
        })
        .unwrap();
    FeaturedSync::new(Gallery::new(client), options)
}

fn options(target: &str, top_n: usize) -> SyncOptions {
    SyncOptions {
        target_folder: target.to_string(),
        top_n,
        ..SyncOptions::default()
    }
}

fn deviation(id: &str, published: i64, favourites: u64) -> Value {
    json!({
        "deviationid": id,
        "published_time": published.to_string(),
        "stats": { "favourites": favourites }
    })
}

async fn mount_folders(server: &MockServer, folders: Value) {
    Mock::given(method("GET"))
        .and(path("/gallery/folders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": folders,
            "has_more": false,
            "next_offset": null
        })))
        .mount(server)
        .await;
}

async fn mount_contents(server: &MockServer, folderid: &str, results: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(format!("/gallery/{folderid}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": results,
            "has_more": false,
            "next_offset": null
        })))
        .mount(server)
        .await;
}

async fn mount_mutation(server: &MockServer, endpoint: &str, success: bool, expected: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/gallery/folders/{endpoint}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": success })))
        .expect(expected)
        .mount(server)
        .await;
}

fn standard_folders() -> Value {
    json!([
        { "folderid": "f-a", "name": "Sketches", "parent": null },
        { "folderid": "f-b", "name": "Paintings", "parent": null },
        { "folderid": "f-c", "name": "Featured", "parent": null }
    ])
}

async fn batch_sizes(server: &MockServer, endpoint: &str) -> Vec<usize> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == format!("/gallery/folders/{endpoint}"))
        .map(|request| {
            String::from_utf8_lossy(&request.body)
                .matches("deviationids%5B%5D=")
                .count()
        })
        .collect()
}

#[tokio::test]
async fn replaces_target_contents_with_ranking() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("featured", 2)).await;
    mount_folders(&server, standard_folders()).await;
    mount_contents(
        &server,
        "f-a",
        vec![deviation("dev1", RECENT, 5), deviation("dev2", OLD, 50)],
    )
    .await;
    mount_contents(
        &server,
        "f-b",
        vec![deviation("dev3", RECENT, 9), deviation("dev1", RECENT, 3)],
    )
    .await;
    // The first read is the snapshot; the scan after clearing sees it empty.
    Mock::given(method("GET"))
        .and(path("/gallery/f-c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [deviation("dev4", RECENT, 100)],
            "has_more": false
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_contents(&server, "f-c", vec![]).await;
    Mock::given(method("POST"))
        .and(path("/gallery/folders/remove_deviations"))
        .and(body_string_contains("folderid=f-c&deviationids%5B%5D=dev4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/gallery/folders/copy_deviations"))
        .and(body_string_contains(
            "target_folderid=f-c&deviationids%5B%5D=dev3&deviationids%5B%5D=dev1",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync.run_with_cutoff(cutoff()).await.unwrap();

    assert_eq!(report.target_folderid, "f-c");
    assert_eq!(report.removed, 1);
    assert_eq!(report.scanned, 2);
    assert_eq!(
        report.ranked,
        vec![("dev3".to_string(), 9), ("dev1".to_string(), 5)]
    );
    assert_eq!(report.copied, vec!["dev3".to_string(), "dev1".to_string()]);
}

#[tokio::test]
async fn missing_target_fails_during_folder_lookup() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("Top 20 Favorites", 20)).await;
    mount_folders(&server, standard_folders()).await;
    mount_mutation(&server, "remove_deviations", true, 0).await;
    mount_mutation(&server, "copy_deviations", true, 0).await;

    let err = sync.run_with_cutoff(cutoff()).await.expect_err("expected failure");

    assert_eq!(err.phase(), SyncPhase::FolderLookup);
    assert!(matches!(
        err,
        SyncError::Api {
            source: ApiError::FolderNotFound(_),
            ..
        }
    ));
}

#[tokio::test]
async fn rejected_remove_aborts_before_copy() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("Featured", 20)).await;
    mount_folders(&server, standard_folders()).await;
    mount_contents(&server, "f-a", vec![deviation("dev1", RECENT, 5)]).await;
    mount_contents(&server, "f-b", vec![]).await;
    mount_contents(&server, "f-c", vec![deviation("dev4", RECENT, 1)]).await;
    mount_mutation(&server, "remove_deviations", false, 1).await;
    mount_mutation(&server, "copy_deviations", true, 0).await;

    let err = sync.run_with_cutoff(cutoff()).await.expect_err("expected failure");

    assert!(matches!(
        err,
        SyncError::Rejected {
            phase: SyncPhase::Clear,
            size: 1
        }
    ));
}

#[tokio::test]
async fn copies_in_batches_of_at_most_24() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("Featured", 50)).await;
    mount_folders(&server, standard_folders()).await;
    let many: Vec<Value> = (0..50)
        .map(|n| deviation(&format!("dev{n}"), RECENT, 100 - n as u64))
        .collect();
    mount_contents(&server, "f-a", many).await;
    mount_contents(&server, "f-b", vec![]).await;
    mount_contents(&server, "f-c", vec![]).await;
    mount_mutation(&server, "remove_deviations", true, 0).await;
    mount_mutation(&server, "copy_deviations", true, 3).await;

    let report = sync.run_with_cutoff(cutoff()).await.unwrap();

    assert_eq!(report.removed, 0);
    assert_eq!(report.copied.len(), 50);
    assert_eq!(report.copied.first().map(String::as_str), Some("dev0"));
    assert_eq!(batch_sizes(&server, "copy_deviations").await, vec![24, 24, 2]);
}

#[tokio::test]
async fn empty_ranking_skips_copy() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("Featured", 20)).await;
    mount_folders(&server, standard_folders()).await;
    mount_contents(&server, "f-a", vec![deviation("dev1", OLD, 5)]).await;
    mount_contents(&server, "f-b", vec![json!({ "title": "no id" })]).await;
    mount_contents(&server, "f-c", vec![]).await;
    mount_mutation(&server, "remove_deviations", true, 0).await;
    mount_mutation(&server, "copy_deviations", true, 0).await;

    let report = sync.run_with_cutoff(cutoff()).await.unwrap();

    assert_eq!(report.scanned, 0);
    assert!(report.ranked.is_empty());
    assert!(report.copied.is_empty());
}

#[tokio::test]
async fn folders_without_id_are_not_scanned() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("Featured", 5)).await;
    mount_folders(
        &server,
        json!([
            { "name": "Featured", "parent": null },
            { "folderid": "f-a", "name": "Sketches", "parent": null },
            { "folderid": "f-c", "name": "Featured", "parent": "f-a" }
        ]),
    )
    .await;
    mount_contents(&server, "f-a", vec![deviation("dev1", RECENT, 5)]).await;
    mount_contents(&server, "f-c", vec![]).await;
    mount_mutation(&server, "remove_deviations", true, 0).await;
    mount_mutation(&server, "copy_deviations", true, 1).await;

    let report = sync.run_with_cutoff(cutoff()).await.unwrap();

    assert_eq!(report.target_folderid, "f-c");
    assert_eq!(report.copied, vec!["dev1".to_string()]);
    let scanned_paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.method.as_str() == "GET")
        .map(|request| request.url.path().to_string())
        .filter(|request_path| request_path != "/gallery/folders")
        .collect();
    assert_eq!(
        scanned_paths,
        vec!["/gallery/f-c", "/gallery/f-a", "/gallery/f-c"]
    );
}

#[tokio::test]
async fn dry_run_leaves_gallery_untouched() {
    let server = MockServer::start().await;
    let sync = sync_for(
        &server,
        SyncOptions {
            dry_run: true,
            ..options("Featured", 1)
        },
    )
    .await;
    mount_folders(&server, standard_folders()).await;
    mount_contents(&server, "f-a", vec![deviation("dev1", RECENT, 5)]).await;
    mount_contents(&server, "f-b", vec![deviation("dev3", RECENT, 9)]).await;
    mount_contents(&server, "f-c", vec![deviation("dev4", RECENT, 1)]).await;
    mount_mutation(&server, "remove_deviations", true, 0).await;
    mount_mutation(&server, "copy_deviations", true, 0).await;

    let report = sync.run_with_cutoff(cutoff()).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.removed, 0);
    assert_eq!(report.scanned, 3);
    assert_eq!(report.ranked, vec![("dev3".to_string(), 9)]);
    assert!(report.copied.is_empty());
}

#[tokio::test]
async fn copy_failure_is_reported_as_repopulate() {
    let server = MockServer::start().await;
    let sync = sync_for(&server, options("Featured", 20)).await;
    mount_folders(&server, standard_folders()).await;
    mount_contents(&server, "f-a", vec![deviation("dev1", RECENT, 5)]).await;
    mount_contents(&server, "f-b", vec![]).await;
    mount_contents(&server, "f-c", vec![]).await;
    Mock::given(method("POST"))
        .and(path("/gallery/folders/copy_deviations"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_request"))
        .expect(1)
        .mount(&server)
        .await;

    let err = sync.run_with_cutoff(cutoff()).await.expect_err("expected failure");

    assert_eq!(err.phase(), SyncPhase::Repopulate);
    assert!(err.to_string().starts_with("repopulate failed"));
}

#[test]
fn chunked_keeps_order_and_bounds_size() {
    let ids: Vec<u32> = (0..50).collect();
    let batches: Vec<&[u32]> = chunked(&ids, MAX_DEVIATIONIDS_PER_MUTATION).collect();
    let sizes: Vec<usize> = batches.iter().map(|batch| batch.len()).collect();
    assert_eq!(sizes, vec![24, 24, 2]);
    assert_eq!(batches.concat(), ids);
    assert_eq!(chunked::<u32>(&[], 24).count(), 0);
}

#[test]
fn phase_labels() {
    assert_eq!(SyncPhase::FolderLookup.to_string(), "folder lookup");
    assert_eq!(SyncPhase::Repopulate.to_string(), "repopulate");
}
