mod common;

use std::time::{Duration, Instant};

use axum::http::{header::LOCATION, Method};
use common::{spawn_server, MockResponse, Recorded};
use serde_json::json;
use sling_it_client::{
    indexing::{self, IndexingClient},
    osgi::{BundleArchive, BundleState, ConfigValue, Configuration, OsgiConsoleClient},
    query::{QueryClient, QueryType, SERVLET_BUNDLE, SERVLET_PATH},
    ClientOptions, RetryConfig, SlingClient, SlingClientError,
};

const BUNDLE_PATH: &str = "/system/console/bundles/org.example.bundle.json";

fn client(base_url: &str) -> SlingClient {
    SlingClient::builder(base_url)
        .user("admin")
        .password("admin")
        .options(ClientOptions::default().with_retry(RetryConfig::new(0, 10)))
        .try_build()
        .expect("client must build")
}

fn bundle_body(state: &str) -> serde_json::Value {
    json!({
        "status": "Bundle information: 1 bundle in total",
        "data": [{
            "id": 42,
            "name": "Example",
            "symbolicName": "org.example.bundle",
            "version": "1.2.0",
            "state": state,
            "stateRaw": 32,
            "fragment": false
        }]
    })
}

#[tokio::test]
async fn bundle_details_are_read_from_the_console() {
    let server = spawn_server(|_, _| MockResponse::json(200, bundle_body("Active"))).await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    assert_eq!(
        osgi.bundle_state("org.example.bundle").await.expect("state"),
        BundleState::Active
    );
    assert_eq!(osgi.bundle_id("org.example.bundle").await.expect("id"), 42);
    assert_eq!(
        osgi.bundle_version("org.example.bundle")
            .await
            .expect("version"),
        "1.2.0"
    );
    assert_eq!(server.hits(BUNDLE_PATH), 3);
}

#[tokio::test]
async fn bundle_without_state_is_a_decode_error() {
    let server = spawn_server(|_, _| MockResponse::json(200, json!({"data": [{"id": 42}]}))).await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    let err = osgi
        .bundle("org.example.bundle")
        .await
        .expect_err("state is required");

    assert!(matches!(err, SlingClientError::Decode(_)));
}

#[tokio::test]
async fn waits_until_the_bundle_is_active() {
    let server = spawn_server(|_, hit| {
        let state = if hit < 3 { "Installed" } else { "Active" };
        MockResponse::json(200, bundle_body(state))
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    osgi.wait_bundle_started(
        "org.example.bundle",
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .expect("bundle becomes active");

    assert_eq!(server.hits(BUNDLE_PATH), 3);
}

#[tokio::test]
async fn bundle_that_never_starts_times_out_with_its_name() {
    let server = spawn_server(|_, _| MockResponse::json(200, bundle_body("Resolved"))).await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    let err = osgi
        .wait_bundle_started(
            "org.example.bundle",
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .await
        .expect_err("bundle stays resolved");

    assert!(err.is_timeout());
    assert!(err
        .to_string()
        .starts_with("Bundle org.example.bundle did not start in 100 ms"));
    assert!(server.hits(BUNDLE_PATH) >= 2);
}

#[tokio::test]
async fn start_bundle_posts_the_action_then_waits() {
    let server = spawn_server(|request, _| {
        if request.method == Method::POST {
            MockResponse::json(200, json!({"fragment": false, "stateRaw": 32}))
        } else {
            MockResponse::json(200, bundle_body("Active"))
        }
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    osgi.wait_start_bundle(
        "org.example.bundle",
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .expect("bundle starts");

    let action = server.last("/system/console/bundles/org.example.bundle");
    assert_eq!(action.form_param("action").as_deref(), Some("start"));
    assert_eq!(server.hits(BUNDLE_PATH), 1);
}

fn example_bundle() -> BundleArchive {
    BundleArchive::new("org.example.bundle", "example.jar", b"PK-example-jar".to_vec())
}

#[tokio::test]
async fn install_bundle_uploads_the_jar_and_waits_for_it() {
    let server = spawn_server(|request, hit| match request.method {
        Method::POST => MockResponse::new(302, "")
            .with_header(LOCATION, "/system/console/bundles"),
        _ if hit < 2 => MockResponse::new(404, ""),
        _ => MockResponse::json(200, bundle_body("Installed")),
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    osgi.wait_install_bundle(
        &example_bundle(),
        true,
        0,
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .expect("bundle installs");

    let upload = server.last("/system/console/bundles");
    assert!(upload
        .header("content-type")
        .is_some_and(|value| value.starts_with("multipart/form-data")));
    assert!(upload.body.contains("name=\"action\""));
    assert!(upload.body.contains("install"));
    assert!(upload.body.contains("filename=\"example.jar\""));
    assert!(upload.body.contains("PK-example-jar"));
    assert!(upload.body.contains("name=\"bundlestart\""));
    assert!(!upload.body.contains("bundlestartlevel"));
    assert_eq!(server.hits(BUNDLE_PATH), 2);
}

#[tokio::test]
async fn install_bundle_sends_the_start_level() {
    let server = spawn_server(|_, _| MockResponse::new(302, "")).await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    osgi.install_bundle(&example_bundle(), false, 20)
        .await
        .expect("console redirects after upload");

    let upload = server.last("/system/console/bundles");
    assert!(upload
        .body
        .contains("name=\"bundlestartlevel\"\r\n\r\n20\r\n"));
    assert!(!upload.body.contains("name=\"bundlestart\""));
}

#[tokio::test]
async fn install_with_retry_reports_a_bundle_that_never_appears() {
    let server = spawn_server(|request, _| match request.method {
        Method::POST => MockResponse::new(302, ""),
        _ => MockResponse::new(404, ""),
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    let installed = osgi
        .install_bundle_with_retry(&example_bundle(), true, 0, Duration::from_millis(10), 3)
        .await
        .expect("no hard failure");

    assert!(!installed);
    assert!(server.hits(BUNDLE_PATH) >= 2);
}

#[tokio::test]
async fn component_polling_accepts_satisfied() {
    let server = spawn_server(|_, hit| {
        if hit < 2 {
            MockResponse::new(404, "")
        } else {
            MockResponse::json(
                200,
                json!({"data": [{"name": "org.example.Component", "state": "satisfied"}]}),
            )
        }
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    osgi.wait_component_registered(
        "org.example.Component",
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .expect("component registers");

    assert_eq!(
        server.hits("/system/console/components/org.example.Component.json"),
        2
    );
}

#[tokio::test]
async fn service_polling_filters_by_bundle() {
    let server = spawn_server(|_, hit| {
        let bundle = if hit < 2 { "org.other" } else { "org.example.bundle" };
        MockResponse::json(
            200,
            json!({
                "status": "Services information: 1 service in total",
                "serviceCount": 1,
                "data": [{
                    "id": "7",
                    "types": "[org.example.Api, org.example.Other]",
                    "bundleId": 42,
                    "bundleSymbolicName": bundle
                }]
            }),
        )
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    osgi.wait_service_registered(
        "org.example.Api",
        Some("org.example.bundle"),
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .expect("service registers");

    assert_eq!(server.hits("/system/console/services.json"), 2);
}

#[tokio::test]
async fn configuration_appears_after_a_while() {
    let server = spawn_server(|_, hit| {
        if hit < 2 {
            MockResponse::json(200, json!({"pid": "org.example.Config", "properties": {}}))
        } else {
            MockResponse::json(
                200,
                json!({
                    "pid": "org.example.Config",
                    "bundle_location": null,
                    "properties": {
                        "enabled": {"is_set": true, "value": true},
                        "paths": {"is_set": true, "values": ["/a", "/b"]},
                        "unset": {"is_set": false, "value": "default"}
                    }
                }),
            )
        }
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));

    let configuration = osgi
        .wait_configuration("org.example.Config", Duration::from_secs(5))
        .await
        .expect("configuration appears");

    assert_eq!(
        configuration.get("enabled"),
        Some(&ConfigValue::Single("true".to_owned()))
    );
    assert!(configuration
        .get("paths")
        .is_some_and(|paths| paths.matches("/b")));
    assert!(!configuration.contains_key("unset"));
    assert_eq!(server.hits("/system/console/configMgr/org.example.Config"), 2);
}

#[tokio::test]
async fn edit_configuration_reads_the_pid_from_the_redirect() {
    let server = spawn_server(|_, _| {
        MockResponse::new(302, "").with_header(
            LOCATION,
            "http://localhost:8080/system/console/configMgr/org.example.Factory.1234",
        )
    })
    .await;
    let osgi = OsgiConsoleClient::new(client(&server.base_url));
    let mut properties = Configuration::new();
    properties.insert("enabled".to_owned(), ConfigValue::from("true"));
    properties.insert(
        "paths".to_owned(),
        ConfigValue::from(vec!["/a".to_owned(), "/b".to_owned()]),
    );

    let pid = osgi
        .edit_configuration(
            "org.example.Factory",
            Some("org.example.Factory"),
            &properties,
        )
        .await
        .expect("edit succeeds");

    assert_eq!(pid.as_deref(), Some("org.example.Factory.1234"));
    let post = server.requests().pop().expect("one request");
    assert_eq!(
        post.form_param("factoryPid").as_deref(),
        Some("org.example.Factory")
    );
    assert_eq!(
        post.form_param("propertylist").as_deref(),
        Some("enabled,paths")
    );
    assert_eq!(post.form_param("apply").as_deref(), Some("true"));
}

#[tokio::test]
async fn query_count_and_plan_use_the_servlet_parameters() {
    let server = spawn_server(|request, _| {
        if request.query_param("explain").as_deref() == Some("true") {
            MockResponse::json(200, json!({"plan": "[nt:base] as [a] /* traverse */"}))
        } else {
            MockResponse::json(200, json!({"total": 1234, "time": 3}))
        }
    })
    .await;
    let queries = QueryClient::new(client(&server.base_url));

    let total = queries
        .count("SELECT * FROM [nt:base]", QueryType::Sql2)
        .await
        .expect("count");
    let plan = queries
        .plan("//element(*, nt:base)", QueryType::XPath)
        .await
        .expect("plan");

    assert_eq!(total, 1234);
    assert_eq!(plan, "[nt:base] as [a] /* traverse */");
    let requests = server.requests();
    assert_eq!(requests[0].query_param("type").as_deref(), Some("JCR-SQL2"));
    assert_eq!(
        requests[0].query_param("query").as_deref(),
        Some("SELECT * FROM [nt:base]")
    );
    assert_eq!(requests[0].query_param("showresults").as_deref(), Some("false"));
    assert_eq!(requests[1].query_param("type").as_deref(), Some("xpath"));
}

#[tokio::test]
async fn missing_query_servlet_is_a_setup_error() {
    let server = spawn_server(|_, _| MockResponse::new(404, "")).await;
    let queries = QueryClient::new(client(&server.base_url));

    let err = queries
        .query("SELECT * FROM [nt:base]", QueryType::Sql2)
        .await
        .expect_err("servlet missing");

    assert!(matches!(err, SlingClientError::Setup(_)));
}

#[tokio::test]
async fn missing_query_servlet_is_installed_from_the_given_bundle() {
    let servlet_bundle_path = format!("/system/console/bundles/{SERVLET_BUNDLE}.json");
    let started_path = servlet_bundle_path.clone();
    let server = spawn_server(move |request, hit| {
        if request.path == SERVLET_PATH {
            return if hit == 1 {
                MockResponse::new(404, "")
            } else {
                MockResponse::json(200, json!({"total": 7, "time": 1}))
            };
        }
        if request.path == started_path {
            return MockResponse::json(
                200,
                json!({"data": [{"id": 9, "symbolicName": SERVLET_BUNDLE, "state": "Active"}]}),
            );
        }
        MockResponse::new(302, "")
    })
    .await;
    let queries = QueryClient::new(client(&server.base_url)).with_servlet_bundle(
        BundleArchive::new(SERVLET_BUNDLE, "query-servlet.jar", b"PK-servlet".to_vec()),
    );

    let total = queries
        .count("SELECT * FROM [nt:base]", QueryType::Sql2)
        .await
        .expect("count after install");

    assert_eq!(total, 7);
    assert_eq!(server.hits(SERVLET_PATH), 2);
    assert_eq!(server.hits("/system/console/bundles"), 1);
    assert!(server
        .last("/system/console/bundles")
        .body
        .contains("name=\"bundlestart\""));
    assert_eq!(server.hits(&servlet_bundle_path), 1);
}

#[tokio::test]
async fn lanes_come_from_the_async_indexer_configuration() {
    let server = spawn_server(|_, _| {
        MockResponse::json(
            200,
            json!({
                "properties": {
                    "asyncConfigs": {"values": ["async:5", "fulltext-async:5"]}
                }
            }),
        )
    })
    .await;

    let lanes = IndexingClient::new(client(&server.base_url))
        .lane_names()
        .await
        .expect("lanes");

    assert_eq!(lanes, ["async", "fulltext-async"]);
    let request = server.requests().pop().expect("one request");
    assert_eq!(request.method, Method::POST);
    assert_eq!(
        request.path,
        "/system/console/configMgr/org.apache.jackrabbit.oak.plugins.index.AsyncIndexerService"
    );
}

#[tokio::test]
async fn lanes_from_the_client_extension_skip_the_console() {
    let server = spawn_server(|_, _| MockResponse::new(500, "")).await;
    let client = SlingClient::builder(&server.base_url)
        .extension(indexing::INDEX_LANES_CSV, " async , fulltext-async ")
        .try_build()
        .expect("client must build");

    let lanes = IndexingClient::new(client).lane_names().await.expect("lanes");

    assert_eq!(lanes, ["async", "fulltext-async"]);
    assert!(server.requests().is_empty());
}

/// Repository that indexes the probe content on the second plain query and
/// rejects the index tag option.
fn indexing_route(request: &Recorded, _hit: usize) -> MockResponse {
    let path = request.path.as_str();
    if path == "/system/testing/query" {
        let query = request.query_param("query").unwrap_or_default();
        if query.contains("index tag") {
            return MockResponse::new(400, "unsupported option");
        }
        if request.query_param("explain").as_deref() == Some("true") {
            return MockResponse::json(
                200,
                json!({"plan": "[nt:base] as [a] /* lucene:testIndexingLane-async(/tmp/testing/waitForAsyncIndexing/oak:index/testIndexingLane-async) */"}),
            );
        }
        return MockResponse::json(200, json!({"total": 1, "time": 1}));
    }
    if request.method == Method::GET {
        return MockResponse::new(404, "");
    }
    if request.form_param(":operation").as_deref() == Some("delete") {
        return MockResponse::new(200, "");
    }
    if path.ends_with("/testIndexingLane-async") {
        return MockResponse::new(200, "");
    }
    MockResponse::new(201, "")
}

#[tokio::test]
async fn waits_for_async_indexing_and_cleans_up() {
    let server = spawn_server(indexing_route).await;
    let indexing = IndexingClient::new(client(&server.base_url)).with_lanes(["async"]);
    let before = indexing::total_waited();
    let started = Instant::now();

    indexing
        .wait_for_async_indexing(Duration::from_secs(5), Duration::from_millis(20))
        .await
        .expect("lane catches up");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(indexing::total_waited() >= before);

    let index_import = server.last(indexing::INDEX_PATH);
    assert_eq!(index_import.form_param(":operation").as_deref(), Some("import"));
    let definition: serde_json::Value = serde_json::from_str(
        &index_import
            .form_param(":content")
            .expect("index definition"),
    )
    .expect("definition is JSON");
    assert_eq!(definition["testIndexingLane-async"]["async"], "async");

    let reindex = server.last(&format!("{}/testIndexingLane-async", indexing::INDEX_PATH));
    assert_eq!(reindex.form_param("reindex").as_deref(), Some("true"));

    let requests = server.requests();
    let deleted = requests
        .iter()
        .find(|request| request.form_param(":operation").as_deref() == Some("delete"))
        .expect("probe content is deleted");
    assert!(deleted
        .path
        .starts_with("/tmp/testing/waitForAsyncIndexing/content/"));
    let imported = requests
        .iter()
        .find(|request| {
            request.path == deleted.path
                && request.form_param(":operation").as_deref() == Some("import")
        })
        .expect("probe content is imported");
    assert!(imported
        .form_param(":content")
        .is_some_and(|content| content.contains("testProp-async")));
}

#[tokio::test]
async fn indexing_install_is_skipped_when_present() {
    let server = spawn_server(|_, _| MockResponse::new(200, "{}")).await;
    let indexing = IndexingClient::new(client(&server.base_url)).with_lanes(["async"]);

    indexing.install().await.expect("install is a no-op");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/tmp/testing/waitForAsyncIndexing.json");
}
