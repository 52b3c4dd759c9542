//! Waits until every asynchronous Oak indexing lane has caught up.
//!
//! A throwaway index per lane is installed below [`ROOT`]. Waiting writes a
//! uniquely valued property for each lane and polls until a query served by
//! that lane's index finds it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::osgi::{ConfigValue, OsgiConsoleClient};
use crate::query::{QueryClient, QueryType};
use crate::{Result, SlingClient, SlingClientError};

/// Client extension holding a comma separated list of lane names.
pub const INDEX_LANES_CSV: &str = "indexLanesCsv";

pub const ROOT: &str = "/tmp/testing/waitForAsyncIndexing";
pub const INDEX_PATH: &str = "/tmp/testing/waitForAsyncIndexing/oak:index";
pub const CONTENT_PATH: &str = "/tmp/testing/waitForAsyncIndexing/content";

const ASYNC_INDEXER_PID: &str = "org.apache.jackrabbit.oak.plugins.index.AsyncIndexerService";
const INDEX_PREFIX: &str = "testIndexingLane-";
const PROPERTY_PREFIX: &str = "testProp-";
const VALUE_PREFIX: &str = "testasyncval-";
const TAG_PREFIX: &str = "testTag";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_DELAY: Duration = Duration::from_millis(500);

static TOTAL_WAITED_MS: AtomicU64 = AtomicU64::new(0);

/// Time spent in [`IndexingClient::wait_for_async_indexing`] by this process.
pub fn total_waited() -> Duration {
    Duration::from_millis(TOTAL_WAITED_MS.load(Ordering::Relaxed))
}

#[derive(Clone, Debug)]
pub struct IndexingClient {
    client: SlingClient,
    lanes: Option<Vec<String>>,
}

impl IndexingClient {
    pub fn new(client: SlingClient) -> Self {
        Self {
            client,
            lanes: None,
        }
    }

    /// Uses `lanes` instead of asking the server.
    pub fn with_lanes<I, S>(mut self, lanes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lanes = Some(lanes.into_iter().map(Into::into).collect());
        self
    }

    pub fn client(&self) -> &SlingClient {
        &self.client
    }

    /// Names of the async lanes, e.g. `async` and `fulltext-async`.
    ///
    /// Explicit lanes win, then the [`INDEX_LANES_CSV`] client extension,
    /// then the `asyncConfigs` of the async indexer configuration.
    pub async fn lane_names(&self) -> Result<Vec<String>> {
        if let Some(lanes) = &self.lanes {
            return Ok(lanes.clone());
        }
        if let Some(csv) = self.client.extension(INDEX_LANES_CSV) {
            let lanes = split_lanes(csv);
            if !lanes.is_empty() {
                return Ok(lanes);
            }
        }

        let properties = OsgiConsoleClient::new(self.client.clone())
            .configuration_properties(ASYNC_INDEXER_PID)
            .await
            .map_err(|err| {
                SlingClientError::Setup(format!("failed to retrieve the indexing lanes: {err}"))
            })?;
        match properties.get("asyncConfigs") {
            Some(ConfigValue::Multi(configs)) => Ok(configs
                .iter()
                .map(|config| lane_from_async_config(config).to_owned())
                .collect()),
            _ => Err(SlingClientError::Decode(format!(
                "{ASYNC_INDEXER_PID} has no multi-valued asyncConfigs"
            ))),
        }
    }

    /// Installs one test index per lane. Does nothing when already installed.
    pub async fn install(&self) -> Result<()> {
        if self.client.exists(ROOT).await? {
            debug!(root = ROOT, "indexing test content already installed");
            return Ok(());
        }

        self.client.create_node_recursive(ROOT, "sling:Folder").await?;
        self.client.create_node(INDEX_PATH, "nt:unstructured").await?;
        self.client.create_node(CONTENT_PATH, "sling:Folder").await?;

        for lane in self.lane_names().await? {
            let name = index_name(&lane);
            self.client
                .import_json(INDEX_PATH, &index_definition(&lane))
                .await?;
            self.client
                .set_property_string(&format!("{INDEX_PATH}/{name}"), "reindex", "true")
                .await?;
            info!(lane = %lane, index = %name, "installed indexing lane probe");
        }
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.client.delete_path(ROOT).await?;
        Ok(())
    }

    /// [`wait_for_async_indexing`](Self::wait_for_async_indexing) with
    /// 60 s timeout and 500 ms delay.
    pub async fn wait_for_async_indexing_default(&self) -> Result<()> {
        self.wait_for_async_indexing(DEFAULT_TIMEOUT, DEFAULT_DELAY)
            .await
    }

    /// Blocks until every lane has indexed freshly written content.
    pub async fn wait_for_async_indexing(&self, timeout: Duration, delay: Duration) -> Result<()> {
        self.install().await?;
        let lanes = self.lane_names().await?;
        let unique = Uuid::new_v4().to_string();
        let holder = format!("{CONTENT_PATH}/{unique}");
        info!(lanes = ?lanes, "waiting for async indexing");

        self.create_content(&holder, &lanes, &unique).await?;

        let lanes_ref = &lanes;
        let unique_ref = unique.as_str();
        let result = self
            .client
            .poller(timeout, delay)
            .describe("Async indexing did not catch up")
            .poll(move || async move { self.search_content(lanes_ref, unique_ref).await })
            .await;

        let waited = match &result {
            Ok(outcome) => outcome.elapsed,
            Err(SlingClientError::PollTimeout { elapsed, .. }) => *elapsed,
            Err(_) => Duration::ZERO,
        };
        let total = TOTAL_WAITED_MS.fetch_add(waited.as_millis() as u64, Ordering::Relaxed)
            + waited.as_millis() as u64;
        info!(
            waited_ms = waited.as_millis() as u64,
            total_ms = total,
            "async indexing wait finished"
        );

        if let Err(err) = self.client.delete_path(&holder).await {
            warn!(path = %holder, error = %err, "could not remove indexing probe content");
        }
        result.map(|_| ())
    }

    async fn create_content(&self, holder: &str, lanes: &[String], unique: &str) -> Result<()> {
        self.client.create_node(holder, "sling:Folder").await?;
        for lane in lanes {
            self.client
                .import_json(holder, &content_definition(lane, unique))
                .await?;
        }
        Ok(())
    }

    /// True once every lane's index returns the probe content.
    async fn search_content(&self, lanes: &[String], unique: &str) -> Result<bool> {
        let queries = QueryClient::new(self.client.clone());
        for lane in lanes {
            if !self.lane_found(&queries, lane, unique).await? {
                debug!(lane = %lane, "lane not indexed yet");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn lane_found(&self, queries: &QueryClient, lane: &str, unique: &str) -> Result<bool> {
        let index = index_name(lane);
        for query in lane_queries(lane, unique) {
            let plan = match queries.plan(&query, QueryType::XPath).await {
                Ok(plan) => plan,
                // older repositories reject the index tag option
                Err(err) if err.http_status() == Some(400) => continue,
                Err(err) => return Err(err),
            };
            if !plan.contains(&index) {
                continue;
            }
            match queries.count(&query, QueryType::XPath).await {
                Ok(count) if count > 0 => return Ok(true),
                Ok(_) => {}
                Err(err) if err.http_status() == Some(400) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }
}

fn split_lanes(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|lane| !lane.is_empty())
        .map(str::to_owned)
        .collect()
}

/// `async:5` names the `async` lane.
fn lane_from_async_config(config: &str) -> &str {
    config.split_once(':').map_or(config, |(lane, _)| lane)
}

fn index_name(lane: &str) -> String {
    format!("{INDEX_PREFIX}{lane}")
}

fn property_name(lane: &str) -> String {
    format!("{PROPERTY_PREFIX}{lane}")
}

/// `fulltext-async` is tagged `testTagFulltextasync`.
fn index_tag(lane: &str) -> String {
    let mut alnum = lane.chars().filter(char::is_ascii_alphanumeric);
    let mut tag = TAG_PREFIX.to_owned();
    if let Some(first) = alnum.next() {
        tag.push(first.to_ascii_uppercase());
        tag.extend(alnum);
    }
    tag
}

fn index_definition(lane: &str) -> JsonValue {
    let property = property_name(lane);
    json!({
        index_name(lane): {
            "jcr:primaryType": "oak:QueryIndexDefinition",
            "type": "lucene",
            "async": lane,
            "tags": index_tag(lane),
            "indexRules": {
                "jcr:primaryType": "nt:unstructured",
                "nt:base": {
                    "jcr:primaryType": "nt:unstructured",
                    "properties": {
                        "jcr:primaryType": "nt:unstructured",
                        property.clone(): {
                            "jcr:primaryType": "nt:unstructured",
                            "name": property,
                            "analyzed": true
                        }
                    }
                }
            }
        }
    })
}

fn content_definition(lane: &str, unique: &str) -> JsonValue {
    let value = format!("{VALUE_PREFIX}{unique}");
    json!({
        format!("testContent-{lane}-{value}"): {
            "jcr:primaryType": "nt:unstructured",
            property_name(lane): value
        }
    })
}

/// Tagged query first, then a plain one for repositories without index tags.
fn lane_queries(lane: &str, unique: &str) -> [String; 2] {
    let condition = format!(
        "/jcr:root{ROOT}//*[jcr:contains(@{}, '{VALUE_PREFIX}{unique}')]",
        property_name(lane)
    );
    [
        format!(
            "{condition} option(traversal ok, index tag {})",
            index_tag(lane)
        ),
        format!("{condition} option(traversal ok)"),
    ]
}
