//! Queries through the testing query servlet.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{
    osgi::{BundleArchive, OsgiConsoleClient},
    Result, SlingClient, SlingClientError, SlingRequest,
};

/// Path the query servlet is registered at.
pub const SERVLET_PATH: &str = "/system/testing/query";
/// Symbolic name of the bundle providing the query servlet.
pub const SERVLET_BUNDLE: &str = "org.apache.sling.testing.clients.query";

const SERVLET_START_TIMEOUT: Duration = Duration::from_secs(10);
const SERVLET_START_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryType {
    Sql2,
    Sql,
    XPath,
    Jqom,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sql2 => "JCR-SQL2",
            Self::Sql => "sql",
            Self::XPath => "xpath",
            Self::Jqom => "JCR-JQOM",
        })
    }
}

/// One result row.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct QueryRow {
    pub path: String,
    #[serde(rename = "type", default)]
    pub node_type: Option<String>,
}

/// Servlet answer for a query with results.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct QueryResult {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub results: Vec<QueryRow>,
}

/// Queries the repository. When given the servlet bundle, a missing
/// servlet is installed on first use and left in place; remove it with
/// [`QueryClient::uninstall_servlet`].
#[derive(Clone, Debug)]
pub struct QueryClient {
    client: SlingClient,
    servlet_bundle: Option<BundleArchive>,
}

impl QueryClient {
    pub fn new(client: SlingClient) -> Self {
        Self {
            client,
            servlet_bundle: None,
        }
    }

    /// Bundle providing [`SERVLET_PATH`], installed when the servlet is missing.
    pub fn with_servlet_bundle(mut self, bundle: BundleArchive) -> Self {
        self.servlet_bundle = Some(bundle);
        self
    }

    pub fn client(&self) -> &SlingClient {
        &self.client
    }

    pub async fn query(&self, query: &str, query_type: QueryType) -> Result<QueryResult> {
        let response = self.run(query, query_type, true, false).await?;
        serde_json::from_value(response).map_err(|err| {
            SlingClientError::Decode(format!("invalid query servlet response: {err}"))
        })
    }

    /// Number of hits without transferring the rows.
    pub async fn count(&self, query: &str, query_type: QueryType) -> Result<u64> {
        let response = self.run(query, query_type, false, false).await?;
        response
            .get("total")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| SlingClientError::Decode("query response has no 'total'".to_owned()))
    }

    /// Query plan as reported by the repository.
    pub async fn plan(&self, query: &str, query_type: QueryType) -> Result<String> {
        let response = self.run(query, query_type, false, true).await?;
        match response.get("plan") {
            Some(JsonValue::String(plan)) => Ok(plan.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(SlingClientError::Decode(
                "query response has no 'plan'".to_owned(),
            )),
        }
    }

    /// Installs and starts the servlet bundle.
    pub async fn install_servlet(&self) -> Result<()> {
        let Some(bundle) = &self.servlet_bundle else {
            return Err(SlingClientError::Setup(format!(
                "query servlet is not installed at {SERVLET_PATH} and no bundle was provided for {SERVLET_BUNDLE}"
            )));
        };
        let console = OsgiConsoleClient::new(self.client.clone());
        console.install_bundle(bundle, true, 0).await?;
        console
            .wait_bundle_started(
                &bundle.symbolic_name,
                SERVLET_START_TIMEOUT,
                SERVLET_START_DELAY,
            )
            .await?;
        info!(path = SERVLET_PATH, "query servlet installed");
        Ok(())
    }

    /// Removes the servlet bundle from the server.
    pub async fn uninstall_servlet(&self) -> Result<()> {
        let symbolic_name = self
            .servlet_bundle
            .as_ref()
            .map_or(SERVLET_BUNDLE, |bundle| bundle.symbolic_name.as_str());
        OsgiConsoleClient::new(self.client.clone())
            .uninstall_bundle(symbolic_name)
            .await
    }

    async fn run(
        &self,
        query: &str,
        query_type: QueryType,
        show_results: bool,
        explain: bool,
    ) -> Result<JsonValue> {
        let request = SlingRequest::get(SERVLET_PATH)
            .query("query", query)
            .query("type", query_type.to_string())
            .query("showresults", show_results.to_string())
            .query("explain", explain.to_string())
            .expect([200]);
        match self.client.execute(request.clone()).await {
            Ok(response) => response.json(),
            Err(err) if err.http_status() == Some(404) => {
                info!(path = SERVLET_PATH, "query servlet not found, installing it");
                self.install_servlet().await?;
                self.client.execute(request).await?.json()
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryResult, QueryType};

    #[test]
    fn query_type_names_match_servlet_parameters() {
        assert_eq!(QueryType::Sql2.to_string(), "JCR-SQL2");
        assert_eq!(QueryType::XPath.to_string(), "xpath");
        assert_eq!(QueryType::Jqom.to_string(), "JCR-JQOM");
    }

    #[test]
    fn result_rows_are_optional() {
        let result: QueryResult =
            serde_json::from_str(r#"{"total": 1234, "time": 1}"#).expect("valid result");
        assert_eq!(result.total, 1234);
        assert!(result.results.is_empty());

        let result: QueryResult = serde_json::from_str(
            r#"{"total": 1, "time": 3, "results": [{"path": "/etc/a", "type": "nt:file"}]}"#,
        )
        .expect("valid result");
        assert_eq!(result.results[0].node_type.as_deref(), Some("nt:file"));
    }
}
