//! Felix web console wrappers and the pollers built on them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use reqwest::{header::LOCATION, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    MultipartField, ProbeOutcome, Result, SlingClient, SlingClientError, SlingRequest,
    SlingResponse,
};

const URL_BUNDLES: &str = "/system/console/bundles";
const URL_COMPONENTS: &str = "/system/console/components";
const URL_SERVICES: &str = "/system/console/services";
const URL_CONFIGURATION: &str = "/system/console/configMgr";
const BUNDLE_CONTENT_TYPE: &str = "application/java-archive";

/// Delay used by [`OsgiConsoleClient::wait_configuration`].
pub const CONFIGURATION_POLL_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle state reported for a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BundleState {
    Uninstalled,
    Installed,
    Resolved,
    Starting,
    Stopping,
    Active,
    Fragment,
    Unknown,
}

impl BundleState {
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "uninstalled" => Self::Uninstalled,
            "installed" => Self::Installed,
            "resolved" => Self::Resolved,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "active" => Self::Active,
            "fragment" => Self::Fragment,
            _ => Self::Unknown,
        }
    }
}

/// First entry of `bundles/<name>.json`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleInfo {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbolic_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub state: String,
    #[serde(default)]
    pub state_raw: Option<i64>,
    #[serde(default)]
    pub fragment: bool,
}

impl BundleInfo {
    pub fn status(&self) -> BundleState {
        BundleState::parse(&self.state)
    }
}

/// Declarative Services component state as labelled by the console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentStatus {
    Active,
    Satisfied,
    UnsatisfiedConfiguration,
    UnsatisfiedReference,
    FailedActivation,
    Unknown,
}

impl ComponentStatus {
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "satisfied" => Self::Satisfied,
            "unsatisfied (configuration)" => Self::UnsatisfiedConfiguration,
            "unsatisfied (reference)" => Self::UnsatisfiedReference,
            "failed activation" => Self::FailedActivation,
            _ => Self::Unknown,
        }
    }

    /// Satisfied or active; the component is registered.
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Active | Self::Satisfied)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentInfo {
    pub name: Option<String>,
    pub pid: Option<String>,
    pub state: String,
}

impl ComponentInfo {
    pub fn status(&self) -> ComponentStatus {
        ComponentStatus::parse(&self.state)
    }

    fn from_json(root: &JsonValue) -> Result<Self> {
        let entry = first_data_entry(root, "components")?;
        let state = entry
            .get("state")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SlingClientError::Decode("component state missing".to_owned()))?;
        Ok(Self {
            name: entry.get("name").map(as_text),
            pid: entry.get("pid").map(as_text),
            state: state.to_owned(),
        })
    }
}

/// One entry of `services.json`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub types: Vec<String>,
    pub pid: Option<String>,
    pub bundle_id: Option<i64>,
    pub bundle_symbolic_name: Option<String>,
}

impl ServiceInfo {
    fn from_json(node: &JsonValue) -> Self {
        Self {
            id: node.get("id").map(as_text).unwrap_or_default(),
            types: node
                .get("types")
                .map(|types| split_pseudo_array(&as_text(types)))
                .unwrap_or_default(),
            pid: node.get("pid").and_then(JsonValue::as_str).map(str::to_owned),
            bundle_id: node.get("bundleId").and_then(JsonValue::as_i64),
            bundle_symbolic_name: node
                .get("bundleSymbolicName")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicesInfo {
    pub status: String,
    pub service_count: u64,
    pub services: Vec<ServiceInfo>,
}

impl ServicesInfo {
    fn from_json(root: &JsonValue) -> Result<Self> {
        let status = root
            .get("status")
            .map(as_text)
            .ok_or_else(|| SlingClientError::Decode("no status returned".to_owned()))?;
        let service_count = root
            .get("serviceCount")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| SlingClientError::Decode("no serviceCount returned".to_owned()))?;
        let services = root
            .get("data")
            .and_then(JsonValue::as_array)
            .map(|data| data.iter().map(ServiceInfo::from_json).collect())
            .unwrap_or_default();
        Ok(Self {
            status,
            service_count,
            services,
        })
    }

    /// Services registered under `service_type`.
    pub fn for_type(&self, service_type: &str) -> Vec<&ServiceInfo> {
        self.services
            .iter()
            .filter(|service| service.types.iter().any(|t| t == service_type))
            .collect()
    }

    pub fn for_id(&self, id: &str) -> Option<&ServiceInfo> {
        self.services.iter().find(|service| service.id == id)
    }
}

/// A configuration property value: single or multi-valued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    Single(String),
    Multi(Vec<String>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Single(value) => Some(value),
            Self::Multi(_) => None,
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(value) => vec![value.as_str()],
            Self::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }

    /// True when `expected` equals the single value or one of the values.
    pub fn matches(&self, expected: &str) -> bool {
        self.values().contains(&expected)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_owned())
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(values: Vec<String>) -> Self {
        Self::Multi(values)
    }
}

pub type Configuration = BTreeMap<String, ConfigValue>;

/// A bundle jar to upload through the console.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleArchive {
    /// `Bundle-SymbolicName` from the jar manifest.
    pub symbolic_name: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl BundleArchive {
    pub fn new(
        symbolic_name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Reads the jar from disk; the file name is taken from `path`.
    pub fn from_file(symbolic_name: impl Into<String>, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|err| {
            SlingClientError::Setup(format!("cannot read bundle {}: {err}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle.jar".to_owned());
        Ok(Self::new(symbolic_name, file_name, bytes))
    }
}

/// Client for the Felix web console REST endpoints under `/system/console`.
#[derive(Clone, Debug)]
pub struct OsgiConsoleClient {
    client: SlingClient,
}

impl OsgiConsoleClient {
    pub fn new(client: SlingClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SlingClient {
        &self.client
    }

    // bundles

    pub async fn bundle(&self, symbolic_name: &str) -> Result<BundleInfo> {
        let path = format!("{URL_BUNDLES}/{symbolic_name}.json");
        let response = self.client.get(&path, [200]).await?;
        parse_bundle(&response)
    }

    pub async fn bundle_state(&self, symbolic_name: &str) -> Result<BundleState> {
        Ok(self.bundle(symbolic_name).await?.status())
    }

    pub async fn bundle_id(&self, symbolic_name: &str) -> Result<i64> {
        Ok(self.bundle(symbolic_name).await?.id)
    }

    pub async fn bundle_version(&self, symbolic_name: &str) -> Result<String> {
        self.bundle(symbolic_name).await?.version.ok_or_else(|| {
            SlingClientError::Decode(format!("cannot get version of bundle {symbolic_name}"))
        })
    }

    pub async fn start_bundle(&self, symbolic_name: &str) -> Result<()> {
        info!(bundle = symbolic_name, "starting bundle");
        self.bundle_action(symbolic_name, "start").await
    }

    pub async fn stop_bundle(&self, symbolic_name: &str) -> Result<()> {
        info!(bundle = symbolic_name, "stopping bundle");
        self.bundle_action(symbolic_name, "stop").await
    }

    pub async fn uninstall_bundle(&self, symbolic_name: &str) -> Result<()> {
        info!(bundle = symbolic_name, "uninstalling bundle");
        self.bundle_action(symbolic_name, "uninstall").await
    }

    pub async fn refresh_packages(&self) -> Result<()> {
        info!("refreshing packages");
        self.client
            .post_form(URL_BUNDLES, [("action", "refreshPackages")], [200])
            .await
            .map(|_| ())
    }

    /// Uploads `bundle`. A `start_level` of 0 keeps the framework default.
    pub async fn install_bundle(
        &self,
        bundle: &BundleArchive,
        start: bool,
        start_level: u32,
    ) -> Result<SlingResponse> {
        let mut fields = vec![
            MultipartField::text("action", "install"),
            MultipartField::file(
                "bundlefile",
                bundle.file_name.as_str(),
                BUNDLE_CONTENT_TYPE,
                bundle.bytes.clone(),
            ),
        ];
        if start {
            fields.push(MultipartField::text("bundlestart", "true"));
        }
        if start_level > 0 {
            fields.push(MultipartField::text(
                "bundlestartlevel",
                start_level.to_string(),
            ));
        }
        info!(
            bundle = %bundle.symbolic_name,
            file = %bundle.file_name,
            start,
            start_level,
            "installing bundle"
        );
        self.client
            .execute(SlingRequest::post(URL_BUNDLES).multipart(fields).expect([302]))
            .await
    }

    /// Uploads `bundle`, then waits until the console lists it.
    pub async fn wait_install_bundle(
        &self,
        bundle: &BundleArchive,
        start: bool,
        start_level: u32,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        self.install_bundle(bundle, start, start_level).await?;
        self.wait_bundle_installed(&bundle.symbolic_name, timeout, delay)
            .await
    }

    /// Uploads `bundle` and checks for it up to `retries` times, `wait`
    /// apart. `Ok(false)` when it never shows up.
    pub async fn install_bundle_with_retry(
        &self,
        bundle: &BundleArchive,
        start: bool,
        start_level: u32,
        wait: Duration,
        retries: u32,
    ) -> Result<bool> {
        self.install_bundle(bundle, start, start_level).await?;
        let timeout = wait.saturating_mul(retries);
        match self
            .wait_bundle_installed(&bundle.symbolic_name, timeout, wait)
            .await
        {
            Ok(()) => Ok(true),
            Err(err) if err.is_timeout() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn bundle_action(&self, symbolic_name: &str, action: &str) -> Result<()> {
        let path = format!("{URL_BUNDLES}/{symbolic_name}");
        self.client
            .post_form(&path, [("action", action)], [200])
            .await
            .map(|_| ())
    }

    /// Waits until the console knows about the bundle.
    pub async fn wait_bundle_installed(
        &self,
        symbolic_name: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        let client = &self.client;
        let path = format!("{URL_BUNDLES}/{symbolic_name}");
        let path = path.as_str();
        self.client
            .poller(timeout, delay)
            .describe(format!("Bundle {symbolic_name} did not install"))
            .poll(move || async move { client.exists(path).await })
            .await
            .map(|_| ())
    }

    /// Waits until the bundle reports the `Active` state.
    pub async fn wait_bundle_started(
        &self,
        symbolic_name: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        self.client
            .poller(timeout, delay)
            .describe(format!("Bundle {symbolic_name} did not start"))
            .poll(move || async move {
                match self.bundle_state(symbolic_name).await {
                    Ok(state) => ProbeOutcome::from(state == BundleState::Active),
                    Err(err) => {
                        debug!(bundle = symbolic_name, error = %err, "could not get bundle state");
                        ProbeOutcome::Failed(err)
                    }
                }
            })
            .await
            .map(|_| ())
    }

    /// Starts the bundle, then waits for it to become active.
    pub async fn wait_start_bundle(
        &self,
        symbolic_name: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        self.start_bundle(symbolic_name).await?;
        self.wait_bundle_started(symbolic_name, timeout, delay).await
    }

    // components and services

    /// `None` when the console does not answer 200 for the component.
    pub async fn component(&self, name: &str) -> Result<Option<ComponentInfo>> {
        let path = format!("{URL_COMPONENTS}/{name}.json");
        let response = self.client.execute(SlingRequest::get(path)).await?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        ComponentInfo::from_json(&response.json()?).map(Some)
    }

    /// Waits until the component is satisfied or active.
    pub async fn wait_component_registered(
        &self,
        name: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        self.client
            .poller(timeout, delay)
            .describe(format!("Component {name} was not registered"))
            .poll(move || async move {
                let component = self.component(name).await?;
                if component.is_none() {
                    debug!(component = name, "could not get component info");
                }
                Ok::<_, SlingClientError>(
                    component.is_some_and(|info| info.status().is_registered()),
                )
            })
            .await
            .map(|_| ())
    }

    pub async fn services(&self) -> Result<ServicesInfo> {
        let path = format!("{URL_SERVICES}.json");
        let response = self.client.get(&path, [200]).await?;
        ServicesInfo::from_json(&response.json()?)
    }

    /// Waits until a service of `service_type` is registered, by
    /// `bundle_symbolic_name` when given.
    pub async fn wait_service_registered(
        &self,
        service_type: &str,
        bundle_symbolic_name: Option<&str>,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        self.client
            .poller(timeout, delay)
            .describe(format!("Service with type {service_type} was not registered"))
            .poll(move || async move {
                let services = self.services().await?;
                let matching = services.for_type(service_type);
                let found = match bundle_symbolic_name {
                    Some(bundle) => matching
                        .iter()
                        .any(|service| service.bundle_symbolic_name.as_deref() == Some(bundle)),
                    None => !matching.is_empty(),
                };
                if !found {
                    debug!(service_type, ?bundle_symbolic_name, "service not registered yet");
                }
                Ok::<_, SlingClientError>(found)
            })
            .await
            .map(|_| ())
    }

    // configurations

    /// Properties explicitly set on `pid`, or `None` when no such
    /// configuration exists.
    pub async fn configuration(&self, pid: &str) -> Result<Option<Configuration>> {
        let path = format!("{URL_CONFIGURATION}/{pid}");
        let response = self
            .client
            .execute(SlingRequest::post(path).expect([200]))
            .await?;
        Ok(extract_configuration(&response.json()?))
    }

    /// Every property of `pid` carrying a value, including metatype
    /// defaults that were never set. Unknown PIDs yield an empty map.
    pub async fn configuration_properties(&self, pid: &str) -> Result<Configuration> {
        let path = format!("{URL_CONFIGURATION}/{pid}");
        let response = self
            .client
            .execute(SlingRequest::post(path).expect([200]))
            .await?;
        Ok(extract_properties(&response.json()?, false))
    }

    /// Polls every 500 ms until `pid` exists and returns its properties.
    pub async fn wait_configuration(&self, pid: &str, timeout: Duration) -> Result<Configuration> {
        let found = OnceLock::new();
        let slot = &found;
        self.client
            .poller(timeout, CONFIGURATION_POLL_DELAY)
            .describe(format!("Configuration {pid} was not found"))
            .poll(move || async move {
                match self.configuration(pid).await? {
                    Some(config) => {
                        let _ = slot.set(config);
                        Ok::<_, SlingClientError>(true)
                    }
                    None => Ok(false),
                }
            })
            .await?;
        found.into_inner().ok_or_else(|| {
            SlingClientError::Decode(format!("configuration {pid} vanished after being found"))
        })
    }

    /// Waits until property `key` of `pid` has `value`.
    pub async fn wait_configuration_property(
        &self,
        pid: &str,
        key: &str,
        value: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<()> {
        self.client
            .poller(timeout, delay)
            .describe(format!("Configuration {pid} did not get {key}={value}"))
            .poll(move || async move {
                let configuration = self.configuration(pid).await?;
                let applied = configuration
                    .as_ref()
                    .and_then(|config| config.get(key))
                    .is_some_and(|current| current.matches(value));
                Ok::<_, SlingClientError>(applied)
            })
            .await
            .map(|_| ())
    }

    /// Creates or updates `pid` (a new factory instance when
    /// `factory_pid` is given). Returns the PID from the redirect location.
    pub async fn edit_configuration(
        &self,
        pid: &str,
        factory_pid: Option<&str>,
        properties: &Configuration,
    ) -> Result<Option<String>> {
        let mut form = vec![
            ("apply".to_owned(), "true".to_owned()),
            ("action".to_owned(), "ajaxConfigManager".to_owned()),
        ];
        if let Some(factory_pid) = factory_pid {
            form.push(("factoryPid".to_owned(), factory_pid.to_owned()));
        }
        for (name, value) in properties {
            for value in value.values() {
                form.push((name.clone(), value.to_owned()));
            }
        }
        let property_list = properties.keys().cloned().collect::<Vec<_>>().join(",");
        form.push(("propertylist".to_owned(), property_list));

        let path = format!("{URL_CONFIGURATION}/{pid}");
        let response = self.client.post_form(&path, form, [302]).await?;
        Ok(pid_from_location(&response))
    }

    /// [`edit_configuration`](Self::edit_configuration), then waits for the
    /// resulting configuration to exist.
    pub async fn wait_edit_configuration(
        &self,
        pid: &str,
        factory_pid: Option<&str>,
        properties: &Configuration,
        timeout: Duration,
    ) -> Result<String> {
        let created = self
            .edit_configuration(pid, factory_pid, properties)
            .await?
            .unwrap_or_else(|| pid.to_owned());
        self.wait_configuration(&created, timeout).await?;
        Ok(created)
    }

    pub async fn delete_configuration(&self, pid: &str) -> Result<SlingResponse> {
        let path = format!("{URL_CONFIGURATION}/{pid}");
        self.client
            .post_form(&path, [("apply", "1"), ("delete", "1")], [200])
            .await
    }

    /// PID of the first configuration of `service_type` whose `property`
    /// equals `value`.
    pub async fn config_pid_from_services(
        &self,
        service_type: &str,
        property: &str,
        value: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<Option<String>> {
        let found = OnceLock::new();
        let slot = &found;
        let filter = format!("(service.pid={service_type}.*)");
        let filter = filter.as_str();
        self.client
            .poller(timeout, delay)
            .describe(format!("Configurations of {service_type} could not be listed"))
            .poll(move || async move {
                let request =
                    SlingRequest::get(format!("{URL_CONFIGURATION}/*.json")).query("pidFilter", filter);
                let listed = self.client.execute(request).await?.json::<JsonValue>()?;
                Ok::<_, SlingClientError>(slot.set(listed).is_ok())
            })
            .await?;

        let pid = found
            .get()
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .find(|config| {
                config
                    .pointer(&format!("/properties/{property}/value"))
                    .map(as_text)
                    .is_some_and(|current| current == value)
            })
            .and_then(|config| config.get("pid"))
            .map(as_text);
        Ok(pid)
    }
}

fn parse_bundle(response: &SlingResponse) -> Result<BundleInfo> {
    let root: JsonValue = response.json()?;
    let entry = first_data_entry(&root, response.request().path())?;
    if entry.get("state").is_none() {
        return Err(SlingClientError::Decode(format!(
            "{}.data[0].state missing, JSON content={}",
            response.request().path(),
            response.content()
        )));
    }
    BundleInfo::deserialize(entry).map_err(|err| {
        SlingClientError::Decode(format!("invalid bundle JSON from {}: {err}", response.request()))
    })
}

fn first_data_entry<'a>(root: &'a JsonValue, source: &str) -> Result<&'a JsonValue> {
    let data = root
        .get("data")
        .ok_or_else(|| SlingClientError::Decode(format!("{source} does not provide 'data' element")))?;
    data.as_array()
        .and_then(|entries| entries.first())
        .ok_or_else(|| SlingClientError::Decode(format!("{source}.data is empty")))
}

/// Set properties of a `configMgr` answer; `None` without `bundle_location`.
fn extract_configuration(root: &JsonValue) -> Option<Configuration> {
    root.as_object()?.get("bundle_location")?;
    Some(extract_properties(root, true))
}

fn extract_properties(root: &JsonValue, only_set: bool) -> Configuration {
    let mut configuration = Configuration::new();
    let Some(properties) = root.get("properties").and_then(JsonValue::as_object) else {
        return configuration;
    };
    for (name, property) in properties {
        let is_set = property
            .get("is_set")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        if only_set && !is_set {
            continue;
        }
        if let Some(value) = property.get("value") {
            configuration.insert(name.clone(), ConfigValue::Single(as_text(value)));
        } else if let Some(values) = property.get("values").and_then(JsonValue::as_array) {
            configuration.insert(
                name.clone(),
                ConfigValue::Multi(values.iter().map(as_text).collect()),
            );
        }
    }
    configuration
}

fn pid_from_location(response: &SlingResponse) -> Option<String> {
    let mut locations = response.header_values(LOCATION.as_str());
    let location = locations.next()?.to_str().ok()?;
    if locations.next().is_some() {
        return None;
    }
    let start = location.find(URL_CONFIGURATION)? + URL_CONFIGURATION.len();
    Some(location[start..].trim_start_matches('/').to_owned())
}

/// Console "arrays" such as `[a, b]` are plain strings.
fn split_pseudo_array(value: &str) -> Vec<String> {
    match value.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        Some(inner) => inner
            .split(',')
            .map(|item| item.trim().to_owned())
            .collect(),
        None => vec![value.to_owned()],
    }
}

fn as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
