//! Azure Blob Storage object stage (REST API, Shared Key authorization)

use super::traits::{validate_object_name, ObjectStage, StageError};
use crate::account::{join_segments, ms_date, StorageAccount};
use crate::config::{ConfigError, StageConfig};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

const BLOB_API_VERSION: &str = "2021-08-06";

/// URL of a container, or of a blob inside it.
pub fn object_url(
    account: &StorageAccount,
    container: &str,
    name: Option<&str>,
) -> Result<Url, StageError> {
    let segments = std::iter::once(container).chain(name.into_iter().flat_map(|n| n.split('/')));
    Ok(join_segments(account.blob_endpoint(), segments)?)
}

/// Builds the Shared Key string-to-sign for a blob service request.
pub(crate) fn string_to_sign(
    account_name: &str,
    method: &Method,
    url: &Url,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(String, String)],
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    // VERB, Content-Encoding, Content-Language, Content-Length,
    // Content-MD5, Content-Type, Date, If-Modified-Since, If-Match,
    // If-None-Match, If-Unmodified-Since, Range
    let standard = [
        method.as_str(),
        "",
        "",
        length.as_str(),
        "",
        content_type,
        "",
        "",
        "",
        "",
        "",
        "",
    ];
    let mut out = standard.join("\n");
    out.push('\n');

    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();
    headers.sort();
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }

    out.push('/');
    out.push_str(account_name);
    out.push_str(url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        params
            .entry(k.to_ascii_lowercase())
            .or_default()
            .push(v.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&values.join(","));
    }

    out
}

/// Service SAS string-to-sign granting read access to one blob.
pub(crate) fn sas_string_to_sign(
    account_name: &str,
    container: &str,
    name: &str,
    expiry: &str,
) -> String {
    let resource = format!("/blob/{}/{}/{}", account_name, container, name);

    // permissions, start, expiry, resource, identifier, IP, protocol,
    // version, resource type, snapshot time, encryption scope, then the
    // five response header overrides
    let fields: [&str; 16] = [
        "r",
        "",
        expiry,
        resource.as_str(),
        "",
        "",
        "https,http",
        BLOB_API_VERSION,
        "b",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
    ];
    fields.join("\n")
}

fn percent_decode(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Blob names and the continuation marker from one List Blobs page.
fn parse_blob_listing(xml: &str) -> (Vec<String>, Option<String>) {
    static NAME: OnceLock<Regex> = OnceLock::new();
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let name = NAME
        .get_or_init(|| Regex::new(r"(?s)<Blob>\s*<Name>(.*?)</Name>").expect("valid regex"));
    let marker = MARKER
        .get_or_init(|| Regex::new(r"<NextMarker>([^<]+)</NextMarker>").expect("valid regex"));

    let names = name
        .captures_iter(xml)
        .map(|c| xml_unescape(&c[1]))
        .collect();
    let next = marker.captures(xml).map(|c| xml_unescape(&c[1]));
    (names, next)
}

/// Object stage backed by Azure Blob Storage. Locators are blob URLs.
pub struct AzureBlobStage {
    client: reqwest::Client,
    account: Option<StorageAccount>,
    /// Create-if-missing state, one cell per container.
    containers: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl AzureBlobStage {
    pub fn new(account: Option<StorageAccount>, timeout: Duration) -> Result<Self, StageError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            account,
            containers: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the stage from configuration. Missing credentials are not an
    /// error here; they are reported by the first call that needs them.
    pub fn from_config(config: &StageConfig) -> Result<Self, StageError> {
        let account = StorageAccount::from_settings(
            &config.connection_string,
            &config.account_name,
            &config.account_key,
        )?;
        if account.is_none() {
            warn!("No blob storage credentials configured; uploads will fail until STORAGE_CONNECTION_STRING is set");
        }

        Self::new(account, config.timeout)
    }

    fn account(&self) -> Result<&StorageAccount, StageError> {
        self.account
            .as_ref()
            .ok_or(StageError::Config(ConfigError::Missing("STORAGE_CONNECTION_STRING")))
    }

    async fn send(
        &self,
        account: &StorageAccount,
        method: Method,
        url: Url,
        body: Option<(Vec<u8>, &str)>,
        extra_headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, StageError> {
        let mut ms_headers = vec![
            ("x-ms-date".to_string(), ms_date(Utc::now())),
            ("x-ms-version".to_string(), BLOB_API_VERSION.to_string()),
        ];
        for (name, value) in extra_headers {
            ms_headers.push((name.to_string(), value.to_string()));
        }

        let (content_length, content_type) = match &body {
            Some((bytes, content_type)) => (bytes.len(), *content_type),
            None => (0, ""),
        };
        let signed = string_to_sign(
            account.account_name(),
            &method,
            &url,
            content_length,
            content_type,
            &ms_headers,
        );
        let authorization = account.authorization("SharedKey", &signed)?;

        let mut request = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, authorization);
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match body {
            Some((bytes, content_type)) => request.header(CONTENT_TYPE, content_type).body(bytes),
            None => request,
        };

        Ok(request.send().await?)
    }

    async fn rejected(response: reqwest::Response) -> StageError {
        StageError::Rejected {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        }
    }

    fn container_cell(&self, container: &str) -> Arc<OnceCell<()>> {
        let mut containers = self
            .containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        containers.entry(container.to_string()).or_default().clone()
    }

    /// Uploads to the same container wait on a single create request;
    /// other containers are unaffected. A failed create is retried by the
    /// next upload.
    async fn ensure_container(
        &self,
        account: &StorageAccount,
        container: &str,
    ) -> Result<(), StageError> {
        let cell = self.container_cell(container);
        cell.get_or_try_init(|| self.create_container(account, container))
            .await?;
        Ok(())
    }

    async fn create_container(
        &self,
        account: &StorageAccount,
        container: &str,
    ) -> Result<(), StageError> {
        let mut url = object_url(account, container, None)?;
        url.query_pairs_mut().append_pair("restype", "container");

        let response = self.send(account, Method::PUT, url, None, &[]).await?;
        match response.status() {
            StatusCode::CREATED => info!(container, "Created blob container"),
            StatusCode::CONFLICT => debug!(container, "Blob container already exists"),
            _ => return Err(Self::rejected(response).await),
        }
        Ok(())
    }

    fn not_found(container: &str, name: &str) -> StageError {
        StageError::NotFound {
            container: container.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStage for AzureBlobStage {
    async fn put(&self, container: &str, bytes: Vec<u8>, name: &str) -> Result<String, StageError> {
        validate_object_name(name)?;
        let account = self.account()?;
        self.ensure_container(account, container).await?;

        let url = object_url(account, container, Some(name))?;
        let locator = url.to_string();
        let size = bytes.len();

        let response = self
            .send(
                account,
                Method::PUT,
                url,
                Some((bytes, "application/octet-stream")),
                &[("x-ms-blob-type", "BlockBlob")],
            )
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(Self::rejected(response).await);
        }

        info!(container, name, size, "Uploaded blob");
        Ok(locator)
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>, StageError> {
        validate_object_name(name)?;
        let account = self.account()?;
        let url = object_url(account, container, Some(name))?;

        let response = self.send(account, Method::GET, url, None, &[]).await?;
        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(Self::not_found(container, name)),
            _ => Err(Self::rejected(response).await),
        }
    }

    async fn delete(&self, container: &str, name: &str) -> Result<(), StageError> {
        validate_object_name(name)?;
        let account = self.account()?;
        let url = object_url(account, container, Some(name))?;

        let response = self.send(account, Method::DELETE, url, None, &[]).await?;
        match response.status() {
            StatusCode::ACCEPTED => {
                debug!(container, name, "Deleted blob");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(Self::not_found(container, name)),
            _ => Err(Self::rejected(response).await),
        }
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>, StageError> {
        let account = self.account()?;
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut url = object_url(account, container, None)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("restype", "container");
                query.append_pair("comp", "list");
                if let Some(prefix) = prefix {
                    query.append_pair("prefix", prefix);
                }
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }

            let response = self.send(account, Method::GET, url, None, &[]).await?;
            match response.status() {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => return Err(Self::not_found(container, "")),
                _ => return Err(Self::rejected(response).await),
            }

            let (page, next) = parse_blob_listing(&response.text().await?);
            names.extend(page);
            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!(container, count = names.len(), "Listed blobs");
        Ok(names)
    }

    fn sas_url(&self, container: &str, name: &str, expiry: Duration) -> Result<String, StageError> {
        validate_object_name(name)?;
        let account = self.account()?;
        let lifetime = chrono::Duration::from_std(expiry).map_err(|e| {
            StageError::Config(ConfigError::Validation(format!("SAS expiry: {}", e)))
        })?;
        let expires = (Utc::now() + lifetime).to_rfc3339_opts(SecondsFormat::Secs, true);

        let signature = account.sign(&sas_string_to_sign(
            account.account_name(),
            container,
            name,
            &expires,
        ))?;

        let mut url = object_url(account, container, Some(name))?;
        url.query_pairs_mut()
            .append_pair("sv", BLOB_API_VERSION)
            .append_pair("sr", "b")
            .append_pair("sp", "r")
            .append_pair("se", &expires)
            .append_pair("spr", "https,http")
            .append_pair("sig", &signature);

        debug!(container, name, expires = %expires, "Issued read SAS");
        Ok(url.to_string())
    }

    fn object_name(&self, container: &str, locator: &str) -> Option<String> {
        let account = self.account.as_ref()?;
        let base = object_url(account, container, None).ok()?;
        let locator = Url::parse(locator).ok()?;
        if locator.origin() != base.origin() {
            return None;
        }

        let rest = locator
            .path()
            .strip_prefix(base.path())?
            .strip_prefix('/')?;
        let name = rest
            .split('/')
            .map(percent_decode)
            .collect::<Option<Vec<_>>>()?
            .join("/");
        validate_object_name(&name).ok()?;
        Some(name)
    }
}
