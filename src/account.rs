//! Azure storage account credentials shared by the blob stage and the
//! table-backed request store.

use crate::config::ConfigError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use url::Url;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

/// Account name, decoded key and per-service endpoints.
#[derive(Clone)]
pub struct StorageAccount {
    account_name: String,
    account_key: Vec<u8>,
    blob_endpoint: Url,
    table_endpoint: Url,
}

impl fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageAccount")
            .field("account_name", &self.account_name)
            .field("blob_endpoint", &self.blob_endpoint.as_str())
            .field("table_endpoint", &self.table_endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl StorageAccount {
    /// Parses a storage connection string
    /// (`DefaultEndpointsProtocol=https;AccountName=..;AccountKey=..;EndpointSuffix=..`).
    /// Explicit `BlobEndpoint` / `TableEndpoint` entries take precedence over
    /// the derived endpoints.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigError> {
        let mut fields = HashMap::new();
        for part in connection_string
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed connection string segment '{}'", part)))?;
            fields.insert(key.to_ascii_lowercase(), value.to_string());
        }

        let account_name = fields
            .get("accountname")
            .ok_or_else(|| invalid("connection string has no AccountName"))?;
        let account_key = fields
            .get("accountkey")
            .ok_or_else(|| invalid("connection string has no AccountKey"))?;

        let protocol = fields
            .get("defaultendpointsprotocol")
            .map(String::as_str)
            .unwrap_or("https");
        let suffix = fields
            .get("endpointsuffix")
            .map(String::as_str)
            .unwrap_or("core.windows.net");
        let endpoint = |service: &str| match fields.get(&format!("{}endpoint", service)) {
            Some(explicit) => explicit.clone(),
            None => format!("{}://{}.{}.{}", protocol, account_name, service, suffix),
        };

        Self::new(account_name, account_key, &endpoint("blob"), &endpoint("table"))
    }

    pub fn from_account(account_name: &str, account_key: &str) -> Result<Self, ConfigError> {
        Self::new(
            account_name,
            account_key,
            &format!("https://{}.blob.core.windows.net", account_name),
            &format!("https://{}.table.core.windows.net", account_name),
        )
    }

    fn new(
        account_name: &str,
        account_key: &str,
        blob_endpoint: &str,
        table_endpoint: &str,
    ) -> Result<Self, ConfigError> {
        let account_key = STANDARD
            .decode(account_key.trim())
            .map_err(|e| invalid(format!("account key is not valid base64: {}", e)))?;

        Ok(Self {
            account_name: account_name.to_string(),
            account_key,
            blob_endpoint: parse_endpoint(blob_endpoint)?,
            table_endpoint: parse_endpoint(table_endpoint)?,
        })
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub fn blob_endpoint(&self) -> &Url {
        &self.blob_endpoint
    }

    pub fn table_endpoint(&self) -> &Url {
        &self.table_endpoint
    }

    /// Base64 HMAC-SHA256 of `string_to_sign` under the account key.
    pub fn sign(&self, string_to_sign: &str) -> Result<String, ConfigError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.account_key)
            .map_err(|e| invalid(format!("unusable account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `Authorization` header value for the given scheme
    /// (`SharedKey` or `SharedKeyLite`).
    pub fn authorization(&self, scheme: &str, string_to_sign: &str) -> Result<String, ConfigError> {
        Ok(format!(
            "{} {}:{}",
            scheme,
            self.account_name,
            self.sign(string_to_sign)?
        ))
    }

    /// Resolves credentials from a connection string or an account name/key
    /// pair. Blank values count as unset; `None` means nothing is configured.
    pub fn from_settings(
        connection_string: &Option<String>,
        account_name: &Option<String>,
        account_key: &Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let nonempty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

        match (
            nonempty(connection_string),
            nonempty(account_name),
            nonempty(account_key),
        ) {
            (Some(connection_string), _, _) => {
                Self::from_connection_string(&connection_string).map(Some)
            }
            (None, Some(name), Some(key)) => Self::from_account(&name, &key).map(Some),
            _ => Ok(None),
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(endpoint)
        .map_err(|e| invalid(format!("invalid storage endpoint '{}': {}", endpoint, e)))?;
    if url.cannot_be_a_base() {
        return Err(invalid(format!("invalid storage endpoint '{}'", endpoint)));
    }
    Ok(url)
}

/// `x-ms-date` header value.
pub fn ms_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Appends `segments` to the path of `base`, percent-encoding each one.
pub fn join_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| invalid("storage endpoint cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> String {
        STANDARD.encode(b"not-a-real-account-key")
    }

    #[test]
    fn test_connection_string_derives_endpoints() {
        let cs = format!(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey={};EndpointSuffix=core.windows.net",
            key()
        );
        let account = StorageAccount::from_connection_string(&cs).unwrap();
        assert_eq!(account.account_name(), "acct");
        assert_eq!(account.blob_endpoint().as_str(), "https://acct.blob.core.windows.net/");
        assert_eq!(account.table_endpoint().as_str(), "https://acct.table.core.windows.net/");
    }

    #[test]
    fn test_explicit_endpoints_win() {
        let cs = format!(
            "AccountName=devstoreaccount1;AccountKey={};BlobEndpoint=http://127.0.0.1:10000/devstoreaccount1;TableEndpoint=http://127.0.0.1:10002/devstoreaccount1",
            key()
        );
        let account = StorageAccount::from_connection_string(&cs).unwrap();
        assert_eq!(
            account.table_endpoint().as_str(),
            "http://127.0.0.1:10002/devstoreaccount1"
        );
        let url = join_segments(account.table_endpoint(), ["Tables"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:10002/devstoreaccount1/Tables");
    }

    #[test]
    fn test_connection_string_requires_key() {
        let err = StorageAccount::from_connection_string("AccountName=acct").unwrap_err();
        assert!(err.to_string().contains("AccountKey"));
    }

    #[test]
    fn test_account_key_must_be_base64() {
        assert!(StorageAccount::from_account("acct", "not base64!!").is_err());
    }

    #[test]
    fn test_settings_prefer_connection_string() {
        let cs = Some(format!("AccountName=fromcs;AccountKey={}", key()));
        let account =
            StorageAccount::from_settings(&cs, &Some("other".to_string()), &Some(key()))
                .unwrap()
                .unwrap();
        assert_eq!(account.account_name(), "fromcs");

        let none = StorageAccount::from_settings(&Some("  ".to_string()), &None, &Some(key()));
        assert!(none.unwrap().is_none());
    }

    #[test]
    fn test_authorization_header_shape() {
        let account = StorageAccount::from_account("acct", &key()).unwrap();
        let header = account.authorization("SharedKeyLite", "anything").unwrap();
        let signature = header.strip_prefix("SharedKeyLite acct:").unwrap();
        assert_eq!(STANDARD.decode(signature).unwrap().len(), 32);
    }

    #[test]
    fn test_ms_date_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(ms_date(at), "Mon, 01 Jan 2024 00:00:00 GMT");
    }
}
