//! Online factory: a thin passthrough client for the remote catalog
//! service. No adaptation logic lives here; queries against the remote
//! service go through the path builder exactly as the service exposes
//! them.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// One entry of the local credential store
/// (`~/.deriva/credential.json`, keyed by hostname).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default, rename = "bearer-token")]
    pub bearer_token: Option<String>,
}

/// Resolve the stored credential for `host`, if any.
pub fn get_credential(host: &str) -> Result<Option<Credential>> {
    let Some(home) = dirs::home_dir() else {
        return Ok(None);
    };
    let path = home.join(".deriva").join("credential.json");
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path)
        .with_context(|| format!("failed to open credential store {:?}", path))?;
    let store: HashMap<String, Credential> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse credential store {:?}", path))?;
    Ok(store.get(host).cloned())
}

/// A parsed catalog URI of the form
/// `scheme://host/chaise/recordset/#<catalog>[/<schema>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLocator {
    pub scheme: String,
    pub host: String,
    pub catalog: u64,
    pub schema: String,
}

pub fn parse_catalog_uri(uri: &str) -> Result<CatalogLocator> {
    let parsed = Url::parse(uri).with_context(|| format!("invalid catalog URI: {}", uri))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("catalog URI has no host: {}", uri))?
        .to_string();
    let fragment = parsed.fragment().unwrap_or("");
    let pattern = Regex::new(r"^(\d+)(/(.+))?$").expect("catalog fragment pattern is valid");
    let captures = pattern.captures(fragment).ok_or_else(|| {
        anyhow!(
            "catalog URI fragment must be '<catalog>[/<schema>]': {}",
            uri
        )
    })?;
    let catalog = captures[1]
        .parse()
        .with_context(|| format!("invalid catalog number in URI: {}", uri))?;
    let schema = captures
        .get(3)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "public".to_string());
    Ok(CatalogLocator {
        scheme: parsed.scheme().to_string(),
        host,
        catalog,
        schema,
    })
}

/// Blocking HTTP client scoped to one remote catalog.
pub struct CatalogClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn connect(locator: &CatalogLocator, credential: Option<&Credential>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(credential) = credential {
            if let Some(token) = &credential.bearer_token {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token))
                        .context("invalid bearer token in credential store")?,
                );
            } else if let Some(cookie) = &credential.cookie {
                headers.insert(
                    COOKIE,
                    HeaderValue::from_str(cookie).context("invalid cookie in credential store")?,
                );
            }
        }
        let http = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = format!(
            "{}://{}/ermrest/catalog/{}",
            locator.scheme, locator.host, locator.catalog
        );
        Ok(Self { http, base_url })
    }

    /// Fetch the catalog's schema document and return the path builder
    /// scoped to `schema`.
    pub fn path_builder(self, schema: &str) -> Result<SchemaPath> {
        let url = format!("{}/schema", self.base_url);
        debug!(target: "online", "fetching catalog schema from {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("failed to reach catalog at {}", url))?;
        if !response.status().is_success() {
            bail!("catalog schema request failed with {}", response.status());
        }
        let document: Value = response
            .json()
            .context("catalog schema response is not valid JSON")?;
        let tables: Vec<String> = document
            .get("schemas")
            .and_then(|s| s.get(schema))
            .and_then(|s| s.get("tables"))
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        Ok(SchemaPath {
            client: self,
            schema: schema.to_string(),
            tables,
        })
    }
}

/// Table paths scoped to one schema of a remote catalog: the object
/// the remote client library hands back from its path builder.
pub struct SchemaPath {
    client: CatalogClient,
    schema: String,
    tables: Vec<String>,
}

impl SchemaPath {
    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    pub fn table_names(&self) -> &[String] {
        &self.tables
    }

    /// Fetch all entities of one table, as returned by the service.
    pub fn entities(&self, table: &str) -> Result<Vec<Value>> {
        let url = format!(
            "{}/entity/{}:{}",
            self.client.base_url, self.schema, table
        );
        debug!(target: "online", "fetching entities from {}", url);
        let response = self
            .client
            .http
            .get(&url)
            .send()
            .with_context(|| format!("failed to reach catalog at {}", url))?;
        if !response.status().is_success() {
            bail!("entity request for '{}' failed with {}", table, response.status());
        }
        response
            .json()
            .with_context(|| format!("entity response for '{}' is not valid JSON", table))
    }
}

/// Create a client for the remote catalog service from a URI of the
/// form `scheme://host/chaise/recordset/#<catalog>[/<schema>]`.
pub fn create_online_client(uri: &str) -> Result<SchemaPath> {
    let locator = parse_catalog_uri(uri)?;
    let credential = get_credential(&locator.host)?;
    let client = CatalogClient::connect(&locator, credential.as_ref())?;
    client.path_builder(&locator.schema)
}
