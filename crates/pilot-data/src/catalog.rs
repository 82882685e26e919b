//! Replica catalog access and the client location probe.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gridpilot_core::error::{ErrorCode, PilotError};

/// A data identifier sent to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Did {
    pub scope: String,
    pub name: String,
}

/// One replica record returned by the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub scope: String,
    pub name: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub adler32: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    /// PFNs per storage endpoint, closest first when geo-sorted.
    #[serde(default)]
    pub rses: BTreeMap<String, Vec<String>>,
}

/// Where this client sits, for geo-sorted replica lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLocation {
    pub ip: String,
    pub fqdn: String,
    pub site: String,
}

/// Best-effort location probe.
///
/// Connects a UDP socket towards a public resolver to learn the local
/// outbound address; the site name comes from `PILOT_SITENAME` (with
/// `RUCIO_LOCAL_SITE_ID` as fallback). Returns `None` on any failure,
/// which disables geo-sorting.
pub fn detect_client_location() -> Option<ClientLocation> {
    let site = std::env::var("PILOT_SITENAME")
        .or_else(|_| std::env::var("RUCIO_LOCAL_SITE_ID"))
        .unwrap_or_else(|_| "unknown".to_string());
    let socket = match std::net::UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(err) => {
            warn!("client location probe failed to bind: {err}");
            return None;
        }
    };
    if let Err(err) = socket.connect("8.8.8.8:80") {
        warn!("client location probe failed to connect: {err}");
        return None;
    }
    let ip = match socket.local_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(err) => {
            warn!("client location probe failed to read local address: {err}");
            return None;
        }
    };
    Some(ClientLocation {
        ip,
        fqdn: local_fqdn(),
        site,
    })
}

fn local_fqdn() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes at most buf.len() bytes and NUL-terminates.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The replica catalog seam; tests and alternative catalogs plug in here.
#[async_trait]
pub trait ReplicaCatalog: Send + Sync {
    /// List replicas for `dids`, geo-sorted around `location` when given.
    async fn list_replicas(
        &self,
        schemes: &[&str],
        dids: &[Did],
        location: Option<&ClientLocation>,
    ) -> Result<Vec<ReplicaRecord>, PilotError>;
}

#[derive(Debug, Serialize)]
struct ListReplicasRequest<'a> {
    schemes: &'a [&'a str],
    dids: &'a [Did],
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_location: Option<&'a ClientLocation>,
}

/// JSON-over-HTTP catalog client.
pub struct HttpReplicaCatalog {
    http: reqwest::Client,
    base: String,
}

impl HttpReplicaCatalog {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }

    async fn post(&self, request: &ListReplicasRequest<'_>) -> Result<reqwest::Response, PilotError> {
        let url = format!("{}/replicas/list", self.base.trim_end_matches('/'));
        let mut builder = self.http.post(&url).json(request);
        if let Ok(account) = std::env::var("RUCIO_ACCOUNT") {
            builder = builder.header("X-Rucio-Account", account);
        }
        builder.send().await.map_err(|err| {
            PilotError::new(ErrorCode::CommunicationFailure)
                .with_kwarg("reason", format!("list_replicas: {err}"))
        })
    }
}

#[async_trait]
impl ReplicaCatalog for HttpReplicaCatalog {
    async fn list_replicas(
        &self,
        schemes: &[&str],
        dids: &[Did],
        location: Option<&ClientLocation>,
    ) -> Result<Vec<ReplicaRecord>, PilotError> {
        let sorted = ListReplicasRequest {
            schemes,
            dids,
            sort: location.map(|_| "geoip"),
            client_location: location,
        };
        debug!("list_replicas query: {} dids, geo={}", dids.len(), location.is_some());

        let mut response = self.post(&sorted).await?;

        // Older catalogs reject the location parameters; retry without them.
        if !response.status().is_success() && location.is_some() {
            warn!(
                "catalog rejected geo-sorted query (http {}), retrying unsorted",
                response.status()
            );
            let unsorted = ListReplicasRequest {
                schemes,
                dids,
                sort: None,
                client_location: None,
            };
            response = self.post(&unsorted).await?;
        }

        if !response.status().is_success() {
            return Err(PilotError::new(ErrorCode::CommunicationFailure)
                .with_kwarg("reason", format!("list_replicas: http {}", response.status())));
        }

        response.json().await.map_err(|err| {
            PilotError::new(ErrorCode::ConversionFailure)
                .with_kwarg("reason", format!("list_replicas body: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_record_parses_catalog_shape() {
        let record: ReplicaRecord = serde_json::from_value(serde_json::json!({
            "scope": "mc16",
            "name": "a.root",
            "bytes": 1024,
            "adler32": "deadbeef",
            "rses": {"SITE_DATADISK": ["root://host/a.root"]}
        }))
        .unwrap();
        assert_eq!(record.bytes, 1024);
        assert_eq!(record.md5, None);
        assert_eq!(record.rses["SITE_DATADISK"].len(), 1);
    }

    #[test]
    fn probe_site_defaults_to_unknown() {
        // The UDP connect needs no reachable peer, only a routable address;
        // if the sandbox forbids even that, None is the documented fallback.
        if let Some(location) = detect_client_location() {
            assert!(!location.ip.is_empty());
            assert!(!location.site.is_empty());
        }
    }
}
