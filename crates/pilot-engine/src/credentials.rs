//! Objectstore credential setup.
//!
//! Payloads that write to `OS_ES` / `OS_LOGS` endpoints need an S3 key pair
//! in their environment. The endpoint configuration names the keys; the
//! actual pair is fetched from the server once per job and handed to the
//! payload as environment variables.

use serde_json::Value;
use tracing::{debug, warn};

use gridpilot_core::infosys::StorageData;
use gridpilot_core::job::Job;

use crate::communicator::Communicator;
use crate::context::PilotContext;

/// The `export K=V; ...` command string for one endpoint protocol, or
/// `None` when the endpoint needs no setup.
pub async fn objectstore_setup(
    communicator: &Communicator,
    ddm: &StorageData,
    protocol_id: i64,
) -> Option<String> {
    let key = protocol_id.to_string();
    if let Some(setup) = ddm.special_setup.get(&key)
        && !setup.is_empty()
    {
        return Some(setup.clone());
    }
    if !ddm.is_objectstore() {
        return None;
    }

    let protocol = ddm.rprotocols.get(&key)?;
    let access_key = protocol.settings.get("access_key")?;
    let secret_key = protocol.settings.get("secret_key")?;
    let is_secure = protocol.settings.get("is_secure")?;

    let response = communicator.get_key_pair(access_key, secret_key).await;
    if !response.is_ok() {
        warn!("failed to get the key pair for objectstore endpoint {}", ddm.name);
        return None;
    }
    let content = response.content?;
    let public = content.get("publicKey").and_then(Value::as_str)?;
    let private = content.get("privateKey").and_then(Value::as_str)?;

    Some(format!(
        "export S3_ACCESS_KEY={public}; export S3_SECRET_KEY={private}; export S3_IS_SECURE={is_secure};"
    ))
}

/// Parse an `export K=V; export K2=V2;` command string into pairs.
pub fn parse_env_exports(setup: &str) -> Vec<(String, String)> {
    setup
        .split(';')
        .filter_map(|part| {
            let assignment = part.trim().strip_prefix("export ")?;
            let (key, value) = assignment.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Environment the payload of `job` needs for objectstore access: the setup
/// of every distinct objectstore output endpoint, merged.
pub async fn payload_env(ctx: &PilotContext, job: &Job) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for fspec in &job.outdata {
        if seen.contains(&fspec.ddmendpoint.as_str()) {
            continue;
        }
        seen.push(&fspec.ddmendpoint);
        let Some(ddm) = ctx.info.storage(&fspec.ddmendpoint) else {
            continue;
        };
        if !ddm.is_objectstore() {
            continue;
        }
        // any configured protocol with credential settings will do
        let Some(protocol_id) = ddm
            .rprotocols
            .iter()
            .find(|(_, p)| p.settings.contains_key("access_key"))
            .and_then(|(_, p)| p.id)
        else {
            continue;
        };
        if let Some(setup) = objectstore_setup(&ctx.communicator, ddm, protocol_id).await {
            debug!("objectstore setup resolved for endpoint {}", ddm.name);
            env.extend(parse_env_exports(&setup));
        }
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_strings_parse_into_pairs() {
        let env = parse_env_exports(
            "export S3_ACCESS_KEY=pub; export S3_SECRET_KEY=priv; export S3_IS_SECURE=1;",
        );
        assert_eq!(
            env,
            vec![
                ("S3_ACCESS_KEY".to_string(), "pub".to_string()),
                ("S3_SECRET_KEY".to_string(), "priv".to_string()),
                ("S3_IS_SECURE".to_string(), "1".to_string()),
            ]
        );
        assert!(parse_env_exports("").is_empty());
        assert!(parse_env_exports("not an export").is_empty());
    }

    #[tokio::test]
    async fn preconfigured_setup_wins_without_a_server_roundtrip() {
        let ddm: StorageData = serde_json::from_value(serde_json::json!({
            "name": "SITE_ES",
            "type": "OS_ES",
            "special_setup": {"175": "export S3_ACCESS_KEY=a; export S3_SECRET_KEY=b; export S3_IS_SECURE=1;"}
        }))
        .unwrap();
        let communicator = Communicator::new(
            reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(100))
                .build()
                .unwrap(),
            "http://127.0.0.1:9",
        );
        let setup = objectstore_setup(&communicator, &ddm, 175).await.unwrap();
        assert!(setup.contains("S3_ACCESS_KEY=a"));
    }

    #[tokio::test]
    async fn non_objectstore_endpoints_need_no_setup() {
        let ddm: StorageData = serde_json::from_value(serde_json::json!({
            "name": "SITE_DATADISK",
            "type": "DATADISK"
        }))
        .unwrap();
        let communicator = Communicator::new(reqwest::Client::new(), "http://127.0.0.1:9");
        assert!(objectstore_setup(&communicator, &ddm, 1).await.is_none());
    }
}
