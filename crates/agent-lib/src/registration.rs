//! Machine registration against the control plane

use crate::config::AgentConfig;
use crate::errors::RegistrationError;
use crate::hostinfo;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Request body for machine registration
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationPayload {
    pub token: String,
    pub machine_id: String,
    pub hostname: String,
    pub provider_name: String,
    pub pool_name: String,
    pub cpu: String,
    pub memory: String,
    pub gpu_count: String,
    pub private_ip: String,
}

#[derive(Debug, Default, Deserialize)]
struct RegistrationResponse {
    #[serde(default)]
    config: serde_json::Value,
}

/// Successful registration outcome
#[derive(Debug)]
pub struct RegistrationResult {
    /// Opaque gateway-provided config blob
    pub config: serde_json::Value,
}

/// Register this machine with the control plane.
///
/// One-shot POST with a bearer token; the caller decides whether a failure
/// is fatal. In dry-run mode the request is skipped entirely.
pub async fn register_machine(
    config: &AgentConfig,
) -> Result<RegistrationResult, RegistrationError> {
    let hostname = if config.hostname.is_empty() {
        format!("machine-{}", config.machine_id)
    } else {
        config.hostname.clone()
    };

    if config.k3s_token.is_empty() {
        warn!("No k3s token configured; the gateway won't be able to deploy worker pods to this machine");
    }

    let gpu_count = hostinfo::detect_gpu_count().await;

    let payload = RegistrationPayload {
        token: config.k3s_token.clone(),
        machine_id: config.machine_id.clone(),
        hostname: hostname.clone(),
        provider_name: config.provider_name.clone(),
        pool_name: config.pool_name.clone(),
        cpu: hostinfo::cpu_string(),
        memory: hostinfo::memory_string(),
        gpu_count: gpu_count.to_string(),
        private_ip: hostinfo::private_ip().await,
    };

    info!(
        machine_id = %config.machine_id,
        gateway = %config.gateway_url(),
        pool = %config.pool_name,
        hostname = %hostname,
        gpu_count,
        "Registering machine with gateway"
    );

    if config.dry_run {
        info!("Dry run mode - skipping actual registration");
        return Ok(RegistrationResult {
            config: serde_json::json!({"dry_run": true}),
        });
    }

    let client = reqwest::Client::builder()
        .timeout(config.registration_timeout())
        .build()
        .map_err(|e| RegistrationError::Connection {
            gateway: config.gateway_url(),
            reason: e.to_string(),
        })?;

    let response = client
        .post(config.register_url())
        .bearer_auth(&config.token)
        .json(&payload)
        .send()
        .await
        .map_err(|e| RegistrationError::Connection {
            gateway: config.gateway_url(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        200 => {
            let parsed: RegistrationResponse = serde_json::from_str(&body).unwrap_or_else(|e| {
                debug!(error = %e, body = %body, "Failed to parse registration response");
                RegistrationResponse::default()
            });
            info!(machine_id = %config.machine_id, "Machine registered successfully");
            Ok(RegistrationResult {
                config: parsed.config,
            })
        }
        403 => Err(RegistrationError::InvalidToken),
        400 => Err(RegistrationError::BadRequest { body }),
        other => Err(RegistrationError::Unexpected {
            status: other,
            body,
        }),
    }
}
