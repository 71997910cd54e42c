//! Health probes
//!
//! Storage is probed with a trivial one-row customer list; the payment
//! provider by retrieving a customer that cannot exist, where a
//! NotFound-class reply means the API is reachable. Each probe races a
//! timeout; slow-but-alive components report degraded and the overall
//! status is the worst of the children.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    common::Pagination,
    config::HealthConfig,
    provider::PaymentProvider,
    storage::Storage,
    Result,
};

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One probed component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub details: serde_json::Value,
}

/// Aggregate health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// Probes the storage and provider ports
pub struct HealthChecker {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn PaymentProvider>,
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn PaymentProvider>,
        config: HealthConfig,
    ) -> Self {
        Self {
            storage,
            provider,
            config,
        }
    }

    /// Run all probes and aggregate worst-of-children
    pub async fn check(&self) -> SystemHealth {
        let storage = self.check_storage().await;
        let provider = self.check_provider().await;

        let status = storage.status.max(provider.status);
        SystemHealth {
            status,
            components: vec![storage, provider],
        }
    }

    async fn check_storage(&self) -> ComponentHealth {
        let started = Instant::now();
        let timeout = std::time::Duration::from_millis(self.config.probe_timeout_ms);

        let probe = async {
            self.storage.ping().await?;
            self.storage.customers().list(Pagination::new(1, 0)).await?;
            Result::Ok(())
        };

        let outcome = tokio::time::timeout(timeout, probe).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(_) => {
                warn!("storage health probe timed out");
                ComponentHealth {
                    name: "storage".to_string(),
                    status: HealthStatus::Unhealthy,
                    response_time_ms: elapsed_ms,
                    error: Some(format!(
                        "probe timed out after {}ms",
                        self.config.probe_timeout_ms
                    )),
                    details: serde_json::json!({}),
                }
            }
            Ok(Err(e)) => ComponentHealth {
                name: "storage".to_string(),
                status: HealthStatus::Unhealthy,
                response_time_ms: elapsed_ms,
                error: Some(e.to_string()),
                details: serde_json::json!({}),
            },
            Ok(Ok(())) => {
                let status = if elapsed_ms > self.config.storage_degraded_ms {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                ComponentHealth {
                    name: "storage".to_string(),
                    status,
                    response_time_ms: elapsed_ms,
                    error: None,
                    details: serde_json::json!({
                        "degraded_threshold_ms": self.config.storage_degraded_ms,
                    }),
                }
            }
        }
    }

    async fn check_provider(&self) -> ComponentHealth {
        let started = Instant::now();
        let timeout = std::time::Duration::from_millis(self.config.probe_timeout_ms);

        // A customer id that cannot exist; NotFound proves the API answers
        let probe = self.provider.get_customer("qzpay_health_probe");

        let outcome = tokio::time::timeout(timeout, probe).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let provider_name = format!("provider:{}", self.provider.kind());

        match outcome {
            Err(_) => {
                warn!("provider health probe timed out");
                ComponentHealth {
                    name: provider_name,
                    status: HealthStatus::Unhealthy,
                    response_time_ms: elapsed_ms,
                    error: Some(format!(
                        "probe timed out after {}ms",
                        self.config.probe_timeout_ms
                    )),
                    details: serde_json::json!({}),
                }
            }
            Ok(result) => {
                let reachable = match &result {
                    Ok(_) => true,
                    Err(e) => e.is_not_found(),
                };

                if reachable {
                    let status = if elapsed_ms > self.config.provider_degraded_ms {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    };
                    ComponentHealth {
                        name: provider_name,
                        status,
                        response_time_ms: elapsed_ms,
                        error: None,
                        details: serde_json::json!({
                            "degraded_threshold_ms": self.config.provider_degraded_ms,
                        }),
                    }
                } else {
                    let error = result.err().map(|e| e.to_string());
                    ComponentHealth {
                        name: provider_name,
                        status: HealthStatus::Unhealthy,
                        response_time_ms: elapsed_ms,
                        error,
                        details: serde_json::json!({}),
                    }
                }
            }
        }
    }
}
