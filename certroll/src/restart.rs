//! Restart coordinator — reload every service that consumes a certificate.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::service::ServiceManager;

/// A service that did not come back after the update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartFailure {
    pub service: String,
    pub error: String,
}

/// Outcome of restarting a certificate's consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestartReport {
    pub restarted: Vec<String>,
    pub failed: Vec<RestartFailure>,
}

impl RestartReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.restarted.len() + self.failed.len()
    }
}

/// Restart every consumer of `refid`, one after another.
///
/// A failing service never stops the remaining ones from being attempted;
/// every failure ends up in the report.
pub fn restart_dependents<M: ServiceManager + ?Sized>(services: &M, refid: &str) -> RestartReport {
    let consumers = services.list_consumers(refid);
    if consumers.is_empty() {
        info!("No services use certificate {refid}, nothing to restart");
        return RestartReport::default();
    }

    info!(
        "Restarting {} service(s) using certificate {refid}",
        consumers.len()
    );

    let mut report = RestartReport::default();
    for service in &consumers {
        match services.restart(service) {
            Ok(()) => {
                info!("{} restarted", service.name);
                report.restarted.push(service.name.clone());
            }
            Err(e) => {
                error!("Failed to restart {}: {e}", service.name);
                report.failed.push(RestartFailure {
                    service: service.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    if report.is_success() {
        info!("All {} dependent service(s) restarted", report.attempted());
    } else {
        let names: Vec<&str> = report.failed.iter().map(|f| f.service.as_str()).collect();
        warn!(
            "Restarted {} of {} dependent service(s); restart manually: {:?}",
            report.restarted.len(),
            report.attempted(),
            names
        );
    }
    report
}
