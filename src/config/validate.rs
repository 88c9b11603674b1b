//! Validation of a loaded project file.

use crate::config::models::{Configuration, HealthConfig, Service};
use crate::config::{deps, models::ConfigDuration};
use crate::error::LoklError;
use anyhow::Result;

/// Check every load-time invariant of the project file.
pub fn validate(cfg: &Configuration) -> Result<()> {
    if cfg.name.is_empty() {
        return err("name is required");
    }

    if cfg.services.is_empty() {
        return err("at least one service is required");
    }

    for (name, svc) in &cfg.services {
        validate_service(name, svc, cfg)?;
    }

    // The dependency graph must be a DAG. The sort checks this again when
    // the supervisor starts, but a cycle is a config error first.
    deps::sort_by_dependency(&cfg.services)?;

    Ok(())
}

fn validate_service(name: &str, svc: &Service, cfg: &Configuration) -> Result<()> {
    let has_command = svc.command.as_deref().is_some_and(|c| !c.is_empty());
    let has_image = svc.image.as_deref().is_some_and(|i| !i.is_empty());

    if !has_command && !has_image {
        return err(format!("service {name:?}: command or image is required"));
    }
    if has_command && has_image {
        return err(format!(
            "service {name:?}: cannot specify both command and image"
        ));
    }

    if svc.subdomain.as_deref().is_some_and(|s| !s.is_empty()) {
        if cfg.proxy.domain.is_empty() {
            return err(format!(
                "service {name:?} has subdomain but proxy.domain is not configured"
            ));
        }
        if svc.port.unwrap_or(0) == 0 {
            return err(format!(
                "service {name:?}: port is required when subdomain is set"
            ));
        }
    }

    for dep in &svc.depends_on {
        if !cfg.services.contains_key(dep) {
            return err(format!(
                "service {name:?}: depends_on references unknown service {dep:?}"
            ));
        }
    }

    if let Some(health) = &svc.health {
        validate_health(name, svc, health)?;
    }

    if let Some(timeout) = &svc.ready_timeout {
        positive(name, "ready_timeout", timeout)?;
    }

    Ok(())
}

fn validate_health(name: &str, svc: &Service, health: &HealthConfig) -> Result<()> {
    if !health.path.is_empty() && svc.port.unwrap_or(0) == 0 {
        return err(format!(
            "service {name:?}: port is required when health check is configured"
        ));
    }

    if let Some(interval) = &health.interval {
        positive(name, "health.interval", interval)?;
    }
    if let Some(timeout) = &health.timeout {
        positive(name, "health.timeout", timeout)?;
    }

    Ok(())
}

fn positive(name: &str, field: &str, duration: &ConfigDuration) -> Result<()> {
    if duration.0.is_zero() {
        return err(format!(
            "service {name:?}: {field} must be a positive duration"
        ));
    }
    Ok(())
}

fn err(msg: impl Into<String>) -> Result<()> {
    Err(LoklError::config(msg).into())
}
