pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::db::models::{ProcessedRecord, Tenant};
use crate::db::DatabaseStats;
use crate::guard::RateLimitSnapshot;
use crate::pipeline::CycleReport;
use crate::queue::QueueStats;
use crate::sender::DrainReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantStatus {
    pub tenant: Tenant,
    pub rate_limits: RateLimitSnapshot,
    pub queue: QueueStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub database: DatabaseStats,
    pub tenants: Vec<TenantStatus>,
}

pub fn format_status(format: OutputFormat, status: &StatusView) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(status)),
        OutputFormat::Json => json::to_pretty(status),
    }
}

pub fn format_tenants(format: OutputFormat, tenants: &[Tenant]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_tenants(tenants)),
        OutputFormat::Json => json::to_pretty(tenants),
    }
}

pub fn format_records(format: OutputFormat, records: &[ProcessedRecord]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_records(records)),
        OutputFormat::Json => json::to_pretty(records),
    }
}

pub fn format_cycle_report(format: OutputFormat, report: &CycleReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_cycle_report(report)),
        OutputFormat::Json => json::to_pretty(report),
    }
}

pub fn format_drain_report(format: OutputFormat, report: &DrainReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_drain_report(report)),
        OutputFormat::Json => json::to_pretty(report),
    }
}
