//! Runtime settings. Environment variables are the single configuration
//! surface; per-tenant overrides for rate limits live in `tenants.config`.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::db::models::Tenant;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
pub const GRAPH_TOKEN_URL_TEMPLATE: &str =
    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Markers appended to every automated reply. A body carrying one of them is
/// our own output coming back around.
pub const DEFAULT_SIGNATURE_MARKERS: &[&str] = &[
    "-- sent by ars auto-reply",
    "this is an automated response",
    "[ars-auto-reply]",
];

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub db_path: Option<PathBuf>,
    pub provider: ProviderSettings,
    pub model: ModelSettings,
    pub rate_limits: RateLimitSettings,
    pub pacing: PacingSettings,
    pub fetch: FetchSettings,
    pub worker_url: Option<String>,
    pub token_key_hex: Option<String>,
    pub signature_markers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub graph_api_base: String,
    /// Token endpoint; `{tenant}` is replaced by the directory tenant id.
    pub token_url: String,
    pub directory_tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            graph_api_base: GRAPH_API_BASE.to_string(),
            token_url: GRAPH_TOKEN_URL_TEMPLATE.to_string(),
            directory_tenant_id: None,
            client_id: None,
            client_secret: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub min_confidence: f64,
    pub max_knowledge_chars: usize,
    pub max_body_chars: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            api_base: GEMINI_API_BASE.to_string(),
            min_confidence: 0.3,
            max_knowledge_chars: 12_000,
            max_body_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub burst_limit: i64,
    pub burst_window_secs: i64,
    pub max_per_minute: i64,
    pub max_per_hour: i64,
    pub max_per_day: i64,
    pub min_interval_secs: i64,
    pub emergency_30s_threshold: i64,
    pub emergency_60s_threshold: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            burst_limit: 2,
            burst_window_secs: 300,
            max_per_minute: 1,
            max_per_hour: 15,
            max_per_day: 100,
            min_interval_secs: 180,
            emergency_30s_threshold: 3,
            emergency_60s_threshold: 5,
        }
    }
}

impl RateLimitSettings {
    /// Applies `tenants.config.rate_limits` on top of the global values.
    pub fn for_tenant(&self, tenant: &Tenant) -> Self {
        let Some(overrides) = tenant
            .config
            .as_ref()
            .and_then(|config| config.get("rate_limits"))
            .and_then(|value| value.as_object())
        else {
            return *self;
        };

        let mut merged = *self;
        let pick = |key: &str, current: i64| {
            overrides
                .get(key)
                .and_then(|value| value.as_i64())
                .filter(|value| *value >= 0)
                .unwrap_or(current)
        };
        merged.burst_limit = pick("burst_limit", merged.burst_limit);
        merged.burst_window_secs = pick("burst_window_secs", merged.burst_window_secs);
        merged.max_per_minute = pick("max_per_minute", merged.max_per_minute);
        merged.max_per_hour = pick("max_per_hour", merged.max_per_hour);
        merged.max_per_day = pick("max_per_day", merged.max_per_day);
        merged.min_interval_secs = pick("min_interval_secs", merged.min_interval_secs);
        merged.emergency_30s_threshold =
            pick("emergency_30s_threshold", merged.emergency_30s_threshold);
        merged.emergency_60s_threshold =
            pick("emergency_60s_threshold", merged.emergency_60s_threshold);
        merged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacingSettings {
    pub jitter_ratio: f64,
    pub floor_secs: i64,
    pub ceiling_secs: i64,
    /// Quiet window start hour (local), inclusive.
    pub quiet_start_hour: u32,
    /// Quiet window end hour (local), exclusive.
    pub quiet_end_hour: u32,
    pub quiet_weekday: Option<Weekday>,
    pub utc_offset_hours: i32,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            jitter_ratio: 0.25,
            floor_secs: 60,
            ceiling_secs: 3_600,
            quiet_start_hour: 22,
            quiet_end_hour: 7,
            quiet_weekday: Some(Weekday::Sun),
            utc_offset_hours: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub first_run_lookback_hours: i64,
    pub overlap_minutes: i64,
    pub max_messages_per_cycle: usize,
    pub page_size: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            first_run_lookback_hours: 24,
            overlap_minutes: 5,
            max_messages_per_cycle: 50,
            page_size: 25,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let rate_defaults = RateLimitSettings::default();
        let pacing_defaults = PacingSettings::default();
        let fetch_defaults = FetchSettings::default();
        let model_defaults = ModelSettings::default();
        let provider_defaults = ProviderSettings::default();

        Self {
            db_path: env_string("ARS_DB_PATH").map(PathBuf::from),
            provider: ProviderSettings {
                graph_api_base: env_string("ARS_GRAPH_API_BASE")
                    .unwrap_or(provider_defaults.graph_api_base),
                token_url: env_string("ARS_GRAPH_TOKEN_URL").unwrap_or(provider_defaults.token_url),
                directory_tenant_id: env_string("ARS_TENANT_ID"),
                client_id: env_string("ARS_CLIENT_ID"),
                client_secret: env_string("ARS_CLIENT_SECRET"),
            },
            model: ModelSettings {
                api_key: env_string("ARS_GEMINI_API_KEY"),
                model: env_string("ARS_GEMINI_MODEL").unwrap_or(model_defaults.model),
                api_base: env_string("ARS_GEMINI_API_BASE").unwrap_or(model_defaults.api_base),
                min_confidence: env_parse("ARS_MIN_CONFIDENCE")
                    .unwrap_or(model_defaults.min_confidence),
                ..model_defaults
            },
            rate_limits: RateLimitSettings {
                burst_limit: env_parse("ARS_BURST_LIMIT").unwrap_or(rate_defaults.burst_limit),
                burst_window_secs: env_parse("ARS_BURST_WINDOW_SECS")
                    .unwrap_or(rate_defaults.burst_window_secs),
                max_per_minute: env_parse("ARS_MAX_PER_MINUTE")
                    .unwrap_or(rate_defaults.max_per_minute),
                max_per_hour: env_parse("ARS_MAX_PER_HOUR").unwrap_or(rate_defaults.max_per_hour),
                max_per_day: env_parse("ARS_MAX_PER_DAY").unwrap_or(rate_defaults.max_per_day),
                min_interval_secs: env_parse("ARS_MIN_INTERVAL_SECS")
                    .unwrap_or(rate_defaults.min_interval_secs),
                emergency_30s_threshold: env_parse("ARS_EMERGENCY_30S")
                    .unwrap_or(rate_defaults.emergency_30s_threshold),
                emergency_60s_threshold: env_parse("ARS_EMERGENCY_60S")
                    .unwrap_or(rate_defaults.emergency_60s_threshold),
            },
            pacing: PacingSettings {
                utc_offset_hours: env_parse("ARS_UTC_OFFSET_HOURS")
                    .unwrap_or(pacing_defaults.utc_offset_hours),
                quiet_start_hour: env_parse("ARS_QUIET_START_HOUR")
                    .unwrap_or(pacing_defaults.quiet_start_hour),
                quiet_end_hour: env_parse("ARS_QUIET_END_HOUR")
                    .unwrap_or(pacing_defaults.quiet_end_hour),
                quiet_weekday: match env_string("ARS_QUIET_WEEKDAY") {
                    Some(raw) if raw.eq_ignore_ascii_case("none") => None,
                    Some(raw) => Weekday::from_str(&raw)
                        .ok()
                        .or(pacing_defaults.quiet_weekday),
                    None => pacing_defaults.quiet_weekday,
                },
                ..pacing_defaults
            },
            fetch: FetchSettings {
                max_messages_per_cycle: env_parse("ARS_MAX_MESSAGES_PER_CYCLE")
                    .unwrap_or(fetch_defaults.max_messages_per_cycle),
                ..fetch_defaults
            },
            worker_url: env_string("ARS_WORKER_URL"),
            token_key_hex: env_string("ARS_TOKEN_KEY"),
            signature_markers: env_string("ARS_SIGNATURE_MARKERS")
                .map(|raw| {
                    raw.split('|')
                        .map(|marker| marker.trim().to_ascii_lowercase())
                        .filter(|marker| !marker.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn signature_markers(&self) -> Vec<String> {
        if self.signature_markers.is_empty() {
            DEFAULT_SIGNATURE_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect()
        } else {
            self.signature_markers.clone()
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}
