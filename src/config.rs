use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_DATABASE_PATH: &str = "price-list-import.db";
const DEFAULT_GEOCODER_BASE_URL: &str = "http://nominatim:8080";
const DEFAULT_EXCLUDED_SHEETS: &[&str] = &["sheet1", "sheet6"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: String,
    pub geocoder_base_url: String,
    pub geocoder_country_codes: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_timeout_secs: u64,
    pub geocoder_concurrency: usize,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_refresh_resolved: bool,
    pub import_source_name: String,
    pub excluded_sheets: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub geocoder_base_url: String,
    pub geocoder_country_codes: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_concurrency: usize,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_refresh_resolved: bool,
    pub import_source_name: String,
    pub excluded_sheets: Vec<String>,
    pub has_geocoder_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string()),
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_BASE_URL.to_string()),
            geocoder_country_codes: env::var("GEOCODER_COUNTRY_CODES")
                .unwrap_or_else(|_| "tt".to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", 10),
            geocoder_concurrency: parse_usize("GEOCODER_CONCURRENCY", 4).max(1),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", 5),
            geocoder_refresh_resolved: parse_bool("GEOCODER_REFRESH_RESOLVED", false),
            import_source_name: env::var("IMPORT_SOURCE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "mti".to_string()),
            excluded_sheets: env::var("IMPORT_EXCLUDED_SHEETS")
                .map(|v| parse_list(&v))
                .unwrap_or_else(|_| {
                    DEFAULT_EXCLUDED_SHEETS
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.clone(),
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_country_codes: self.geocoder_country_codes.clone(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_concurrency: self.geocoder_concurrency,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            geocoder_refresh_resolved: self.geocoder_refresh_resolved,
            import_source_name: self.import_source_name.clone(),
            excluded_sheets: self.excluded_sheets.clone(),
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            geocoder_base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            geocoder_country_codes: "tt".to_string(),
            geocoder_api_key: None,
            geocoder_timeout_secs: 10,
            geocoder_concurrency: 4,
            geocoder_rate_limit_qps: 5,
            geocoder_refresh_resolved: false,
            import_source_name: "mti".to_string(),
            excluded_sheets: DEFAULT_EXCLUDED_SHEETS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GEOCODER_API_KEY", "secret");
        env::set_var("GEOCODER_BASE_URL", "http://geo.local:9000/");
        env::set_var("DATABASE_PATH", "custom.db");
        env::set_var("GEOCODER_CONCURRENCY", "0");
        env::set_var("IMPORT_EXCLUDED_SHEETS", " Sheet1 , ,Notes");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_path, "custom.db");
        assert_eq!(public.geocoder_base_url, "http://geo.local:9000");
        assert_eq!(public.geocoder_concurrency, 1);
        assert!(public.has_geocoder_api_key);
        assert!(config.geocoder_api_key.is_some());
        assert_eq!(public.excluded_sheets, vec!["sheet1", "notes"]);
        assert_eq!(public.geocoder_country_codes, "tt");

        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }
}
