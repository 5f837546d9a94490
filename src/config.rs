use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub staging: StagingConfig,
    pub extracts: ExtractsConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub merger: MergerConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub airports: AirportFilter,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub interval_minutes: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
}

fn default_initial_delay() -> u64 {
    10
}

/// Where the external collector drops its JSON batches.
#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    pub dir: String,
    #[serde(default = "default_parse_failure_threshold")]
    pub parse_failure_threshold: f64,
}

fn default_parse_failure_threshold() -> f64 {
    0.10
}

/// Where the dimension seed extracts (CSV) live.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractsConfig {
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatcherConfig {
    /// METAR candidates must lie within this many hours of the departure
    /// instant. The upstream system never pinned this down; the default is
    /// deliberately generous for hourly collection cadences.
    #[serde(default = "default_metar_window_hours")]
    pub metar_window_hours: i64,
}

fn default_metar_window_hours() -> i64 {
    3
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            metar_window_hours: default_metar_window_hours(),
        }
    }
}

/// What happens to an enrichment field when the new snapshot has no value.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentPolicy {
    /// Keep the previously materialized value when the snapshot is null.
    #[default]
    Retain,
    /// The snapshot wins, null included.
    Refresh,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MergerConfig {
    #[serde(default)]
    pub enrichment: EnrichmentPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    /// Only insert flight facts that resolved both a departure METAR and an
    /// arrival TAF. A filtering policy, not a matcher requirement.
    #[serde(default = "default_require_weather")]
    pub require_weather: bool,
}

fn default_require_weather() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            require_weather: default_require_weather(),
        }
    }
}

/// Optional restriction of which flights are loaded, by airport code.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AirportFilter {
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl AirportFilter {
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty() && self.patterns.is_empty()
    }

    /// A flight passes when either endpoint matches the filter.
    pub fn matches_flight(&self, from_iata: &str, to_iata: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        self.matches_code(from_iata) || self.matches_code(to_iata)
    }

    fn matches_code(&self, iata: &str) -> bool {
        let upper = iata.to_uppercase();
        if self.codes.iter().any(|c| c.to_uppercase() == upper) {
            return true;
        }
        for pattern in &self.patterns {
            if glob::Pattern::new(pattern)
                .map(|p| p.matches(&upper))
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        // Substitute environment variables
        let expanded = expand_env_vars(&content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Valid port ranges and connection limits
    /// - Non-empty required fields
    /// - Positive time intervals and windows
    fn validate(&self) -> Result<()> {
        // Check if any database field contains unexpanded environment variables
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        // Validate port is not zero (u16 max is 65535, so no upper bound check needed)
        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        if self.scheduler.interval_minutes == 0 {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }

        // Warn if interval is too short
        if self.scheduler.interval_minutes < 5 {
            tracing::warn!(
                "Scheduler interval of {} minutes is very short, consider using at least 5 minutes",
                self.scheduler.interval_minutes
            );
        }

        if self.staging.dir.is_empty() {
            return Err(AppError::Config(
                "Staging dir cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.staging.parse_failure_threshold) {
            return Err(AppError::Config(format!(
                "Staging parse_failure_threshold {} must be between 0.0 and 1.0",
                self.staging.parse_failure_threshold
            )));
        }

        if self.extracts.dir.is_empty() {
            return Err(AppError::Config(
                "Extracts dir cannot be empty".to_string(),
            ));
        }

        if self.matcher.metar_window_hours <= 0 {
            return Err(AppError::Config(
                "Matcher metar_window_hours must be greater than 0".to_string(),
            ));
        }

        if self.matcher.metar_window_hours > 24 {
            tracing::warn!(
                "Matcher window of {} hours is wide; observations that old rarely describe departure conditions",
                self.matcher.metar_window_hours
            );
        }

        // Validate airport codes look like IATA codes
        for code in &self.airports.codes {
            if code.len() != 3 {
                return Err(AppError::Config(format!(
                    "Airport code '{}' must be exactly 3 characters (e.g., 'CDG', 'JFK')",
                    code
                )));
            }
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").unwrap();

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
