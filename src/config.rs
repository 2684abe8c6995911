//! Configuration types for alf-run
//!
//! Options are plain `serde` structs with defaults. Environment variables
//! (`ALFlog_*` for the Run Logger, `ALFmail_*` for the Notification Mailer)
//! are applied on top through one validation function per recognized key.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Prefix of the environment variables configuring the mailer
pub const MAIL_ENV_PREFIX: &str = "ALFmail_";

/// Prefix of the environment variables configuring the run logs
pub const LOG_ENV_PREFIX: &str = "ALFlog_";

/// Options for one run of a batch job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOptions {
    /// Job identity used to name every log, lock and detail file
    pub nickname: String,

    /// Folder holding the logs (created if missing)
    pub home: PathBuf,

    /// Months of Archive/Mail/Error logs to keep (default: 12)
    #[serde(default = "default_retention_months")]
    pub retention_months: u32,

    /// Refuse to run while another run of the same job holds the crash lock
    #[serde(default)]
    pub singleton: bool,

    /// Keep the per-run Error log as `<name>_activity.txt` on clean runs
    #[serde(default)]
    pub keep_activity: bool,

    /// Echo sink writes to the original console stream (default: true)
    #[serde(default = "default_true")]
    pub echo: bool,

    /// `chrono` format prefixed to each Activity log line (None = no stamp)
    #[serde(default)]
    pub timestamp_mask: Option<String>,

    /// Exit non-zero when a clean return carries an error value (default: true)
    ///
    /// Uncaught errors and panics always exit with a failure code.
    #[serde(default = "default_true")]
    pub exit_return_error: bool,

    /// Notification settings
    #[serde(default)]
    pub mail: MailConfig,
}

impl RunOptions {
    /// Options for `nickname` logging into `home`, everything else default
    pub fn new(nickname: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            nickname: nickname.into(),
            home: home.into(),
            retention_months: default_retention_months(),
            singleton: false,
            keep_activity: false,
            echo: true,
            timestamp_mask: None,
            exit_return_error: true,
            mail: MailConfig::default(),
        }
    }

    /// Apply `ALFlog_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `ALFlog_*` overrides using `lookup` to read variables
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{LOG_ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("Echo") {
            self.echo = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = var("KeepActivity") {
            self.keep_activity = parse_bool(&key, &value)?;
        }
        // kept verbatim; trailing separators belong to the mask
        if let Some((_, value)) = var("TimeStamp") {
            self.timestamp_mask = (!value.is_empty()).then_some(value);
        }
        if let Some((key, value)) = var("Retention") {
            self.retention_months = parse_number(&key, &value)?;
        }
        self.mail.apply_env_with(lookup)
    }
}

/// How often a status summary e-mail is due regardless of run outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCadence {
    /// Never send a status summary
    #[default]
    Never,
    /// First run of each calendar day
    Day,
    /// First run of each period
    Period,
    /// Every run
    Every,
}

/// `Sensitivity` header value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// Personal
    Personal,
    /// Private
    Private,
    /// Company-Confidential
    Confidential,
}

impl Sensitivity {
    /// Header text
    pub fn as_header(&self) -> &'static str {
        match self {
            Sensitivity::Personal => "Personal",
            Sensitivity::Private => "Private",
            Sensitivity::Confidential => "Company-Confidential",
        }
    }
}

/// Consecutive-failure window in which failure e-mails are sent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsecutiveWindow {
    /// Send once the streak reaches this many failures
    pub min: u32,
    /// Stop sending once the streak goes beyond this (None = never stop)
    pub max: Option<u32>,
}

impl Default for ConsecutiveWindow {
    fn default() -> Self {
        Self { min: 1, max: None }
    }
}

impl ConsecutiveWindow {
    /// Whether a streak of `count` failures is inside the window
    pub fn contains(&self, count: u32) -> bool {
        count >= self.min && self.max.is_none_or(|max| count <= max)
    }
}

/// Notification Mailer configuration (one field per `ALFmail_*` variable)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailConfig {
    /// Candidate SMTP servers, tried in order (empty = MX discovery)
    #[serde(default)]
    pub servers: Vec<String>,

    /// SMTP port (default: 25)
    #[serde(default = "default_mail_port")]
    pub port: u16,

    /// Connection timeout (default: 30 seconds)
    #[serde(default = "default_mail_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Implicit TLS from the first byte (otherwise STARTTLS when offered)
    #[serde(default)]
    pub ssl: bool,

    /// PEM trust anchor added to the TLS parameters
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    /// SMTP user name
    #[serde(default)]
    pub username: Option<String>,

    /// SMTP password
    #[serde(default)]
    pub password: Option<String>,

    /// Sender address (default: `<nickname>@<hostname>` at send time)
    #[serde(default)]
    pub from: Option<String>,

    /// Recipients
    #[serde(default)]
    pub to: Vec<String>,

    /// Carbon-copy recipients
    #[serde(default)]
    pub cc: Vec<String>,

    /// Blind carbon-copy recipients
    #[serde(default)]
    pub bcc: Vec<String>,

    /// Optional `Sensitivity` header
    #[serde(default)]
    pub sensitivity: Option<Sensitivity>,

    /// Master switch (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hours per period bucket (default: 4)
    #[serde(default = "default_period_hours")]
    pub period_hours: u32,

    /// Failure e-mails allowed per period (0 = unlimited)
    #[serde(default)]
    pub limit: u32,

    /// Consecutive-failure window for failure e-mails
    #[serde(default)]
    pub consecutive: ConsecutiveWindow,

    /// Send a message after every successful run
    #[serde(default)]
    pub success: bool,

    /// Status summary cadence
    #[serde(default)]
    pub status: StatusCadence,

    /// Include the Activity log in the message body
    #[serde(default)]
    pub verbose: bool,

    /// Attempts per candidate server (default: 3)
    #[serde(default = "default_mail_tries")]
    pub tries: u32,

    /// Pause between attempts (default: 10 seconds)
    #[serde(default = "default_mail_delay", with = "duration_serde")]
    pub delay: Duration,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: default_mail_port(),
            timeout: default_mail_timeout(),
            ssl: false,
            certificate: None,
            username: None,
            password: None,
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            sensitivity: None,
            enabled: true,
            period_hours: default_period_hours(),
            limit: 0,
            consecutive: ConsecutiveWindow::default(),
            success: false,
            status: StatusCadence::default(),
            verbose: false,
            tries: default_mail_tries(),
            delay: default_mail_delay(),
        }
    }
}

impl MailConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Number of period buckets in a day's ring: `24 / period_hours + 1`
    pub fn period_slots(&self) -> usize {
        (24 / self.period_hours.clamp(1, 24)) as usize + 1
    }

    /// Whether there is anyone to notify
    pub fn has_recipients(&self) -> bool {
        !(self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty())
    }

    /// Apply `ALFmail_*` variables using `lookup`; an empty value clears a field
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in MAIL_KEYS {
            let key = format!("{MAIL_ENV_PREFIX}{name}");
            if let Some(value) = lookup(&key) {
                self.set(name, &key, value.trim())?;
            }
        }
        self.validate()
    }

    fn set(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        match name {
            "Server" => self.servers = parse_list(value),
            "Port" => self.port = parse_number(key, value)?,
            "Timeout" => self.timeout = Duration::from_secs(parse_number(key, value)?),
            "SSL" => self.ssl = parse_bool(key, value)?,
            "Key" if !value.is_empty() => {
                return Err(Error::config(
                    key,
                    "client keys are not supported; set ALFmail_Certificate to a PEM trust anchor",
                ));
            }
            "Certificate" => self.certificate = non_empty(value).map(PathBuf::from),
            "Username" => self.username = non_empty(value),
            "Password" => self.password = non_empty(value),
            "From" => self.from = non_empty(value),
            "To" => self.to = parse_list(value),
            "CC" => self.cc = parse_list(value),
            "BCC" => self.bcc = parse_list(value),
            "Sensitivity" => self.sensitivity = parse_sensitivity(key, value)?,
            "Enabled" => self.enabled = parse_bool(key, value)?,
            "Period" => self.period_hours = parse_number(key, value)?,
            "Limit" => self.limit = parse_number(key, value)?,
            "Consecutive" => self.consecutive = parse_consecutive(key, value)?,
            "Success" => self.success = parse_bool(key, value)?,
            "Status" => self.status = parse_status(key, value)?,
            "Verbose" => self.verbose = parse_bool(key, value)?,
            "Tries" => self.tries = parse_number(key, value)?,
            "Delay" => self.delay = Duration::from_secs(parse_number(key, value)?),
            _ => {}
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.period_hours == 0 || self.period_hours > 24 {
            return Err(Error::config(
                "ALFmail_Period",
                format!("period must be 1..=24 hours, got {}", self.period_hours),
            ));
        }
        if self.tries == 0 {
            return Err(Error::config("ALFmail_Tries", "at least one attempt is required"));
        }
        if let Some(max) = self.consecutive.max
            && max < self.consecutive.min
        {
            return Err(Error::config(
                "ALFmail_Consecutive",
                format!("maximum {max} is below minimum {}", self.consecutive.min),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config(
                "ALFmail_Username",
                "user name and password must be set together",
            ));
        }
        Ok(())
    }
}

/// Every recognized `ALFmail_*` suffix
pub const MAIL_KEYS: [&str; 22] = [
    "Server",
    "Port",
    "Timeout",
    "SSL",
    "Key",
    "Certificate",
    "Username",
    "Password",
    "From",
    "To",
    "CC",
    "BCC",
    "Sensitivity",
    "Enabled",
    "Period",
    "Limit",
    "Consecutive",
    "Success",
    "Status",
    "Verbose",
    "Tries",
    "Delay",
];

/// Retry configuration for the Retry Engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of calls, including the first (default: 3)
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Pause before the first retry (default: 5 seconds)
    #[serde(default = "default_pause", with = "duration_serde")]
    pub pause: Duration,

    /// Maximum pause between retries (default: 60 seconds)
    #[serde(default = "default_max_pause", with = "duration_serde")]
    pub max_pause: Duration,

    /// Multiplier applied to the pause after each retry (default: 1.0 = fixed pause)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to pauses (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            pause: default_pause(),
            max_pause: default_max_pause(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Fixed-pause retry: `attempts` calls, `pause` between them
    pub fn fixed(attempts: u32, pause: Duration) -> Self {
        Self {
            attempts,
            pause,
            max_pause: pause,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// HTTP/FTP client settings for the Download Engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Connection and read timeout (default: 60 seconds)
    #[serde(default = "default_download_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Read/write buffer size in KiB (default: 64)
    #[serde(default = "default_read_size_kb")]
    pub read_size_kb: usize,

    /// User-Agent sent with HTTP requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra PEM trust anchor for HTTPS servers
    #[serde(default)]
    pub root_certificate: Option<PathBuf>,

    /// Accept invalid HTTPS certificates (default: false)
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Redirects followed before giving up (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: default_download_timeout(),
            read_size_kb: default_read_size_kb(),
            user_agent: default_user_agent(),
            root_certificate: None,
            accept_invalid_certs: false,
            max_redirects: default_max_redirects(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Ok(true),
        "0" | "false" | "no" | "off" | "n" | "" => Ok(false),
        other => Err(Error::config(key, format!("'{other}' is not a boolean"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::config(key, format!("'{value}' is not a valid number")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_sensitivity(key: &str, value: &str) -> Result<Option<Sensitivity>> {
    match value.to_ascii_lowercase().as_str() {
        "" | "normal" => Ok(None),
        "personal" => Ok(Some(Sensitivity::Personal)),
        "private" => Ok(Some(Sensitivity::Private)),
        "confidential" | "company-confidential" => Ok(Some(Sensitivity::Confidential)),
        other => Err(Error::config(key, format!("unknown sensitivity '{other}'"))),
    }
}

fn parse_status(key: &str, value: &str) -> Result<StatusCadence> {
    match value.to_ascii_lowercase().as_str() {
        "" | "never" | "off" | "0" => Ok(StatusCadence::Never),
        "day" | "daily" => Ok(StatusCadence::Day),
        "period" => Ok(StatusCadence::Period),
        "every" | "always" | "run" => Ok(StatusCadence::Every),
        other => Err(Error::config(key, format!("unknown status cadence '{other}'"))),
    }
}

/// `"3"` means from the third failure on, `"2-5"` means failures two to five
fn parse_consecutive(key: &str, value: &str) -> Result<ConsecutiveWindow> {
    match value.split_once('-') {
        Some((min, max)) => Ok(ConsecutiveWindow {
            min: parse_number(key, min.trim())?,
            max: Some(parse_number(key, max.trim())?),
        }),
        None if value.is_empty() => Ok(ConsecutiveWindow::default()),
        None => Ok(ConsecutiveWindow {
            min: parse_number(key, value)?,
            max: None,
        }),
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_months() -> u32 {
    12
}

fn default_mail_port() -> u16 {
    25
}

fn default_mail_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_period_hours() -> u32 {
    4
}

fn default_mail_tries() -> u32 {
    3
}

fn default_mail_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_attempts() -> u32 {
    3
}

fn default_pause() -> Duration {
    Duration::from_secs(5)
}

fn default_max_pause() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_read_size_kb() -> usize {
    64
}

fn default_user_agent() -> String {
    format!("alf-run/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_redirects() -> usize {
    10
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn mail_env_overrides_every_typed_field() {
        let mut config = MailConfig::default();
        config
            .apply_env_with(lookup(&[
                ("ALFmail_Server", "smtp1.example.com, smtp2.example.com"),
                ("ALFmail_Port", "587"),
                ("ALFmail_To", "ops@example.com;dev@example.com"),
                ("ALFmail_Status", "day"),
                ("ALFmail_Consecutive", "2-5"),
                ("ALFmail_Sensitivity", "private"),
                ("ALFmail_Delay", "1"),
                ("ALFmail_Verbose", "yes"),
            ]))
            .unwrap();

        assert_eq!(config.servers, vec!["smtp1.example.com", "smtp2.example.com"]);
        assert_eq!(config.port, 587);
        assert_eq!(config.to.len(), 2);
        assert_eq!(config.status, StatusCadence::Day);
        assert_eq!(
            config.consecutive,
            ConsecutiveWindow {
                min: 2,
                max: Some(5)
            }
        );
        assert_eq!(config.sensitivity, Some(Sensitivity::Private));
        assert_eq!(config.delay, Duration::from_secs(1));
        assert!(config.verbose);
    }

    #[test]
    fn invalid_number_names_the_offending_key() {
        let mut config = MailConfig::default();
        let err = config
            .apply_env_with(lookup(&[("ALFmail_Port", "smtp")]))
            .unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("ALFmail_Port")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn client_key_is_rejected_unless_empty() {
        let mut config = MailConfig::default();
        assert!(config.apply_env_with(lookup(&[("ALFmail_Key", "/etc/ssl/client.key")])).is_err());
        assert!(config.apply_env_with(lookup(&[("ALFmail_Key", "")])).is_ok());
    }

    #[test]
    fn period_out_of_range_is_rejected() {
        let mut config = MailConfig::default();
        assert!(config.apply_env_with(lookup(&[("ALFmail_Period", "0")])).is_err());
        let mut config = MailConfig::default();
        assert!(config.apply_env_with(lookup(&[("ALFmail_Period", "25")])).is_err());
    }

    #[test]
    fn empty_value_clears_a_field() {
        let mut config = MailConfig {
            from: Some("job@example.com".into()),
            ..Default::default()
        };
        config.apply_env_with(lookup(&[("ALFmail_From", "")])).unwrap();
        assert_eq!(config.from, None);
    }

    #[test]
    fn period_slots_follow_period_size() {
        let mut config = MailConfig::default();
        assert_eq!(config.period_slots(), 7);
        config.period_hours = 5;
        assert_eq!(config.period_slots(), 5);
        config.period_hours = 24;
        assert_eq!(config.period_slots(), 2);
    }

    #[test]
    fn consecutive_window_bounds() {
        let window = ConsecutiveWindow {
            min: 2,
            max: Some(3),
        };
        assert!(!window.contains(1));
        assert!(window.contains(2));
        assert!(window.contains(3));
        assert!(!window.contains(4));
        assert!(ConsecutiveWindow::default().contains(100));
    }

    #[test]
    fn log_env_overrides_apply() {
        let mut options = RunOptions::new("nightly", "/tmp/x");
        options
            .apply_env_with(lookup(&[
                ("ALFlog_Echo", "0"),
                ("ALFlog_KeepActivity", "1"),
                ("ALFlog_TimeStamp", "%H:%M:%S "),
                ("ALFlog_Retention", "3"),
            ]))
            .unwrap();
        assert!(!options.echo);
        assert!(options.keep_activity);
        assert_eq!(options.timestamp_mask.as_deref(), Some("%H:%M:%S "));
        assert_eq!(options.retention_months, 3);
    }

    #[test]
    fn timestamp_mask_clears_only_on_empty_value() {
        let mut options = RunOptions::new("nightly", "/tmp/x");
        options.timestamp_mask = Some("%H:%M ".to_string());
        options
            .apply_env_with(lookup(&[("ALFlog_TimeStamp", "  ")]))
            .unwrap();
        assert_eq!(options.timestamp_mask.as_deref(), Some("  "));

        options
            .apply_env_with(lookup(&[("ALFlog_TimeStamp", "")]))
            .unwrap();
        assert_eq!(options.timestamp_mask, None);
    }

    #[test]
    fn retry_config_round_trips_through_json() {
        let config = RetryConfig::fixed(4, Duration::from_secs(2));
        let json = serde_json::to_string(&config).unwrap();
        let back: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts, 4);
        assert_eq!(back.pause, Duration::from_secs(2));
    }
}
