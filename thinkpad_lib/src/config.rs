use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::thinkpad_ec::protocol::TPC_BASE_PORT;
use crate::thinkpad_ec::{EcError, EcOptions, EcResult, RetryPolicy};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    base_port: Option<u16>,
    debug: Option<bool>,
    prefetch_ttl_ms: Option<u64>,
    request_poll: Option<Retry>,
    row_retry: Option<Retry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Retry {
    attempts: Option<u32>,
    delay_ns: Option<u64>,
}

impl Retry {
    fn apply(&self, name: &str, policy: &mut RetryPolicy) -> EcResult<()> {
        if let Some(attempts) = self.attempts {
            if attempts == 0 {
                return Err(EcError::DeviceError(format!(
                    "Invalid config: [{}] attempts must be at least 1",
                    name
                )));
            }
            policy.attempts = attempts;
        }
        if let Some(delay_ns) = self.delay_ns {
            policy.delay = Duration::from_nanos(delay_ns);
        }
        Ok(())
    }
}

const CONFIG_FILE: &str = "thinkpad_ec.toml";

/// Everything needed to set up EC access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub base_port: u16,
    pub options: EcOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_port: TPC_BASE_PORT,
            options: EcOptions::default(),
        }
    }
}

/// Next to the executable first, then the current directory
fn find_config_file() -> Option<PathBuf> {
    if let Ok(mut path) = std::env::current_exe() {
        path.pop();
        path.push(CONFIG_FILE);
        if path.is_file() {
            return Some(path);
        }
    }
    let path = PathBuf::from(CONFIG_FILE);
    path.is_file().then_some(path)
}

pub fn parse_config(toml_str: &str) -> EcResult<Settings> {
    let decoded: Config = toml::from_str(toml_str)
        .map_err(|err| EcError::DeviceError(format!("Invalid config: {}", err)))?;
    debug!("{:?}", decoded);

    let mut settings = Settings::default();
    if let Some(base_port) = decoded.base_port {
        settings.base_port = base_port;
    }
    let options = &mut settings.options;
    if let Some(debug) = decoded.debug {
        options.debug = debug;
    }
    if let Some(ttl) = decoded.prefetch_ttl_ms {
        options.timing.prefetch_ttl = Duration::from_millis(ttl);
    }
    if let Some(retry) = &decoded.request_poll {
        retry.apply("request_poll", &mut options.timing.request_poll)?;
    }
    if let Some(retry) = &decoded.row_retry {
        retry.apply("row_retry", &mut options.timing.row_retry)?;
    }
    Ok(settings)
}

/// Load settings from `path`, or from the default location if none is given.
/// Without a config file everything keeps its default.
pub fn load_config(path: Option<&Path>) -> EcResult<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match find_config_file() {
            Some(path) => path,
            None => return Ok(Settings::default()),
        },
    };
    let toml_str = std::fs::read_to_string(&path).map_err(|err| {
        EcError::DeviceError(format!("Failed to read {}: {}", path.display(), err))
    })?;
    parse_config(&toml_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(parse_config("").unwrap(), Settings::default());
    }

    #[test]
    fn full_config() {
        let settings = parse_config(
            r#"
            base_port = 0x1700
            debug = true
            prefetch_ttl_ms = 250

            [request_poll]
            attempts = 10
            delay_ns = 1000

            [row_retry]
            attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(settings.base_port, 0x1700);
        assert!(settings.options.debug);
        let timing = settings.options.timing;
        assert_eq!(timing.prefetch_ttl, Duration::from_millis(250));
        assert_eq!(
            timing.request_poll,
            RetryPolicy::new(10, Duration::from_micros(1))
        );
        assert_eq!(timing.row_retry.attempts, 3);
        assert_eq!(timing.row_retry.delay, RetryPolicy::ROW_RETRY.delay);
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert!(matches!(
            parse_config("base_port = \"somewhere\""),
            Err(EcError::DeviceError(_))
        ));
        assert!(matches!(
            parse_config("retries = 5"),
            Err(EcError::DeviceError(_))
        ));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        for section in ["request_poll", "row_retry"] {
            let toml_str = format!("[{}]\nattempts = 0", section);
            assert!(matches!(
                parse_config(&toml_str),
                Err(EcError::DeviceError(_))
            ));
        }
    }

    #[test]
    fn no_config_file_is_default() {
        let dir = std::env::temp_dir().join(format!("thinkpad_ec_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(&dir).unwrap();
        let ret = load_config(None);
        std::env::set_current_dir(cwd).unwrap();
        let _ = std::fs::remove_dir(&dir);
        assert_eq!(ret, Ok(Settings::default()));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/thinkpad_ec.toml"))).is_err());
    }
}
