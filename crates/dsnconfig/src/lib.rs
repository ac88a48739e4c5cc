//! Configuration file parser for cluster processes
//!
//! Parses the INI-style configuration files read by servers and clients
//! (`[section]` headers, `key = value` pairs, `;` and `#` comments) and turns
//! them into typed option structs via [`define_options!`].
//!
//! # Example
//!
//! ```no_run
//! use dsnconfig::DsnConfig;
//!
//! let config = DsnConfig::from_file("/etc/dsn/config.ini").unwrap();
//! let enabled = config.get_with_fallback(&["security", "global"], "enable_auth");
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(String),
}

/// Trait for types that can be parsed from configuration values
pub trait ConfigValue: Sized + Clone {
    /// Parse from a string value in the config file
    fn parse_config_value(s: &str) -> Result<Self, ConfigError>;

    /// Get the type name for error messages
    fn type_name() -> &'static str;
}

/// Comma separated list of names, e.g. `GSSAPI,HMAC-SHA256`
///
/// Blank entries are dropped and surrounding whitespace is trimmed, so
/// `" a, ,b "` parses as `["a", "b"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn from_strs(items: &[&str]) -> Self {
        StringList(items.iter().map(|s| s.to_string()).collect())
    }

    pub fn contains(&self, item: &str) -> bool {
        self.0.iter().any(|s| s == item)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Join back into the on-disk form
    pub fn join(&self) -> String {
        self.0.join(",")
    }
}

impl ConfigValue for StringList {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(StringList(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    fn type_name() -> &'static str {
        "list"
    }
}

impl ConfigValue for bool {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(ConfigError::ParseError(format!("Invalid bool: {}", s))),
        }
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// A named configuration option with its default value
pub struct ConfigOption<T: ConfigValue> {
    name: &'static str,
    default: T,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self { name, default }
    }

    /// Get the value from config, falling back to default
    ///
    /// A value that fails to parse is logged and replaced by the default.
    pub fn get(&self, config: &DsnConfig, sections: &[&str]) -> T {
        match config.get_with_fallback(sections, self.name) {
            Some(raw) => match T::parse_config_value(raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        "ignoring {} option {}={:?}: {}",
                        T::type_name(),
                        self.name,
                        raw,
                        e
                    );
                    self.default.clone()
                }
            },
            None => self.default.clone(),
        }
    }
}

/// A parsed configuration file
#[derive(Debug, Clone, Default)]
pub struct DsnConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl DsnConfig {
    /// Parse a configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    ///
    /// Keys before the first section header land in `[global]`.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section = String::from("global");

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: malformed section header {:?}",
                        lineno + 1,
                        line
                    )));
                }
                current_section = line[1..line.len() - 1].trim().to_string();
                sections.entry(current_section.clone()).or_default();
                continue;
            }

            match line.find('=') {
                Some(eq_pos) => {
                    let key = line[..eq_pos].trim().to_string();
                    let value = line[eq_pos + 1..].trim().to_string();
                    if key.is_empty() {
                        return Err(ConfigError::ParseError(format!(
                            "line {}: empty key",
                            lineno + 1
                        )));
                    }
                    sections
                        .entry(current_section.clone())
                        .or_default()
                        .insert(key, value);
                }
                None => {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: expected key = value, got {:?}",
                        lineno + 1,
                        line
                    )));
                }
            }
        }

        Ok(Self { sections })
    }

    /// Get a configuration value from a specific section
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|v| v.as_str())
    }

    /// Get a configuration value, checking multiple sections in order
    pub fn get_with_fallback(&self, sections: &[&str], key: &str) -> Option<&str> {
        sections
            .iter()
            .find_map(|section| self.get(section, key))
    }
}

/// Define a configuration struct with typed options
///
/// # Example
///
/// ```
/// use dsnconfig::{define_options, DsnConfig, StringList};
///
/// define_options! {
///     /// Replica server options
///     pub struct ReplicaOptions {
///         /// Data directory
///         data_dir: String = String::from("/data"),
///
///         /// Accepted mechanisms
///         mechanisms: StringList = StringList::from_strs(&["GSSAPI"]),
///
///         /// Whether the server accepts writes
///         writable: bool = true,
///     }
/// }
///
/// let config = DsnConfig::parse("[replica]\ndata_dir = /ssd\nmechanisms = A, B\n").unwrap();
/// let opts = ReplicaOptions::from_dsn_config(&config, &["replica", "global"]);
///
/// assert_eq!(opts.data_dir, "/ssd");
/// assert_eq!(opts.mechanisms.0, vec!["A".to_string(), "B".to_string()]);
/// assert!(opts.writable);
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Create with default values
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Load from a parsed config with section fallback
            pub fn from_dsn_config(
                config: &$crate::DsnConfig,
                sections: &[&str],
            ) -> Self {
                Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.get(config, sections)
                        },
                    )*
                }
            }

            /// Get option names (for introspection)
            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
