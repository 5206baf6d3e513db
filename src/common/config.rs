use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub compression_strategy: CompressionStrategy,
}

impl ClusterConfig {
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), ConfigError> {
        let field = field.to_lowercase();
        match field.as_str() {
            "compression_strategy" => {
                let strategy =
                    CompressionStrategy::from_str(value).ok_or(ConfigError::InvalidValue)?;
                self.compression_strategy = strategy;
            }
            _ => return Err(ConfigError::FieldNotFound),
        }
        Ok(())
    }

    pub fn to_str_map(&self) -> HashMap<String, String> {
        vec![(
            "compression_strategy",
            self.compression_strategy.to_str().to_string(),
        )]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CompressionStrategy {
    Disabled = 0,
    // Only SET, SETEX, PSETEX, SETNX, GET, GETSET are allowed
    // for the String data type once compression is enabled.
    SetGetOnly = 1,
    // All the String commands are allowed.
    // Users need lua scripts to bypass the compression.
    AllowAll = 2,
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        CompressionStrategy::Disabled
    }
}

impl CompressionStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        let lowercase = s.to_lowercase();
        match lowercase.as_str() {
            "disabled" => Some(Self::Disabled),
            "set_get_only" => Some(Self::SetGetOnly),
            "allow_all" => Some(Self::AllowAll),
            _ => None,
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SetGetOnly => "set_get_only",
            Self::AllowAll => "allow_all",
        }
    }
}

impl Serialize for CompressionStrategy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_str())
    }
}

impl<'de> Deserialize<'de> for CompressionStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s)
            .ok_or_else(|| D::Error::custom(format!("invalid compression strategy {}", s)))
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    FieldNotFound,
    InvalidValue,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FieldNotFound => write!(f, "unknown config field"),
            Self::InvalidValue => write!(
                f,
                "invalid value, expected one of disabled, set_get_only or allow_all"
            ),
        }
    }
}
