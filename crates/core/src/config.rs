//! Configuration types
//!
//! The JSON document keeps the historical PascalCase field names so existing
//! `config.json` files load unchanged.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Amount, Result, TollwayError};

/// Subscription topic prefix used when none is configured
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "tollway_v1.";

/// Per-service settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Highest price per MiB this entry accepts for the service
    #[serde(rename = "maxPrice", default)]
    pub max_price: String,
}

/// Entry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Dial timeout in seconds (0 = no timeout)
    #[serde(rename = "DialTimeout")]
    pub dial_timeout: u16,

    /// Idle expiry of UDP client addresses in seconds (0 = never expire)
    #[serde(rename = "UDPTimeout")]
    pub udp_timeout: u16,

    /// Account seed, hex encoded
    #[serde(rename = "Seed")]
    pub seed: String,

    /// Services to expose, keyed by service name
    #[serde(rename = "Services")]
    pub services: BTreeMap<String, ServiceInfo>,

    /// Fee attached to payment channel transactions
    #[serde(rename = "NanoPayFee")]
    pub nano_pay_fee: String,

    /// Accept inbound connections from exits instead of dialing them
    #[serde(rename = "Reverse")]
    pub reverse: bool,

    #[serde(rename = "ReverseTCP")]
    pub reverse_tcp: u16,

    #[serde(rename = "ReverseUDP")]
    pub reverse_udp: u16,

    #[serde(rename = "ReversePrice")]
    pub reverse_price: String,

    #[serde(rename = "ReverseClaimInterval")]
    pub reverse_claim_interval: u32,

    #[serde(rename = "SubscriptionPrefix")]
    pub subscription_prefix: String,

    #[serde(rename = "SubscriptionDuration")]
    pub subscription_duration: u32,

    #[serde(rename = "SubscriptionFee")]
    pub subscription_fee: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            dial_timeout: 0,
            udp_timeout: 0,
            seed: String::new(),
            services: BTreeMap::new(),
            nano_pay_fee: String::new(),
            reverse: false,
            reverse_tcp: 0,
            reverse_udp: 0,
            reverse_price: String::new(),
            reverse_claim_interval: 0,
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
            subscription_duration: 0,
            subscription_fee: String::new(),
        }
    }
}

fn parse_optional_amount(value: &str) -> Result<Amount> {
    if value.trim().is_empty() {
        Ok(Amount::ZERO)
    } else {
        value.parse()
    }
}

impl Configuration {
    /// Load configuration from a JSON file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(TollwayError::ReadError)?;
        let config: Configuration =
            serde_json::from_str(&content).map_err(TollwayError::ParseError)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a JSON file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(TollwayError::WriteError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(TollwayError::ParseError)?;
        std::fs::write(path, content).map_err(TollwayError::WriteError)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Check that amounts parse and the selected mode is complete
    pub fn validate(&self) -> Result<()> {
        self.nano_pay_fee()?;
        for (name, service) in &self.services {
            parse_optional_amount(&service.max_price).map_err(|_| {
                TollwayError::InvalidConfig(format!(
                    "service {} has invalid maxPrice {:?}",
                    name, service.max_price
                ))
            })?;
        }

        if self.reverse {
            if self.reverse_tcp == 0 {
                return Err(TollwayError::InvalidConfig(
                    "ReverseTCP is required in reverse mode".to_string(),
                ));
            }
            parse_optional_amount(&self.reverse_price)?;
        } else if self.services.is_empty() {
            return Err(TollwayError::InvalidConfig(
                "no services configured".to_string(),
            ));
        }

        Ok(())
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.dial_timeout > 0).then(|| Duration::from_secs(u64::from(self.dial_timeout)))
    }

    /// Default lifetime of a cached UDP client address
    pub fn udp_timeout(&self) -> Option<Duration> {
        (self.udp_timeout > 0).then(|| Duration::from_secs(u64::from(self.udp_timeout)))
    }

    pub fn nano_pay_fee(&self) -> Result<Amount> {
        parse_optional_amount(&self.nano_pay_fee)
    }

    /// Max price for a configured service; an empty value means free only
    pub fn max_price(&self, service: &str) -> Result<Option<Amount>> {
        self.services
            .get(service)
            .map(|s| parse_optional_amount(&s.max_price))
            .transpose()
    }
}
