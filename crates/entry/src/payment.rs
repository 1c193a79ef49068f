//! Usage metering and payment
//!
//! Forwarders add every byte delivered from the exit to
//! [`ByteCounters::bytes_in`]. The [`PaymentMeter`] periodically prices the
//! bytes not yet paid for, increments a payment channel to the exit's
//! beneficiary by that amount and ships the resulting transaction over an
//! untagged stream. `bytes_paid` only advances after the transaction has
//! been written in full, so a failed settlement is retried in full on the
//! next tick: payment is at-least-once, never partial.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use tollway_core::Amount;

use crate::{EntryError, Result, SessionManager};

/// How often the meter settles in production
pub const PAYMENT_INTERVAL: Duration = Duration::from_secs(60);

/// Source of payment channels
#[async_trait]
pub trait PaymentWallet: Send + Sync {
    async fn new_payment_channel(
        &self,
        receiver: &str,
        fee: Amount,
    ) -> Result<Box<dyn PaymentChannel>>;
}

/// A running payment to one receiver
#[async_trait]
pub trait PaymentChannel: Send + Sync {
    fn receiver(&self) -> &str;

    /// Add `amount` (decimal string) to the channel total
    async fn increment_amount(&mut self, amount: &str) -> Result<Box<dyn PaymentTransaction>>;
}

pub trait PaymentTransaction: Send {
    fn serialize(&self) -> Result<Vec<u8>>;
}

/// Downstream traffic counters shared by forwarders and the meter
#[derive(Debug, Default)]
pub struct ByteCounters {
    bytes_in: AtomicU64,
    bytes_paid: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Acquire)
    }

    pub fn bytes_paid(&self) -> u64 {
        self.bytes_paid.load(Ordering::Acquire)
    }

    /// Bytes received but not yet paid for
    pub fn unpaid(&self) -> u64 {
        self.bytes_in().saturating_sub(self.bytes_paid())
    }

    fn mark_paid(&self, bytes_in: u64) {
        self.bytes_paid.store(bytes_in, Ordering::Release);
    }
}

/// Outcome of one meter tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Nothing new to pay for
    Idle,
    Settled { bytes: u64, amount: Amount },
}

pub struct PaymentMeter {
    manager: Arc<SessionManager>,
    wallet: Arc<dyn PaymentWallet>,
    counters: Arc<ByteCounters>,
    fee: Amount,
    channel: Option<Box<dyn PaymentChannel>>,
}

impl PaymentMeter {
    pub fn new(
        manager: Arc<SessionManager>,
        wallet: Arc<dyn PaymentWallet>,
        counters: Arc<ByteCounters>,
        fee: Amount,
    ) -> Self {
        Self {
            manager,
            wallet,
            counters,
            fee,
            channel: None,
        }
    }

    /// Settle everything received since the last successful settlement
    pub async fn tick(&mut self) -> Result<Settlement> {
        let bytes_in = self.counters.bytes_in();
        let bytes_paid = self.counters.bytes_paid();
        if bytes_in == bytes_paid {
            return Ok(Settlement::Idle);
        }

        let terms = self
            .manager
            .payment_terms()
            .ok_or(EntryError::NotConnected)?;
        if terms.receiver.is_empty() {
            return Err(EntryError::Payment(
                "exit advertised no payment receiver".to_string(),
            ));
        }

        let channel = match self.channel.take() {
            Some(channel) if channel.receiver() == terms.receiver => channel,
            _ => {
                debug!("Opening payment channel to {}", terms.receiver);
                self.wallet
                    .new_payment_channel(&terms.receiver, self.fee)
                    .await?
            }
        };
        let channel = self.channel.insert(channel);

        let bytes = bytes_in - bytes_paid;
        let amount = Amount::per_mebibyte(terms.price, bytes);
        let tx = channel.increment_amount(&amount.to_string()).await?;
        let data = tx.serialize()?;

        let mut stream = self.manager.open_stream(None, false).await?;
        stream.write_all(&data).await?;
        stream.close().await?;

        self.counters.mark_paid(bytes_in);
        Ok(Settlement::Settled { bytes, amount })
    }

    /// Tick every `interval` until the task is aborted
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(Settlement::Settled { bytes, amount }) => {
                    debug!(
                        "Paid {} for {} bytes of {}",
                        amount,
                        bytes,
                        self.manager.service_name()
                    );
                }
                Ok(Settlement::Idle) => {}
                Err(e) => {
                    warn!(
                        "Payment for {} failed, {} bytes unpaid: {}",
                        self.manager.service_name(),
                        self.counters.unpaid(),
                        e
                    );
                }
            }
        }
    }
}

/// Cumulative payment claim carried over the control stream.
///
/// Claims are unsigned; a receiver only trusts the highest `amount` per
/// `(sender, channel_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentClaim {
    pub sender: String,
    pub receiver: String,
    pub channel_id: u64,
    pub fee: Amount,
    /// Running total paid on this channel
    pub amount: Amount,
    pub nonce: u64,
}

impl PaymentTransaction for PaymentClaim {
    fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EntryError::Payment(e.to_string()))
    }
}

/// In-process wallet that issues [`PaymentClaim`]s
#[derive(Debug, Clone)]
pub struct ClaimWallet {
    address: String,
}

impl ClaimWallet {
    /// Derive the account address from a hex-encoded 32-byte seed
    pub fn from_seed(seed_hex: &str) -> Result<Self> {
        let seed = hex::decode(seed_hex.trim()).map_err(|e| EntryError::InvalidSeed(e.to_string()))?;
        if seed.len() != 32 {
            return Err(EntryError::InvalidSeed(format!(
                "expected 32 bytes, got {}",
                seed.len()
            )));
        }

        let digest = Sha256::digest(&seed);
        let address = format!("tw{}", hex::encode(&digest[..20]));
        info!("Loaded account {}", address);
        Ok(Self { address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl PaymentWallet for ClaimWallet {
    async fn new_payment_channel(
        &self,
        receiver: &str,
        fee: Amount,
    ) -> Result<Box<dyn PaymentChannel>> {
        Ok(Box::new(ClaimChannel {
            sender: self.address.clone(),
            receiver: receiver.to_string(),
            channel_id: rand::random(),
            fee,
            total: Amount::ZERO,
            nonce: 0,
        }))
    }
}

struct ClaimChannel {
    sender: String,
    receiver: String,
    channel_id: u64,
    fee: Amount,
    total: Amount,
    nonce: u64,
}

#[async_trait]
impl PaymentChannel for ClaimChannel {
    fn receiver(&self) -> &str {
        &self.receiver
    }

    async fn increment_amount(&mut self, amount: &str) -> Result<Box<dyn PaymentTransaction>> {
        let delta: Amount = amount.parse()?;
        self.total = self
            .total
            .checked_add(delta)
            .ok_or_else(|| EntryError::Payment("channel total overflow".to_string()))?;
        self.nonce += 1;

        Ok(Box::new(PaymentClaim {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            channel_id: self.channel_id,
            fee: self.fee,
            amount: self.total,
            nonce: self.nonce,
        }))
    }
}
