//! Tunnel entry lifecycle

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use tollway_core::{Amount, Configuration};

use crate::udp::UdpForwarder;
use crate::{
    tcp, ByteCounters, EntryError, PaymentMeter, PaymentWallet, Result, SessionManager,
    PAYMENT_INTERVAL,
};

/// Delay between failed connection attempts
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// One forwarded service: a session manager plus the forwarders and the
/// payment meter running on top of it
pub struct TunnelEntry {
    manager: Arc<SessionManager>,
    wallet: Arc<dyn PaymentWallet>,
    counters: Arc<ByteCounters>,
    nano_pay_fee: Amount,
    udp_timeout: Option<Duration>,
    listen_ip: IpAddr,
    payment_interval: Duration,
}

impl TunnelEntry {
    pub fn new(
        manager: Arc<SessionManager>,
        config: &Configuration,
        wallet: Arc<dyn PaymentWallet>,
    ) -> Result<Self> {
        Ok(Self {
            manager,
            wallet,
            counters: Arc::new(ByteCounters::new()),
            nano_pay_fee: config.nano_pay_fee()?,
            udp_timeout: config.udp_timeout(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            payment_interval: PAYMENT_INTERVAL,
        })
    }

    /// Bind forwarded ports on `ip` instead of all interfaces
    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    pub fn with_payment_interval(mut self, interval: Duration) -> Self {
        self.payment_interval = interval;
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        self.counters.clone()
    }

    /// Connect (retrying forever), start forwarding and block until the
    /// entry is closed.
    ///
    /// Fails if a forwarded port cannot be bound or the entry cannot
    /// connect at all (closed, or a dead reverse link).
    pub async fn start(&self) -> Result<()> {
        let service = self.manager.service_name().to_string();
        loop {
            match self.manager.connect(false).await {
                Ok(_) => break,
                Err(e @ (EntryError::Closed | EntryError::ReverseSessionDead)) => return Err(e),
                Err(e) => {
                    warn!("Couldn't connect to node for {}: {}", service, e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
        let metadata = self.manager.metadata().ok_or(EntryError::NotConnected)?;

        self.manager
            .register_task(tokio::spawn(self.manager.clone().run_liveness()));

        let meter = PaymentMeter::new(
            self.manager.clone(),
            self.wallet.clone(),
            self.counters.clone(),
            self.nano_pay_fee,
        );
        self.manager
            .register_task(tokio::spawn(meter.run(self.payment_interval)));

        if let Err(e) = self.start_forwarders(&metadata.service_tcp, &metadata.service_udp).await {
            error!("Couldn't start forwarding for {}: {}", service, e);
            self.close();
            return Err(e);
        }
        info!(
            "Entry for {} ready: tcp {:?}, udp {:?}",
            service, metadata.service_tcp, metadata.service_udp
        );

        self.manager.wait_closed().await;
        Ok(())
    }

    async fn start_forwarders(&self, tcp_ports: &[u16], udp_ports: &[u16]) -> Result<()> {
        for (port, listener) in tcp::bind_listeners(self.listen_ip, tcp_ports).await? {
            self.manager.register_task(tokio::spawn(tcp::serve(
                self.manager.clone(),
                self.counters.clone(),
                port,
                listener,
            )));
        }

        if !udp_ports.is_empty() {
            UdpForwarder::bind(
                self.manager.clone(),
                self.counters.clone(),
                self.listen_ip,
                udp_ports,
                self.udp_timeout,
            )
            .await?
            .start();
        }
        Ok(())
    }

    /// Tear the entry down; [`start`](Self::start) then returns
    pub fn close(&self) {
        self.manager.close();
    }
}
