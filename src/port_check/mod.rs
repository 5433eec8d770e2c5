//! TCP port reachability check.
//!
//! To find out whether a port of this machine is reachable from the Internet,
//! a temporary listener is opened on the port and an external [`PortProbe`]
//! is asked to connect to the machine's public address. The probe alone
//! decides the verdict. The listener answers the first connection with an
//! echo of whatever it receives, which the verdict does not depend on.

mod session;

pub use session::{PortProbeSession, ProbeSessionState};

use std::net::IpAddr;
use std::time::Duration;

use log::{debug, error, trace};

use crate::task::AsyncTask;

/// Default bound for the listener to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for joining the listener after shutdown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Ports above this value pass the check in test mode.
pub const DEFAULT_TEST_MODE_PORT_THRESHOLD: u16 = 50000;

/// Something outside this machine that can try to connect to `(ip, port)`.
pub trait PortProbe: Send + Sync {
    /// `true` if the connection from outside succeeded.
    fn check_port(&self, ip: IpAddr, port: u16) -> AsyncTask<bool>;
}

impl<F> PortProbe for F
where
    F: Fn(IpAddr, u16) -> AsyncTask<bool> + Send + Sync,
{
    fn check_port(&self, ip: IpAddr, port: u16) -> AsyncTask<bool> {
        self(ip, port)
    }
}

#[derive(Debug, Clone)]
pub struct CheckerOptions {
    pub ready_timeout: Duration,
    pub join_timeout: Duration,
    /// Skip the whole check for ports above `test_mode_port_threshold`.
    /// Meant for automated testing only.
    pub test_mode: bool,
    pub test_mode_port_threshold: u16,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            test_mode: false,
            test_mode_port_threshold: DEFAULT_TEST_MODE_PORT_THRESHOLD,
        }
    }
}

/// Verifies that local TCP ports can be reached on the public address.
pub struct PortReachabilityChecker<P> {
    probe: P,
    public_ip: IpAddr,
    options: CheckerOptions,
}

impl<P: PortProbe> PortReachabilityChecker<P> {
    pub fn new(probe: P, public_ip: IpAddr) -> Self {
        Self {
            probe,
            public_ip,
            options: CheckerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CheckerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CheckerOptions {
        &self.options
    }

    pub fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    pub fn set_public_ip(&mut self, ip: IpAddr) {
        self.public_ip = ip;
    }

    /// Check whether `port` is reachable from outside.
    ///
    /// Every call runs its own listener session which is closed before the
    /// call returns. Bind failures and a listener that does not get ready in
    /// time yield `false` without consulting the probe.
    pub async fn check_port_open(&self, port: u16) -> bool {
        trace!("(port:{})", port);

        if port == 0 {
            error!("Port 0 can not be checked.");
            trace!("(-)[INVALID_PORT]:false");
            return false;
        }

        if self.options.test_mode && port > self.options.test_mode_port_threshold {
            debug!(
                "Test mode: port {} is above {}, skipping the check.",
                port, self.options.test_mode_port_threshold
            );
            trace!("(-)[TEST_MODE_ENABLED]:true");
            return true;
        }

        let mut session = PortProbeSession::new(port);
        session.start();

        let res = if session.wait_ready(self.options.ready_timeout).await {
            debug!(
                "Asking the probe to connect to {}:{}.",
                self.public_ip, port
            );
            let verdict = self.probe.check_port(self.public_ip, port).await;
            debug!(
                "Probe reports port {} as {}.",
                port,
                if verdict { "open" } else { "closed" }
            );
            verdict
        } else {
            error!(
                "Port listener for port {} is not ready, the port can not be checked.",
                port
            );
            false
        };

        session.shutdown(self.options.join_timeout).await;

        trace!("(-):{}", res);
        res
    }
}
