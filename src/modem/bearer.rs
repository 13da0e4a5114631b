//! Network registration and data bearer control.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::command::CommandEngine;
use super::response::{SignalLevel, SignalQuality, find_bearer, find_registration, find_signal};
use crate::error::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(2);
/// Opening a cellular context is slow.
const BEARER_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub const REGISTRATION_ATTEMPTS: u32 = 10;
pub const REGISTRATION_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BearerState {
    pub registered: bool,
    pub ip_acquired: bool,
}

/// Brings the modem onto the network and owns the bearer state.
pub struct BearerController {
    state: BearerState,
    registration_attempts: u32,
    registration_interval: Duration,
}

impl Default for BearerController {
    fn default() -> Self {
        Self::new()
    }
}

impl BearerController {
    pub fn new() -> Self {
        Self {
            state: BearerState::default(),
            registration_attempts: REGISTRATION_ATTEMPTS,
            registration_interval: REGISTRATION_INTERVAL,
        }
    }

    pub fn state(&self) -> BearerState {
        self.state
    }

    /// Probe the modem, wait for registration and open the bearer on `apn`.
    pub async fn setup_network(&mut self, modem: &mut CommandEngine, apn: &str) -> Result<()> {
        self.state = BearerState::default();
        info!(apn, port = modem.transport_name(), "Setting up cellular network");

        let probe = modem.send("AT", "OK", PROBE_TIMEOUT).await?;
        if !probe.matched {
            return Err(Error::ModemUnresponsive);
        }

        if let Some(signal) = check_signal(modem).await? {
            log_signal(signal);
        }

        modem.fire("AT+CFUN=1", COMMAND_TIMEOUT).await?;

        if self.wait_for_registration(modem).await? {
            self.state.registered = true;
        } else {
            // Regional registration reporting is unreliable; carry on and
            // let the bearer query decide.
            let e = Error::RegistrationTimeout {
                attempts: self.registration_attempts,
            };
            warn!(error = %e, "Proceeding without confirmed registration");
        }

        modem
            .fire("AT+SAPBR=3,1,\"Contype\",\"GPRS\"", COMMAND_TIMEOUT)
            .await?;
        modem
            .fire(&format!("AT+SAPBR=3,1,\"APN\",\"{apn}\""), COMMAND_TIMEOUT)
            .await?;
        modem.fire("AT+SAPBR=1,1", BEARER_OPEN_TIMEOUT).await?;

        let query = modem.send("AT+SAPBR=2,1", "OK", COMMAND_TIMEOUT).await?;
        match find_bearer(&query.raw_text) {
            Some(bearer) if bearer.has_ip() => {
                self.state.ip_acquired = true;
                info!(ip = %bearer.ip, registered = self.state.registered, "Network ready");
                Ok(())
            }
            other => {
                debug!(bearer = ?other, response = %query.raw_text.trim(), "Bearer has no address");
                Err(Error::NoIpAssigned)
            }
        }
    }

    async fn wait_for_registration(&self, modem: &mut CommandEngine) -> Result<bool> {
        for attempt in 1..=self.registration_attempts {
            let resp = modem.send("AT+CREG?", "OK", REGISTRATION_TIMEOUT).await?;
            if find_registration(&resp.raw_text).is_some_and(|r| r.is_registered()) {
                info!(attempt, "Registered on network");
                return Ok(true);
            }

            debug!(
                attempt,
                max = self.registration_attempts,
                "Waiting for network registration"
            );
            sleep(self.registration_interval).await;
        }

        Ok(false)
    }

    /// Close the bearer. Best-effort and safe to repeat.
    pub async fn close_bearer(&mut self, modem: &mut CommandEngine) {
        self.state = BearerState::default();
        match modem.send("AT+SAPBR=0,1", "OK", COMMAND_TIMEOUT).await {
            Ok(result) if result.matched => info!("Bearer closed"),
            Ok(result) => debug!(response = %result.raw_text.trim(), "Bearer close not confirmed"),
            Err(e) => warn!(error = %e, "Failed to close bearer"),
        }
    }
}

/// Query `AT+CSQ`. `None` when the modem gives no parsable reading.
pub async fn check_signal(modem: &mut CommandEngine) -> Result<Option<SignalQuality>> {
    let resp = modem.send("AT+CSQ", "OK", PROBE_TIMEOUT).await?;
    if !resp.matched {
        return Ok(None);
    }
    Ok(find_signal(&resp.raw_text))
}

pub fn log_signal(signal: SignalQuality) {
    match signal.level() {
        SignalLevel::Unknown => warn!("Signal strength unknown"),
        SignalLevel::VeryWeak => warn!(rssi = signal.rssi, "Very weak signal"),
        SignalLevel::Weak => warn!(rssi = signal.rssi, "Weak signal"),
        SignalLevel::Good => info!(rssi = signal.rssi, "Good signal strength"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::simulated::{ModemHandle, SimulatedModem};

    fn setup() -> (CommandEngine, ModemHandle) {
        let (modem, handle) = SimulatedModem::new();
        (CommandEngine::new(Box::new(modem)), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_network_happy_path() {
        let (mut modem, handle) = setup();
        let mut bearer = BearerController::new();

        bearer.setup_network(&mut modem, "hologram").await.unwrap();

        assert_eq!(
            bearer.state(),
            BearerState {
                registered: true,
                ip_acquired: true
            }
        );
        assert!(handle.bearer_open());
        let commands = handle.commands();
        assert_eq!(commands[0], "AT");
        assert!(commands.contains(&"AT+SAPBR=3,1,\"APN\",\"hologram\"".to_string()));
        assert_eq!(commands.last().unwrap(), "AT+SAPBR=2,1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_modem_fails_fast() {
        let (mut modem, handle) = setup();
        handle.configure(|s| s.unresponsive = true);
        let mut bearer = BearerController::new();

        let err = bearer.setup_network(&mut modem, "apn").await.unwrap_err();
        assert!(matches!(err, Error::ModemUnresponsive));
        assert_eq!(handle.commands(), vec!["AT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout_is_not_fatal() {
        let (mut modem, handle) = setup();
        handle.configure(|s| s.registered_after = None);
        let mut bearer = BearerController::new();

        bearer.setup_network(&mut modem, "apn").await.unwrap();

        let polls = handle
            .commands()
            .iter()
            .filter(|c| c.as_str() == "AT+CREG?")
            .count();
        assert_eq!(polls, REGISTRATION_ATTEMPTS as usize);
        assert!(!bearer.state().registered);
        assert!(bearer.state().ip_acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_ip_is_no_ip_assigned() {
        let (mut modem, handle) = setup();
        handle.configure(|s| s.assigned_ip = "0.0.0.0".to_string());
        let mut bearer = BearerController::new();

        let err = bearer.setup_network(&mut modem, "apn").await.unwrap_err();
        assert!(matches!(err, Error::NoIpAssigned));
        assert!(!bearer.state().ip_acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_bearer_is_idempotent() {
        let (mut modem, handle) = setup();
        let mut bearer = BearerController::new();
        bearer.setup_network(&mut modem, "apn").await.unwrap();

        bearer.close_bearer(&mut modem).await;
        bearer.close_bearer(&mut modem).await;

        assert!(!handle.bearer_open());
        assert_eq!(bearer.state(), BearerState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_signal_reads_rssi() {
        let (mut modem, handle) = setup();
        handle.configure(|s| s.rssi = 4);
        let signal = check_signal(&mut modem).await.unwrap().unwrap();
        assert_eq!(signal.rssi, 4);
        assert_eq!(signal.level(), SignalLevel::VeryWeak);
    }
}
