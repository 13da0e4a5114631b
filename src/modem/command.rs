//! Command transaction engine.
//!
//! One command in flight at a time: clear stale input, write the command
//! line, then poll the transport until the expected token or `ERROR` shows up
//! anywhere in the accumulated text, or the timeout elapses.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use super::response::{ResponseLine, tokenize};
use super::transport::Transport;
use crate::error::{Error, Result};

pub const LINE_TERMINATOR: &str = "\r\n";
pub const ERROR_TOKEN: &str = "ERROR";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one command/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub matched: bool,
    pub raw_text: String,
}

impl TransactionResult {
    pub fn lines(&self) -> Vec<ResponseLine> {
        tokenize(&self.raw_text)
    }

    /// The modem answered with `ERROR` rather than staying silent.
    pub fn is_error(&self) -> bool {
        !self.matched && self.raw_text.contains(ERROR_TOKEN)
    }
}

pub struct CommandEngine {
    transport: Box<dyn Transport>,
    poll_interval: Duration,
}

impl CommandEngine {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Checked transaction: the caller inspects `matched`.
    pub async fn send(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<TransactionResult> {
        self.transport.clear_input().map_err(Error::Transport)?;
        self.write_line(command)?;
        self.wait_for(expected, timeout).await
    }

    /// Fire-and-forget transaction.
    ///
    /// The exchange still runs to completion so the next command starts on
    /// a quiet line, but its outcome is discarded. Only link failures are
    /// reported.
    pub async fn fire(&mut self, command: &str, timeout: Duration) -> Result<()> {
        let result = self.send(command, "OK", timeout).await?;
        if !result.matched {
            debug!(
                command = %redact(command),
                response = %result.raw_text.trim(),
                "Unconfirmed command (ignored)"
            );
        }
        Ok(())
    }

    /// Wait for `expected` without sending anything first.
    pub async fn wait_for(&mut self, expected: &str, timeout: Duration) -> Result<TransactionResult> {
        let deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let read = self
                .transport
                .read_available(&mut buf)
                .map_err(Error::Transport)?;

            if read > 0 {
                let text = String::from_utf8_lossy(&buf);
                if text.contains(expected) {
                    trace!(response = %text.trim(), "Matched {expected:?}");
                    return Ok(TransactionResult {
                        matched: true,
                        raw_text: text.into_owned(),
                    });
                }
                if text.contains(ERROR_TOKEN) {
                    debug!(response = %text.trim(), expected, "Modem returned ERROR");
                    return Ok(TransactionResult {
                        matched: false,
                        raw_text: text.into_owned(),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let text = String::from_utf8_lossy(&buf).into_owned();
                debug!(
                    expected,
                    timeout_ms = timeout.as_millis() as u64,
                    response = %text.trim(),
                    "Timed out waiting for modem"
                );
                return Ok(TransactionResult {
                    matched: false,
                    raw_text: text,
                });
            }

            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Write raw payload bytes (FTP chunk data) straight to the link.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        trace!(len = data.len(), "Writing raw data");
        self.transport.write_all(data).map_err(Error::Transport)
    }

    fn write_line(&mut self, command: &str) -> Result<()> {
        debug!("> {}", redact(command));
        let mut line = String::with_capacity(command.len() + LINE_TERMINATOR.len());
        line.push_str(command);
        line.push_str(LINE_TERMINATOR);
        self.transport
            .write_all(line.as_bytes())
            .map_err(Error::Transport)
    }
}

/// Mask credentials in logged commands.
fn redact(command: &str) -> &str {
    if command.starts_with("AT+FTPPW=") {
        "AT+FTPPW=\"********\""
    } else {
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::simulated::SimulatedModem;

    fn engine() -> (CommandEngine, crate::modem::simulated::ModemHandle) {
        let (modem, handle) = SimulatedModem::new();
        (CommandEngine::new(Box::new(modem)), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_matches_expected_token() {
        let (mut engine, handle) = engine();
        let result = engine
            .send("AT", "OK", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.matched);
        assert!(result.raw_text.contains("OK"));
        assert_eq!(handle.commands(), vec!["AT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_when_silent() {
        let (mut engine, handle) = engine();
        handle.configure(|s| s.unresponsive = true);

        let start = Instant::now();
        let result = engine
            .send("AT", "OK", Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!result.matched);
        assert!(!result.is_error());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_token_fails_fast() {
        let (mut engine, _handle) = engine();
        let start = Instant::now();
        let result = engine
            .send("AT+BOGUS", "OK", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!result.matched);
        assert!(result.is_error());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_utf8_is_replaced() {
        let (mut engine, handle) = engine();
        handle.inject(b"\xff\xfe garbage \r\nOK\r\n");
        let result = engine.wait_for("OK", Duration::from_secs(1)).await.unwrap();
        assert!(result.matched);
        assert!(result.raw_text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_password_is_redacted() {
        assert_eq!(redact("AT+FTPPW=\"secret\""), "AT+FTPPW=\"********\"");
        assert_eq!(redact("AT+FTPUN=\"user\""), "AT+FTPUN=\"user\"");
    }
}
