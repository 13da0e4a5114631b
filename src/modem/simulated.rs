//! In-process stand-in for a SIM7000-class modem.
//!
//! Speaks the subset of the AT dialect the daemon uses, keeps an in-memory
//! "remote" FTP store, and can be told to misbehave. The daemon's simulation
//! mode and the test suite both drive it through [`ModemHandle`].

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::transport::Transport;

/// Test hook run inside the modem as it acknowledges a chunk.
pub struct AckObserver(pub Box<dyn FnMut(usize) + Send>);

impl std::fmt::Debug for AckObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AckObserver")
    }
}

/// Modem behaviour plus everything the modem has observed.
#[derive(Debug)]
pub struct ModemState {
    /// Ignore every command (no response at all).
    pub unresponsive: bool,
    /// Unregistered `AT+CREG?` polls before reporting registration;
    /// `None` never registers.
    pub registered_after: Option<u32>,
    pub rssi: u8,
    /// Address reported by `AT+SAPBR=2,1` once the bearer is open.
    pub assigned_ip: String,
    /// Answer `AT+FTPPUT=1` with `ERROR`.
    pub reject_session: bool,
    /// Maximum chunk length reported in the session-ready indication.
    pub max_chunk_len: usize,
    /// Upcoming chunk announcements to ignore.
    pub drop_chunk_prompts: u32,
    /// Upcoming chunk payloads to swallow without an `OK`.
    pub drop_data_acks: u32,
    /// Answer the end-of-data announcement without `+FTPPUT: 1,0`.
    pub withhold_close: bool,
    /// Acknowledged chunks before `drop_chunk_prompts` starts counting.
    pub drop_prompts_after: usize,
    /// Called with the chunk number just before each data `OK`.
    pub on_chunk_ack: Option<AckObserver>,

    commands: Vec<String>,
    rx: VecDeque<u8>,
    line: Vec<u8>,
    pending_data: Option<(usize, Vec<u8>)>,
    creg_polls: u32,
    bearer_open: bool,
    ftp_params: HashMap<String, String>,
    session_open: bool,
    sessions_closed: u32,
    chunk_sizes: Vec<usize>,
    remote_files: HashMap<String, Vec<u8>>,
}

impl Default for ModemState {
    fn default() -> Self {
        Self {
            unresponsive: false,
            registered_after: Some(0),
            rssi: 18,
            assigned_ip: "10.64.12.7".to_string(),
            reject_session: false,
            max_chunk_len: 1360,
            drop_chunk_prompts: 0,
            drop_data_acks: 0,
            withhold_close: false,
            drop_prompts_after: 0,
            on_chunk_ack: None,
            commands: Vec::new(),
            rx: VecDeque::new(),
            line: Vec::new(),
            pending_data: None,
            creg_polls: 0,
            bearer_open: false,
            ftp_params: HashMap::new(),
            session_open: false,
            sessions_closed: 0,
            chunk_sizes: Vec::new(),
            remote_files: HashMap::new(),
        }
    }
}

impl ModemState {
    fn respond(&mut self, text: &str) {
        self.rx.extend(b"\r\n");
        self.rx.extend(text.as_bytes());
        self.rx.extend(b"\r\n");
    }

    fn ok(&mut self) {
        self.respond("OK");
    }

    fn error(&mut self) {
        self.respond("ERROR");
    }

    /// Target of the current session, relative to the server root.
    fn put_key(&self) -> String {
        let dir = self
            .ftp_params
            .get("FTPPUTPATH")
            .map(|d| d.trim_matches('/'))
            .unwrap_or_default();
        let name = self
            .ftp_params
            .get("FTPPUTNAME")
            .map(String::as_str)
            .unwrap_or_default();
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }

    fn receive(&mut self, data: &[u8]) {
        for &byte in data {
            if let Some((expected, mut collected)) = self.pending_data.take() {
                collected.push(byte);
                if collected.len() == expected {
                    self.complete_chunk(collected);
                } else {
                    self.pending_data = Some((expected, collected));
                }
                continue;
            }

            if byte == b'\n' {
                let raw = std::mem::take(&mut self.line);
                let command = String::from_utf8_lossy(&raw).trim().to_string();
                if !command.is_empty() {
                    self.handle_command(command);
                }
            } else {
                self.line.push(byte);
            }
        }
    }

    fn complete_chunk(&mut self, data: Vec<u8>) {
        if self.drop_data_acks > 0 {
            self.drop_data_acks -= 1;
            return;
        }
        let name = self.put_key();
        self.chunk_sizes.push(data.len());
        self.remote_files.entry(name).or_default().extend(data);
        let acked = self.chunk_sizes.len();
        if let Some(observer) = self.on_chunk_ack.as_mut() {
            (observer.0)(acked);
        }
        self.ok();
    }

    fn handle_command(&mut self, command: String) {
        self.commands.push(command.clone());
        if self.unresponsive {
            return;
        }

        match command.as_str() {
            "AT" | "AT+CFUN=1" | "AT+FTPCID=1" | "AT+FTPMODE=1" | "AT+FTPTYPE=\"I\"" => self.ok(),
            "AT+CSQ" => {
                let reply = format!("+CSQ: {},0\r\n\r\nOK", self.rssi);
                self.respond(&reply);
            }
            "AT+CREG?" => {
                let polls = self.creg_polls;
                self.creg_polls += 1;
                let stat = match self.registered_after {
                    Some(n) if polls >= n => 1,
                    _ => 2,
                };
                self.respond(&format!("+CREG: 0,{stat}\r\n\r\nOK"));
            }
            "AT+SAPBR=1,1" => {
                self.bearer_open = true;
                self.ok();
            }
            "AT+SAPBR=2,1" => {
                let reply = if self.bearer_open {
                    format!("+SAPBR: 1,1,\"{}\"\r\n\r\nOK", self.assigned_ip)
                } else {
                    "+SAPBR: 1,3,\"0.0.0.0\"\r\n\r\nOK".to_string()
                };
                self.respond(&reply);
            }
            "AT+SAPBR=0,1" => {
                if self.bearer_open {
                    self.bearer_open = false;
                    self.ok();
                } else {
                    self.error();
                }
            }
            "AT+FTPPUT=1" => self.open_session(),
            "AT+FTPPUT=2,0" => self.close_session(),
            cmd if cmd.starts_with("AT+SAPBR=3,1,") => self.ok(),
            cmd if cmd.starts_with("AT+FTPPUT=2,") => self.announce_chunk(cmd),
            cmd if cmd.starts_with("AT+FTP") && cmd.contains('=') => {
                if let Some((key, value)) = cmd[3..].split_once('=') {
                    let value = value.trim_matches('"').to_string();
                    self.ftp_params.insert(key.to_string(), value);
                }
                self.ok();
            }
            _ => self.error(),
        }
    }

    fn open_session(&mut self) {
        if self.reject_session {
            self.error();
            return;
        }
        self.session_open = true;
        let name = self.put_key();
        let append = self.ftp_params.get("FTPPUTOPT").map(String::as_str) == Some("APPE");
        if !append {
            self.remote_files.insert(name, Vec::new());
        }
        let reply = format!("OK\r\n\r\n+FTPPUT: 1,1,{}", self.max_chunk_len);
        self.respond(&reply);
    }

    fn announce_chunk(&mut self, command: &str) {
        let len = command["AT+FTPPUT=2,".len()..].parse::<usize>();
        match len {
            Ok(len) if self.session_open && len > 0 => {
                if self.chunk_sizes.len() >= self.drop_prompts_after && self.drop_chunk_prompts > 0 {
                    self.drop_chunk_prompts -= 1;
                    return;
                }
                self.pending_data = Some((len, Vec::with_capacity(len)));
                self.respond(&format!("+FTPPUT: 2,{len}"));
            }
            _ => self.error(),
        }
    }

    fn close_session(&mut self) {
        if !self.session_open {
            self.error();
            return;
        }
        self.session_open = false;
        self.sessions_closed += 1;
        if self.withhold_close {
            self.ok();
        } else {
            self.respond("OK\r\n\r\n+FTPPUT: 1,0");
        }
    }
}

/// Transport side of the simulated modem.
pub struct SimulatedModem {
    state: Arc<Mutex<ModemState>>,
}

/// Test/simulation side: configure behaviour and inspect what happened.
#[derive(Clone)]
pub struct ModemHandle {
    state: Arc<Mutex<ModemState>>,
}

fn lock(state: &Mutex<ModemState>) -> MutexGuard<'_, ModemState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedModem {
    pub fn new() -> (Self, ModemHandle) {
        let state = Arc::new(Mutex::new(ModemState::default()));
        (
            Self {
                state: state.clone(),
            },
            ModemHandle { state },
        )
    }
}

impl Transport for SimulatedModem {
    fn name(&self) -> &str {
        "simulated"
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(lock(&self.state).rx.len())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut state = lock(&self.state);
        let n = state.rx.len();
        buf.extend(state.rx.drain(..));
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        lock(&self.state).receive(data);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.state).rx.clear();
        Ok(())
    }
}

impl ModemHandle {
    pub fn configure(&self, f: impl FnOnce(&mut ModemState)) {
        f(&mut lock(&self.state));
    }

    /// Queue unsolicited bytes for the host to read.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes);
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn ftp_param(&self, key: &str) -> Option<String> {
        lock(&self.state).ftp_params.get(key).cloned()
    }

    /// Stored upload by its path under the server root, e.g. `incoming/a.bin`.
    pub fn remote_file(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.state).remote_files.get(name).cloned()
    }

    pub fn set_remote_file(&self, name: &str, contents: &[u8]) {
        lock(&self.state)
            .remote_files
            .insert(name.to_string(), contents.to_vec());
    }

    pub fn remote_file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).remote_files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Lengths of every acknowledged data chunk, in order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        lock(&self.state).chunk_sizes.clone()
    }

    pub fn bearer_open(&self) -> bool {
        lock(&self.state).bearer_open
    }

    pub fn session_open(&self) -> bool {
        lock(&self.state).session_open
    }

    pub fn sessions_closed(&self) -> u32 {
        lock(&self.state).sessions_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(modem: &mut SimulatedModem, line: &str) -> String {
        modem.clear_input().unwrap();
        modem.write_all(format!("{line}\r\n").as_bytes()).unwrap();
        let mut buf = Vec::new();
        modem.read_available(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_registration_after_polls() {
        let (mut modem, handle) = SimulatedModem::new();
        handle.configure(|s| s.registered_after = Some(2));
        assert!(send(&mut modem, "AT+CREG?").contains("+CREG: 0,2"));
        assert!(send(&mut modem, "AT+CREG?").contains("+CREG: 0,2"));
        assert!(send(&mut modem, "AT+CREG?").contains("+CREG: 0,1"));
    }

    #[test]
    fn test_chunk_data_is_stored() {
        let (mut modem, handle) = SimulatedModem::new();
        send(&mut modem, "AT+FTPPUTNAME=\"a.bin\"");
        send(&mut modem, "AT+FTPPUTOPT=\"STOR\"");
        assert!(send(&mut modem, "AT+FTPPUT=1").contains("+FTPPUT: 1,1,1360"));
        assert!(send(&mut modem, "AT+FTPPUT=2,4").contains("+FTPPUT: 2,4"));
        modem.write_all(b"ab\r\n").unwrap();
        let mut buf = Vec::new();
        modem.read_available(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf).contains("OK"));
        assert!(send(&mut modem, "AT+FTPPUT=2,0").contains("+FTPPUT: 1,0"));

        assert_eq!(handle.remote_file("a.bin").unwrap(), b"ab\r\n");
        assert_eq!(handle.chunk_sizes(), vec![4]);
        assert_eq!(handle.sessions_closed(), 1);
    }

    #[test]
    fn test_zero_length_chunk_without_session_is_error() {
        let (mut modem, _handle) = SimulatedModem::new();
        assert!(send(&mut modem, "AT+FTPPUT=2,0").contains("ERROR"));
    }

    #[test]
    fn test_unresponsive_modem_records_but_stays_silent() {
        let (mut modem, handle) = SimulatedModem::new();
        handle.configure(|s| s.unresponsive = true);
        assert_eq!(send(&mut modem, "AT"), "");
        assert_eq!(handle.commands(), vec!["AT".to_string()]);
    }
}
