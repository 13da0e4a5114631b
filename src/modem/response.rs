//! Tokenizer for modem responses.
//!
//! Raw text is split into lines and each line is classified into a typed
//! [`ResponseLine`]. Matching a transaction is still a plain substring test
//! over the accumulated buffer; these types are for reading values out of a
//! response once it has been matched.

use std::sync::LazyLock;

use regex::Regex;

/// RSSI reported when the modem cannot measure signal.
pub const RSSI_UNKNOWN: u8 = 99;

static CSQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+CSQ:\s*(\d+)\s*,\s*(\d+)").unwrap());
static CREG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+CREG:\s*(\d+)(?:\s*,\s*(\d+))?").unwrap());
static SAPBR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\+SAPBR:\s*(\d+)\s*,\s*(\d+)\s*,\s*"([^"]*)""#).unwrap());
static FTPPUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+FTPPUT:\s*(\d+)\s*,\s*(\d+)(?:\s*,\s*(\d+))?").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    pub rssi: u8,
    pub ber: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLevel {
    Unknown,
    VeryWeak,
    Weak,
    Good,
}

impl SignalQuality {
    pub fn level(&self) -> SignalLevel {
        match self.rssi {
            RSSI_UNKNOWN => SignalLevel::Unknown,
            r if r < 5 => SignalLevel::VeryWeak,
            r if r < 10 => SignalLevel::Weak,
            _ => SignalLevel::Good,
        }
    }
}

/// `+CREG` network registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub stat: u8,
}

impl Registration {
    /// Registered on the home network (1) or roaming (5).
    pub fn is_registered(&self) -> bool {
        matches!(self.stat, 1 | 5)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerStatus {
    pub cid: u8,
    pub status: u8,
    pub ip: String,
}

impl BearerStatus {
    pub fn has_ip(&self) -> bool {
        !self.ip.is_empty() && self.ip != "0.0.0.0"
    }
}

/// Unsolicited `+FTPPUT` indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpPutIndication {
    /// `+FTPPUT: 1,1[,<maxlen>]`: session open, ready for data.
    Ready { max_len: Option<usize> },
    /// `+FTPPUT: 1,0`: session closed, transfer confirmed.
    Closed,
    /// `+FTPPUT: 1,<code>`: session error.
    Failed { code: u32 },
    /// `+FTPPUT: 2,<len>`: modem is waiting for `len` raw bytes.
    DataReady { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine {
    Ok,
    Error,
    Signal(SignalQuality),
    Registration(Registration),
    Bearer(BearerStatus),
    FtpPut(FtpPutIndication),
    Other(String),
}

impl ResponseLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        match line {
            "OK" => return Self::Ok,
            "ERROR" => return Self::Error,
            _ => {}
        }

        if let Some(c) = CSQ_RE.captures(line) {
            if let (Ok(rssi), Ok(ber)) = (c[1].parse(), c[2].parse()) {
                return Self::Signal(SignalQuality { rssi, ber });
            }
        }

        if let Some(c) = CREG_RE.captures(line) {
            // `+CREG: <n>,<stat>` when queried, `+CREG: <stat>` when unsolicited
            let stat = c.get(2).or_else(|| c.get(1)).map(|m| m.as_str().parse());
            if let Some(Ok(stat)) = stat {
                return Self::Registration(Registration { stat });
            }
        }

        if let Some(c) = SAPBR_RE.captures(line) {
            if let (Ok(cid), Ok(status)) = (c[1].parse(), c[2].parse()) {
                return Self::Bearer(BearerStatus {
                    cid,
                    status,
                    ip: c[3].to_string(),
                });
            }
        }

        if let Some(c) = FTPPUT_RE.captures(line) {
            if let Some(indication) = parse_ftpput(&c) {
                return Self::FtpPut(indication);
            }
        }

        Self::Other(line.to_string())
    }
}

fn parse_ftpput(c: &regex::Captures<'_>) -> Option<FtpPutIndication> {
    let mode: u32 = c[1].parse().ok()?;
    let value: u32 = c[2].parse().ok()?;
    let extra = c.get(3).and_then(|m| m.as_str().parse::<usize>().ok());

    match (mode, value) {
        (1, 1) => Some(FtpPutIndication::Ready { max_len: extra }),
        (1, 0) => Some(FtpPutIndication::Closed),
        (1, code) => Some(FtpPutIndication::Failed { code }),
        (2, len) => Some(FtpPutIndication::DataReady { len: len as usize }),
        _ => None,
    }
}

/// Split raw modem output into classified lines, dropping blanks.
pub fn tokenize(raw: &str) -> Vec<ResponseLine> {
    raw.split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ResponseLine::parse)
        .collect()
}

pub fn find_signal(raw: &str) -> Option<SignalQuality> {
    tokenize(raw).into_iter().find_map(|l| match l {
        ResponseLine::Signal(s) => Some(s),
        _ => None,
    })
}

pub fn find_registration(raw: &str) -> Option<Registration> {
    tokenize(raw).into_iter().find_map(|l| match l {
        ResponseLine::Registration(r) => Some(r),
        _ => None,
    })
}

pub fn find_bearer(raw: &str) -> Option<BearerStatus> {
    tokenize(raw).into_iter().find_map(|l| match l {
        ResponseLine::Bearer(b) => Some(b),
        _ => None,
    })
}

pub fn find_ftpput(raw: &str) -> Vec<FtpPutIndication> {
    tokenize(raw)
        .into_iter()
        .filter_map(|l| match l {
            ResponseLine::FtpPut(i) => Some(i),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_signal_and_ok() {
        let lines = tokenize("\r\n+CSQ: 17,99\r\n\r\nOK\r\n");
        assert_eq!(
            lines,
            vec![
                ResponseLine::Signal(SignalQuality { rssi: 17, ber: 99 }),
                ResponseLine::Ok
            ]
        );
    }

    #[test]
    fn test_signal_levels() {
        let level = |rssi| SignalQuality { rssi, ber: 0 }.level();
        assert_eq!(level(99), SignalLevel::Unknown);
        assert_eq!(level(3), SignalLevel::VeryWeak);
        assert_eq!(level(7), SignalLevel::Weak);
        assert_eq!(level(20), SignalLevel::Good);
    }

    #[test]
    fn test_registration_home_and_roaming() {
        assert!(find_registration("+CREG: 0,1\r\nOK").unwrap().is_registered());
        assert!(find_registration("+CREG: 0,5\r\nOK").unwrap().is_registered());
        assert!(!find_registration("+CREG: 0,2\r\nOK").unwrap().is_registered());
        assert!(find_registration("+CREG: 5").unwrap().is_registered());
    }

    #[test]
    fn test_registration_with_location_fields() {
        let reg = find_registration("+CREG: 2,1,\"1A2B\",\"00C1\"\r\nOK").unwrap();
        assert_eq!(reg.stat, 1);
    }

    #[test]
    fn test_bearer_null_ip() {
        let bearer = find_bearer("+SAPBR: 1,1,\"0.0.0.0\"\r\nOK").unwrap();
        assert!(!bearer.has_ip());

        let bearer = find_bearer("+SAPBR: 1,1,\"10.170.3.9\"\r\n\r\nOK").unwrap();
        assert!(bearer.has_ip());
        assert_eq!(bearer.ip, "10.170.3.9");
    }

    #[test]
    fn test_ftpput_indications() {
        assert_eq!(
            find_ftpput("OK\r\n\r\n+FTPPUT: 1,1,1360\r\n"),
            vec![FtpPutIndication::Ready {
                max_len: Some(1360)
            }]
        );
        assert_eq!(
            find_ftpput("+FTPPUT: 2,1024\r\n"),
            vec![FtpPutIndication::DataReady { len: 1024 }]
        );
        assert_eq!(find_ftpput("+FTPPUT: 1,0\r\n"), vec![FtpPutIndication::Closed]);
        assert_eq!(
            find_ftpput("+FTPPUT: 1,61\r\n"),
            vec![FtpPutIndication::Failed { code: 61 }]
        );
    }

    #[test]
    fn test_ready_without_length() {
        assert_eq!(
            find_ftpput("+FTPPUT: 1,1"),
            vec![FtpPutIndication::Ready { max_len: None }]
        );
    }

    #[test]
    fn test_unknown_lines_are_kept() {
        let lines = tokenize("AT+CFUN=1\r\nOK\r\n");
        assert_eq!(
            lines,
            vec![ResponseLine::Other("AT+CFUN=1".to_string()), ResponseLine::Ok]
        );
    }
}
