//! Cellular modem control: AT transport, command transactions, bearer setup
//! and FTP uploads.

pub mod bearer;
pub mod command;
pub mod ftp;
pub mod response;
pub mod simulated;
pub mod transport;

pub use bearer::{BearerController, BearerState};
pub use command::{CommandEngine, TransactionResult};
pub use ftp::{FtpUploader, UploadPolicy, UploadReport};
pub use simulated::{ModemHandle, SimulatedModem};
pub use transport::{SerialTransport, Transport};
