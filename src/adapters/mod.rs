use std::fs;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::AppConfig;
use crate::core::activity::ActivitySource;
use crate::core::gadget::GadgetBackend;
use crate::modem::{SimulatedModem, Transport};

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

pub use simulated::{SimulatedGadget, SimulatedHost};

/// Backends selected at start-up.
pub struct Adapters {
    pub gadget: Box<dyn GadgetBackend>,
    pub activity: Box<dyn ActivitySource>,
    pub transport: Box<dyn Transport>,
}

pub fn get_adapters(config: &AppConfig) -> Result<Adapters> {
    if config.simulation {
        fs::create_dir_all(&config.mount_point).with_context(|| {
            format!(
                "Failed to create simulated volume {}",
                config.mount_point.display()
            )
        })?;

        let (gadget, activity, host) = SimulatedGadget::new(config.mount_point.clone());
        spawn_stdin_driver(host);

        return Ok(Adapters {
            gadget: Box::new(gadget),
            activity: Box::new(activity),
            transport: open_transport(config)?,
        });
    }

    hardware_adapters(config)
}

/// Modem link only, for one-shot commands.
pub fn open_transport(config: &AppConfig) -> Result<Box<dyn Transport>> {
    if config.simulation {
        let (modem, _handle) = SimulatedModem::new();
        return Ok(Box::new(modem));
    }

    let port = crate::modem::SerialTransport::open(&config.serial)
        .with_context(|| format!("Failed to open modem port {}", config.serial.port))?;
    Ok(Box::new(port))
}

#[cfg(target_os = "linux")]
fn hardware_adapters(config: &AppConfig) -> Result<Adapters> {
    Ok(Adapters {
        gadget: Box::new(linux::LinuxGadget::new(&config.gadget_module)),
        activity: Box::new(linux::SysfsActivitySource::from_config(config)),
        transport: open_transport(config)?,
    })
}

#[cfg(not(target_os = "linux"))]
fn hardware_adapters(_config: &AppConfig) -> Result<Adapters> {
    anyhow::bail!("USB gadget mode needs Linux; run with --simulation")
}

/// Drive the simulated host from stdin.
fn spawn_stdin_driver(host: SimulatedHost) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines().map_while(|l| l.ok()) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["connect"] => host.connect(),
                ["disconnect"] => host.disconnect(),
                ["write", name, size] => match size.parse::<usize>() {
                    Ok(size) => {
                        if let Err(e) = host.write_file(name, &vec![b'A'; size]) {
                            warn!(error = %e, "(Simulator) Write rejected");
                        }
                    }
                    Err(_) => println!("(Simulator) Size must be a byte count"),
                },
                _ => println!("(Simulator) Use: 'connect', 'disconnect' or 'write <name> <bytes>'"),
            }
        }
    });
}
