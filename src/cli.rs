use std::path::PathBuf;

use clap::{Parser, Subcommand};

use blegw_common::config::{default_config_path, GatewayConfig};
use blegw_common::ipc::{self, Request, Response};
use blegw_common::logger::*;
use blegw_common::{Address, Error, Result};

use crate::LOGGER;

#[derive(Debug, Parser)]
#[command(version, about = "Operator CLI of the BLE gateway daemon", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Subcommand, Clone)]
pub enum Command {
    /// Prints the peripheral/service/characteristic tree and its states
    Status {
        #[arg(short, long, help = "If specified, prints the raw JSON snapshot")]
        json: bool,
    },
    /// Starts a scan right away
    Scan {
        #[arg(
            short,
            long,
            help = "If specified, lists the devices reported by the last scan instead of starting one"
        )]
        list: bool,
    },
    /// Releases a stopped peripheral and connects it
    Start {
        #[arg(help = "MAC address with this format: xx:xx:xx:xx:xx:xx, case-insensitive")]
        address: Address,
    },
    /// Disconnects a peripheral, it stays down until started again
    Stop {
        #[arg(help = "MAC address with this format: xx:xx:xx:xx:xx:xx, case-insensitive")]
        address: Address,
    },
    /// Schedules an immediate read of every periodic characteristic of a peripheral
    Read {
        #[arg(help = "MAC address with this format: xx:xx:xx:xx:xx:xx, case-insensitive")]
        address: Address,
    },
    Shutdown,
    /// Validates a catalog file and prints it
    Config {
        #[arg(help = "Defaults to /etc/blegw/config.json")]
        path: Option<PathBuf>,
    },
    Logs {
        #[arg(
            short = 'f',
            long,
            help = "If specified, keeps the log file open and continuously prints the latest content"
        )]
        follow: bool,
        #[arg(short = 't', long, help = "If specified, shows the last x lines")]
        tail: Option<usize>,
        #[arg(short = 'd', long, help = "If specified, purges the log file")]
        purge: bool,
    },
}

impl Command {
    pub async fn handle(self) -> Result<()> {
        match self {
            Self::Status { json } => match ipc::send_request(&Request::Status).await? {
                Response::Status(snapshot) if json => {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?)
                }
                Response::Status(snapshot) => print!("{snapshot}"),
                response => return Err(unexpected(response)),
            },
            Self::Scan { list: false } => {
                send(Request::Scan).await?;
                println!("Scan started");
            }
            Self::Scan { list: true } => match ipc::send_request(&Request::ScanResults).await? {
                Response::ScanResults(results) if results.is_empty() => {
                    println!("No device reported by the last scan")
                }
                Response::ScanResults(results) => {
                    for result in results {
                        match (&result.name, result.configured) {
                            (Some(name), _) => println!("{} {name} (configured)", result.address),
                            (None, true) => println!("{} (configured)", result.address),
                            (None, false) => println!("{}", result.address),
                        }
                    }
                }
                response => return Err(unexpected(response)),
            },
            Self::Start { address } => {
                send(Request::Start { address }).await?;
                println!("{address} started");
            }
            Self::Stop { address } => {
                send(Request::Stop { address }).await?;
                println!("{address} stopped");
            }
            Self::Read { address } => {
                send(Request::Read { address }).await?;
                println!("Read cycle scheduled on {address}");
            }
            Self::Shutdown => {
                send(Request::Shutdown).await?;
                println!("Daemon is shutting down");
            }
            Self::Config { path } => {
                let path = path.unwrap_or_else(default_config_path);
                let config = GatewayConfig::load(&path)?;
                print_catalog(&config);
            }
            Self::Logs {
                follow,
                tail,
                purge,
            } => {
                if purge {
                    LOGGER.purge()?;
                } else if follow {
                    LOGGER.follow(tail).await?;
                } else {
                    LOGGER.print(tail)?;
                }
            }
        }

        Ok(())
    }
}

async fn send(request: Request) -> Result<()> {
    match ipc::send_request(&request).await? {
        Response::Ok => Ok(()),
        response => Err(unexpected(response)),
    }
}

fn unexpected(response: Response) -> Error {
    match response {
        Response::Error(error) => Error::Ipc(format!("daemon refused: {error}")),
        response => Error::Ipc(format!("unexpected daemon response {response:?}")),
    }
}

fn print_catalog(config: &GatewayConfig) {
    println!(
        "retry: {} attempts, {}ms base, {}ms max | service retries: {} | scan {}s every {}s",
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
        config.max_service_retries,
        config.scan_duration_secs,
        config.scan_interval_secs
    );

    if config.peripherals.is_empty() {
        warn!("No peripheral configured");
        return;
    }

    for peripheral in &config.peripherals {
        let mode = if peripheral.stay_connected {
            "stay-connected"
        } else {
            "on scan match"
        };
        println!("{} ({mode})", peripheral.label());

        for service in &peripheral.services {
            println!("  service {}", service.uuid);

            for charac in &service.characteristics {
                let notify = if charac.notify { " notify" } else { "" };
                match charac.read_interval() {
                    Some(interval) => println!(
                        "    characteristic {}{notify} every {}s",
                        charac.uuid,
                        interval.as_secs()
                    ),
                    None => println!("    characteristic {}{notify}", charac.uuid),
                }
            }
        }
    }
}
