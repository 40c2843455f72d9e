use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use interprocess::local_socket::{
    tokio::{Listener, Stream},
    traits::tokio::Listener as _,
    GenericFilePath, ListenerNonblockingMode, ListenerOptions, ToFsName as _,
};
use tokio::sync::{mpsc, oneshot};
use tokio::{signal, time};

use blegw_common::bluetooth::BtleTransport;
use blegw_common::config::{default_config_path, GatewayConfig};
use blegw_common::constants::SOCKET_PATH;
use blegw_common::gateway::{GatewayManager, ValueReceived};
use blegw_common::ipc::{self, Request, Response};
use blegw_common::logger::*;
use blegw_common::Transport;

/// Stdout carries the received values, logs only go to the file
static LOGGER: Logger = Logger::new("blegw-daemon", false);

/// Upper bound between two polls of the gateway, also paces the rescan check
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Time left to the disconnect tasks before the runtime goes down
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type Command = (Request, oneshot::Sender<Response>);

#[derive(Parser, Debug)]
#[command(version, about = "BLE gateway daemon", long_about = None)]
struct Args {
    /// Path of the peripheral catalog
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(error) = LOGGER.init() {
        eprintln!("Error cannot init logger: {error}");
        std::process::exit(1);
    }

    let args = Args::parse();
    let path = args.config.unwrap_or_else(default_config_path);

    let config = match GatewayConfig::load(&path) {
        Ok(config) => config,
        Err(error) => {
            error!("Cannot load {}: {error}", path.display());
            eprintln!("Error cannot load {}: {error}", path.display());
            std::process::exit(2);
        }
    };

    if Path::new(SOCKET_PATH).exists() {
        error!("Socket is already in use, an instance might already be running");
        eprintln!("Error: socket is already in use, an instance might already be running");
        std::process::exit(2);
    }

    let listener = match bind_listener() {
        Ok(listener) => listener,
        Err(error) => {
            error!("Error on spawning local socket: {error}");
            eprintln!("Error on spawning local socket: {error}");
            std::process::exit(1);
        }
    };

    let known = config.peripherals.iter().map(|p| p.address);
    let (mut transport, mut events) = match BtleTransport::new(config.scan_duration(), known).await {
        Ok(transport) => transport,
        Err(error) => {
            error!("{error}");
            eprintln!("Error: {error}");
            let _ = std::fs::remove_file(SOCKET_PATH);
            std::process::exit(1);
        }
    };

    let (commands_tx, mut commands) = mpsc::channel::<Command>(16);
    tokio::spawn(accept_clients(listener, commands_tx));

    info!(
        "Gateway started with {} peripheral(s) from {}",
        config.peripherals.len(),
        path.display()
    );

    let mut manager = GatewayManager::new(&config);
    let scan_interval = config.scan_interval();
    manager.scan(&mut transport);
    let mut last_scan = Instant::now();

    loop {
        let now = Instant::now();
        manager.poll(now, &mut transport);

        if manager.needs_scan()
            && !manager.is_scanning()
            && now.duration_since(last_scan) >= scan_interval
        {
            manager.scan(&mut transport);
            last_scan = now;
        }

        let wake = manager
            .next_deadline()
            .map_or(now + IDLE_TICK, |deadline| deadline.min(now + IDLE_TICK));

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            Some(event) = events.recv() => {
                if let Some(value) = manager.handle_event(event, &mut transport) {
                    forward(&value);
                }
            }
            Some((request, reply)) = commands.recv() => {
                let shutdown = request == Request::Shutdown;
                let response = process_request(request, &mut manager, &mut transport);
                let _ = reply.send(response);

                if shutdown {
                    info!("Shutdown requested");
                    break;
                }
            }
            _ = time::sleep_until(time::Instant::from_std(wake)) => (),
        }
    }

    manager.stop_all(&mut transport);
    time::sleep(SHUTDOWN_GRACE).await;

    if let Err(error) = std::fs::remove_file(SOCKET_PATH) {
        warn!("Cannot remove {SOCKET_PATH}: {error}");
    }
}

fn bind_listener() -> io::Result<Listener> {
    let fs_name = SOCKET_PATH.to_fs_name::<GenericFilePath>()?;

    ListenerOptions::new()
        .name(fs_name)
        .nonblocking(ListenerNonblockingMode::Neither)
        .create_tokio()
}

async fn accept_clients(listener: Listener, commands: mpsc::Sender<Command>) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                tokio::spawn(serve_client(stream, commands.clone()));
            }
            Err(error) => error!("Error on connection: {error}"),
        }
    }
}

/// One request and one response per connection
async fn serve_client(mut stream: Stream, commands: mpsc::Sender<Command>) {
    let request: Request = match ipc::read_frame(&mut stream).await {
        Ok(request) => request,
        Err(error) => {
            warn!("Unexpected error on reading request: {error}");
            return;
        }
    };
    debug!("Received {request:?}");

    let (reply_tx, reply_rx) = oneshot::channel();
    let response = match commands.send((request, reply_tx)).await {
        Ok(()) => reply_rx
            .await
            .unwrap_or_else(|_| Response::Error("daemon is shutting down".into())),
        Err(_) => Response::Error("daemon is shutting down".into()),
    };

    if let Err(error) = ipc::write_frame(&mut stream, &response).await {
        warn!("Cannot answer client: {error}");
    }
}

fn process_request(
    request: Request,
    manager: &mut GatewayManager,
    transport: &mut dyn Transport,
) -> Response {
    let result = match request {
        Request::Status => return Response::Status(manager.snapshot()),
        Request::ScanResults => return Response::ScanResults(manager.scan_results().to_vec()),
        Request::Scan => {
            manager.scan(transport);
            Ok(())
        }
        Request::Start { address } => manager.start(&address, transport),
        Request::Stop { address } => manager.stop(&address, transport),
        Request::Read { address } => manager.prepare_for_read(&address),
        Request::Shutdown => Ok(()),
    };

    match result {
        Ok(()) => Response::Ok,
        Err(error) => Response::Error(error.to_string()),
    }
}

/// One JSON document per line on stdout
fn forward(value: &ValueReceived) {
    let line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(error) => {
            error!("Cannot serialize value from {}: {error}", value.peripheral);
            return;
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(error) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        error!("Cannot forward value upstream: {error}");
    }
}
