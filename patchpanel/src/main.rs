use std::cell::RefCell;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process;
use std::rc::Rc;

use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use patchpanel_lib::arc_service::ArcType;
use patchpanel_lib::config::Config;
use patchpanel_lib::forwarding::{MulticastControl, NdProxyControl};
use patchpanel_lib::logging;
use patchpanel_lib::manager::{Manager, ManagerEvent};
use patchpanel_lib::process::{ProcessRunner, RealProcessRunner};
use patchpanel_lib::shill::NetworkApplier;
use patchpanel_lib::system::{RealSystem, System};

mod cli;
mod control;
mod helpers;

const ND_PROXY_CONTROL_PATH: &str = "/run/patchpanel/nd_proxy.sock";
const MCAST_PROXY_CONTROL_PATH: &str = "/run/patchpanel/mcast_proxy.sock";

fn bind_control_socket(socket_path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    if socket_path.exists() {
        if let Err(error) = std::fs::remove_file(socket_path) {
            tracing::error!(%error, "cannot remove stale control socket");
            return Err(exitcode::TEMPFAIL);
        }
    }
    if let Some(parent) = socket_path.parent() {
        if let Err(error) = std::fs::create_dir_all(parent) {
            tracing::error!(%error, "cannot create control socket directory");
            return Err(exitcode::IOERR);
        }
    }
    let listener = match UnixListener::bind(socket_path) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, "error binding control socket");
            return Err(exitcode::OSFILE);
        }
    };
    // Clients of the request surface are not necessarily root.
    if let Err(error) =
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
    {
        tracing::error!(%error, "error setting control socket permissions");
        return Err(exitcode::NOPERM);
    }
    Ok(listener)
}

fn handle_connection(manager: &Rc<RefCell<Manager>>, stream: tokio::net::UnixStream) {
    let std_stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "cannot convert control stream");
            return;
        }
    };
    if let Err(error) = std_stream.set_nonblocking(false) {
        tracing::error!(%error, "cannot configure control stream");
        return;
    }

    let (payload, mut fds) = match control::recv_request(&std_stream) {
        Ok(message) => message,
        Err(error) => {
            tracing::error!(%error, "error reading request");
            return;
        }
    };

    let response = match serde_json::from_slice::<control::Request>(&payload) {
        Ok(request) => {
            tracing::debug!(request = ?request, "incoming request");
            control::dispatch(&mut manager.borrow_mut(), request, &mut fds)
        }
        Err(error) => {
            tracing::error!(%error, "error parsing request");
            control::Response {
                success: false,
                error: Some(format!("bad request: {error}")),
                data: None,
            }
        }
    };

    let serialized = match serde_json::to_vec(&response) {
        Ok(serialized) => serialized,
        Err(error) => {
            tracing::error!(%error, "error serializing response");
            return;
        }
    };
    let mut std_stream = std_stream;
    if let Err(error) = std_stream.write_all(&serialized) {
        tracing::error!(%error, "error writing response");
    }
    let _ = std_stream.flush();
}

async fn daemon(args: cli::Cli) -> exitcode::ExitCode {
    let mut config = match Config::load(args.config_path.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "cannot load configuration");
            return exitcode::CONFIG;
        }
    };
    if let Some(socket_path) = args.socket_path {
        config.control_socket_path = socket_path;
    }

    let runner: Rc<dyn ProcessRunner> = Rc::new(RealProcessRunner::new());
    let system: Rc<dyn System> = Rc::new(RealSystem::new());
    let nd_proxy: Rc<dyn NdProxyControl> = Rc::new(helpers::HelperClient::connect(
        "nd_proxy",
        Path::new(ND_PROXY_CONTROL_PATH),
    ));
    let multicast: Rc<dyn MulticastControl> = Rc::new(helpers::HelperClient::connect(
        "mcast_proxy",
        Path::new(MCAST_PROXY_CONTROL_PATH),
    ));
    let network_applier: Rc<dyn NetworkApplier> = Rc::new(helpers::LoggingNetworkApplier);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ManagerEvent>();
    let manager = Rc::new(RefCell::new(Manager::new(
        runner,
        system,
        nd_proxy,
        multicast,
        network_applier,
        if args.arc_vm { ArcType::Vm } else { ArcType::Container },
        config.iptables_start_script.clone(),
        config.ip6tables_start_script.clone(),
        event_tx,
    )));
    manager.borrow_mut().start();

    let listener = match bind_control_socket(&config.control_socket_path) {
        Ok(listener) => listener,
        Err(exit) => return exit,
    };

    let shutdown = CancellationToken::new();

    // Request intake.
    {
        let manager = Rc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => handle_connection(&manager, stream),
                        Err(error) => tracing::error!(%error, "error accepting control connection"),
                    },
                }
            }
        });
    }

    // Event pump: lifeline closures and delayed tasks funnel back here.
    {
        let manager = Rc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => manager.borrow_mut().handle_event(event),
                        None => break,
                    },
                }
            }
        });
    }

    tracing::info!("enter listening mode");
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(error) => {
            tracing::error!(%error, "cannot install SIGTERM handler");
            return exitcode::OSERR;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, initiating shutdown"),
        _ = sigterm.recv() => tracing::info!("terminated, initiating shutdown"),
    }

    shutdown.cancel();
    manager.borrow_mut().stop();
    if let Err(error) = std::fs::remove_file(&config.control_socket_path) {
        tracing::warn!(%error, "failed removing control socket");
    }
    exitcode::OK
}

fn main() {
    let args = cli::parse();
    logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "cannot build runtime");
            process::exit(exitcode::OSERR);
        }
    };
    let local = tokio::task::LocalSet::new();
    let exit = runtime.block_on(local.run_until(daemon(args)));

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }
    process::exit(exit)
}
