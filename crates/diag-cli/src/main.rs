//! OBD-II Diagnostics - Main Entry Point

use anyhow::Context;
use clap::Parser;
use diag_cli::menu::{Menu, MenuAction, MAIN_MENU};
use diag_cli::render::{error_message, render_event, render_ports, render_started};
use diag_cli::{init_logging, AppConfig, Args};
use obd_protocol::mock::{MockAdapter, MockPorts};
use obd_protocol::{Elm327Connector, ObdConnector, PortLister, SystemPorts};
use obd_session::{
    Command, DiagnosticsController, Endpoint, Negotiator, OperationOutcome, PortDiscovery, UiEvent,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.apply_args(&args);
    config.session.validate().context("invalid session settings")?;
    init_logging(&config.log_level)?;

    info!("=== OBD-II Diagnostics v{} ===", env!("CARGO_PKG_VERSION"));

    let lister: Arc<dyn PortLister>;
    let connector: Arc<dyn ObdConnector>;
    if args.demo {
        println!("Demo mode: using a simulated adapter.");
        lister = Arc::new(MockPorts::demo());
        connector = Arc::new(MockAdapter::demo());
    } else {
        lister = Arc::new(SystemPorts);
        connector = Arc::new(Elm327Connector::new(config.session.protocol));
    }

    let discovery = PortDiscovery::with_keywords(lister, config.session.adapter_keywords.clone());
    if args.list_ports {
        match discovery.discover_report() {
            Ok(report) => println!("{}", render_ports(&report)),
            Err(e) => println!("{}", error_message(&e, None)),
        }
        return Ok(());
    }

    let negotiator = Negotiator::new(connector);
    let (mut controller, mut completions) =
        DiagnosticsController::new(negotiator, config.session.link_parameters());
    let mut menu = Menu::new();

    println!("{}", MAIN_MENU);
    if config.auto_connect {
        let endpoint = config.port.clone().map(|port| Endpoint::new(port, "configured"));
        submit(&mut controller, Command::Connect(endpoint));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match menu.handle(&line) {
                    MenuAction::Run(command) => submit(&mut controller, command),
                    MenuAction::ScanPorts => match discovery.discover_report() {
                        Ok(report) => {
                            println!("{}", render_ports(&report));
                            if !report.endpoints.is_empty() {
                                println!("Choose a port number, or 'c' to cancel:");
                            }
                            menu.offer_ports(report.endpoints);
                        }
                        Err(e) => println!("{}", error_message(&e, None)),
                    },
                    MenuAction::Message(message) => println!("{}", message),
                    MenuAction::ShowMenu => println!("{}", MAIN_MENU),
                    MenuAction::Quit => break,
                }
            }
            Some(report) = completions.next() => {
                for event in controller.apply(report) {
                    print_event(&event);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to wait for ctrl-c signal: {}", e);
                }
                break;
            }
        }
    }

    // Let a running task hand its session back so it is closed here
    if controller.busy_with().is_some() {
        println!("Waiting for the running operation to finish...");
    }
    tokio::select! {
        events = controller.finish(&mut completions) => {
            for event in events {
                print_event(&event);
            }
        }
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, leaving the running operation behind"),
    }
    controller.shutdown();
    println!("Goodbye.");
    Ok(())
}

fn submit(controller: &mut DiagnosticsController, command: Command) {
    match controller.request(command) {
        Ok(dispatch) => {
            for event in &dispatch.events {
                print_event(event);
            }
            if let Some(task) = dispatch.task {
                println!("{}", render_started(task.kind()));
            }
        }
        Err(e) => println!("{}", error_message(&e, controller.busy_with())),
    }
}

fn print_event(event: &UiEvent) {
    // Connect results repeat the connection-changed line
    if matches!(
        event,
        UiEvent::OperationResult {
            outcome: Ok(OperationOutcome::Connected { .. }),
            ..
        }
    ) {
        return;
    }
    println!("{}", render_event(event));
}
