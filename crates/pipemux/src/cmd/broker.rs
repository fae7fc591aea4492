use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pipemux_frame::FrameConfig;
use pipemux_router::Broker;
use pipemux_transport::{IoRunner, UnixDomainSocket};
use tracing::info;

use crate::cmd::BrokerArgs;
use crate::exit::{router_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: BrokerArgs) -> CliResult<i32> {
    let listener = UnixDomainSocket::bind(&args.path)
        .map_err(|err| transport_error("bind failed", err))?;

    let runner = IoRunner::new().map_err(|err| transport_error("I/O worker failed", err))?;
    let broker = Broker::new(runner.clone(), FrameConfig::default());

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    info!(path = %args.path.display(), "broker up");
    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(_) if !running.load(Ordering::SeqCst) => break,
            Err(err) => {
                runner.shutdown();
                return Err(transport_error("accept failed", err));
            }
        };
        if let Err(err) = broker.accept_child(stream) {
            runner.shutdown();
            return Err(router_error("child setup failed", err));
        }
    }

    info!("broker shutting down");
    runner.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
