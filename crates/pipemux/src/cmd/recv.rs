use pipemux_router::{BrokerClient, Registry, RouterError};
use pipemux_transport::IoRunner;
use tracing::info;

use crate::cmd::{parse_duration, RecvArgs};
use crate::exit::{router_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat};

const RECV_BUFFER: usize = 1024 * 1024;

pub fn run(args: RecvArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)
        .ok_or_else(|| CliError::new(USAGE, format!("invalid timeout '{}'", args.timeout)))?;

    let runner = IoRunner::new().map_err(|err| transport_error("I/O worker failed", err))?;
    let registry = Registry::new(runner.clone());
    let client = BrokerClient::connect(&args.path, registry, timeout)
        .map_err(|err| router_error("broker connection failed", err))?;

    let endpoint = client
        .create_pipe(args.pipe, timeout)
        .map_err(|err| router_error("pipe setup failed", err))?;
    info!(pipe = args.pipe, "pipe open");

    let local = client
        .process_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut received = 0usize;

    loop {
        let outcome = match endpoint.read_blocking(&mut buf, None) {
            Ok(outcome) => outcome,
            Err(RouterError::PeerClosed) => break,
            Err(err) => {
                runner.shutdown();
                return Err(router_error("receive failed", err));
            }
        };

        print_message(
            args.pipe,
            received,
            &buf[..outcome.bytes],
            outcome.handles.len(),
            &local,
            format,
        );
        received += 1;

        if let Some(count) = args.count {
            if received >= count {
                break;
            }
        }
    }

    info!(pipe = args.pipe, received, "done");
    let _ = endpoint.close();
    runner.shutdown();
    Ok(SUCCESS)
}
