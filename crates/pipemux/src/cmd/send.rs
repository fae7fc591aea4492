use pipemux_router::{BrokerClient, Registry};
use pipemux_transport::IoRunner;
use tracing::info;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, router_error, transport_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: SendArgs) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)
        .ok_or_else(|| CliError::new(USAGE, format!("invalid timeout '{}'", args.timeout)))?;

    let payload = match (&args.data, &args.file) {
        (Some(data), None) => data.clone().into_bytes(),
        (None, Some(file)) => {
            std::fs::read(file).map_err(|err| io_error("payload file unreadable", err))?
        }
        (None, None) | (Some(_), Some(_)) => {
            return Err(CliError::new(USAGE, "exactly one of --data or --file is required"))
        }
    };

    let runner = IoRunner::new().map_err(|err| transport_error("I/O worker failed", err))?;
    let registry = Registry::new(runner.clone());
    let client = BrokerClient::connect(&args.path, registry, timeout)
        .map_err(|err| router_error("broker connection failed", err))?;

    let endpoint = client
        .create_pipe(args.pipe, timeout)
        .map_err(|err| router_error("pipe setup failed", err))?;
    info!(pipe = args.pipe, "pipe open");

    for _ in 0..args.count {
        endpoint
            .write_message(&payload, Vec::new())
            .map_err(|err| router_error("send failed", err))?;
    }
    endpoint
        .flush(timeout)
        .map_err(|err| router_error("flush failed", err))?;
    info!(pipe = args.pipe, count = args.count, "payloads delivered");

    endpoint
        .close()
        .map_err(|err| router_error("close failed", err))?;
    runner.shutdown();
    Ok(SUCCESS)
}
