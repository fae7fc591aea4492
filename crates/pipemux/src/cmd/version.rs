use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("pipemux {}", env!("CARGO_PKG_VERSION"));
    if args.extended {
        println!("target: {}", env!("PIPEMUX_BUILD_TARGET"));
        println!(
            "wire header: {} bytes, control route: {}",
            pipemux_frame::HEADER_LEN,
            pipemux_router::CONTROL_ROUTE
        );
    }
    Ok(SUCCESS)
}
