//! Print the connection address for a host name, favouring IPv4.
//!
//! Useful for filling `RA_TLS_UPSTREAM_CONNECT_HOST` in container entrypoints.

use clap::Parser;
use ra_tls_proxy::resolve::resolve_host;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "resolve-host")]
#[command(about = "Resolve host to connection address")]
struct Args {
    /// Host name to resolve
    host: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    match resolve_host(&args.host).await {
        Ok(address) => {
            println!("{address}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
