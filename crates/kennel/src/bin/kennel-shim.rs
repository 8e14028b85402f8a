//! Kennel process supervisor entry point.
//!
//! Logs JSON lines to stderr; the exec runner points stderr at
//! `<dir>/supervisor.log`.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() {
    let filter = EnvFilter::try_from_env("KENNEL_SHIM_LOG").unwrap_or_else(|_| EnvFilter::new("kennel=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .with(filter)
        .init();

    std::process::exit(kennel::shim::main(std::env::args_os()));
}
