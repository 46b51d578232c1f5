//! dbus-broker-launch - Linux D-Bus message broker launcher
//!
//! Spawns and supervises `dbus-broker`, hands it the bus socket and the
//! bus policy, and forwards activation requests to systemd. Exits with
//! the broker.

use clap::error::ErrorKind;
use clap::Parser;

use broker_launch::{Args, LaunchConfig, Manager};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = match LaunchConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    log::debug!("Launching {} bus with {:?}", config.scope.as_str(), config);

    if let Err(e) = Manager::new(config).run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
