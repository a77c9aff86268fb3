use clap::Parser;
use log::{error, info, LevelFilter};
use peripheral_tracker::{init_logging, run, Args};
use peripheral_tracker::error::{AppRunError, ConfigError, DiscoveryError};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(args.log_level.unwrap_or(LevelFilter::Info));
    info!(concat!("Peripheral Tracker ", env!("CARGO_PKG_VERSION")));

    match run(args).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another instance of the tracker is already running");
            Ok(())
        },
        Err(AppRunError::Discovery { source: err @ (DiscoveryError::AdapterUnavailable | DiscoveryError::AdapterDisabled | DiscoveryError::PermissionDenied) }) => {
            error!("Can not scan for devices: {}", err);
            Err(AppRunError::Discovery { source: err })
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
