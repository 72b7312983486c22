use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    let command = with_geoip_args(command);
    with_sweeper_args(command)
}

fn with_geoip_args(command: Command) -> Command {
    command.arg(
        Arg::new("geoip-base-url")
            .long("geoip-base-url")
            .help("GeoIP lookup base URL; empty disables location enrichment")
            .env("CUSTODIA_GEOIP_BASE_URL")
            .default_value("http://ip-api.com"),
    )
}

fn with_sweeper_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("sweep-interval-seconds")
                .long("sweep-interval-seconds")
                .help("Interval between sweeps of expired sessions, tokens, and codes")
                .env("CUSTODIA_SWEEP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("attempt-retention-days")
                .long("attempt-retention-days")
                .help("Days to keep login attempt history")
                .env("CUSTODIA_ATTEMPT_RETENTION_DAYS")
                .default_value("90")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("alert-retention-days")
                .long("alert-retention-days")
                .help("Days to keep resolved security alerts")
                .env("CUSTODIA_ALERT_RETENTION_DAYS")
                .default_value("180")
                .value_parser(clap::value_parser!(i64)),
        )
}
