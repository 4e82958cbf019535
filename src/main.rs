mod api;
mod cli;
mod collector;
mod config;
mod metrics;
mod prelude;
mod server;

use clap::{Parser, crate_version};

use crate::{
    api::{powerwall::Client, tls},
    cli::{Args, LogStyle},
    config::Config,
    prelude::*,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.log_style, args.debug);
    info!(version = crate_version!(), "starting…");

    let config = Config::load(&args.config_file)?;

    if args.fetch_cert {
        return fetch_cert(&config);
    }

    let certificate =
        config.device.tls_cert_file.as_deref().map(tls::load_certificate).transpose()?;
    let mut client = Client::try_new(
        &config.device.gateway_address,
        &config.device.login_email,
        &config.device.login_password,
        certificate,
    )?;
    client.set_retry_policy(
        config.device.retry_interval.into(),
        config.device.retry_timeout.into(),
    );
    server::run(&config, client).await
}

fn init_tracing(style: LogStyle, debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    match style {
        LogStyle::Text => {
            tracing_subscriber::fmt().with_max_level(level).without_time().compact().init();
        }
        LogStyle::Logfmt => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
        LogStyle::Json => {
            tracing_subscriber::fmt().with_max_level(level).json().init();
        }
    }
}

/// One-shot mode: retrieve the gateway certificate and store it in the
/// configured certificate file instead of starting the server.
fn fetch_cert(config: &Config) -> Result {
    let Some(path) = &config.device.tls_cert_file else {
        bail!("`device.tls-cert-file` is not specified in the config file");
    };
    let pem = tls::fetch_certificate(&config.device.gateway_address)?;
    std::fs::write(path, pem)
        .with_context(|| format!("failed to write the certificate to `{}`", path.display()))?;
    info!(path = %path.display(), "gateway certificate retrieved");
    Ok(())
}
