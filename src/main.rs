use color_eyre::Result;
use device::Device;
use gateway::mqtt::MqttDeviceConnector;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::settings::read_settings;

mod climate;
mod commands;
mod device;
mod gateway;
mod settings;
mod telemetry;
mod twin;

fn init_logger() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(log::LevelFilter::Info);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}

/// Resolves on the next line from the operator, end of input, or Ctrl-C.
async fn wait_for_operator(stdin: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    tokio::select! {
        line = stdin.next_line() => {
            line?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_logger();

    let settings = read_settings()?;
    settings.validate()?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("*** Press ENTER to start ***");
    wait_for_operator(&mut stdin).await?;

    println!("*** Starting... ***");
    println!("*** Press ENTER to quit ***");

    let connector = MqttDeviceConnector::new(&settings.provisioning, &settings.hub);
    let running = Device::new(connector, &settings.device).start().await?;

    wait_for_operator(&mut stdin).await?;
    log::info!("Shutting down...");

    running.shutdown().await
}
