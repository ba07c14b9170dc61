use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use galaxybus::{
    bridge::StompConnector,
    bus::{EventBus, Request, Response},
    config::{BrokerConfig, BusConfig},
    logger::{self, LogTag},
    services::implementations::{joke_service::{GET_JOKE, JOKE_SERVICE_DESTINATION}, Joke},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Asks a remote joke service for one joke through the broker
///
/// The local "jokes" channel is bridged to the service destination only for
/// the duration of the call.
#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("joke_client")
        .about("Requests a joke from a galaxybus joke service over the broker")
        .arg(
            Arg::new("broker")
                .long("broker")
                .value_name("HOST:PORT")
                .help("Broker address")
                .default_value("localhost:30080"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECS")
                .help("Seconds to wait for the joke")
                .default_value("10"),
        )
        .get_matches();

    logger::init();

    let server_addr = matches
        .get_one::<String>("broker")
        .cloned()
        .unwrap_or_default();
    let timeout_secs: u64 = matches
        .get_one::<String>("timeout")
        .map(|s| s.parse())
        .transpose()
        .context("--timeout must be a number of seconds")?
        .unwrap_or(10);

    let bus = EventBus::new(BusConfig::default());
    let broker = BrokerConfig {
        server_addr,
        ..BrokerConfig::default()
    };
    let connection = bus
        .connect_broker(&broker, &StompConnector::new())
        .await
        .context("broker connection failed")?;

    bus.create_channel("jokes");
    let (tx, rx) = oneshot::channel::<Result<Response, String>>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let on_error = Arc::clone(&tx);
    bus.listen_once("jokes")?.handle(
        move |message| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(message.decode::<Response>().map_err(|e| e.to_string()));
            }
        },
        move |err| {
            if let Some(tx) = on_error.lock().take() {
                let _ = tx.send(Err(err.to_string()));
            }
        },
    );

    bus.mark_galactic("jokes", JOKE_SERVICE_DESTINATION, &connection)
        .await?;
    bus.send_request("jokes", &Request::new(GET_JOKE))?;
    logger::info(LogTag::System, "Requested a joke, waiting...");

    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await;

    bus.mark_local("jokes").await?;
    bus.disconnect_all().await?;

    let response = outcome
        .map_err(|_| anyhow!("no joke within {}s", timeout_secs))?
        .map_err(|_| anyhow!("listener closed without a reply"))?
        .map_err(|e| anyhow!(e))?;
    if response.error {
        return Err(anyhow!(
            "joke service error {}: {}",
            response.error_code,
            response.error_message.unwrap_or_default()
        ));
    }

    let joke: Joke = response.decode_payload()?;
    println!("{}", joke.joke);
    Ok(())
}
