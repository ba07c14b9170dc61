use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use galaxybus::{
    bridge::StompConnector,
    bus::{EventBus, Response},
    errors::BusError,
    config::{BrokerConfig, BusConfig},
    logger::{self, LogTag},
    services::implementations::random_word_service::RANDOM_WORD_DESTINATION,
};
use std::time::Duration;
use tokio::sync::mpsc;

const LOCAL_CHANNEL: &str = "my-local-word-stream";

/// Prints words streamed by a remote random word service
#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("word_client")
        .about("Streams random words from a galaxybus word service over the broker")
        .arg(
            Arg::new("broker")
                .long("broker")
                .value_name("HOST:PORT")
                .help("Broker address")
                .default_value("localhost:30080"),
        )
        .arg(
            Arg::new("count")
                .long("count")
                .value_name("N")
                .help("Number of words to print before exiting")
                .default_value("10"),
        )
        .get_matches();

    logger::init();

    let server_addr = matches
        .get_one::<String>("broker")
        .cloned()
        .unwrap_or_default();
    let count: usize = matches
        .get_one::<String>("count")
        .map(|s| s.parse())
        .transpose()
        .context("--count must be a number")?
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

    let (tx, mut rx) = mpsc::unbounded_channel::<Result<String, BusError>>();
    let errors = tx.clone();
    let stream = bus.listen_stream(LOCAL_CHANNEL)?;
    stream.handle(
        move |message| {
            let word = message
                .decode::<Response>()
                .and_then(|response| response.decode_payload::<String>());
            let _ = tx.send(word);
        },
        move |err| {
            let _ = errors.send(Err(err.clone()));
        },
    );

    bus.mark_galactic(LOCAL_CHANNEL, RANDOM_WORD_DESTINATION, &connection)
        .await?;
    logger::info(
        LogTag::System,
        &format!("Listening on {} for {} words", RANDOM_WORD_DESTINATION, count),
    );

    let mut received = 0;
    let mut failure = None;
    while received < count {
        match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Some(Ok(word))) => {
                received += 1;
                println!("{:>3}: {}", received, word);
            }
            Ok(Some(Err(e))) if e.is_connection_failure() => {
                failure = Some(e.to_string());
                break;
            }
            Ok(Some(Err(e))) => {
                logger::warning(LogTag::System, &format!("stream error: {}", e));
            }
            Ok(None) => break,
            Err(_) => {
                failure = Some("no word within 30s".to_string());
                break;
            }
        }
    }

    stream.close();
    let _ = bus.mark_local(LOCAL_CHANNEL).await;
    bus.disconnect_all().await?;

    match failure {
        Some(reason) => Err(anyhow!(reason)),
        None => Ok(()),
    }
}
