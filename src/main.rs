use anyhow::Result;
use structopt::StructOpt;
use tokio::select;

use pubsub_consumer::{logging, Config, Consumer, Message, PubSubConsumer};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pubsub-consume",
    about = "Prints messages delivered to a Pub/Sub subscription"
)]
struct Opt {
    /// Topic to read from; created if missing
    topic: String,

    /// Subscription to read through; created if missing
    subscription: String,

    /// Hand every message back for redelivery instead of acknowledging it
    #[structopt(long)]
    nack: bool,

    /// Stop after this many messages
    #[structopt(long)]
    limit: Option<usize>,

    /// Delete the subscription and exit
    #[structopt(long)]
    remove: bool,

    /// Print whether the subscription exists and exit
    #[structopt(long)]
    alive: bool,

    #[structopt(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info")?;
    let opt = Opt::from_args();

    let consumer = PubSubConsumer::with_config(&opt.config, &opt.topic, &opt.subscription).await?;

    if opt.alive {
        println!("{}", consumer.alive().await);
        return Ok(());
    }
    if opt.remove {
        consumer.remove().await?;
        return Ok(());
    }

    let mut delivery = consumer.consume().await?;
    let mut received = 0;

    loop {
        let message = select! {
            _ = tokio::signal::ctrl_c() => break,
            message = delivery.recv() => message,
        };
        let message = match message {
            Some(message) => message,
            None => break,
        };

        println!(
            "{} {}",
            message.id(),
            String::from_utf8_lossy(message.data())
        );
        message.done(!opt.nack);

        received += 1;
        if opt.limit.map_or(false, |limit| received >= limit) {
            break;
        }
    }

    delivery.finish().await?;
    Ok(())
}
