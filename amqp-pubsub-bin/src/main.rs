#![deny(unsafe_code)]

use std::time::Duration;

use structopt::StructOpt;

use amqp_pubsub::{handler_fn, Metadata, PubSub, PublishRequest, RabbitMq, SubscribeRequest};
use amqp_pubsub_conf::{logger::logger_init, Options, Settings};

#[derive(StructOpt, Debug)]
#[structopt(name = "amqp-pubsub", about = "Publish to or subscribe on a RabbitMQ topic")]
struct Args {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    cfg_name: Option<String>,

    /// Broker URI, overrides `pubsub.host`
    #[structopt(long)]
    host: Option<String>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Publish one message
    Pub {
        #[structopt(short, long)]
        topic: String,
        #[structopt(short, long)]
        message: String,
        #[structopt(long)]
        routing_key: Option<String>,
        /// Message expiration, such as 30s or 5m
        #[structopt(long)]
        ttl: Option<String>,
    },
    /// Print every message received on a topic until Ctrl-C
    Sub {
        #[structopt(short, long)]
        topic: String,
        #[structopt(long)]
        routing_key: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::from_args();

    //init config
    let settings = Settings::init(Options { cfg_name: args.cfg_name.clone(), host: args.host.clone() })
        .expect("settings init failed");

    //init log
    let _logger = logger_init(&settings.log).expect("logger init failed");

    Settings::logs();

    if let Err(e) = run(settings, args.cmd).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(settings: &Settings, cmd: Command) -> anyhow::Result<()> {
    let pubsub = RabbitMq::amqp();
    pubsub.init(Metadata::from(settings.pubsub.clone())).await?;

    let res = match cmd {
        Command::Pub { topic, message, routing_key, ttl } => {
            let mut req = PublishRequest::new(topic, message);
            if let Some(key) = routing_key {
                req = req.metadata("routingKey", key);
            }
            if let Some(ttl) = ttl {
                let secs = amqp_pubsub_utils::to_duration(&ttl).as_secs().max(1);
                req = req.metadata("ttlInSeconds", secs.to_string());
            }
            pubsub.publish(req).await
        }
        Command::Sub { topic, routing_key } => {
            let mut req = SubscribeRequest::new(topic);
            if let Some(keys) = routing_key {
                req = req.metadata("routingKey", keys);
            }
            let handler = handler_fn(|msg| async move {
                println!("{} {}", msg.topic, String::from_utf8_lossy(&msg.data));
                Ok(())
            });
            match pubsub.subscribe(req, handler).await {
                Ok(()) => {
                    tokio::signal::ctrl_c().await?;
                    log::info!("stats: {}", pubsub.stats());
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    };

    //allow in-flight acknowledgements to settle
    tokio::time::sleep(Duration::from_millis(100)).await;
    pubsub.close().await?;
    Ok(res?)
}
