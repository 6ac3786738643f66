use std::sync::Arc;

use privesc_broker::{
    BrokerConfig, ChannelDispatcher, LocalBroker, ShellRunner, SpawnRequest, render_outcome,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "privesc_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = BrokerConfig::default()
        .prompt(Some("Administrator privileges required to list /etc: ".to_string()));
    let broker = Arc::new(LocalBroker::new(&config));
    let (dispatcher, outcomes) = ChannelDispatcher::new();
    let runner = ShellRunner::start(broker, config, Arc::new(dispatcher));

    runner.run(SpawnRequest::shell("ls -l /etc"));

    // The main thread plays the foreground context: it only renders outcomes.
    match outcomes.recv() {
        Ok(outcome) => println!("{}", render_outcome(&outcome)),
        Err(_) => eprintln!("runner stopped without an outcome"),
    }
}
