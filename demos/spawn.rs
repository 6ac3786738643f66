use std::sync::Arc;
use std::sync::mpsc;

use privesc_broker::{
    Broker, BrokerConfig, GateState, LocalBroker, OutputLimit, PermissionGate, SpawnRequest,
    collect,
};

fn main() {
    let config = BrokerConfig::default();
    let broker = Arc::new(LocalBroker::new(&config));
    let (results_tx, results) = mpsc::channel();
    let gate = PermissionGate::new(broker.clone(), config.request_code, move |result| {
        let _ = results_tx.send(result);
    });

    let mut state = gate.evaluate();
    if state == GateState::AwaitingGrant {
        println!("Waiting for authentication...");
        state = match results.recv() {
            Ok(result) => state.resolve(result),
            Err(_) => GateState::Denied,
        };
    }
    if state != GateState::Ready {
        println!("Cannot spawn: {state:?} ({})", broker.escalation_tool());
        return;
    }

    // Spawn without blocking, then drain output and wait on this thread.
    let process = broker
        .spawn(&SpawnRequest::new("id").env("LC_ALL", "C"))
        .unwrap();

    if let Some(id) = process.id() {
        println!("Spawned process with ID: {id}");
    }

    let result = collect(process, OutputLimit::bytes(64 * 1024)).unwrap();
    println!("Exit status: {}", result.exit_code);
    print!("{}", result.output);
}
