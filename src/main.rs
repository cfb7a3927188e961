use futures::future::join_all;
use log::info;
use tokio::sync::watch;

use std::sync::Arc;
use std::time::Duration;

mod blockchain;
mod network;
mod node;

use blockchain::chain::env_or;
use blockchain::{Address, Blockchain, ChainConfig, Output, Participant};
use network::FakeNet;
use node::{Client, Miner};

// How long the miners run before the network is shut down
const SIMULATION_MS: u64 = 5000;

// When the late miner joins
const LATE_JOIN_MS: u64 = 2000;

// Prints every known participant's balance as seen by `client`
fn show_balances(client: &Client, roster: &[(String, Address)]) {
    let Some(confirmed) = client.last_confirmed_block() else {
        return;
    };

    println!(
        "{}'s view: chain length {}, confirmed up to {}, next nonce {}, {} pending outgoing",
        client.name(),
        client.last_block().map_or(0, |block| block.chain_length()),
        confirmed.chain_length(),
        client.nonce(),
        client.pending_outgoing_transactions().len()
    );
    for (name, address) in roster {
        println!("  {:<8} {:>6} gold  ({})", name, confirmed.balance_of(address), address);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Arc::new(ChainConfig::from_env()?);
    let net = Arc::new(FakeNet::new(
        env_or("NET_LOSS_PROBABILITY", 0.0)?,
        Duration::from_millis(env_or("NET_MAX_DELAY_MS", 0)?),
    )?);

    info!("Starting simulation with {} leading zero bits of work", config.pow_leading_zeroes());

    let mut alice = Client::new("Alice", net.clone(), config.clone());
    let mut bob = Client::new("Bob", net.clone(), config.clone());
    let mut charlie = Client::new("Charlie", net.clone(), config.clone());
    let mut minnie = Miner::new("Minnie", net.clone(), config.clone());
    let mut mickey = Miner::new("Mickey", net.clone(), config.clone());

    let genesis = Blockchain::new(config.clone()).make_genesis(
        None,
        Some(vec![
            (&mut alice as &mut dyn Participant, 233),
            (&mut bob as &mut dyn Participant, 99),
            (&mut charlie as &mut dyn Participant, 67),
            (&mut minnie as &mut dyn Participant, 400),
            (&mut mickey as &mut dyn Participant, 300),
        ]),
    )?;

    // Donald has more hash power but only joins once the others are underway.
    let mut donald = Miner::new("Donald", net.clone(), config.clone()).with_mining_rounds(3000);
    donald.set_genesis_block(&genesis)?;

    let roster: Vec<(String, Address)> = [alice.name(), bob.name(), charlie.name()]
        .into_iter()
        .zip([alice.address(), bob.address(), charlie.address()])
        .chain([
            (minnie.client().name(), minnie.client().address()),
            (mickey.client().name(), mickey.client().address()),
            (donald.client().name(), donald.client().address()),
        ])
        .map(|(name, address)| (name.to_string(), address.clone()))
        .collect();

    println!("Initial balances:");
    show_balances(&alice, &roster);

    let alice_inbox = alice.connect();
    let bob_inbox = bob.connect();
    let charlie_inbox = charlie.connect();
    let minnie_inbox = minnie.connect();
    let mickey_inbox = mickey.connect();

    let (stop, shutdown) = watch::channel(false);

    let miners = vec![
        tokio::spawn(minnie.run(minnie_inbox, shutdown.clone())),
        tokio::spawn(mickey.run(mickey_inbox, shutdown.clone())),
    ];

    info!("Alice is transferring 40 gold to {}", bob.address());
    alice.post_transaction(vec![Output::new(40, bob.address().clone())], config.default_tx_fee())?;

    let clients = vec![
        tokio::spawn(alice.run(alice_inbox, shutdown.clone())),
        tokio::spawn(bob.run(bob_inbox, shutdown.clone())),
        tokio::spawn(charlie.run(charlie_inbox, shutdown.clone())),
    ];

    let late_shutdown = shutdown.clone();
    let late_miner = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(LATE_JOIN_MS)).await;
        info!("Starting Donald");
        let inbox = donald.connect();
        donald.run(inbox, late_shutdown).await
    });

    tokio::time::sleep(Duration::from_millis(SIMULATION_MS)).await;
    info!("Shutting down the network");
    stop.send(true)?;

    let clients = join_all(clients).await.into_iter().collect::<Result<Vec<_>, _>>()?;
    let mut miners = join_all(miners).await.into_iter().collect::<Result<Vec<_>, _>>()?;
    miners.push(late_miner.await?);

    println!();
    println!("Final balances:");
    for client in &clients {
        show_balances(client, &roster);
    }
    for miner in &miners {
        show_balances(miner.client(), &roster);
    }

    Ok(())
}
