mod config;
mod node;

use std::time::Duration;

use concord_core::ProcessEnv;
use concord_store::InMemoryStoreProvider;

use crate::config::NodeConfig;
use crate::node::Node;

fn main() -> anyhow::Result<()> {
    concord_observability::init();

    let config = NodeConfig::from_env(&ProcessEnv)?;
    let run_for = config.run_for;

    // Single-process store; a shared store provider plugs in here.
    let provider = InMemoryStoreProvider::arc();
    let node = Node::start(config, provider)?;

    match run_for {
        Some(duration) => std::thread::sleep(duration),
        None => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
    }

    node.shutdown()
}
