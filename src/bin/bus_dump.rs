use trade_gateway::bus::{inbound_name, outbound_name, ShmChannel};
use trade_gateway::Config;

fn main() -> anyhow::Result<()> {
    let Some(key) = std::env::args().nth(1) else {
        anyhow::bail!("usage: bus-dump <session-key>");
    };
    let config = Config::load_default();
    let dir = &config.bus.dir;
    println!("Bus channels for {} in {}", key, dir.display());

    for name in [inbound_name(&key), outbound_name(&key)] {
        match ShmChannel::open(dir, &name) {
            Ok(ch) => println!(
                "{:<40} depth {:>5} / {:<5} record {} bytes",
                name,
                ch.len(),
                ch.capacity(),
                ch.max_msg_len()
            ),
            Err(e) => println!("{:<40} unavailable: {}", name, e),
        }
    }
    Ok(())
}
