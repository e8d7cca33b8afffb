use checkout_bridge_server::{bridge::run_bridge, cli::handle_command_line_args, config::BridgeConfig};
use dotenvy::dotenv;
use log::info;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    if handle_command_line_args() {
        return;
    }
    let config = BridgeConfig::from_env_or_default();

    info!("🚀️ Starting checkout bridge against {}", config.pocketbase.url);
    match run_bridge(config).await {
        Ok(_) => println!("Bye!"),
        Err(e) => eprintln!("{e}"),
    }
}
