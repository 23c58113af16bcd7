//! docker-credential-credbridge - credential helper that forwards to the host bridge

use credbridge_cli::helper::execute;
use credbridge_core::BridgeClient;
use std::io::Read;

#[tokio::main]
async fn main() {
    credbridge_cli::init_logging("warn");

    let Some(verb) = std::env::args().nth(1) else {
        eprintln!("Usage: docker-credential-credbridge <get|store|erase|list|version>");
        std::process::exit(1);
    };

    let mut input = String::new();
    if matches!(verb.as_str(), "get" | "store" | "erase") {
        if let Err(e) = std::io::stdin().read_to_string(&mut input) {
            println!("failed to read stdin: {}", e);
            std::process::exit(1);
        }
    }

    let client = BridgeClient::from_env();
    match execute(&verb, client.as_ref(), &input).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            println!("{}", e);
            std::process::exit(1);
        }
    }
}
