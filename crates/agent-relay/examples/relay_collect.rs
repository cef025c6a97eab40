use agent_relay::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), RelayError> {
    let relay = Relay::new(RelayConfig::from_env()?.reply_mode(ReplyMode::Buffered))?;

    for fragment in relay.respond("/coze say hello", "example-user").await {
        println!("{fragment}");
    }
    Ok(())
}
