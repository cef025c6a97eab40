use agent_relay::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), RelayError> {
    agent_relay::init_observability();
    let relay = Relay::new(RelayConfig::from_env()?.reply_mode(ReplyMode::Stream))?;

    let mut stream = relay.handle(ChatCommand::new("Stream a greeting.", "example-user"));
    while let Some(fragment) = stream.next_fragment().await {
        print!("{fragment}");
    }
    println!();

    let reply = stream.finish().await?;
    eprintln!("invocation {} finished", reply.invocation_id);
    Ok(())
}
