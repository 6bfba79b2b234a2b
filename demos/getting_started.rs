use std::time::Duration;

use ff_client::{Client, ClientConfig, Target};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ff_client::Result<()> {
    // Configure env_logger to see SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("ff")).init();

    let api_key =
        std::env::var("FF_API_KEY").expect("FF_API_KEY env variable should contain API key");
    let flag = std::env::var("FF_FLAG").unwrap_or_else(|_| "harnessappdemodarkmode".to_owned());

    let target = Target::new("rust-demo")
        .with_name("Rust Demo")
        .with_attribute("location", "emea");
    let client = Client::new(ClientConfig::from_api_key(api_key).debug(true), target)?;

    // Until this call returns, every variation serves its default value.
    client.initialize().await?;

    for _ in 0..10 {
        let value = client.bool_variation(&flag, false);
        println!("{flag}: {value}");
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    if let Err(err) = client.flush_metrics().await {
        println!("error posting metrics: {err}");
    }
    client.dispose();

    Ok(())
}
