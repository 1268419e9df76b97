//! Interactive voice demo: talk to the agent through the default
//! microphone and speaker.
//!
//! ```sh
//! GEMINI_API_KEY=... cargo run --example voice_demo
//! ```

use anyhow::Context;
use secrecy::SecretString;
use voiceline::{SessionConfig, VoiceSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voiceline=debug,info".into()),
        )
        .init();

    let api_key = std::env::var("GEMINI_API_KEY")
        .context("set GEMINI_API_KEY to a Google AI Studio key")?;

    let config = SessionConfig::default();
    let session = VoiceSession::with_live_defaults(config, SecretString::from(api_key));

    session.start_session().await?;
    println!("Session active. Speak into the microphone; Ctrl-C to quit.");

    tokio::signal::ctrl_c().await?;
    session.disconnect().await;
    println!("Session ended.");
    Ok(())
}
