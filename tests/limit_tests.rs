//! Question-cap behavior of the live client, tested without a network.

use secrecy::SecretString;
use std::time::Duration;
use voiceline::{GeminiLiveClient, SessionConfig, TransportEvent, VoiceTransport};

fn capped_client(max_questions: u32) -> GeminiLiveClient {
    let config = SessionConfig::builder()
        .max_questions(max_questions)
        .limit_message("cap reached")
        .build();
    GeminiLiveClient::new(SecretString::from("test-key"), config)
}

#[tokio::test(start_paused = true)]
async fn below_the_cap_nothing_fires() {
    let client = capped_client(3);
    let mut events = client.subscribe();

    client.register_question();
    client.register_question();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn the_cap_fires_exactly_once() {
    let client = capped_client(3);
    let mut events = client.subscribe();

    for _ in 0..3 {
        client.register_question();
    }
    // Registrations past the cap must not re-fire.
    client.register_question();
    client.register_question();

    let event = events.recv().await.unwrap();
    assert_eq!(event, TransportEvent::LimitReached("cap reached".to_string()));

    // Past the grace delay the client stays closed and quiet.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!client.is_open());
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn a_cap_of_one_fires_on_the_first_question() {
    let client = capped_client(1);
    let mut events = client.subscribe();

    client.register_question();
    let event = events.recv().await.unwrap();
    assert!(matches!(event, TransportEvent::LimitReached(_)));
}
