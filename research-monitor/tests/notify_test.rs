use chrono::NaiveDate;
use mockito::Matcher;
use research_monitor::notify::{Notifier, SlackWebhookNotifier};

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

#[tokio::test]
async fn slack_posts_mrkdwn_payload() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/services/T000/B000/XXX")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(serde_json::json!({
            "text": "*Research digest for 18.10.2026*\n2 relevant items",
            "mrkdwn": true
        })))
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await;

    let notifier = SlackWebhookNotifier::new(
        reqwest::Client::new(),
        format!("{}/services/T000/B000/XXX", server.url()),
    );
    notifier
        .send_digest("*Research digest for 18.10.2026*\n2 relevant items", date())
        .await
        .unwrap();
    assert_eq!(notifier.name(), "slack");

    mock.assert_async().await;
}

#[tokio::test]
async fn slack_error_status_is_reported() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/hook")
        .with_status(404)
        .with_body("no_service")
        .create_async()
        .await;

    let notifier = SlackWebhookNotifier::new(reqwest::Client::new(), format!("{}/hook", server.url()));
    let err = notifier.send_digest("hello", date()).await.unwrap_err();
    assert!(err.to_string().contains("no_service"));
}
