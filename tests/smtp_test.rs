//! End-to-end SMTP ingress tests
//!
//! Each test boots the full app on ephemeral ports, drives the SMTP
//! listener with the minimal client from `common`, and checks the
//! result through the manager or the REST surface.

mod common;

use common::{SmtpClient, http_get, start_app, start_app_with};
use inbucket::NotificationKind;

#[tokio::test]
async fn basic_capture_visible_over_rest() {
    let app = start_app().await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    let reply = client
        .send_mail("a@x", &["b@y"], "Subject: hi\r\n\r\nbody\r\n")
        .await;
    assert!(reply.starts_with("250"), "delivery failed: {reply}");
    assert!(client.cmd("QUIT").await.starts_with("221"));

    let (status, body) = http_get(app.web_addr(), "/v1/mailbox/b").await;
    assert_eq!(status, 200);
    let summaries: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let list = summaries.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["subject"], "hi");
    assert_eq!(list[0]["from"], "a@x");
    assert_eq!(list[0]["to"], serde_json::json!(["b@y"]));
    assert_eq!(list[0]["seen"], false);
}

#[tokio::test]
async fn stored_source_is_byte_exact_after_unstuffing() {
    let app = start_app().await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    // The double dots on the wire must come back as single dots.
    let reply = client
        .send_mail(
            "a@x",
            &["b@y"],
            "Subject: dots\r\n\r\n..leading dot\r\nplain\r\n",
        )
        .await;
    assert!(reply.starts_with("250"));

    let manager = app.manager();
    let list = manager.get_messages("b").unwrap();
    let msg = manager.get_message("b", &list[0].id).unwrap();
    assert_eq!(
        msg.source,
        b"Subject: dots\r\n\r\n.leading dot\r\nplain\r\n"
    );
    assert_eq!(list[0].size, msg.source.len() as u64);
}

#[tokio::test]
async fn ehlo_advertises_capabilities() {
    let app = start_app_with(|c| c.smtp.max_message_bytes = 4096).await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    let caps = client.ehlo("tester").await;
    assert!(caps.iter().all(|l| l.starts_with("250")));
    assert!(caps.iter().any(|l| l.ends_with("PIPELINING")));
    assert!(caps.iter().any(|l| l.ends_with("8BITMIME")));
    assert!(caps.iter().any(|l| l.ends_with("SIZE 4096")));
    // No TLS configured, so STARTTLS must not be advertised.
    assert!(!caps.iter().any(|l| l.ends_with("STARTTLS")));
    assert!(client.cmd("STARTTLS").await.starts_with("454"));
}

#[tokio::test]
async fn cap_trims_oldest_and_hub_sees_everything() {
    let app = start_app_with(|c| c.storage.mailbox_message_cap = 3).await;
    let subscription = app.manager().hub().subscribe("u");

    let mut client = SmtpClient::connect(app.smtp_addr()).await;
    client.ehlo("test").await;
    for i in 0..5 {
        let reply = client
            .send_mail("a@x", &["u@y"], &format!("Subject: m{i}\r\n\r\nbody\r\n"))
            .await;
        assert!(reply.starts_with("250"));
    }

    let list = app.manager().get_messages("u").unwrap();
    assert_eq!(list.len(), 3);
    let subjects: Vec<&str> = list.iter().map(|s| s.subject.as_str()).collect();
    assert_eq!(subjects, vec!["m2", "m3", "m4"]);

    let mut news = 0;
    let mut removed = 0;
    while let Some(n) = subscription.try_recv() {
        match n.kind {
            NotificationKind::New => news += 1,
            NotificationKind::Removed => removed += 1,
            NotificationKind::Purged => panic!("unexpected purge"),
        }
    }
    assert_eq!((news, removed), (5, 2));
}

#[tokio::test]
async fn store_policy_rejects_at_rcpt_time() {
    let app = start_app_with(|c| {
        c.smtp.default_store = false;
        c.smtp.store_domains = vec!["allowed.com".to_string()];
    })
    .await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    assert!(client.cmd("MAIL FROM:<a@x>").await.starts_with("250"));
    assert!(
        client
            .cmd("RCPT TO:<nope@other.com>")
            .await
            .starts_with("550")
    );
    assert!(
        client
            .cmd("RCPT TO:<yes@allowed.com>")
            .await
            .starts_with("250")
    );

    assert!(app.manager().get_messages("nope").unwrap().is_empty());
}

#[tokio::test]
async fn oversized_data_is_refused_and_session_survives() {
    let app = start_app_with(|c| c.smtp.max_message_bytes = 1024).await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    assert!(client.cmd("MAIL FROM:<a@x>").await.starts_with("250"));
    assert!(client.cmd("RCPT TO:<big@y>").await.starts_with("250"));
    assert!(client.cmd("DATA").await.starts_with("354"));

    let blob = "x".repeat(2000);
    client.send_raw(format!("{blob}\r\n").as_bytes()).await;
    assert!(client.cmd(".").await.starts_with("552"));

    // Transaction is gone, session is not.
    assert!(client.cmd("MAIL FROM:<a@x>").await.starts_with("250"));
    assert!(app.manager().get_messages("big").unwrap().is_empty());
}

#[tokio::test]
async fn exactly_max_bytes_is_accepted() {
    let app = start_app_with(|c| c.smtp.max_message_bytes = 64).await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    // 62 payload bytes + CRLF lands exactly on the limit.
    let payload = "y".repeat(62);
    let reply = client
        .send_mail("a@x", &["edge@y"], &format!("{payload}\r\n"))
        .await;
    assert!(reply.starts_with("250"), "exact-size payload refused: {reply}");

    let list = app.manager().get_messages("edge").unwrap();
    assert_eq!(list[0].size, 64);
}

#[tokio::test]
async fn declared_size_over_limit_is_refused_early() {
    let app = start_app_with(|c| c.smtp.max_message_bytes = 1024).await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    assert!(
        client
            .cmd("MAIL FROM:<a@x> SIZE=99999")
            .await
            .starts_with("552")
    );
}

#[tokio::test]
async fn recipients_collapsing_to_one_mailbox_store_once() {
    let app = start_app().await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    client.ehlo("test").await;
    let reply = client
        .send_mail(
            "a@x",
            &["u@one.com", "U@two.com"],
            "Subject: dedupe\r\n\r\nbody\r\n",
        )
        .await;
    assert!(reply.starts_with("250"));

    let list = app.manager().get_messages("u").unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].to, vec!["u@one.com", "U@two.com"]);
}

#[tokio::test]
async fn command_sequencing_is_enforced() {
    let app = start_app().await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    assert!(client.cmd("MAIL FROM:<a@x>").await.starts_with("503"));
    assert!(client.cmd("DATA").await.starts_with("503"));
    client.ehlo("test").await;
    assert!(client.cmd("RCPT TO:<b@y>").await.starts_with("503"));
    assert!(client.cmd("MAIL FROM:<a@x>").await.starts_with("250"));
    assert!(client.cmd("DATA").await.starts_with("503"));
    assert!(client.cmd("BOGUS").await.starts_with("500"));
    assert!(client.cmd("NOOP").await.starts_with("250"));
    assert!(client.cmd("RSET").await.starts_with("250"));
    assert!(client.cmd("RCPT TO:<b@y>").await.starts_with("503"));
}

#[tokio::test]
async fn rset_before_hello_enters_mail_state() {
    let app = start_app().await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;

    // RSET is legal from any state and always lands on awaiting MAIL,
    // even before EHLO.
    assert!(client.cmd("RSET").await.starts_with("250"));
    assert!(client.cmd("MAIL FROM:<a@x>").await.starts_with("250"));
    assert!(client.cmd("RCPT TO:<r@y>").await.starts_with("250"));
}

#[tokio::test]
async fn session_cap_refuses_with_421() {
    let app = start_app_with(|c| c.smtp.max_connections = 1).await;

    // First connection holds the only permit.
    let _held = SmtpClient::connect(app.smtp_addr()).await;

    let stream = tokio::net::TcpStream::connect(app.smtp_addr())
        .await
        .unwrap();
    let mut reader = tokio::io::BufReader::new(stream);
    let mut greeting = String::new();
    tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut greeting)
        .await
        .unwrap();
    assert!(
        greeting.starts_with("421"),
        "expected 421 over the cap, got: {greeting}"
    );
}

#[tokio::test]
async fn concurrent_senders_to_one_mailbox_keep_order_and_count() {
    let app = start_app().await;
    let subscription = app.manager().hub().subscribe("shared");
    let addr = app.smtp_addr();

    let mut tasks = Vec::new();
    for i in 0..8 {
        tasks.push(tokio::spawn(async move {
            let mut client = SmtpClient::connect(addr).await;
            client.ehlo("test").await;
            let reply = client
                .send_mail(
                    "a@x",
                    &["shared@y"],
                    &format!("Subject: c{i}\r\n\r\nbody\r\n"),
                )
                .await;
            assert!(reply.starts_with("250"));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let list = app.manager().get_messages("shared").unwrap();
    assert_eq!(list.len(), 8);
    let mut ids: Vec<u64> = list.iter().map(|s| s.id.parse().unwrap()).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 8, "ids must be distinct");
    ids.sort_unstable();
    assert_eq!(ids, sorted, "listing follows arrival order");

    let mut events: u64 = 0;
    while let Some(n) = subscription.try_recv() {
        assert_eq!(n.kind, NotificationKind::New);
        events += 1;
    }
    assert_eq!(events + subscription.dropped(), 8);
}

#[tokio::test]
async fn two_subscribers_see_serial_deliveries_in_order() {
    let app = start_app().await;
    let first = app.manager().hub().subscribe("audience");
    let second = app.manager().hub().subscribe_all();

    let mut client = SmtpClient::connect(app.smtp_addr()).await;
    client.ehlo("test").await;
    for i in 0..10 {
        let reply = client
            .send_mail("a@x", &["audience@y"], &format!("Subject: s{i}\r\n\r\nbody\r\n"))
            .await;
        assert!(reply.starts_with("250"));
    }

    for subscription in [&first, &second] {
        let mut ids = Vec::new();
        while let Some(n) = subscription.try_recv() {
            assert_eq!(n.kind, NotificationKind::New);
            ids.push(n.id.unwrap().parse::<u64>().unwrap());
        }
        assert_eq!(ids.len() as u64 + subscription.dropped(), 10);
        assert!(ids.is_sorted(), "events reordered: {ids:?}");
    }
}

#[tokio::test]
async fn graceful_shutdown_closes_sessions() {
    let app = start_app().await;
    let mut client = SmtpClient::connect(app.smtp_addr()).await;
    client.ehlo("test").await;

    let addr = app.smtp_addr();
    app.shutdown().await;

    // The held session was told to go away...
    let reply = client.read_line().await;
    assert!(reply.is_empty() || reply.starts_with("421"), "got: {reply}");
    // ...and the listener is gone.
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
