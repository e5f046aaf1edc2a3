//! End-to-end POP3 tests

mod common;

use common::{Pop3Client, SmtpClient, start_app};

async fn deliver(app: &inbucket::App, mailbox: &str, data: &str) {
    let mut client = SmtpClient::connect(app.smtp_addr()).await;
    client.ehlo("test").await;
    let rcpt = format!("{mailbox}@example.com");
    let reply = client
        .send_mail("sender@example.com", &[rcpt.as_str()], data)
        .await;
    assert!(reply.starts_with("250"));
}

#[tokio::test]
async fn maildrop_flow_list_retr_dele() {
    let app = start_app().await;
    deliver(&app, "popuser", "Subject: first\r\n\r\none\r\n").await;
    deliver(&app, "popuser", "Subject: second\r\n\r\ntwo\r\n").await;

    let mut client = Pop3Client::connect(app.pop3_addr()).await;
    assert!(client.cmd("USER popuser").await.starts_with("+OK"));
    let reply = client.cmd("PASS anything").await;
    assert!(reply.starts_with("+OK maildrop has 2 messages"), "{reply}");

    let reply = client.cmd("STAT").await;
    assert!(reply.starts_with("+OK 2 "), "{reply}");

    assert!(client.cmd("LIST").await.starts_with("+OK"));
    let listing = client.read_multiline().await;
    assert_eq!(listing.len(), 2);
    assert!(listing[0].starts_with("1 "));
    assert!(listing[1].starts_with("2 "));

    assert!(client.cmd("UIDL").await.starts_with("+OK"));
    let uidl = client.read_multiline().await;
    assert_eq!(uidl.len(), 2);

    assert!(client.cmd("RETR 1").await.starts_with("+OK"));
    let body = client.read_multiline().await;
    assert_eq!(body, vec!["Subject: first", "", "one"]);

    // TOP: headers only when zero body lines are asked for.
    assert!(client.cmd("TOP 2 0").await.starts_with("+OK"));
    let top = client.read_multiline().await;
    assert_eq!(top, vec!["Subject: second", ""]);

    // Mark, unmark, re-mark; only the commit at QUIT is visible.
    assert!(client.cmd("DELE 1").await.starts_with("+OK"));
    assert!(client.cmd("DELE 1").await.starts_with("-ERR"));
    let reply = client.cmd("STAT").await;
    assert!(reply.starts_with("+OK 1 "), "{reply}");
    assert!(client.cmd("RSET").await.starts_with("+OK"));
    assert!(client.cmd("DELE 2").await.starts_with("+OK"));
    assert_eq!(app.manager().get_messages("popuser").unwrap().len(), 2);

    assert!(client.cmd("QUIT").await.starts_with("+OK"));

    let remaining = app.manager().get_messages("popuser").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subject, "first");
}

#[tokio::test]
async fn retr_round_trips_dotted_lines() {
    let app = start_app().await;
    deliver(&app, "dotty", "Subject: p\r\n\r\n.dotted\r\nplain\r\n").await;

    let mut client = Pop3Client::connect(app.pop3_addr()).await;
    client.cmd("USER dotty").await;
    client.cmd("PASS x").await;

    assert!(client.cmd("RETR 1").await.starts_with("+OK"));
    let wire = client.read_multiline().await;
    // The dotted line is byte-stuffed on the wire.
    assert_eq!(wire, vec!["Subject: p", "", "..dotted", "plain"]);

    let unstuffed: Vec<String> = wire
        .iter()
        .map(|l| l.strip_prefix('.').unwrap_or(l).to_string())
        .collect();
    assert_eq!(unstuffed, vec!["Subject: p", "", ".dotted", "plain"]);
}

#[tokio::test]
async fn transaction_commands_require_authentication() {
    let app = start_app().await;

    let mut client = Pop3Client::connect(app.pop3_addr()).await;
    assert!(client.cmd("STAT").await.starts_with("-ERR"));
    assert!(client.cmd("PASS x").await.starts_with("-ERR"));
    assert!(client.cmd("USER").await.starts_with("-ERR"));

    assert!(client.cmd("CAPA").await.starts_with("+OK"));
    let caps = client.read_multiline().await;
    assert!(caps.contains(&"UIDL".to_string()));

    assert!(client.cmd("USER nobody").await.starts_with("+OK"));
    let reply = client.cmd("PASS x").await;
    assert!(reply.starts_with("+OK maildrop has 0 messages"), "{reply}");
    assert!(client.cmd("RETR 1").await.starts_with("-ERR"));
    assert!(client.cmd("QUIT").await.starts_with("+OK"));
}
