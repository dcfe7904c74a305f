use assert_cmd::prelude::*;
use std::net::TcpListener;
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, host: &str) {
    let schema = format!("s{}", host.replace(['.', '-'], "_"));
    let body = format!(
        "host = \"{host}\"\nschema = \"{schema}\"\nsecret = \"{}\"\n\n[info]\nname = \"CLI Relay\"\n",
        "01".repeat(32)
    );
    std::fs::write(dir.path().join(format!("{host}.toml")), body).unwrap();
}

#[test]
fn init_creates_database() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "a.example.com");
    let db = dir.path().join("relay.db");

    Command::cargo_bin("warren")
        .unwrap()
        .args([
            "--config-dir",
            dir.path().to_str().unwrap(),
            "--db",
            db.to_str().unwrap(),
            "init",
        ])
        .assert()
        .success();

    assert!(db.exists());
}

#[test]
fn init_fails_without_config_dir() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("warren")
        .unwrap()
        .args([
            "--config-dir",
            dir.path().join("missing").to_str().unwrap(),
            "--db",
            dir.path().join("relay.db").to_str().unwrap(),
            "init",
        ])
        .assert()
        .failure();
}

#[tokio::test]
async fn serve_answers_health_and_relay_info() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "127.0.0.1");
    let db = dir.path().join("relay.db");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut child = Command::cargo_bin("warren")
        .unwrap()
        .args([
            "--config-dir",
            dir.path().to_str().unwrap(),
            "--db",
            db.to_str().unwrap(),
            "serve",
            "--bind",
            &format!("127.0.0.1:{port}"),
        ])
        .spawn()
        .unwrap();

    let base = format!("http://127.0.0.1:{port}");
    let mut healthy = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = reqwest::get(format!("{base}/healthz")).await {
            if resp.status().is_success() {
                healthy = true;
                break;
            }
        }
    }
    assert!(healthy, "server never became healthy");

    let info: serde_json::Value = reqwest::get(format!("{base}/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["name"], "CLI Relay");
    assert_eq!(info["software"], "warren");

    child.kill().unwrap();
    let _ = child.wait();
}
