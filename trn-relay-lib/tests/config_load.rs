use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use trn_relay_lib::config::{load_from_path, PortCtype, PortModeCfg, PortProtoCfg};
use trn_relay_lib::error::RelayError;

fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("trn-relay-{nanos}-{name}.toml"))
}

#[test]
fn loads_minimal_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("minimal");
    let toml = r#"
[[port]]
name = "trn"
port = 28000
ctype = "tcp"
protocol = "commst"
"#;
    fs::write(&path, toml)?;

    let cfg = load_from_path(&path)?;
    assert_eq!(cfg.ports.len(), 1);
    let port = &cfg.ports[0];
    assert_eq!(port.name, "trn");
    assert_eq!(port.host, "0.0.0.0");
    assert_eq!(port.ctype, PortCtype::Tcp);
    assert_eq!(port.mode, PortModeCfg::Reqres);
    assert_eq!(port.protocol, PortProtoCfg::Commst);
    assert_eq!(port.hbto_sec, 15.0);
    assert!(cfg.log.dir.is_none());
    assert_eq!(cfg.commst.msg_size, 8192);
    assert!(cfg.source.is_none());
    Ok(())
}

#[test]
fn loads_full_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("full");
    let toml = r#"
[log]
dir = "/tmp/trn-logs"
level = "debug"

[commst]
msg_size = 4096
read_retries = 20
read_delay_ms = 5

[source]
mb1_file = "/data/survey.mb1"
interval_ms = 250

[[port]]
name = "trn"
host = "127.0.0.1"
port = 28000
ctype = "tcp"
protocol = "commst"
hbto_sec = 30.0
delay_ms = 20

[[port]]
name = "mb"
port = 27000
ctype = "udp"
mode = "pub"
protocol = "mb"
hbto_sec = 0.0
"#;
    fs::write(&path, toml)?;

    let cfg = load_from_path(&path)?;
    assert_eq!(cfg.ports.len(), 2);
    assert_eq!(cfg.log.dir.as_deref(), Some(std::path::Path::new("/tmp/trn-logs")));
    assert_eq!(cfg.log.level, "debug");
    assert_eq!(cfg.commst.msg_size, 4096);
    assert_eq!(cfg.commst.options().retries, 20);
    let source = cfg.source.as_ref().ok_or("source missing")?;
    assert_eq!(source.interval_ms, 250);

    let mb = &cfg.ports[1];
    assert_eq!(mb.mode, PortModeCfg::Pub);
    assert_eq!(mb.protocol, PortProtoCfg::Mb);
    assert_eq!(mb.hbto_sec, 0.0);

    let settings = cfg.ports[0].settings();
    assert_eq!(settings.host, "127.0.0.1");
    assert_eq!(settings.port, 28000);
    Ok(())
}

#[test]
fn rejects_empty_port_set() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("empty");
    fs::write(&path, "")?;
    match load_from_path(&path) {
        Err(RelayError::NoPorts) => Ok(()),
        other => panic!("expected NoPorts, got {other:?}"),
    }
}

#[test]
fn rejects_protocol_transport_mismatch() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("mismatch");
    let toml = r#"
[[port]]
name = "trn"
port = 28000
ctype = "udp"
protocol = "commst"
"#;
    fs::write(&path, toml)?;
    match load_from_path(&path) {
        Err(RelayError::Config(msg)) => {
            assert!(msg.contains("requires ctype tcp"), "{msg}");
            Ok(())
        }
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[test]
fn rejects_duplicate_names_and_binds() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("dups");
    let toml = r#"
[[port]]
name = "trn"
port = 28000
ctype = "tcp"
protocol = "commst"

[[port]]
name = "trn"
port = 28001
ctype = "tcp"
protocol = "trnmsg"
"#;
    fs::write(&path, toml)?;
    match load_from_path(&path) {
        Err(RelayError::Config(msg)) => assert!(msg.contains("Duplicate port name"), "{msg}"),
        other => panic!("expected Config error, got {other:?}"),
    }

    let toml = r#"
[[port]]
name = "a"
port = 28000
ctype = "tcp"
protocol = "commst"

[[port]]
name = "b"
port = 28000
ctype = "tcp"
protocol = "trnmsg"
"#;
    fs::write(&path, toml)?;
    match load_from_path(&path) {
        Err(RelayError::Config(msg)) => {
            assert!(msg.contains("Duplicate bind address"), "{msg}");
            Ok(())
        }
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[test]
fn rejects_undersized_commst_msg_size() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("small-msg");
    let toml = r#"
[commst]
msg_size = 64

[[port]]
name = "trn"
port = 28000
ctype = "tcp"
protocol = "commst"
"#;
    fs::write(&path, toml)?;
    match load_from_path(&path) {
        Err(RelayError::Config(msg)) => {
            assert!(msg.contains("msg_size"), "{msg}");
            Ok(())
        }
        other => panic!("expected Config error, got {other:?}"),
    }
}
