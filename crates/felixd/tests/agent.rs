use std::io::Write;
use std::sync::{Arc, Mutex};

use felixd::{Agent, AgentConfig, AgentError};
use pretty_assertions::assert_eq;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;

/// Pass-through output shared with the test.
#[derive(Clone, Default)]
struct SharedOut(Arc<Mutex<Vec<u8>>>);

impl SharedOut {
    fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8(buf.clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn input_file(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file
}

fn config_for(file: &tempfile::NamedTempFile) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.input.path = file.path().display().to_string();
    config.ipsets.resync_interval_secs = 0;
    // Only explicit markers and end of input flush.
    config.sequencer.flush_interval_ms = 60_000;
    config
}

#[tokio::test]
async fn test_replay_converges_map() {
    let file = input_file(&[
        r#"{"type":"datastore_not_ready"}"#,
        r#"{"type":"ip_set_added","id":"s:web","set_type":"net"}"#,
        r#"{"type":"ip_set_member_added","id":"s:web","member":"10.0.0.0/24"}"#,
        r#"{"type":"ip_set_member_added","id":"s:web","member":"10.0.1.1"}"#,
        r#"{"type":"ip_set_member_added","id":"s:web","member":"fd00::1"}"#,
        r#"{"type":"ip_set_added","id":"s:db","set_type":"ip-and-port"}"#,
        r#"{"type":"ip_set_member_added","id":"s:db","member":"10.0.2.2,tcp:5432"}"#,
        r#"{"type":"policy_active","key":{"tier":"default","name":"allow-web"}}"#,
        r#"{"type":"flush"}"#,
        r#"{"type":"ip_set_member_removed","id":"s:web","member":"10.0.1.1"}"#,
        r#"{"type":"ip_set_removed","id":"s:db"}"#,
        r#"{"type":"policy_inactive","key":{"tier":"default","name":"allow-web"}}"#,
    ]);
    let out = SharedOut::default();
    let agent = Agent::new(config_for(&file), out.clone()).unwrap();

    let report = agent.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.feed.events, 12);
    assert_eq!(report.feed.flushes, 2);
    // The v6 member is ignored by the v4 map.
    assert_eq!(report.num_ip_sets, 1);
    assert_eq!(report.map_entries, 1);

    let kinds: Vec<String> = out
        .lines()
        .iter()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["DatastoreNotReady", "ActivePolicyUpdate", "ActivePolicyRemove"]
    );
}

#[tokio::test]
async fn test_metrics_registry_tracks_sets() {
    let file = input_file(&[
        r#"{"type":"ip_set_added","id":"s:a","set_type":"ip"}"#,
        r#"{"type":"ip_set_added","id":"s:b","set_type":"ip"}"#,
    ]);
    let agent = Agent::new(config_for(&file), std::io::sink()).unwrap();
    let registry = agent.registry();

    agent.run(CancellationToken::new()).await.unwrap();

    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("felix_bpf_num_ip_sets 2"), "{text}");
}

#[tokio::test]
async fn test_protocol_violation_stops_agent() {
    let file = input_file(&[
        r#"{"type":"ip_set_added","id":"s:a","set_type":"ip"}"#,
        r#"{"type":"flush"}"#,
        r#"{"type":"ip_set_member_added","id":"s:missing","member":"10.0.0.1"}"#,
    ]);
    let agent = Agent::new(config_for(&file), std::io::sink()).unwrap();

    let err = agent.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, AgentError::Sequencer(_)), "got {err:?}");
}

#[tokio::test]
async fn test_missing_input_file() {
    let mut config = AgentConfig::default();
    config.input.path = "/nonexistent/facts.jsonl".to_string();
    let agent = Agent::new(config, std::io::sink()).unwrap();

    let err = agent.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, AgentError::Io(_)));
}
