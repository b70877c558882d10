//! Built-in executors driven through full runs: state checks, idempotence
//! and dry-run behaviour against the scripted connector.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use siemply::connection::CommandResult;
use siemply::inventory::facts;
use siemply::playbook::Task;
use siemply::run::{HostStatus, TaskStatus};

fn reply(stdout: &str) -> Reply {
    Reply::Result(CommandResult::success(stdout.to_string(), String::new()))
}

fn failure() -> Reply {
    Reply::Result(CommandResult::failure(1, String::new(), String::new()))
}

#[tokio::test]
async fn test_package_installs_only_when_missing() {
    let connector = MockConnector::new();
    connector.on_host("missing", "rpm -q", failure());
    let store = store(&connector);
    let mut targets = hosts(&["present", "missing"]);
    for host in &mut targets {
        host.facts
            .insert(facts::OS_FAMILY.to_string(), serde_json::json!("RedHat"));
    }
    let pb = playbook(vec![Task::new("chrony", "package").arg("name", "chrony")]);

    let run = store.execute(pb, targets, policy(2)).await.unwrap();

    assert_eq!(run.host("present").unwrap().tasks[0].status, TaskStatus::Ok);
    assert_eq!(run.host("missing").unwrap().tasks[0].status, TaskStatus::Changed);
    assert!(connector
        .commands_on("missing")
        .iter()
        .any(|c| c.starts_with("yum install -y")));
    assert!(!connector
        .commands_on("present")
        .iter()
        .any(|c| c.contains("install -y")));
}

#[tokio::test]
async fn test_service_started_only_when_inactive() {
    let connector = MockConnector::new();
    connector.on_host("stopped", "systemctl is-active", failure());
    let store = store(&connector);
    let pb = playbook(vec![Task::new("splunkd", "service")
        .arg("name", "Splunkd")
        .arg("state", "started")]);

    let run = store
        .execute(pb, hosts(&["running", "stopped"]), policy(2))
        .await
        .unwrap();

    assert_eq!(run.host("running").unwrap().tasks[0].status, TaskStatus::Ok);
    assert_eq!(run.host("stopped").unwrap().tasks[0].status, TaskStatus::Changed);
    assert!(connector
        .commands_on("stopped")
        .contains(&"systemctl start 'Splunkd'".to_string()));
}

#[tokio::test]
async fn test_template_renders_per_host_and_is_idempotent() {
    let connector = MockConnector::new();
    let store = store(&connector);
    let mut pb = playbook(vec![Task::new("outputs", "template")
        .arg("dest", "/opt/splunkforwarder/etc/system/local/outputs.conf")
        .arg(
            "content",
            "[tcpout]\ndefaultGroup = {{ group }}\n# {{ inventory_hostname }}\n",
        )]);
    pb.vars.insert("group".into(), serde_json::json!("primary"));

    let first = store
        .execute(pb.clone(), hosts(&["uf1", "uf2"]), policy(2))
        .await
        .unwrap();
    for host in &first.host_results {
        assert_eq!(host.tasks[0].status, TaskStatus::Changed);
    }
    let content = connector
        .file_content("uf1", "/opt/splunkforwarder/etc/system/local/outputs.conf")
        .unwrap();
    assert_eq!(
        String::from_utf8(content).unwrap(),
        "[tcpout]\ndefaultGroup = primary\n# uf1"
    );

    let second = store
        .execute(pb, hosts(&["uf1", "uf2"]), policy(2))
        .await
        .unwrap();
    for host in &second.host_results {
        assert_eq!(host.tasks[0].status, TaskStatus::Ok);
    }
    assert_eq!(connector.uploads().len(), 2);
}

#[tokio::test]
async fn test_script_uploads_runs_and_cleans_up() {
    let connector = MockConnector::new();
    let store = store(&connector);
    let pb = playbook(vec![Task::new("tune", "script")
        .arg("content", "#!/bin/sh\nsysctl -w vm.swappiness=1\n")
        .arg("args", serde_json::json!(["--quiet"]))]);

    let run = store.execute(pb, hosts(&["a"]), policy(1)).await.unwrap();

    assert_eq!(run.host("a").unwrap().tasks[0].status, TaskStatus::Changed);
    let uploads = connector.uploads();
    assert_eq!(uploads.len(), 1);
    let remote = &uploads[0].1;
    assert!(remote.starts_with("/tmp/siemply-script-"));

    let commands = connector.commands_on("a");
    assert!(commands
        .iter()
        .any(|c| c.starts_with("/bin/sh") && c.contains(remote.as_str()) && c.ends_with("'--quiet'")));
    assert_eq!(
        commands.last().unwrap(),
        &format!("rm -f '{}'", remote)
    );
}

#[tokio::test]
async fn test_splunk_precheck_reports_every_failed_check() {
    let connector = MockConnector::new();
    connector.on("df -BG", reply("50G\n"));
    connector.on("free -g", reply("16\n"));
    connector.on("ulimit -n", reply("65535\n"));
    connector.on("getenforce", reply("Permissive\n"));
    connector.on_host("small", "df -BG", reply("3G\n"));
    connector.on_host("small", "ulimit -n", reply("1024\n"));
    let store = store(&connector);
    let pb = playbook(vec![Task::new("precheck", "splunk_precheck")
        .arg("check_ports", false)]);

    let run = store
        .execute(pb, hosts(&["big", "small"]), policy(2))
        .await
        .unwrap();

    let big = run.host("big").unwrap();
    assert_eq!(big.status, HostStatus::Success);
    assert_eq!(big.tasks[0].status, TaskStatus::Ok);

    let small = run.host("small").unwrap();
    assert_eq!(small.status, HostStatus::Failed);
    let message = &small.tasks[0].message;
    assert!(message.contains("disk space 3GB < 10GB"), "{}", message);
    assert!(message.contains("open file limit 1024"), "{}", message);
}

#[tokio::test]
async fn test_splunk_precheck_is_read_only_in_dry_run() {
    let connector = MockConnector::new();
    connector.on("df -BG", reply("50G\n"));
    connector.on("free -g", reply("16\n"));
    connector.on("ulimit -n", reply("unlimited\n"));
    let store = store(&connector);
    let pb = playbook(vec![
        Task::new("precheck", "splunk_precheck").arg("check_ports", false),
        Task::new("snapshot", "checkpoint").arg("label", "pre-upgrade"),
    ]);
    let mut policy = policy(1);
    policy.dry_run = true;

    let run = store.execute(pb, hosts(&["a"]), policy).await.unwrap();

    assert_eq!(
        run.host("a").unwrap().statuses(),
        vec![TaskStatus::Ok, TaskStatus::Changed]
    );
    assert!(!connector.commands_on("a").iter().any(|c| c.contains("tar ")));
}
