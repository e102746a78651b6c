// ABOUTME: Integration tests for the gate.
// ABOUTME: Tests the full flow: config + policy file + persisted state + guard mode + rule cascade.

use std::fs;
use std::path::Path;

use serde_json::json;

use scopegate::GuardError;
use scopegate::access::{Gate, Rule, ToolCall, Verdict};
use scopegate::config::Config;
use scopegate::state::{AuditEvent, GuardMode, Role, StateStore, TaskState};

fn gate(worktree: &Path, requested: Option<GuardMode>) -> Gate {
    let mut config = Config::default();
    config.guard.mode = requested;
    Gate::new(&config, worktree).unwrap()
}

fn start(gate: &Gate, scopes: &[&str], role: Option<Role>) {
    let mut state = TaskState::new(
        "AUTH-1",
        scopes.iter().map(|s| s.to_string()).collect(),
        "integration",
    )
    .with_title("Login flow");
    state.role = role;
    gate.store().write_state(&state).unwrap();
}

fn evaluated(verdict: Verdict) -> (GuardMode, scopegate::access::AccessResult) {
    match verdict {
        Verdict::Evaluated { mode, result } => (mode, result),
        Verdict::Disabled => panic!("gate unexpectedly disabled"),
    }
}

fn edit(path: &str) -> ToolCall {
    ToolCall::new("edit", json!({ "file_path": path }))
}

/// Same scope violation in warn and block mode: flagged both times, only
/// rejected in block mode.
#[test]
fn scope_violation_in_warn_and_block() {
    let dir = tempfile::tempdir().unwrap();

    let warn_gate = gate(dir.path(), Some(GuardMode::Warn));
    start(&warn_gate, &["src/auth/**"], None);
    let (mode, result) = evaluated(warn_gate.check(&edit("src/pay/card.rs")).unwrap());
    assert_eq!(mode, GuardMode::Warn);
    assert!(result.allowed && result.warned);
    assert_eq!(result.rule, Some(Rule::Rule2));

    let block_gate = gate(dir.path(), Some(GuardMode::Block));
    let (_, result) = evaluated(block_gate.check(&edit("src/pay/card.rs")).unwrap());
    assert!(!result.allowed);
    let (_, result) = evaluated(block_gate.check(&edit("src/auth/session.rs")).unwrap());
    assert!(result.allowed && !result.warned);
}

/// A persisted block override wins over a disabled request.
#[test]
fn persisted_block_overrides_disabled_request() {
    let dir = tempfile::tempdir().unwrap();
    let gate = gate(dir.path(), Some(GuardMode::Disabled));
    assert_eq!(
        gate.check(&edit("src/anything.rs")).unwrap(),
        Verdict::Disabled
    );

    gate.store().write_guard_mode(GuardMode::Block, "admin").unwrap();
    let (mode, result) = evaluated(gate.check(&edit("src/anything.rs")).unwrap());
    assert_eq!(mode, GuardMode::Block);
    assert_eq!(result.rule, Some(Rule::Rule1));
    assert!(!result.allowed);
}

/// Spec files stay editable even when the state file is broken.
#[test]
fn always_allow_survives_corrupted_state() {
    let dir = tempfile::tempdir().unwrap();
    let gate = gate(dir.path(), Some(GuardMode::Block));
    start(&gate, &["src/**"], None);
    let state_file = gate.store().paths().state_file.clone();
    fs::write(&state_file, "{").unwrap();
    for backup in gate.store().backup_paths(&state_file) {
        let _ = fs::remove_file(backup);
    }

    let (_, spec) = evaluated(gate.check(&edit("specs/plan.md")).unwrap());
    assert_eq!(spec.rule, Some(Rule::Rule0));
    assert!(spec.allowed && !spec.warned);

    let (_, code) = evaluated(gate.check(&edit("src/main.rs")).unwrap());
    assert_eq!(code.rule, Some(Rule::StateCorrupted));
    assert!(!code.allowed);
}

#[cfg(unix)]
#[test]
fn symlink_out_of_worktree_is_rule3() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    std::os::unix::fs::symlink(outside.path(), dir.path().join("src/vendor")).unwrap();

    let gate = gate(dir.path(), Some(GuardMode::Block));
    start(&gate, &["src/**"], None);
    let (_, result) = evaluated(gate.check(&edit("src/vendor/lib.rs")).unwrap());
    assert_eq!(result.rule, Some(Rule::Rule3));
    assert!(!result.allowed);
}

/// `link/..` climbs from the link's target, not from the directory holding it.
#[cfg(unix)]
#[test]
fn parent_segment_after_symlink_is_checked_at_the_real_target() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    fs::create_dir_all(outside.path().join("a/b")).unwrap();
    fs::create_dir_all(dir.path().join("src/auth")).unwrap();
    fs::create_dir_all(dir.path().join("src/pay/deep")).unwrap();
    std::os::unix::fs::symlink(outside.path().join("a/b"), dir.path().join("src/auth/link")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("src/pay/deep"), dir.path().join("src/auth/inner"))
        .unwrap();

    let gate = gate(dir.path(), Some(GuardMode::Block));
    start(&gate, &["src/auth/**"], None);

    let (_, escaped) = evaluated(
        gate.check(&ToolCall::new("write", json!({ "file_path": "src/auth/link/../c.rs" })))
            .unwrap(),
    );
    assert_eq!(escaped.rule, Some(Rule::Rule3));
    assert!(!escaped.allowed);

    let (_, sideways) = evaluated(gate.check(&edit("src/auth/inner/../x.rs")).unwrap());
    assert_eq!(sideways.rule, Some(Rule::Rule2));
    assert!(!sideways.allowed);

    let (_, plain) = evaluated(gate.check(&edit("src/auth/x/../y.rs")).unwrap());
    assert!(plain.allowed && !plain.warned);
}

#[test]
fn destructive_commands_are_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let gate = gate(dir.path(), Some(GuardMode::Block));
    let bash = |command: &str| {
        evaluated(
            gate.check(&ToolCall::new("bash", json!({ "command": command })))
                .unwrap(),
        )
        .1
    };

    for command in [
        "rm -rf /",
        "make && rm -rf /",
        "false || rm -rf /",
        "ls; rm -rf /",
        "nice -n 10 rm -rf /",
        "echo $(rm -rf /)",
        "(rm -rf /)",
        "if true; then rm -rf /; fi",
        "rm --recursive --force /",
    ] {
        let result = bash(command);
        assert_eq!(result.rule, Some(Rule::Rule4), "{command}");
        assert!(!result.allowed, "{command}");
    }
    let quoted = bash("echo \"rm -rf /\"");
    assert!(quoted.allowed && !quoted.warned);
}

#[test]
fn policy_file_extends_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join(".opencode/state");
    fs::create_dir_all(&state_dir).unwrap();
    fs::write(
        state_dir.join("policy.json"),
        r#"{"alwaysAllow":["docs/"],"destructiveBash":["terraform destroy"]}"#,
    )
    .unwrap();

    let gate = gate(dir.path(), Some(GuardMode::Block));
    let (_, docs) = evaluated(gate.check(&edit("docs/guide.md")).unwrap());
    assert_eq!(docs.rule, Some(Rule::Rule0));
    let (_, spec) = evaluated(gate.check(&edit("specs/plan.md")).unwrap());
    assert_eq!(spec.rule, Some(Rule::Rule1));
    let (_, tf) = evaluated(
        gate.check(&ToolCall::new("bash", json!({ "command": "terraform destroy -auto-approve" })))
            .unwrap(),
    );
    assert_eq!(tf.rule, Some(Rule::Rule4));

    fs::write(state_dir.join("policy.json"), r#"{"alwaysAllow":["**"]}"#).unwrap();
    let err = Gate::new(&Config::default(), dir.path()).unwrap_err();
    assert!(matches!(err, GuardError::ConfigInvalid(_)));
    let store = StateStore::from_config(&Config::default(), dir.path()).unwrap();
    assert!(store.audit().contains(AuditEvent::ConfigInvalid));
}

#[test]
fn implementer_role_limits_spec_tree() {
    let dir = tempfile::tempdir().unwrap();
    let gate = gate(dir.path(), Some(GuardMode::Block));
    start(&gate, &["src/auth/**"], Some(Role::Implementer));

    let (_, tasks) = evaluated(gate.check(&edit("specs/auth/tasks.md")).unwrap());
    assert!(tasks.allowed && !tasks.warned);
    let (_, plan) = evaluated(gate.check(&edit("specs/auth/plan.md")).unwrap());
    assert_eq!(plan.rule, Some(Rule::RoleDenied));
    assert!(!plan.allowed);
    let (_, code) = evaluated(gate.check(&edit("src/auth/login.rs")).unwrap());
    assert!(code.allowed && !code.warned);
}

#[test]
fn multiedit_reports_per_file_counts() {
    let dir = tempfile::tempdir().unwrap();
    let gate = gate(dir.path(), Some(GuardMode::Warn));
    start(&gate, &["src/auth/**"], None);

    let call = ToolCall::new(
        "multiedit",
        json!({ "files": [
            { "file_path": "src/auth/a.rs" },
            { "file_path": "src/pay/b.rs" },
            { "file_path": "../outside.rs" },
        ]}),
    );
    let (_, result) = evaluated(gate.check(&call).unwrap());
    assert!(result.allowed && result.warned);
    assert_eq!(result.rule, Some(Rule::Rule2));
    assert!(result.message.unwrap().starts_with("2/3 files warned"));
}

#[test]
fn editing_the_task_document_invalidates_state() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("specs")).unwrap();
    fs::write(dir.path().join("specs/tasks.md"), "- [ ] AUTH-1 `src/auth/**`").unwrap();

    let gate = gate(dir.path(), Some(GuardMode::Block));
    start(&gate, &["src/auth/**"], None);
    let (_, before) = evaluated(gate.check(&edit("src/auth/a.rs")).unwrap());
    assert!(before.allowed);

    fs::write(dir.path().join("specs/tasks.md"), "- [ ] AUTH-1 `**`").unwrap();
    let (_, after) = evaluated(gate.check(&edit("src/auth/a.rs")).unwrap());
    assert_eq!(after.rule, Some(Rule::StateCorrupted));
}
