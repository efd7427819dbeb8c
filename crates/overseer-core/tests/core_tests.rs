//! Comprehensive tests for overseer-core: ids, errors, scopes, events, artifacts

use overseer_core::*;

// ===========================================================================
// IDs
// ===========================================================================

#[test]
fn ids_are_short_and_url_safe() {
    for _ in 0..100 {
        let id = new_id();
        assert_eq!(id.len(), 11);
        assert!(!id.contains('='));
        assert!(!id.contains('/'));
        assert!(!id.contains('+'));
    }
}

// ===========================================================================
// Error taxonomy
// ===========================================================================

#[test]
fn every_kind_is_reachable() {
    use ErrorKind::*;
    let cases: Vec<(Error, ErrorKind)> = vec![
        (Error::not_found("dag", "d1"), NotFound),
        (Error::conflict("busy"), Conflict),
        (Error::validation("bad shape"), Validation),
        (Error::unauthorized("expired token"), Unauthorized),
        (Error::external("llm down"), External),
        (Error::timeout("too slow"), Timeout),
        (Error::Fatal("corrupt".into()), Fatal),
    ];
    for (error, kind) in cases {
        assert_eq!(error.kind(), kind);
        assert!(!error.to_string().is_empty());
    }
}

#[test]
fn error_messages_carry_context() {
    let e = Error::not_found("device", "dev-42");
    assert_eq!(e.to_string(), "device not found: dev-42");
    let e = Error::unauthorized("device token expired");
    assert!(e.to_string().contains("device token expired"));
}

// ===========================================================================
// Scope enforcement
// ===========================================================================

fn globs(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|s| s.to_string()).collect()
}

#[test]
fn scope_scenario_allow_deny_fallthrough() {
    let allow = globs(&["src/**/*.ts"]);
    let deny = globs(&["src/secrets/**"]);

    let d = scope_check("src/foo.ts", &allow, &deny);
    assert!(d.allowed);
    assert_eq!(d.matched_pattern.as_deref(), Some("src/**/*.ts"));

    let d = scope_check("src/secrets/k.ts", &allow, &deny);
    assert!(!d.allowed);
    assert_eq!(d.matched_pattern.as_deref(), Some("src/secrets/**"));

    let d = scope_check("README.md", &allow, &deny);
    assert!(!d.allowed);
    assert_eq!(d.reason, "not in allow list");
}

#[test]
fn empty_allow_with_deny_blocks_everything() {
    let deny = globs(&["tmp/**"]);
    for path in ["a.txt", "tmp/x", "src/lib.rs"] {
        assert!(!scope_check(path, &[], &deny).allowed, "{} slipped through", path);
    }
}

#[test]
fn deny_is_monotonic() {
    let allow = globs(&["**/*"]);
    let paths = globs(&["src/a.rs", "docs/b.md", "gen/c.rs"]);
    let mut deny = globs(&["gen/**"]);

    let before = scope_check_all(&paths, &allow, &deny);
    deny.push("docs/**".into());
    let after = scope_check_all(&paths, &allow, &deny);

    for path in &before.denied {
        assert!(after.denied.contains(path), "{} became allowed", path);
    }
    assert!(after.denied.contains(&"docs/b.md".to_string()));
}

#[test]
fn bulk_result_covers_every_input() {
    let allow = globs(&["src/**"]);
    let paths = globs(&["src/ok.rs", "nope.txt"]);
    let result = scope_check_all(&paths, &allow, &[]);
    assert_eq!(result.results.len(), 2);
    assert!(result.results["src/ok.rs"].allowed);
    assert!(!result.results["nope.txt"].allowed);
}

// ===========================================================================
// Event envelopes
// ===========================================================================

#[test]
fn event_kind_tags_are_stable() {
    let cases: Vec<(Event, &str)> = vec![
        (
            Event::TaskStarted {
                task_id: "t".into(),
                project: "p".into(),
                title: "x".into(),
            },
            "task:started",
        ),
        (
            Event::TaskOutput {
                task_id: "t".into(),
                stream: OutputStream::Stderr,
                line: "l".into(),
            },
            "task:output",
        ),
        (
            Event::TaskModelResolved {
                task_id: "t".into(),
                model: "m".into(),
            },
            "task:model_resolved",
        ),
        (
            Event::TaskChunk {
                device_task_id: "dt".into(),
                task_id: "t".into(),
                chunk: "c".into(),
            },
            "task:chunk",
        ),
        (
            Event::DagStarted { dag_id: "d".into() },
            "dag:started",
        ),
        (
            Event::DagNodeWaitingApproval {
                dag_id: "d".into(),
                node_id: "n".into(),
            },
            "dag:node:waiting_approval",
        ),
        (
            Event::DeviceOffline {
                device_id: "dev".into(),
            },
            "device:offline",
        ),
        (
            Event::HgmemStepStart {
                session_id: "s".into(),
                step: 2,
            },
            "hgmem:step:start",
        ),
        (
            Event::SubscriberDropped {
                subscriber_id: "obs".into(),
            },
            "subscriber:dropped",
        ),
    ];
    for (event, tag) in cases {
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], tag);
        // Envelope roundtrips through the wire format.
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}

#[test]
fn events_carry_routing_identifiers() {
    let event = Event::TaskChunk {
        device_task_id: "dt-1".into(),
        task_id: "t-1".into(),
        chunk: "partial".into(),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["device_task_id"], "dt-1");
    assert_eq!(value["task_id"], "t-1");
}

// ===========================================================================
// Broadcaster
// ===========================================================================

fn probe(n: u32) -> Event {
    Event::HgmemStepStart {
        session_id: "s".into(),
        step: n,
    }
}

#[tokio::test]
async fn two_subscribers_both_receive_in_order() {
    let b = Broadcaster::new();
    let mut first = b.subscribe("first");
    let mut second = b.subscribe("second");
    for n in 0..10 {
        b.broadcast(probe(n));
    }
    for n in 0..10 {
        assert_eq!(first.recv().await.unwrap(), probe(n));
        assert_eq!(second.recv().await.unwrap(), probe(n));
    }
}

#[tokio::test]
async fn resubscribe_replaces_channel() {
    let b = Broadcaster::new();
    let mut old = b.subscribe("obs");
    let mut new = b.subscribe("obs");
    assert_eq!(b.subscriber_count(), 1);
    b.broadcast(probe(1));
    assert!(new.try_recv().is_ok());
    assert!(old.try_recv().is_err());
}

#[tokio::test]
async fn producer_never_blocks_on_full_buffer() {
    let b = Broadcaster::with_capacity(1);
    let _stuck = b.subscribe("stuck");
    // Burst far past the buffer; this returns promptly or the test hangs.
    for n in 0..100 {
        b.broadcast(probe(n));
    }
    assert_eq!(b.subscriber_count(), 0);
}

// ===========================================================================
// Artifact values
// ===========================================================================

#[test]
fn artifact_tree_roundtrips_through_json() {
    let source = serde_json::json!({
        "endpoints": [{"path": "/v1/users", "methods": ["GET", "POST"]}],
        "count": 2,
        "stable": true
    });
    let artifact = ArtifactValue::from_json(source.clone());
    assert_eq!(artifact.to_json(), source);

    let persisted = serde_json::to_string(&artifact).unwrap();
    let reloaded: ArtifactValue = serde_json::from_str(&persisted).unwrap();
    assert_eq!(reloaded, artifact);
}

// ===========================================================================
// Task model
// ===========================================================================

#[test]
fn task_wire_shape_omits_empty_optionals() {
    let task = Task::new("owner", "proj", "title", "brief");
    let json = serde_json::to_string(&task).unwrap();
    assert!(!json.contains("failure_reason"));
    assert!(!json.contains("diff"));
    assert!(!json.contains("started_at"));
    assert!(json.contains(r#""status":"pending""#));
}

#[test]
fn task_reload_preserves_output_order() {
    let mut task = Task::new("o", "p", "t", "b");
    for n in 0..5 {
        task.output
            .push(OutputLine::new(OutputStream::Stdout, format!("line {}", n)));
    }
    let json = serde_json::to_string(&task).unwrap();
    let back: Task = serde_json::from_str(&json).unwrap();
    let lines: Vec<&str> = back.output.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(lines, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);
}
