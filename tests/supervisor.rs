//! Supervisor integration tests
//!
//! Full startup with mock inputs, outputs, tools and a scripted reasoner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchboard::bus::{Envelope, LifecycleKind};
use switchboard::config::{Config, ModuleSection};
use switchboard::reasoning::EchoReasoner;
use switchboard::registry::ModuleKind;
use switchboard::{Registries, Supervisor};

mod common;
use common::{
    MockToolFactory, RecordingOutputFactory, ScriptedInputFactory, ScriptedReasoner, call, module,
    next,
};

fn registries() -> (Registries, tokio::sync::mpsc::UnboundedReceiver<Envelope>, MockToolFactory) {
    let mut registries = Registries::empty();
    let (outputs, rx) = RecordingOutputFactory::new();
    let tools = MockToolFactory::default();
    registries
        .inputs
        .register("scripted", Arc::new(ScriptedInputFactory))
        .unwrap();
    registries
        .outputs
        .register("recording", Arc::new(outputs))
        .unwrap();
    registries.tools.register("lamp", Arc::new(tools.clone())).unwrap();
    (registries, rx, tools)
}

async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for output")
        .expect("output channel closed")
}

#[tokio::test]
async fn test_end_to_end_lamp_request() {
    let (registries, mut rx, tools) = registries();
    let config = Config {
        inputs: ModuleSection::default().with(
            "terminal",
            module("scripted", json!({"lines": ["turn on bedroom lamp"]})),
        ),
        outputs: ModuleSection::default().with("speaker", module("recording", json!({}))),
        tools: ModuleSection::default().with("bedroom", module("lamp", json!({}))),
        ..Config::default()
    };
    let reasoner = ScriptedReasoner::tool_then_answer(vec![call(
        "bedroom",
        json!({"action": "power", "command": "on"}),
    )]);

    let system = Supervisor::new(config, registries)
        .with_reasoner(Arc::new(reasoner))
        .start()
        .await
        .unwrap();

    let report = system.report();
    assert!(report.is_started(ModuleKind::Input, "terminal"));
    assert!(report.is_started(ModuleKind::Output, "speaker"));
    assert!(report.is_started(ModuleKind::Tool, "bedroom"));
    assert!(report.disabled.is_empty());

    let response = recv(&mut rx).await;
    assert_eq!(response.target.as_deref(), Some("terminal"));
    assert_eq!(response.payload.text(), Some("Done: bedroom turned on"));
    assert_eq!(tools.log.entries(), ["start bedroom on", "end bedroom on"]);

    system.shutdown().await;
}

#[tokio::test]
async fn test_failed_modules_are_disabled_not_fatal() {
    let (registries, _rx, _tools) = registries();
    let config = Config {
        inputs: ModuleSection::default()
            .with("mystery", module("carrier_pigeon", json!({})))
            .with("listener", module("scripted", json!({"fail_build": true}))),
        outputs: ModuleSection::default().with("speaker", module("recording", json!({}))),
        tools: ModuleSection::default()
            .with("amp", module("lamp", json!({"gpio_pin": 18})))
            .with("light", module("lamp", json!({"gpio_pin": 18})))
            .with("broken", module("lamp", json!({"fail_build": true}))),
        ..Config::default()
    };

    let system = Supervisor::new(config, registries)
        .with_reasoner(Arc::new(ScriptedReasoner::new(|_, _| {
            Ok(switchboard::Decision::FinalAnswer("ok".into()))
        })))
        .start()
        .await
        .unwrap();

    let report = system.report();
    // Instances are started in name order, so `amp` wins the pin
    assert!(report.is_started(ModuleKind::Tool, "amp"));
    assert!(
        report
            .disabled_reason(ModuleKind::Tool, "light")
            .unwrap()
            .contains("gpio:18")
    );
    assert!(
        report
            .disabled_reason(ModuleKind::Tool, "broken")
            .unwrap()
            .contains("device unreachable")
    );
    assert!(
        report
            .disabled_reason(ModuleKind::Input, "mystery")
            .unwrap()
            .contains("carrier_pigeon")
    );
    assert_eq!(
        report.disabled_reason(ModuleKind::Input, "listener"),
        Some("construction of listener failed: bus error: microphone busy")
    );
    assert!(report.is_started(ModuleKind::Output, "speaker"));

    system.shutdown().await;
}

#[tokio::test]
async fn test_disabled_sections_and_instances() {
    let (registries, _rx, _tools) = registries();
    let mut quiet = module("lamp", json!({}));
    quiet.enabled = false;
    let config = Config {
        outputs: ModuleSection {
            enabled: false,
            ..ModuleSection::default().with("speaker", module("recording", json!({})))
        },
        tools: ModuleSection::default()
            .with("quiet", quiet)
            .with("loud", module("lamp", json!({}))),
        ..Config::default()
    };

    let report = Supervisor::new(config, registries)
        .with_reasoner(Arc::new(EchoReasoner))
        .check();

    assert_eq!(
        report.skipped_reason(ModuleKind::Output, "speaker"),
        Some("all outputs disabled")
    );
    assert_eq!(
        report.skipped_reason(ModuleKind::Tool, "quiet"),
        Some("disabled in configuration")
    );
    assert!(report.is_started(ModuleKind::Tool, "loud"));
    // Switching a module off is not a failure
    assert!(report.disabled.is_empty());
    assert!(report.is_healthy());
}

#[tokio::test]
async fn test_check_fails_only_for_broken_enabled_instances() {
    let (registries, _rx, _tools) = registries();
    let mut quiet = module("lamp", json!({"brightnes": 3}));
    quiet.enabled = false;
    let config = Config {
        tools: ModuleSection::default()
            .with("quiet", quiet)
            .with("typo", module("lamp", json!({"brightnes": 3}))),
        ..Config::default()
    };

    let report = Supervisor::new(config, registries)
        .with_reasoner(Arc::new(EchoReasoner))
        .check();

    assert!(report.skipped_reason(ModuleKind::Tool, "quiet").is_some());
    assert!(report.disabled_reason(ModuleKind::Tool, "quiet").is_none());
    assert!(report.disabled_reason(ModuleKind::Tool, "typo").is_some());
    assert!(!report.is_healthy());
}

#[tokio::test]
async fn test_example_configuration_checks_clean() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.yaml");
    let config = Config::load(Some(path.as_path())).unwrap();

    let report = Supervisor::new(config, Registries::builtin().unwrap())
        .with_reasoner(Arc::new(EchoReasoner))
        .check();

    assert!(report.is_healthy(), "{report}");
    assert!(report.skipped_reason(ModuleKind::Input, "web").is_some());
    assert!(report.skipped_reason(ModuleKind::Input, "discord").is_some());
    assert!(report.skipped_reason(ModuleKind::Output, "tts").is_some());
    assert!(report.is_started(ModuleKind::Tool, "amp"));
}

#[tokio::test]
async fn test_check_constructs_nothing() {
    let (registries, _rx, tools) = registries();
    let config = Config {
        tools: ModuleSection::default()
            .with("bedroom", module("lamp", json!({})))
            .with("typo", module("lamp", json!({"brightnes": 3}))),
        ..Config::default()
    };

    let report = Supervisor::new(config, registries).check();

    assert!(report.is_started(ModuleKind::Tool, "bedroom"));
    assert!(report.disabled_reason(ModuleKind::Tool, "typo").is_some());
    assert_eq!(tools.builds(), 0);
}

#[tokio::test]
async fn test_panicking_input_is_isolated() {
    let (registries, mut rx, _tools) = registries();
    let config = Config {
        inputs: ModuleSection::default()
            .with("bomb", module("scripted", json!({"panic": true})))
            .with("terminal", module("scripted", json!({"lines": ["still there?"]}))),
        outputs: ModuleSection::default().with("speaker", module("recording", json!({}))),
        ..Config::default()
    };

    let system = Supervisor::new(config, registries)
        .with_reasoner(Arc::new(ScriptedReasoner::new(|input, _| {
            Ok(switchboard::Decision::FinalAnswer(format!("yes: {input}")))
        })))
        .start()
        .await
        .unwrap();
    let mut errors = system
        .bus()
        .subscribe("errors", |e: &Envelope| e.is_lifecycle(LifecycleKind::Error))
        .unwrap();

    let response = recv(&mut rx).await;
    assert_eq!(response.payload.text(), Some("yes: still there?"));

    let error = next(&mut errors).await;
    assert!(error.payload.text().unwrap().contains("bomb"));

    system.shutdown().await;
}

#[tokio::test]
async fn test_stop_request_ends_wait() {
    let (registries, _rx, _tools) = registries();
    let mut system = Supervisor::new(Config::default(), registries)
        .with_reasoner(Arc::new(ScriptedReasoner::new(|_, _| {
            Ok(switchboard::Decision::FinalAnswer(String::new()))
        })))
        .start()
        .await
        .unwrap();

    system
        .bus()
        .publish(Envelope::lifecycle("terminal", LifecycleKind::Stop, None));
    let origin = tokio::time::timeout(Duration::from_secs(5), system.wait_for_stop())
        .await
        .unwrap();
    assert_eq!(origin.as_deref(), Some("terminal"));

    system.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_tool_claims() {
    let (registries, _rx, _tools) = registries();
    let config = Config {
        tools: ModuleSection::default().with("amp", module("lamp", json!({"gpio_pin": 18}))),
        ..Config::default()
    };

    let system = Supervisor::new(config, registries)
        .with_reasoner(Arc::new(ScriptedReasoner::new(|_, _| {
            Ok(switchboard::Decision::FinalAnswer(String::new()))
        })))
        .start()
        .await
        .unwrap();
    let tools = Arc::clone(system.tools());
    assert_eq!(tools.claims().await.len(), 1);

    system.shutdown().await;
    assert!(tools.claims().await.is_empty());
    assert!(tools.names().await.is_empty());
}

#[tokio::test]
async fn test_zero_bus_capacity_is_fatal() {
    let (registries, _rx, _tools) = registries();
    let mut config = Config::default();
    config.bus.capacity = 0;

    let err = Supervisor::new(config, registries).start().await.unwrap_err();
    assert!(matches!(err, switchboard::Error::ConfigValidation(_)));
}
