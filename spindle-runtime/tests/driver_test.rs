//! Driver tests against a recording host environment.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spindle_core::environment::{WorkflowEnvironment, WorkflowInfo};
use spindle_core::serialization::JsonCodec;
use spindle_core::{WorkflowContext, WorkflowRegistry};
use spindle_runtime::{DriverError, SyncWorkflowDefinition, WorkflowDefinition};

/// Records completions and holds the driver's cancel callback, playing
/// the part of the decision-task engine.
#[derive(Default)]
struct RecordingEnvironment {
    completions: Mutex<Vec<(Option<Bytes>, Option<String>)>>,
    cancel_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl RecordingEnvironment {
    fn request_cancel(&self) {
        let callback = self.cancel_callback.lock();
        if let Some(callback) = &*callback {
            callback();
        }
    }

    fn completions(&self) -> Vec<(Option<Bytes>, Option<String>)> {
        self.completions.lock().clone()
    }
}

impl WorkflowEnvironment for RecordingEnvironment {
    fn workflow_info(&self) -> WorkflowInfo {
        WorkflowInfo {
            domain: "unit".to_string(),
            task_list: "default".to_string(),
            execution_start_to_close_timeout: Duration::from_secs(60),
            task_start_to_close_timeout: Duration::from_secs(10),
        }
    }

    fn register_cancel(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.cancel_callback.lock() = Some(callback);
    }

    fn complete(&self, result: Option<Bytes>, error: Option<anyhow::Error>) {
        self.completions
            .lock()
            .push((result, error.map(|e| e.to_string())));
    }
}

fn json_input<T: serde::Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

fn registry() -> WorkflowRegistry {
    WorkflowRegistry::with_codec(Arc::new(JsonCodec))
        .register("double", |_ctx: &WorkflowContext, input: i32| Ok(input * 2))
        .register("decline", |_ctx: &WorkflowContext, _input: i32| {
            Err::<i32, _>(anyhow::anyhow!("declined by policy"))
        })
        .register("explode", |_ctx: &WorkflowContext, _input: i32| -> anyhow::Result<i32> {
            panic!("kaboom")
        })
        .register("wait_for_cancel", |ctx: &WorkflowContext, _input: i32| {
            let done = ctx.done().expect("driver installs a cancel scope");
            let (_, more) = done.receive_with_more_flag(ctx);
            assert!(!more);
            Ok(ctx.is_cancelled())
        })
        .register("wait_for_mail", |ctx: &WorkflowContext, _input: i32| {
            let inbox = ctx.new_named_channel::<i32>("inbox");
            Ok(inbox.receive(ctx))
        })
        .register("whereami", |ctx: &WorkflowContext, _input: i32| {
            Ok(ctx.workflow_info().domain)
        })
        .build()
}

#[test]
fn completes_with_the_workflow_result() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition = SyncWorkflowDefinition::from_registry(&registry(), "double").unwrap();

    definition.execute(env.clone(), json_input(&21));
    // No user code runs before the first decision task.
    assert!(env.completions().is_empty());

    definition.on_decision_task_started();
    let completions = env.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0.as_deref(), Some(&b"42"[..]));
    assert!(completions[0].1.is_none());
}

#[test]
fn completes_with_the_workflow_error() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition = SyncWorkflowDefinition::from_registry(&registry(), "decline").unwrap();

    definition.execute(env.clone(), json_input(&0));
    definition.on_decision_task_started();

    let completions = env.completions();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].0.is_none());
    assert_eq!(completions[0].1.as_deref(), Some("declined by policy"));
}

#[test]
fn workflow_panic_completes_with_an_error() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition = SyncWorkflowDefinition::from_registry(&registry(), "explode").unwrap();

    definition.execute(env.clone(), json_input(&0));
    definition.on_decision_task_started();

    let completions = env.completions();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].0.is_none());
    assert_eq!(completions[0].1.as_deref(), Some("kaboom"));
}

#[test]
fn cancellation_between_ticks_wakes_the_workflow() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition =
        SyncWorkflowDefinition::from_registry(&registry(), "wait_for_cancel").unwrap();

    definition.execute(env.clone(), json_input(&0));
    definition.on_decision_task_started();
    // Still blocked on the done channel.
    assert!(env.completions().is_empty());

    env.request_cancel();
    env.request_cancel();
    definition.on_decision_task_started();

    let completions = env.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0.as_deref(), Some(&b"true"[..]));
}

#[test]
fn cancellation_before_the_first_tick_is_honored() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition =
        SyncWorkflowDefinition::from_registry(&registry(), "wait_for_cancel").unwrap();

    definition.execute(env.clone(), json_input(&0));
    // The cancel request lands before the root coroutine has installed
    // its cancel handle; the driver must remember and replay it.
    env.request_cancel();
    definition.on_decision_task_started();

    let completions = env.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0.as_deref(), Some(&b"true"[..]));
}

#[test]
fn stack_trace_reports_blocked_workflows() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition =
        SyncWorkflowDefinition::from_registry(&registry(), "wait_for_mail").unwrap();

    definition.execute(env.clone(), json_input(&0));
    definition.on_decision_task_started();
    assert!(env.completions().is_empty());

    let trace = definition.stack_trace();
    assert!(trace.contains("[blocked on inbox.Receive]"));

    definition.close();
}

#[test]
fn workflow_reads_environment_metadata() {
    let env = Arc::new(RecordingEnvironment::default());
    let mut definition = SyncWorkflowDefinition::from_registry(&registry(), "whereami").unwrap();

    definition.execute(env.clone(), json_input(&0));
    definition.on_decision_task_started();

    let completions = env.completions();
    assert_eq!(completions[0].0.as_deref(), Some(&b"\"unit\""[..]));
}

#[test]
fn unknown_workflow_names_are_rejected() {
    let result = SyncWorkflowDefinition::from_registry(&registry(), "missing");
    assert!(matches!(result, Err(DriverError::NotRegistered(name)) if name == "missing"));
}
