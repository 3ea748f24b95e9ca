//! End-to-end process execution on the in-memory store
//!
//! Run with: cargo test -p bpmflow-engine --test process_execution_test

mod common;

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use bpmflow_engine::prelude::*;
use common::{vars, TestEngine};

// ============================================
// Sequence flows and tasks
// ============================================

#[test_log::test(tokio::test)]
async fn test_user_task_waits_until_completed() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("approval")
            .start_event("start")
            .user_task("review")
            .end_event("end")
            .flow("start", "review")
            .flow("review", "end"),
    );

    let pi = t.start("approval").await.unwrap();
    assert_eq!(t.state(pi).await, ProcessInstanceState::Active);

    let review = t.engine.executions_at(pi, "review").await.unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].state, ExecutionState::Waiting);
    assert_eq!(review[0].parent_id, Some(pi));

    t.complete_with(pi, "review", vars(json!({"approved": true})))
        .await;

    let instance = t.engine.process_instance(pi).await.unwrap().unwrap();
    assert_eq!(instance.state, ProcessInstanceState::Completed);
    assert!(instance.end_time.is_some());
    assert!(t.engine.executions(pi).await.unwrap().is_empty());
    assert_eq!(t.store.execution_count(), 0);

    let types = t.events.types();
    assert_eq!(types.first(), Some(&"process_started"));
    assert_eq!(types.last(), Some(&"process_completed"));
    assert_eq!(t.events.count("task_created"), 1);
}

#[tokio::test]
async fn test_service_task_writes_to_process_scope() {
    let t = TestEngine::with(|b| {
        b.with_delegate_fn("score", |execution| {
            let amount = execution
                .variable("amount")
                .and_then(|v| v.as_i64())
                .unwrap_or_default();
            execution.set_variable("score", amount * 2);
            Ok(())
        })
    });
    t.deploy(
        ProcessDefinitionBuilder::new("scoring")
            .start_event("start")
            .service_task("compute", "score")
            .user_task("check")
            .end_event("end")
            .flow("start", "compute")
            .flow("compute", "check")
            .flow("check", "end"),
    );

    let pi = t
        .start_with(StartProcessInstance::by_key("scoring").with_variables(vars(json!({"amount": 21}))))
        .await
        .unwrap();

    let variables = t.engine.get_variables(pi).await.unwrap();
    assert_eq!(variables.get("score"), Some(&json!(42)));
}

#[tokio::test]
async fn test_failed_start_leaves_nothing_behind() {
    let t = TestEngine::with(|b| {
        b.with_delegate_fn("broken", |_| Err(DelegateError::failure("connection refused")))
    });
    t.deploy(
        ProcessDefinitionBuilder::new("fragile")
            .start_event("start")
            .service_task("call", "broken")
            .end_event("end")
            .flow("start", "call")
            .flow("call", "end"),
    );

    let err = t.start("fragile").await.unwrap_err();

    assert!(matches!(err, EngineError::Delegate { ref delegate, .. } if delegate == "broken"));
    assert_eq!(t.store.process_instance_count(), 0);
    assert_eq!(t.store.execution_count(), 0);
    assert!(t.events.events().is_empty());
}

#[tokio::test]
async fn test_failure_after_a_wait_state_rolls_back_the_whole_step() {
    let t = TestEngine::with(|b| {
        b.with_delegate_fn("charge", |execution| {
            execution.set_variable("charged", true);
            Err(DelegateError::failure("payment gateway timeout"))
        })
    });
    t.deploy(
        ProcessDefinitionBuilder::new("checkout")
            .start_event("start")
            .user_task("review")
            .service_task("charge", "charge")
            .end_event("end")
            .flow("start", "review")
            .flow("review", "charge")
            .flow("charge", "end"),
    );
    let pi = t
        .start_with(
            StartProcessInstance::by_key("checkout").with_variables(vars(json!({"amount": 10}))),
        )
        .await
        .unwrap();
    let review = t.waiting_at(pi, "review").await;

    let snapshot = |engine: &ProcessEngine| {
        let engine = engine.clone();
        async move {
            let mut executions = engine.executions(pi).await.unwrap();
            executions.sort_by_key(|e| e.id);
            (
                engine.process_instance(pi).await.unwrap().unwrap(),
                executions,
                engine.get_variables(pi).await.unwrap(),
            )
        }
    };
    let before = snapshot(&t.engine).await;
    t.events.clear();

    let err = t
        .engine
        .complete_task(review, vars(json!({"approved": true, "amount": 99})))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Delegate { ref delegate, .. } if delegate == "charge"));
    assert_eq!(snapshot(&t.engine).await, before);
    assert_eq!(t.waiting_at(pi, "review").await, review);
    assert_eq!(t.state(pi).await, ProcessInstanceState::Active);
    assert!(t.events.events().is_empty());
}

#[tokio::test]
async fn test_unknown_definition_is_rejected() {
    let t = TestEngine::new();
    let err = t.start("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotFound(_)));
}

// ============================================
// Gateways
// ============================================

#[tokio::test]
async fn test_parallel_fork_and_join() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("fork")
            .start_event("start")
            .parallel_gateway("split")
            .user_task("a")
            .user_task("b")
            .parallel_gateway("join")
            .user_task("after")
            .end_event("end")
            .flow("start", "split")
            .flow("split", "a")
            .flow("split", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "after")
            .flow("after", "end"),
    );

    let pi = t.start("fork").await.unwrap();
    assert_eq!(t.count_at(pi, "a").await, 1);
    assert_eq!(t.count_at(pi, "b").await, 1);

    t.complete(pi, "a").await;
    let parked = t.engine.executions_at(pi, "join").await.unwrap();
    assert_eq!(parked.len(), 1);
    assert!(!parked[0].is_active);
    assert_eq!(t.count_at(pi, "after").await, 0);

    t.complete(pi, "b").await;
    assert_eq!(t.count_at(pi, "join").await, 0);
    assert_eq!(t.count_at(pi, "after").await, 1);

    t.complete(pi, "after").await;
    assert_eq!(t.state(pi).await, ProcessInstanceState::Completed);
}

fn routing() -> ProcessDefinitionBuilder {
    ProcessDefinitionBuilder::new("routing")
        .start_event("start")
        .exclusive_gateway("route")
        .user_task("manual_review")
        .user_task("auto_approve")
        .end_event("end")
        .flow("start", "route")
        .conditional_flow("route", "manual_review", "${amount > 1000}")
        .default_flow("route", "auto_approve")
        .flow("manual_review", "end")
        .flow("auto_approve", "end")
}

#[tokio::test]
async fn test_exclusive_gateway_takes_matching_guard() {
    let t = TestEngine::new();
    t.deploy(routing());

    let pi = t
        .start_with(StartProcessInstance::by_key("routing").with_variables(vars(json!({"amount": 1200}))))
        .await
        .unwrap();

    assert_eq!(t.count_at(pi, "manual_review").await, 1);
    assert_eq!(t.count_at(pi, "auto_approve").await, 0);
}

#[tokio::test]
async fn test_exclusive_gateway_falls_back_to_default() {
    let t = TestEngine::new();
    t.deploy(routing());

    let pi = t
        .start_with(StartProcessInstance::by_key("routing").with_variables(vars(json!({"amount": 10}))))
        .await
        .unwrap();

    assert_eq!(t.count_at(pi, "manual_review").await, 0);
    assert_eq!(t.count_at(pi, "auto_approve").await, 1);
}

#[tokio::test]
async fn test_exclusive_gateway_without_way_out_fails() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("dead_end")
            .start_event("start")
            .exclusive_gateway("route")
            .end_event("end")
            .flow("start", "route")
            .conditional_flow("route", "end", "${amount > 1000}"),
    );

    let err = t
        .start_with(StartProcessInstance::by_key("dead_end").with_variables(vars(json!({"amount": 1}))))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Definition(_)));
    assert_eq!(t.store.process_instance_count(), 0);
}

fn inclusive() -> ProcessDefinitionBuilder {
    ProcessDefinitionBuilder::new("inclusive")
        .start_event("start")
        .inclusive_gateway("split")
        .user_task("a")
        .user_task("b")
        .inclusive_gateway("join")
        .user_task("after")
        .end_event("end")
        .flow("start", "split")
        .conditional_flow("split", "a", "${a}")
        .conditional_flow("split", "b", "${b}")
        .flow("a", "join")
        .flow("b", "join")
        .flow("join", "after")
        .flow("after", "end")
}

#[tokio::test]
async fn test_inclusive_join_with_single_branch() {
    let t = TestEngine::new();
    t.deploy(inclusive());

    let pi = t
        .start_with(
            StartProcessInstance::by_key("inclusive").with_variables(vars(json!({"a": true, "b": false}))),
        )
        .await
        .unwrap();
    assert_eq!(t.count_at(pi, "a").await, 1);
    assert_eq!(t.count_at(pi, "b").await, 0);

    t.complete(pi, "a").await;
    assert_eq!(t.count_at(pi, "after").await, 1);
}

#[tokio::test]
async fn test_inclusive_join_waits_for_reachable_branches() {
    let t = TestEngine::new();
    t.deploy(inclusive());

    let pi = t
        .start_with(
            StartProcessInstance::by_key("inclusive").with_variables(vars(json!({"a": true, "b": true}))),
        )
        .await
        .unwrap();

    t.complete(pi, "a").await;
    assert_eq!(t.count_at(pi, "join").await, 1);
    assert_eq!(t.count_at(pi, "after").await, 0);

    t.complete(pi, "b").await;
    assert_eq!(t.count_at(pi, "join").await, 0);
    assert_eq!(t.count_at(pi, "after").await, 1);
}

// ============================================
// Business errors
// ============================================

#[tokio::test]
async fn test_explicit_error_code_beats_catch_all() {
    let t = TestEngine::with(|b| {
        b.with_delegate_fn("charge", |_| Err(DelegateError::bpmn("E1", "card declined")))
    });
    t.deploy(
        ProcessDefinitionBuilder::new("payment")
            .start_event("start")
            .service_task("charge", "charge")
            .error_boundary("catch_all", "charge", None)
            .error_boundary("catch_e1", "charge", Some("E1"))
            .user_task("generic_failure")
            .user_task("declined")
            .end_event("end")
            .flow("start", "charge")
            .flow("charge", "end")
            .flow("catch_all", "generic_failure")
            .flow("catch_e1", "declined"),
    );

    let pi = t.start("payment").await.unwrap();

    assert_eq!(t.count_at(pi, "declined").await, 1);
    assert_eq!(t.count_at(pi, "generic_failure").await, 0);
    assert!(t.events.events().iter().any(|e| matches!(
        e,
        EngineEvent::ErrorCaught { error_code, handler_id, .. }
            if error_code == "E1" && handler_id == "catch_e1"
    )));
}

#[tokio::test]
async fn test_event_sub_process_beats_boundary_on_same_level() {
    let t = TestEngine::with(|b| {
        b.with_delegate_fn("charge", |_| Err(DelegateError::bpmn("E1", "card declined")))
    });
    t.deploy(
        ProcessDefinitionBuilder::new("payment")
            .start_event("start")
            .service_task("charge", "charge")
            .error_boundary("on_charge", "charge", Some("E1"))
            .end_event("boundary_end")
            .end_event("end")
            .flow("start", "charge")
            .flow("charge", "end")
            .flow("on_charge", "boundary_end")
            .event_sub_process("compensate", |b| {
                b.event_start(
                    "on_error",
                    EventDefinition::Error {
                        code: Some("E1".to_string()),
                        precedence: 0,
                    },
                    true,
                )
                .user_task("refund")
                .end_event("compensated")
                .flow("on_error", "refund")
                .flow("refund", "compensated")
            }),
    );

    let pi = t.start("payment").await.unwrap();

    assert_eq!(t.state(pi).await, ProcessInstanceState::Active);
    assert_eq!(t.count_at(pi, "refund").await, 1);
    assert_eq!(t.count_at(pi, "charge").await, 0);

    t.complete(pi, "refund").await;
    assert_eq!(t.state(pi).await, ProcessInstanceState::Completed);
}

#[tokio::test]
async fn test_error_end_event_caught_on_sub_process_boundary() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("nested")
            .start_event("start")
            .sub_process("sub", |b| {
                b.start_event("sub_start")
                    .error_end_event("fail", "E_SUB")
                    .flow("sub_start", "fail")
            })
            .error_boundary("on_sub_error", "sub", Some("E_SUB"))
            .user_task("recover")
            .end_event("end")
            .flow("start", "sub")
            .flow("sub", "end")
            .flow("on_sub_error", "recover")
            .flow("recover", "end"),
    );

    let pi = t.start("nested").await.unwrap();

    assert_eq!(t.count_at(pi, "recover").await, 1);
    assert_eq!(t.count_at(pi, "sub").await, 0);
}

#[tokio::test]
async fn test_unhandled_business_error_rolls_back() {
    let t = TestEngine::with(|b| {
        b.with_delegate_fn("charge", |_| Err(DelegateError::bpmn("E9", "unexpected")))
    });
    t.deploy(
        ProcessDefinitionBuilder::new("payment")
            .start_event("start")
            .service_task("charge", "charge")
            .error_boundary("catch_e1", "charge", Some("E1"))
            .end_event("end")
            .end_event("handled")
            .flow("start", "charge")
            .flow("charge", "end")
            .flow("catch_e1", "handled"),
    );

    let err = t.start("payment").await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::UnhandledEvent { kind: UnhandledKind::BusinessError, ref name, .. } if name == "E9"
    ));
    assert_eq!(t.store.process_instance_count(), 0);
    assert!(t.events.events().is_empty());
}

// ============================================
// Terminate and delete
// ============================================

#[tokio::test]
async fn test_terminate_end_event_ends_every_path() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("kill_switch")
            .start_event("start")
            .parallel_gateway("split")
            .user_task("work")
            .terminate_end_event("kill")
            .flow("start", "split")
            .flow("split", "work")
            .flow("split", "kill"),
    );

    let pi = t.start("kill_switch").await.unwrap();

    let instance = t.engine.process_instance(pi).await.unwrap().unwrap();
    assert_eq!(instance.state, ProcessInstanceState::Terminated);
    assert_eq!(instance.end_reason.as_deref(), Some("terminate end event 'kill'"));
    assert!(t.engine.executions(pi).await.unwrap().is_empty());
    assert_eq!(t.events.count("process_terminated"), 1);
}

#[tokio::test]
async fn test_delete_process_instance_removes_runtime_state() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("waiting")
            .start_event("start")
            .user_task("review")
            .boundary_event(
                "deadline",
                "review",
                EventDefinition::Timer {
                    timer: TimerDefinition::AfterMillis(60_000),
                },
                true,
            )
            .end_event("end")
            .end_event("late")
            .flow("start", "review")
            .flow("review", "end")
            .flow("deadline", "late"),
    );
    let pi = t.start("waiting").await.unwrap();
    assert_eq!(t.store.job_count(), 1);

    t.engine
        .delete_process_instance(pi, Some("cancelled by operator".to_string()))
        .await
        .unwrap();

    let instance = t.engine.process_instance(pi).await.unwrap().unwrap();
    assert_eq!(instance.state, ProcessInstanceState::Terminated);
    assert_eq!(instance.end_reason.as_deref(), Some("cancelled by operator"));
    assert_eq!(t.store.execution_count(), 0);
    assert_eq!(t.store.job_count(), 0);

    let again = t.engine.delete_process_instance(pi, None).await.unwrap_err();
    assert!(matches!(again, EngineError::IllegalState(_)));
}

// ============================================
// Messages
// ============================================

fn order() -> ProcessDefinitionBuilder {
    ProcessDefinitionBuilder::new("order")
        .start_event("start")
        .message_catch("await_payment", "payment")
        .user_task("ship")
        .end_event("end")
        .flow("start", "await_payment")
        .flow("await_payment", "ship")
        .flow("ship", "end")
}

#[tokio::test]
async fn test_message_correlates_by_business_key() {
    let t = TestEngine::new();
    t.deploy(order());
    let first = t
        .start_with(StartProcessInstance::by_key("order").with_business_key("o-1"))
        .await
        .unwrap();
    let second = t
        .start_with(StartProcessInstance::by_key("order").with_business_key("o-2"))
        .await
        .unwrap();

    let correlated = t
        .engine
        .correlate_message(
            CorrelateMessage::new("payment")
                .with_business_key("o-1")
                .with_payload(vars(json!({"paid": 42}))),
        )
        .await
        .unwrap();

    assert_eq!(correlated, first);
    assert_eq!(t.count_at(first, "ship").await, 1);
    assert_eq!(t.count_at(second, "await_payment").await, 1);
    assert!(t.engine.subscriptions(first).await.unwrap().is_empty());

    let variables = t.engine.get_variables(first).await.unwrap();
    assert_eq!(variables.get("paid"), Some(&json!(42)));
}

#[tokio::test]
async fn test_trigger_event_resumes_waiting_execution() {
    let t = TestEngine::new();
    t.deploy(order());
    let pi = t.start("order").await.unwrap();
    let waiting = t.waiting_at(pi, "await_payment").await;

    t.engine
        .trigger_event(waiting, "payment", Some(vars(json!({"paid": 7}))))
        .await
        .unwrap();

    assert_eq!(t.count_at(pi, "ship").await, 1);
    assert_eq!(
        t.engine.get_variables(pi).await.unwrap().get("paid"),
        Some(&json!(7))
    );

    // Nothing listens for the event any more
    let shipping = t.waiting_at(pi, "ship").await;
    let err = t
        .engine
        .trigger_event(shipping, "payment", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnhandledEvent { .. }));
    assert_eq!(t.count_at(pi, "ship").await, 1);
}

#[tokio::test]
async fn test_undelivered_event_reports_the_subscription_kind() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("watch")
            .start_event("start")
            .parallel_gateway("split")
            .signal_catch("alarm", "fire")
            .user_task("review")
            .end_event("end_alarm")
            .end_event("end_review")
            .flow("start", "split")
            .flow("split", "alarm")
            .flow("split", "review")
            .flow("alarm", "end_alarm")
            .flow("review", "end_review"),
    );
    let pi = t.start("watch").await.unwrap();
    let review = t.waiting_at(pi, "review").await;

    // The signal listener sits on a sibling branch, out of reach of the task
    let err = t
        .engine
        .trigger_event(review, "fire", None)
        .await
        .unwrap_err();
    match err {
        EngineError::UnhandledEvent { kind, name, .. } => {
            assert_eq!(kind, UnhandledKind::Signal);
            assert_eq!(name, "fire");
        }
        other => panic!("expected an unhandled signal, got {other:?}"),
    }

    let err = t
        .engine
        .trigger_event(review, "unknown", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnhandledEvent {
            kind: UnhandledKind::Message,
            ..
        }
    ));
    assert_eq!(t.count_at(pi, "alarm").await, 1);
}

#[tokio::test]
async fn test_message_ambiguity_and_absence_are_errors() {
    let t = TestEngine::new();
    t.deploy(order());
    t.start("order").await.unwrap();
    t.start("order").await.unwrap();

    let ambiguous = t
        .engine
        .correlate_message(CorrelateMessage::new("payment"))
        .await
        .unwrap_err();
    assert!(matches!(ambiguous, EngineError::IllegalState(_)));

    let nobody = t
        .engine
        .correlate_message(CorrelateMessage::new("refund"))
        .await
        .unwrap_err();
    assert!(matches!(
        nobody,
        EngineError::UnhandledEvent { kind: UnhandledKind::Message, .. }
    ));
}

#[tokio::test]
async fn test_event_based_gateway_first_event_wins() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("race")
            .start_event("start")
            .event_based_gateway("wait")
            .message_catch("paid", "payment")
            .timer_catch("expired", TimerDefinition::AfterMillis(5_000))
            .user_task("fulfil")
            .user_task("remind")
            .end_event("end")
            .flow("start", "wait")
            .flow("wait", "paid")
            .flow("wait", "expired")
            .flow("paid", "fulfil")
            .flow("expired", "remind")
            .flow("fulfil", "end")
            .flow("remind", "end"),
    );
    let pi = t.start("race").await.unwrap();
    assert_eq!(t.engine.subscriptions(pi).await.unwrap().len(), 1);
    assert_eq!(t.store.job_count(), 1);

    t.engine
        .correlate_message(CorrelateMessage::new("payment").with_process_instance(pi))
        .await
        .unwrap();

    assert_eq!(t.count_at(pi, "fulfil").await, 1);
    assert!(t.engine.subscriptions(pi).await.unwrap().is_empty());
    assert_eq!(t.store.job_count(), 0);
}

// ============================================
// Signals
// ============================================

fn alarm() -> ProcessDefinitionBuilder {
    ProcessDefinitionBuilder::new("alarm")
        .start_event("start")
        .signal_catch("wait", "fire_alarm")
        .end_event("end")
        .flow("start", "wait")
        .flow("wait", "end")
}

#[tokio::test]
async fn test_signal_broadcast_reaches_every_listener() {
    let t = TestEngine::new();
    t.deploy(alarm());
    let first = t.start("alarm").await.unwrap();
    let second = t.start("alarm").await.unwrap();

    let fired = t
        .engine
        .signal_event_received(SignalEventReceived::new("fire_alarm"))
        .await
        .unwrap();

    assert_eq!(fired, 2);
    assert_eq!(t.state(first).await, ProcessInstanceState::Completed);
    assert_eq!(t.state(second).await, ProcessInstanceState::Completed);

    let again = t
        .engine
        .signal_event_received(SignalEventReceived::new("fire_alarm"))
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_instance_scoped_signal_without_listener_fails() {
    let t = TestEngine::new();
    t.deploy(alarm());
    t.deploy(
        ProcessDefinitionBuilder::new("quiet")
            .start_event("start")
            .user_task("idle")
            .end_event("end")
            .flow("start", "idle")
            .flow("idle", "end"),
    );
    let listening = t.start("alarm").await.unwrap();
    let quiet = t.start("quiet").await.unwrap();

    let err = t
        .engine
        .signal_event_received(SignalEventReceived::new("fire_alarm").with_process_instance(quiet))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::UnhandledEvent { kind: UnhandledKind::Signal, process_instance_id, .. }
            if process_instance_id == quiet
    ));
    assert_eq!(t.state(listening).await, ProcessInstanceState::Active);
}

#[tokio::test]
async fn test_non_interrupting_signal_boundary_keeps_task() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("notify")
            .start_event("start")
            .user_task("work")
            .boundary_event(
                "on_update",
                "work",
                EventDefinition::Signal {
                    name: "update".to_string(),
                },
                false,
            )
            .user_task("acknowledge")
            .end_event("end")
            .end_event("ack_end")
            .flow("start", "work")
            .flow("work", "end")
            .flow("on_update", "acknowledge")
            .flow("acknowledge", "ack_end"),
    );
    let pi = t.start("notify").await.unwrap();

    let fired = t
        .engine
        .signal_event_received(SignalEventReceived::new("update"))
        .await
        .unwrap();

    assert_eq!(fired, 1);
    assert_eq!(t.count_at(pi, "work").await, 1);
    assert_eq!(t.count_at(pi, "acknowledge").await, 1);
    assert_eq!(t.engine.subscriptions(pi).await.unwrap().len(), 1);
}

// ============================================
// Timers
// ============================================

#[tokio::test]
async fn test_timer_boundary_fires_only_when_due() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("escalation")
            .start_event("start")
            .user_task("review")
            .boundary_event(
                "deadline",
                "review",
                EventDefinition::Timer {
                    timer: TimerDefinition::AfterMillis(10_000),
                },
                true,
            )
            .user_task("escalated")
            .end_event("end")
            .flow("start", "review")
            .flow("review", "end")
            .flow("deadline", "escalated")
            .flow("escalated", "end"),
    );
    let pi = t.start("escalation").await.unwrap();

    let timers = t
        .engine
        .jobs(&JobQuery::default().with_process_instance(pi))
        .await
        .unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].state, JobState::Timer);
    assert_eq!(timers[0].element_id.as_deref(), Some("deadline"));

    let executor = t.engine.async_executor(AsyncExecutorConfig::new().with_lock_owner("node-1"));

    t.clock.advance(Duration::seconds(9));
    assert_eq!(executor.run_acquisition_cycle().await.unwrap(), 0);
    assert_eq!(t.count_at(pi, "review").await, 1);

    t.clock.advance(Duration::seconds(2));
    assert_eq!(executor.run_acquisition_cycle().await.unwrap(), 1);
    assert_eq!(t.count_at(pi, "review").await, 0);
    assert_eq!(t.count_at(pi, "escalated").await, 1);
    assert_eq!(t.store.job_count(), 0);
}

#[tokio::test]
async fn test_completing_task_cancels_its_timer() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("escalation")
            .start_event("start")
            .user_task("review")
            .boundary_event(
                "deadline",
                "review",
                EventDefinition::Timer {
                    timer: TimerDefinition::AfterMillis(10_000),
                },
                true,
            )
            .end_event("end")
            .end_event("late")
            .flow("start", "review")
            .flow("review", "end")
            .flow("deadline", "late"),
    );
    let pi = t.start("escalation").await.unwrap();
    assert_eq!(t.store.job_count(), 1);

    t.complete(pi, "review").await;

    assert_eq!(t.state(pi).await, ProcessInstanceState::Completed);
    assert_eq!(t.store.job_count(), 0);
}

// ============================================
// Variables
// ============================================

#[tokio::test]
async fn test_local_variables_shadow_process_variables() {
    let t = TestEngine::new();
    t.deploy(
        ProcessDefinitionBuilder::new("scoped")
            .start_event("start")
            .user_task("edit")
            .end_event("end")
            .flow("start", "edit")
            .flow("edit", "end"),
    );
    let pi = t
        .start_with(StartProcessInstance::by_key("scoped").with_variables(vars(json!({"status": "new"}))))
        .await
        .unwrap();
    let edit = t.waiting_at(pi, "edit").await;

    t.engine
        .set_variables_local(edit, vars(json!({"status": "draft"})))
        .await
        .unwrap();
    t.engine
        .set_variables(edit, vars(json!({"owner": "ops"})))
        .await
        .unwrap();

    let seen_from_task = t.engine.get_variables(edit).await.unwrap();
    assert_eq!(seen_from_task.get("status"), Some(&json!("draft")));
    assert_eq!(seen_from_task.get("owner"), Some(&json!("ops")));

    let process = t.engine.get_variables(pi).await.unwrap();
    assert_eq!(process.get("status"), Some(&json!("new")));
    assert_eq!(process.get("owner"), Some(&json!("ops")));
}

#[tokio::test]
async fn test_listener_sees_events_in_commit_order() {
    let recorder = Arc::new(common::EventRecorder::default());
    let t = TestEngine::with(|b| b.with_event_listener(recorder.clone()));
    t.deploy(
        ProcessDefinitionBuilder::new("straight")
            .start_event("start")
            .end_event("end")
            .flow("start", "end"),
    );

    let pi = t.start("straight").await.unwrap();

    assert_eq!(t.state(pi).await, ProcessInstanceState::Completed);
    assert_eq!(recorder.types(), t.events.types());
    assert_eq!(recorder.count("process_completed"), 1);
}
