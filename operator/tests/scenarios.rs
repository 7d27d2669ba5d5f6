//! End-to-end scenarios built from the crate's pure, public surface:
//! schedule evaluation, stage planning, and admission validation. None of
//! these touch a real API server, so they exercise the logic a cluster
//! would drive without needing one.

use chrono::{TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use hibernator_operator::planner::{self};
use hibernator_operator::schedule::{self, ExceptionInput, ScheduleState};
use hibernator_operator::webhook::validate::{validate_exception, validate_plan};
use hibernator_types::{
    DagEdge, Exception, ExceptionPhase, ExceptionSpec, ExceptionType, ExecutionStrategy, Operation, Plan, PlanPhase,
    PlanSpec, PlanStatus, ScheduleSpec, TargetSpec, Weekday,
};

fn target(name: &str) -> TargetSpec {
    TargetSpec {
        name: name.to_string(),
        target_type: "rds".to_string(),
        connector_ref: "conn".to_string(),
        parameters: Default::default(),
    }
}

fn nightly_plan(strategy: ExecutionStrategy, targets: Vec<TargetSpec>) -> Plan {
    Plan::new(
        "nightly",
        PlanSpec {
            schedule: ScheduleSpec {
                timezone: "UTC".to_string(),
                windows: vec![hibernator_types::OffHourWindow {
                    start: "20:00".to_string(),
                    end: "06:00".to_string(),
                    days_of_week: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
                }],
            },
            execution_strategy: strategy,
            behavior: Default::default(),
            suspend: false,
            targets,
        },
    )
}

/// A freshly-admitted Plan whose schedule marks a target tier for
/// hibernation gets fed into stage planning the same way a reconciler
/// would, in dependency order.
#[test]
fn admitted_dag_plan_compiles_into_dependency_ordered_stages() {
    let targets = vec![target("web"), target("app"), target("db")];
    let strategy = ExecutionStrategy::Dag {
        dependencies: vec![
            DagEdge {
                from: "web".to_string(),
                to: "app".to_string(),
            },
            DagEdge {
                from: "app".to_string(),
                to: "db".to_string(),
            },
        ],
        max_concurrency: None,
    };
    let plan = nightly_plan(strategy.clone(), targets.clone());
    assert!(validate_plan(None, &plan).is_ok());

    let now = Utc.with_ymd_and_hms(2026, 1, 5, 23, 0, 0).unwrap(); // a Monday night
    let decision = schedule::evaluate(&plan.spec.schedule, &[], None, now).unwrap();
    assert_eq!(decision.state, ScheduleState::ShouldHibernate);

    let shutdown_stages = planner::compile(&strategy, &targets, Operation::Shutdown).unwrap();
    let shutdown_order: Vec<&str> = shutdown_stages
        .iter()
        .flat_map(|s| s.targets.iter())
        .map(|s| s.as_str())
        .collect();
    assert_eq!(shutdown_order, vec!["web", "app", "db"]);

    let wakeup_stages = planner::compile(&strategy, &targets, Operation::Wakeup).unwrap();
    let wakeup_order: Vec<&str> = wakeup_stages
        .iter()
        .flat_map(|s| s.targets.iter())
        .map(|s| s.as_str())
        .collect();
    assert_eq!(wakeup_order, vec!["db", "app", "web"]);
}

/// A cyclic dependency is rejected at admission time, before it could ever
/// reach stage planning (which would also reject it, defensively).
#[test]
fn cyclic_dag_is_rejected_before_it_ever_reaches_planning() {
    let targets = vec![target("a"), target("b")];
    let strategy = ExecutionStrategy::Dag {
        dependencies: vec![
            DagEdge {
                from: "a".to_string(),
                to: "b".to_string(),
            },
            DagEdge {
                from: "b".to_string(),
                to: "a".to_string(),
            },
        ],
        max_concurrency: None,
    };
    let plan = nightly_plan(strategy.clone(), targets.clone());
    assert!(validate_plan(None, &plan).is_err());
    assert!(planner::compile(&strategy, &targets, Operation::Shutdown).is_err());
}

/// An Extend exception admitted against a plan keeps resources active
/// straight through what would otherwise be a hibernation window.
#[test]
fn admitted_extend_exception_keeps_a_hibernating_window_active() {
    let plan = nightly_plan(ExecutionStrategy::Sequential, vec![target("a")]);

    let now = Utc.with_ymd_and_hms(2026, 1, 5, 23, 0, 0).unwrap();
    let valid_from = Time(now - chrono::Duration::hours(1));
    let valid_until = Time(now + chrono::Duration::hours(1));

    let mut exception = Exception::new(
        "deploy-freeze",
        ExceptionSpec {
            plan_ref: "nightly".to_string(),
            exception_type: ExceptionType::Extend,
            valid_from,
            valid_until,
            lead_time_seconds: None,
            windows: vec![],
        },
    );
    exception.metadata.namespace = Some("default".to_string());

    assert!(validate_exception(Some(&plan), &exception, &[]).is_ok());

    let input = ExceptionInput {
        exception_type: exception.spec.exception_type,
        state: ExceptionPhase::Active,
        valid_from: now - chrono::Duration::hours(1),
        valid_until: now + chrono::Duration::hours(1),
        lead_time: None,
        windows: vec![],
    };
    let decision = schedule::evaluate(&plan.spec.schedule, &[input], None, now).unwrap();
    assert_eq!(decision.state, ScheduleState::Active);
}

/// Two exceptions against the same plan with overlapping windows are
/// rejected at admission regardless of which one was submitted first.
#[test]
fn overlapping_exceptions_on_the_same_plan_are_rejected() {
    let plan = nightly_plan(ExecutionStrategy::Sequential, vec![target("a")]);
    let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();

    let mut existing = Exception::new(
        "first",
        ExceptionSpec {
            plan_ref: "nightly".to_string(),
            exception_type: ExceptionType::Extend,
            valid_from: Time(now),
            valid_until: Time(now + chrono::Duration::days(2)),
            lead_time_seconds: None,
            windows: vec![],
        },
    );
    existing.status = Some(hibernator_types::ExceptionStatus {
        state: ExceptionPhase::Active,
        ..Default::default()
    });

    let incoming = Exception::new(
        "second",
        ExceptionSpec {
            plan_ref: "nightly".to_string(),
            exception_type: ExceptionType::Extend,
            valid_from: Time(now + chrono::Duration::days(1)),
            valid_until: Time(now + chrono::Duration::days(3)),
            lead_time_seconds: None,
            windows: vec![],
        },
    );

    let err = validate_exception(Some(&plan), &incoming, std::slice::from_ref(&existing))
        .expect_err("overlapping exceptions must be rejected");
    assert!(err.contains("overlaps"));
}

/// A plan referencing a target that its own Staged strategy never assigns
/// to a stage is rejected, even though each individual stage is internally
/// well-formed.
#[test]
fn staged_strategy_missing_a_target_assignment_is_rejected() {
    let targets = vec![target("a"), target("b")];
    let strategy = ExecutionStrategy::Staged {
        stages: vec![hibernator_types::StageSpec {
            name: "only-stage".to_string(),
            parallel: Some(true),
            max_concurrency: None,
            targets: vec!["a".to_string()],
        }],
        max_concurrency: None,
    };
    let plan = nightly_plan(strategy, targets);
    let err = validate_plan(None, &plan).expect_err("uncovered target must be rejected");
    assert!(err.contains("exactly one stage"));
}

/// Editing a Plan's targets while it's mid-hibernation cycle (not one of
/// the editable phases) is rejected at admission.
#[test]
fn target_edits_mid_cycle_are_rejected() {
    let mut existing = nightly_plan(ExecutionStrategy::Sequential, vec![target("a")]);
    existing.status = Some(PlanStatus {
        phase: PlanPhase::Hibernating,
        ..Default::default()
    });
    let incoming = nightly_plan(ExecutionStrategy::Sequential, vec![target("a"), target("b")]);
    assert!(validate_plan(Some(&existing), &incoming).is_err());
}
