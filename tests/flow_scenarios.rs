// tests/flow_scenarios.rs

use flowrun::core::{
    args::EnvOp,
    auto_map::auto_map_all,
    cmd::{CmdKind, CmdTree},
    env::{Env, EnvLayerKind},
    env_ops_checker::{EnvOpsFinding, check_env_ops},
    executor::{AutoContinue, ExecError, Executor, FlowState},
    flow::ParsedCmds,
    parser::{FlowParser, SimpleFlowParser, lines_to_tokens},
};
use flowrun::system::{bg_tasks::BgTaskScheduler, status_trace::ExecutedResult};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// --- Helpers ---

/// `write-x` stores `x` in the session, `read-x` needs it.
fn x_commands() -> CmdTree {
    let mut tree = CmdTree::new();
    tree.register(
        "write-x",
        CmdKind::normal(|_, ctx| {
            ctx.env.get_layer(EnvLayerKind::Session)?.set("x", "42");
            Ok(true)
        }),
        "Writes x.",
    )
    .unwrap()
    .add_env_op("x", EnvOp::WRITE);
    tree.register(
        "read-x",
        CmdKind::normal(|_, ctx| Ok(ctx.env.get_raw("x") == "42")),
        "Reads x.",
    )
    .unwrap()
    .add_env_op("x", EnvOp::READ);
    tree
}

fn parse(tree: &CmdTree, text: &str) -> ParsedCmds {
    let tokens = lines_to_tokens(&[text.to_string()]).unwrap();
    SimpleFlowParser.parse(tree, &tokens).unwrap()
}

fn executor(tree: CmdTree) -> Executor {
    Executor::new(Arc::new(tree), Arc::new(SimpleFlowParser), Arc::new(BgTaskScheduler::new()))
        .with_prompt(Arc::new(AutoContinue))
        .with_output(Box::new(io::sink()))
}

// --- Scenarios ---

#[test]
fn test_write_then_read_runs_clean() {
    // --- Setup ---
    let tree = x_commands();
    let flow = parse(&tree, "write-x : read-x");
    let env = Env::new_session_chain();

    // --- Execute ---
    let findings = check_env_ops(&tree, &SimpleFlowParser, &flow, &env, false);
    let mut exec = executor(tree);
    exec.run(&env, flow).unwrap();

    // --- Assert ---
    assert!(findings.is_empty(), "unexpected findings: {:?}", findings);
    assert_eq!(exec.state(), FlowState::Succeeded);
    assert_eq!(exec.records().len(), 2);
    assert_eq!(env.get_raw("x"), "42");
}

#[test]
fn test_read_of_unwritten_key_is_refused() {
    // --- Setup ---
    let tree = x_commands();
    let flow = parse(&tree, "read-x");
    let env = Env::new_session_chain();

    // --- Execute ---
    let findings = check_env_ops(&tree, &SimpleFlowParser, &flow, &env, false);
    let mut exec = executor(tree);
    let err = exec.run(&env, flow).unwrap_err();

    // --- Assert ---
    assert_eq!(findings.len(), 1);
    let finding = findings.first().unwrap();
    assert_eq!(finding.key, "x");
    assert_eq!(finding.cmd, "read-x");
    assert_eq!(finding.finding, EnvOpsFinding::ReadNotExist);
    assert!(matches!(err, ExecError::EnvOpsFatal(ref f) if f.len() == 1));
    assert!(exec.records().is_empty(), "nothing may run after a fatal finding");
}

#[test]
fn test_key_in_ambient_env_satisfies_the_read() {
    let tree = x_commands();
    let flow = parse(&tree, "read-x");
    let env = Env::new_session_chain();
    env.get_layer(EnvLayerKind::Persisted).unwrap().set("x", "42");

    let findings = check_env_ops(&tree, &SimpleFlowParser, &flow, &env, false);

    assert!(findings.is_empty());
}

#[test]
fn test_checker_recurses_into_sub_flows() {
    // --- Setup ---
    let mut tree = x_commands();
    tree.register(
        "wrapped",
        CmdKind::Flow {
            lines: vec!["write-x".to_string(), "read-x".to_string()],
        },
        "Writes then reads x.",
    )
    .unwrap();
    let flow = parse(&tree, "wrapped");
    let env = Env::new_session_chain();

    // --- Execute ---
    let findings = check_env_ops(&tree, &SimpleFlowParser, &flow, &env, false);
    let mut exec = executor(tree);
    exec.run(&env, flow).unwrap();

    // --- Assert ---
    assert!(findings.is_empty(), "unexpected findings: {:?}", findings);
    assert_eq!(exec.state(), FlowState::Succeeded);
    // Two sub-flow commands, then the wrapper itself.
    let depths: Vec<usize> = exec.records().iter().map(|r| r.depth).collect();
    assert_eq!(depths, vec![1, 1, 0]);
}

#[test]
fn test_delayed_command_returns_at_once_and_finishes_later() {
    // --- Setup ---
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in_handler = Arc::clone(&ran);
    let mut tree = CmdTree::new();
    tree.register(
        "tick",
        CmdKind::normal(move |_, _| {
            ran_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }),
        "",
    )
    .unwrap();
    let flow = parse(&tree, "tick %delay=2s");
    let mut exec = executor(tree);
    let env = Env::new_session_chain();

    // --- Execute ---
    let started = Instant::now();
    exec.run(&env, flow).unwrap();
    let scheduled_after = started.elapsed();
    let task_id = exec.records().first().unwrap().scheduled_task.clone().unwrap();
    exec.bg().wait_for_finish(&task_id).unwrap();
    let finished_after = started.elapsed();

    // --- Assert ---
    assert!(scheduled_after < Duration::from_secs(1), "run blocked for {:?}", scheduled_after);
    assert!(finished_after >= Duration::from_millis(1900), "finished after {:?}", finished_after);
    assert!(finished_after < Duration::from_secs(5));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(exec.records().first().unwrap().result, ExecutedResult::Scheduled);
}

#[test]
fn test_failure_stops_the_flow_at_its_index() {
    // --- Setup ---
    let third_ran = Arc::new(AtomicUsize::new(0));
    let third_in_handler = Arc::clone(&third_ran);
    let mut tree = CmdTree::new();
    tree.register("first", CmdKind::normal(|_, _| Ok(true)), "").unwrap();
    tree.register("second", CmdKind::normal(|_, _| Ok(false)), "").unwrap();
    tree.register(
        "third",
        CmdKind::normal(move |_, _| {
            third_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }),
        "",
    )
    .unwrap();
    let flow = parse(&tree, "first : second : third");
    let mut exec = executor(tree);

    // --- Execute ---
    let err = exec.run(&Env::new_session_chain(), flow).unwrap_err();

    // --- Assert ---
    assert!(matches!(err, ExecError::CmdFailed { index: 1, ref cmd, .. } if cmd == "second"));
    assert_eq!(exec.state(), FlowState::Failed(1));
    assert_eq!(third_ran.load(Ordering::SeqCst), 0);
    let results: Vec<ExecutedResult> = exec.records().iter().map(|r| r.result).collect();
    assert_eq!(results, vec![ExecutedResult::Succeeded, ExecutedResult::Failed]);
}

#[test]
fn test_auto_mapped_arg_reaches_the_inner_command() {
    // --- Setup ---
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_handler = Arc::clone(&seen);
    let mut tree = CmdTree::new();
    tree.register(
        "db.start",
        CmdKind::normal(move |argv, _| {
            *seen_in_handler.lock().unwrap() = argv.get_raw("port").to_string();
            Ok(true)
        }),
        "",
    )
    .unwrap()
    .add_arg("port", "5432", &["p"])
    .unwrap()
    .add_arg2env("db.port", "port")
    .unwrap();
    tree.register(
        "restart",
        CmdKind::Flow {
            lines: vec!["db.start".to_string()],
        },
        "",
    )
    .unwrap()
    .auto_map
    .request(&["*".to_string()]);
    let env = Env::new_session_chain();

    // --- Execute ---
    let added = auto_map_all(&mut tree, &SimpleFlowParser, &env).unwrap();
    let flow = parse(&tree, "restart port=6000");
    let mut exec = executor(tree);
    exec.run(&env, flow).unwrap();

    // --- Assert ---
    assert_eq!(added, 1);
    assert_eq!(*seen.lock().unwrap(), "6000");
}
