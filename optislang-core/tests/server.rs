mod common;

use std::time::{Duration, Instant};

use common::{square, MockProxy, MockServer, MockState};
use optislang_core::{Error, ExecutionOption, Poll, ProxySolverNode};
use optislang_net::msg::{DesignResult, NamedValue, ProjectState};

fn server_in_state(state: &str) -> MockServer {
    MockServer::start(MockState {
        project_state: state.to_string(),
        ..MockState::default()
    })
}

#[test]
fn queries() {
    let server = MockServer::with_systems(&["a", "b"], None);
    let osl = server.connect();
    osl.ping().unwrap();
    assert_eq!(osl.server_info().unwrap()["application"], "mock");
    assert_eq!(osl.get_status().unwrap(), ProjectState::Idle);
    let tree = osl.full_project_tree().unwrap();
    assert_eq!(tree.root_nodes().len(), 2);
    assert!(!osl.is_local());
    assert_eq!(osl.server_pid(), None);
}

#[test]
fn start_is_skipped_while_processing() {
    let server = server_in_state("PROCESSING");
    let osl = server.connect();
    osl.start(false).unwrap();
    assert_eq!(server.state().count("START"), 0);

    server.state().project_state = "IDLE".to_string();
    osl.start(true).unwrap();
    assert_eq!(server.state().count("START"), 1);
    assert_eq!(osl.get_status().unwrap(), ProjectState::Finished);
}

#[test]
fn start_waits_for_the_run_to_be_reported() {
    let server = server_in_state("FINISHED");
    server.state().start_lag = 3;
    let osl = server.connect();
    osl.start(true).unwrap();

    let state = server.state();
    assert_eq!(state.count("START"), 1);
    // previous state three times, then processing, then finished
    assert!(state.reported.is_empty());
    assert_eq!(state.count("BASIC_PROJECT_INFO"), 6);
}

#[test]
fn start_times_out_when_no_run_is_reported() {
    let server = server_in_state("FINISHED");
    server.state().start_lag = 1000;
    let mut osl = server.connect();
    osl.set_start_timeout(Duration::from_millis(100));
    match osl.start(false) {
        Err(Error::Net(optislang_net::Error::TimedOut(_))) => (),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn stop_respects_pending_requests() {
    // nothing to stop
    let server = server_in_state("FINISHED");
    let osl = server.connect();
    osl.stop(false).unwrap();
    osl.stop_gently(false).unwrap();
    let state = server.state();
    assert_eq!(state.count("STOP") + state.count("STOP_GENTLY"), 0);
    drop(state);

    // a stop request of higher priority is pending
    let server = server_in_state("STOP_REQUESTED");
    let osl = server.connect();
    osl.stop_gently(false).unwrap();
    osl.stop(false).unwrap();
    assert_eq!(server.state().count("STOP_GENTLY"), 0);
    assert_eq!(server.state().count("STOP"), 0);

    // a gentle stop gets overridden by a regular one
    let server = server_in_state("GENTLE_STOP_REQUESTED");
    let osl = server.connect();
    osl.stop(true).unwrap();
    assert_eq!(server.state().count("STOP"), 1);
    assert_eq!(osl.get_status().unwrap(), ProjectState::Stopped);
}

#[test]
fn waiting_for_finished_times_out() {
    let server = server_in_state("PROCESSING");
    let osl = server.connect();
    let start = Instant::now();
    match osl.wait_for_finished(Some(Duration::from_millis(100))) {
        Err(Error::Net(optislang_net::Error::TimedOut(_))) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn execution_options_are_sent() {
    let server = MockServer::with_systems(&["a"], None);
    let osl = server.connect();
    osl.set_execution_options("a", ExecutionOption::ACTIVE | ExecutionOption::END_POINT)
        .unwrap();
    assert_eq!(server.state().option("a"), 5);
}

#[test]
fn disposed_instance_fails() {
    let server = server_in_state("IDLE");
    let osl = server.connect();
    osl.dispose().unwrap();
    osl.dispose().unwrap();
    assert!(osl.is_disposed());
    match osl.ping() {
        Err(Error::Disposed) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(server.state().count("SERVER_IS_ALIVE"), 0);
}

#[test]
fn shutdown_of_remote_server() {
    let server = server_in_state("IDLE");
    let osl = server.connect();
    osl.shutdown(false).unwrap();
    assert_eq!(server.state().count("SHUTDOWN"), 1);
}

#[test]
fn shutdown_of_unreachable_remote_server_fails() {
    let server = server_in_state("IDLE");
    let osl = server.connect();
    drop(server);
    assert!(osl.shutdown(true).is_err());
}

fn proxy_server(total: usize) -> MockServer {
    let server = MockServer::with_systems(
        &["system"],
        Some(MockProxy {
            system_uid: "system".to_string(),
            solver_uid: "solver".to_string(),
            total,
            batch: 4,
        }),
    );
    let osl = server.connect();
    osl.set_execution_options("system", ExecutionOption::from_bits(7))
        .unwrap();
    osl.start(false).unwrap();
    server
}

#[test]
fn duplicate_submission_is_not_sent() {
    let server = proxy_server(8);
    let osl = server.connect();
    let node = ProxySolverNode::new("solver");
    let mut consumer = node.try_consume().unwrap();

    let designs = match consumer.poll(&osl).unwrap() {
        Poll::Designs(designs) => designs,
        other => panic!("unexpected poll: {:?}", other),
    };
    assert_eq!(designs.len(), 4);
    let results = square(&designs);
    consumer.submit(&osl, results.clone()).unwrap();
    assert_eq!(consumer.state().submitted_count(), 4);

    match consumer.submit(&osl, results[..1].to_vec()) {
        Err(Error::AlreadySubmitted { uid, hid }) => {
            assert_eq!(uid, "solver");
            assert_eq!(hid, designs[0].hid);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // duplicates within one batch are caught too
    let next = consumer.pending_designs(&osl).unwrap();
    let twice = vec![
        DesignResult::new(&next[0].hid, vec![NamedValue::new("y", 0.)]),
        DesignResult::new(&next[0].hid, vec![NamedValue::new("y", 1.)]),
    ];
    assert!(consumer.submit(&osl, twice).is_err());

    assert_eq!(server.state().count("SET_DESIGNS"), 1);
    assert!(server.state().unexpected.is_empty());
}

#[test]
fn consumer_services_until_finished() {
    let server = proxy_server(10);
    let osl = server.connect();
    let node = ProxySolverNode::new("solver");
    let status = node
        .try_consume()
        .unwrap()
        .run_until_terminal(&osl, Duration::from_millis(5), square)
        .unwrap();
    assert_eq!(status, ProjectState::Finished);
    assert_eq!(node.submitted_count(), 10);
    match node.try_consume().unwrap().poll(&osl).unwrap() {
        Poll::Finished(state) => assert!(state.is_terminal()),
        other => panic!("unexpected poll: {:?}", other),
    }
    assert_eq!(server.state().evaluated.len(), 10);
}
