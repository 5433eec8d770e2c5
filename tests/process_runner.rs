#![cfg(unix)]

use std::time::{Duration, Instant};

use iop_installer::process::{ManagedProcess, ProcessOutcome, ProcessState};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn captures_output_and_exit_code() {
    let mut process = ManagedProcess::new("echo", "hello");
    assert!(process.run_and_wait_for_success_exit(WAIT).await);

    assert_eq!(process.output(), ["hello".to_string()]);
    assert_eq!(process.exit_code(), Some(0));
    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(process.outcome(), ProcessOutcome::Exited(0));
}

#[tokio::test]
async fn keeps_line_order() {
    let mut process = ManagedProcess::new("sh", "-c \"for i in $(seq 1 500); do echo $i; done\"");
    assert!(process.run_and_wait_for_success_exit(WAIT).await);

    let expected: Vec<String> = (1..=500).map(|i| i.to_string()).collect();
    assert_eq!(process.output(), expected.as_slice());
}

#[tokio::test]
async fn merges_stdout_and_stderr() {
    let mut process = ManagedProcess::new("sh", "-c \"echo out; echo err 1>&2\"");
    assert!(process.run_and_wait_for_success_exit(WAIT).await);

    let mut lines = process.output().to_vec();
    lines.sort();
    assert_eq!(lines, ["err".to_string(), "out".to_string()]);
}

#[tokio::test]
async fn feeds_input_and_closes_stdin() {
    let mut process = ManagedProcess::new("cat", "").with_input_lines(["first", "second"]);
    assert!(process.run_and_wait_for_success_exit(WAIT).await);

    assert_eq!(process.output(), ["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn input_to_exited_process_is_not_a_launch_failure() {
    let input = vec![b'x'; 1024 * 1024];
    let mut process = ManagedProcess::new("true", "").with_input(input);

    assert!(process.start().await);
    assert!(process.wait_for_exit(WAIT).await);
    assert_eq!(process.exit_code(), Some(0));
}

#[tokio::test]
async fn input_not_read_by_process_does_not_block_start() {
    let input = vec![b'x'; 1024 * 1024];
    let mut process = ManagedProcess::new("sleep", "30").with_input(input);

    let started = Instant::now();
    let launched = tokio::time::timeout(Duration::from_secs(5), process.start())
        .await
        .expect("start returns while the input is still pending");
    assert!(launched);

    assert!(!process.wait_for_exit(Duration::from_millis(100)).await);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(process.outcome(), ProcessOutcome::TimedOut);
    assert_eq!(process.state(), ProcessState::Finished);
}

#[tokio::test]
async fn non_zero_exit_is_not_success() {
    let mut process = ManagedProcess::new("sh", "-c \"echo failing; exit 3\"");
    assert!(process.start().await);
    assert!(!process.wait_for_success_exit(WAIT).await);

    assert_eq!(process.exit_code(), Some(3));
    assert_eq!(process.output(), ["failing".to_string()]);
    assert_eq!(process.state(), ProcessState::Finished);
}

#[tokio::test]
async fn timeout_kills_and_reaps_process() {
    let mut process = ManagedProcess::new("sleep", "30");
    assert!(process.start().await);
    let pid = process.pid().expect("running process has a pid");

    let started = Instant::now();
    assert!(!process.wait_for_exit(Duration::from_millis(100)).await);
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(process.exit_code(), None);
    assert_eq!(process.outcome(), ProcessOutcome::TimedOut);
    assert_eq!(process.state(), ProcessState::Finished);

    #[cfg(target_os = "linux")]
    assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    let _ = pid;
}

#[tokio::test]
async fn process_can_not_be_started_twice() {
    let mut process = ManagedProcess::new("true", "");
    assert!(process.run_and_wait_for_success_exit(WAIT).await);
    assert!(!process.start().await);
}
